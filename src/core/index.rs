use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use walkdir::WalkDir;

use crate::config::Config;
use crate::core::duplicate::{Classification, ImageComparer};
use crate::core::metadata::{MetadataProvider, NoMetadata};
use crate::core::models::{FileUid, ImageFingerprint, UniqueFileEntry};
use crate::core::resolver::{ConflictResolver, OrderResolver};
use crate::core::store::{
    IndexDocument, IndexRecord, IndexWriter, NoopWriter, StoreError, WriterFactory, read_document,
};
use crate::core::title::normalize_title;

/// Notified every time a duplicate is detected
pub trait DuplicateObserver: Send + Sync {
    fn on_duplicate_found(&self, canonical: &FileUid, duplicate: &FileUid);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl DuplicateObserver for NoopObserver {
    fn on_duplicate_found(&self, _canonical: &FileUid, _duplicate: &FileUid) {}
}

/// A canonical entry of the current run and what it has absorbed
#[derive(Debug)]
struct PendingSlot {
    canonical: UniqueFileEntry,
    duplicates: Vec<UniqueFileEntry>,
}

/// Content-hash keyed store of unique books.
///
/// Entries loaded from earlier runs live in `persisted`; one is dropped only
/// when the same file is indexed again. This run's canonical entries live in `pending` until
/// [`DedupIndex::save`] moves them over. Duplicates of persisted entries, and
/// persisted entries beaten by a newcomer, are collected in `rejected`.
pub struct DedupIndex {
    comparer: ImageComparer,
    resolver: Box<dyn ConflictResolver>,
    observer: Box<dyn DuplicateObserver>,
    metadata: Arc<dyn MetadataProvider>,
    filler_tokens: Vec<String>,

    persisted: HashMap<String, Vec<UniqueFileEntry>>,
    pending: Vec<PendingSlot>,
    buckets: HashMap<String, Vec<usize>>,
    rejected: Vec<(UniqueFileEntry, FileUid)>,
}

impl DedupIndex {
    pub fn new(comparer: ImageComparer) -> Self {
        Self {
            comparer,
            resolver: Box::new(OrderResolver),
            observer: Box::new(NoopObserver),
            metadata: Arc::new(NoMetadata),
            filler_tokens: Vec::new(),
            persisted: HashMap::new(),
            pending: Vec::new(),
            buckets: HashMap::new(),
            rejected: Vec::new(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(ImageComparer::new(config.hamming_threshold))
            .with_filler_tokens(config.filler_tokens.clone())
    }

    pub fn with_resolver(mut self, resolver: Box<dyn ConflictResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_observer(mut self, observer: Box<dyn DuplicateObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_metadata(mut self, metadata: Arc<dyn MetadataProvider>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_filler_tokens(mut self, tokens: Vec<String>) -> Self {
        self.filler_tokens = tokens;
        self
    }

    /// Place a freshly fingerprinted book.
    ///
    /// Returns the entry when the candidate became canonical for this run,
    /// `None` when it was recorded as a duplicate.
    pub fn add(&mut self, content_hash: &str, mut candidate: UniqueFileEntry) -> Option<&UniqueFileEntry> {
        candidate.content_hash = content_hash.to_string();
        self.strip_filler(&mut candidate);

        // A rerun of an indexed file replaces its own persisted record
        if let Some(bucket) = self.persisted.get_mut(content_hash) {
            let before = bucket.len();
            bucket.retain(|existing| existing.uid != candidate.uid);
            if bucket.len() < before {
                log::debug!("{} is already indexed, re-indexing", candidate.uid);
            }
        }

        // Persisted entries the candidate beats; only kept if the candidate survives
        let mut superseded = Vec::new();

        if let Some(bucket) = self.persisted.get(content_hash) {
            for existing in bucket {
                let candidate_wins = match self.comparer.compare(existing, &candidate) {
                    Classification::Varied => continue,
                    Classification::Inner => true,
                    Classification::Equal => self.resolver.resolve(&candidate, existing),
                    Classification::Outer => false,
                };

                if candidate_wins {
                    superseded.push(existing.clone());
                    continue;
                }

                log::debug!("{} duplicates persisted {}", candidate.uid, existing.uid);
                self.observer.on_duplicate_found(&existing.uid, &candidate.uid);
                candidate.clear_images();
                self.rejected.push((candidate, existing.uid.clone()));
                return None;
            }
        }

        let slots = self.buckets.get(content_hash).cloned().unwrap_or_default();
        for index in slots {
            let slot = &mut self.pending[index];
            let candidate_wins = match self.comparer.compare(&slot.canonical, &candidate) {
                Classification::Varied => continue,
                Classification::Inner => true,
                Classification::Equal => self.resolver.resolve(&candidate, &slot.canonical),
                Classification::Outer => false,
            };

            if !candidate_wins {
                log::debug!("{} duplicates {}", candidate.uid, slot.canonical.uid);
                self.observer.on_duplicate_found(&slot.canonical.uid, &candidate.uid);
                candidate.clear_images();
                slot.duplicates.push(candidate);
                return None;
            }

            let mut demoted = std::mem::replace(&mut slot.canonical, candidate);
            log::debug!("{} replaces {}", slot.canonical.uid, demoted.uid);
            self.observer.on_duplicate_found(&slot.canonical.uid, &demoted.uid);
            demoted.clear_images();
            let loser = demoted.uid.clone();
            slot.duplicates.push(demoted);

            let winner = slot.canonical.uid.clone();
            for (_, origin) in self.rejected.iter_mut().filter(|(_, origin)| *origin == loser) {
                *origin = winner.clone();
            }
            self.record_superseded(superseded, &winner);
            return Some(&self.pending[index].canonical);
        }

        self.record_superseded(superseded, &candidate.uid);
        let index = self.pending.len();
        self.pending.push(PendingSlot {
            canonical: candidate,
            duplicates: Vec::new(),
        });
        self.buckets.entry(content_hash.to_string()).or_default().push(index);
        Some(&self.pending[index].canonical)
    }

    fn record_superseded(&mut self, superseded: Vec<UniqueFileEntry>, winner: &FileUid) {
        for mut entry in superseded {
            log::warn!("Persisted {} is superseded by {}", entry.uid, winner);
            self.observer.on_duplicate_found(winner, &entry.uid);
            entry.clear_images();
            entry.sections = None;
            self.rejected.retain(|(previous, _)| previous.uid != entry.uid);
            self.rejected.push((entry, winner.clone()));
        }
    }

    fn strip_filler(&self, entry: &mut UniqueFileEntry) {
        if !self.filler_tokens.is_empty() {
            entry.title_tokens.retain(|token| !self.filler_tokens.contains(token));
        }
    }

    /// Write this run's results and move canonical entries into the persisted set.
    ///
    /// A batch whose output cannot be opened is logged and written to a
    /// [`NoopWriter`], so the in-memory state stays consistent either way.
    pub fn save(&mut self, batch_id: &str, writers: &dyn WriterFactory) -> Result<usize, StoreError> {
        if self.pending.is_empty() && self.rejected.is_empty() {
            return Ok(0);
        }

        let mut records = Vec::new();
        for slot in self.pending.drain(..) {
            let mut canonical = slot.canonical;
            canonical.clear_images();
            records.push(IndexRecord::canonical(&canonical));
            for duplicate in &slot.duplicates {
                records.push(IndexRecord::duplicate(duplicate, &canonical.uid));
            }
            canonical.sections = None;
            self.persisted
                .entry(canonical.content_hash.clone())
                .or_default()
                .push(canonical);
        }
        self.buckets.clear();

        for (duplicate, origin) in self.rejected.drain(..) {
            records.push(IndexRecord::duplicate(&duplicate, &origin));
        }

        let mut writer: Box<dyn IndexWriter> = match writers.open(batch_id) {
            Ok(writer) => writer,
            Err(e) => {
                log::error!("Cannot open output for batch {}: {}", batch_id, e);
                Box::new(NoopWriter)
            }
        };
        for record in &records {
            writer.write(record)?;
        }
        writer.finish()?;

        log::info!("Batch {}: {} records written", batch_id, records.len());
        Ok(records.len())
    }

    /// Load the canonical records of every `*.xml` index document in `dir`
    pub fn load_dir(&mut self, dir: &Path) -> Result<usize, StoreError> {
        let mut paths: Vec<_> = WalkDir::new(dir)
            .max_depth(1)
            .into_iter()
            .filter_map(Result::ok)
            .map(|entry| entry.into_path())
            .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "xml"))
            .collect();
        paths.sort();

        let mut loaded = 0;
        for path in paths {
            let document = read_document(&path)?;
            log::debug!("Loading {} records from {}", document.records.len(), path.display());
            loaded += self.load_document(document);
        }

        log::info!("Loaded {} persisted books from {}", loaded, dir.display());
        Ok(loaded)
    }

    pub fn load_document(&mut self, document: IndexDocument) -> usize {
        let mut loaded = 0;
        for record in document.records.into_iter().filter(|r| !r.is_duplicate()) {
            let mut entry = record.into_entry();
            if let Some(title) = self.metadata.title(&entry.uid) {
                entry.title_tokens = normalize_title(&title);
            }
            self.strip_filler(&mut entry);
            entry.sections = None;
            self.persisted
                .entry(entry.content_hash.clone())
                .or_default()
                .push(entry);
            loaded += 1;
        }
        loaded
    }

    /// Canonical entries of this run that still hold image bytes
    pub fn pending_images(&self) -> Vec<(String, FileUid)> {
        self.pending
            .iter()
            .map(|slot| &slot.canonical)
            .filter(|entry| {
                !entry.cover.body.is_empty() || entry.images.iter().any(|image| !image.body.is_empty())
            })
            .map(|entry| (entry.content_hash.clone(), entry.uid.clone()))
            .collect()
    }

    pub fn get_images(&self, content_hash: &str, file: &str) -> Option<(ImageFingerprint, Vec<ImageFingerprint>)> {
        self.find_pending(content_hash, file)
            .map(|index| {
                let entry = &self.pending[index].canonical;
                (entry.cover.clone(), entry.images.clone())
            })
    }

    /// Attach images computed after the entry was placed. False if no
    /// pending canonical entry matches.
    pub fn set_images(
        &mut self,
        content_hash: &str,
        file: &str,
        cover: ImageFingerprint,
        images: Vec<ImageFingerprint>,
    ) -> bool {
        match self.find_pending(content_hash, file) {
            Some(index) => {
                self.pending[index].canonical.set_images(cover, images);
                true
            }
            None => false,
        }
    }

    fn find_pending(&self, content_hash: &str, file: &str) -> Option<usize> {
        self.buckets
            .get(content_hash)?
            .iter()
            .copied()
            .find(|&index| self.pending[index].canonical.uid.file == file)
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.rejected.is_empty()
    }

    pub fn persisted(&self, content_hash: &str) -> &[UniqueFileEntry] {
        self.persisted.get(content_hash).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn persisted_len(&self) -> usize {
        self.persisted.values().map(Vec::len).sum()
    }

    pub fn pending_canonicals(&self) -> impl Iterator<Item = &UniqueFileEntry> {
        self.pending.iter().map(|slot| &slot.canonical)
    }

    pub fn duplicates_of(&self, uid: &FileUid) -> Option<&[UniqueFileEntry]> {
        self.pending
            .iter()
            .find(|slot| &slot.canonical.uid == uid)
            .map(|slot| slot.duplicates.as_slice())
    }

    /// (duplicate, origin) pairs involving persisted entries
    pub fn rejected(&self) -> &[(UniqueFileEntry, FileUid)] {
        &self.rejected
    }
}

impl Default for DedupIndex {
    fn default() -> Self {
        Self::new(ImageComparer::default())
    }
}
