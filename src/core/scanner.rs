use crossbeam_channel::{Receiver, SendError};
use rayon::prelude::*;
use serde::Serialize;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::config::Config;
use crate::core::archive::{ArchiveError, ArchiveSource, FilePayload};
use crate::core::index::DedupIndex;
use crate::core::metadata::{MetadataProvider, NoMetadata};
use crate::core::models::{ContentFingerprint, FileUid, ImageFingerprint, UniqueFileEntry, normalize_images};
use crate::core::perceptual::PerceptualHasher;
use crate::core::text::TextFingerprinter;
use crate::core::title::normalize_title;
use crate::progress::{NoProgress, ProgressSink};

/// A file that could not be fingerprinted, with the reason
#[derive(Debug, Clone, Serialize)]
pub struct FailedFile {
    pub uid: FileUid,
    pub reason: String,
}

/// Everything computed for one file by a worker
#[derive(Debug)]
pub struct FingerprintBundle {
    pub uid: FileUid,
    pub text: Result<ContentFingerprint, String>,
    pub cover: ImageFingerprint,
    /// Sorted by crypto hash
    pub images: Vec<ImageFingerprint>,
}

impl FingerprintBundle {
    fn failed(failed: FailedFile) -> Self {
        Self {
            uid: failed.uid,
            text: Err(failed.reason),
            cover: ImageFingerprint::default(),
            images: Vec::new(),
        }
    }

    /// Content hash and index entry, or the reason the markup was rejected
    pub fn into_entry(self) -> Result<(String, UniqueFileEntry), FailedFile> {
        let FingerprintBundle {
            uid,
            text,
            cover,
            images,
        } = self;

        match text {
            Ok(text) => {
                let mut entry = UniqueFileEntry::new(uid, text.content_hash.clone());
                entry.title_tokens = text.title_tokens;
                entry.cover = cover;
                entry.images = images;
                entry.sections = Some(text.sections);
                Ok((text.content_hash, entry))
            }
            Err(reason) => Err(FailedFile { uid, reason }),
        }
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct PipelineReport {
    pub processed: usize,
    /// Files that were canonical when added
    pub accepted: usize,
    /// Files recorded as duplicates when added
    pub rejected: usize,
    pub failed: Vec<FailedFile>,
    pub cancelled: bool,
}

/// Fingerprints files on a bounded worker pool and merges the results into
/// a [`DedupIndex`] in file order.
pub struct FingerprintPipeline {
    text: TextFingerprinter,
    hasher: PerceptualHasher,
    max_workers: usize,
    defer_perceptual: bool,
    cancellation_token: Arc<AtomicBool>,
    progress: Arc<dyn ProgressSink>,
    metadata: Arc<dyn MetadataProvider>,
}

impl FingerprintPipeline {
    pub fn new(config: &Config) -> Self {
        Self {
            text: TextFingerprinter::new(config.min_word_length, config.top_words),
            hasher: PerceptualHasher::new(config.edge.clone(), config.min_image_dimension),
            max_workers: config.max_workers,
            defer_perceptual: config.defer_perceptual,
            cancellation_token: Arc::new(AtomicBool::new(false)),
            progress: Arc::new(NoProgress),
            metadata: Arc::new(NoMetadata),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_metadata(mut self, metadata: Arc<dyn MetadataProvider>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn get_cancellation_token(&self) -> Arc<AtomicBool> {
        self.cancellation_token.clone()
    }

    pub fn cancel(&self) {
        self.cancellation_token.store(true, Ordering::Relaxed);
    }

    fn is_cancelled(&self) -> bool {
        self.cancellation_token.load(Ordering::Relaxed)
    }

    pub fn worker_count(&self, files: usize) -> usize {
        self.max_workers.min(num_cpus::get()).min(files).max(1)
    }

    /// Fingerprint every file of `source` and add the results to `index`
    pub fn run(&self, source: &dyn ArchiveSource, index: &mut DedupIndex) -> Result<PipelineReport, ArchiveError> {
        let files = source.files()?;
        log::info!("Fingerprinting {} files from {}", files.len(), source.folder());

        let folder = source.folder().to_string();
        let jobs = files.into_iter().map(|file| {
            source.read(&file).map_err(|e| FailedFile {
                uid: FileUid::new(&folder, &file),
                reason: e.to_string(),
            })
        });

        let bundles = self.fingerprint_all(jobs);
        Ok(self.merge(bundles, index))
    }

    /// Run the worker pool over `jobs`; the result holds one bundle per job,
    /// sorted by file id. Jobs that already failed are passed through.
    pub fn fingerprint_all<I>(&self, jobs: I) -> Vec<FingerprintBundle>
    where
        I: IntoIterator<Item = Result<FilePayload, FailedFile>>,
        I::IntoIter: ExactSizeIterator + Send,
    {
        let jobs = jobs.into_iter();
        let workers = self.worker_count(jobs.len());
        log::debug!("Fingerprinting {} files on {} workers", jobs.len(), workers);

        // Producer blocks once 2x workers payloads are waiting
        let (tx, rx) = crossbeam_channel::bounded::<FilePayload>(workers * 2);

        let mut bundles = std::thread::scope(|s| {
            let producer = s.spawn(move || {
                let mut jobs = jobs;
                let mut failed = Vec::new();
                while !self.is_cancelled() {
                    let Some(job) = jobs.next() else {
                        break;
                    };
                    match job {
                        Ok(payload) => {
                            if let Err(SendError(payload)) = tx.send(payload) {
                                log::error!("No fingerprint worker left for {}", payload.uid);
                                failed.push(FingerprintBundle::failed(FailedFile {
                                    uid: payload.uid,
                                    reason: "no fingerprint worker left".to_string(),
                                }));
                            }
                        }
                        Err(file) => {
                            self.progress.increment(1, &file.uid.to_string());
                            failed.push(FingerprintBundle::failed(file));
                        }
                    }
                }
                if self.is_cancelled() {
                    log::debug!("Cancelled, no more files are queued");
                }
                // tx drops here, workers drain the queue and exit
                failed
            });

            let handles: Vec<_> = (0..workers)
                .map(|id| {
                    let rx = rx.clone();
                    s.spawn(move || self.worker(id, rx))
                })
                .collect();
            drop(rx);

            let mut bundles = producer.join().unwrap_or_else(|_| {
                log::error!("File producer panicked");
                Vec::new()
            });
            for handle in handles {
                match handle.join() {
                    Ok(local) => bundles.extend(local),
                    Err(_) => log::error!("A fingerprint worker panicked, its results are lost"),
                }
            }
            bundles
        });

        bundles.sort_by(|a, b| a.uid.cmp(&b.uid));
        bundles
    }

    fn worker(&self, id: usize, rx: Receiver<FilePayload>) -> Vec<FingerprintBundle> {
        log::trace!("Worker {} started", id);
        let mut local = Vec::new();

        // Runs until the producer hangs up, so a cancel still drains the queue
        for payload in rx.iter() {
            if rx.len() > 1 {
                log::trace!("{} files waiting", rx.len());
            }

            let uid = payload.uid.clone();
            let label = uid.to_string();
            let bundle = panic::catch_unwind(AssertUnwindSafe(|| self.fingerprint_payload(payload)))
                .unwrap_or_else(|_| {
                    log::error!("Fingerprinting {} panicked", uid);
                    FingerprintBundle::failed(FailedFile {
                        uid,
                        reason: "fingerprinting panicked".to_string(),
                    })
                });
            local.push(bundle);
            self.progress.increment(1, &label);
        }

        log::trace!("Worker {} finished after {} files", id, local.len());
        local
    }

    /// Text first, then cover and images. Images are skipped when the markup
    /// is unusable since the file will not be indexed.
    pub fn fingerprint_payload(&self, payload: FilePayload) -> FingerprintBundle {
        let FilePayload {
            uid,
            body,
            mut cover,
            mut images,
        } = payload;

        let text = self
            .text
            .fingerprint(&body)
            .map(|mut text| {
                if let Some(title) = self.metadata.title(&uid) {
                    text.title_tokens = normalize_title(&title);
                    text.title = title;
                }
                text
            })
            .map_err(|e| e.to_string());

        if text.is_ok() {
            for image in std::iter::once(&mut cover).chain(images.iter_mut()) {
                if self.defer_perceptual {
                    self.hasher.fingerprint_exact(image);
                } else {
                    self.hasher.fingerprint(image);
                }
            }
            normalize_images(&mut images);
        }

        FingerprintBundle {
            uid,
            text,
            cover,
            images,
        }
    }

    /// Hand bundles to the index one at a time, in the order given
    pub fn merge(&self, bundles: Vec<FingerprintBundle>, index: &mut DedupIndex) -> PipelineReport {
        let mut report = PipelineReport {
            cancelled: self.is_cancelled(),
            ..Default::default()
        };

        for bundle in bundles {
            report.processed += 1;
            match bundle.into_entry() {
                Ok((content_hash, entry)) => {
                    if index.add(&content_hash, entry).is_some() {
                        report.accepted += 1;
                    } else {
                        report.rejected += 1;
                    }
                }
                Err(failed) => {
                    log::warn!("Cannot fingerprint {}: {}", failed.uid, failed.reason);
                    report.failed.push(failed);
                }
            }
        }

        if self.defer_perceptual {
            self.hash_deferred(index);
        }
        report
    }

    /// Perceptual hashes for this run's canonical entries, computed after the merge
    fn hash_deferred(&self, index: &mut DedupIndex) {
        let pending = index.pending_images();
        if pending.is_empty() {
            return;
        }
        log::info!("Computing perceptual hashes for {} books", pending.len());

        for chunk in pending.chunks(self.max_workers.max(1) * 4) {
            let jobs: Vec<_> = chunk
                .iter()
                .filter_map(|(content_hash, uid)| {
                    index
                        .get_images(content_hash, &uid.file)
                        .map(|(cover, images)| (content_hash, uid, cover, images))
                })
                .collect();

            let hashed: Vec<_> = jobs
                .into_par_iter()
                .map(|(content_hash, uid, mut cover, mut images)| {
                    self.hasher.fingerprint(&mut cover);
                    images.iter_mut().for_each(|image| self.hasher.fingerprint(image));
                    (content_hash, uid, cover, images)
                })
                .collect();

            for (content_hash, uid, cover, images) in hashed {
                index.set_images(content_hash, &uid.file, cover, images);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::archive::DirectoryArchive;
    use image::{DynamicImage, ImageBuffer, ImageFormat, Rgb};
    use std::collections::HashSet;
    use std::fs;
    use std::io::Cursor;
    use std::sync::atomic::AtomicU64;
    use tempfile::tempdir;

    fn fb2(title: &str, text: &str) -> Vec<u8> {
        format!(
            "<FictionBook><description><title-info><book-title>{}</book-title></title-info>\
             </description><body><section><p>{}</p></section></body></FictionBook>",
            title, text
        )
        .into_bytes()
    }

    fn png(seed: u32) -> Vec<u8> {
        let img = DynamicImage::ImageRgb8(ImageBuffer::from_fn(64, 48, |x, y| {
            let v = ((x * seed + y * 7) % 256) as u8;
            Rgb([v, 255 - v, v / 2])
        }));
        let mut bytes = Cursor::new(Vec::new());
        img.write_to(&mut bytes, ImageFormat::Png).unwrap();
        bytes.into_inner()
    }

    fn config(workers: usize) -> Config {
        Config {
            max_workers: workers,
            ..Config::default()
        }
    }

    #[derive(Default)]
    struct CountingProgress {
        count: AtomicU64,
    }

    impl ProgressSink for CountingProgress {
        fn increment(&self, by: u64, _label: &str) {
            self.count.fetch_add(by, Ordering::Relaxed);
        }
    }

    #[test]
    fn test_worker_count_bounds() {
        let pipeline = FingerprintPipeline::new(&config(64));
        assert_eq!(pipeline.worker_count(0), 1);
        assert_eq!(pipeline.worker_count(1), 1);
        assert!(pipeline.worker_count(1000) <= num_cpus::get());

        let single = FingerprintPipeline::new(&config(1));
        assert_eq!(single.worker_count(1000), 1);
    }

    #[test]
    fn test_every_file_reaches_merge_once() {
        for workers in [1, 2, 3, 8] {
            let progress = Arc::new(CountingProgress::default());
            let pipeline = FingerprintPipeline::new(&config(workers)).with_progress(progress.clone());

            let jobs: Vec<Result<FilePayload, FailedFile>> = (0..25)
                .map(|i| {
                    let uid = FileUid::new("lib", format!("{:03}.fb2", i));
                    Ok(FilePayload::new(uid, fb2("Book", &format!("chapter {}", i))))
                })
                .collect();

            let bundles = pipeline.fingerprint_all(jobs);
            assert_eq!(bundles.len(), 25);
            let unique: HashSet<_> = bundles.iter().map(|b| b.uid.clone()).collect();
            assert_eq!(unique.len(), 25);
            assert!(bundles.windows(2).all(|w| w[0].uid < w[1].uid));
            assert_eq!(progress.count.load(Ordering::Relaxed), 25);
        }
    }

    #[test]
    fn test_failed_files_are_reported() {
        let pipeline = FingerprintPipeline::new(&config(2));
        let jobs = vec![
            Ok(FilePayload::new(FileUid::new("lib", "1.fb2"), fb2("One", "words"))),
            Ok(FilePayload::new(FileUid::new("lib", "2.fb2"), b"<FictionBook><body>".to_vec())),
            Err(FailedFile {
                uid: FileUid::new("lib", "3.fb2"),
                reason: "unreadable".into(),
            }),
        ];

        let bundles = pipeline.fingerprint_all(jobs);
        let mut index = DedupIndex::default();
        let report = pipeline.merge(bundles, &mut index);

        assert_eq!(report.processed, 3);
        assert_eq!(report.accepted, 1);
        let failed: Vec<_> = report.failed.iter().map(|f| f.uid.file.as_str()).collect();
        assert_eq!(failed, vec!["2.fb2", "3.fb2"]);
        assert_eq!(index.pending_canonicals().count(), 1);
    }

    #[test]
    fn test_cancelled_pipeline_queues_nothing() {
        let pipeline = FingerprintPipeline::new(&config(2));
        pipeline.get_cancellation_token().store(true, Ordering::Relaxed);
        let jobs = vec![Ok(FilePayload::new(FileUid::new("lib", "1.fb2"), fb2("One", "words")))];
        assert!(pipeline.fingerprint_all(jobs).is_empty());

        let mut index = DedupIndex::default();
        assert!(pipeline.merge(Vec::new(), &mut index).cancelled);
    }

    struct CancelOnFirstFile {
        token: Arc<AtomicBool>,
    }

    impl ProgressSink for CancelOnFirstFile {
        fn increment(&self, _by: u64, _label: &str) {
            self.token.store(true, Ordering::Relaxed);
        }
    }

    #[test]
    fn test_cancel_drains_queued_files() {
        let pipeline = FingerprintPipeline::new(&config(1));
        let token = pipeline.get_cancellation_token();
        let pipeline = pipeline.with_progress(Arc::new(CancelOnFirstFile { token }));

        let pulled = AtomicU64::new(0);
        let jobs: Vec<Result<FilePayload, FailedFile>> = (0..20)
            .map(|i| {
                let uid = FileUid::new("lib", format!("{:03}.fb2", i));
                Ok(FilePayload::new(uid, fb2("Book", "words")))
            })
            .collect();
        let jobs = jobs.into_iter().inspect(|_| {
            pulled.fetch_add(1, Ordering::Relaxed);
        });

        let bundles = pipeline.fingerprint_all(jobs);
        let pulled = pulled.load(Ordering::Relaxed);
        assert!(pulled < 20, "{} files queued after cancel", pulled);
        assert_eq!(bundles.len() as u64, pulled);
    }

    struct FailingMetadata;

    impl MetadataProvider for FailingMetadata {
        fn title(&self, uid: &FileUid) -> Option<String> {
            if uid.file == "2.fb2" {
                panic!("broken metadata record");
            }
            None
        }

        fn is_deleted(&self, _uid: &FileUid) -> bool {
            false
        }
    }

    #[test]
    fn test_worker_panic_fails_one_file() {
        let pipeline = FingerprintPipeline::new(&config(1)).with_metadata(Arc::new(FailingMetadata));
        let jobs: Vec<Result<FilePayload, FailedFile>> = (1..=3)
            .map(|i| {
                let uid = FileUid::new("lib", format!("{}.fb2", i));
                Ok(FilePayload::new(uid, fb2("Book", &format!("chapter {}", i))))
            })
            .collect();

        let bundles = pipeline.fingerprint_all(jobs);
        assert_eq!(bundles.len(), 3);
        let failed: Vec<_> = bundles
            .iter()
            .filter(|b| b.text.is_err())
            .map(|b| b.uid.file.as_str())
            .collect();
        assert_eq!(failed, vec!["2.fb2"]);
    }

    #[test]
    fn test_images_are_hashed_and_sorted() {
        let pipeline = FingerprintPipeline::new(&config(1));
        let mut payload = FilePayload::new(FileUid::new("lib", "1.fb2"), fb2("One", "words"));
        payload.cover = ImageFingerprint::from_body("cover.png", png(3));
        payload.images = vec![
            ImageFingerprint::from_body("1.png", png(5)),
            ImageFingerprint::from_body("2.png", png(11)),
        ];

        let bundle = pipeline.fingerprint_payload(payload);
        assert!(bundle.text.is_ok());
        assert!(bundle.cover.body.is_empty());
        assert_ne!(bundle.cover.perceptual_hash, 0);
        assert!(bundle.images.windows(2).all(|w| w[0].crypto_hash < w[1].crypto_hash));
        assert!(bundle.images.iter().all(|i| i.body.is_empty() && i.crypto_hash.len() == 64));
    }

    #[test]
    fn test_deferred_perceptual_pass() {
        let pipeline = FingerprintPipeline::new(&Config {
            defer_perceptual: true,
            ..config(2)
        });
        let mut payload = FilePayload::new(FileUid::new("lib", "1.fb2"), fb2("One", "words"));
        payload.images = vec![ImageFingerprint::from_body("1.png", png(5))];

        let bundles = pipeline.fingerprint_all(vec![Ok(payload)]);
        assert_eq!(bundles[0].images[0].perceptual_hash, 0);
        assert!(!bundles[0].images[0].body.is_empty());

        let mut index = DedupIndex::default();
        pipeline.merge(bundles, &mut index);

        let entry = index.pending_canonicals().next().unwrap();
        assert_ne!(entry.images[0].perceptual_hash, 0);
        assert!(entry.images[0].body.is_empty());
        assert!(index.pending_images().is_empty());
    }

    #[test]
    fn test_run_over_directory_archive() {
        let dir = tempdir().unwrap();
        let library = dir.path().join("lib");
        fs::create_dir_all(&library).unwrap();
        fs::create_dir_all(dir.path().join("images/lib/2/")).unwrap();

        let text = "extraordinary adventures continued";
        fs::write(library.join("1.fb2"), fb2("Voyage", text)).unwrap();
        fs::write(library.join("2.fb2"), fb2("Voyage", text)).unwrap();
        fs::write(library.join("3.fb2"), fb2("Other", "completely different")).unwrap();
        fs::write(dir.path().join("images/lib/2/1.png"), png(5)).unwrap();

        let archive = DirectoryArchive::open(&library).unwrap();
        let pipeline = FingerprintPipeline::new(&config(2));
        let mut index = DedupIndex::default();
        let report = pipeline.run(&archive, &mut index).unwrap();

        assert_eq!(report.processed, 3);
        assert!(report.failed.is_empty());

        let mut canonical: Vec<_> = index.pending_canonicals().map(|e| e.uid.file.clone()).collect();
        canonical.sort();
        assert_eq!(canonical, vec!["2.fb2", "3.fb2"]);
        let duplicates = index.duplicates_of(&FileUid::new("lib", "2.fb2")).unwrap();
        assert_eq!(duplicates[0].uid.file, "1.fb2");
    }
}
