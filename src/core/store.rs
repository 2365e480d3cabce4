//! Persisted index documents.
//!
//! One document per batch:
//!
//! ```text
//! <books source="LIB" version="1" generated="2024-01-01T00:00:00+00:00">
//!   <book id="CONTENT_HASH" folder="F" file="NAME" title="T">
//!     <cover pHash="HEX">CRYPTO_HASH</cover>
//!     <image id="1" pHash="HEX">CRYPTO_HASH</image>
//!     <origin folder="F2" file="NAME2"/>
//!     <section id="HASH" count="37">...</section>
//!   </book>
//! </books>
//! ```
//!
//! `origin` only appears on duplicate records, `section` only on canonical ones.

use chrono::Utc;
use roxmltree::{Document, Node};
use serde::Serialize;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::core::models::{FileUid, ImageFingerprint, SectionTree, UniqueFileEntry};
use crate::core::title::normalize_title;

pub const FORMAT_VERSION: &str = "1";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Write failed: {0}")]
    Write(#[from] std::io::Error),

    #[error("Malformed index document: {0}")]
    Xml(#[from] roxmltree::Error),

    #[error("Invalid index document: {0}")]
    Format(String),

    #[error("Unsupported index version {0}")]
    UnsupportedVersion(String),
}

/// One `<book>` element
#[derive(Debug, Clone, Serialize)]
pub struct IndexRecord {
    pub content_hash: String,
    pub uid: FileUid,
    pub title: String,
    pub cover: Option<ImageFingerprint>,
    pub images: Vec<ImageFingerprint>,
    /// Canonical entry this record duplicates
    pub origin: Option<FileUid>,
    pub sections: Option<SectionTree>,
}

impl IndexRecord {
    pub fn canonical(entry: &UniqueFileEntry) -> Self {
        Self {
            content_hash: entry.content_hash.clone(),
            uid: entry.uid.clone(),
            title: entry.title(),
            cover: (!entry.cover.is_empty()).then(|| entry.cover.clone()),
            images: entry.images.clone(),
            origin: None,
            sections: entry.sections.clone(),
        }
    }

    pub fn duplicate(entry: &UniqueFileEntry, origin: &FileUid) -> Self {
        Self {
            origin: Some(origin.clone()),
            sections: None,
            ..Self::canonical(entry)
        }
    }

    pub fn is_duplicate(&self) -> bool {
        self.origin.is_some()
    }

    pub fn into_entry(self) -> UniqueFileEntry {
        let mut entry = UniqueFileEntry::new(self.uid, self.content_hash);
        entry.title_tokens = normalize_title(&self.title);
        entry.set_images(self.cover.unwrap_or_default(), self.images);
        entry.sections = self.sections;
        entry
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexDocument {
    pub source: String,
    pub generated: Option<String>,
    pub records: Vec<IndexRecord>,
}

/// Destination of the records of one batch
pub trait IndexWriter {
    fn write(&mut self, record: &IndexRecord) -> Result<(), StoreError>;

    fn finish(&mut self) -> Result<(), StoreError>;
}

/// Opens a writer per batch
pub trait WriterFactory {
    fn open(&self, batch_id: &str) -> Result<Box<dyn IndexWriter>, StoreError>;
}

/// Accepts and discards everything
#[derive(Debug, Default)]
pub struct NoopWriter;

impl IndexWriter for NoopWriter {
    fn write(&mut self, _record: &IndexRecord) -> Result<(), StoreError> {
        Ok(())
    }

    fn finish(&mut self) -> Result<(), StoreError> {
        Ok(())
    }
}

pub struct XmlIndexWriter<W: Write> {
    out: BufWriter<W>,
    finished: bool,
}

impl<W: Write> XmlIndexWriter<W> {
    pub fn new(out: W, source: &str) -> Result<Self, StoreError> {
        let mut out = BufWriter::new(out);
        writeln!(out, r#"<?xml version="1.0" encoding="utf-8"?>"#)?;
        writeln!(
            out,
            r#"<books source="{}" version="{}" generated="{}">"#,
            escape(source),
            FORMAT_VERSION,
            Utc::now().to_rfc3339()
        )?;
        Ok(Self {
            out,
            finished: false,
        })
    }

    fn write_image(&mut self, tag: &str, image: &ImageFingerprint) -> Result<(), StoreError> {
        write!(self.out, "    <{}", tag)?;
        if !image.file_name.is_empty() {
            write!(self.out, r#" id="{}""#, escape(&image.file_name))?;
        }
        if image.perceptual_hash != 0 {
            write!(self.out, r#" pHash="{:016x}""#, image.perceptual_hash)?;
        }
        writeln!(self.out, ">{}</{}>", escape(&image.crypto_hash), tag)?;
        Ok(())
    }

    fn write_section(&mut self, tree: &SectionTree, index: usize, indent: usize) -> Result<(), StoreError> {
        let node = tree.node(index);
        let pad = " ".repeat(indent);
        if node.children.is_empty() {
            writeln!(
                self.out,
                r#"{}<section id="{}" count="{}"/>"#,
                pad,
                escape(&node.hash),
                node.distinct_words
            )?;
            return Ok(());
        }

        writeln!(
            self.out,
            r#"{}<section id="{}" count="{}">"#,
            pad,
            escape(&node.hash),
            node.distinct_words
        )?;
        for &child in &node.children {
            self.write_section(tree, child, indent + 2)?;
        }
        writeln!(self.out, "{}</section>", pad)?;
        Ok(())
    }
}

impl<W: Write> IndexWriter for XmlIndexWriter<W> {
    fn write(&mut self, record: &IndexRecord) -> Result<(), StoreError> {
        writeln!(
            self.out,
            r#"  <book id="{}" folder="{}" file="{}" title="{}">"#,
            escape(&record.content_hash),
            escape(&record.uid.folder),
            escape(&record.uid.file),
            escape(&record.title)
        )?;

        if let Some(cover) = &record.cover {
            self.write_image("cover", cover)?;
        }
        for image in &record.images {
            self.write_image("image", image)?;
        }
        if let Some(origin) = &record.origin {
            writeln!(
                self.out,
                r#"    <origin folder="{}" file="{}"/>"#,
                escape(&origin.folder),
                escape(&origin.file)
            )?;
        }
        if let Some(tree) = &record.sections {
            if !tree.is_empty() {
                self.write_section(tree, SectionTree::ROOT, 4)?;
            }
        }

        writeln!(self.out, "  </book>")?;
        Ok(())
    }

    fn finish(&mut self) -> Result<(), StoreError> {
        if !self.finished {
            writeln!(self.out, "</books>")?;
            self.out.flush()?;
            self.finished = true;
        }
        Ok(())
    }
}

/// Writes `<dir>/<batch_id>.xml`
pub struct DirectoryWriterFactory {
    dir: PathBuf,
    source: String,
}

impl DirectoryWriterFactory {
    pub fn new(dir: impl Into<PathBuf>, source: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            source: source.into(),
        }
    }

    pub fn path_for(&self, batch_id: &str) -> PathBuf {
        self.dir.join(format!("{}.xml", batch_id))
    }
}

impl WriterFactory for DirectoryWriterFactory {
    fn open(&self, batch_id: &str) -> Result<Box<dyn IndexWriter>, StoreError> {
        let path = self.path_for(batch_id);
        let file = File::create(&path).map_err(|source| StoreError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Box::new(XmlIndexWriter::new(file, &self.source)?))
    }
}

pub fn read_document(path: &Path) -> Result<IndexDocument, StoreError> {
    let text = fs::read_to_string(path).map_err(|source| StoreError::Io {
        path: path.display().to_string(),
        source,
    })?;
    parse_document(&text)
}

pub fn parse_document(text: &str) -> Result<IndexDocument, StoreError> {
    let document = Document::parse(text)?;
    let root = document.root_element();
    if root.tag_name().name() != "books" {
        return Err(StoreError::Format(format!(
            "expected <books>, found <{}>",
            root.tag_name().name()
        )));
    }
    if let Some(version) = root.attribute("version") {
        if version != FORMAT_VERSION {
            return Err(StoreError::UnsupportedVersion(version.to_string()));
        }
    }

    let records = root
        .children()
        .filter(|node| node.has_tag_name("book"))
        .map(parse_book)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(IndexDocument {
        source: root.attribute("source").unwrap_or_default().to_string(),
        generated: root.attribute("generated").map(str::to_string),
        records,
    })
}

fn required<'a>(node: &Node<'a, '_>, name: &str) -> Result<&'a str, StoreError> {
    node.attribute(name).ok_or_else(|| {
        StoreError::Format(format!(
            "<{}> without '{}' attribute",
            node.tag_name().name(),
            name
        ))
    })
}

fn parse_book(node: Node) -> Result<IndexRecord, StoreError> {
    let mut record = IndexRecord {
        content_hash: required(&node, "id")?.to_string(),
        uid: FileUid::new(required(&node, "folder")?, required(&node, "file")?),
        title: node.attribute("title").unwrap_or_default().to_string(),
        cover: None,
        images: Vec::new(),
        origin: None,
        sections: None,
    };

    for child in node.children().filter(Node::is_element) {
        match child.tag_name().name() {
            "cover" => record.cover = Some(parse_image(&child)?),
            "image" => record.images.push(parse_image(&child)?),
            "origin" => {
                record.origin = Some(FileUid::new(required(&child, "folder")?, required(&child, "file")?))
            }
            "section" => {
                let mut tree = SectionTree::new();
                parse_section(&child, &mut tree, SectionTree::ROOT)?;
                record.sections = Some(tree);
            }
            other => log::debug!("Ignoring unknown element <{}> in book {}", other, record.uid),
        }
    }

    Ok(record)
}

fn parse_image(node: &Node) -> Result<ImageFingerprint, StoreError> {
    let perceptual_hash = match node.attribute("pHash") {
        Some(hex) => u64::from_str_radix(hex, 16)
            .map_err(|e| StoreError::Format(format!("bad pHash '{}': {}", hex, e)))?,
        None => 0,
    };
    Ok(ImageFingerprint::from_hashes(
        node.attribute("id").unwrap_or_default(),
        node.text().unwrap_or_default().trim(),
        perceptual_hash,
    ))
}

fn parse_section(node: &Node, tree: &mut SectionTree, index: usize) -> Result<(), StoreError> {
    let count = match node.attribute("count") {
        Some(value) => value
            .parse()
            .map_err(|e| StoreError::Format(format!("bad section count '{}': {}", value, e)))?,
        None => 0,
    };
    tree.set_summary(index, node.attribute("id").unwrap_or_default().to_string(), count);

    for child in node.children().filter(|n| n.has_tag_name("section")) {
        let child_index = tree.add_child(index);
        parse_section(&child, tree, child_index)?;
    }
    Ok(())
}

fn escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

/// Collects records in memory; lets tests look at what a batch wrote
#[cfg(test)]
#[derive(Clone, Default)]
pub(crate) struct MemoryWriterFactory {
    pub batches: std::sync::Arc<std::sync::Mutex<Vec<(String, Vec<IndexRecord>)>>>,
}

#[cfg(test)]
impl MemoryWriterFactory {
    pub fn records(&self) -> Vec<IndexRecord> {
        self.batches
            .lock()
            .unwrap()
            .iter()
            .flat_map(|(_, records)| records.clone())
            .collect()
    }
}

#[cfg(test)]
struct MemoryWriter {
    batch_id: String,
    records: Vec<IndexRecord>,
    sink: MemoryWriterFactory,
}

#[cfg(test)]
impl IndexWriter for MemoryWriter {
    fn write(&mut self, record: &IndexRecord) -> Result<(), StoreError> {
        self.records.push(record.clone());
        Ok(())
    }

    fn finish(&mut self) -> Result<(), StoreError> {
        let records = std::mem::take(&mut self.records);
        self.sink
            .batches
            .lock()
            .unwrap()
            .push((self.batch_id.clone(), records));
        Ok(())
    }
}

#[cfg(test)]
impl WriterFactory for MemoryWriterFactory {
    fn open(&self, batch_id: &str) -> Result<Box<dyn IndexWriter>, StoreError> {
        Ok(Box::new(MemoryWriter {
            batch_id: batch_id.to_string(),
            records: Vec::new(),
            sink: self.clone(),
        }))
    }
}
