use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;

/// Identifies a source file inside a named archive
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FileUid {
    pub folder: String,
    pub file: String,
}

impl FileUid {
    pub fn new(folder: impl Into<String>, file: impl Into<String>) -> Self {
        Self {
            folder: folder.into(),
            file: file.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.file.is_empty()
    }
}

impl fmt::Display for FileUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.folder, self.file)
    }
}

/// Fingerprint of a single cover or embedded image.
///
/// `body` only lives until the image is hashed. A `perceptual_hash` of zero
/// means the hash could not be computed and never matches anything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageFingerprint {
    pub file_name: String,
    pub crypto_hash: String,
    pub perceptual_hash: u64,
    #[serde(skip)]
    pub body: Vec<u8>,
}

impl ImageFingerprint {
    pub fn from_body(file_name: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            file_name: file_name.into(),
            body,
            ..Default::default()
        }
    }

    pub fn from_hashes(
        file_name: impl Into<String>,
        crypto_hash: impl Into<String>,
        perceptual_hash: u64,
    ) -> Self {
        Self {
            file_name: file_name.into(),
            crypto_hash: crypto_hash.into(),
            perceptual_hash,
            body: Vec::new(),
        }
    }

    /// An image slot with no content (e.g. a book without a cover)
    pub fn is_empty(&self) -> bool {
        self.crypto_hash.is_empty() && self.body.is_empty()
    }

    /// Numeric value of the file name stem, used to pair images by position
    pub fn number(&self) -> i64 {
        parse_order(&self.file_name)
    }

    pub fn clear_body(&mut self) {
        self.body = Vec::new();
    }
}

/// Sort images by crypto hash and drop repeated hashes
pub fn normalize_images(images: &mut Vec<ImageFingerprint>) {
    images.sort_by(|a, b| a.crypto_hash.cmp(&b.crypto_hash));
    images.dedup_by(|a, b| a.crypto_hash == b.crypto_hash);
}

/// Numeric rank taken from a file name stem ("123.fb2" -> 123), zero if not numeric
pub fn parse_order(file_name: &str) -> i64 {
    let base = file_name.rsplit('/').next().unwrap_or(file_name);
    let stem = Path::new(base)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stem = stem.split('.').next().unwrap_or_default();
    stem.parse().unwrap_or(0)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionNode {
    pub depth: u32,
    pub hash: String,
    pub distinct_words: usize,
    pub parent: Option<usize>,
    pub children: Vec<usize>,
}

/// Arena of sections; index 0 is the document root
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionTree {
    nodes: Vec<SectionNode>,
}

impl SectionTree {
    pub const ROOT: usize = 0;

    pub fn new() -> Self {
        Self {
            nodes: vec![SectionNode {
                depth: 0,
                hash: String::new(),
                distinct_words: 0,
                parent: None,
                children: Vec::new(),
            }],
        }
    }

    /// Append a child under `parent` and return its index
    pub fn add_child(&mut self, parent: usize) -> usize {
        let index = self.nodes.len();
        let depth = self.nodes[parent].depth + 1;
        self.nodes.push(SectionNode {
            depth,
            hash: String::new(),
            distinct_words: 0,
            parent: Some(parent),
            children: Vec::new(),
        });
        self.nodes[parent].children.push(index);
        index
    }

    pub fn set_summary(&mut self, index: usize, hash: String, distinct_words: usize) {
        let node = &mut self.nodes[index];
        node.hash = hash;
        node.distinct_words = distinct_words;
    }

    pub fn node(&self, index: usize) -> &SectionNode {
        &self.nodes[index]
    }

    pub fn root(&self) -> Option<&SectionNode> {
        self.nodes.first()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Depth-first (pre-order) walk
    pub fn iter(&self) -> impl Iterator<Item = &SectionNode> {
        let mut stack = if self.nodes.is_empty() {
            Vec::new()
        } else {
            vec![Self::ROOT]
        };
        std::iter::from_fn(move || {
            let index = stack.pop()?;
            let node = &self.nodes[index];
            stack.extend(node.children.iter().rev());
            Some(node)
        })
    }
}

/// Text-derived fingerprint of one book
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContentFingerprint {
    pub content_hash: String,
    pub title: String,
    pub title_tokens: BTreeSet<String>,
    pub root_section_hash: String,
    pub sections: SectionTree,
    /// Highest ranked words of the root section with their counts
    pub top_words: Vec<(usize, String)>,
}

/// A book as tracked by the dedup index
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UniqueFileEntry {
    pub uid: FileUid,
    pub content_hash: String,
    pub title_tokens: BTreeSet<String>,
    pub order: i64,
    pub cover: ImageFingerprint,
    pub images: Vec<ImageFingerprint>,
    pub sections: Option<SectionTree>,
}

impl UniqueFileEntry {
    pub fn new(uid: FileUid, content_hash: impl Into<String>) -> Self {
        let order = parse_order(&uid.file);
        Self {
            uid,
            content_hash: content_hash.into(),
            order,
            ..Default::default()
        }
    }

    pub fn with_images(mut self, cover: ImageFingerprint, images: Vec<ImageFingerprint>) -> Self {
        self.set_images(cover, images);
        self
    }

    pub fn with_title(mut self, tokens: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.title_tokens = tokens.into_iter().map(Into::into).collect();
        self
    }

    pub fn set_images(&mut self, cover: ImageFingerprint, mut images: Vec<ImageFingerprint>) {
        normalize_images(&mut images);
        self.cover = cover;
        self.images = images;
    }

    pub fn title(&self) -> String {
        self.title_tokens
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn root_section_hash(&self) -> Option<&str> {
        self.sections
            .as_ref()
            .and_then(|tree| tree.root())
            .map(|node| node.hash.as_str())
    }

    /// Drop image bytes; hashes are kept
    pub fn clear_images(&mut self) {
        self.cover.clear_body();
        self.images.iter_mut().for_each(ImageFingerprint::clear_body);
    }
}
