use md5::{Digest, Md5};

/// Service for the exact (cryptographic) hashes used by the index
pub struct HashService;

impl HashService {
    pub fn new() -> Self {
        Self
    }

    /// Compute the BLAKE3 content hash of an image body.
    /// Identical bytes always give identical hashes, so this is the exact-match key.
    pub fn compute_content_hash(&self, body: &[u8]) -> String {
        blake3::hash(body).to_hex().to_string()
    }
}

impl Default for HashService {
    fn default() -> Self {
        Self::new()
    }
}

/// Number of differing bits between two perceptual hashes
pub fn hamming_distance(lhs: u64, rhs: u64) -> u32 {
    (lhs ^ rhs).count_ones()
}

/// Incremental MD5 producing lower-case hex, used for text fingerprints
#[derive(Clone, Default)]
pub struct TextDigest {
    md5: Md5,
}

impl TextDigest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, text: &str) {
        self.md5.update(text.as_bytes());
    }

    pub fn finalize_hex(self) -> String {
        format!("{:x}", self.md5.finalize())
    }
}

pub fn md5_hex<'a>(parts: impl IntoIterator<Item = &'a str>) -> String {
    let mut digest = TextDigest::new();
    for part in parts {
        digest.update(part);
    }
    digest.finalize_hex()
}
