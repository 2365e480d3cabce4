// Near-duplicate detection between two books' image collections.
// Exact crypto-hash matches are removed first, the residue is paired
// greedily by perceptual hash distance.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::core::hash::hamming_distance;
use crate::core::models::{ImageFingerprint, UniqueFileEntry};
use crate::core::title::titles_overlap;

pub const DEFAULT_HAMMING_THRESHOLD: u32 = 10;

/// Relation between a left-hand and a right-hand book
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Classification {
    Equal,
    /// The right-hand side holds everything the left does and more
    Inner,
    /// The left-hand side holds everything the right does and more
    Outer,
    Varied,
}

impl Classification {
    /// Combine two partial results. `Equal` is neutral, opposite directions conflict.
    pub fn fold(self, other: Classification) -> Classification {
        use Classification::*;
        match (self, other) {
            (Equal, x) | (x, Equal) => x,
            (a, b) if a == b => a,
            _ => Varied,
        }
    }

    fn from_leftovers(lhs: usize, rhs: usize) -> Classification {
        match (lhs > 0, rhs > 0) {
            (false, false) => Classification::Equal,
            (true, false) => Classification::Outer,
            (false, true) => Classification::Inner,
            (true, true) => Classification::Varied,
        }
    }
}

pub struct ImageComparer {
    threshold: u32,
}

impl ImageComparer {
    pub fn new(threshold: u32) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Two perceptual hashes match when both are known and close enough
    pub fn is_match(&self, lhs: u64, rhs: u64) -> bool {
        lhs != 0 && rhs != 0 && hamming_distance(lhs, rhs) <= self.threshold
    }

    /// Classify two books by their images and covers, then make sure the
    /// evidence is strong enough to relate them at all.
    pub fn compare(&self, lhs: &UniqueFileEntry, rhs: &UniqueFileEntry) -> Classification {
        let result = self
            .compare_images(&lhs.images, &rhs.images)
            .fold(self.compare_covers(&lhs.cover, &rhs.cover));

        if result == Classification::Varied {
            return result;
        }

        let images_on_both = !lhs.images.is_empty() && !rhs.images.is_empty();
        let same_cover = !lhs.cover.crypto_hash.is_empty() && lhs.cover.crypto_hash == rhs.cover.crypto_hash;
        if images_on_both || same_cover {
            return result;
        }

        if titles_overlap(&lhs.title_tokens, &rhs.title_tokens) {
            return result;
        }

        log::warn!(
            "Same content hash {} but unrelated titles: {} '{}' vs {} '{}', keeping both",
            rhs.content_hash,
            lhs.uid,
            lhs.title(),
            rhs.uid,
            rhs.title()
        );
        Classification::Varied
    }

    pub fn compare_images(&self, lhs: &[ImageFingerprint], rhs: &[ImageFingerprint]) -> Classification {
        let lhs_hashes: HashSet<&str> = known_hashes(lhs);
        let rhs_hashes: HashSet<&str> = known_hashes(rhs);

        let lhs_rest: Vec<&ImageFingerprint> = lhs
            .iter()
            .filter(|image| !rhs_hashes.contains(image.crypto_hash.as_str()))
            .collect();
        let rhs_rest: Vec<&ImageFingerprint> = rhs
            .iter()
            .filter(|image| !lhs_hashes.contains(image.crypto_hash.as_str()))
            .collect();

        if lhs_rest.is_empty() || rhs_rest.is_empty() {
            return Classification::from_leftovers(lhs_rest.len(), rhs_rest.len());
        }

        // (distance, position gap, lhs index, rhs index)
        let mut pairs = Vec::new();
        for (i, left) in lhs_rest.iter().enumerate() {
            for (j, right) in rhs_rest.iter().enumerate() {
                if !self.is_match(left.perceptual_hash, right.perceptual_hash) {
                    continue;
                }
                let distance = hamming_distance(left.perceptual_hash, right.perceptual_hash);
                let gap = left.number().abs_diff(right.number());
                pairs.push((distance, gap, i, j));
            }
        }
        pairs.sort_unstable();

        let mut lhs_used = vec![false; lhs_rest.len()];
        let mut rhs_used = vec![false; rhs_rest.len()];
        for (_, _, i, j) in pairs {
            if lhs_used[i] || rhs_used[j] {
                continue;
            }
            lhs_used[i] = true;
            rhs_used[j] = true;
        }

        let lhs_left = lhs_used.iter().filter(|used| !**used).count();
        let rhs_left = rhs_used.iter().filter(|used| !**used).count();
        Classification::from_leftovers(lhs_left, rhs_left)
    }

    pub fn compare_covers(&self, lhs: &ImageFingerprint, rhs: &ImageFingerprint) -> Classification {
        match (lhs.is_empty(), rhs.is_empty()) {
            (true, true) => Classification::Equal,
            (true, false) => Classification::Inner,
            (false, true) => Classification::Outer,
            (false, false) => {
                if lhs.crypto_hash == rhs.crypto_hash
                    || self.is_match(lhs.perceptual_hash, rhs.perceptual_hash)
                {
                    Classification::Equal
                } else {
                    Classification::Varied
                }
            }
        }
    }
}

impl Default for ImageComparer {
    fn default() -> Self {
        Self::new(DEFAULT_HAMMING_THRESHOLD)
    }
}

fn known_hashes(images: &[ImageFingerprint]) -> HashSet<&str> {
    images
        .iter()
        .map(|image| image.crypto_hash.as_str())
        .filter(|hash| !hash.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::FileUid;
    use Classification::*;

    fn img(name: &str, hash: &str, phash: u64) -> ImageFingerprint {
        ImageFingerprint::from_hashes(name, hash, phash)
    }

    fn book(file: &str, title: &str, images: Vec<ImageFingerprint>) -> UniqueFileEntry {
        UniqueFileEntry::new(FileUid::new("f", file), "abc123")
            .with_title(title.split_whitespace())
            .with_images(ImageFingerprint::default(), images)
    }

    const BASE: u64 = 0x8000_0000_0000_0001;

    #[test]
    fn test_fold() {
        assert_eq!(Equal.fold(Inner), Inner);
        assert_eq!(Outer.fold(Equal), Outer);
        assert_eq!(Inner.fold(Inner), Inner);
        assert_eq!(Inner.fold(Outer), Varied);
        assert_eq!(Varied.fold(Equal), Varied);
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let comparer = ImageComparer::default();
        let at = BASE ^ 0x3ff;
        let beyond = BASE ^ 0x7ff;
        assert_eq!(hamming_distance(BASE, at), 10);
        assert_eq!(hamming_distance(BASE, beyond), 11);

        assert_eq!(
            comparer.compare_images(&[img("1", "a", BASE)], &[img("1", "b", at)]),
            Equal
        );
        assert_eq!(
            comparer.compare_images(&[img("1", "a", BASE)], &[img("1", "b", beyond)]),
            Varied
        );
    }

    #[test]
    fn test_zero_hash_never_matches() {
        let comparer = ImageComparer::default();
        assert!(!comparer.is_match(0, 0));
        assert!(!comparer.is_match(0, 1));
        assert_eq!(
            comparer.compare_images(&[img("1", "a", 0)], &[img("1", "b", 0)]),
            Varied
        );
    }

    #[test]
    fn test_exact_hashes_are_removed_first() {
        let comparer = ImageComparer::default();
        let lhs = vec![img("1", "h1", 0)];
        let rhs = vec![img("1", "h1", 0), img("2", "h2", u64::MAX)];
        assert_eq!(comparer.compare_images(&lhs, &rhs), Inner);
        assert_eq!(comparer.compare_images(&rhs, &lhs), Outer);
        assert_eq!(comparer.compare_images(&rhs, &rhs), Equal);
        assert_eq!(comparer.compare_images(&[], &[]), Equal);
    }

    #[test]
    fn test_fuzzy_residue_decides_direction() {
        let comparer = ImageComparer::default();
        let lhs = vec![img("1", "a", BASE)];
        let rhs = vec![img("1", "b", BASE ^ 1), img("2", "c", !BASE)];
        assert_eq!(comparer.compare_images(&lhs, &rhs), Inner);
        assert_eq!(comparer.compare_images(&rhs, &lhs), Outer);
    }

    #[test]
    fn test_greedy_pairing_prefers_nearby_positions() {
        let comparer = ImageComparer::default();
        // Same hash everywhere, so only the position gap separates candidates
        let lhs = vec![img("1", "a", BASE), img("4", "b", BASE)];
        let rhs = vec![img("5", "c", BASE), img("1", "d", BASE)];
        assert_eq!(comparer.compare_images(&lhs, &rhs), Equal);
    }

    #[test]
    fn test_covers() {
        let comparer = ImageComparer::default();
        let empty = ImageFingerprint::default();
        let cover = img("", "c1", BASE);
        assert_eq!(comparer.compare_covers(&empty, &empty), Equal);
        assert_eq!(comparer.compare_covers(&empty, &cover), Inner);
        assert_eq!(comparer.compare_covers(&cover, &empty), Outer);
        assert_eq!(comparer.compare_covers(&cover, &img("", "c2", BASE ^ 3)), Equal);
        assert_eq!(comparer.compare_covers(&cover, &img("", "c3", !BASE)), Varied);
    }

    #[test]
    fn test_cover_conflicts_with_images() {
        let comparer = ImageComparer::default();
        let mut lhs = book("1.fb2", "dune", vec![img("1", "h1", 0)]);
        let rhs = book("2.fb2", "dune", vec![img("1", "h1", 0), img("2", "h2", BASE)]);
        lhs.cover = img("", "c1", BASE);
        // rhs has more images, lhs has a cover rhs lacks
        assert_eq!(comparer.compare(&lhs, &rhs), Varied);
    }

    #[test]
    fn test_safety_net_requires_title_overlap() {
        let comparer = ImageComparer::default();
        let a = book("1.fb2", "war and peace", vec![]);
        let b = book("2.fb2", "anna karenina", vec![]);
        let c = book("3.fb2", "peace", vec![]);
        assert_eq!(comparer.compare(&a, &b), Varied);
        assert_eq!(comparer.compare(&a, &c), Equal);
    }

    #[test]
    fn test_safety_net_trusts_images_on_both_sides() {
        let comparer = ImageComparer::default();
        let a = book("1.fb2", "one", vec![img("1", "h1", 0)]);
        let b = book("2.fb2", "two", vec![img("1", "h1", 0)]);
        assert_eq!(comparer.compare(&a, &b), Equal);

        // Only one side has images: titles must agree
        let c = book("3.fb2", "three", vec![]);
        assert_eq!(comparer.compare(&c, &a), Varied);
    }

    #[test]
    fn test_safety_net_trusts_shared_cover() {
        let comparer = ImageComparer::default();
        let mut a = book("1.fb2", "one", vec![]);
        let mut b = book("2.fb2", "two", vec![]);
        a.cover = img("", "cover", 0);
        b.cover = img("", "cover", 0);
        assert_eq!(comparer.compare(&a, &b), Equal);
    }
}
