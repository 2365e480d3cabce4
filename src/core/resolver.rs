use std::sync::Arc;

use crate::core::metadata::MetadataProvider;
use crate::core::models::UniqueFileEntry;

/// Decides which of two equivalent books stays canonical
pub trait ConflictResolver: Send + Sync {
    /// True when `candidate` should replace `existing`
    fn resolve(&self, candidate: &UniqueFileEntry, existing: &UniqueFileEntry) -> bool;
}

/// Higher order wins; the existing entry keeps exact ties
#[derive(Debug, Default, Clone, Copy)]
pub struct OrderResolver;

impl ConflictResolver for OrderResolver {
    fn resolve(&self, candidate: &UniqueFileEntry, existing: &UniqueFileEntry) -> bool {
        candidate.order > existing.order
    }
}

/// Live records beat deleted ones, then falls back to order
pub struct MetadataAwareResolver {
    metadata: Arc<dyn MetadataProvider>,
}

impl MetadataAwareResolver {
    pub fn new(metadata: Arc<dyn MetadataProvider>) -> Self {
        Self { metadata }
    }
}

impl ConflictResolver for MetadataAwareResolver {
    fn resolve(&self, candidate: &UniqueFileEntry, existing: &UniqueFileEntry) -> bool {
        let candidate_deleted = self.metadata.is_deleted(&candidate.uid);
        let existing_deleted = self.metadata.is_deleted(&existing.uid);
        if candidate_deleted != existing_deleted {
            return existing_deleted;
        }
        OrderResolver.resolve(candidate, existing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::metadata::{InMemoryMetadata, MetadataRecord};
    use crate::core::models::FileUid;

    fn entry(file: &str) -> UniqueFileEntry {
        UniqueFileEntry::new(FileUid::new("f", file), "hash")
    }

    #[test]
    fn test_order_resolver_existing_wins_ties() {
        let resolver = OrderResolver;
        assert!(resolver.resolve(&entry("2.fb2"), &entry("1.fb2")));
        assert!(!resolver.resolve(&entry("1.fb2"), &entry("2.fb2")));
        assert!(!resolver.resolve(&entry("1.fb2"), &entry("1.fb2")));
    }

    #[test]
    fn test_metadata_resolver_prefers_live_records() {
        let metadata = InMemoryMetadata::new([MetadataRecord {
            folder: "f".into(),
            file: "9.fb2".into(),
            title: None,
            deleted: true,
        }]);
        let resolver = MetadataAwareResolver::new(Arc::new(metadata));

        // Deleted newer file loses to a live older one
        assert!(!resolver.resolve(&entry("9.fb2"), &entry("1.fb2")));
        assert!(resolver.resolve(&entry("1.fb2"), &entry("9.fb2")));
        // Both live: order decides
        assert!(resolver.resolve(&entry("3.fb2"), &entry("2.fb2")));
    }
}
