use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::config::ConfigError;
use crate::core::models::FileUid;

/// Bibliographic facts about a file supplied from outside the archive
pub trait MetadataProvider: Send + Sync {
    /// Authoritative title, if known
    fn title(&self, uid: &FileUid) -> Option<String>;

    fn is_deleted(&self, uid: &FileUid) -> bool;
}

/// No metadata at all: titles come from the markup, nothing is deleted
#[derive(Debug, Default, Clone, Copy)]
pub struct NoMetadata;

impl MetadataProvider for NoMetadata {
    fn title(&self, _uid: &FileUid) -> Option<String> {
        None
    }

    fn is_deleted(&self, _uid: &FileUid) -> bool {
        false
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataRecord {
    pub folder: String,
    pub file: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub deleted: bool,
}

#[derive(Debug, Default)]
pub struct InMemoryMetadata {
    records: HashMap<FileUid, MetadataRecord>,
}

impl InMemoryMetadata {
    pub fn new(records: impl IntoIterator<Item = MetadataRecord>) -> Self {
        Self {
            records: records
                .into_iter()
                .map(|record| (FileUid::new(&record.folder, &record.file), record))
                .collect(),
        }
    }

    /// Load a JSON array of `{folder, file, title, deleted}` records
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let records: Vec<MetadataRecord> =
            serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        log::info!("Loaded metadata for {} files from {}", records.len(), path.display());
        Ok(Self::new(records))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl MetadataProvider for InMemoryMetadata {
    fn title(&self, uid: &FileUid) -> Option<String> {
        self.records
            .get(uid)
            .and_then(|record| record.title.clone())
            .filter(|title| !title.trim().is_empty())
    }

    fn is_deleted(&self, uid: &FileUid) -> bool {
        self.records.get(uid).is_some_and(|record| record.deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_from_json() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[
                {{"folder": "lib-1", "file": "10.fb2", "title": "Dune", "deleted": true}},
                {{"folder": "lib-1", "file": "11.fb2"}},
                {{"folder": "lib-2", "file": "12.fb2", "title": "  "}}
            ]"#
        )
        .unwrap();

        let metadata = InMemoryMetadata::load(file.path()).unwrap();
        assert_eq!(metadata.len(), 3);

        let dune = FileUid::new("lib-1", "10.fb2");
        assert_eq!(metadata.title(&dune).as_deref(), Some("Dune"));
        assert!(metadata.is_deleted(&dune));
        assert!(!metadata.is_deleted(&FileUid::new("lib-1", "11.fb2")));
        assert_eq!(metadata.title(&FileUid::new("lib-2", "12.fb2")), None);
        assert_eq!(metadata.title(&FileUid::new("nowhere", "1.fb2")), None);
    }

    #[test]
    fn test_load_reports_bad_json() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(matches!(
            InMemoryMetadata::load(file.path()),
            Err(ConfigError::Parse { .. })
        ));
    }
}
