use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

use crate::core::models::{FileUid, ImageFingerprint};

const BOOK_EXTENSION: &str = "fb2";
const COVERS_DIR: &str = "covers";
const IMAGES_DIR: &str = "images";

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("Not a directory: {path}")]
    NotADirectory { path: String },

    #[error("Cannot read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Directory walk failed: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("No such file in {folder}: {file}")]
    NotFound { folder: String, file: String },
}

/// Raw bytes of one book plus its cover and embedded images
#[derive(Debug, Clone, Default)]
pub struct FilePayload {
    pub uid: FileUid,
    pub body: Vec<u8>,
    pub cover: ImageFingerprint,
    pub images: Vec<ImageFingerprint>,
}

impl FilePayload {
    pub fn new(uid: FileUid, body: Vec<u8>) -> Self {
        Self {
            uid,
            body,
            ..Default::default()
        }
    }
}

/// A named collection of book files
pub trait ArchiveSource: Send + Sync {
    fn folder(&self) -> &str;

    /// File names in a stable order
    fn files(&self) -> Result<Vec<String>, ArchiveError>;

    fn read(&self, file: &str) -> Result<FilePayload, ArchiveError>;
}

/// Treats a directory of `.fb2` files as an archive.
///
/// Covers and images live next to it:
/// `<parent>/covers/<folder>/<base name>.*` and
/// `<parent>/images/<folder>/<base name>/*`.
pub struct DirectoryArchive {
    root: PathBuf,
    folder: String,
    covers: PathBuf,
    images: PathBuf,
}

impl DirectoryArchive {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, ArchiveError> {
        let root = root.into();
        if !root.is_dir() {
            return Err(ArchiveError::NotADirectory {
                path: root.display().to_string(),
            });
        }

        let folder = root
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let parent = root.parent().map(Path::to_path_buf).unwrap_or_default();

        Ok(Self {
            covers: parent.join(COVERS_DIR).join(&folder),
            images: parent.join(IMAGES_DIR).join(&folder),
            root,
            folder,
        })
    }

    fn read_cover(&self, base: &str) -> Result<ImageFingerprint, ArchiveError> {
        if !self.covers.is_dir() {
            return Ok(ImageFingerprint::default());
        }
        let entries = fs::read_dir(&self.covers).map_err(|source| io_error(&self.covers, source))?;
        for entry in entries {
            let path = entry.map_err(|source| io_error(&self.covers, source))?.path();
            if path.is_file() && file_stem(&path) == base {
                let body = fs::read(&path).map_err(|source| io_error(&path, source))?;
                return Ok(ImageFingerprint::from_body(file_name(&path), body));
            }
        }
        Ok(ImageFingerprint::default())
    }

    fn read_images(&self, base: &str) -> Result<Vec<ImageFingerprint>, ArchiveError> {
        let dir = self.images.join(base);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut images = Vec::new();
        for entry in WalkDir::new(&dir).min_depth(1).max_depth(1).sort_by_file_name() {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let body = fs::read(entry.path()).map_err(|source| io_error(entry.path(), source))?;
            images.push(ImageFingerprint::from_body(file_name(entry.path()), body));
        }
        Ok(images)
    }
}

impl ArchiveSource for DirectoryArchive {
    fn folder(&self) -> &str {
        &self.folder
    }

    fn files(&self) -> Result<Vec<String>, ArchiveError> {
        let mut files = Vec::new();
        for entry in WalkDir::new(&self.root).min_depth(1).max_depth(1) {
            let entry = entry?;
            let path = entry.path();
            let is_book = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext.eq_ignore_ascii_case(BOOK_EXTENSION));
            if entry.file_type().is_file() && is_book {
                files.push(file_name(path));
            }
        }
        files.sort();
        Ok(files)
    }

    fn read(&self, file: &str) -> Result<FilePayload, ArchiveError> {
        let path = self.root.join(file);
        if !path.is_file() {
            return Err(ArchiveError::NotFound {
                folder: self.folder.clone(),
                file: file.to_string(),
            });
        }

        let body = fs::read(&path).map_err(|source| io_error(&path, source))?;
        let base = file_stem(&path);

        Ok(FilePayload {
            uid: FileUid::new(&self.folder, file),
            body,
            cover: self.read_cover(&base)?,
            images: self.read_images(&base)?,
        })
    }
}

fn io_error(path: &Path, source: std::io::Error) -> ArchiveError {
    ArchiveError::Io {
        path: path.display().to_string(),
        source,
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_directory_layout() {
        let dir = tempdir().unwrap();
        let library = dir.path().join("lib-1");
        fs::create_dir_all(&library).unwrap();
        fs::create_dir_all(dir.path().join("covers/lib-1")).unwrap();
        fs::create_dir_all(dir.path().join("images/lib-1/10")).unwrap();

        fs::write(library.join("10.fb2"), b"<FictionBook/>").unwrap();
        fs::write(library.join("2.FB2"), b"<FictionBook/>").unwrap();
        fs::write(library.join("notes.txt"), b"skip me").unwrap();
        fs::write(dir.path().join("covers/lib-1/10.jpg"), b"cover").unwrap();
        fs::write(dir.path().join("images/lib-1/10/2.png"), b"two").unwrap();
        fs::write(dir.path().join("images/lib-1/10/1.png"), b"one").unwrap();

        let archive = DirectoryArchive::open(&library).unwrap();
        assert_eq!(archive.folder(), "lib-1");
        assert_eq!(archive.files().unwrap(), vec!["10.fb2", "2.FB2"]);

        let payload = archive.read("10.fb2").unwrap();
        assert_eq!(payload.uid, FileUid::new("lib-1", "10.fb2"));
        assert_eq!(payload.cover.file_name, "10.jpg");
        assert_eq!(payload.cover.body, b"cover");
        let names: Vec<_> = payload.images.iter().map(|i| i.file_name.as_str()).collect();
        assert_eq!(names, vec!["1.png", "2.png"]);

        let bare = archive.read("2.FB2").unwrap();
        assert!(bare.cover.is_empty());
        assert!(bare.images.is_empty());
    }

    #[test]
    fn test_missing_inputs() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            DirectoryArchive::open(dir.path().join("absent")),
            Err(ArchiveError::NotADirectory { .. })
        ));

        let archive = DirectoryArchive::open(dir.path()).unwrap();
        assert!(matches!(
            archive.read("1.fb2"),
            Err(ArchiveError::NotFound { .. })
        ));
    }
}
