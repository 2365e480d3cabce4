pub mod archive;
pub mod canny;
pub mod duplicate;
pub mod hash;
pub mod index;
pub mod metadata;
pub mod models;
pub mod perceptual;
pub mod resolver;
pub mod scanner;
pub mod store;
pub mod text;
pub mod title;

pub use archive::{ArchiveSource, DirectoryArchive, FilePayload};
pub use duplicate::{Classification, ImageComparer};
pub use hash::HashService;
pub use index::{DedupIndex, DuplicateObserver, NoopObserver};
pub use metadata::{InMemoryMetadata, MetadataProvider, NoMetadata};
pub use perceptual::PerceptualHasher;
pub use resolver::{ConflictResolver, MetadataAwareResolver, OrderResolver};
pub use scanner::{FingerprintPipeline, PipelineReport};
pub use text::TextFingerprinter;
