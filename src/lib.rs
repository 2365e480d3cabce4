//! Fingerprinting and deduplication of e-book archives.
//!
//! Books are keyed by a structure-agnostic hash of their text. Books that
//! share a key are told apart, or merged, by comparing their cover and
//! embedded images with perceptual hashes.

pub mod config;
pub mod core;
pub mod progress;

pub use config::{Config, ConfigError};
