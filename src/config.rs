//! Run configuration.
//!
//! Stored as JSON in the user's configuration directory
//! (`<config_dir>/bookdedup/config.json`). Every field has a default, so a
//! partial file or no file at all is fine.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::core::canny::EdgeConfig;
use crate::core::duplicate::DEFAULT_HAMMING_THRESHOLD;

const APP_NAME: &str = "bookdedup";
const CONFIG_FILE_NAME: &str = "config.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid setting {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Library name written into every index document
    pub source_library: String,
    pub hamming_threshold: u32,
    pub max_workers: usize,
    /// Body words count only when longer than this
    pub min_word_length: usize,
    pub top_words: usize,
    pub edge: EdgeConfig,
    /// Images with a smaller side get no perceptual hash
    pub min_image_dimension: u32,
    /// Tokens upstream systems put into transliterated titles
    pub filler_tokens: Vec<String>,
    /// Hash images after the merge, for canonical entries only
    pub defer_perceptual: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            source_library: "LIBRARY".to_string(),
            hamming_threshold: DEFAULT_HAMMING_THRESHOLD,
            max_workers: num_cpus::get(),
            min_word_length: 7,
            top_words: 10,
            edge: EdgeConfig::default(),
            min_image_dimension: 8,
            filler_tokens: vec!["си".to_string()],
            defer_perceptual: false,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: Config = serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load the file at the standard location, or defaults when there is none
    pub fn load_default() -> Result<Self, ConfigError> {
        match Self::default_path() {
            Some(path) if path.exists() => {
                log::debug!("Using configuration from {}", path.display());
                Self::load(&path)
            }
            _ => Ok(Self::default()),
        }
    }

    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(APP_NAME).join(CONFIG_FILE_NAME))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_workers == 0 {
            return Err(ConfigError::Invalid {
                field: "max_workers",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.hamming_threshold > 64 {
            return Err(ConfigError::Invalid {
                field: "hamming_threshold",
                reason: format!("{} exceeds the 64 hash bits", self.hamming_threshold),
            });
        }
        if self.top_words == 0 {
            return Err(ConfigError::Invalid {
                field: "top_words",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.edge.threshold_low > self.edge.threshold_high {
            return Err(ConfigError::Invalid {
                field: "edge.threshold_low",
                reason: "must not exceed edge.threshold_high".to_string(),
            });
        }
        Ok(())
    }
}
