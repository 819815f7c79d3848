//! Configuration handling for .iq/config.json

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::fingerprint::FingerprintMode;
use crate::{
    CHECKPOINT_MAX_AGE_DAYS, CHUNK_SHRINK_FACTOR, DEFAULT_CHUNK_SIZE, DEFAULT_ENCODE_BATCH_SIZE,
    DEFAULT_IMAGE_EXTENSIONS, DEFAULT_MODEL, IqError, MAX_RESULTS_DEFAULT, MAX_RESULTS_LIMIT,
    MAX_SELECTED_FOLDERS, MIN_CHUNK_SIZE, MIN_MEMORY_GB, Result, SIMILARITY_THRESHOLD,
    WARNING_MEMORY_GB, discover,
};

/// Configuration stored in .iq/config.json
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Image embedding model name
    #[serde(default = "default_model")]
    pub image_model: String,

    /// Text embedding model name (must share the image model's vector space)
    #[serde(default = "default_model")]
    pub text_model: String,

    /// Files per chunk when memory is plentiful
    #[serde(default = "default_chunk_size")]
    pub base_chunk_size: usize,

    /// Floor for every computed or shrunk chunk size
    #[serde(default = "default_min_chunk_size")]
    pub min_chunk_size: usize,

    /// Hard memory floor in GB; builds abort below it
    #[serde(default = "default_min_memory_gb")]
    pub min_memory_gb: f64,

    /// Warning memory floor in GB; chunks shrink below it
    #[serde(default = "default_warning_memory_gb")]
    pub warning_memory_gb: f64,

    /// Multiplier applied when shrinking a chunk
    #[serde(default = "default_chunk_shrink_factor")]
    pub chunk_shrink_factor: f64,

    /// Default minimum score for search hits
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,

    /// Default number of search results
    #[serde(default = "default_max_results")]
    pub max_results_default: usize,

    /// Upper bound on requested search results
    #[serde(default = "default_max_results_limit")]
    pub max_results_limit: usize,

    /// Images per model inference call
    #[serde(default = "default_encode_batch_size")]
    pub encode_batch_size: usize,

    /// Image file extensions to index
    #[serde(default = "default_image_extensions")]
    pub image_extensions: Vec<String>,

    /// How cached vectors are validated against files on disk
    #[serde(default)]
    pub fingerprint_mode: FingerprintMode,

    /// Checkpoints older than this many days are pruned
    #[serde(default = "default_checkpoint_max_age_days")]
    pub checkpoint_max_age_days: u32,

    /// Maximum number of root folders per build
    #[serde(default = "default_max_selected_folders")]
    pub max_selected_folders: usize,

    /// Scan sub-folders by default
    #[serde(default = "default_true")]
    pub recursive: bool,

    /// Remember the folder selection of the last successful build
    #[serde(default = "default_true")]
    pub remember_last_folders: bool,
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_min_chunk_size() -> usize {
    MIN_CHUNK_SIZE
}

fn default_min_memory_gb() -> f64 {
    MIN_MEMORY_GB
}

fn default_warning_memory_gb() -> f64 {
    WARNING_MEMORY_GB
}

fn default_chunk_shrink_factor() -> f64 {
    CHUNK_SHRINK_FACTOR
}

fn default_similarity_threshold() -> f32 {
    SIMILARITY_THRESHOLD
}

fn default_max_results() -> usize {
    MAX_RESULTS_DEFAULT
}

fn default_max_results_limit() -> usize {
    MAX_RESULTS_LIMIT
}

fn default_encode_batch_size() -> usize {
    DEFAULT_ENCODE_BATCH_SIZE
}

fn default_image_extensions() -> Vec<String> {
    DEFAULT_IMAGE_EXTENSIONS
        .iter()
        .map(|e| e.to_string())
        .collect()
}

fn default_checkpoint_max_age_days() -> u32 {
    CHECKPOINT_MAX_AGE_DAYS
}

fn default_max_selected_folders() -> usize {
    MAX_SELECTED_FOLDERS
}

fn default_true() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            image_model: default_model(),
            text_model: default_model(),
            base_chunk_size: default_chunk_size(),
            min_chunk_size: default_min_chunk_size(),
            min_memory_gb: default_min_memory_gb(),
            warning_memory_gb: default_warning_memory_gb(),
            chunk_shrink_factor: default_chunk_shrink_factor(),
            similarity_threshold: default_similarity_threshold(),
            max_results_default: default_max_results(),
            max_results_limit: default_max_results_limit(),
            encode_batch_size: default_encode_batch_size(),
            image_extensions: default_image_extensions(),
            fingerprint_mode: FingerprintMode::default(),
            checkpoint_max_age_days: default_checkpoint_max_age_days(),
            max_selected_folders: default_max_selected_folders(),
            recursive: default_true(),
            remember_last_folders: default_true(),
        }
    }
}

impl Config {
    /// Load config from the .iq directory.
    pub fn load(root: &Path) -> Result<Self> {
        let path = discover::config_path(root);
        let config: Self = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            serde_json::from_str(&content)?
        } else {
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Save config to the .iq directory.
    pub fn save(&self, root: &Path) -> Result<()> {
        let path = discover::config_path(root);
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject settings the builder cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.min_chunk_size == 0 || self.base_chunk_size == 0 {
            return Err(IqError::Config("chunk sizes must be positive".into()));
        }
        if self.encode_batch_size == 0 {
            return Err(IqError::Config("encode_batch_size must be positive".into()));
        }
        if !(self.chunk_shrink_factor > 0.0 && self.chunk_shrink_factor < 1.0) {
            return Err(IqError::Config(format!(
                "chunk_shrink_factor must be in (0, 1), got {}",
                self.chunk_shrink_factor
            )));
        }
        if self.min_memory_gb < 0.0 || self.warning_memory_gb < self.min_memory_gb {
            return Err(IqError::Config(format!(
                "memory floors must satisfy 0 <= min ({}) <= warning ({})",
                self.min_memory_gb, self.warning_memory_gb
            )));
        }
        if self.max_results_default > self.max_results_limit {
            return Err(IqError::Config(format!(
                "max_results_default ({}) exceeds max_results_limit ({})",
                self.max_results_default, self.max_results_limit
            )));
        }
        if self.image_extensions.is_empty() {
            return Err(IqError::Config("image_extensions must not be empty".into()));
        }
        Ok(())
    }
}
