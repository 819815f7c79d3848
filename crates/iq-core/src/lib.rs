//! iq-core: resumable image embedding index
//!
//! This library scans image folders, caches one embedding per file keyed by
//! a cheap file fingerprint, encodes only what is missing in memory-bounded
//! chunks with checkpointed progress, and answers text queries against the
//! finished index.

pub mod cache;
pub mod checkpoint;
pub mod config;
pub mod consts;
pub mod discover;
pub mod embed;
pub mod engine;
pub mod fingerprint;
pub mod index;
pub mod memory;
pub mod scan;
pub mod search;

use std::path::PathBuf;

pub use cache::{CacheStats, FingerprintCache};
pub use checkpoint::{Checkpoint, CheckpointStore, JobKey};
pub use config::Config;
pub use consts::*;
pub use discover::{StoreLayout, find_iq_root};
pub use embed::{ClipEncoder, EncodedImage, Encoder};
pub use engine::{CancelHandle, Engine, FolderSelection, IndexStats, load_last_folders};
pub use fingerprint::{Fingerprint, FingerprintMode};
pub use index::{
    AbortReason, BuildOutcome, BuildReport, BuildRequest, BuildState, Progress, ProgressCallback,
    ProgressEvent,
};
pub use memory::{MemoryInfo, MemoryLevel, MemoryPolicy, MemoryProbe, MemoryStatus, SystemMemory};
pub use scan::{DateFilter, FsScanner, ScanOptions, Scanner};
pub use search::{EmbeddingIndex, FileInfo, QueryEngine, SearchResult};

#[derive(Debug, thiserror::Error)]
pub enum IqError {
    #[error("Not in an iq repository (no .iq folder found)")]
    NotInRepo,

    #[error("Already initialized: {0}")]
    AlreadyInitialized(PathBuf),

    #[error("Config error: {0}")]
    Config(String),

    #[error("No folders selected")]
    EmptySelection,

    #[error("Too many folders selected: {count} (maximum {max})")]
    TooManyFolders { count: usize, max: usize },

    #[error("Directory not found: {0}")]
    DirectoryNotFound(PathBuf),

    #[error("Not a directory: {0}")]
    NotADirectory(PathBuf),

    #[error("No images found in the selected folders")]
    NoImagesFound,

    #[error("Search query must not be empty")]
    EmptyQuery,

    #[error("Index not built, run a build before searching")]
    IndexNotBuilt,

    #[error("A build is already running on this engine")]
    BuildInProgress,

    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, IqError>;
