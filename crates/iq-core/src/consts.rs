/// The name of the iq folder (like .git)
pub const IQ_DIR: &str = ".iq";

/// Default CLIP model used for both images and query text
pub const DEFAULT_MODEL: &str = "clip-vit-b-32";

/// Default number of files encoded per chunk before progress is checkpointed
pub const DEFAULT_CHUNK_SIZE: usize = 1000;

/// Chunk sizes never drop below this many files
pub const MIN_CHUNK_SIZE: usize = 500;

/// Below this much available memory (GB) a build is aborted
pub const MIN_MEMORY_GB: f64 = 1.0;

/// Below this much available memory (GB) chunks shrink
pub const WARNING_MEMORY_GB: f64 = 2.0;

/// Factor applied to the chunk size when memory runs low or an encode call fails
pub const CHUNK_SHRINK_FACTOR: f64 = 0.5;

/// Minimum similarity score for a search hit
pub const SIMILARITY_THRESHOLD: f32 = 0.1;

/// Default number of search results
pub const MAX_RESULTS_DEFAULT: usize = 20;

/// Hard cap on the number of search results
pub const MAX_RESULTS_LIMIT: usize = 100;

/// Images handed to the model per inference call
pub const DEFAULT_ENCODE_BATCH_SIZE: usize = 8;

/// Checkpoints older than this are considered abandoned
pub const CHECKPOINT_MAX_AGE_DAYS: u32 = 7;

/// Maximum number of root folders in one selection
pub const MAX_SELECTED_FOLDERS: usize = 50;

/// Image extensions picked up by the scanner (compared case-insensitively)
pub const DEFAULT_IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];

/// Version tag written into every persisted store
pub const STORE_VERSION: u32 = 1;
