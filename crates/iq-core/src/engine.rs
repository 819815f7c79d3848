//! Engine: owns the stores and collaborators, serializes builds and serves
//! queries from the last published index.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{CacheStats, FingerprintCache};
use crate::checkpoint::{Checkpoint, CheckpointStore, JobKey};
use crate::discover::{StoreLayout, write_atomic};
use crate::embed::{ClipEncoder, Encoder};
use crate::index::{
    BuildContext, BuildReport, BuildRequest, BuildState, IndexBuilder, ProgressCallback,
};
use crate::memory::{MemoryInfo, MemoryPolicy, MemoryProbe, MemoryStatus, SystemMemory};
use crate::scan::{DateFilter, FsScanner, Scanner};
use crate::search::{EmbeddingIndex, QueryEngine, SearchResult};
use crate::{Config, IqError, Result};

/// Requests cancellation of the build running on an [`Engine`].
///
/// The build stops at the next chunk boundary with its checkpoint saved.
#[derive(Debug, Clone)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Snapshot of engine state for status displays.
#[derive(Debug, Clone, Serialize)]
pub struct IndexStats {
    pub is_built: bool,
    pub state: BuildState,
    pub total_images: usize,
    pub scanned_files: usize,
    pub indexed_paths: Vec<PathBuf>,
    /// Indexed images per selected root folder
    pub folders: BTreeMap<PathBuf, usize>,
    pub total_folders: usize,
    pub built_at: Option<DateTime<Utc>>,
    pub cache: CacheStats,
    pub memory: MemoryStatus,
}

/// Folder selection of the last successful build.
#[derive(Debug, Serialize, Deserialize)]
struct LastFolders {
    folders: Vec<PathBuf>,
    recursive: bool,
    #[serde(default)]
    date_filter: Option<DateFilter>,
    saved_at: DateTime<Utc>,
}

/// What a rebuild without explicit folders should scan.
#[derive(Debug, Clone, PartialEq)]
pub struct FolderSelection {
    /// Saved folders that still exist
    pub folders: Vec<PathBuf>,
    pub recursive: bool,
    pub date_filter: Option<DateFilter>,
}

impl FolderSelection {
    /// A build request scanning this selection.
    pub fn to_request(&self) -> BuildRequest {
        BuildRequest::new(self.folders.clone())
            .recursive(self.recursive)
            .date_filter(self.date_filter)
    }
}

/// Long-lived owner of one image index.
///
/// At most one build runs at a time; queries run concurrently with builds
/// and always see either the previous index or the new one.
pub struct Engine {
    config: Config,
    layout: StoreLayout,
    encoder: Arc<dyn Encoder>,
    scanner: Box<dyn Scanner>,
    memory: Box<dyn MemoryProbe>,
    cache: Mutex<FingerprintCache>,
    checkpoints: CheckpointStore,
    snapshot: RwLock<Option<Arc<EmbeddingIndex>>>,
    build_lock: Mutex<()>,
    cancel: Arc<AtomicBool>,
    state: Mutex<BuildState>,
}

impl Engine {
    /// Open the engine for the iq repository at `root` with the CLIP encoder,
    /// filesystem scanner and system memory probe.
    pub fn open(root: &Path) -> Result<Self> {
        let config = Config::load(root)?;
        let encoder = ClipEncoder::new(&config)?;
        let scanner = FsScanner::from_config(&config);
        Self::with_collaborators(
            config,
            StoreLayout::new(root),
            Arc::new(encoder),
            Box::new(scanner),
            Box::new(SystemMemory::new()),
        )
    }

    pub fn with_collaborators(
        config: Config,
        layout: StoreLayout,
        encoder: Arc<dyn Encoder>,
        scanner: Box<dyn Scanner>,
        memory: Box<dyn MemoryProbe>,
    ) -> Result<Self> {
        config.validate()?;
        let cache = FingerprintCache::open(&layout, config.fingerprint_mode);
        let checkpoints = CheckpointStore::new(&layout.checkpoints);

        let engine = Self {
            config,
            layout,
            encoder,
            scanner,
            memory,
            cache: Mutex::new(cache),
            checkpoints,
            snapshot: RwLock::new(None),
            build_lock: Mutex::new(()),
            cancel: Arc::new(AtomicBool::new(false)),
            state: Mutex::new(BuildState::Idle),
        };
        engine.prune_checkpoints();
        Ok(engine)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    pub fn state(&self) -> BuildState {
        *self.state.lock()
    }

    pub fn is_built(&self) -> bool {
        self.snapshot.read().is_some()
    }

    /// The currently published index, if any.
    pub fn snapshot(&self) -> Option<Arc<EmbeddingIndex>> {
        self.snapshot.read().clone()
    }

    /// Build (or resume) the index for `request` on the calling thread.
    ///
    /// Fails with [`IqError::BuildInProgress`] when another build is running.
    /// Memory exhaustion and cancellation are reported through
    /// [`BuildReport::outcome`], not as errors.
    pub fn build(
        &self,
        request: &BuildRequest,
        progress: Option<&ProgressCallback>,
    ) -> Result<BuildReport> {
        let _guard = self.build_lock.try_lock().ok_or(IqError::BuildInProgress)?;
        self.cancel.store(false, Ordering::SeqCst);
        let previous = self.state();

        let builder = IndexBuilder::new(
            BuildContext {
                config: &self.config,
                scanner: self.scanner.as_ref(),
                encoder: self.encoder.as_ref(),
                memory: self.memory.as_ref(),
                cache: &self.cache,
                checkpoints: &self.checkpoints,
                snapshot: &self.snapshot,
                cancel: &self.cancel,
                state: &self.state,
            },
            progress,
        );

        match builder.run(request) {
            Ok(report) => {
                if report.outcome.is_ready() && self.config.remember_last_folders {
                    self.save_last_folders(request);
                }
                Ok(report)
            }
            Err(e) => {
                *self.state.lock() = previous;
                Err(e)
            }
        }
    }

    /// Run [`Engine::build`] on a blocking worker.
    pub fn spawn_build(
        self: &Arc<Self>,
        request: BuildRequest,
        progress: Option<ProgressCallback>,
    ) -> JoinHandle<Result<BuildReport>> {
        let engine = Arc::clone(self);
        tokio::task::spawn_blocking(move || engine.build(&request, progress.as_ref()))
    }

    /// Ask the running build, if any, to stop at the next chunk boundary.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle(Arc::clone(&self.cancel))
    }

    /// Search with `max_results` clamped to the configured limit.
    pub fn search(
        &self,
        query: &str,
        max_results: usize,
        similarity_threshold: f32,
    ) -> Result<Vec<SearchResult>> {
        let max_results = max_results.min(self.config.max_results_limit);
        QueryEngine::new(self.snapshot(), Arc::clone(&self.encoder)).search(
            query,
            max_results,
            similarity_threshold,
        )
    }

    /// Search with the configured result count and threshold.
    pub fn search_default(&self, query: &str) -> Result<Vec<SearchResult>> {
        self.search(
            query,
            self.config.max_results_default,
            self.config.similarity_threshold,
        )
    }

    pub fn index_stats(&self) -> IndexStats {
        let snapshot = self.snapshot();
        let cache = self.cache.lock().stats();
        let memory = MemoryPolicy::from_config(&self.config).sample(self.memory.as_ref());

        match snapshot {
            Some(index) => {
                let mut indexed_paths: Vec<PathBuf> = index.paths().cloned().collect();
                indexed_paths.sort();
                IndexStats {
                    is_built: true,
                    state: self.state(),
                    total_images: index.len(),
                    scanned_files: index.scanned_files(),
                    indexed_paths,
                    folders: index.folder_counts(),
                    total_folders: index.folders().len(),
                    built_at: Some(index.built_at()),
                    cache,
                    memory,
                }
            }
            None => IndexStats {
                is_built: false,
                state: self.state(),
                total_images: 0,
                scanned_files: 0,
                indexed_paths: Vec::new(),
                folders: BTreeMap::new(),
                total_folders: 0,
                built_at: None,
                cache,
                memory,
            },
        }
    }

    pub fn memory_info(&self) -> MemoryInfo {
        MemoryPolicy::from_config(&self.config).describe(self.memory.as_ref())
    }

    /// Drop the published index. Cached vectors stay.
    pub fn clear_index(&self) {
        *self.snapshot.write() = None;
        let mut state = self.state.lock();
        if *state == BuildState::Ready {
            *state = BuildState::Idle;
        }
        info!("Index cleared");
    }

    /// Empty the vector cache and delete its files.
    pub fn clear_cache(&self) {
        self.cache.lock().clear();
        info!("Cache cleared");
    }

    /// Checkpoint a build of `folders` would resume from, if one is live.
    /// A checkpoint that already covers every chunk is discarded.
    pub fn resume_point(&self, folders: &[PathBuf]) -> Option<Checkpoint> {
        let key = JobKey::for_folders(folders);
        let checkpoint = self.checkpoints.load(&key)?;
        if checkpoint.is_stale() {
            self.checkpoints.clear(&key);
            return None;
        }
        Some(checkpoint)
    }

    /// Delete checkpoints older than `checkpoint_max_age_days`.
    pub fn prune_checkpoints(&self) -> usize {
        let max_age = chrono::Duration::days(i64::from(self.config.checkpoint_max_age_days));
        let removed = self.checkpoints.prune_older_than(max_age);
        if removed > 0 {
            info!("Pruned {} old checkpoints", removed);
        }
        removed
    }

    /// Selection of the last successful build, limited to folders that
    /// still exist.
    pub fn last_folders(&self) -> Option<FolderSelection> {
        load_last_folders(&self.layout)
    }

    fn save_last_folders(&self, request: &BuildRequest) {
        let record = LastFolders {
            folders: request.folders.clone(),
            recursive: request.recursive,
            date_filter: request.date_filter,
            saved_at: Utc::now(),
        };
        let result = serde_json::to_vec_pretty(&record)
            .map_err(std::io::Error::from)
            .and_then(|bytes| write_atomic(&self.layout.last_folders, &bytes));
        if let Err(e) = result {
            warn!("Failed to save folder selection: {}", e);
        }
    }
}

/// Read the folder selection saved under `layout`, dropping folders that no
/// longer exist. Unreadable records read as absent.
pub fn load_last_folders(layout: &StoreLayout) -> Option<FolderSelection> {
    let content = std::fs::read(&layout.last_folders).ok()?;
    let record: LastFolders = match serde_json::from_slice(&content) {
        Ok(record) => record,
        Err(e) => {
            warn!("Ignoring unreadable folder selection: {}", e);
            return None;
        }
    };

    let folders: Vec<PathBuf> = record
        .folders
        .into_iter()
        .filter(|f| {
            let exists = f.is_dir();
            if !exists {
                debug!("Dropping missing folder {}", f.display());
            }
            exists
        })
        .collect();
    (!folders.is_empty()).then_some(FolderSelection {
        folders,
        recursive: record.recursive,
        date_filter: record.date_filter,
    })
}
