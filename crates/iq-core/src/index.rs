//! Indexing logic: scan folders, reuse cached vectors, encode the rest in
//! memory-bounded chunks with a checkpoint after each one, then publish the
//! finished index.
//!
//! One build moves through
//! `Idle -> Scanning -> CacheReconciliation -> ChunkProcessing -> Finalizing -> Ready`,
//! or stops early in `Aborted` (memory below the hard floor) or `Cancelled`
//! (cooperative stop between chunks). Both early stops leave a checkpoint
//! the next build with the same folders resumes from.

use std::cell::Cell;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cache::FingerprintCache;
use crate::checkpoint::{Checkpoint, CheckpointStore, JobKey};
use crate::embed::{EncodedImage, Encoder};
use crate::memory::{MemoryPolicy, MemoryProbe, MemoryStatus};
use crate::scan::{DateFilter, ScanOptions, Scanner};
use crate::search::EmbeddingIndex;
use crate::{Config, IqError, Result};

const SCAN_END: u8 = 10;
const RECONCILE_END: u8 = 15;
const CHUNKS_END: u8 = 95;

/// Parameters of one build.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub folders: Vec<PathBuf>,
    pub recursive: bool,
    pub date_filter: Option<DateFilter>,
    /// Ignore cached vectors and any checkpoint; re-encode everything.
    pub force_rebuild: bool,
}

impl BuildRequest {
    pub fn new(folders: Vec<PathBuf>) -> Self {
        Self {
            folders,
            recursive: true,
            date_filter: None,
            force_rebuild: false,
        }
    }

    pub fn recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }

    pub fn date_filter(mut self, filter: Option<DateFilter>) -> Self {
        self.date_filter = filter;
        self
    }

    pub fn force_rebuild(mut self, force: bool) -> Self {
        self.force_rebuild = force;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BuildState {
    Idle,
    Scanning,
    CacheReconciliation,
    ChunkProcessing,
    Finalizing,
    Ready,
    Aborted,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AbortReason {
    InsufficientMemory { available_gb: f64, required_gb: f64 },
}

/// How a build that did not error ended.
#[derive(Debug, Clone, PartialEq)]
pub enum BuildOutcome {
    Ready,
    Aborted(AbortReason),
    Cancelled,
}

impl BuildOutcome {
    pub fn is_ready(&self) -> bool {
        matches!(self, BuildOutcome::Ready)
    }

    /// Whether running the same build again later can make progress.
    pub fn is_retryable(&self) -> bool {
        !self.is_ready()
    }
}

/// Stats from a build.
#[derive(Debug, Clone)]
pub struct BuildReport {
    pub outcome: BuildOutcome,
    pub files_found: usize,
    pub files_cached: usize,
    pub files_encoded: usize,
    pub files_failed: usize,
    pub chunks_processed: usize,
    pub total_chunks: usize,
    pub elapsed: Duration,
}

impl BuildReport {
    fn new() -> Self {
        Self {
            outcome: BuildOutcome::Ready,
            files_found: 0,
            files_cached: 0,
            files_encoded: 0,
            files_failed: 0,
            chunks_processed: 0,
            total_chunks: 0,
            elapsed: Duration::ZERO,
        }
    }
}

/// Progress events emitted during a build.
#[derive(Debug, Clone)]
pub enum ProgressEvent<'a> {
    /// Scanning one of the selected folders.
    Scanning {
        folder_index: usize,
        folder_count: usize,
        folder: &'a Path,
        files_seen: usize,
    },
    /// Cache lookup finished.
    Reconciled {
        cached: usize,
        pending: usize,
        resumed_from_chunk: usize,
    },
    /// Available memory is below the warning floor.
    LowMemory { available_gb: f64, chunk_size: usize },
    /// A chunk is about to be encoded.
    ChunkStarted {
        chunk: usize,
        total_chunks: usize,
        files: usize,
    },
    /// Encoder progress inside the current chunk.
    Encoding {
        chunk: usize,
        done: usize,
        total: usize,
    },
    Finalizing,
    Finished { outcome: &'a BuildOutcome, images: usize },
}

/// One progress notification. `percent` never decreases within a build.
#[derive(Debug, Clone)]
pub struct Progress<'a> {
    pub percent: u8,
    pub state: BuildState,
    pub event: ProgressEvent<'a>,
}

/// Type alias for progress callback.
pub type ProgressCallback = Box<dyn Fn(Progress<'_>) + Send + Sync>;

/// Everything a build reads or mutates, borrowed from the engine.
pub(crate) struct BuildContext<'a> {
    pub config: &'a Config,
    pub scanner: &'a dyn Scanner,
    pub encoder: &'a dyn Encoder,
    pub memory: &'a dyn MemoryProbe,
    pub cache: &'a Mutex<FingerprintCache>,
    pub checkpoints: &'a CheckpointStore,
    pub snapshot: &'a RwLock<Option<Arc<EmbeddingIndex>>>,
    pub cancel: &'a AtomicBool,
    pub state: &'a Mutex<BuildState>,
}

/// Runs a single build against a [`BuildContext`].
pub(crate) struct IndexBuilder<'a> {
    ctx: BuildContext<'a>,
    policy: MemoryPolicy,
    progress: Option<&'a ProgressCallback>,
    last_percent: Cell<u8>,
}

/// Scanned files with the root folder each came from.
struct ScanResult {
    paths: Vec<PathBuf>,
    sources: HashMap<PathBuf, PathBuf>,
}

impl<'a> IndexBuilder<'a> {
    pub fn new(
        ctx: BuildContext<'a>,
        progress: Option<&'a ProgressCallback>,
    ) -> Self {
        let policy = MemoryPolicy::from_config(ctx.config);
        Self {
            ctx,
            policy,
            progress,
            last_percent: Cell::new(0),
        }
    }

    fn enter(&self, state: BuildState) {
        debug!("Build state -> {:?}", state);
        *self.ctx.state.lock() = state;
    }

    fn emit(&self, percent: u8, event: ProgressEvent<'_>) {
        let percent = percent.min(100).max(self.last_percent.get());
        self.last_percent.set(percent);
        if let Some(callback) = self.progress {
            // The callback may query the engine, so the state lock is released first
            let state = *self.ctx.state.lock();
            callback(Progress {
                percent,
                state,
                event,
            });
        }
    }

    /// Run the build to one of its terminal states.
    pub fn run(&self, request: &BuildRequest) -> Result<BuildReport> {
        let started = Instant::now();
        let folders = dedup_folders(&request.folders);
        if folders.is_empty() {
            return Err(IqError::EmptySelection);
        }
        if folders.len() > self.ctx.config.max_selected_folders {
            return Err(IqError::TooManyFolders {
                count: folders.len(),
                max: self.ctx.config.max_selected_folders,
            });
        }
        let job_key = JobKey::for_folders(&folders);
        info!("Starting build for {} folders (job {})", folders.len(), job_key);

        // Scanning
        self.enter(BuildState::Scanning);
        let scanned = self.scan(&folders, request)?;
        let mut report = BuildReport::new();
        report.files_found = scanned.paths.len();
        info!(
            "Found {} images in {} folders",
            scanned.paths.len(),
            folders.len()
        );

        // Cache reconciliation
        self.enter(BuildState::CacheReconciliation);
        let status = self.policy.sample(self.ctx.memory);
        if !status.can_continue() {
            warn!(
                "Available memory {:.1} GB is below {:.1} GB, build aborted",
                status.available_gb, self.policy.min_gb
            );
            return Ok(self.abort(report, &status, started));
        }

        // Stale entries are dropped at the first cache write, so stopping
        // before any chunk leaves the stored cache as it was
        let (hits, pending) = if request.force_rebuild {
            (HashMap::new(), scanned.paths.clone())
        } else {
            self.ctx.cache.lock().bulk_get(&scanned.paths)
        };
        let mut pruned = false;

        let resume = if request.force_rebuild {
            self.ctx.checkpoints.clear(&job_key);
            None
        } else {
            self.load_resumable(&job_key)
        };

        let mut checkpoint = Checkpoint::new(job_key.clone(), folders.clone(), 0);
        if let Some(previous) = resume {
            let total = previous.processed_files.len();
            checkpoint.processed_chunk_index = previous.processed_chunk_index;
            // Only files whose vectors came back from the cache count as done
            checkpoint.processed_files = previous
                .processed_files
                .into_iter()
                .filter(|p| hits.contains_key(p))
                .collect();
            info!(
                "Resuming from chunk {}: {} files recovered, {} re-queued",
                checkpoint.processed_chunk_index,
                checkpoint.processed_files.len(),
                total - checkpoint.processed_files.len()
            );
        }

        let mut index = EmbeddingIndex::new(folders.clone());
        index.set_scanned_files(scanned.paths.len());
        report.files_cached = hits.len();
        for (path, vector) in hits {
            let folder = scanned.sources.get(&path).cloned().unwrap_or_default();
            index.insert(path, vector, folder);
        }

        let mut chunk_size = self.policy.initial_chunk_size(pending.len(), &status);
        checkpoint.total_chunks =
            checkpoint.processed_chunk_index + pending.len().div_ceil(chunk_size);
        report.total_chunks = checkpoint.total_chunks;

        self.emit(
            RECONCILE_END,
            ProgressEvent::Reconciled {
                cached: report.files_cached,
                pending: pending.len(),
                resumed_from_chunk: checkpoint.processed_chunk_index,
            },
        );
        if status.is_low() {
            self.emit(
                RECONCILE_END,
                ProgressEvent::LowMemory {
                    available_gb: status.available_gb,
                    chunk_size,
                },
            );
        }

        // Chunk processing
        if !pending.is_empty() {
            self.enter(BuildState::ChunkProcessing);
            info!(
                "Encoding {} files in chunks of {} ({} chunks)",
                pending.len(),
                chunk_size,
                checkpoint.total_chunks
            );
            self.ctx.checkpoints.save(&checkpoint);

            let mut cursor = 0;
            while cursor < pending.len() {
                if self.ctx.cancel.load(Ordering::SeqCst) {
                    info!(
                        "Build cancelled after {} chunks",
                        checkpoint.processed_chunk_index
                    );
                    self.suspend(&checkpoint, report.chunks_processed > 0);
                    report.outcome = BuildOutcome::Cancelled;
                    return Ok(self.finish(report, BuildState::Cancelled, index.len(), started));
                }

                let status = self.policy.sample(self.ctx.memory);
                if !status.can_continue() {
                    warn!(
                        "Available memory {:.1} GB fell below {:.1} GB at chunk {}",
                        status.available_gb,
                        self.policy.min_gb,
                        checkpoint.processed_chunk_index + 1
                    );
                    self.suspend(&checkpoint, report.chunks_processed > 0);
                    report.outcome = BuildOutcome::Aborted(AbortReason::InsufficientMemory {
                        available_gb: status.available_gb,
                        required_gb: self.policy.min_gb,
                    });
                    return Ok(self.finish(report, BuildState::Aborted, index.len(), started));
                }
                if status.is_low() {
                    let smaller = self.policy.shrink(chunk_size);
                    if smaller < chunk_size {
                        warn!(
                            "Low memory ({:.1} GB), reducing chunk size from {} to {}",
                            status.available_gb, chunk_size, smaller
                        );
                        chunk_size = smaller;
                    }
                    self.emit(
                        self.chunk_percent(cursor, pending.len()),
                        ProgressEvent::LowMemory {
                            available_gb: status.available_gb,
                            chunk_size,
                        },
                    );
                }

                let remaining = pending.len() - cursor;
                checkpoint.total_chunks =
                    checkpoint.processed_chunk_index + remaining.div_ceil(chunk_size);
                report.total_chunks = checkpoint.total_chunks;

                let end = (cursor + chunk_size).min(pending.len());
                let chunk = &pending[cursor..end];
                let chunk_no = checkpoint.processed_chunk_index + 1;
                self.emit(
                    self.chunk_percent(cursor, pending.len()),
                    ProgressEvent::ChunkStarted {
                        chunk: chunk_no,
                        total_chunks: checkpoint.total_chunks,
                        files: chunk.len(),
                    },
                );
                debug!(
                    "Chunk {}/{}: {} files, {:.1} GB available",
                    chunk_no,
                    checkpoint.total_chunks,
                    chunk.len(),
                    status.available_gb
                );

                let encoded = self.encode_chunk(chunk, chunk_no, cursor, pending.len());
                let merged =
                    self.merge(chunk, encoded, &scanned.sources, &mut index, &mut checkpoint);
                report.files_encoded += merged;
                report.files_failed += chunk.len() - merged;

                cursor = end;
                checkpoint.processed_chunk_index += 1;
                report.chunks_processed += 1;

                if let Err(e) = self.persist_cache(&scanned.paths, &mut pruned) {
                    warn!("Failed to persist cache after chunk {}: {}", chunk_no, e);
                }
                self.ctx.checkpoints.save(&checkpoint);
                self.ctx.encoder.release_buffers();
            }
        }

        // Finalizing
        self.enter(BuildState::Finalizing);
        self.emit(CHUNKS_END, ProgressEvent::Finalizing);
        if let Err(e) = self.persist_cache(&scanned.paths, &mut pruned) {
            warn!("Failed to persist cache: {}", e);
        }
        self.ctx.checkpoints.clear(&job_key);

        index.mark_built();
        let images = index.len();
        *self.ctx.snapshot.write() = Some(Arc::new(index));

        info!(
            "Index built: {} images ({} cached, {} encoded, {} failed)",
            images, report.files_cached, report.files_encoded, report.files_failed
        );
        Ok(self.finish(report, BuildState::Ready, images, started))
    }

    fn scan(&self, folders: &[PathBuf], request: &BuildRequest) -> Result<ScanResult> {
        let options = ScanOptions {
            recursive: request.recursive,
            date_filter: request.date_filter,
        };
        let mut result = ScanResult {
            paths: Vec::new(),
            sources: HashMap::new(),
        };
        let mut first_error = None;
        let mut scanned_any = false;

        for (i, folder) in folders.iter().enumerate() {
            let percent = (i * usize::from(SCAN_END) / folders.len()) as u8;
            self.emit(
                percent,
                ProgressEvent::Scanning {
                    folder_index: i,
                    folder_count: folders.len(),
                    folder,
                    files_seen: 0,
                },
            );
            let on_progress = |files_seen: usize| {
                self.emit(
                    percent,
                    ProgressEvent::Scanning {
                        folder_index: i,
                        folder_count: folders.len(),
                        folder,
                        files_seen,
                    },
                )
            };

            match self.ctx.scanner.scan(folder, &options, Some(&on_progress)) {
                Ok(paths) => {
                    scanned_any = true;
                    for path in paths {
                        // Nested selections: the first folder to list a file owns it
                        if !result.sources.contains_key(&path) {
                            result.sources.insert(path.clone(), folder.clone());
                            result.paths.push(path);
                        }
                    }
                }
                Err(e) => {
                    warn!("Skipping folder {}: {}", folder.display(), e);
                    first_error.get_or_insert(e);
                }
            }
        }

        if result.paths.is_empty() {
            return Err(match first_error {
                Some(e) if !scanned_any => e,
                _ => IqError::NoImagesFound,
            });
        }
        Ok(result)
    }

    /// Load the checkpoint for `key`, discarding it when already complete.
    fn load_resumable(&self, key: &JobKey) -> Option<Checkpoint> {
        let checkpoint = self.ctx.checkpoints.load(key)?;
        if checkpoint.is_stale() {
            info!("Discarding completed checkpoint {}", key);
            self.ctx.checkpoints.clear(key);
            return None;
        }
        Some(checkpoint)
    }

    /// Encode one chunk. A failed encode call is retried once with half the
    /// batch size (never below the chunk floor); a second failure gives up on
    /// the rest of the chunk.
    fn encode_chunk(
        &self,
        chunk: &[PathBuf],
        chunk_no: usize,
        files_before: usize,
        files_total: usize,
    ) -> Vec<EncodedImage> {
        let mut encoded = Vec::with_capacity(chunk.len());
        let mut batch_size = chunk.len();
        let mut retried = false;
        let mut offset = 0;

        while offset < chunk.len() {
            let end = (offset + batch_size).min(chunk.len());
            let batch = &chunk[offset..end];
            let on_progress = |done: usize, _total: usize| {
                self.emit(
                    self.chunk_percent(files_before + offset + done, files_total),
                    ProgressEvent::Encoding {
                        chunk: chunk_no,
                        done: offset + done,
                        total: chunk.len(),
                    },
                )
            };

            match self.ctx.encoder.encode_images(batch, Some(&on_progress)) {
                Ok(images) => {
                    encoded.extend(images);
                    offset = end;
                }
                Err(e) if !retried => {
                    retried = true;
                    batch_size = (batch_size / 2).max(self.policy.min_chunk);
                    warn!(
                        "Encoding chunk {} failed ({}), retrying with {} files per call",
                        chunk_no, e, batch_size
                    );
                }
                Err(e) => {
                    warn!(
                        "Encoding chunk {} failed again ({}), skipping its last {} files",
                        chunk_no,
                        e,
                        chunk.len() - offset
                    );
                    break;
                }
            }
        }
        encoded
    }

    /// Add encoded vectors to the index, the cache and the checkpoint.
    /// Returns how many files of `chunk` got a vector.
    fn merge(
        &self,
        chunk: &[PathBuf],
        encoded: Vec<EncodedImage>,
        sources: &HashMap<PathBuf, PathBuf>,
        index: &mut EmbeddingIndex,
        checkpoint: &mut Checkpoint,
    ) -> usize {
        let expected: HashSet<&Path> = chunk.iter().map(PathBuf::as_path).collect();
        let mut cache = self.ctx.cache.lock();
        let mut merged = 0;

        for image in encoded {
            if !expected.contains(image.path.as_path()) || index.contains(&image.path) {
                warn!("Ignoring unexpected vector for {}", image.path.display());
                continue;
            }
            if let Err(e) = cache.put(&image.path, image.vector.clone()) {
                warn!("Failed to cache {}: {}", image.path.display(), e);
            }
            let folder = sources.get(&image.path).cloned().unwrap_or_default();
            checkpoint.processed_files.push(image.path.clone());
            index.insert(image.path, image.vector, folder);
            merged += 1;
        }

        if merged < chunk.len() {
            warn!("{} files in this chunk produced no vector", chunk.len() - merged);
        }
        merged
    }

    /// Drop entries outside `scanned` on the first write of this build, then
    /// write the cache to disk.
    fn persist_cache(&self, scanned: &[PathBuf], pruned: &mut bool) -> Result<()> {
        let mut cache = self.ctx.cache.lock();
        if !*pruned {
            cache.invalidate_missing(scanned);
            *pruned = true;
        }
        cache.persist()
    }

    /// Save progress before stopping early. The cache is written only once a
    /// chunk has landed in it.
    fn suspend(&self, checkpoint: &Checkpoint, chunks_done: bool) {
        if chunks_done {
            if let Err(e) = self.ctx.cache.lock().persist() {
                warn!("Failed to persist cache: {}", e);
            }
        }
        self.ctx.checkpoints.save(checkpoint);
    }

    fn abort(
        &self,
        mut report: BuildReport,
        status: &MemoryStatus,
        started: Instant,
    ) -> BuildReport {
        report.outcome = BuildOutcome::Aborted(AbortReason::InsufficientMemory {
            available_gb: status.available_gb,
            required_gb: self.policy.min_gb,
        });
        self.finish(report, BuildState::Aborted, 0, started)
    }

    fn finish(
        &self,
        mut report: BuildReport,
        state: BuildState,
        images: usize,
        started: Instant,
    ) -> BuildReport {
        self.enter(state);
        report.elapsed = started.elapsed();
        let percent = if state == BuildState::Ready { 100 } else { 0 };
        self.emit(
            percent,
            ProgressEvent::Finished {
                outcome: &report.outcome,
                images,
            },
        );
        report
    }

    fn chunk_percent(&self, files_done: usize, files_total: usize) -> u8 {
        if files_total == 0 {
            return RECONCILE_END;
        }
        let span = usize::from(CHUNKS_END - RECONCILE_END);
        RECONCILE_END + (files_done.min(files_total) * span / files_total) as u8
    }
}

/// Remove repeated folders, keeping the first occurrence.
fn dedup_folders(folders: &[PathBuf]) -> Vec<PathBuf> {
    let mut seen = HashSet::new();
    folders
        .iter()
        .filter(|f| seen.insert(f.as_path()))
        .cloned()
        .collect()
}
