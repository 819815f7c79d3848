//! Per-job progress records that let an interrupted build resume.
//!
//! Checkpointing is an optimization: write failures are logged and never
//! fail the build, and unreadable records read as absent.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::STORE_VERSION;
use crate::discover::write_atomic;

const FILE_PREFIX: &str = "progress_";
const FILE_SUFFIX: &str = ".json";

/// Stable identifier of a folder selection.
///
/// Derived from the sorted, de-duplicated root folders, so the same
/// selection in any order maps to the same job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobKey(String);

impl JobKey {
    pub fn for_folders(folders: &[PathBuf]) -> Self {
        let mut sorted: Vec<&Path> = folders.iter().map(PathBuf::as_path).collect();
        sorted.sort();
        sorted.dedup();

        let mut hasher = blake3::Hasher::new();
        for (i, folder) in sorted.iter().enumerate() {
            if i > 0 {
                hasher.update(b"|");
            }
            hasher.update(folder.as_os_str().as_encoded_bytes());
        }
        Self(hasher.finalize().to_hex().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Durable record of how far a build got.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    #[serde(default = "current_version")]
    pub version: u32,
    pub job_key: JobKey,
    /// Root folders of the job, for display
    pub folders: Vec<PathBuf>,
    /// Number of chunks completed
    pub processed_chunk_index: usize,
    pub total_chunks: usize,
    /// Files encoded so far, in processing order
    pub processed_files: Vec<PathBuf>,
    pub saved_at: DateTime<Utc>,
}

fn current_version() -> u32 {
    STORE_VERSION
}

impl Checkpoint {
    pub fn new(job_key: JobKey, folders: Vec<PathBuf>, total_chunks: usize) -> Self {
        Self {
            version: STORE_VERSION,
            job_key,
            folders,
            processed_chunk_index: 0,
            total_chunks,
            processed_files: Vec::new(),
            saved_at: Utc::now(),
        }
    }

    /// A checkpoint that already covers every chunk cannot be resumed.
    pub fn is_stale(&self) -> bool {
        self.processed_chunk_index >= self.total_chunks
    }
}

/// Directory of checkpoint records, one file per job key.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, key: &JobKey) -> PathBuf {
        self.dir
            .join(format!("{}{}{}", FILE_PREFIX, key.as_str(), FILE_SUFFIX))
    }

    /// Write `checkpoint`, replacing any earlier record for its job.
    ///
    /// Returns whether the write succeeded.
    pub fn save(&self, checkpoint: &Checkpoint) -> bool {
        let mut record = checkpoint.clone();
        record.version = STORE_VERSION;
        record.saved_at = Utc::now();

        let result = serde_json::to_vec(&record)
            .map_err(std::io::Error::from)
            .and_then(|bytes| write_atomic(&self.path_for(&record.job_key), &bytes));

        match result {
            Ok(()) => {
                debug!(
                    "Saved checkpoint {}: {}/{} chunks",
                    record.job_key, record.processed_chunk_index, record.total_chunks
                );
                true
            }
            Err(e) => {
                warn!("Failed to save checkpoint {}: {}", record.job_key, e);
                false
            }
        }
    }

    pub fn load(&self, key: &JobKey) -> Option<Checkpoint> {
        let path = self.path_for(key);
        if !path.exists() {
            return None;
        }
        let checkpoint = read_record(&path)?;
        if &checkpoint.job_key != key {
            warn!("Checkpoint {} belongs to another job, ignoring", path.display());
            return None;
        }
        info!(
            "Loaded checkpoint: {}/{} chunks",
            checkpoint.processed_chunk_index, checkpoint.total_chunks
        );
        Some(checkpoint)
    }

    pub fn clear(&self, key: &JobKey) {
        let path = self.path_for(key);
        if !path.exists() {
            return;
        }
        match std::fs::remove_file(&path) {
            Ok(()) => debug!("Cleared checkpoint {}", key),
            Err(e) => warn!("Failed to clear checkpoint {}: {}", key, e),
        }
    }

    /// All readable checkpoints in the store.
    pub fn list(&self) -> Vec<Checkpoint> {
        self.record_files()
            .iter()
            .filter_map(|path| read_record(path))
            .collect()
    }

    /// Delete checkpoints saved longer than `max_age` ago, and unreadable ones.
    ///
    /// Returns the number of records removed.
    pub fn prune_older_than(&self, max_age: chrono::Duration) -> usize {
        let cutoff = Utc::now() - max_age;
        let mut removed = 0;

        for path in self.record_files() {
            let expired = match read_record(&path) {
                Some(checkpoint) => checkpoint.saved_at < cutoff,
                None => true,
            };
            if !expired {
                continue;
            }
            match std::fs::remove_file(&path) {
                Ok(()) => {
                    info!("Removed old checkpoint {}", path.display());
                    removed += 1;
                }
                Err(e) => warn!("Failed to remove checkpoint {}: {}", path.display(), e),
            }
        }
        removed
    }

    fn record_files(&self) -> Vec<PathBuf> {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(FILE_PREFIX) && n.ends_with(FILE_SUFFIX))
            })
            .collect()
    }
}

fn read_record(path: &Path) -> Option<Checkpoint> {
    let parsed = std::fs::read(path)
        .map_err(|e| e.to_string())
        .and_then(|bytes| serde_json::from_slice::<Checkpoint>(&bytes).map_err(|e| e.to_string()));

    match parsed {
        Ok(checkpoint) if checkpoint.version == STORE_VERSION => Some(checkpoint),
        Ok(checkpoint) => {
            warn!(
                "Unsupported checkpoint version {} in {}",
                checkpoint.version,
                path.display()
            );
            None
        }
        Err(e) => {
            warn!("Unreadable checkpoint {}: {}", path.display(), e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn folders(names: &[&str]) -> Vec<PathBuf> {
        names.iter().map(PathBuf::from).collect()
    }

    #[test]
    fn test_job_key_ignores_order_and_duplicates() {
        let a = JobKey::for_folders(&folders(&["/photos/2023", "/photos/2024"]));
        let b = JobKey::for_folders(&folders(&["/photos/2024", "/photos/2023", "/photos/2024"]));
        let c = JobKey::for_folders(&folders(&["/photos/2024"]));

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_save_load_clear() {
        let temp = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(temp.path().join("checkpoints"));
        let key = JobKey::for_folders(&folders(&["/a"]));

        let mut checkpoint = Checkpoint::new(key.clone(), folders(&["/a"]), 4);
        checkpoint.processed_chunk_index = 1;
        checkpoint.processed_files = folders(&["/a/1.jpg", "/a/2.jpg"]);
        assert!(store.save(&checkpoint));

        let loaded = store.load(&key).unwrap();
        assert_eq!(loaded.processed_chunk_index, 1);
        assert_eq!(loaded.total_chunks, 4);
        assert_eq!(loaded.processed_files, checkpoint.processed_files);
        assert!(!loaded.is_stale());

        store.clear(&key);
        assert!(store.load(&key).is_none());
    }

    #[test]
    fn test_last_write_wins() {
        let temp = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(temp.path());
        let key = JobKey::for_folders(&folders(&["/a"]));

        let mut checkpoint = Checkpoint::new(key.clone(), vec![], 3);
        store.save(&checkpoint);
        checkpoint.processed_chunk_index = 3;
        store.save(&checkpoint);

        assert!(store.load(&key).unwrap().is_stale());
        assert_eq!(store.list().len(), 1);
    }

    #[test]
    fn test_corrupt_record_reads_as_absent() {
        let temp = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(temp.path());
        let key = JobKey::for_folders(&folders(&["/a"]));
        std::fs::write(store.path_for(&key), b"garbage").unwrap();

        assert!(store.load(&key).is_none());
    }

    #[test]
    fn test_save_failure_is_not_fatal() {
        let temp = tempfile::tempdir().unwrap();
        let blocker = temp.path().join("not-a-dir");
        std::fs::write(&blocker, b"").unwrap();
        let store = CheckpointStore::new(&blocker);

        let key = JobKey::for_folders(&folders(&["/a"]));
        assert!(!store.save(&Checkpoint::new(key, vec![], 1)));
    }

    #[test]
    fn test_prune_removes_old_and_corrupt() {
        let temp = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(temp.path());

        let fresh = JobKey::for_folders(&folders(&["/fresh"]));
        store.save(&Checkpoint::new(fresh.clone(), vec![], 2));

        let old = JobKey::for_folders(&folders(&["/old"]));
        let mut record = Checkpoint::new(old.clone(), vec![], 2);
        record.saved_at = Utc::now() - chrono::Duration::days(30);
        std::fs::write(store.path_for(&old), serde_json::to_vec(&record).unwrap()).unwrap();

        let broken = JobKey::for_folders(&folders(&["/broken"]));
        std::fs::write(store.path_for(&broken), b"{").unwrap();

        let removed = store.prune_older_than(chrono::Duration::days(7));

        assert_eq!(removed, 2);
        assert!(store.load(&fresh).is_some());
        assert!(store.load(&old).is_none());
    }
}
