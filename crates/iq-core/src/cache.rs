//! Persistent path -> embedding cache, validated by file fingerprints.
//!
//! Two stores back the cache: `vectors.bin` (bincode) holds the vectors and
//! `metadata.json` holds fingerprint, cache time and file size per path. Both
//! carry a schema version. A store that cannot be read, or whose version is
//! unknown, resets the whole cache to empty; the next build is then a cold
//! start instead of a failure.

use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::discover::{StoreLayout, write_atomic};
use crate::fingerprint::{Fingerprint, FingerprintMode};
use crate::{IqError, Result, STORE_VERSION};

/// One cached vector and the file identity it was computed from.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub vector: Vec<f32>,
    pub fingerprint: Fingerprint,
    pub cached_at: DateTime<Utc>,
    pub file_size_bytes: u64,
}

/// Read-only cache introspection.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub entry_count: usize,
    /// Sum of the source file sizes
    pub total_bytes: u64,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
    pub vectors_file_exists: bool,
    pub metadata_file_exists: bool,
}

#[derive(Serialize, Deserialize)]
struct VectorStore<'a> {
    version: u32,
    records: Vec<VectorRecord<'a>>,
}

#[derive(Serialize, Deserialize)]
struct VectorRecord<'a> {
    path: Cow<'a, Path>,
    vector: Cow<'a, [f32]>,
}

#[derive(Serialize, Deserialize)]
struct MetadataStore<'a> {
    version: u32,
    records: Vec<MetadataRecord<'a>>,
}

#[derive(Serialize, Deserialize)]
struct MetadataRecord<'a> {
    path: Cow<'a, Path>,
    fingerprint: Cow<'a, Fingerprint>,
    cached_at: DateTime<Utc>,
    file_size: u64,
}

/// Fingerprint-validated embedding cache.
pub struct FingerprintCache {
    vectors_path: PathBuf,
    metadata_path: PathBuf,
    mode: FingerprintMode,
    entries: HashMap<PathBuf, CacheEntry>,
}

impl FingerprintCache {
    /// Open the cache stored under `layout`, loading whatever is on disk.
    pub fn open(layout: &StoreLayout, mode: FingerprintMode) -> Self {
        let mut cache = Self {
            vectors_path: layout.vectors.clone(),
            metadata_path: layout.metadata.clone(),
            mode,
            entries: HashMap::new(),
        };
        cache.load();
        cache
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Every cached path, fresh or not.
    pub fn paths(&self) -> impl Iterator<Item = &PathBuf> {
        self.entries.keys()
    }

    /// Return the cached vector for `path` if the file is unchanged since it was cached.
    pub fn get(&self, path: &Path) -> Option<&[f32]> {
        let entry = self.entries.get(path)?;
        let (live, _) = Fingerprint::compute(path, self.mode).ok()?;
        (live == entry.fingerprint).then_some(entry.vector.as_slice())
    }

    /// Store `vector` for `path` under the file's current fingerprint.
    pub fn put(&mut self, path: &Path, vector: Vec<f32>) -> std::io::Result<()> {
        let (fingerprint, stamp) = Fingerprint::compute(path, self.mode)?;
        self.entries.insert(
            path.to_path_buf(),
            CacheEntry {
                vector,
                fingerprint,
                cached_at: Utc::now(),
                file_size_bytes: stamp.size,
            },
        );
        Ok(())
    }

    /// Split `paths` into valid cache hits and paths that need encoding.
    pub fn bulk_get(&self, paths: &[PathBuf]) -> (HashMap<PathBuf, Vec<f32>>, Vec<PathBuf>) {
        let mut hits = HashMap::new();
        let mut misses = Vec::new();

        for path in paths {
            match self.get(path) {
                Some(vector) => {
                    hits.insert(path.clone(), vector.to_vec());
                }
                None => misses.push(path.clone()),
            }
        }

        info!(
            "Cache lookup: {} cached, {} need encoding",
            hits.len(),
            misses.len()
        );
        (hits, misses)
    }

    /// Drop every entry outside `valid_paths` or whose file is gone.
    ///
    /// Returns the number of entries removed.
    pub fn invalidate_missing(&mut self, valid_paths: &[PathBuf]) -> usize {
        let valid: HashSet<&Path> = valid_paths.iter().map(PathBuf::as_path).collect();
        let before = self.entries.len();

        self.entries
            .retain(|path, _| valid.contains(path.as_path()) && path.exists());

        let removed = before - self.entries.len();
        if removed > 0 {
            info!("Removed {} invalid cache entries", removed);
        }
        removed
    }

    /// Write the whole cache to disk.
    pub fn persist(&self) -> Result<()> {
        let mut vector_records = Vec::with_capacity(self.entries.len());
        let mut metadata_records = Vec::with_capacity(self.entries.len());

        for (path, entry) in &self.entries {
            vector_records.push(VectorRecord {
                path: Cow::Borrowed(path.as_path()),
                vector: Cow::Borrowed(entry.vector.as_slice()),
            });
            metadata_records.push(MetadataRecord {
                path: Cow::Borrowed(path.as_path()),
                fingerprint: Cow::Borrowed(&entry.fingerprint),
                cached_at: entry.cached_at,
                file_size: entry.file_size_bytes,
            });
        }

        let vectors = bincode::serialize(&VectorStore {
            version: STORE_VERSION,
            records: vector_records,
        })
        .map_err(|e| IqError::Storage(e.to_string()))?;
        let metadata = serde_json::to_vec(&MetadataStore {
            version: STORE_VERSION,
            records: metadata_records,
        })?;

        write_atomic(&self.vectors_path, &vectors)?;
        write_atomic(&self.metadata_path, &metadata)?;

        debug!("Cache persisted: {} entries", self.entries.len());
        Ok(())
    }

    /// Replace the in-memory cache with what is on disk.
    ///
    /// Missing stores yield an empty cache; unreadable ones are discarded.
    /// Returns the number of entries loaded.
    pub fn load(&mut self) -> usize {
        self.entries.clear();

        if !self.vectors_path.exists() && !self.metadata_path.exists() {
            return 0;
        }

        match self.read_stores() {
            Ok(entries) => {
                self.entries = entries;
                info!("Loaded {} cached embeddings", self.entries.len());
            }
            Err(e) => {
                warn!("Cache store unreadable, starting empty: {}", e);
            }
        }
        self.entries.len()
    }

    fn read_stores(&self) -> Result<HashMap<PathBuf, CacheEntry>> {
        let vector_bytes = std::fs::read(&self.vectors_path)?;
        let vectors: VectorStore<'static> = bincode::deserialize(&vector_bytes)
            .map_err(|e| IqError::Storage(format!("vectors store: {}", e)))?;
        if vectors.version != STORE_VERSION {
            return Err(IqError::Storage(format!(
                "unsupported vectors store version {}",
                vectors.version
            )));
        }

        let metadata_bytes = std::fs::read(&self.metadata_path)?;
        let metadata: MetadataStore<'static> = serde_json::from_slice(&metadata_bytes)?;
        if metadata.version != STORE_VERSION {
            return Err(IqError::Storage(format!(
                "unsupported metadata store version {}",
                metadata.version
            )));
        }

        let mut meta_by_path: HashMap<PathBuf, MetadataRecord<'static>> = metadata
            .records
            .into_iter()
            .map(|r| (r.path.clone().into_owned(), r))
            .collect();

        let mut entries = HashMap::with_capacity(vectors.records.len());
        let mut orphans = 0usize;
        for record in vectors.records {
            let path = record.path.into_owned();
            match meta_by_path.remove(&path) {
                Some(meta) => {
                    entries.insert(
                        path,
                        CacheEntry {
                            vector: record.vector.into_owned(),
                            fingerprint: meta.fingerprint.into_owned(),
                            cached_at: meta.cached_at,
                            file_size_bytes: meta.file_size,
                        },
                    );
                }
                None => orphans += 1,
            }
        }
        orphans += meta_by_path.len();
        if orphans > 0 {
            warn!("Dropped {} cache records present in only one store", orphans);
        }

        Ok(entries)
    }

    /// Empty the cache and delete both stores.
    pub fn clear(&mut self) {
        self.entries.clear();
        for path in [&self.vectors_path, &self.metadata_path] {
            if path.exists() {
                match std::fs::remove_file(path) {
                    Ok(()) => info!("Removed cache file {}", path.display()),
                    Err(e) => warn!("Failed to remove cache file {}: {}", path.display(), e),
                }
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats {
            entry_count: self.entries.len(),
            vectors_file_exists: self.vectors_path.exists(),
            metadata_file_exists: self.metadata_path.exists(),
            ..CacheStats::default()
        };

        for entry in self.entries.values() {
            stats.total_bytes += entry.file_size_bytes;
            if stats.oldest.is_none_or(|t| entry.cached_at < t) {
                stats.oldest = Some(entry.cached_at);
            }
            if stats.newest.is_none_or(|t| entry.cached_at > t) {
                stats.newest = Some(entry.cached_at);
            }
        }
        stats
    }
}
