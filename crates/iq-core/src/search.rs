//! Search functionality over a built index

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::embed::Encoder;
use crate::{IqError, Result};

/// Immutable result of a completed build: path -> vector plus the root
/// folder each path was found under.
#[derive(Debug, Clone)]
pub struct EmbeddingIndex {
    folders: Vec<PathBuf>,
    vectors: HashMap<PathBuf, Vec<f32>>,
    source_folders: HashMap<PathBuf, PathBuf>,
    scanned_files: usize,
    built_at: DateTime<Utc>,
}

impl EmbeddingIndex {
    pub fn new(folders: Vec<PathBuf>) -> Self {
        Self {
            folders,
            vectors: HashMap::new(),
            source_folders: HashMap::new(),
            scanned_files: 0,
            built_at: Utc::now(),
        }
    }

    pub fn insert(&mut self, path: PathBuf, vector: Vec<f32>, folder: PathBuf) {
        self.source_folders.insert(path.clone(), folder);
        self.vectors.insert(path, vector);
    }

    pub(crate) fn set_scanned_files(&mut self, count: usize) {
        self.scanned_files = count;
    }

    pub(crate) fn mark_built(&mut self) {
        self.built_at = Utc::now();
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.vectors.contains_key(path)
    }

    pub fn get(&self, path: &Path) -> Option<&[f32]> {
        self.vectors.get(path).map(Vec::as_slice)
    }

    pub fn paths(&self) -> impl Iterator<Item = &PathBuf> {
        self.vectors.keys()
    }

    /// Root folders of the build that produced this index.
    pub fn folders(&self) -> &[PathBuf] {
        &self.folders
    }

    pub fn source_folder(&self, path: &Path) -> Option<&Path> {
        self.source_folders.get(path).map(PathBuf::as_path)
    }

    /// Number of files the scan found, encoded or not.
    pub fn scanned_files(&self) -> usize {
        self.scanned_files
    }

    pub fn built_at(&self) -> DateTime<Utc> {
        self.built_at
    }

    /// Indexed image count per root folder.
    pub fn folder_counts(&self) -> BTreeMap<PathBuf, usize> {
        let mut counts = BTreeMap::new();
        for path in self.vectors.keys() {
            if let Some(folder) = self.source_folders.get(path) {
                *counts.entry(folder.clone()).or_insert(0) += 1;
            }
        }
        counts
    }
}

/// File details attached to a search hit.
#[derive(Debug, Clone, Serialize)]
pub struct FileInfo {
    pub size_bytes: u64,
    pub modified: Option<DateTime<Utc>>,
    pub source_folder: PathBuf,
    pub folder_name: String,
}

impl FileInfo {
    fn snapshot(path: &Path, source_folder: Option<&Path>) -> Self {
        let metadata = std::fs::metadata(path).ok();
        let source_folder = source_folder
            .or_else(|| path.parent())
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let folder_name = source_folder
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        Self {
            size_bytes: metadata.as_ref().map(|m| m.len()).unwrap_or(0),
            modified: metadata
                .and_then(|m| m.modified().ok())
                .map(DateTime::<Utc>::from),
            source_folder,
            folder_name,
        }
    }
}

/// A search result.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub path: PathBuf,
    /// Cosine similarity with the query
    pub score: f32,
    pub file_info: FileInfo,
}

/// Read-only ranking over one index snapshot.
pub struct QueryEngine {
    index: Option<Arc<EmbeddingIndex>>,
    encoder: Arc<dyn Encoder>,
}

impl QueryEngine {
    pub fn new(index: Option<Arc<EmbeddingIndex>>, encoder: Arc<dyn Encoder>) -> Self {
        Self { index, encoder }
    }

    /// Rank indexed images against `query`.
    ///
    /// Results score at least `similarity_threshold`, are ordered by
    /// descending score (ties by path) and number at most `max_results`.
    pub fn search(
        &self,
        query: &str,
        max_results: usize,
        similarity_threshold: f32,
    ) -> Result<Vec<SearchResult>> {
        let index = self.index.as_ref().ok_or(IqError::IndexNotBuilt)?;
        if query.trim().is_empty() {
            return Err(IqError::EmptyQuery);
        }

        info!("Searching for '{}'", query);
        if index.is_empty() || max_results == 0 {
            return Ok(Vec::new());
        }

        let query_vector = self.encoder.encode_text(query)?;

        let entries: Vec<(&PathBuf, &Vec<f32>)> = index.vectors.iter().collect();
        let matrix: Vec<&[f32]> = entries.iter().map(|(_, v)| v.as_slice()).collect();
        let scores = self.encoder.similarity(&query_vector, &matrix);

        let mut ranked: Vec<(&PathBuf, f32)> = entries
            .iter()
            .zip(scores)
            .filter(|(_, score)| *score >= similarity_threshold)
            .map(|((path, _), score)| (*path, score))
            .collect();

        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        ranked.truncate(max_results);

        let results: Vec<SearchResult> = ranked
            .into_iter()
            .map(|(path, score)| SearchResult {
                path: path.clone(),
                score,
                file_info: FileInfo::snapshot(path, index.source_folder(path)),
            })
            .collect();

        info!("Found {} results", results.len());
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embed::EncodedImage;

    /// Encodes text as a fixed query vector.
    struct FixedQuery(Vec<f32>);

    impl Encoder for FixedQuery {
        fn encode_images(
            &self,
            _paths: &[PathBuf],
            _progress: Option<&dyn Fn(usize, usize)>,
        ) -> Result<Vec<EncodedImage>> {
            Ok(Vec::new())
        }

        fn encode_text(&self, _text: &str) -> Result<Vec<f32>> {
            Ok(self.0.clone())
        }
    }

    fn engine(entries: &[(&str, [f32; 2])]) -> QueryEngine {
        let mut index = EmbeddingIndex::new(vec![PathBuf::from("/photos")]);
        for (name, vector) in entries {
            index.insert(
                PathBuf::from("/photos").join(name),
                vector.to_vec(),
                PathBuf::from("/photos"),
            );
        }
        QueryEngine::new(Some(Arc::new(index)), Arc::new(FixedQuery(vec![1.0, 0.0])))
    }

    fn names(results: &[SearchResult]) -> Vec<String> {
        results
            .iter()
            .map(|r| r.path.file_name().unwrap().to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_ranked_descending_and_thresholded() {
        let engine = engine(&[
            ("low.jpg", [0.05, 0.99]),
            ("best.jpg", [1.0, 0.0]),
            ("mid.jpg", [0.6, 0.8]),
            ("opposite.jpg", [-1.0, 0.0]),
        ]);

        let results = engine.search("a beach", 10, 0.1).unwrap();

        assert_eq!(names(&results), vec!["best.jpg", "mid.jpg"]);
        assert!(results.windows(2).all(|w| w[0].score >= w[1].score));
        assert!(results.iter().all(|r| r.score >= 0.1));
    }

    #[test]
    fn test_truncates_to_max_results() {
        let engine = engine(&[
            ("a.jpg", [0.9, 0.1]),
            ("b.jpg", [0.8, 0.2]),
            ("c.jpg", [0.7, 0.3]),
        ]);

        let results = engine.search("dog", 2, 0.0).unwrap();
        assert_eq!(names(&results), vec!["a.jpg", "b.jpg"]);
    }

    #[test]
    fn test_ties_broken_by_path() {
        let engine = engine(&[
            ("c.jpg", [0.5, 0.0]),
            ("a.jpg", [0.5, 0.0]),
            ("b.jpg", [0.5, 0.0]),
        ]);

        let results = engine.search("x", 10, 0.0).unwrap();
        assert_eq!(names(&results), vec!["a.jpg", "b.jpg", "c.jpg"]);
    }

    #[test]
    fn test_empty_query_rejected() {
        let engine = engine(&[("a.jpg", [1.0, 0.0])]);
        assert!(matches!(engine.search("   ", 5, 0.0), Err(IqError::EmptyQuery)));
    }

    #[test]
    fn test_unbuilt_index_rejected() {
        let engine = QueryEngine::new(None, Arc::new(FixedQuery(vec![1.0])));
        assert!(matches!(engine.search("cat", 5, 0.0), Err(IqError::IndexNotBuilt)));
    }

    #[test]
    fn test_file_info_uses_source_folder() {
        let engine = engine(&[("a.jpg", [1.0, 0.0])]);
        let results = engine.search("x", 1, 0.0).unwrap();

        assert_eq!(results[0].file_info.source_folder, PathBuf::from("/photos"));
        assert_eq!(results[0].file_info.folder_name, "photos");
        assert_eq!(results[0].file_info.size_bytes, 0);
    }

    #[test]
    fn test_folder_counts() {
        let mut index = EmbeddingIndex::new(vec![PathBuf::from("/a"), PathBuf::from("/b")]);
        index.insert("/a/1.jpg".into(), vec![1.0], "/a".into());
        index.insert("/a/2.jpg".into(), vec![1.0], "/a".into());
        index.insert("/b/1.jpg".into(), vec![1.0], "/b".into());

        let counts = index.folder_counts();
        assert_eq!(counts[Path::new("/a")], 2);
        assert_eq!(counts[Path::new("/b")], 1);
    }
}
