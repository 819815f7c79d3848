//! Folder scanning: find image files under a root

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use ignore::WalkBuilder;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{Config, IqError, Result};

/// Restrict a scan to recently modified files.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum DateFilter {
    ModifiedWithinDays(u32),
    ModifiedSince(DateTime<Utc>),
}

impl DateFilter {
    fn threshold(&self) -> DateTime<Utc> {
        match *self {
            DateFilter::ModifiedWithinDays(days) => {
                Utc::now() - chrono::Duration::days(i64::from(days))
            }
            DateFilter::ModifiedSince(since) => since,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    pub recursive: bool,
    pub date_filter: Option<DateFilter>,
}

/// Enumerates the image files below one root folder.
pub trait Scanner: Send + Sync {
    /// List matching files under `root`.
    ///
    /// Fails with [`IqError::DirectoryNotFound`] or [`IqError::NotADirectory`]
    /// when `root` is unusable. `progress` receives the number of entries
    /// examined so far.
    fn scan(
        &self,
        root: &Path,
        options: &ScanOptions,
        progress: Option<&dyn Fn(usize)>,
    ) -> Result<Vec<PathBuf>>;
}

/// Filesystem scanner filtering by extension and modification date.
#[derive(Debug, Clone)]
pub struct FsScanner {
    extensions: Vec<String>,
}

impl FsScanner {
    pub fn new(extensions: &[String]) -> Self {
        Self {
            extensions: extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_lowercase())
                .collect(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.image_extensions)
    }

    /// Check if a path has one of the configured image extensions.
    pub fn is_image(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .is_some_and(|ext| self.extensions.iter().any(|e| *e == ext))
    }
}

fn passes_date_filter(path: &Path, threshold: Option<DateTime<Utc>>) -> bool {
    let Some(threshold) = threshold else {
        return true;
    };
    // Files whose date cannot be read are kept
    match std::fs::metadata(path).and_then(|m| m.modified()) {
        Ok(modified) => DateTime::<Utc>::from(modified) >= threshold,
        Err(_) => true,
    }
}

impl Scanner for FsScanner {
    fn scan(
        &self,
        root: &Path,
        options: &ScanOptions,
        progress: Option<&dyn Fn(usize)>,
    ) -> Result<Vec<PathBuf>> {
        if !root.exists() {
            return Err(IqError::DirectoryNotFound(root.to_path_buf()));
        }
        if !root.is_dir() {
            return Err(IqError::NotADirectory(root.to_path_buf()));
        }

        info!("Scanning {}", root.display());
        let threshold = options.date_filter.map(|f| f.threshold());

        let walker = WalkBuilder::new(root)
            .standard_filters(false)
            .hidden(true) // Skip hidden files
            .follow_links(false)
            .max_depth(if options.recursive { None } else { Some(1) })
            .build();

        let mut images = Vec::new();
        let mut examined = 0usize;

        for entry in walker.flatten() {
            if !entry.file_type().is_some_and(|t| t.is_file()) {
                continue;
            }

            examined += 1;
            if examined % 100 == 0 {
                if let Some(progress) = progress {
                    progress(examined);
                }
            }

            let path = entry.path();
            if self.is_image(path) && passes_date_filter(path, threshold) {
                images.push(path.to_path_buf());
            }
        }

        images.sort();
        debug!("Examined {} files in {}", examined, root.display());
        info!("Found {} images in {}", images.len(), root.display());
        Ok(images)
    }
}
