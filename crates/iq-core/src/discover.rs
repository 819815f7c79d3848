//! Discovery module: find the .iq root and name the files inside it

use std::path::{Path, PathBuf};

use crate::{IQ_DIR, IqError, Result};

/// Find the .iq root directory by walking up from the given path.
///
/// Returns the path to the directory containing .iq (not the .iq folder itself).
pub fn find_iq_root(start: &Path) -> Result<PathBuf> {
    let mut current = start.canonicalize()?;

    loop {
        let iq_path = current.join(IQ_DIR);
        if iq_path.is_dir() {
            return Ok(current);
        }

        match current.parent() {
            Some(parent) => current = parent.to_path_buf(),
            None => return Err(IqError::NotInRepo),
        }
    }
}

/// Get the .iq directory path for a given root.
pub fn iq_dir(root: &Path) -> PathBuf {
    root.join(IQ_DIR)
}

/// Get the config file path.
pub fn config_path(root: &Path) -> PathBuf {
    iq_dir(root).join("config.json")
}

/// Locations of every persisted store.
#[derive(Debug, Clone)]
pub struct StoreLayout {
    /// path -> vector
    pub vectors: PathBuf,
    /// path -> fingerprint, cached_at, size
    pub metadata: PathBuf,
    /// One progress record per job key
    pub checkpoints: PathBuf,
    /// Folder selection of the last successful build
    pub last_folders: PathBuf,
}

impl StoreLayout {
    /// Layout inside the .iq directory of `root`.
    pub fn new(root: &Path) -> Self {
        Self::in_dir(&iq_dir(root))
    }

    /// Layout rooted directly at `dir`.
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            vectors: dir.join("vectors.bin"),
            metadata: dir.join("metadata.json"),
            checkpoints: dir.join("checkpoints"),
            last_folders: dir.join("last_folders.json"),
        }
    }
}

/// Write `bytes` to a temporary sibling of `path`, then rename it into place.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_find_iq_root() {
        let temp = tempfile::tempdir().unwrap();

        let nested = temp.path().join("a").join("b").join("c");
        fs::create_dir_all(&nested).unwrap();
        fs::create_dir_all(temp.path().join(IQ_DIR)).unwrap();

        let found = find_iq_root(&nested).unwrap();
        assert_eq!(found, temp.path().canonicalize().unwrap());
    }

    #[test]
    fn test_not_in_repo() {
        let temp = tempfile::tempdir().unwrap();

        let result = find_iq_root(temp.path());
        assert!(matches!(result, Err(IqError::NotInRepo)));
    }

    #[test]
    fn test_write_atomic_replaces_content() {
        let temp = tempfile::tempdir().unwrap();
        let target = temp.path().join("nested").join("store.json");

        write_atomic(&target, b"first").unwrap();
        write_atomic(&target, b"second").unwrap();

        assert_eq!(fs::read(&target).unwrap(), b"second");
        assert!(!temp.path().join("nested").join("store.json.tmp").exists());
    }
}
