//! File fingerprints used to decide whether a cached vector is still valid

use std::fmt;
use std::io::Read;
use std::path::Path;
use std::time::UNIX_EPOCH;

use serde::{Deserialize, Serialize};

/// How a file's fingerprint is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FingerprintMode {
    /// Path, size and modification time. No file content is read.
    #[default]
    Metadata,
    /// Size plus a blake3 digest of the file content.
    Content,
}

/// Cheap identity signature of a file at one point in time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

/// Stat data captured alongside a fingerprint.
#[derive(Debug, Clone, Copy)]
pub struct FileStamp {
    pub size: u64,
    /// Nanoseconds since the unix epoch, 0 when unavailable
    pub modified_ns: u128,
}

impl FileStamp {
    /// Stat `path`.
    pub fn read(path: &Path) -> std::io::Result<Self> {
        let metadata = std::fs::metadata(path)?;
        let modified_ns = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        Ok(Self {
            size: metadata.len(),
            modified_ns,
        })
    }
}

impl Fingerprint {
    /// Compute the live fingerprint of `path`.
    pub fn compute(path: &Path, mode: FingerprintMode) -> std::io::Result<(Self, FileStamp)> {
        let stamp = FileStamp::read(path)?;
        let mut hasher = blake3::Hasher::new();

        match mode {
            FingerprintMode::Metadata => {
                hasher.update(path.as_os_str().as_encoded_bytes());
                hasher.update(&stamp.size.to_le_bytes());
                hasher.update(&stamp.modified_ns.to_le_bytes());
            }
            FingerprintMode::Content => {
                hasher.update(&stamp.size.to_le_bytes());
                let mut file = std::fs::File::open(path)?;
                let mut buf = [0u8; 64 * 1024];
                loop {
                    let n = file.read(&mut buf)?;
                    if n == 0 {
                        break;
                    }
                    hasher.update(&buf[..n]);
                }
            }
        }

        Ok((Self(hasher.finalize().to_hex().to_string()), stamp))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::{Duration, SystemTime};

    #[test]
    fn test_stable_across_calls() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("a.jpg");
        fs::write(&path, b"pixels").unwrap();

        let (a, _) = Fingerprint::compute(&path, FingerprintMode::Metadata).unwrap();
        let (b, _) = Fingerprint::compute(&path, FingerprintMode::Metadata).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_mtime_change_alters_metadata_fingerprint() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("a.jpg");
        fs::write(&path, b"pixels").unwrap();

        let (before, _) = Fingerprint::compute(&path, FingerprintMode::Metadata).unwrap();
        let file = fs::File::options().write(true).open(&path).unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(120))
            .unwrap();
        let (after, _) = Fingerprint::compute(&path, FingerprintMode::Metadata).unwrap();

        assert_ne!(before, after);
    }

    #[test]
    fn test_content_mode_sees_same_size_edit() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("a.png");
        fs::write(&path, b"aaaa").unwrap();
        let (before, stamp) = Fingerprint::compute(&path, FingerprintMode::Content).unwrap();

        fs::write(&path, b"bbbb").unwrap();
        let file = fs::File::options().write(true).open(&path).unwrap();
        let original = UNIX_EPOCH + Duration::from_nanos(stamp.modified_ns as u64);
        file.set_modified(original).unwrap();

        let (after, _) = Fingerprint::compute(&path, FingerprintMode::Content).unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn test_missing_file_is_error() {
        let temp = tempfile::tempdir().unwrap();
        let result = Fingerprint::compute(&temp.path().join("gone.jpg"), FingerprintMode::Metadata);
        assert!(result.is_err());
    }
}
