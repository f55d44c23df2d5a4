//! Content checksums of workspace files, memoized per modification time.

use crate::error::{Result, SyncError};
use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// blake3 digest of a file, hex encoded.
pub fn file_checksum(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = blake3::Hasher::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize().as_bytes()))
}

#[derive(Debug, Default)]
pub struct ChecksumCache {
    entries: HashMap<PathBuf, (SystemTime, String)>,
}

impl ChecksumCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Checksum of `path`, recomputed only when its mtime moved.
    pub async fn get(&mut self, path: &Path) -> Result<String> {
        let modified = tokio::fs::metadata(path).await?.modified()?;
        if let Some((seen, checksum)) = self.entries.get(path) {
            if *seen == modified {
                return Ok(checksum.clone());
            }
        }
        let owned = path.to_path_buf();
        let checksum = tokio::task::spawn_blocking(move || file_checksum(&owned))
            .await
            .map_err(|e| SyncError::Io(io::Error::new(io::ErrorKind::Other, e)))??;
        self.entries
            .insert(path.to_path_buf(), (modified, checksum.clone()));
        Ok(checksum)
    }

    pub fn forget(&mut self, path: &Path) {
        self.entries.remove(path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::FileTime;
    use tempfile::TempDir;

    #[test]
    fn test_known_digest() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("a");
        std::fs::write(&path, b"abc").unwrap();
        assert_eq!(
            file_checksum(&path).unwrap(),
            blake3::hash(b"abc").to_hex().to_string()
        );
    }

    #[tokio::test]
    async fn test_cache_follows_mtime() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("a");
        std::fs::write(&path, b"one").unwrap();
        filetime::set_file_mtime(&path, FileTime::from_unix_time(1_000_000, 0)).unwrap();

        let mut cache = ChecksumCache::new();
        let first = cache.get(&path).await.unwrap();
        assert_eq!(cache.len(), 1);

        // Same mtime: the memoized value is returned even though bytes changed
        std::fs::write(&path, b"two").unwrap();
        filetime::set_file_mtime(&path, FileTime::from_unix_time(1_000_000, 0)).unwrap();
        assert_eq!(cache.get(&path).await.unwrap(), first);

        filetime::set_file_mtime(&path, FileTime::from_unix_time(2_000_000, 0)).unwrap();
        let second = cache.get(&path).await.unwrap();
        assert_ne!(second, first);

        cache.forget(&path);
        assert!(cache.is_empty());
    }
}
