//! Relay on a locally mounted directory (NFS, SMB, cloud-drive mounts, or a
//! plain directory for tests).

use super::{Backend, RemoteEntry, StorageSpace};
use crate::config::RepositoryConfig;
use crate::error::{Result, SyncError};
use crate::relay::{PARTIAL_SUFFIX, TEMP_PREFIX};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

/// Prefix/suffix of in-flight uploads; hidden from listings.

const MB: f64 = 1024.0 * 1024.0;

pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn from_config(config: &RepositoryConfig) -> Result<Arc<dyn Backend>> {
        if config.address.is_empty() {
            return Err(SyncError::Config(format!(
                "repository '{}': local protocol needs an address",
                config.name
            )));
        }
        Ok(Arc::new(Self::new(&config.address)?))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a relay path under the root, refusing anything that escapes it.
    fn resolve(&self, relative: &str) -> Result<PathBuf> {
        let rel_path = Path::new(relative);
        if rel_path.is_absolute() {
            return Err(SyncError::backend(relative, "absolute paths not allowed"));
        }
        for component in rel_path.components() {
            match component {
                Component::ParentDir | Component::Prefix(_) | Component::RootDir => {
                    return Err(SyncError::backend(relative, "path escapes relay root"));
                }
                _ => {}
            }
        }
        Ok(self.root.join(rel_path))
    }

    fn is_part_file(name: &str) -> bool {
        name.starts_with(TEMP_PREFIX) && name.ends_with(PARTIAL_SUFFIX)
    }

    fn walk(root: &Path, start: &Path, recursive: bool) -> Result<Vec<RemoteEntry>> {
        let mut builder = ignore::WalkBuilder::new(start);
        builder
            .standard_filters(false)
            .hidden(false)
            .follow_links(false);
        if !recursive {
            builder.max_depth(Some(1));
        }

        let mut entries = Vec::new();
        for result in builder.build() {
            let entry = result.map_err(|e| SyncError::backend(start.display().to_string(), e))?;
            if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if Self::is_part_file(&name) {
                continue;
            }
            let rel = match entry.path().strip_prefix(root) {
                Ok(rel) => rel,
                Err(_) => continue,
            };
            let path = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            let meta = entry
                .metadata()
                .map_err(|e| SyncError::backend(path.clone(), e))?;
            entries.push(RemoteEntry {
                path,
                size: Some(meta.len()),
                mtime: meta.modified().ok().map(DateTime::<Utc>::from),
            });
        }
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }
}

#[async_trait]
impl Backend for LocalBackend {
    fn protocol(&self) -> &'static str {
        "local"
    }

    async fn list(&self, dir: &str, recursive: bool) -> Result<Vec<RemoteEntry>> {
        let start = self.resolve(dir)?;
        if !start.is_dir() {
            return Ok(Vec::new());
        }
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || Self::walk(&root, &start, recursive))
            .await
            .map_err(|e| SyncError::backend(dir, e))?
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(tokio::fs::metadata(self.resolve(path)?)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false))
    }

    async fn get(&self, remote: &str, local: &Path) -> Result<()> {
        let src = self.resolve(remote)?;
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(&src, local)
            .await
            .map_err(|e| SyncError::backend(remote, e))?;
        Ok(())
    }

    async fn put(&self, local: &Path, remote: &str) -> Result<()> {
        let dest = self.resolve(remote)?;
        let parent = dest
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        let local = local.to_path_buf();
        let remote_name = remote.to_string();

        // Copy next to the target, then rename over it
        tokio::task::spawn_blocking(move || -> Result<()> {
            std::fs::create_dir_all(&parent)?;
            let part = tempfile::Builder::new()
                .prefix(TEMP_PREFIX)
                .suffix(PARTIAL_SUFFIX)
                .tempfile_in(&parent)?;
            std::fs::copy(&local, part.path())?;
            part.persist(&dest)
                .map_err(|e| SyncError::backend(remote_name, e.error))?;
            Ok(())
        })
        .await
        .map_err(|e| SyncError::backend(remote, e))?
    }

    async fn delete(&self, path: &str) -> Result<()> {
        match tokio::fs::remove_file(self.resolve(path)?).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SyncError::backend(path, e)),
        }
    }

    async fn size(&self, path: &str) -> Result<Option<u64>> {
        match tokio::fs::metadata(self.resolve(path)?).await {
            Ok(meta) if meta.is_file() => Ok(Some(meta.len())),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SyncError::backend(path, e)),
        }
    }

    async fn storage_space(&self) -> Result<StorageSpace> {
        let used: u64 = self
            .list("", true)
            .await?
            .iter()
            .filter_map(|e| e.size)
            .sum();
        let used_mb = used as f64 / MB;
        let available = fs2::available_space(&self.root).ok();
        Ok(StorageSpace {
            used_mb,
            quota_mb: available.map(|free| used_mb + free as f64 / MB),
        })
    }

    async fn read_bytes(&self, remote: &str) -> Result<Vec<u8>> {
        tokio::fs::read(self.resolve(remote)?)
            .await
            .map_err(|e| SyncError::backend(remote, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_put_get_list_delete() {
        let temp = TempDir::new().unwrap();
        let backend = LocalBackend::new(temp.path().join("relay")).unwrap();

        let src = temp.path().join("src.txt");
        std::fs::write(&src, b"hello").unwrap();

        backend.put(&src, "dir/a.txt").await.unwrap();
        backend.write_bytes(".a.lock", b"lock%1\n").await.unwrap();

        assert!(backend.exists("dir/a.txt").await.unwrap());
        assert_eq!(backend.size("dir/a.txt").await.unwrap(), Some(5));
        assert_eq!(backend.size("missing").await.unwrap(), None);

        let all: Vec<_> = backend
            .list("", true)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.path)
            .collect();
        assert_eq!(all, vec![".a.lock".to_string(), "dir/a.txt".to_string()]);

        let top: Vec<_> = backend
            .list("", false)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.path)
            .collect();
        assert_eq!(top, vec![".a.lock".to_string()]);

        let dst = temp.path().join("out/a.txt");
        backend.get("dir/a.txt", &dst).await.unwrap();
        assert_eq!(std::fs::read(&dst).unwrap(), b"hello");

        backend.delete("dir/a.txt").await.unwrap();
        backend.delete("dir/a.txt").await.unwrap();
        assert!(!backend.exists("dir/a.txt").await.unwrap());
    }

    #[tokio::test]
    async fn test_rejects_escaping_paths() {
        let temp = TempDir::new().unwrap();
        let backend = LocalBackend::new(temp.path()).unwrap();
        assert!(backend.exists("../etc/passwd").await.is_err());
        assert!(backend.delete("/etc/passwd").await.is_err());
    }

    #[tokio::test]
    async fn test_part_files_are_hidden() {
        let temp = TempDir::new().unwrap();
        let backend = LocalBackend::new(temp.path()).unwrap();
        std::fs::write(temp.path().join(".relay-abc.part"), b"partial").unwrap();
        std::fs::write(temp.path().join("done.txt"), b"x").unwrap();

        let names: Vec<_> = backend
            .list("", true)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.path)
            .collect();
        assert_eq!(names, vec!["done.txt".to_string()]);
    }

    #[tokio::test]
    async fn test_storage_space_counts_files() {
        let temp = TempDir::new().unwrap();
        let backend = LocalBackend::new(temp.path()).unwrap();
        backend
            .write_bytes("big.bin", &vec![0u8; 1024 * 1024])
            .await
            .unwrap();
        let space = backend.storage_space().await.unwrap();
        assert!((space.used_mb - 1.0).abs() < 1e-9);
        if let Some(quota) = space.quota_mb {
            assert!(quota >= space.used_mb);
        }
    }
}
