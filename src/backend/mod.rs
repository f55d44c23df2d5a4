//! Storage backends.
//!
//! A backend is the dumb relay store: whole-file `get`/`put`/`delete`, a
//! listing, and a capacity query. Nothing else is assumed; in particular no
//! operation is atomic beyond a single whole-file write.

pub mod local;
pub mod rclone;

use crate::config::RepositoryConfig;
use crate::error::{Result, SyncError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// One file reported by [`Backend::list`].
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteEntry {
    /// Path relative to the relay root, `/`-separated
    pub path: String,
    pub size: Option<u64>,
    pub mtime: Option<DateTime<Utc>>,
}

impl RemoteEntry {
    /// Basename of the entry.
    pub fn name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}

/// Used and available space, in megabytes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StorageSpace {
    pub used_mb: f64,
    /// Capacity reported by the store, if it knows one
    pub quota_mb: Option<f64>,
}

#[async_trait]
pub trait Backend: Send + Sync {
    /// Protocol name, for logs.
    fn protocol(&self) -> &'static str;

    /// List regular files under `dir` ("" is the root).
    async fn list(&self, dir: &str, recursive: bool) -> Result<Vec<RemoteEntry>>;

    async fn exists(&self, path: &str) -> Result<bool>;

    /// Download `remote` into `local`, replacing it.
    async fn get(&self, remote: &str, local: &Path) -> Result<()>;

    /// Upload `local` to `remote`, replacing it.
    async fn put(&self, local: &Path, remote: &str) -> Result<()>;

    /// Delete `path`. Deleting a missing file succeeds.
    async fn delete(&self, path: &str) -> Result<()>;

    async fn size(&self, path: &str) -> Result<Option<u64>>;

    async fn storage_space(&self) -> Result<StorageSpace>;

    /// Read a small remote file into memory.
    async fn read_bytes(&self, remote: &str) -> Result<Vec<u8>> {
        let tmp = tempfile::NamedTempFile::new()?;
        self.get(remote, tmp.path()).await?;
        Ok(tokio::fs::read(tmp.path()).await?)
    }

    /// Read a small remote file, `None` if it does not exist.
    async fn try_read_bytes(&self, remote: &str) -> Result<Option<Vec<u8>>> {
        if !self.exists(remote).await? {
            return Ok(None);
        }
        self.read_bytes(remote).await.map(Some)
    }

    /// Write a small in-memory file with a single `put`.
    async fn write_bytes(&self, remote: &str, data: &[u8]) -> Result<()> {
        let tmp = tempfile::NamedTempFile::new()?;
        tokio::fs::write(tmp.path(), data).await?;
        self.put(tmp.path(), remote).await
    }
}

pub type BackendFactory = fn(&RepositoryConfig) -> Result<Arc<dyn Backend>>;

/// Backend constructors keyed by protocol name.
///
/// Built once at startup and only read afterwards.
pub struct BackendRegistry {
    factories: HashMap<&'static str, BackendFactory>,
}

impl BackendRegistry {
    pub fn init() -> Self {
        let mut factories: HashMap<&'static str, BackendFactory> = HashMap::new();
        factories.insert("local", local::LocalBackend::from_config);
        factories.insert("file", local::LocalBackend::from_config);
        factories.insert("rclone", rclone::RcloneBackend::from_config);
        Self { factories }
    }

    pub fn protocols(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.factories.keys().copied().collect();
        names.sort_unstable();
        names
    }

    pub fn build(&self, config: &RepositoryConfig) -> Result<Arc<dyn Backend>> {
        let factory = self.factories.get(config.protocol.as_str()).ok_or_else(|| {
            SyncError::Config(format!(
                "unknown protocol '{}' (available: {})",
                config.protocol,
                self.protocols().join(", ")
            ))
        })?;
        factory(config)
    }
}

/// Join a directory and a name into a relay path.
pub fn join(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", dir.trim_end_matches('/'), name)
    }
}

/// Split a relay path into (directory, basename).
pub fn split(path: &str) -> (&str, &str) {
    match path.rsplit_once('/') {
        Some((dir, name)) => (dir, name),
        None => ("", path),
    }
}
