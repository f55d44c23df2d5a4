//! Relay protocols.
//!
//! Everything the clients agree on is stored as plain files on the backend:
//!
//! - [`Locker`] implements mutual exclusion with lock files.
//! - [`base::BaseRelay`] keeps one lock/placeholder pair next to every
//!   regular file (flat mode).
//! - [`paged::PagedRelay`] groups files into pages, each with a persistent
//!   index and at most one in-flight update transaction (scalable mode).
//!
//! The orchestrator only sees the [`Relay`] trait.

pub mod archive;
pub mod base;
pub mod index;
pub mod naming;
pub mod paged;
pub mod record;

use crate::backend::{Backend, RemoteEntry};
use crate::error::{Result, SyncError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use naming::{SpecialKind, SpecialNames};
use record::{LockInfo, LockMode, Metadata};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Result of a transfer attempt that may be skipped without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Done,
    /// Lock contention or nothing to do; try again next round
    Skipped,
}

/// Temporary files of this program inside a workspace.
pub const TEMP_PREFIX: &str = ".relay-";
/// Suffix of files still being received.
pub const PARTIAL_SUFFIX: &str = ".part";

/// Workspace path of `resource`, refusing anything that escapes `root`.
pub fn workspace_path(root: &Path, resource: &str) -> Result<PathBuf> {
    let relative = Path::new(resource);
    let escapes = relative.is_absolute()
        || relative
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_) | Component::RootDir));
    if resource.is_empty() || escapes {
        return Err(SyncError::Corrupted {
            target: resource.to_string(),
            message: "resource path escapes the workspace".to_string(),
        });
    }
    Ok(root.join(relative))
}

/// Protocol-level operations used by the orchestrator.
#[async_trait]
pub trait Relay: Send + Sync {
    fn client(&self) -> &str;

    /// Detect and repair leftovers of crashed transfers. Returns the number
    /// of repaired items.
    async fn sanity_check(&mut self, workspace: &Path) -> Result<usize>;

    /// Resources available for download.
    async fn list_ready(&mut self) -> Result<Vec<String>>;

    async fn get_metadata(&mut self, resource: &str) -> Result<Option<Metadata>>;

    /// Send `local` as `resource`. In paged mode the file is staged and only
    /// sent by [`Relay::flush`].
    async fn push(&mut self, local: &Path, resource: &str, metadata: &Metadata)
        -> Result<Outcome>;

    /// Fetch `resource` into `local`, recording this client as a puller.
    async fn pop(&mut self, resource: &str, local: &Path) -> Result<Outcome>;

    /// Record this client as a puller without fetching (local copy is
    /// already up to date).
    async fn acknowledge(&mut self, resource: &str) -> Result<Outcome>;

    /// Close whatever the previous pushes/pops left open: commit staged
    /// uploads and finish reads when `success`, roll back otherwise.
    async fn flush(&mut self, success: bool) -> Result<()>;
}

/// A lock held by this client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lock {
    pub target: String,
    pub mode: LockMode,
    file: String,
}

/// A lock file found on the relay.
#[derive(Debug, Clone, PartialEq)]
pub struct LockEntry {
    /// Path of the lock file
    pub file: String,
    /// What it locks (file path or page target)
    pub target: String,
    pub info: LockInfo,
    pub mtime: Option<DateTime<Utc>>,
}

impl LockEntry {
    pub fn age(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.mtime.and_then(|m| (now - m).to_std().ok())
    }

    /// Owner unrecorded and older than `timeout`.
    pub fn is_abandoned(&self, timeout: Duration, now: DateTime<Utc>) -> bool {
        self.info.owner.is_none() && self.age(now).map(|a| a > timeout).unwrap_or(false)
    }

    /// Left behind by this client or by an unidentified crashed one.
    pub fn is_corrupted(&self, client: &str, timeout: Duration, now: DateTime<Utc>) -> bool {
        self.info.is_owned_by(client) || self.is_abandoned(timeout, now)
    }
}

/// Lock settings shared by both protocols.
#[derive(Debug, Clone)]
pub struct LockPolicy {
    /// Age after which a lock without owner is considered abandoned
    pub timeout: Duration,
    /// Pause between two attempts of a blocking acquisition
    pub retry: Duration,
    /// Give up a blocking acquisition after this long (`None`: never)
    pub wait: Option<Duration>,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(3600),
            retry: Duration::from_secs(1),
            wait: Some(Duration::from_secs(60)),
        }
    }
}

/// File-based mutual exclusion.
///
/// Acquisition checks for an existing lock, writes its own, then reads it
/// back to catch a concurrent writer that won the race.
pub struct Locker {
    backend: Arc<dyn Backend>,
    names: SpecialNames,
    client: String,
    policy: LockPolicy,
}

impl Locker {
    pub fn new(
        backend: Arc<dyn Backend>,
        names: SpecialNames,
        client: impl Into<String>,
        policy: LockPolicy,
    ) -> Self {
        Self {
            backend,
            names,
            client: client.into(),
            policy,
        }
    }

    pub fn client(&self) -> &str {
        &self.client
    }

    pub fn policy(&self) -> &LockPolicy {
        &self.policy
    }

    /// Take a lock on `target`; `None` when a non-blocking attempt meets
    /// contention.
    pub async fn acquire(&self, target: &str, mode: LockMode, blocking: bool) -> Result<Option<Lock>> {
        let started = tokio::time::Instant::now();
        loop {
            if let Some(lock) = self.try_acquire(target, mode).await? {
                return Ok(Some(lock));
            }
            if !blocking {
                return Ok(None);
            }
            if let Some(wait) = self.policy.wait {
                if started.elapsed() >= wait {
                    return Err(SyncError::LockTimeout {
                        target: target.to_string(),
                    });
                }
            }
            tokio::time::sleep(self.policy.retry).await;
        }
    }

    async fn try_acquire(&self, target: &str, mode: LockMode) -> Result<Option<Lock>> {
        let file = self.names.lock(target);
        if self.backend.exists(&file).await? {
            debug!(target, "lock busy");
            return Ok(None);
        }
        let info = LockInfo::new(&self.client, mode);
        self.backend
            .write_bytes(&file, info.serialize().as_bytes())
            .await?;

        let confirmed = match self.backend.try_read_bytes(&file).await? {
            Some(bytes) => LockInfo::parse(&String::from_utf8_lossy(&bytes)) == info,
            None => false,
        };
        if !confirmed {
            debug!(target, "lost lock race");
            return Ok(None);
        }
        debug!(target, %mode, "lock acquired");
        Ok(Some(Lock {
            target: target.to_string(),
            mode,
            file,
        }))
    }

    pub async fn release(&self, lock: Lock) -> Result<()> {
        debug!(target = %lock.target, "lock released");
        self.backend.delete(&lock.file).await
    }

    /// Remove a lock found on the relay, whoever owns it.
    pub async fn break_lock(&self, entry: &LockEntry) -> Result<()> {
        warn!(target = %entry.target, owner = ?entry.info.owner, "breaking lock");
        self.backend.delete(&entry.file).await
    }

    /// Release `lock` whatever `result` is; the body's error wins.
    pub async fn release_after<T>(&self, lock: Lock, result: Result<T>) -> Result<T> {
        let released = self.release(lock).await;
        let value = result?;
        released?;
        Ok(value)
    }

    /// All lock files among `entries`, with their content.
    pub async fn scan(&self, entries: &[RemoteEntry]) -> Result<Vec<LockEntry>> {
        let mut locks = Vec::new();
        for entry in entries {
            if self.names.classify(&entry.path) != SpecialKind::Lock {
                continue;
            }
            let Some(target) = self.names.from_lock(&entry.path) else {
                continue;
            };
            // Released between listing and reading
            let Some(bytes) = self.backend.try_read_bytes(&entry.path).await? else {
                continue;
            };
            locks.push(LockEntry {
                file: entry.path.clone(),
                target,
                info: LockInfo::parse(&String::from_utf8_lossy(&bytes)),
                mtime: entry.mtime,
            });
        }
        Ok(locks)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::backend::local::LocalBackend;
    use tempfile::TempDir;

    pub(crate) fn locker(backend: Arc<dyn Backend>, client: &str) -> Locker {
        Locker::new(
            backend,
            SpecialNames::default(),
            client,
            LockPolicy {
                timeout: Duration::from_secs(3600),
                retry: Duration::from_millis(10),
                wait: Some(Duration::from_millis(50)),
            },
        )
    }

    #[test]
    fn test_workspace_path() {
        let root = Path::new("/ws");
        assert_eq!(workspace_path(root, "a/b").unwrap(), PathBuf::from("/ws/a/b"));
        assert!(workspace_path(root, "../x").is_err());
        assert!(workspace_path(root, "/etc/x").is_err());
        assert!(workspace_path(root, "").is_err());
    }

    #[tokio::test]
    async fn test_lock_exclusivity() {
        let temp = TempDir::new().unwrap();
        let backend: Arc<dyn Backend> = Arc::new(LocalBackend::new(temp.path()).unwrap());
        let a = locker(backend.clone(), "a");
        let b = locker(backend.clone(), "b");

        let held = a.acquire("x.txt", LockMode::Write, false).await.unwrap().unwrap();
        assert!(b.acquire("x.txt", LockMode::Write, false).await.unwrap().is_none());
        assert!(b.acquire("x.txt", LockMode::Read, false).await.unwrap().is_none());
        // the holder itself cannot take it twice either
        assert!(a.acquire("x.txt", LockMode::Write, false).await.unwrap().is_none());

        a.release(held).await.unwrap();
        let again = b.acquire("x.txt", LockMode::Read, false).await.unwrap();
        assert!(again.is_some());
    }

    #[tokio::test]
    async fn test_blocking_acquire_times_out() {
        let temp = TempDir::new().unwrap();
        let backend: Arc<dyn Backend> = Arc::new(LocalBackend::new(temp.path()).unwrap());
        let a = locker(backend.clone(), "a");
        let b = locker(backend, "b");

        let _held = a.acquire("x", LockMode::Write, false).await.unwrap().unwrap();
        let err = b.acquire("x", LockMode::Write, true).await.unwrap_err();
        assert!(matches!(err, SyncError::LockTimeout { .. }));
    }

    #[tokio::test]
    async fn test_scan_reports_owner_and_mode() {
        let temp = TempDir::new().unwrap();
        let backend: Arc<dyn Backend> = Arc::new(LocalBackend::new(temp.path()).unwrap());
        let a = locker(backend.clone(), "a");
        let _held = a.acquire("dir/x", LockMode::Read, false).await.unwrap().unwrap();
        backend.write_bytes(".legacy.lock", b"old-client\n").await.unwrap();

        let listing = backend.list("", true).await.unwrap();
        let locks = a.scan(&listing).await.unwrap();
        assert_eq!(locks.len(), 2);

        let legacy = locks.iter().find(|l| l.target == "legacy").unwrap();
        assert_eq!(legacy.info.owner.as_deref(), Some("old-client"));
        assert_eq!(legacy.info.mode, None);

        let ours = locks.iter().find(|l| l.target == "dir/x").unwrap();
        assert!(ours.is_corrupted("a", Duration::from_secs(3600), Utc::now()));
        assert!(!ours.is_corrupted("b", Duration::from_secs(3600), Utc::now()));
    }

    #[test]
    fn test_abandoned_needs_age_and_no_owner() {
        let now = Utc::now();
        let entry = LockEntry {
            file: ".x.lock".into(),
            target: "x".into(),
            info: LockInfo::default(),
            mtime: Some(now - chrono::Duration::seconds(100)),
        };
        assert!(entry.is_abandoned(Duration::from_secs(10), now));
        assert!(!entry.is_abandoned(Duration::from_secs(1000), now));

        let owned = LockEntry {
            info: LockInfo::new("other", LockMode::Write),
            ..entry
        };
        assert!(!owned.is_abandoned(Duration::from_secs(10), now));
    }
}
