//! Flat relay protocol.
//!
//! Each regular file on the relay carries its own special files:
//!
//! - a lock while somebody transfers it,
//! - a placeholder with the metadata of the last push and the list of
//!   clients that pulled that version.
//!
//! A pushed file stays on the relay until the expected number of readers
//! has pulled it; the last reader deletes it. The placeholder survives so
//! that later runs can still tell whether a local copy is current.

use super::naming::{SpecialKind, SpecialNames};
use super::record::{truncate_timestamp, LockMode, Metadata, Placeholder};
use super::{workspace_path, LockEntry, Locker, Outcome, Relay, PARTIAL_SUFFIX, TEMP_PREFIX};
use crate::backend::{Backend, RemoteEntry};
use crate::error::{Result, SyncError};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A lock left behind by a crashed transfer.
#[derive(Debug, Clone, PartialEq)]
pub struct CorruptedLock {
    pub lock: LockEntry,
    /// The locked regular file is gone, and so is its placeholder
    pub orphaned: bool,
}

pub struct BaseRelay {
    backend: Arc<dyn Backend>,
    locker: Locker,
    names: SpecialNames,
    /// Expected number of readers per pushed version (`None`: one)
    readers: Option<usize>,
    /// Wait for busy locks instead of skipping the file
    blocking: bool,
}

impl BaseRelay {
    pub fn new(
        backend: Arc<dyn Backend>,
        locker: Locker,
        names: SpecialNames,
        readers: Option<usize>,
    ) -> Self {
        Self {
            backend,
            locker,
            names,
            readers,
            blocking: false,
        }
    }

    pub fn blocking(mut self, blocking: bool) -> Self {
        self.blocking = blocking;
        self
    }

    pub fn names(&self) -> &SpecialNames {
        &self.names
    }

    pub async fn get_placeholder(&self, remote: &str) -> Result<Option<Placeholder>> {
        let file = self.names.placeholder(remote);
        match self.backend.try_read_bytes(&file).await? {
            Some(bytes) => Placeholder::parse(&file, &String::from_utf8_lossy(&bytes)).map(Some),
            None => Ok(None),
        }
    }

    async fn set_placeholder(&self, remote: &str, placeholder: &Placeholder) -> Result<()> {
        self.backend
            .write_bytes(&self.names.placeholder(remote), placeholder.serialize().as_bytes())
            .await
    }

    /// Upload `local` as `remote` under a write lock.
    pub async fn push(&self, local: &Path, remote: &str, metadata: &Metadata) -> Result<Outcome> {
        let Some(lock) = self
            .locker
            .acquire(remote, LockMode::Write, self.blocking)
            .await?
        else {
            return Ok(Outcome::Skipped);
        };
        match self.push_locked(local, remote, metadata).await {
            // Keep the write lock: the next sanity check drops file and placeholder
            Err(e @ SyncError::Corrupted { .. }) => Err(e),
            result => self.locker.release_after(lock, result).await,
        }
    }

    async fn push_locked(&self, local: &Path, remote: &str, metadata: &Metadata) -> Result<Outcome> {
        let mut previous = None;
        if metadata.is_informative() {
            previous = Some(self.get_placeholder(remote).await?);
            let mut metadata = metadata.clone();
            metadata.pusher = Some(self.locker.client().to_string());
            metadata.target = Some(remote.to_string());
            // New version: nobody has pulled it yet
            self.set_placeholder(remote, &Placeholder::new(metadata)).await?;
        }
        if let Err(e) = self.backend.put(local, remote).await {
            if let Some(previous) = previous {
                if let Err(restore) = self.restore_placeholder(remote, previous).await {
                    warn!(resource = remote, error = %restore, "cannot restore placeholder");
                    return Err(SyncError::Corrupted {
                        target: remote.to_string(),
                        message: format!("push failed ({}) and placeholder is stale", e),
                    });
                }
            }
            return Err(e);
        }
        info!(resource = remote, "pushed");
        Ok(Outcome::Done)
    }

    /// Put back the placeholder a failed push replaced. A placeholder must
    /// never announce content that is not on the relay.
    async fn restore_placeholder(&self, remote: &str, previous: Option<Placeholder>) -> Result<()> {
        match &previous {
            Some(placeholder) => self.set_placeholder(remote, placeholder).await,
            None => self.backend.delete(&self.names.placeholder(remote)).await,
        }
    }

    /// Download `remote` into `local` under a read lock.
    pub async fn pop(&self, remote: &str, local: &Path) -> Result<Outcome> {
        self.consume(remote, Some(local)).await
    }

    /// Count this client as a reader of `remote` without downloading it.
    pub async fn acknowledge(&self, remote: &str) -> Result<Outcome> {
        self.consume(remote, None).await
    }

    async fn consume(&self, remote: &str, local: Option<&Path>) -> Result<Outcome> {
        let Some(lock) = self
            .locker
            .acquire(remote, LockMode::Read, self.blocking)
            .await?
        else {
            return Ok(Outcome::Skipped);
        };
        let result = self.consume_locked(remote, local).await;
        self.locker.release_after(lock, result).await
    }

    async fn consume_locked(&self, remote: &str, local: Option<&Path>) -> Result<Outcome> {
        let client = self.locker.client();
        let placeholder = self.get_placeholder(remote).await?;

        if let Some(p) = &placeholder {
            if p.has_puller(client) || p.metadata.pusher.as_deref() == Some(client) {
                debug!(resource = remote, "already consumed");
                return Ok(Outcome::Skipped);
            }
        }
        if !self.backend.exists(remote).await? {
            return Ok(Outcome::Skipped);
        }

        let last_reader = match (&placeholder, self.readers) {
            (Some(p), Some(readers)) => p.pullers.len() + 1 >= readers,
            _ => true,
        };

        if let Some(local) = local {
            self.backend.get(remote, local).await?;
        }
        if last_reader {
            self.backend.delete(remote).await?;
        }

        let placeholder = match placeholder {
            Some(mut p) => {
                p.add_puller(client);
                p
            }
            None => {
                // Legacy upgrade: rebuild from what we just received
                let timestamp = match local {
                    Some(local) => std::fs::metadata(local)
                        .and_then(|m| m.modified())
                        .ok()
                        .map(truncate_timestamp),
                    None => None,
                };
                let mut p = Placeholder::new(Metadata {
                    pusher: None,
                    target: Some(remote.to_string()),
                    timestamp,
                    checksum: None,
                });
                p.add_puller(client);
                p
            }
        };
        self.set_placeholder(remote, &placeholder).await?;

        info!(
            resource = remote,
            deleted = last_reader,
            fetched = local.is_some(),
            "pulled"
        );
        Ok(Outcome::Done)
    }

    pub async fn get_metadata(&self, remote: &str) -> Result<Option<Metadata>> {
        Ok(self.get_placeholder(remote).await?.map(|p| {
            let mut metadata = p.metadata;
            if metadata.target.is_none() {
                metadata.target = Some(remote.to_string());
            }
            metadata
        }))
    }

    /// Regular files without a live write lock.
    pub async fn list_ready(&self) -> Result<Vec<String>> {
        let listing = self.backend.list("", true).await?;
        let locks = self.locker.scan(&listing).await?;
        let write_locked: HashSet<&str> = locks
            .iter()
            .filter(|l| l.info.mode != Some(LockMode::Read))
            .map(|l| l.target.as_str())
            .collect();

        Ok(listing
            .iter()
            .filter(|e| !self.names.is_special(&e.path))
            .filter(|e| !write_locked.contains(e.path.as_str()))
            .map(|e| e.path.clone())
            .collect())
    }

    /// Files pushed at some point but no longer on the relay. With
    /// `end2end`, only those a reader actually pulled.
    pub async fn list_transferred(&self, end2end: bool) -> Result<Vec<String>> {
        let listing = self.backend.list("", true).await?;
        let present: HashSet<&str> = listing.iter().map(|e| e.path.as_str()).collect();

        let mut transferred = Vec::new();
        for entry in &listing {
            if self.names.classify(&entry.path) != SpecialKind::Placeholder {
                continue;
            }
            let Some(resource) = self.names.from_placeholder(&entry.path) else {
                continue;
            };
            if present.contains(resource.as_str()) {
                continue;
            }
            if end2end {
                match self.get_placeholder(&resource).await? {
                    Some(p) if !p.pullers.is_empty() => {}
                    _ => continue,
                }
            }
            transferred.push(resource);
        }
        Ok(transferred)
    }

    /// Locks left by a crashed transfer of this client, by an unidentified
    /// client, or guarding a file that no longer exists.
    pub async fn list_corrupted(&self) -> Result<Vec<CorruptedLock>> {
        let listing = self.backend.list("", true).await?;
        self.corrupted_in(&listing).await
    }

    async fn corrupted_in(&self, listing: &[RemoteEntry]) -> Result<Vec<CorruptedLock>> {
        let present: HashSet<&str> = listing.iter().map(|e| e.path.as_str()).collect();
        let client = self.locker.client();
        let timeout = self.locker.policy().timeout;
        let now = Utc::now();

        let mut corrupted = Vec::new();
        for lock in self.locker.scan(listing).await? {
            let orphaned = !present.contains(lock.target.as_str())
                && !present.contains(self.names.placeholder(&lock.target).as_str());
            let stale = lock.age(now).map(|a| a > timeout).unwrap_or(false);

            if lock.is_corrupted(client, timeout, now) || (orphaned && stale) {
                corrupted.push(CorruptedLock { lock, orphaned });
            }
        }
        Ok(corrupted)
    }

    /// Undo a crashed transfer and release its lock. Safe to repeat.
    pub async fn repair(&self, corrupted: &CorruptedLock, workspace: &Path) -> Result<()> {
        let target = corrupted.lock.target.as_str();
        match corrupted.lock.info.mode {
            Some(LockMode::Read) => {
                if corrupted.lock.info.is_owned_by(self.locker.client()) {
                    // The workspace copy itself is only replaced once complete
                    match workspace_path(workspace, target) {
                        Ok(local) => {
                            let removed = remove_partials(&local).await?;
                            if removed > 0 {
                                warn!(resource = target, removed, "removed partial downloads");
                            }
                        }
                        Err(e) => warn!(resource = target, error = %e, "lock outside the workspace"),
                    }
                }
                if !self.backend.exists(target).await? {
                    // Consumed but not recorded: ask for it again
                    self.backend.delete(&self.names.placeholder(target)).await?;
                }
            }
            // Write or unknown: the remote content cannot be trusted
            Some(LockMode::Write) | None => {
                self.backend.delete(target).await?;
                self.backend.delete(&self.names.placeholder(target)).await?;
            }
        }
        self.locker.break_lock(&corrupted.lock).await?;
        warn!(resource = target, orphaned = corrupted.orphaned, "repaired");
        Ok(())
    }

    /// Remove a file and all its special files from the relay for good.
    pub async fn delete(&self, remote: &str) -> Result<Outcome> {
        let Some(lock) = self
            .locker
            .acquire(remote, LockMode::Write, self.blocking)
            .await?
        else {
            return Ok(Outcome::Skipped);
        };
        let result = async {
            self.backend.delete(remote).await?;
            self.backend.delete(&self.names.placeholder(remote)).await?;
            self.backend.delete(&self.names.message(remote)).await?;
            Ok::<_, SyncError>(Outcome::Done)
        }
        .await;
        self.locker.release_after(lock, result).await
    }
}

/// Delete unfinished downloads next to `local`. Returns how many were found.
async fn remove_partials(local: &Path) -> Result<usize> {
    let Some(dir) = local.parent() else {
        return Ok(0);
    };
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    let mut removed = 0;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !name.starts_with(TEMP_PREFIX) || !name.ends_with(PARTIAL_SUFFIX) {
            continue;
        }
        if !entry.file_type().await?.is_file() {
            continue;
        }
        match tokio::fs::remove_file(entry.path()).await {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(removed)
}

#[async_trait]
impl Relay for BaseRelay {
    fn client(&self) -> &str {
        self.locker.client()
    }

    async fn sanity_check(&mut self, workspace: &Path) -> Result<usize> {
        let corrupted = self.list_corrupted().await?;
        for lock in &corrupted {
            self.repair(lock, workspace).await?;
        }
        Ok(corrupted.len())
    }

    async fn list_ready(&mut self) -> Result<Vec<String>> {
        BaseRelay::list_ready(self).await
    }

    async fn get_metadata(&mut self, resource: &str) -> Result<Option<Metadata>> {
        BaseRelay::get_metadata(self, resource).await
    }

    async fn push(
        &mut self,
        local: &Path,
        resource: &str,
        metadata: &Metadata,
    ) -> Result<Outcome> {
        BaseRelay::push(self, local, resource, metadata).await
    }

    async fn pop(&mut self, resource: &str, local: &Path) -> Result<Outcome> {
        BaseRelay::pop(self, resource, local).await
    }

    async fn acknowledge(&mut self, resource: &str) -> Result<Outcome> {
        BaseRelay::acknowledge(self, resource).await
    }

    async fn flush(&mut self, _success: bool) -> Result<()> {
        Ok(())
    }
}
