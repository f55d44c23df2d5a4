//! Synchronization loop of one repository.
//!
//! Each round runs, in order:
//!
//! 1. a sanity check of the relay (after start and after any failed round),
//! 2. the download step: everything the relay holds for this client,
//! 3. the upload step: every local file the relay does not have yet,
//! 4. an adaptive wait that grows while rounds find nothing to do.

pub mod checksum;
pub mod filter;

use crate::backend::{Backend, BackendRegistry};
use crate::cipher::{Cipher, CipherRegistry};
use crate::clock::AdaptiveClock;
use crate::config::RepositoryConfig;
use crate::error::{Result, SyncError};
use crate::quota::QuotaController;
use crate::relay::base::BaseRelay;
use crate::relay::paged::PagedRelay;
use crate::relay::record::{truncate_timestamp, Metadata};
use crate::relay::{workspace_path, Locker, Outcome, Relay, PARTIAL_SUFFIX, TEMP_PREFIX};
use checksum::ChecksumCache;
use chrono::{DateTime, Utc};
use filetime::FileTime;
use filter::FileFilter;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Two loop-level errors of one kind this close together stop the worker.
const FAST_FAILURE: Duration = Duration::from_secs(1);

/// What happened to a single file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Transferred,
    /// Busy lock or nothing to take; retried next round
    Skipped,
    /// Both sides already agree
    Unchanged,
}

impl From<Outcome> for Action {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Done => Action::Transferred,
            Outcome::Skipped => Action::Skipped,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepReport {
    pub transferred: usize,
    pub skipped: usize,
    pub unchanged: usize,
    pub failed: usize,
}

impl StepReport {
    fn count(&mut self, action: Action) {
        match action {
            Action::Transferred => self.transferred += 1,
            Action::Skipped => self.skipped += 1,
            Action::Unchanged => self.unchanged += 1,
        }
    }
}

/// A workspace file found by the scan.
#[derive(Debug, Clone)]
struct LocalFile {
    resource: String,
    path: PathBuf,
    size: u64,
}

/// Whether the side being sent differs from the other one.
///
/// Checksums decide when both are known. Otherwise timestamps do: a push
/// needs the local copy to be newer, a pull needs the remote one to be.
/// Without any information the file counts as modified.
pub fn is_modified(
    local_time: DateTime<Utc>,
    local_checksum: Option<&str>,
    remote: Option<&Metadata>,
    pushing: bool,
) -> bool {
    let Some(remote) = remote else {
        return true;
    };
    if let (Some(local), Some(remote)) = (local_checksum, remote.checksum.as_deref()) {
        return local != remote;
    }
    match remote.timestamp {
        Some(remote_time) if pushing => local_time > remote_time,
        Some(remote_time) => remote_time > local_time,
        None => true,
    }
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| SyncError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?
}

pub struct Manager {
    config: RepositoryConfig,
    backend: Arc<dyn Backend>,
    relay: Box<dyn Relay>,
    cipher: Arc<dyn Cipher>,
    filter: FileFilter,
    checksums: ChecksumCache,
    quota: QuotaController,
    clock: AdaptiveClock,
    needs_sanity: bool,
    last_error: Option<(&'static str, Instant)>,
}

impl Manager {
    pub fn new(
        config: RepositoryConfig,
        backend: Arc<dyn Backend>,
        relay: Box<dyn Relay>,
        cipher: Arc<dyn Cipher>,
    ) -> Result<Self> {
        let filter = FileFilter::from_config(&config)?;
        let quota = QuotaController::new(config.quota_mb, config.quota_refresh());
        let clock = AdaptiveClock::new(config.initial_delay(), config.max_delay(), config.max_iter);
        Ok(Self {
            config,
            backend,
            relay,
            cipher,
            filter,
            checksums: ChecksumCache::new(),
            quota,
            clock,
            needs_sanity: true,
            last_error: None,
        })
    }

    /// Wire backend, relay protocol and cipher as `config` asks.
    pub fn from_config(
        config: &RepositoryConfig,
        backends: &BackendRegistry,
        ciphers: &CipherRegistry,
    ) -> Result<Self> {
        config.validate()?;
        let backend = backends.build(config)?;
        let cipher = ciphers.get(&config.cipher)?;
        let locker = Locker::new(
            backend.clone(),
            config.names.clone(),
            config.client.clone(),
            config.lock_policy(),
        );
        let relay: Box<dyn Relay> = if config.index {
            Box::new(
                PagedRelay::new(
                    backend.clone(),
                    locker,
                    config.names.clone(),
                    config.paging.clone(),
                    config.readers,
                )
                .compress(config.compress_index)
                .cooldown(config.index_cooldown()),
            )
        } else {
            Box::new(
                BaseRelay::new(backend.clone(), locker, config.names.clone(), config.readers)
                    .blocking(config.blocking),
            )
        };
        Self::new(config.clone(), backend, relay, cipher)
    }

    pub fn config(&self) -> &RepositoryConfig {
        &self.config
    }

    pub fn relay(&mut self) -> &mut dyn Relay {
        self.relay.as_mut()
    }

    /// Loop until `shutdown` turns true or a fatal error occurs.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        tokio::fs::create_dir_all(&self.config.local).await?;
        info!(
            client = %self.config.client,
            protocol = self.backend.protocol(),
            paged = self.config.index,
            "worker started"
        );
        let mut retried = false;
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.run_once().await {
                Ok(work) => {
                    self.last_error = None;
                    retried = false;
                    if work > 0 {
                        self.clock.reset();
                    }
                }
                Err(e) => {
                    self.handle_error(e)?;
                    // Retry at once: a persistent failure must repeat within FAST_FAILURE
                    if !retried {
                        retried = true;
                        continue;
                    }
                    retried = false;
                }
            }
            let delay = self.clock.tick();
            debug!(?delay, "waiting");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("worker stopped");
        Ok(())
    }

    fn handle_error(&mut self, e: SyncError) -> Result<()> {
        self.needs_sanity = true;
        if e.is_fatal() {
            error!(error = %e, "fatal error");
            return Err(e);
        }
        let now = Instant::now();
        if let Some((kind, at)) = self.last_error {
            if kind == e.kind() && now.duration_since(at) < FAST_FAILURE {
                error!(error = %e, "same error twice in a row");
                return Err(e);
            }
        }
        self.last_error = Some((e.kind(), now));
        warn!(error = %e, "round failed");
        Ok(())
    }

    /// One round; returns the number of transferred files.
    pub async fn run_once(&mut self) -> Result<usize> {
        if self.needs_sanity {
            let repaired = self.relay.sanity_check(&self.config.local).await?;
            if repaired > 0 {
                warn!(repaired, "relay repaired");
            }
            self.needs_sanity = false;
        }
        let mut work = 0;
        if self.config.mode.downloads() {
            work += self.download().await?.transferred;
        }
        if self.config.mode.uploads() {
            work += self.upload().await?.transferred;
        }
        Ok(work)
    }

    pub async fn download(&mut self) -> Result<StepReport> {
        let ready = self.relay.list_ready().await?;
        let mut report = StepReport::default();

        for resource in ready {
            if !self.filter.accepts(&resource) {
                continue;
            }
            match self.download_one(&resource).await {
                Ok(action) => report.count(action),
                Err(e) if e.is_fatal() => {
                    self.close(false).await;
                    return Err(e);
                }
                Err(e) => {
                    warn!(resource = %resource, error = %e, "download failed");
                    report.failed += 1;
                }
            }
        }
        // A failed file must stay pullable: keep the whole read open
        self.relay.flush(report.failed == 0).await?;
        if report.transferred + report.failed > 0 {
            info!(
                received = report.transferred,
                failed = report.failed,
                skipped = report.skipped,
                "download step done"
            );
        }
        Ok(report)
    }

    async fn download_one(&mut self, resource: &str) -> Result<Action> {
        let metadata = self.relay.get_metadata(resource).await?;
        if let Some(pusher) = metadata.as_ref().and_then(|m| m.pusher.as_deref()) {
            if pusher == self.relay.client() {
                return Ok(Action::Skipped);
            }
        }

        let local = workspace_path(&self.config.local, resource)?;
        if tokio::fs::try_exists(&local).await? {
            let (local_time, local_checksum) = self.local_state(&local).await?;
            if !is_modified(local_time, local_checksum.as_deref(), metadata.as_ref(), false) {
                debug!(resource, "local copy up to date");
                return match self.relay.acknowledge(resource).await? {
                    Outcome::Done => Ok(Action::Unchanged),
                    Outcome::Skipped => Ok(Action::Skipped),
                };
            }
        }

        let parent = local
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.config.local.clone());
        tokio::fs::create_dir_all(&parent).await?;
        let received = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .suffix(PARTIAL_SUFFIX)
            .tempfile_in(&parent)?;

        if self.relay.pop(resource, received.path()).await? == Outcome::Skipped {
            return Ok(Action::Skipped);
        }

        let cipher = self.cipher.clone();
        let src = received.path().to_path_buf();
        let dst = local.clone();
        blocking(move || cipher.decrypt(&src, &dst)).await?;
        drop(received);

        if let Some(timestamp) = metadata.and_then(|m| m.timestamp) {
            let mtime = FileTime::from_unix_time(timestamp.timestamp(), 0);
            let path = local.clone();
            blocking(move || filetime::set_file_mtime(&path, mtime).map_err(SyncError::from)).await?;
        }
        self.checksums.forget(&local);
        info!(resource, "received");
        Ok(Action::Transferred)
    }

    pub async fn upload(&mut self) -> Result<StepReport> {
        let files = self.scan().await?;
        let mut report = StepReport::default();

        for file in files {
            match self.upload_one(&file).await {
                Ok(action) => report.count(action),
                Err(SyncError::QuotaExceeded { used, quota }) => {
                    warn!(resource = %file.resource, used, quota, "quota exceeded, upload step stopped");
                    report.skipped += 1;
                    break;
                }
                Err(e) if e.is_fatal() => {
                    self.close(false).await;
                    return Err(e);
                }
                Err(e) => {
                    warn!(resource = %file.resource, error = %e, "upload failed");
                    report.failed += 1;
                }
            }
        }
        // Whatever got staged before a failure still goes out
        self.relay.flush(true).await?;
        if report.transferred + report.failed > 0 {
            info!(
                sent = report.transferred,
                failed = report.failed,
                skipped = report.skipped,
                "upload step done"
            );
        }
        Ok(report)
    }

    async fn upload_one(&mut self, file: &LocalFile) -> Result<Action> {
        let remote = self.relay.get_metadata(&file.resource).await?;
        let (local_time, checksum) = self.local_state(&file.path).await?;
        if !is_modified(local_time, checksum.as_deref(), remote.as_ref(), true) {
            return Ok(Action::Unchanged);
        }

        self.quota.check(self.backend.as_ref(), file.size).await?;

        let cipher = self.cipher.clone();
        let path = file.path.clone();
        let encrypted = blocking(move || cipher.encrypt(&path)).await?;
        let sent_size = tokio::fs::metadata(&encrypted).await.map(|m| m.len()).unwrap_or(file.size);

        let metadata = Metadata::new(
            self.relay.client(),
            &file.resource,
            Some(local_time),
            checksum,
        );
        let pushed = self.relay.push(&encrypted, &file.resource, &metadata).await;

        let cipher = self.cipher.clone();
        let finalized = blocking(move || cipher.finalize(&encrypted)).await;
        let outcome = pushed?;
        finalized?;

        if outcome == Outcome::Done {
            self.quota.record(sent_size);
            info!(resource = %file.resource, bytes = file.size, "sent");
        }
        Ok(outcome.into())
    }

    /// mtime at the precision the relay records, and checksum if enabled.
    async fn local_state(&mut self, path: &Path) -> Result<(DateTime<Utc>, Option<String>)> {
        let modified = tokio::fs::metadata(path).await?.modified()?;
        let checksum = if self.config.checksum {
            Some(self.checksums.get(path).await?)
        } else {
            None
        };
        Ok((truncate_timestamp(modified), checksum))
    }

    async fn scan(&self) -> Result<Vec<LocalFile>> {
        let root = self.config.local.clone();
        let files = blocking(move || {
            let mut builder = ignore::WalkBuilder::new(&root);
            builder
                .standard_filters(false)
                .hidden(false)
                .follow_links(false);

            let mut files = Vec::new();
            for result in builder.build() {
                let entry = match result {
                    Ok(entry) => entry,
                    Err(e) => {
                        warn!(error = %e, "skipping unreadable entry");
                        continue;
                    }
                };
                if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                    continue;
                }
                let Ok(rel) = entry.path().strip_prefix(&root) else {
                    continue;
                };
                let resource = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
                files.push(LocalFile {
                    resource,
                    path: entry.path().to_path_buf(),
                    size,
                });
            }
            files.sort_by(|a, b| a.resource.cmp(&b.resource));
            Ok(files)
        })
        .await?;

        Ok(files
            .into_iter()
            .filter(|f| self.filter.accepts(&f.resource))
            .collect())
    }

    /// Roll back whatever is open on the relay, logging failures.
    async fn close(&mut self, success: bool) {
        if let Err(e) = self.relay.flush(success).await {
            warn!(error = %e, "closing relay transactions failed");
        }
    }
}
