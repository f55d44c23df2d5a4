//! Paged relay protocol.
//!
//! Regular files are grouped into pages. For every page the relay holds
//!
//! - a persistent index `.<page>.index` mapping resources to metadata,
//! - at most one live update transaction: a diff index
//!   `.<page>.<ts>.upindex` with the changed resources and their pullers,
//!   next to the packed bytes `.<page>.<ts>.updata`,
//! - a page lock `.<page>.page.lock` while somebody reads or writes it.
//!
//! The data file goes up first and the diff index last: a transaction only
//! exists once both files are present. A lone half is what a crash leaves
//! behind, and is deleted under the page lock.
//!
//! Diffs are folded into the persistent index lazily, by the next writer
//! or by the reader that consumes the transaction.

use super::archive;
use super::index::Index;
use super::naming::{SpecialKind, SpecialNames};
use super::record::{LockMode, Metadata};
use super::{Lock, Locker, Outcome, Relay};
use crate::backend::{Backend, RemoteEntry};
use crate::error::{Result, SyncError};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::{NamedTempFile, TempDir};
use tracing::{debug, info, warn};
use xxhash_rust::xxh3::xxh3_64;

pub const ROOT_PAGE: &str = "root";

/// How resources are assigned to pages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Paging {
    /// Everything in one page
    #[default]
    Single,
    /// One page per leading directory path of up to `depth` components
    Directory { depth: usize },
    /// Pages are hash buckets of the resource path
    Hash { buckets: u32 },
}

impl Paging {
    pub fn page(&self, resource: &str) -> String {
        match self {
            Paging::Single => ROOT_PAGE.to_string(),
            Paging::Directory { depth } => {
                let parts: Vec<&str> = resource.split('/').collect();
                let dirs = &parts[..parts.len().saturating_sub(1)];
                let prefix = &dirs[..dirs.len().min(*depth)];
                if prefix.is_empty() {
                    return ROOT_PAGE.to_string();
                }
                let digest = blake3::hash(prefix.join("/").as_bytes());
                digest.to_hex().as_str()[..12].to_string()
            }
            Paging::Hash { buckets } => {
                let bucket = xxh3_64(resource.as_bytes()) % u64::from((*buckets).max(1));
                format!("b{:04}", bucket)
            }
        }
    }
}

// =============================================================================
// Relay listing, grouped by page
// =============================================================================

#[derive(Debug, Clone, Default)]
struct UpdateFiles {
    index: Option<RemoteEntry>,
    data: Option<RemoteEntry>,
}

impl UpdateFiles {
    fn is_complete(&self) -> bool {
        self.index.is_some() && self.data.is_some()
    }
}

type Signature = Vec<(String, Option<u64>, Option<DateTime<Utc>>)>;

#[derive(Debug, Clone, Default)]
struct PageFiles {
    index: Option<RemoteEntry>,
    updates: BTreeMap<DateTime<Utc>, UpdateFiles>,
}

impl PageFiles {
    /// Committed transactions, oldest first.
    fn complete(&self) -> Vec<DateTime<Utc>> {
        self.updates
            .iter()
            .filter(|(_, files)| files.is_complete())
            .map(|(ts, _)| *ts)
            .collect()
    }

    /// Newest committed transaction.
    fn live(&self) -> Option<DateTime<Utc>> {
        self.complete().last().copied()
    }

    fn latest(&self) -> Option<DateTime<Utc>> {
        self.updates.keys().last().copied()
    }

    /// Changes whenever any file of the page is written or removed.
    fn signature(&self) -> Signature {
        let updates = self
            .updates
            .values()
            .flat_map(|u| u.index.iter().chain(u.data.iter()));
        self.index
            .iter()
            .chain(updates)
            .map(|e| (e.path.clone(), e.size, e.mtime))
            .collect()
    }
}

fn group_pages(names: &SpecialNames, listing: &[RemoteEntry]) -> BTreeMap<String, PageFiles> {
    let mut pages: BTreeMap<String, PageFiles> = BTreeMap::new();
    for entry in listing {
        if entry.path.contains('/') {
            continue;
        }
        match names.classify(&entry.path) {
            SpecialKind::PageIndex => {
                if let Some(page) = names.from_page_index(&entry.path) {
                    pages.entry(page).or_default().index = Some(entry.clone());
                }
            }
            SpecialKind::UpdateIndex | SpecialKind::UpdateData => {
                let Some(update) = names.parse_update(&entry.path) else {
                    continue;
                };
                let files = pages
                    .entry(update.page)
                    .or_default()
                    .updates
                    .entry(update.timestamp)
                    .or_default();
                if update.kind == SpecialKind::UpdateIndex {
                    files.index = Some(entry.clone());
                } else {
                    files.data = Some(entry.clone());
                }
            }
            _ => {}
        }
    }
    pages
}

/// Cached view of one page.
#[derive(Debug, Clone)]
struct PageView {
    /// Persistent index with newer committed diffs applied
    index: Index,
    /// Diff of the live transaction, with its pullers
    live: Option<Index>,
    signature: Signature,
    observed: Instant,
}

/// Update timestamps have millisecond resolution and must keep increasing.
fn next_timestamp(floor: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let now = Utc::now();
    let now = Utc
        .timestamp_millis_opt(now.timestamp_millis())
        .single()
        .unwrap_or(now);
    match floor {
        Some(floor) if now <= floor => floor + ChronoDuration::milliseconds(1),
        _ => now,
    }
}

async fn run_blocking<T, F>(path: &Path, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| SyncError::Archive {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?
}

// =============================================================================
// Transactions
// =============================================================================

/// An open write transaction. Holds the page write lock until committed or
/// rolled back.
#[derive(Debug)]
pub struct UpdateWriter {
    page: String,
    lock: Lock,
    staging: TempDir,
    diff: Index,
    members: BTreeMap<String, PathBuf>,
    /// Newest timestamp seen on the page
    floor: Option<DateTime<Utc>>,
    /// Own unread transaction folded into this one
    superseded: Option<DateTime<Utc>>,
}

impl UpdateWriter {
    fn new(page: &str, lock: Lock, client: &str, floor: Option<DateTime<Utc>>) -> Result<Self> {
        Ok(Self {
            page: page.to_string(),
            lock,
            staging: TempDir::new()?,
            diff: Index {
                pusher: Some(client.to_string()),
                ..Default::default()
            },
            members: BTreeMap::new(),
            floor,
            superseded: None,
        })
    }

    pub fn page(&self) -> &str {
        &self.page
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn resources(&self) -> impl Iterator<Item = &str> {
        self.members.keys().map(String::as_str)
    }

    /// Copy `local` into the transaction as `resource`.
    pub async fn stage(&mut self, resource: &str, local: &Path, metadata: &Metadata) -> Result<()> {
        let staged = archive::validate_member(self.staging.path(), resource)?;
        if let Some(parent) = staged.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(local, &staged).await?;

        let mut metadata = metadata.clone();
        metadata.pusher = self.diff.pusher.clone();
        metadata.target = Some(resource.to_string());
        self.diff.entries.insert(resource.to_string(), metadata);
        self.members.insert(resource.to_string(), staged);
        Ok(())
    }
}

/// An open read of the live transaction of a page, unpacked locally.
#[derive(Debug)]
pub struct UpdateReader {
    page: String,
    lock: Lock,
    timestamp: DateTime<Utc>,
    diff: Index,
    staging: TempDir,
    resources: HashSet<String>,
}

impl UpdateReader {
    pub fn page(&self) -> &str {
        &self.page
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn metadata(&self, resource: &str) -> Option<&Metadata> {
        self.diff.entries.get(resource)
    }

    /// Unpacked copy of `resource`, if the transaction carries it.
    pub fn staged(&self, resource: &str) -> Option<PathBuf> {
        if !self.resources.contains(resource) {
            return None;
        }
        archive::validate_member(self.staging.path(), resource).ok()
    }
}

// =============================================================================
// Relay
// =============================================================================

pub struct PagedRelay {
    backend: Arc<dyn Backend>,
    locker: Locker,
    names: SpecialNames,
    paging: Paging,
    /// Expected number of readers per transaction (`None`: one)
    readers: Option<usize>,
    compress: bool,
    /// How long a page view is trusted without looking at the relay
    cooldown: Duration,
    views: HashMap<String, PageView>,
    writers: HashMap<String, UpdateWriter>,
    reads: HashMap<String, UpdateReader>,
    /// Pages found busy during the current round
    busy_writes: HashSet<String>,
    busy_reads: HashSet<String>,
}

impl PagedRelay {
    pub fn new(
        backend: Arc<dyn Backend>,
        locker: Locker,
        names: SpecialNames,
        paging: Paging,
        readers: Option<usize>,
    ) -> Self {
        Self {
            backend,
            locker,
            names,
            paging,
            readers,
            compress: false,
            cooldown: Duration::from_secs(5),
            views: HashMap::new(),
            writers: HashMap::new(),
            reads: HashMap::new(),
            busy_writes: HashSet::new(),
            busy_reads: HashSet::new(),
        }
    }

    pub fn compress(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    pub fn cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn paging(&self) -> &Paging {
        &self.paging
    }

    fn terminates(&self, pullers: &[String]) -> bool {
        pullers.len() >= self.readers.unwrap_or(1)
    }

    async fn list_pages(&self) -> Result<BTreeMap<String, PageFiles>> {
        let listing = self.backend.list("", false).await?;
        Ok(group_pages(&self.names, &listing))
    }

    async fn page_files(&self, page: &str) -> Result<PageFiles> {
        Ok(self.list_pages().await?.remove(page).unwrap_or_default())
    }

    async fn read_index(&self, file: &str) -> Result<Option<Index>> {
        match self.backend.try_read_bytes(file).await? {
            Some(bytes) => Index::parse(file, &bytes).map(Some),
            None => Ok(None),
        }
    }

    async fn write_index(&self, file: &str, index: &Index) -> Result<()> {
        self.backend
            .write_bytes(file, &index.serialize(self.compress)?)
            .await
    }

    async fn load_persistent(&self, page: &str) -> Result<Index> {
        Ok(self
            .read_index(&self.names.page_index(page))
            .await?
            .unwrap_or_default())
    }

    async fn load_view(&self, page: &str, files: &PageFiles) -> Result<PageView> {
        let mut index = self.load_persistent(page).await?;
        let mark = index.timestamp;
        let mut live = None;
        for ts in files.complete() {
            // Consumed between listing and reading
            let Some(diff) = self.read_index(&self.names.update_index(page, &ts)).await? else {
                continue;
            };
            if mark.map_or(true, |m| ts > m) {
                index.merge(&diff);
            }
            live = Some(diff);
        }
        Ok(PageView {
            index,
            live,
            signature: files.signature(),
            observed: Instant::now(),
        })
    }

    async fn reload(&self, page: &str, cached: Option<PageView>, files: &PageFiles) -> Result<PageView> {
        match cached {
            Some(mut view) if view.signature == files.signature() => {
                view.observed = Instant::now();
                Ok(view)
            }
            _ => {
                debug!(page, "loading page index");
                self.load_view(page, files).await
            }
        }
    }

    async fn view(&mut self, page: &str) -> Result<&PageView> {
        let view = match self.views.remove(page) {
            Some(view) if view.observed.elapsed() < self.cooldown => view,
            cached => {
                let files = self.page_files(page).await?;
                self.reload(page, cached, &files).await?
            }
        };
        let view: &PageView = self.views.entry(page.to_string()).or_insert(view);
        Ok(view)
    }

    /// Persistent index of `page` merged with every committed diff newer
    /// than its consolidation mark.
    pub async fn get_page_index(&mut self, page: &str) -> Result<Index> {
        Ok(self.view(page).await?.index.clone())
    }

    async fn delete_update(&self, page: &str, ts: &DateTime<Utc>) -> Result<()> {
        self.backend.delete(&self.names.update_index(page, ts)).await?;
        self.backend.delete(&self.names.update_data(page, ts)).await
    }

    /// Remove lone halves of crashed commits.
    async fn delete_incomplete(&self, page: &str, files: &PageFiles) -> Result<usize> {
        let mut deleted = 0;
        for update in files.updates.values().filter(|u| !u.is_complete()) {
            for entry in update.index.iter().chain(update.data.iter()) {
                warn!(page, file = %entry.path, "deleting incomplete update");
                self.backend.delete(&entry.path).await?;
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    /// Fold committed diffs newer than the mark into the persistent index.
    async fn consolidate(&self, page: &str, files: &PageFiles, persistent: &mut Index) -> Result<()> {
        let mark = persistent.timestamp;
        let mut changed = false;
        for ts in files.complete() {
            if mark.map_or(false, |m| ts <= m) {
                continue;
            }
            let Some(diff) = self.read_index(&self.names.update_index(page, &ts)).await? else {
                continue;
            };
            persistent.merge(&diff);
            changed = true;
        }
        if changed {
            self.write_index(&self.names.page_index(page), persistent).await?;
            debug!(page, "page index consolidated");
        }
        Ok(())
    }

    /// Open a write transaction on `page`; `None` when the page is locked or
    /// still carries a transaction somebody else has to read.
    pub async fn begin_update(&mut self, page: &str) -> Result<Option<UpdateWriter>> {
        let target = self.names.page_target(page);
        let Some(lock) = self.locker.acquire(&target, LockMode::Write, false).await? else {
            debug!(page, "page busy");
            return Ok(None);
        };
        match self.prepare_update(page, &lock).await {
            Ok(Some(writer)) => Ok(Some(writer)),
            Ok(None) => {
                self.locker.release(lock).await?;
                Ok(None)
            }
            Err(e) => self.locker.release_after(lock, Err(e)).await,
        }
    }

    async fn prepare_update(&self, page: &str, lock: &Lock) -> Result<Option<UpdateWriter>> {
        let client = self.locker.client();
        let files = self.page_files(page).await?;
        self.delete_incomplete(page, &files).await?;

        let mut persistent = self.load_persistent(page).await?;
        self.consolidate(page, &files, &mut persistent).await?;

        // Only the newest transaction can still be pending; older ones
        // were consumed or folded into it.
        let mut live = None;
        for (i, ts) in files.complete().into_iter().rev().enumerate() {
            let Some(diff) = self.read_index(&self.names.update_index(page, &ts)).await? else {
                continue;
            };
            if i == 0 && !self.terminates(&diff.pullers) {
                live = Some((ts, diff));
            } else {
                self.delete_update(page, &ts).await?;
            }
        }

        let floor = match (persistent.timestamp, files.latest()) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        let mut writer = UpdateWriter::new(page, lock.clone(), client, floor)?;

        if let Some((ts, diff)) = live {
            if diff.pusher.as_deref() != Some(client) || !diff.pullers.is_empty() {
                debug!(page, pullers = diff.pullers.len(), "transaction pending");
                return Ok(None);
            }
            // Nobody read our previous transaction yet: carry it over
            let packed = NamedTempFile::new()?;
            self.backend
                .get(&self.names.update_data(page, &ts), packed.path())
                .await?;
            let archive_path = packed.path().to_path_buf();
            let staging = writer.staging.path().to_path_buf();
            let unpacked = run_blocking(packed.path(), move || archive::unpack(&archive_path, &staging)).await?;
            for resource in unpacked {
                if let Some(metadata) = diff.entries.get(&resource) {
                    let staged = archive::validate_member(writer.staging.path(), &resource)?;
                    writer.diff.entries.insert(resource.clone(), metadata.clone());
                    writer.members.insert(resource, staged);
                }
            }
            writer.superseded = Some(ts);
            debug!(page, carried = writer.members.len(), "superseding own transaction");
        }
        Ok(Some(writer))
    }

    /// Publish the staged files: data first, diff index last, then drop the
    /// superseded transaction and release the page.
    pub async fn commit_update(&mut self, writer: UpdateWriter) -> Result<()> {
        let result = self.commit_locked(&writer).await;
        self.views.remove(&writer.page);
        self.locker.release_after(writer.lock, result).await
    }

    async fn commit_locked(&self, writer: &UpdateWriter) -> Result<()> {
        if writer.is_empty() {
            debug!(page = %writer.page, "empty update, nothing to commit");
            return Ok(());
        }
        let page = writer.page.as_str();
        let timestamp = next_timestamp(writer.floor);
        let mut diff = writer.diff.clone();
        diff.timestamp = Some(timestamp);
        let diff_bytes = diff.serialize(self.compress)?;

        let packed = NamedTempFile::new()?;
        let members: Vec<(String, PathBuf)> = writer
            .members
            .iter()
            .map(|(r, p)| (r.clone(), p.clone()))
            .collect();
        let dest = packed.path().to_path_buf();
        run_blocking(packed.path(), move || archive::pack(&members, &dest)).await?;

        let data_file = self.names.update_data(page, &timestamp);
        self.backend.put(packed.path(), &data_file).await?;
        if let Err(e) = self
            .backend
            .write_bytes(&self.names.update_index(page, &timestamp), &diff_bytes)
            .await
        {
            if let Err(cleanup) = self.backend.delete(&data_file).await {
                warn!(page, error = %cleanup, "could not remove uncommitted data");
            }
            return Err(e);
        }

        if let Some(old) = writer.superseded {
            self.delete_update(page, &old).await?;
        }
        info!(page, files = diff.entries.len(), "update committed");
        Ok(())
    }

    pub async fn rollback_update(&mut self, writer: UpdateWriter) -> Result<()> {
        debug!(page = %writer.page, staged = writer.members.len(), "update rolled back");
        self.locker.release(writer.lock).await
    }

    /// Open the live transaction of `page` for reading; `None` when the
    /// page is locked, has nothing new, or this client already took it.
    pub async fn begin_read(&mut self, page: &str) -> Result<Option<UpdateReader>> {
        let target = self.names.page_target(page);
        let Some(lock) = self.locker.acquire(&target, LockMode::Read, false).await? else {
            debug!(page, "page busy");
            return Ok(None);
        };
        match self.prepare_read(page, &lock).await {
            Ok(Some(reader)) => Ok(Some(reader)),
            Ok(None) => {
                self.locker.release(lock).await?;
                Ok(None)
            }
            Err(e) => self.locker.release_after(lock, Err(e)).await,
        }
    }

    async fn prepare_read(&self, page: &str, lock: &Lock) -> Result<Option<UpdateReader>> {
        let client = self.locker.client();
        let files = self.page_files(page).await?;
        let Some(timestamp) = files.live() else {
            return Ok(None);
        };
        let Some(diff) = self.read_index(&self.names.update_index(page, &timestamp)).await? else {
            return Ok(None);
        };
        if diff.has_puller(client) || diff.pusher.as_deref() == Some(client) {
            debug!(page, "transaction already consumed by this client");
            return Ok(None);
        }

        let staging = TempDir::new()?;
        let packed = NamedTempFile::new()?;
        self.backend
            .get(&self.names.update_data(page, &timestamp), packed.path())
            .await?;
        let archive_path = packed.path().to_path_buf();
        let dest = staging.path().to_path_buf();
        let resources = run_blocking(packed.path(), move || archive::unpack(&archive_path, &dest)).await?;

        debug!(page, files = resources.len(), "transaction opened for reading");
        Ok(Some(UpdateReader {
            page: page.to_string(),
            lock: lock.clone(),
            timestamp,
            diff,
            staging,
            resources: resources.into_iter().collect(),
        }))
    }

    /// Record this client as a puller. When `terminate` holds for the new
    /// puller list, the diff is consolidated and the transaction deleted.
    /// Returns whether it was.
    pub async fn finish_read(
        &mut self,
        reader: UpdateReader,
        terminate: &(dyn Fn(&[String]) -> bool + Sync),
    ) -> Result<bool> {
        let result = self.finish_locked(&reader, terminate).await;
        self.views.remove(&reader.page);
        self.locker.release_after(reader.lock, result).await
    }

    async fn finish_locked(
        &self,
        reader: &UpdateReader,
        terminate: &(dyn Fn(&[String]) -> bool + Sync),
    ) -> Result<bool> {
        let page = reader.page.as_str();
        let mut diff = reader.diff.clone();
        diff.add_puller(self.locker.client());

        if !terminate(&diff.pullers) {
            self.write_index(&self.names.update_index(page, &reader.timestamp), &diff)
                .await?;
            info!(page, pullers = diff.pullers.len(), "update pulled");
            return Ok(false);
        }

        let mut persistent = self.load_persistent(page).await?;
        if persistent.timestamp.map_or(true, |m| reader.timestamp > m) {
            persistent.merge(&diff);
            self.write_index(&self.names.page_index(page), &persistent).await?;
        }
        self.delete_update(page, &reader.timestamp).await?;
        info!(page, pullers = diff.pullers.len(), "update consumed");
        Ok(true)
    }

    pub async fn abort_read(&mut self, reader: UpdateReader) -> Result<()> {
        debug!(page = %reader.page, "read aborted");
        self.locker.release(reader.lock).await
    }

    /// Release page locks left by a crash of this client (or of an
    /// unidentified one, once stale) after deleting incomplete updates.
    /// Returns the number of repaired locks and deleted files.
    pub async fn repair_updates(&mut self) -> Result<usize> {
        let listing = self.backend.list("", false).await?;
        let pages = group_pages(&self.names, &listing);
        let client = self.locker.client().to_string();
        let timeout = self.locker.policy().timeout;
        let now = Utc::now();

        let mut repaired = 0;
        for lock in self.locker.scan(&listing).await? {
            let Some(page) = self.names.from_page_target(&lock.target) else {
                continue;
            };
            if !lock.is_corrupted(&client, timeout, now) {
                continue;
            }
            if let Some(files) = pages.get(&page) {
                repaired += self.delete_incomplete(&page, files).await?;
            }
            self.locker.break_lock(&lock).await?;
            self.views.remove(&page);
            repaired += 1;
            warn!(page = %page, "page repaired");
        }
        Ok(repaired)
    }

    async fn reader_for(&mut self, resource: &str) -> Result<Option<&UpdateReader>> {
        let page = self.paging.page(resource);
        if !self.reads.contains_key(&page) {
            if self.busy_reads.contains(&page) {
                return Ok(None);
            }
            match self.begin_read(&page).await? {
                Some(reader) => {
                    self.reads.insert(page.clone(), reader);
                }
                None => {
                    self.busy_reads.insert(page);
                    return Ok(None);
                }
            }
        }
        Ok(self.reads.get(&page))
    }
}

#[async_trait]
impl Relay for PagedRelay {
    fn client(&self) -> &str {
        self.locker.client()
    }

    async fn sanity_check(&mut self, _workspace: &Path) -> Result<usize> {
        self.repair_updates().await
    }

    /// Resources of live transactions this client neither pushed nor pulled.
    async fn list_ready(&mut self) -> Result<Vec<String>> {
        let client = self.locker.client().to_string();
        let mut ready = Vec::new();
        for (page, files) in self.list_pages().await? {
            if files.live().is_none() {
                continue;
            }
            let cached = self.views.remove(&page);
            let view = self.reload(&page, cached, &files).await?;
            if let Some(diff) = &view.live {
                if !diff.has_puller(&client) && diff.pusher.as_deref() != Some(client.as_str()) {
                    ready.extend(diff.entries.keys().cloned());
                }
            }
            self.views.insert(page, view);
        }
        Ok(ready)
    }

    async fn get_metadata(&mut self, resource: &str) -> Result<Option<Metadata>> {
        let page = self.paging.page(resource);
        Ok(self.view(&page).await?.index.entries.get(resource).cloned())
    }

    async fn push(&mut self, local: &Path, resource: &str, metadata: &Metadata) -> Result<Outcome> {
        let page = self.paging.page(resource);
        if !self.writers.contains_key(&page) {
            if self.busy_writes.contains(&page) {
                return Ok(Outcome::Skipped);
            }
            match self.begin_update(&page).await? {
                Some(writer) => {
                    self.writers.insert(page.clone(), writer);
                }
                None => {
                    self.busy_writes.insert(page);
                    return Ok(Outcome::Skipped);
                }
            }
        }
        match self.writers.get_mut(&page) {
            Some(writer) => {
                writer.stage(resource, local, metadata).await?;
                debug!(resource, page = %page, "staged");
                Ok(Outcome::Done)
            }
            None => Ok(Outcome::Skipped),
        }
    }

    async fn pop(&mut self, resource: &str, local: &Path) -> Result<Outcome> {
        let Some(staged) = self.reader_for(resource).await?.and_then(|r| r.staged(resource)) else {
            return Ok(Outcome::Skipped);
        };
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(&staged, local).await?;
        Ok(Outcome::Done)
    }

    async fn acknowledge(&mut self, resource: &str) -> Result<Outcome> {
        match self.reader_for(resource).await? {
            Some(reader) if reader.resources.contains(resource) => Ok(Outcome::Done),
            _ => Ok(Outcome::Skipped),
        }
    }

    async fn flush(&mut self, success: bool) -> Result<()> {
        let readers = self.readers.unwrap_or(1);
        let terminate = move |pullers: &[String]| pullers.len() >= readers;
        let mut first_error = None;

        for (page, writer) in std::mem::take(&mut self.writers) {
            let result = if success {
                self.commit_update(writer).await
            } else {
                self.rollback_update(writer).await
            };
            if let Err(e) = result {
                warn!(page = %page, error = %e, "closing update failed");
                first_error = first_error.or(Some(e));
            }
        }
        for (page, reader) in std::mem::take(&mut self.reads) {
            let result = if success {
                self.finish_read(reader, &terminate).await.map(|_| ())
            } else {
                self.abort_read(reader).await
            };
            if let Err(e) = result {
                warn!(page = %page, error = %e, "closing read failed");
                first_error = first_error.or(Some(e));
            }
        }
        self.busy_writes.clear();
        self.busy_reads.clear();

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
