//! Content of lock and placeholder files.
//!
//! Both are small tagged text records: a `<tag>%<version>` first line, then
//! `key: value` lines. Older clients wrote untagged content (a bare owner id
//! for locks, a bare timestamp for placeholders); those still parse.

use crate::error::{Result, SyncError};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use std::fmt;
use std::time::SystemTime;

pub const LOCK_TAG: &str = "lock";
pub const METADATA_TAG: &str = "metadata";
pub const RECORD_VERSION: &str = "1";

/// Timestamp format in metadata records (second precision, UTC).
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(s.trim(), TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Drop sub-second precision so local mtimes compare with stored timestamps.
pub fn truncate_timestamp(time: SystemTime) -> DateTime<Utc> {
    let ts = DateTime::<Utc>::from(time);
    Utc.timestamp_opt(ts.timestamp(), 0).single().unwrap_or(ts)
}

/// Split a tagged record into its version and `key: value` pairs.
///
/// Returns `None` when the first line does not carry `tag`.
fn parse_tagged<'a>(tag: &str, content: &'a str) -> Option<(&'a str, Vec<(&'a str, &'a str)>)> {
    let mut lines = content.lines();
    let first = lines.next()?.trim_end();
    let version = first.strip_prefix(tag)?.strip_prefix('%')?;
    let pairs = lines
        .filter_map(|line| {
            let line = line.trim_end_matches('\r');
            let (key, value) = line.split_once(':')?;
            Some((key.trim(), value.strip_prefix(' ').unwrap_or(value)))
        })
        .collect();
    Some((version, pairs))
}

// =============================================================================
// Locks
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Read,
    Write,
}

impl LockMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockMode::Read => "r",
            LockMode::Write => "w",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "r" | "read" => Some(LockMode::Read),
            "w" | "write" => Some(LockMode::Write),
            _ => None,
        }
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Content of a lock file.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LockInfo {
    /// `None` for legacy locks
    pub version: Option<String>,
    pub owner: Option<String>,
    pub mode: Option<LockMode>,
}

impl LockInfo {
    pub fn new(owner: &str, mode: LockMode) -> Self {
        Self {
            version: Some(RECORD_VERSION.to_string()),
            owner: Some(owner.to_string()),
            mode: Some(mode),
        }
    }

    pub fn serialize(&self) -> String {
        match &self.version {
            None => self.owner.clone().map(|o| format!("{}\n", o)).unwrap_or_default(),
            Some(version) => {
                let mut out = format!("{}%{}\n", LOCK_TAG, version);
                if let Some(owner) = &self.owner {
                    out.push_str(&format!("owner: {}\n", owner));
                }
                if let Some(mode) = self.mode {
                    out.push_str(&format!("mode: {}\n", mode));
                }
                out
            }
        }
    }

    /// Never fails: an unreadable lock is a lock with no recorded owner.
    pub fn parse(content: &str) -> Self {
        if let Some((version, pairs)) = parse_tagged(LOCK_TAG, content) {
            let mut info = LockInfo {
                version: Some(version.to_string()),
                ..Default::default()
            };
            for (key, value) in pairs {
                match key {
                    "owner" if !value.is_empty() => info.owner = Some(value.to_string()),
                    "mode" => info.mode = LockMode::parse(value),
                    _ => {}
                }
            }
            return info;
        }
        let owner = content.lines().next().map(str::trim).unwrap_or_default();
        LockInfo {
            version: None,
            owner: (!owner.is_empty()).then(|| owner.to_string()),
            mode: None,
        }
    }

    pub fn is_owned_by(&self, client: &str) -> bool {
        self.owner.as_deref() == Some(client)
    }
}

// =============================================================================
// Metadata
// =============================================================================

/// Version descriptor of a regular file.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Metadata {
    pub pusher: Option<String>,
    pub target: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub checksum: Option<String>,
}

impl Metadata {
    pub fn new(
        pusher: &str,
        target: &str,
        timestamp: Option<DateTime<Utc>>,
        checksum: Option<String>,
    ) -> Self {
        Self {
            pusher: Some(pusher.to_string()),
            target: Some(target.to_string()),
            timestamp,
            checksum,
        }
    }

    /// True if there is anything worth writing into a placeholder.
    pub fn is_informative(&self) -> bool {
        self.timestamp.is_some() || self.checksum.is_some()
    }

    fn write_fields(&self, out: &mut String) {
        out.push_str(&format!("{}%{}\n", METADATA_TAG, RECORD_VERSION));
        if let Some(pusher) = &self.pusher {
            out.push_str(&format!("pusher: {}\n", pusher));
        }
        if let Some(target) = &self.target {
            out.push_str(&format!("target: {}\n", target));
        }
        if let Some(ts) = &self.timestamp {
            out.push_str(&format!("timestamp: {}\n", format_timestamp(ts)));
        }
        if let Some(checksum) = &self.checksum {
            out.push_str(&format!("checksum: {}\n", checksum));
        }
    }

    pub fn serialize(&self) -> String {
        let mut out = String::new();
        self.write_fields(&mut out);
        out
    }

    /// Untagged form understood by every client version: the timestamp alone.
    pub fn serialize_legacy(&self) -> String {
        self.timestamp
            .as_ref()
            .map(|ts| format!("{}\n", format_timestamp(ts)))
            .unwrap_or_default()
    }

    /// Parse a metadata record; `source` names the file for error messages.
    pub fn parse(source: &str, content: &str) -> Result<Self> {
        Placeholder::parse(source, content).map(|p| p.metadata)
    }
}

// =============================================================================
// Placeholders
// =============================================================================

/// Metadata of the last push plus the clients that already pulled it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Placeholder {
    pub metadata: Metadata,
    pub pullers: Vec<String>,
}

impl Placeholder {
    pub fn new(metadata: Metadata) -> Self {
        Self {
            metadata,
            pullers: Vec::new(),
        }
    }

    pub fn has_puller(&self, client: &str) -> bool {
        self.pullers.iter().any(|p| p == client)
    }

    /// Add `client` to the pullers; false if it was already there.
    pub fn add_puller(&mut self, client: &str) -> bool {
        if self.has_puller(client) {
            return false;
        }
        self.pullers.push(client.to_string());
        true
    }

    pub fn serialize(&self) -> String {
        let mut out = String::new();
        self.metadata.write_fields(&mut out);
        for puller in &self.pullers {
            out.push_str(&format!("puller: {}\n", puller));
        }
        out
    }

    pub fn parse(source: &str, content: &str) -> Result<Self> {
        let Some((_, pairs)) = parse_tagged(METADATA_TAG, content) else {
            // Legacy: bare timestamp
            let line = content.lines().next().unwrap_or_default().trim();
            if line.is_empty() {
                return Ok(Placeholder::default());
            }
            let ts = parse_timestamp(line).ok_or_else(|| {
                SyncError::metadata(source, format!("unparseable legacy timestamp '{}'", line))
            })?;
            return Ok(Placeholder::new(Metadata {
                timestamp: Some(ts),
                ..Default::default()
            }));
        };

        let mut placeholder = Placeholder::default();
        for (key, value) in pairs {
            match key {
                "pusher" => placeholder.metadata.pusher = Some(value.to_string()),
                "target" => placeholder.metadata.target = Some(value.to_string()),
                "checksum" if !value.is_empty() => {
                    placeholder.metadata.checksum = Some(value.to_string())
                }
                "timestamp" => {
                    let ts = parse_timestamp(value).ok_or_else(|| {
                        SyncError::metadata(source, format!("unparseable timestamp '{}'", value))
                    })?;
                    placeholder.metadata.timestamp = Some(ts);
                }
                "puller" if !value.is_empty() => {
                    placeholder.add_puller(value);
                }
                _ => {}
            }
        }
        Ok(placeholder)
    }
}
