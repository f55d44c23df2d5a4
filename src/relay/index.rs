//! Persistent and update index files of the paged protocol.
//!
//! Layout (optionally zstd-compressed as a whole):
//!
//! ```text
//! index%1
//! timestamp: 20261017T120000123
//! pusher: laptop
//!
//! docs/a.txt 97
//! <97 bytes of metadata record>
//! docs/b.txt 88
//! <88 bytes of metadata record>
//! --pullers--
//! laptop
//! desktop
//! ```

use super::naming::UPDATE_TIMESTAMP_FORMAT;
use super::record::Metadata;
use crate::error::{Result, SyncError};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use std::collections::BTreeMap;

const INDEX_TAG: &str = "index%1";
pub const PULLERS_BREAKER: &str = "--pullers--";
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];
const ZSTD_LEVEL: i32 = 3;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Index {
    /// Consolidation mark of a persistent index, or the transaction
    /// timestamp of an update index
    pub timestamp: Option<DateTime<Utc>>,
    /// Writer of an update transaction
    pub pusher: Option<String>,
    pub entries: BTreeMap<String, Metadata>,
    pub pullers: Vec<String>,
}

impl Index {
    pub fn new(timestamp: Option<DateTime<Utc>>) -> Self {
        Self {
            timestamp,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn has_puller(&self, client: &str) -> bool {
        self.pullers.iter().any(|p| p == client)
    }

    pub fn add_puller(&mut self, client: &str) -> bool {
        if self.has_puller(client) {
            return false;
        }
        self.pullers.push(client.to_string());
        true
    }

    /// Apply a diff; entries of `diff` win, the mark moves forward only.
    pub fn merge(&mut self, diff: &Index) {
        for (resource, metadata) in &diff.entries {
            self.entries.insert(resource.clone(), metadata.clone());
        }
        self.timestamp = match (self.timestamp, diff.timestamp) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
    }

    pub fn serialize(&self, compress: bool) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        out.extend_from_slice(INDEX_TAG.as_bytes());
        out.push(b'\n');
        if let Some(ts) = &self.timestamp {
            out.extend_from_slice(format!("timestamp: {}\n", ts.format(UPDATE_TIMESTAMP_FORMAT)).as_bytes());
        }
        if let Some(pusher) = &self.pusher {
            out.extend_from_slice(format!("pusher: {}\n", pusher).as_bytes());
        }
        out.push(b'\n');

        for (resource, metadata) in &self.entries {
            let record = metadata.serialize();
            out.extend_from_slice(format!("{} {}\n", resource, record.len()).as_bytes());
            out.extend_from_slice(record.as_bytes());
        }

        if !self.pullers.is_empty() {
            out.extend_from_slice(PULLERS_BREAKER.as_bytes());
            out.push(b'\n');
            for puller in &self.pullers {
                out.extend_from_slice(puller.as_bytes());
                out.push(b'\n');
            }
        }

        if compress {
            zstd::encode_all(&out[..], ZSTD_LEVEL).map_err(SyncError::Io)
        } else {
            Ok(out)
        }
    }

    /// Parse an index file; `source` names it in errors.
    pub fn parse(source: &str, raw: &[u8]) -> Result<Self> {
        let decompressed;
        let data: &[u8] = if raw.starts_with(&ZSTD_MAGIC) {
            decompressed = zstd::decode_all(raw).map_err(|e| SyncError::metadata(source, e))?;
            &decompressed
        } else {
            raw
        };

        let mut cursor = Cursor { data, pos: 0 };
        let mut index = Index::default();

        // Header block, up to the first blank line
        match cursor.line() {
            Some(INDEX_TAG) => {}
            other => {
                return Err(SyncError::metadata(
                    source,
                    format!("missing index header, found {:?}", other),
                ))
            }
        }
        loop {
            match cursor.line() {
                None | Some("") => break,
                Some(line) => {
                    if let Some(value) = line.strip_prefix("timestamp:") {
                        let naive = NaiveDateTime::parse_from_str(value.trim(), UPDATE_TIMESTAMP_FORMAT)
                            .map_err(|e| SyncError::metadata(source, e))?;
                        index.timestamp = Some(Utc.from_utc_datetime(&naive));
                    } else if let Some(value) = line.strip_prefix("pusher:") {
                        index.pusher = Some(value.trim().to_string());
                    }
                }
            }
        }

        // Records
        while let Some(line) = cursor.line() {
            if line == PULLERS_BREAKER {
                while let Some(puller) = cursor.line() {
                    if !puller.is_empty() {
                        index.add_puller(puller);
                    }
                }
                break;
            }
            let (resource, len) = line
                .rsplit_once(' ')
                .and_then(|(r, l)| l.parse::<usize>().ok().map(|l| (r, l)))
                .ok_or_else(|| SyncError::metadata(source, format!("bad record header '{}'", line)))?;
            let bytes = cursor
                .take(len)
                .ok_or_else(|| SyncError::metadata(source, format!("truncated record for '{}'", resource)))?;
            let text = std::str::from_utf8(bytes).map_err(|e| SyncError::metadata(source, e))?;
            let metadata = Metadata::parse(source, text)?;
            index.entries.insert(resource.to_string(), metadata);
        }

        Ok(index)
    }
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn line(&mut self) -> Option<&'a str> {
        if self.pos >= self.data.len() {
            return None;
        }
        let rest = &self.data[self.pos..];
        let end = rest.iter().position(|&b| b == b'\n').unwrap_or(rest.len());
        self.pos += (end + 1).min(rest.len());
        std::str::from_utf8(&rest[..end]).ok().map(|l| l.trim_end_matches('\r'))
    }

    fn take(&mut self, len: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(len)?;
        if end > self.data.len() {
            return None;
        }
        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Some(bytes)
    }
}
