//! Names of special files.
//!
//! Every special file lives next to the regular file (or page) it describes
//! and is named `<prefix><basename><suffix>`:
//!
//! ```text
//! docs/report.pdf                  regular file
//! docs/.report.pdf.lock            lock
//! docs/.report.pdf.placeholder     last pushed metadata + pullers
//! .root.page.lock                  lock of page "root"
//! .root.index                      persistent index of page "root"
//! .root.20261017T120000123.upindex update transaction (diff index)
//! .root.20261017T120000123.updata  update transaction (packed bytes)
//! ```

use crate::backend;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Timestamp embedded in update-transaction file names.
pub const UPDATE_TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%S%3f";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecialKind {
    Lock,
    Placeholder,
    Message,
    PageIndex,
    UpdateIndex,
    UpdateData,
    Regular,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpecialNames {
    pub prefix: String,
    pub lock_suffix: String,
    pub placeholder_suffix: String,
    pub message_suffix: String,
    pub index_suffix: String,
    pub update_index_suffix: String,
    pub update_data_suffix: String,
    pub page_suffix: String,
}

impl Default for SpecialNames {
    fn default() -> Self {
        Self {
            prefix: ".".to_string(),
            lock_suffix: ".lock".to_string(),
            placeholder_suffix: ".placeholder".to_string(),
            message_suffix: ".message".to_string(),
            index_suffix: ".index".to_string(),
            update_index_suffix: ".upindex".to_string(),
            update_data_suffix: ".updata".to_string(),
            page_suffix: ".page".to_string(),
        }
    }
}

/// An update-transaction file name, decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateName {
    pub page: String,
    pub timestamp: DateTime<Utc>,
    pub kind: SpecialKind,
}

impl SpecialNames {
    fn wrap(&self, name: &str, suffix: &str) -> String {
        let (dir, base) = backend::split(name);
        backend::join(dir, &format!("{}{}{}", self.prefix, base, suffix))
    }

    fn unwrap_special(&self, special: &str, suffix: &str) -> Option<String> {
        let (dir, base) = backend::split(special);
        let inner = base
            .strip_prefix(self.prefix.as_str())?
            .strip_suffix(suffix)?;
        if inner.is_empty() {
            return None;
        }
        Some(backend::join(dir, inner))
    }

    pub fn lock(&self, name: &str) -> String {
        self.wrap(name, &self.lock_suffix)
    }

    pub fn placeholder(&self, name: &str) -> String {
        self.wrap(name, &self.placeholder_suffix)
    }

    pub fn message(&self, name: &str) -> String {
        self.wrap(name, &self.message_suffix)
    }

    pub fn from_lock(&self, lock: &str) -> Option<String> {
        self.unwrap_special(lock, &self.lock_suffix)
    }

    pub fn from_placeholder(&self, placeholder: &str) -> Option<String> {
        self.unwrap_special(placeholder, &self.placeholder_suffix)
    }

    pub fn from_message(&self, message: &str) -> Option<String> {
        self.unwrap_special(message, &self.message_suffix)
    }

    /// Lock target standing for a whole page.
    pub fn page_target(&self, page: &str) -> String {
        format!("{}{}", page, self.page_suffix)
    }

    pub fn from_page_target(&self, target: &str) -> Option<String> {
        target
            .strip_suffix(self.page_suffix.as_str())
            .filter(|page| !page.is_empty() && !page.contains('/'))
            .map(str::to_string)
    }

    pub fn page_index(&self, page: &str) -> String {
        format!("{}{}{}", self.prefix, page, self.index_suffix)
    }

    pub fn from_page_index(&self, name: &str) -> Option<String> {
        name.strip_prefix(self.prefix.as_str())?
            .strip_suffix(self.index_suffix.as_str())
            .filter(|page| !page.is_empty() && !page.contains('/'))
            .map(str::to_string)
    }

    pub fn update_index(&self, page: &str, timestamp: &DateTime<Utc>) -> String {
        format!(
            "{}{}.{}{}",
            self.prefix,
            page,
            timestamp.format(UPDATE_TIMESTAMP_FORMAT),
            self.update_index_suffix
        )
    }

    pub fn update_data(&self, page: &str, timestamp: &DateTime<Utc>) -> String {
        format!(
            "{}{}.{}{}",
            self.prefix,
            page,
            timestamp.format(UPDATE_TIMESTAMP_FORMAT),
            self.update_data_suffix
        )
    }

    /// Decode `.<page>.<ts><suffix>` for both update-file kinds.
    pub fn parse_update(&self, name: &str) -> Option<UpdateName> {
        let (kind, suffix) = if name.ends_with(self.update_index_suffix.as_str()) {
            (SpecialKind::UpdateIndex, &self.update_index_suffix)
        } else if name.ends_with(self.update_data_suffix.as_str()) {
            (SpecialKind::UpdateData, &self.update_data_suffix)
        } else {
            return None;
        };
        let inner = name
            .strip_prefix(self.prefix.as_str())?
            .strip_suffix(suffix.as_str())?;
        let (page, ts) = inner.rsplit_once('.')?;
        if page.is_empty() {
            return None;
        }
        let naive = NaiveDateTime::parse_from_str(ts, UPDATE_TIMESTAMP_FORMAT).ok()?;
        Some(UpdateName {
            page: page.to_string(),
            timestamp: Utc.from_utc_datetime(&naive),
            kind,
        })
    }

    /// Classify a listed path by its basename.
    pub fn classify(&self, path: &str) -> SpecialKind {
        let (_, base) = backend::split(path);
        if !base.starts_with(self.prefix.as_str()) || base.len() <= self.prefix.len() {
            return SpecialKind::Regular;
        }
        if base.ends_with(self.lock_suffix.as_str()) {
            SpecialKind::Lock
        } else if base.ends_with(self.placeholder_suffix.as_str()) {
            SpecialKind::Placeholder
        } else if base.ends_with(self.message_suffix.as_str()) {
            SpecialKind::Message
        } else if base.ends_with(self.update_index_suffix.as_str()) {
            SpecialKind::UpdateIndex
        } else if base.ends_with(self.update_data_suffix.as_str()) {
            SpecialKind::UpdateData
        } else if base.ends_with(self.index_suffix.as_str()) {
            SpecialKind::PageIndex
        } else {
            SpecialKind::Regular
        }
    }

    pub fn is_special(&self, path: &str) -> bool {
        self.classify(path) != SpecialKind::Regular
    }
}
