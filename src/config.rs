//! Configuration file.
//!
//! ```toml
//! keep_alive = true
//! restart_delay = 60
//!
//! [[repository]]
//! name = "docs"
//! local = "/home/me/docs"
//! protocol = "local"
//! address = "/mnt/relay/docs"
//! readers = 2
//! paging = { kind = "directory", depth = 1 }
//!
//! [notify]
//! to = "admin@example.org"
//! ```
//!
//! Durations are whole seconds.

use crate::error::{Result, SyncError};
use crate::notify::NotifyConfig;
use crate::relay::naming::SpecialNames;
use crate::relay::paged::Paging;
use crate::relay::LockPolicy;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Overrides the host name as default client id.
pub const CLIENT_ENV: &str = "RELAY_SYNC_CLIENT";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    Download,
    Upload,
    #[default]
    Both,
}

impl SyncMode {
    pub fn downloads(&self) -> bool {
        matches!(self, SyncMode::Download | SyncMode::Both)
    }

    pub fn uploads(&self) -> bool {
        matches!(self, SyncMode::Upload | SyncMode::Both)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Restart workers that stopped on an error
    pub keep_alive: bool,
    pub restart_delay: u64,
    /// Mail a maintainer when a worker stops on an error
    pub notify: Option<NotifyConfig>,
    pub repository: Vec<RepositoryConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            keep_alive: false,
            restart_delay: 60,
            notify: None,
            repository: Vec::new(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| SyncError::Config(format!("{}: {}", path.display(), e)))?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(text).map_err(|e| SyncError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.repository.is_empty() {
            return Err(SyncError::Config("no repository configured".to_string()));
        }
        if let Some(notify) = &self.notify {
            notify.validate()?;
        }
        let mut seen = HashSet::new();
        for repo in &self.repository {
            repo.validate()?;
            if !seen.insert(repo.name.as_str()) {
                return Err(SyncError::Config(format!(
                    "duplicate repository name '{}'",
                    repo.name
                )));
            }
        }
        Ok(())
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_secs(self.restart_delay)
    }
}

/// One synchronized directory and the relay it goes through.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    pub name: String,
    /// Local workspace
    pub local: PathBuf,
    /// Backend registry key
    pub protocol: String,
    pub address: String,
    /// Helper binary for backends driving an external tool
    pub helper: Option<String>,
    /// Id recorded in locks, metadata and puller lists
    pub client: String,
    pub mode: SyncMode,
    /// Expected number of readers of every pushed version (`None`: one)
    pub readers: Option<usize>,
    pub cipher: String,
    /// Compare checksums, not only timestamps
    pub checksum: bool,
    pub quota_mb: Option<f64>,
    pub quota_refresh: u64,
    pub lock_timeout: u64,
    pub lock_retry: u64,
    /// `None`: wait forever in blocking acquisitions
    pub lock_wait: Option<u64>,
    /// Wait for busy locks instead of skipping files (flat protocol)
    pub blocking: bool,
    /// Paged protocol instead of the flat one
    pub index: bool,
    pub paging: Paging,
    pub compress_index: bool,
    pub index_cooldown: u64,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    /// Only files with these extensions (empty: all)
    pub extensions: Vec<String>,
    pub initial_delay: u64,
    pub max_delay: u64,
    pub max_iter: u32,
    pub names: SpecialNames,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            local: PathBuf::new(),
            protocol: "local".to_string(),
            address: String::new(),
            helper: None,
            client: default_client(),
            mode: SyncMode::Both,
            readers: None,
            cipher: "plain".to_string(),
            checksum: true,
            quota_mb: None,
            quota_refresh: 300,
            lock_timeout: 3600,
            lock_retry: 1,
            lock_wait: Some(60),
            blocking: false,
            index: false,
            paging: Paging::Single,
            compress_index: false,
            index_cooldown: 5,
            include: Vec::new(),
            exclude: Vec::new(),
            extensions: Vec::new(),
            initial_delay: 1,
            max_delay: 300,
            max_iter: 20,
            names: SpecialNames::default(),
        }
    }
}

pub fn default_client() -> String {
    if let Ok(client) = std::env::var(CLIENT_ENV) {
        if !client.trim().is_empty() {
            return client.trim().to_string();
        }
    }
    whoami::fallible::hostname().unwrap_or_else(|_| whoami::username())
}

impl RepositoryConfig {
    pub fn new(name: &str, local: impl Into<PathBuf>, address: &str) -> Self {
        Self {
            name: name.to_string(),
            local: local.into(),
            address: address.to_string(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |message: String| Err(SyncError::Config(format!("[{}] {}", self.name, message)));

        if self.name.is_empty() {
            return Err(SyncError::Config("repository without a name".to_string()));
        }
        if self.local.as_os_str().is_empty() {
            return fail("'local' is required".to_string());
        }
        if self.address.is_empty() {
            return fail("'address' is required".to_string());
        }
        // Ids end up in line-oriented records
        if self.client.is_empty() || self.client.contains(char::is_whitespace) {
            return fail(format!("invalid client id '{}'", self.client));
        }
        if self.readers == Some(0) {
            return fail("'readers' must be at least 1".to_string());
        }
        if let Paging::Hash { buckets: 0 } = self.paging {
            return fail("hash paging needs at least one bucket".to_string());
        }
        if self.max_iter == 0 {
            return fail("'max_iter' must be at least 1".to_string());
        }
        if self.max_delay < self.initial_delay {
            return fail("'max_delay' is shorter than 'initial_delay'".to_string());
        }
        if let Some(quota) = self.quota_mb {
            if quota.is_nan() || quota <= 0.0 {
                return fail(format!("invalid quota {}", quota));
            }
        }
        for pattern in self.include.iter().chain(self.exclude.iter()) {
            glob::Pattern::new(pattern)
                .map_err(|e| SyncError::Config(format!("[{}] bad pattern '{}': {}", self.name, pattern, e)))?;
        }
        if self.names.prefix.is_empty() {
            return fail("special-file prefix must not be empty".to_string());
        }
        Ok(())
    }

    pub fn lock_policy(&self) -> LockPolicy {
        LockPolicy {
            timeout: Duration::from_secs(self.lock_timeout),
            retry: Duration::from_secs(self.lock_retry),
            wait: self.lock_wait.map(Duration::from_secs),
        }
    }

    pub fn quota_refresh(&self) -> Duration {
        Duration::from_secs(self.quota_refresh)
    }

    pub fn index_cooldown(&self) -> Duration {
        Duration::from_secs(self.index_cooldown)
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_secs(self.initial_delay)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_secs(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const SAMPLE: &str = r#"
keep_alive = true
restart_delay = 10

[notify]
to = "ops@example.org"

[[repository]]
name = "docs"
local = "/home/me/docs"
address = "/mnt/relay/docs"
client = "laptop"
mode = "upload"
readers = 2
quota_mb = 500
index = true
paging = { kind = "directory", depth = 1 }
exclude = ["*.tmp"]

[[repository]]
name = "photos"
local = "/home/me/photos"
protocol = "rclone"
address = "remote:photos"
client = "laptop"

[repository.names]
prefix = "~"
"#;

    #[test]
    fn test_parse_sample() {
        let config = Config::parse(SAMPLE).unwrap();
        assert!(config.keep_alive);
        assert_eq!(config.restart_delay(), Duration::from_secs(10));
        let notify = config.notify.as_ref().unwrap();
        assert_eq!(notify.to, "ops@example.org");
        assert_eq!(notify.command, vec!["sendmail", "-t"]);
        assert_eq!(config.repository.len(), 2);

        let docs = &config.repository[0];
        assert_eq!(docs.mode, SyncMode::Upload);
        assert!(!docs.mode.downloads());
        assert_eq!(docs.readers, Some(2));
        assert_eq!(docs.quota_mb, Some(500.0));
        assert_eq!(docs.paging, Paging::Directory { depth: 1 });
        assert_eq!(docs.protocol, "local");
        assert_eq!(docs.cipher, "plain");
        assert_eq!(docs.lock_policy().timeout, Duration::from_secs(3600));

        let photos = &config.repository[1];
        assert_eq!(photos.protocol, "rclone");
        assert_eq!(photos.names.prefix, "~");
        assert_eq!(photos.names.lock_suffix, ".lock");
        assert!(!photos.index);
    }

    #[test]
    fn test_rejects_invalid() {
        assert!(Config::parse("").is_err());

        let dup = r#"
[[repository]]
name = "a"
local = "/a"
address = "/r"
client = "c"
[[repository]]
name = "a"
local = "/b"
address = "/r2"
client = "c"
"#;
        assert!(matches!(Config::parse(dup), Err(SyncError::Config(_))));

        let mut repo = RepositoryConfig::new("a", "/a", "/r");
        repo.client = "two words".to_string();
        assert!(repo.validate().is_err());

        let mut repo = RepositoryConfig::new("a", "/a", "/r");
        repo.readers = Some(0);
        assert!(repo.validate().is_err());

        let mut repo = RepositoryConfig::new("a", "/a", "/r");
        repo.exclude = vec!["[".to_string()];
        assert!(repo.validate().is_err());

        let mut repo = RepositoryConfig::new("a", "/a", "/r");
        repo.paging = Paging::Hash { buckets: 0 };
        assert!(repo.validate().is_err());
    }

    #[test]
    #[serial]
    fn test_client_from_environment() {
        std::env::set_var(CLIENT_ENV, "box-7");
        assert_eq!(RepositoryConfig::new("a", "/a", "/r").client, "box-7");
        std::env::remove_var(CLIENT_ENV);
        assert!(!default_client().is_empty());
    }
}
