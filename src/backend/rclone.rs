//! Relay on any remote `rclone` can reach (cloud drives, S3, SFTP, ...).
//!
//! Every operation shells out to the helper binary; nothing is kept open
//! between calls.

use super::{Backend, RemoteEntry, StorageSpace};
use crate::config::RepositoryConfig;
use crate::error::{Result, SyncError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;

const MB: f64 = 1024.0 * 1024.0;

/// rclone exit status for "directory not found" / "file not found".
const EXIT_DIR_NOT_FOUND: i32 = 3;
const EXIT_FILE_NOT_FOUND: i32 = 4;

pub struct RcloneBackend {
    binary: String,
    /// `remote:path` prefix, without trailing slash
    remote: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct LsEntry {
    path: String,
    size: i64,
    mod_time: Option<String>,
    is_dir: bool,
}

#[derive(Debug, Deserialize)]
struct About {
    used: Option<u64>,
    total: Option<u64>,
}

enum Outcome {
    Ok(Vec<u8>),
    NotFound,
}

impl RcloneBackend {
    pub fn new(binary: impl Into<String>, remote: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            remote: remote.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn from_config(config: &RepositoryConfig) -> Result<Arc<dyn Backend>> {
        if !config.address.contains(':') {
            return Err(SyncError::Config(format!(
                "repository '{}': rclone address must look like 'remote:path', got '{}'",
                config.name, config.address
            )));
        }
        let binary = config.helper.clone().unwrap_or_else(|| "rclone".to_string());
        Ok(Arc::new(Self::new(binary, config.address.clone())))
    }

    fn target(&self, path: &str) -> String {
        if path.is_empty() {
            self.remote.clone()
        } else {
            format!("{}/{}", self.remote, path.trim_start_matches('/'))
        }
    }

    fn list_args(&self, dir: &str, recursive: bool) -> Vec<String> {
        let mut args = vec!["lsjson".to_string(), "--files-only".to_string()];
        if recursive {
            args.push("--recursive".to_string());
        }
        args.push(self.target(dir));
        args
    }

    fn copy_args(src: String, dst: String) -> Vec<String> {
        vec!["copyto".to_string(), src, dst]
    }

    async fn run(&self, args: &[String], context: &str) -> Result<Outcome> {
        tracing::trace!(binary = %self.binary, ?args, "rclone");
        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| SyncError::backend(context, format!("failed to spawn {}: {}", self.binary, e)))?;

        match output.status.code() {
            Some(0) => Ok(Outcome::Ok(output.stdout)),
            Some(EXIT_DIR_NOT_FOUND) | Some(EXIT_FILE_NOT_FOUND) => Ok(Outcome::NotFound),
            _ => Err(SyncError::backend(
                context,
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            )),
        }
    }

    fn parse_listing(dir: &str, stdout: &[u8]) -> Result<Vec<RemoteEntry>> {
        let raw: Vec<LsEntry> =
            serde_json::from_slice(stdout).map_err(|e| SyncError::backend(dir, e))?;
        let mut entries: Vec<RemoteEntry> = raw
            .into_iter()
            .filter(|e| !e.is_dir)
            .map(|e| RemoteEntry {
                path: super::join(dir, &e.path),
                size: u64::try_from(e.size).ok(),
                mtime: e
                    .mod_time
                    .as_deref()
                    .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
                    .map(|t| t.with_timezone(&Utc)),
            })
            .collect();
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }
}

#[async_trait]
impl Backend for RcloneBackend {
    fn protocol(&self) -> &'static str {
        "rclone"
    }

    async fn list(&self, dir: &str, recursive: bool) -> Result<Vec<RemoteEntry>> {
        match self.run(&self.list_args(dir, recursive), dir).await? {
            Outcome::Ok(stdout) => Self::parse_listing(dir, &stdout),
            Outcome::NotFound => Ok(Vec::new()),
        }
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.size(path).await?.is_some())
    }

    async fn get(&self, remote: &str, local: &Path) -> Result<()> {
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let args = Self::copy_args(self.target(remote), local.display().to_string());
        match self.run(&args, remote).await? {
            Outcome::Ok(_) => Ok(()),
            Outcome::NotFound => Err(SyncError::backend(remote, "not found")),
        }
    }

    async fn put(&self, local: &Path, remote: &str) -> Result<()> {
        let args = Self::copy_args(local.display().to_string(), self.target(remote));
        match self.run(&args, remote).await? {
            Outcome::Ok(_) => Ok(()),
            Outcome::NotFound => Err(SyncError::backend(remote, "destination not found")),
        }
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let args = vec!["deletefile".to_string(), self.target(path)];
        self.run(&args, path).await.map(|_| ())
    }

    async fn size(&self, path: &str) -> Result<Option<u64>> {
        let args = vec!["lsjson".to_string(), self.target(path)];
        match self.run(&args, path).await? {
            Outcome::Ok(stdout) => {
                let raw: Vec<LsEntry> =
                    serde_json::from_slice(&stdout).map_err(|e| SyncError::backend(path, e))?;
                Ok(raw
                    .into_iter()
                    .find(|e| !e.is_dir)
                    .and_then(|e| u64::try_from(e.size).ok()))
            }
            Outcome::NotFound => Ok(None),
        }
    }

    async fn storage_space(&self) -> Result<StorageSpace> {
        let args = vec!["about".to_string(), "--json".to_string(), self.target("")];
        match self.run(&args, "").await? {
            Outcome::Ok(stdout) => {
                let about: About =
                    serde_json::from_slice(&stdout).map_err(|e| SyncError::backend("", e))?;
                Ok(StorageSpace {
                    used_mb: about.used.unwrap_or(0) as f64 / MB,
                    quota_mb: about.total.map(|t| t as f64 / MB),
                })
            }
            Outcome::NotFound => Err(SyncError::backend(&self.remote, "remote not found")),
        }
    }
}
