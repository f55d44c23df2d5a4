use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid metadata in {path}: {message}")]
    Metadata { path: String, message: String },

    #[error("Backend error on {path}: {message}")]
    Backend { path: String, message: String },

    #[error("Timed out waiting for lock on {target}")]
    LockTimeout { target: String },

    #[error("Quota exceeded: {used:.1} MB used of {quota:.1} MB")]
    QuotaExceeded { used: f64, quota: f64 },

    #[error("Corrupted relay state for {target}: {message}")]
    Corrupted { target: String, message: String },

    #[error("Archive error in {path}: {message}")]
    Archive { path: PathBuf, message: String },

    #[error("Shutdown requested")]
    Shutdown,
}

impl SyncError {
    pub fn backend(path: impl Into<String>, message: impl ToString) -> Self {
        SyncError::Backend {
            path: path.into(),
            message: message.to_string(),
        }
    }

    pub fn metadata(path: impl Into<String>, message: impl ToString) -> Self {
        SyncError::Metadata {
            path: path.into(),
            message: message.to_string(),
        }
    }

    /// Short name of the variant, used to spot identical errors repeating.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::Io(_) => "io",
            SyncError::Config(_) => "config",
            SyncError::Metadata { .. } => "metadata",
            SyncError::Backend { .. } => "backend",
            SyncError::LockTimeout { .. } => "lock-timeout",
            SyncError::QuotaExceeded { .. } => "quota",
            SyncError::Corrupted { .. } => "corrupted",
            SyncError::Archive { .. } => "archive",
            SyncError::Shutdown => "shutdown",
        }
    }

    /// Configuration and logic errors: retrying cannot help.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::Config(_) | SyncError::Metadata { .. } | SyncError::Shutdown
        )
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_is_stable_per_variant() {
        let a = SyncError::backend("a.txt", "connection reset");
        let b = SyncError::backend("b.txt", "timeout");
        assert_eq!(a.kind(), b.kind());
        assert_ne!(a.kind(), SyncError::Config("x".into()).kind());
    }

    #[test]
    fn test_fatal_classification() {
        assert!(SyncError::Config("bad".into()).is_fatal());
        assert!(SyncError::metadata(".a.placeholder", "bad timestamp").is_fatal());
        assert!(!SyncError::QuotaExceeded {
            used: 1.0,
            quota: 2.0
        }
        .is_fatal());
        assert!(!SyncError::Io(io::Error::new(io::ErrorKind::Other, "x")).is_fatal());
    }

    #[test]
    fn test_quota_message() {
        let err = SyncError::QuotaExceeded {
            used: 12.0,
            quota: 10.0,
        };
        assert_eq!(err.to_string(), "Quota exceeded: 12.0 MB used of 10.0 MB");
    }
}
