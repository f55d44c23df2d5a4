//! Relay space accounting.

use crate::backend::Backend;
use crate::error::{Result, SyncError};
use std::time::{Duration, Instant};
use tracing::debug;

const MB: f64 = 1024.0 * 1024.0;

pub fn bytes_to_mb(bytes: u64) -> f64 {
    bytes as f64 / MB
}

/// Refuses uploads that would take the relay past its quota.
///
/// The used space is asked from the backend at most every `refresh` and
/// tracked locally in between.
#[derive(Debug, Clone)]
pub struct QuotaController {
    quota_mb: Option<f64>,
    refresh: Duration,
    used_mb: f64,
    capacity_mb: Option<f64>,
    refreshed: Option<Instant>,
}

impl QuotaController {
    pub fn new(quota_mb: Option<f64>, refresh: Duration) -> Self {
        Self {
            quota_mb,
            refresh,
            used_mb: 0.0,
            capacity_mb: None,
            refreshed: None,
        }
    }

    pub fn used_mb(&self) -> f64 {
        self.used_mb
    }

    /// Effective limit: the configured quota or the store capacity,
    /// whichever is lower.
    pub fn limit_mb(&self) -> Option<f64> {
        match (self.quota_mb, self.capacity_mb) {
            (Some(q), Some(c)) => Some(q.min(c)),
            (q, c) => q.or(c),
        }
    }

    /// Force a backend query on the next check.
    pub fn invalidate(&mut self) {
        self.refreshed = None;
    }

    async fn refresh(&mut self, backend: &dyn Backend) -> Result<()> {
        let stale = self
            .refreshed
            .map_or(true, |at| at.elapsed() >= self.refresh);
        if stale {
            let space = backend.storage_space().await?;
            self.used_mb = space.used_mb;
            self.capacity_mb = space.quota_mb;
            self.refreshed = Some(Instant::now());
            debug!(used_mb = self.used_mb, capacity_mb = ?self.capacity_mb, "relay space refreshed");
        }
        Ok(())
    }

    /// Fail with `QuotaExceeded` if `size` more bytes would not fit.
    pub async fn check(&mut self, backend: &dyn Backend, size: u64) -> Result<()> {
        self.refresh(backend).await?;
        let Some(limit) = self.limit_mb() else {
            return Ok(());
        };
        if self.used_mb + bytes_to_mb(size) > limit {
            return Err(SyncError::QuotaExceeded {
                used: self.used_mb,
                quota: limit,
            });
        }
        Ok(())
    }

    /// Account for an upload of `size` bytes.
    pub fn record(&mut self, size: u64) {
        self.used_mb += bytes_to_mb(size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::local::LocalBackend;
    use tempfile::TempDir;

    const HALF_MB: u64 = 512 * 1024;

    #[tokio::test]
    async fn test_rejects_past_quota() {
        let temp = TempDir::new().unwrap();
        let backend = LocalBackend::new(temp.path()).unwrap();
        backend.write_bytes("a", &vec![0u8; HALF_MB as usize]).await.unwrap();

        let mut quota = QuotaController::new(Some(1.0), Duration::from_secs(300));
        quota.check(&backend, HALF_MB / 2).await.unwrap();
        quota.record(HALF_MB / 2);
        assert!((quota.used_mb() - 0.75).abs() < 1e-9);

        let err = quota.check(&backend, HALF_MB).await.unwrap_err();
        match err {
            SyncError::QuotaExceeded { used, quota } => {
                assert!((used - 0.75).abs() < 1e-9);
                assert!((quota - 1.0).abs() < 1e-9);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_refresh_rereads_backend() {
        let temp = TempDir::new().unwrap();
        let backend = LocalBackend::new(temp.path()).unwrap();
        let mut quota = QuotaController::new(Some(1.0), Duration::from_secs(300));
        quota.check(&backend, 0).await.unwrap();
        assert_eq!(quota.used_mb(), 0.0);

        backend.write_bytes("a", &vec![0u8; HALF_MB as usize]).await.unwrap();
        // cached
        quota.check(&backend, 0).await.unwrap();
        assert_eq!(quota.used_mb(), 0.0);

        quota.invalidate();
        quota.check(&backend, 0).await.unwrap();
        assert!((quota.used_mb() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_limit_is_the_lower_bound() {
        let mut quota = QuotaController::new(None, Duration::ZERO);
        assert_eq!(quota.limit_mb(), None);
        quota.capacity_mb = Some(10.0);
        assert_eq!(quota.limit_mb(), Some(10.0));
        quota.quota_mb = Some(4.0);
        assert_eq!(quota.limit_mb(), Some(4.0));
    }
}
