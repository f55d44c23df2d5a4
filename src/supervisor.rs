//! One worker per repository, restarted on failure when asked to.

use crate::backend::BackendRegistry;
use crate::cipher::CipherRegistry;
use crate::config::{Config, RepositoryConfig};
use crate::manager::Manager;
use crate::notify::{MailNotifier, Notifier};
use anyhow::{anyhow, bail, Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, info_span, warn, Instrument};

/// Receiver that flips to `true` on Ctrl-C.
pub fn shutdown_on_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupted, stopping workers");
            tx.send(true).ok();
        }
    });
    rx
}

pub struct Supervisor {
    config: Config,
    backends: Arc<BackendRegistry>,
    ciphers: Arc<CipherRegistry>,
    notifier: Option<Arc<dyn Notifier>>,
}

impl Supervisor {
    pub fn new(config: Config) -> Self {
        let notifier = config
            .notify
            .clone()
            .map(|notify| Arc::new(MailNotifier::new(notify)) as Arc<dyn Notifier>);
        Self {
            config,
            backends: Arc::new(BackendRegistry::init()),
            ciphers: Arc::new(CipherRegistry::init()),
            notifier,
        }
    }

    /// Run every repository until `shutdown`. Fails if any worker did.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let keep_alive = self.config.keep_alive;
        let restart_delay = self.config.restart_delay();
        let mut workers = JoinSet::new();

        for repo in self.config.repository {
            let name = repo.name.clone();
            let worker = supervise(
                repo,
                self.backends.clone(),
                self.ciphers.clone(),
                self.notifier.clone(),
                keep_alive,
                restart_delay,
                shutdown.clone(),
            );
            workers.spawn(async move { (name, worker.await) });
        }

        let mut failed = 0;
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((name, Ok(()))) => info!(repository = %name, "worker finished"),
                Ok((name, Err(e))) => {
                    error!(repository = %name, error = ?e, "worker failed");
                    failed += 1;
                }
                Err(e) => {
                    error!(error = %e, "supervisor task died");
                    failed += 1;
                }
            }
        }
        if failed > 0 {
            bail!("{} worker(s) failed", failed);
        }
        Ok(())
    }

    /// A single round for every repository, one after the other.
    pub async fn run_once(&self) -> Result<()> {
        for repo in &self.config.repository {
            let span = info_span!("repository", name = %repo.name);
            async {
                let mut manager = Manager::from_config(repo, &self.backends, &self.ciphers)
                    .with_context(|| format!("repository '{}'", repo.name))?;
                tokio::fs::create_dir_all(&repo.local).await?;
                let transferred = manager
                    .run_once()
                    .await
                    .with_context(|| format!("repository '{}'", repo.name))?;
                info!(transferred, "round done");
                Ok::<_, anyhow::Error>(())
            }
            .instrument(span)
            .await?;
        }
        Ok(())
    }
}

async fn supervise(
    repo: RepositoryConfig,
    backends: Arc<BackendRegistry>,
    ciphers: Arc<CipherRegistry>,
    notifier: Option<Arc<dyn Notifier>>,
    keep_alive: bool,
    restart_delay: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    loop {
        let span = info_span!("repository", name = %repo.name);
        let config = repo.clone();
        let backends = backends.clone();
        let ciphers = ciphers.clone();
        let stop = shutdown.clone();
        // A separate task so that a panic only takes this worker down
        let worker = tokio::spawn(
            async move {
                let mut manager = Manager::from_config(&config, &backends, &ciphers)?;
                manager.run(stop).await
            }
            .instrument(span),
        );

        let result = match worker.await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => Err(anyhow::Error::new(e).context(format!("repository '{}'", repo.name))),
            Err(e) => Err(anyhow!("repository '{}' worker panicked: {}", repo.name, e)),
        };
        let restarting = keep_alive && !*shutdown.borrow();
        if let (Err(e), Some(notifier)) = (&result, &notifier) {
            report(notifier.as_ref(), &repo.name, e, restarting.then_some(restart_delay)).await;
        }
        if !restarting {
            return result;
        }
        if let Err(e) = &result {
            warn!(repository = %repo.name, error = %e, delay = ?restart_delay, "restarting worker");
        }
        tokio::select! {
            _ = tokio::time::sleep(restart_delay) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return Ok(());
                }
            }
        }
    }
}

/// Mail the failure of a worker. A failed report is only logged.
async fn report(
    notifier: &dyn Notifier,
    repository: &str,
    error: &anyhow::Error,
    restart: Option<Duration>,
) {
    let subject = format!("relay-sync: repository '{}' stopped", repository);
    let next = match restart {
        Some(delay) => format!("The worker restarts in {} s.", delay.as_secs()),
        None => "The worker is not restarted.".to_string(),
    };
    let body = format!("{:#}\n\n{}\n", error, next);
    if let Err(e) = notifier.notify(&subject, &body).await {
        warn!(repository, error = %e, "cannot send failure notification");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::NotifyConfig;
    use tempfile::TempDir;

    fn config(temp: &TempDir, keep_alive: bool, protocol: &str) -> Config {
        let mut repo = RepositoryConfig::new(
            "r",
            temp.path().join("ws"),
            temp.path().join("relay").to_str().unwrap(),
        );
        repo.client = "a".to_string();
        repo.protocol = protocol.to_string();
        repo.initial_delay = 3600;
        repo.max_delay = 3600;
        Config {
            keep_alive,
            restart_delay: 0,
            notify: None,
            repository: vec![repo],
        }
    }

    #[tokio::test]
    async fn test_workers_stop_on_shutdown() {
        let temp = TempDir::new().unwrap();
        let supervisor = Supervisor::new(config(&temp, true, "local"));
        let (tx, rx) = watch::channel(false);
        let running = tokio::spawn(supervisor.run(rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_fatal_worker_is_reported() {
        let temp = TempDir::new().unwrap();
        // unknown protocol: configuration error, no restart without keep-alive
        let supervisor = Supervisor::new(config(&temp, false, "carrier-pigeon"));
        let (_tx, rx) = watch::channel(false);
        let result = tokio::time::timeout(Duration::from_secs(5), supervisor.run(rx))
            .await
            .unwrap();
        assert!(result.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_worker_is_mailed() {
        let temp = TempDir::new().unwrap();
        let mail = temp.path().join("mail.txt");
        let mut config = config(&temp, false, "carrier-pigeon");
        config.notify = Some(NotifyConfig {
            to: "ops@example.org".to_string(),
            from: None,
            command: vec![
                "sh".to_string(),
                "-c".to_string(),
                "cat > \"$0\"".to_string(),
                mail.to_str().unwrap().to_string(),
            ],
        });
        let (_tx, rx) = watch::channel(false);
        let result = tokio::time::timeout(Duration::from_secs(5), Supervisor::new(config).run(rx))
            .await
            .unwrap();
        assert!(result.is_err());

        let sent = std::fs::read_to_string(&mail).unwrap();
        assert!(sent.contains("To: ops@example.org\n"));
        assert!(sent.contains("Subject: relay-sync: repository 'r' stopped\n"));
        assert!(sent.contains("carrier-pigeon"));
        assert!(sent.contains("not restarted"));
    }

    #[tokio::test]
    async fn test_run_once() {
        let temp = TempDir::new().unwrap();
        let config = config(&temp, false, "local");
        std::fs::create_dir_all(temp.path().join("ws")).unwrap();
        std::fs::write(temp.path().join("ws/a.txt"), b"a").unwrap();
        Supervisor::new(config).run_once().await.unwrap();
        assert!(temp.path().join("relay/a.txt").exists());
    }
}
