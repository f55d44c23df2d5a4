//! Paged index protocol end to end: puller accounting and crash recovery.

use chrono::Utc;
use relay_sync::backend::local::LocalBackend;
use relay_sync::backend::{Backend, BackendRegistry};
use relay_sync::cipher::CipherRegistry;
use relay_sync::manager::Manager;
use relay_sync::relay::naming::SpecialNames;
use relay_sync::relay::paged::{PagedRelay, Paging, ROOT_PAGE};
use relay_sync::relay::{Locker, Relay};
use relay_sync::RepositoryConfig;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

struct Setup {
    temp: TempDir,
    backends: BackendRegistry,
    ciphers: CipherRegistry,
}

impl Setup {
    fn new() -> Self {
        Self {
            temp: TempDir::new().unwrap(),
            backends: BackendRegistry::init(),
            ciphers: CipherRegistry::init(),
        }
    }

    fn backend(&self) -> Arc<dyn Backend> {
        Arc::new(LocalBackend::new(self.temp.path().join("relay")).unwrap())
    }

    fn config(&self, client: &str, readers: Option<usize>) -> RepositoryConfig {
        let mut config = RepositoryConfig::new(
            "paged",
            self.temp.path().join(client),
            self.temp.path().join("relay").to_str().unwrap(),
        );
        config.client = client.to_string();
        config.index = true;
        config.readers = readers;
        config.index_cooldown = 0;
        config
    }

    fn worker(&self, config: &RepositoryConfig) -> Manager {
        Manager::from_config(config, &self.backends, &self.ciphers).unwrap()
    }

    fn write(&self, client: &str, resource: &str, content: &[u8]) {
        let path = self.temp.path().join(client).join(resource);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    fn read(&self, client: &str, resource: &str) -> Option<Vec<u8>> {
        std::fs::read(self.temp.path().join(client).join(resource)).ok()
    }

    async fn relay_files(&self) -> Vec<String> {
        let mut files: Vec<String> = self
            .backend()
            .list("", true)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.path)
            .collect();
        files.sort();
        files
    }

    async fn count(&self, suffix: &str) -> usize {
        self.relay_files()
            .await
            .iter()
            .filter(|f| f.ends_with(suffix))
            .count()
    }
}

#[tokio::test]
async fn test_transaction_waits_for_every_reader() {
    let setup = Setup::new();
    let mut a = setup.worker(&setup.config("a", Some(2)));
    let mut b = setup.worker(&setup.config("b", Some(2)));

    setup.write("a", "x", b"payload");
    assert_eq!(a.run_once().await.unwrap(), 1);
    assert_eq!(setup.count(".upindex").await, 1);
    assert_eq!(setup.count(".updata").await, 1);

    assert_eq!(b.run_once().await.unwrap(), 1);
    assert_eq!(setup.read("b", "x").unwrap(), b"payload");
    // one of two readers: the transaction stays
    assert_eq!(setup.count(".upindex").await, 1);

    // b is already a puller of this version
    assert!(b.relay().list_ready().await.unwrap().is_empty());
    assert_eq!(b.run_once().await.unwrap(), 0);
    assert_eq!(setup.count(".upindex").await, 1);
    assert!(!setup.relay_files().await.iter().any(|f| f.ends_with(".lock")));
}

#[tokio::test]
async fn test_last_reader_consolidates() {
    let setup = Setup::new();
    let mut a = setup.worker(&setup.config("a", Some(2)));
    let mut b = setup.worker(&setup.config("b", Some(2)));
    let mut c = setup.worker(&setup.config("c", Some(2)));

    setup.write("a", "docs/x.txt", b"x");
    a.run_once().await.unwrap();
    b.run_once().await.unwrap();
    c.run_once().await.unwrap();

    assert_eq!(setup.read("c", "docs/x.txt").unwrap(), b"x");
    assert_eq!(setup.count(".upindex").await, 0);
    assert_eq!(setup.count(".updata").await, 0);
    // the merged index still knows the file
    let metadata = a.relay().get_metadata("docs/x.txt").await.unwrap().unwrap();
    assert_eq!(metadata.pusher.as_deref(), Some("a"));
}

#[tokio::test]
async fn test_restart_repairs_interrupted_update() {
    let setup = Setup::new();
    let names = SpecialNames::default();
    let config = setup.config("a", None);
    let mut b = setup.worker(&setup.config("b", None));

    setup.write("a", "x", b"first");
    assert_eq!(setup.worker(&config).run_once().await.unwrap(), 1);
    assert_eq!(b.run_once().await.unwrap(), 1);
    assert_eq!(setup.count(".upindex").await, 0);

    // a dies after uploading data for an update it never committed
    let backend = setup.backend();
    let mut crashed = PagedRelay::new(
        backend.clone(),
        Locker::new(backend.clone(), names.clone(), "a", config.lock_policy()),
        names.clone(),
        Paging::Single,
        None,
    )
    .cooldown(Duration::ZERO);
    let writer = crashed.begin_update(ROOT_PAGE).await.unwrap().unwrap();
    backend
        .write_bytes(&names.update_data(ROOT_PAGE, &Utc::now()), b"partial")
        .await
        .unwrap();
    drop(writer);
    assert_eq!(setup.count(".updata").await, 1);
    assert_eq!(setup.count(".lock").await, 1);

    // nothing uncommitted is visible to b
    assert!(b.relay().list_ready().await.unwrap().is_empty());
    assert_eq!(b.run_once().await.unwrap(), 0);

    // the restarted worker cleans up its own leftovers
    let mut restarted = setup.worker(&config);
    assert_eq!(restarted.run_once().await.unwrap(), 0);
    assert_eq!(setup.count(".lock").await, 0);
    assert_eq!(setup.count(".updata").await, 0);
    assert_eq!(setup.relay_files().await, vec![".root.index".to_string()]);

    assert_eq!(restarted.relay().sanity_check(&config.local).await.unwrap(), 0);
    assert_eq!(setup.read("b", "x").unwrap(), b"first");
}

#[tokio::test]
async fn test_quota_keeps_index_untouched() {
    let setup = Setup::new();
    let mut config = setup.config("a", None);
    config.quota_mb = Some(0.5);
    let mut a = setup.worker(&config);

    setup.write("a", "big.bin", &vec![3u8; 1024 * 1024]);
    assert_eq!(a.run_once().await.unwrap(), 0);
    assert_eq!(setup.count(".upindex").await, 0);
    assert_eq!(setup.count(".updata").await, 0);
    assert!(a
        .relay()
        .get_metadata("big.bin")
        .await
        .unwrap()
        .is_none());
}
