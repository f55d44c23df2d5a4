//! Two workers sharing one directory-backed relay with the flat protocol.

use relay_sync::backend::local::LocalBackend;
use relay_sync::backend::{Backend, BackendRegistry};
use relay_sync::cipher::CipherRegistry;
use relay_sync::manager::Manager;
use relay_sync::RepositoryConfig;
use std::path::PathBuf;
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

    fn relay_dir(&self) -> PathBuf {
        self.temp.path().join("relay")
    }

    fn config(&self, client: &str) -> RepositoryConfig {
        let mut config = RepositoryConfig::new(
            "shared",
            self.temp.path().join(client),
            self.relay_dir().to_str().unwrap(),
        );
        config.client = client.to_string();
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

    async fn relay_files(&self) -> Vec<String> {
        let backend = LocalBackend::new(self.relay_dir()).unwrap();
        let mut files: Vec<String> = backend
            .list("", true)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.path)
            .collect();
        files.sort();
        files
    }
}

#[tokio::test]
async fn test_upload_then_idle_then_local_delete() {
    let setup = Setup::new();
    let mut a = setup.worker(&setup.config("a"));
    setup.write("a", "a.txt", b"alpha");
    setup.write("a", "b.txt", b"beta");

    assert_eq!(a.run_once().await.unwrap(), 2);
    let files = setup.relay_files().await;
    for expected in [".a.txt.placeholder", ".b.txt.placeholder", "a.txt", "b.txt"] {
        assert!(files.iter().any(|f| f == expected), "missing {expected} in {files:?}");
    }
    assert!(!files.iter().any(|f| f.ends_with(".lock")));

    // no local change, no transfer
    assert_eq!(a.run_once().await.unwrap(), 0);

    // deletions are not mirrored
    std::fs::remove_file(setup.temp.path().join("a/a.txt")).unwrap();
    assert_eq!(a.run_once().await.unwrap(), 0);
    assert!(setup.relay_files().await.iter().any(|f| f == "a.txt"));
    assert!(!setup.temp.path().join("a/a.txt").exists());
}

#[tokio::test]
async fn test_second_client_receives_and_stays_quiet() {
    let setup = Setup::new();
    let mut a = setup.worker(&setup.config("a"));
    let mut b = setup.worker(&setup.config("b"));

    setup.write("a", "a.txt", b"alpha");
    setup.write("a", "nested/b.txt", b"beta");
    assert_eq!(a.run_once().await.unwrap(), 2);

    assert_eq!(b.run_once().await.unwrap(), 2);
    assert_eq!(std::fs::read(setup.temp.path().join("b/a.txt")).unwrap(), b"alpha");
    assert_eq!(
        std::fs::read(setup.temp.path().join("b/nested/b.txt")).unwrap(),
        b"beta"
    );
    assert_eq!(b.run_once().await.unwrap(), 0);
    assert_eq!(a.run_once().await.unwrap(), 0);

    // a newer version flows the other way
    setup.write("b", "a.txt", b"alpha, edited by b");
    let later = filetime::FileTime::from_unix_time(chrono::Utc::now().timestamp() + 60, 0);
    filetime::set_file_mtime(setup.temp.path().join("b/a.txt"), later).unwrap();
    assert_eq!(b.run_once().await.unwrap(), 1);
    assert_eq!(a.run_once().await.unwrap(), 1);
    assert_eq!(
        std::fs::read(setup.temp.path().join("a/a.txt")).unwrap(),
        b"alpha, edited by b"
    );
}

#[tokio::test]
async fn test_quota_blocks_every_upload() {
    let setup = Setup::new();
    let mut config = setup.config("a");
    config.quota_mb = Some(0.5);
    let mut a = setup.worker(&config);

    setup.write("a", "big.bin", &vec![1u8; 1024 * 1024]);
    // quota is not an error for the round
    assert_eq!(a.run_once().await.unwrap(), 0);
    assert!(setup.relay_files().await.is_empty());
}
