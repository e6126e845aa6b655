//! Publisher to client, end to end: archives are processed and signed in
//! a repository, and a client reads the deploy directory through a
//! [`DirectoryFetcher`].

use std::sync::{Arc, Mutex};

use relup_client::{
    ClientState, DirectoryFetcher, ProgressStatus, UpdateClient, UpdateError, UPDATE_FOLDER,
};
use relup_core::hash::sha256_hex;
use relup_core::keys::generate_keypair;
use relup_core::AppConfig;
use relup_publisher::Repository;
use tempfile::TempDir;

const BASE_URL: &str = "https://updates.example.com/jms";

struct Setup {
    _repo_dir: TempDir,
    repo: Repository,
    client_dir: TempDir,
}

fn archive(version: u8) -> Vec<u8> {
    let mut data: Vec<u8> = (0..8192u32).map(|i| (i * 7 % 256) as u8).collect();
    for offset in [10usize, 2000, 6000] {
        data[offset] = version;
    }
    data.extend(format!("build {version}").into_bytes());
    data
}

impl Setup {
    fn new() -> Self {
        let repo_dir = TempDir::new().unwrap();
        let repo = Repository::open(repo_dir.path()).unwrap();
        let config = AppConfig {
            app_name: "jms".to_string(),
            company_name: "Acme".to_string(),
            update_urls: vec![BASE_URL.to_string()],
            ..Default::default()
        };
        assert!(repo.init(config).unwrap());
        Self {
            _repo_dir: repo_dir,
            repo,
            client_dir: TempDir::new().unwrap(),
        }
    }

    fn release(&self, version: u8) {
        let name = format!("jms-mac-0.0.{version}.zip");
        std::fs::write(self.repo.dirs().new_dir.join(name), archive(version)).unwrap();
        let report = self.repo.process_packages().unwrap();
        assert!(report.rejected.is_empty());
        self.repo.sign().unwrap();
    }

    /// Put version `version` in the client's update folder, as a
    /// previous update would have.
    fn install(&self, version: u8) {
        let dir = self.client_dir.path().join(UPDATE_FOLDER);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(format!("jms-mac-0.0.{version}.zip")), archive(version)).unwrap();
    }

    fn client_config(&self) -> AppConfig {
        let mut config = AppConfig::load_from_file(&self.repo.client_config_path()).unwrap();
        config.data_dir = Some(self.client_dir.path().to_path_buf());
        config
    }

    fn client(&self, config: AppConfig) -> (Arc<DirectoryFetcher>, UpdateClient) {
        let fetcher = Arc::new(DirectoryFetcher::new(BASE_URL, &self.repo.dirs().deploy_dir));
        let client = UpdateClient::with_fetcher(config, fetcher.clone())
            .unwrap()
            .with_platform("mac");
        (fetcher, client)
    }
}

#[tokio::test]
async fn test_installed_latest_has_no_update() {
    let setup = Setup::new();
    setup.release(1);
    let (_, client) = setup.client(setup.client_config());

    assert!(client.refresh().await);
    assert!(client.check("jms", "0.0.1").await.is_none());
    assert_eq!(client.state().await, ClientState::NoUpdate);
}

#[tokio::test]
async fn test_update_prefers_patch_chain() {
    let setup = Setup::new();
    setup.release(1);
    setup.release(2);
    setup.release(3);
    setup.install(1);

    let (fetcher, client) = setup.client(setup.client_config());
    let statuses = Arc::new(Mutex::new(Vec::new()));
    let seen = statuses.clone();
    client.add_progress_hook(move |p| seen.lock().unwrap().push(p.status));

    assert!(client.refresh().await);
    let handle = client.check("jms", "0.0.1").await.unwrap();
    assert_eq!(handle.version().to_string(), "0.0.3.2.0");
    let plan = handle.patch_plan().unwrap();
    assert_eq!(plan.steps.len(), 2);

    let path = handle.download().await.unwrap();
    assert_eq!(std::fs::read(&path).unwrap(), archive(3));

    let requested = fetcher.requests();
    assert!(!requested.iter().any(|url| url.ends_with("jms-mac-0.0.3.zip")));
    let statuses = statuses.lock().unwrap();
    assert!(statuses.contains(&ProgressStatus::PatchApplied));
    assert_eq!(statuses.last(), Some(&ProgressStatus::Finished));
}

#[tokio::test]
async fn test_full_download_when_install_is_modified() {
    let setup = Setup::new();
    setup.release(1);
    setup.release(2);
    let dir = setup.client_dir.path().join(UPDATE_FOLDER);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("jms-mac-0.0.1.zip"), b"locally modified").unwrap();

    let (fetcher, client) = setup.client(setup.client_config());
    assert!(client.refresh().await);
    let handle = client.check("jms", "0.0.1").await.unwrap();

    let path = handle.download().await.unwrap();
    assert_eq!(sha256_hex(&std::fs::read(&path).unwrap()), sha256_hex(&archive(2)));
    assert!(fetcher
        .requests()
        .iter()
        .any(|url| url.ends_with("jms-mac-0.0.2.zip")));
}

#[tokio::test]
async fn test_full_download_without_installed_archive() {
    let setup = Setup::new();
    setup.release(1);
    setup.release(2);

    let (_, client) = setup.client(setup.client_config());
    assert!(client.refresh().await);
    let handle = client.check("jms", "0.0.1").await.unwrap();
    assert!(handle.patch_plan().is_none());
    assert_eq!(std::fs::read(handle.download().await.unwrap()).unwrap(), archive(2));
}

#[tokio::test]
async fn test_unknown_signing_key_is_rejected() {
    let setup = Setup::new();
    setup.release(1);
    setup.release(2);

    let mut config = setup.client_config();
    config.public_keys = vec![generate_keypair().0, generate_keypair().0];
    let (_, client) = setup.client(config);

    assert!(!client.refresh().await);
    assert_eq!(client.state().await, ClientState::ManifestLoaded { verified: false });
    assert!(client.check("jms", "0.0.1").await.is_none());
}

#[tokio::test]
async fn test_one_trusted_key_is_enough() {
    let setup = Setup::new();
    setup.release(1);
    setup.release(2);

    let mut config = setup.client_config();
    let trusted = config.public_keys[0].clone();
    config.public_keys = vec![generate_keypair().0, trusted];
    let (_, client) = setup.client(config);

    assert!(client.refresh().await);
    assert!(client.check("jms", "0.0.1").await.is_some());
}

#[tokio::test]
async fn test_revoked_keys_still_verify_with_exported_config() {
    let setup = Setup::new();
    setup.release(1);
    setup.repo.revoke_keys(2).unwrap();
    setup.release(2);

    let (_, client) = setup.client(setup.client_config());
    assert!(client.refresh().await);
    assert!(client.check("jms", "0.0.1").await.is_some());
}

#[test]
fn test_background_transfer_from_sync_code() {
    let setup = Setup::new();
    setup.release(1);
    setup.release(2);

    let runtime = tokio::runtime::Runtime::new().unwrap();
    let (_, client) = setup.client(setup.client_config());
    let handle = runtime.block_on(async {
        assert!(client.refresh().await);
        client.check("jms", "0.0.1").await.unwrap()
    });

    assert!(handle.start());
    for _ in 0..1000 {
        if handle.is_complete() {
            break;
        }
        std::thread::sleep(std::time::Duration::from_millis(5));
    }
    let path = handle.result().unwrap().unwrap();
    assert_eq!(std::fs::read(path).unwrap(), archive(2));
    assert!(!handle.is_downloading());
}

#[tokio::test]
async fn test_transfer_slot_is_released_after_completion() {
    let setup = Setup::new();
    setup.release(1);
    setup.release(2);
    let (_, client) = setup.client(setup.client_config());
    assert!(client.refresh().await);
    let handle = client.check("jms", "0.0.1").await.unwrap();

    let copy = handle.clone();
    let first = std::thread::spawn(move || copy.download_blocking()).join().unwrap();
    assert!(first.is_ok());

    // Finished transfers release the slot
    assert!(handle.download().await.is_ok());
    assert!(!matches!(handle.download().await, Err(UpdateError::AlreadyInProgress)));
}
