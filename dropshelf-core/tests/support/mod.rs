use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dropshelf_core::{CredentialStore, HubConfig, PushChannel, ServerMessage, SyncHub};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::time::timeout;

// Shared by several test binaries; not every one uses every helper.
#[allow(unused)]
#[derive(Debug)]
pub struct TestHub {
    pub hub: SyncHub,
    pub tmp: TempDir,
}

#[allow(unused)]
#[derive(Debug)]
pub struct TestClient {
    pub token: String,
    pub channel_id: uuid::Uuid,
    pub rx: mpsc::Receiver<ServerMessage>,
}

#[allow(unused)]
impl TestHub {
    pub async fn new() -> Self {
        let tmp = tempfile::tempdir().expect("tempdir");
        for dir in ["files", "incoming", "zip"] {
            std::fs::create_dir_all(tmp.path().join(dir)).expect("create fixture dir");
        }

        let mut config = HubConfig::new(
            tmp.path().join("files"),
            tmp.path().join("incoming"),
            tmp.path().join("zip"),
        );
        config.debounce = Duration::from_millis(100);
        config.throttle = Duration::from_millis(100);

        let store = Arc::new(CredentialStore::in_memory());
        store
            .add_or_update_user("admin", "admin-pass", true)
            .await
            .expect("seed admin");
        store
            .add_or_update_user("guest", "guest-pass", false)
            .await
            .expect("seed guest");

        Self {
            hub: SyncHub::new(config, store),
            tmp,
        }
    }

    pub fn files(&self) -> PathBuf {
        self.tmp.path().join("files")
    }

    pub fn incoming(&self) -> PathBuf {
        self.tmp.path().join("incoming")
    }

    pub fn zip_dir(&self) -> PathBuf {
        self.tmp.path().join("zip")
    }

    pub fn mkdir(&self, relative: &str) {
        std::fs::create_dir_all(self.files().join(relative)).expect("mkdir fixture");
    }

    pub fn write(&self, relative: &str, contents: &[u8]) {
        let path = self.files().join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("mkdir parent");
        }
        std::fs::write(path, contents).expect("write fixture");
    }

    /// Log in `user` and open a connection for them.
    pub async fn connect(&self, user: &str) -> TestClient {
        let token = self
            .hub
            .store()
            .create_session(user, false)
            .await
            .expect("create session");
        let (channel, rx) = PushChannel::pair(64);
        let channel_id = channel.id();
        self.hub
            .connect(&token, channel)
            .await
            .expect("connect client");
        TestClient {
            token,
            channel_id,
            rx,
        }
    }
}

#[allow(unused)]
impl TestClient {
    /// Next message, or `None` if nothing arrives within `wait`.
    pub async fn next(&mut self, wait: Duration) -> Option<ServerMessage> {
        timeout(wait, self.rx.recv()).await.ok().flatten()
    }

    /// Everything that arrives within `wait`.
    pub async fn drain(&mut self, wait: Duration) -> Vec<ServerMessage> {
        let mut messages = Vec::new();
        let deadline = tokio::time::Instant::now() + wait;
        while let Ok(Some(msg)) = tokio::time::timeout_at(deadline, self.rx.recv()).await {
            messages.push(msg);
        }
        messages
    }
}

#[allow(unused)]
pub fn dir_is_empty(path: &Path) -> bool {
    std::fs::read_dir(path)
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(true)
}
