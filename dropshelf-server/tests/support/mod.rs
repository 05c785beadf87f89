use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    body::{Body, to_bytes},
    extract::ConnectInfo,
    http::{Request, Response, header},
};
use dropshelf_core::{CredentialStore, SyncHub};
use dropshelf_server::{
    AppState, create_app,
    infra::config::{
        ArchiveConfig, Config, ConfigMetadata, LinksConfig, ServerConfig, StorageConfig,
        SyncConfig,
    },
};
use tempfile::TempDir;

pub const BOUNDARY: &str = "dropshelf-test-boundary";

#[derive(Debug)]
pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    _tempdir: TempDir,
}

#[allow(unused)]
impl TestApp {
    /// App with a privileged `admin` and an ordinary `guest` account.
    pub async fn new() -> Self {
        let app = Self::empty().await;
        let store = app.state.hub.store();
        store
            .add_or_update_user("admin", "admin-pass", true)
            .await
            .expect("seed admin");
        store
            .add_or_update_user("guest", "guest-pass", false)
            .await
            .expect("seed guest");
        app
    }

    /// App with no users, as on first run.
    pub async fn empty() -> Self {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let root = tempdir.path();
        for dir in ["files", "incoming", "zip"] {
            std::fs::create_dir_all(root.join(dir)).expect("create fixture dir");
        }

        let config = Config {
            server: ServerConfig {
                host: "127.0.0.1".into(),
                port: 0,
            },
            storage: StorageConfig {
                files_dir: root.join("files"),
                incoming_dir: root.join("incoming"),
                zip_dir: root.join("zip"),
                store_path: root.join("db.json"),
                assets_dir: None,
            },
            sync: SyncConfig {
                debounce: Duration::from_millis(100),
                throttle: Duration::from_millis(100),
                delivery_timeout: Duration::from_millis(500),
            },
            links: LinksConfig { length: 3 },
            archive: ArchiveConfig { zip_level: 1 },
            metadata: ConfigMetadata::default(),
        };

        let hub = Arc::new(SyncHub::new(
            config.hub_config(),
            Arc::new(CredentialStore::in_memory()),
        ));
        let state = AppState::new(hub, Arc::new(config));
        Self {
            router: create_app(state.clone()),
            state,
            _tempdir: tempdir,
        }
    }

    pub fn files(&self) -> PathBuf {
        self._tempdir.path().join("files")
    }

    pub fn zip_dir(&self) -> PathBuf {
        self._tempdir.path().join("zip")
    }

    pub fn write(&self, relative: &str, contents: &[u8]) {
        let path = self.files().join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("mkdir parent");
        }
        std::fs::write(path, contents).expect("write fixture");
    }

    /// Session token for `user`, created directly in the store.
    pub async fn session(&self, user: &str) -> String {
        self.state
            .hub
            .store()
            .create_session(user, false)
            .await
            .expect("create session")
    }
}

#[allow(unused)]
pub fn login_request(username: &str, password: &str, peer: SocketAddr) -> Request<Body> {
    let mut request = Request::builder()
        .method("POST")
        .uri("/login")
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from(format!(
            "username={username}&password={password}"
        )))
        .expect("login request");
    request.extensions_mut().insert(ConnectInfo(peer));
    request
}

#[allow(unused)]
pub fn get(uri: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method("GET").uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::COOKIE, format!("session={token}"));
    }
    builder.body(Body::empty()).expect("get request")
}

/// Multipart body with one part per `(filename, contents)`.
#[allow(unused)]
pub fn upload_request(token: Option<&str>, parts: &[(&str, &[u8])]) -> Request<Body> {
    let mut body = Vec::new();
    for (name, contents) in parts {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"files[]\"; filename=\"{name}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(contents);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());

    let mut builder = Request::builder()
        .method("POST")
        .uri("/upload")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        );
    if let Some(token) = token {
        builder = builder.header(header::COOKIE, format!("session={token}"));
    }
    builder.body(Body::from(body)).expect("upload request")
}

#[allow(unused)]
pub async fn body_bytes(response: Response<Body>) -> Vec<u8> {
    to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read body")
        .to_vec()
}

#[allow(unused)]
pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    serde_json::from_slice(&body_bytes(response).await).expect("json body")
}
