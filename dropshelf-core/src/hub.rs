//! Session-scoped operations.
//!
//! [`SyncHub`] owns every engine component and is the single entry point for
//! connection lifecycle events and client messages. Registry mutations made
//! here are always followed by a watch reconcile.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::archive::{ArchiveConfig, ArchiveJobManager, ArchiveRequest};
use crate::error::{Result, ShareError};
use crate::fs_watch::{FsWatchConfig, WatcherManager};
use crate::listing::DirectorySnapshotter;
use crate::paths::{self, PathTranslator, ROOT};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::push::{PushConfig, PushDispatcher};
use crate::session::{DisconnectReason, PushChannel, SessionRegistry};
use crate::store::CredentialStore;
use crate::upload::{UploadBatch, UploadStager};

#[derive(Clone, Debug)]
pub struct HubConfig {
    pub files_dir: PathBuf,
    pub incoming_dir: PathBuf,
    pub zip_dir: PathBuf,
    pub debounce: Duration,
    pub throttle: Duration,
    pub delivery_timeout: Duration,
    pub link_length: usize,
    pub zip_level: i64,
}

impl HubConfig {
    pub fn new(
        files_dir: impl Into<PathBuf>,
        incoming_dir: impl Into<PathBuf>,
        zip_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            files_dir: files_dir.into(),
            incoming_dir: incoming_dir.into(),
            zip_dir: zip_dir.into(),
            debounce: Duration::from_millis(250),
            throttle: Duration::from_millis(250),
            delivery_timeout: Duration::from_millis(1000),
            link_length: 3,
            zip_level: 1,
        }
    }
}

pub struct SyncHub {
    config: HubConfig,
    translator: PathTranslator,
    store: Arc<CredentialStore>,
    registry: Arc<SessionRegistry>,
    dispatcher: Arc<PushDispatcher>,
    watcher: Arc<WatcherManager>,
    archives: Arc<ArchiveJobManager>,
    uploads: UploadStager,
}

impl fmt::Debug for SyncHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncHub")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("watcher", &self.watcher)
            .finish_non_exhaustive()
    }
}

impl SyncHub {
    pub fn new(config: HubConfig, store: Arc<CredentialStore>) -> Self {
        let translator = PathTranslator::new(&config.files_dir);
        let registry = Arc::new(SessionRegistry::new(Arc::clone(&store)));
        let dispatcher = Arc::new(PushDispatcher::new(
            PushConfig {
                throttle_window: config.throttle,
                delivery_timeout: config.delivery_timeout,
            },
            Arc::clone(&registry),
        ));
        let watcher = Arc::new(WatcherManager::new(
            FsWatchConfig {
                debounce_window: config.debounce,
            },
            DirectorySnapshotter::new(translator.clone()),
            Arc::clone(&registry),
            Arc::clone(&dispatcher),
        ));
        let archives = Arc::new(ArchiveJobManager::new(
            ArchiveConfig {
                zip_dir: config.zip_dir.clone(),
                level: config.zip_level,
            },
            translator.clone(),
            Arc::clone(&dispatcher),
        ));
        let uploads = UploadStager::new(translator.clone(), &config.incoming_dir);

        Self {
            config,
            translator,
            store,
            registry,
            dispatcher,
            watcher,
            archives,
            uploads,
        }
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn watcher(&self) -> &Arc<WatcherManager> {
        &self.watcher
    }

    pub fn archives(&self) -> &Arc<ArchiveJobManager> {
        &self.archives
    }

    pub fn translator(&self) -> &PathTranslator {
        &self.translator
    }

    /// Bind a new connection. Returns the directory the session resumes in.
    pub async fn connect(&self, token: &str, channel: PushChannel) -> Result<String> {
        let directory = self.registry.bind(token, channel)?;
        self.dispatcher.flush_outbox(token).await;

        let directory = match self.watcher.ensure_watch(&directory).await {
            Ok(()) => directory,
            Err(err) => {
                debug!(path = %directory, error = %err, "resumed directory unavailable");
                let root = self.registry.set_directory(token, ROOT)?;
                self.watcher.ensure_watch(ROOT).await?;
                root
            }
        };
        self.watcher.reconcile().await;

        info!(directory = %directory, "client connected");
        Ok(directory)
    }

    pub async fn disconnect(
        &self,
        token: &str,
        channel_id: Uuid,
        reason: DisconnectReason,
    ) -> Result<()> {
        let released = self.registry.release(token, channel_id, reason).await;
        if reason == DisconnectReason::Logout {
            self.dispatcher.forget(token);
        }
        self.watcher.reconcile().await;
        released?;
        info!(?reason, "client disconnected");
        Ok(())
    }

    /// Dispatch one client message. The login behind `token` is checked
    /// against the store first; a revoked login loses its live session.
    pub async fn handle(&self, token: &str, message: ClientMessage) -> Result<()> {
        let Some(privileged) = self.registry.refresh_privilege(token) else {
            self.dispatcher.forget(token);
            self.watcher.reconcile().await;
            return Err(ShareError::Unauthorized);
        };

        match message {
            ClientMessage::RequestUpdate(path) | ClientMessage::SwitchFolder(path) => {
                self.show_directory(token, &path).await
            }
            ClientMessage::RequestShortlink(path) => {
                let link = self.shortlink_for(&path).await?;
                self.dispatcher
                    .notify(token, ServerMessage::Shortlink { link }, false)
                    .await;
                Ok(())
            }
            ClientMessage::RequestZip(path) => {
                match self.archives.request_archive(token, &path).await? {
                    ArchiveRequest::Started => info!(%path, "archive requested"),
                    ArchiveRequest::AlreadyRunning => debug!(%path, "archive request joined"),
                }
                Ok(())
            }
            ClientMessage::DeleteFile(path) => self.delete(&path).await,
            ClientMessage::CreateFolder(path) => self.create_folder(&path).await,
            ClientMessage::Rename { old, new } => self.rename(token, &old, &new).await,
            ClientMessage::GetUsers => {
                if privileged {
                    self.send_users(token).await;
                }
                Ok(())
            }
            ClientMessage::UpdateUser {
                name,
                pass,
                privileged,
            } => {
                if !privileged {
                    return Ok(());
                }
                if pass.is_empty() {
                    self.store.remove_user(&name).await?;
                    self.evict_revoked().await;
                } else {
                    self.store
                        .add_or_update_user(&name, &pass, privileged)
                        .await?;
                }
                self.send_users(token).await;
                Ok(())
            }
            ClientMessage::GetMime(path) => {
                let mime = mime_guess::from_path(&path)
                    .first_or_octet_stream()
                    .to_string();
                self.dispatcher
                    .notify(token, ServerMessage::MimeType { req: path, mime }, false)
                    .await;
                Ok(())
            }
            ClientMessage::ZeroFiles(files) => self.create_empty_files(token, &files).await,
        }
    }

    /// Start an upload for an authenticated login session. The session
    /// does not need a live connection; without one, files land in `/`.
    pub fn begin_upload(&self, token: &str) -> Result<UploadBatch> {
        if self.store.session_privilege(token).is_none() {
            return Err(ShareError::Unauthorized);
        }
        let base = self
            .registry
            .directory(token)
            .unwrap_or_else(|| ROOT.to_string());
        Ok(self.uploads.begin(token, base))
    }

    /// Place every staged file and tell the uploader.
    pub async fn finish_upload(&self, batch: UploadBatch) -> Vec<String> {
        let token = batch.token().to_string();
        let placed = batch.commit().await;
        self.dispatcher
            .notify(&token, ServerMessage::UploadDone, false)
            .await;
        placed
    }

    pub async fn shortlink_for(&self, path: &str) -> Result<String> {
        let logical = paths::normalize(path)?;
        self.store
            .create_shortlink(&logical, self.config.link_length)
            .await
    }

    /// Logical target of a short link.
    pub fn resolve_shortlink(&self, link: &str) -> Option<String> {
        self.store.resolve_shortlink(link)
    }

    pub async fn shutdown(&self) {
        self.watcher.shutdown().await;
    }

    async fn show_directory(&self, token: &str, requested: &str) -> Result<()> {
        let directory = self.registry.set_directory(token, requested)?;

        let (directory, fell_back) = match self.watcher.ensure_watch(&directory).await {
            Ok(()) => (directory, false),
            Err(err) => {
                debug!(path = %directory, error = %err, "falling back to root");
                let root = self.registry.set_directory(token, ROOT)?;
                self.watcher.ensure_watch(ROOT).await?;
                (root, true)
            }
        };
        self.watcher.reconcile().await;

        let snapshot = self.watcher.refresh(&directory).await?;
        let message = if fell_back {
            ServerMessage::NewFolder {
                folder: snapshot.path,
                data: snapshot.entries,
            }
        } else {
            ServerMessage::UpdateFiles {
                folder: snapshot.path,
                data: snapshot.entries,
            }
        };
        self.dispatcher.notify(token, message, true).await;
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let logical = paths::normalize(path)?;
        if logical == ROOT {
            return Err(ShareError::InvalidPath(logical));
        }
        let target = self.translator.to_fs(&logical)?;
        let meta = fs::symlink_metadata(&target)
            .await
            .map_err(|err| ShareError::from_io(err, &logical))?;
        if meta.is_dir() {
            fs::remove_dir_all(&target).await?;
        } else {
            fs::remove_file(&target).await?;
        }
        info!(path = %logical, "deleted");
        Ok(())
    }

    async fn create_folder(&self, path: &str) -> Result<()> {
        let logical = paths::normalize(path)?;
        paths::validate_name(paths::basename(&logical))?;
        let target = self.translator.to_fs(&logical)?;
        fs::create_dir(&target).await?;
        info!(path = %logical, "folder created");
        Ok(())
    }

    async fn rename(&self, token: &str, old: &str, new: &str) -> Result<()> {
        paths::validate_name(old)?;
        paths::validate_name(new)?;
        let directory = self
            .registry
            .directory(token)
            .ok_or(ShareError::Unauthorized)?;

        let from = self.translator.to_fs(&paths::join(&directory, old))?;
        let to = self.translator.to_fs(&paths::join(&directory, new))?;
        fs::rename(&from, &to)
            .await
            .map_err(|err| ShareError::from_io(err, &paths::join(&directory, old)))?;
        info!(dir = %directory, %old, %new, "renamed");
        Ok(())
    }

    async fn create_empty_files(&self, token: &str, files: &[String]) -> Result<()> {
        let directory = self
            .registry
            .directory(token)
            .ok_or(ShareError::Unauthorized)?;

        for relative in files {
            let segments = match paths::validate_relative(relative) {
                Ok(segments) => segments,
                Err(err) => {
                    warn!(%relative, error = %err, "skipping invalid empty file");
                    continue;
                }
            };
            let logical = paths::join(&directory, &segments.join("/"));
            let target = self.translator.to_fs(&logical)?;
            if let Some(parent) = target.parent()
                && let Err(err) = fs::create_dir_all(parent).await
            {
                warn!(path = %logical, error = %err, "failed to create parent directory");
                continue;
            }
            if let Err(err) = fs::File::create(&target).await {
                warn!(path = %logical, error = %err, "failed to create empty file");
            }
        }

        self.dispatcher
            .notify(token, ServerMessage::UploadDone, false)
            .await;
        Ok(())
    }

    async fn evict_revoked(&self) {
        let evicted = self.registry.evict_revoked();
        if evicted.is_empty() {
            return;
        }
        for token in &evicted {
            self.dispatcher.forget(token);
        }
        self.watcher.reconcile().await;
    }

    async fn send_users(&self, token: &str) {
        let users = self.store.list_users();
        self.dispatcher
            .notify(token, ServerMessage::UserList { users }, false)
            .await;
    }
}
