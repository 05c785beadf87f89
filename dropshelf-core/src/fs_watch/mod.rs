//! Directory watches for the folders clients are looking at.
//!
//! Each watched directory owns a non-recursive `notify` watcher and a
//! debounce task. Raw events only mark the directory dirty; once the burst
//! has been quiet for the debounce window the directory is re-listed and the
//! new snapshot is pushed to every session viewing it.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use notify::event::{EventKind, MetadataKind, ModifyKind};
use notify::{Config as NotifyConfig, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{Mutex, mpsc};
use tokio::task::{JoinHandle, spawn_blocking};
use tokio::time::{Duration, timeout};
use tracing::{debug, info, warn};

use crate::error::{Result, ShareError};
use crate::listing::{DirectorySnapshot, DirectorySnapshotter};
use crate::paths::{self, ROOT};
use crate::protocol::ServerMessage;
use crate::push::PushDispatcher;
use crate::session::SessionRegistry;

const WATCH_CHANNEL_CAPACITY: usize = 256;

#[derive(Clone, Debug)]
pub struct FsWatchConfig {
    /// Quiet period required before a burst of events is acted on.
    pub debounce_window: Duration,
}

impl Default for FsWatchConfig {
    fn default() -> Self {
        Self {
            debounce_window: Duration::from_millis(250),
        }
    }
}

pub struct WatcherManager {
    config: FsWatchConfig,
    snapshotter: DirectorySnapshotter,
    registry: Arc<SessionRegistry>,
    dispatcher: Arc<PushDispatcher>,
    watches: Mutex<HashMap<PathBuf, DirectoryWatch>>,
    snapshots: DashMap<String, DirectorySnapshot>,
}

impl fmt::Debug for WatcherManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("WatcherManager");
        debug.field("config", &self.config);
        match self.watches.try_lock() {
            Ok(guard) => {
                debug.field("watch_count", &guard.len());
            }
            Err(_) => {
                debug.field("watches", &"<locked>");
            }
        }
        debug
            .field("cached_snapshots", &self.snapshots.len())
            .finish()
    }
}

impl WatcherManager {
    pub fn new(
        config: FsWatchConfig,
        snapshotter: DirectorySnapshotter,
        registry: Arc<SessionRegistry>,
        dispatcher: Arc<PushDispatcher>,
    ) -> Self {
        Self {
            config,
            snapshotter,
            registry,
            dispatcher,
            watches: Mutex::new(HashMap::new()),
            snapshots: DashMap::new(),
        }
    }

    /// Start watching `logical` unless it is already watched. The target
    /// must be an existing directory.
    pub async fn ensure_watch(self: &Arc<Self>, logical: &str) -> Result<()> {
        let logical = paths::normalize(logical)?;
        let absolute = self.snapshotter.translator().to_fs(&logical)?;

        let mut watches = self.watches.lock().await;
        if watches.contains_key(&absolute) {
            return Ok(());
        }

        let watch_failed = |reason: String| ShareError::WatchFailed {
            path: absolute.clone(),
            reason,
        };

        let meta = tokio::fs::metadata(&absolute)
            .await
            .map_err(|err| watch_failed(err.to_string()))?;
        if !meta.is_dir() {
            return Err(watch_failed("not a directory".into()));
        }

        let (tx, rx) = mpsc::channel::<WatchMessage>(WATCH_CHANNEL_CAPACITY);
        let watch_path = absolute.clone();
        let watcher = spawn_blocking(move || init_watcher(watch_path, tx))
            .await
            .map_err(|join_err| {
                watch_failed(format!("watcher initialization panicked: {join_err}"))
            })??;

        let flush_task = spawn_watch_loop(
            Arc::downgrade(self),
            logical.clone(),
            rx,
            self.config.debounce_window,
        );

        debug!(path = %logical, "watching directory");
        watches.insert(
            absolute,
            DirectoryWatch {
                logical,
                _watcher: watcher,
                flush_task,
            },
        );
        Ok(())
    }

    /// Drop watches no connected session refers to any more.
    pub async fn reconcile(&self) {
        let mut watches = self.watches.lock().await;
        let referenced: HashSet<PathBuf> = self
            .registry
            .referenced_directories()
            .iter()
            .filter_map(|dir| self.snapshotter.translator().to_fs(dir).ok())
            .collect();

        let stale: Vec<PathBuf> = watches
            .keys()
            .filter(|path| !referenced.contains(*path))
            .cloned()
            .collect();

        for path in stale {
            if let Some(watch) = watches.remove(&path) {
                debug!(path = %watch.logical, "unwatching directory");
                self.snapshots.remove(&watch.logical);
                watch.shutdown();
            }
        }
    }

    /// Re-list `logical` and store the result.
    pub async fn refresh(&self, logical: &str) -> Result<DirectorySnapshot> {
        match self.snapshotter.snapshot(logical).await {
            Ok(snapshot) => {
                self.snapshots
                    .insert(snapshot.path.clone(), snapshot.clone());
                Ok(snapshot)
            }
            Err(err) => {
                if let Ok(key) = paths::normalize(logical) {
                    self.snapshots.remove(&key);
                }
                Err(err)
            }
        }
    }

    /// Last snapshot computed for `logical`.
    pub fn cached(&self, logical: &str) -> Option<DirectorySnapshot> {
        self.snapshots.get(logical).map(|entry| entry.value().clone())
    }

    pub async fn is_watching(&self, logical: &str) -> bool {
        let Ok(absolute) = self.snapshotter.translator().to_fs(logical) else {
            return false;
        };
        self.watches.lock().await.contains_key(&absolute)
    }

    pub async fn watch_count(&self) -> usize {
        self.watches.lock().await.len()
    }

    /// Tear down every watch.
    pub async fn shutdown(&self) {
        let mut guard = self.watches.lock().await;
        let watches: Vec<_> = guard.drain().map(|(_, watch)| watch).collect();
        drop(guard);
        let count = watches.len();
        for watch in watches {
            watch.shutdown();
        }
        self.snapshots.clear();
        info!(count, "directory watches stopped");
    }

    async fn refresh_and_notify(self: &Arc<Self>, logical: &str) {
        match self.refresh(logical).await {
            Ok(snapshot) => {
                for token in self.registry.sessions_in_directory(logical) {
                    let message = ServerMessage::UpdateFiles {
                        folder: snapshot.path.clone(),
                        data: snapshot.entries.clone(),
                    };
                    self.dispatcher.notify(&token, message, false).await;
                }
            }
            Err(ShareError::NotFound(_)) => {
                // The watch being torn down runs this task, so move viewers
                // out from a separate one.
                let this = Arc::clone(self);
                let logical = logical.to_string();
                tokio::spawn(async move { this.evacuate(&logical).await });
            }
            Err(err) => {
                warn!(path = %logical, error = %err, "failed to refresh watched directory");
            }
        }
    }

    /// `logical` vanished: send its viewers back to the root.
    async fn evacuate(self: &Arc<Self>, logical: &str) {
        let moved = self.registry.relocate(logical, ROOT);
        info!(path = %logical, sessions = moved.len(), "watched directory removed");

        if let Err(err) = self.ensure_watch(ROOT).await {
            warn!(error = %err, "failed to watch root after evacuation");
        }
        self.reconcile().await;

        if moved.is_empty() {
            return;
        }
        match self.refresh(ROOT).await {
            Ok(snapshot) => {
                for token in moved {
                    let message = ServerMessage::NewFolder {
                        folder: snapshot.path.clone(),
                        data: snapshot.entries.clone(),
                    };
                    self.dispatcher.notify(&token, message, true).await;
                }
            }
            Err(err) => warn!(error = %err, "failed to list root"),
        }
    }
}

struct DirectoryWatch {
    logical: String,
    _watcher: RecommendedWatcher,
    flush_task: JoinHandle<()>,
}

impl DirectoryWatch {
    fn shutdown(self) {
        self.flush_task.abort();
        // Dropping the watcher stops the notify stream.
    }
}

impl fmt::Debug for DirectoryWatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectoryWatch")
            .field("logical", &self.logical)
            .field("flush_task_finished", &self.flush_task.is_finished())
            .finish()
    }
}

enum WatchMessage {
    Event(Event),
    Error(String),
}

impl fmt::Debug for WatchMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatchMessage::Event(event) => f
                .debug_struct("WatchMessage::Event")
                .field("kind", &event.kind)
                .field("path_count", &event.paths.len())
                .finish(),
            WatchMessage::Error(message) => f
                .debug_struct("WatchMessage::Error")
                .field("message", message)
                .finish(),
        }
    }
}

fn spawn_watch_loop(
    manager: Weak<WatcherManager>,
    logical: String,
    mut rx: mpsc::Receiver<WatchMessage>,
    debounce_window: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut dirty = false;

        loop {
            let msg = if !dirty {
                rx.recv().await
            } else {
                match timeout(debounce_window, rx.recv()).await {
                    Ok(msg) => msg,
                    Err(_) => {
                        dirty = false;
                        let Some(manager) = manager.upgrade() else {
                            break;
                        };
                        manager.refresh_and_notify(&logical).await;
                        continue;
                    }
                }
            };

            let Some(msg) = msg else {
                break;
            };

            match msg {
                WatchMessage::Event(event) => {
                    if is_relevant(&event.kind) {
                        dirty = true;
                    }
                }
                WatchMessage::Error(error) => {
                    warn!(path = %logical, %error, "watch error");
                    dirty = true;
                }
            }
        }
    })
}

fn is_relevant(kind: &EventKind) -> bool {
    !matches!(
        kind,
        EventKind::Access(_) | EventKind::Modify(ModifyKind::Metadata(MetadataKind::AccessTime))
    )
}

fn init_watcher(path: PathBuf, tx: mpsc::Sender<WatchMessage>) -> Result<RecommendedWatcher> {
    let mut watcher = RecommendedWatcher::new(
        move |res: std::result::Result<Event, notify::Error>| {
            let msg = match res {
                Ok(event) => WatchMessage::Event(event),
                Err(err) => WatchMessage::Error(err.to_string()),
            };
            // A full buffer already guarantees a pending refresh.
            let _ = tx.try_send(msg);
        },
        NotifyConfig::default(),
    )
    .map_err(|err| ShareError::WatchFailed {
        path: path.clone(),
        reason: err.to_string(),
    })?;

    watcher
        .watch(&path, RecursiveMode::NonRecursive)
        .map_err(|err| ShareError::WatchFailed {
            path: path.clone(),
            reason: err.to_string(),
        })?;

    Ok(watcher)
}
