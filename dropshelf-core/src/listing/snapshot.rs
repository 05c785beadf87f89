use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::warn;

use super::du;
use crate::error::{Result, ShareError};
use crate::paths::{self, PathTranslator};

/// Children stat'ed concurrently per snapshot.
const STAT_CONCURRENCY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    #[serde(rename = "f")]
    File,
    #[serde(rename = "d")]
    Directory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    #[serde(rename = "type")]
    pub kind: EntryKind,
    /// Bytes; recursive sum for directories.
    pub size: u64,
    /// Unix milliseconds, 0 when unknown.
    #[serde(rename = "mtime")]
    pub modified_at: i64,
}

impl Entry {
    fn unreadable() -> Self {
        Self {
            kind: EntryKind::File,
            size: 0,
            modified_at: 0,
        }
    }
}

/// One directory's immediate children, keyed by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectorySnapshot {
    pub path: String,
    pub entries: BTreeMap<String, Entry>,
}

#[derive(Debug, Clone)]
pub struct DirectorySnapshotter {
    translator: PathTranslator,
}

impl DirectorySnapshotter {
    pub fn new(translator: PathTranslator) -> Self {
        Self { translator }
    }

    pub fn translator(&self) -> &PathTranslator {
        &self.translator
    }

    /// List `logical` and describe every child. A child that cannot be
    /// stat'ed is kept with size 0; only failure to read the directory
    /// itself is an error.
    pub async fn snapshot(&self, logical: &str) -> Result<DirectorySnapshot> {
        let logical = paths::normalize(logical)?;
        let dir = self.translator.to_fs(&logical)?;

        let mut read_dir = fs::read_dir(&dir)
            .await
            .map_err(|err| ShareError::from_io(err, &logical))?;

        let mut children: Vec<(String, PathBuf)> = Vec::new();
        loop {
            match read_dir.next_entry().await {
                Ok(Some(entry)) => {
                    let name = entry.file_name().to_string_lossy().into_owned();
                    children.push((name, entry.path()));
                }
                Ok(None) => break,
                Err(err) => {
                    warn!(path = %logical, error = %err, "directory listing interrupted");
                    break;
                }
            }
        }

        let entries: BTreeMap<String, Entry> = stream::iter(children)
            .map(|(name, path)| async move {
                let entry = describe(&path).await;
                entry.map(|entry| (name, entry))
            })
            .buffer_unordered(STAT_CONCURRENCY)
            .filter_map(|item| async move { item })
            .collect()
            .await;

        Ok(DirectorySnapshot {
            path: logical,
            entries,
        })
    }
}

async fn describe(path: &Path) -> Option<Entry> {
    let meta = match fs::metadata(path).await {
        Ok(meta) => meta,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "failed to stat entry");
            return Some(Entry::unreadable());
        }
    };

    let modified_at = meta.modified().ok().map(unix_millis).unwrap_or(0);

    if meta.is_dir() {
        Some(Entry {
            kind: EntryKind::Directory,
            size: du::aggregate(path).await,
            modified_at,
        })
    } else if meta.is_file() {
        Some(Entry {
            kind: EntryKind::File,
            size: meta.len(),
            modified_at,
        })
    } else {
        None
    }
}

fn unix_millis(time: SystemTime) -> i64 {
    DateTime::<Utc>::from(time).timestamp_millis()
}
