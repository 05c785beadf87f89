//! WebSocket wire messages.
//!
//! Client frames are adjacently tagged (`{"type": ..., "data": ...}`), server
//! frames carry their fields next to the `type` tag.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::listing::Entry;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
    RequestUpdate(String),
    SwitchFolder(String),
    RequestShortlink(String),
    RequestZip(String),
    DeleteFile(String),
    CreateFolder(String),
    Rename {
        old: String,
        new: String,
    },
    GetUsers,
    UpdateUser {
        name: String,
        #[serde(default)]
        pass: String,
        #[serde(rename = "priv", default)]
        privileged: bool,
    },
    GetMime(String),
    ZeroFiles(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerMessage {
    UpdateFiles {
        folder: String,
        data: BTreeMap<String, Entry>,
    },
    NewFolder {
        folder: String,
        data: BTreeMap<String, Entry>,
    },
    Shortlink {
        link: String,
    },
    ZipReady {
        path: String,
        size: u64,
    },
    UserList {
        users: BTreeMap<String, bool>,
    },
    UploadDone,
    MimeType {
        req: String,
        mime: String,
    },
}

impl ServerMessage {
    /// Directory snapshots are throttled; everything else is delivered as-is.
    pub fn is_directory_update(&self) -> bool {
        matches!(
            self,
            ServerMessage::UpdateFiles { .. } | ServerMessage::NewFolder { .. }
        )
    }

    /// Logical folder a directory update describes.
    pub fn folder(&self) -> Option<&str> {
        match self {
            ServerMessage::UpdateFiles { folder, .. } | ServerMessage::NewFolder { folder, .. } => {
                Some(folder)
            }
            _ => None,
        }
    }
}
