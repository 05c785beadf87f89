use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ShareError {
    #[error("Unauthorized")]
    Unauthorized,

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Failed to watch {path}: {reason}")]
    WatchFailed { path: PathBuf, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ShareError {
    /// Maps an IO error on `path` to `NotFound` when the target is missing.
    pub fn from_io(err: std::io::Error, path: &str) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            ShareError::NotFound(path.to_string())
        } else {
            ShareError::Io(err)
        }
    }
}

pub type Result<T> = std::result::Result<T, ShareError>;
