use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use super::models::Config;

const MIN_TIMER_WINDOW: Duration = Duration::from_millis(50);
const MIN_LINK_LENGTH: usize = 3;

#[derive(Debug, Error)]
pub enum ConfigGuardRailError {
    #[error("archive.zip_level must be between 0 and 9, got {0}")]
    InvalidZipLevel(i64),
    #[error("links.length must be at least 1")]
    EmptyLinkLength,
    #[error("{field} ({path}) must not live inside the files directory")]
    NestedScratchDirectory { field: &'static str, path: String },
    #[error("{field} ({path}) must not live inside {scratch}, which is wiped on startup")]
    InsideScratchDirectory {
        field: &'static str,
        path: String,
        scratch: &'static str,
    },
}

#[derive(Debug, Clone)]
pub struct ConfigWarning {
    pub message: String,
    pub hint: Option<String>,
}

#[derive(Debug, Default, Clone)]
pub struct ConfigWarnings {
    pub items: Vec<ConfigWarning>,
}

impl ConfigWarnings {
    pub fn push<S: Into<String>>(&mut self, message: S) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: None,
        });
    }

    pub fn push_with_hint<S: Into<String>, H: Into<String>>(&mut self, message: S, hint: H) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: Some(hint.into()),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn extend(&mut self, other: ConfigWarnings) {
        self.items.extend(other.items);
    }
}

pub fn apply_guard_rails(config: &Config) -> Result<ConfigWarnings, ConfigGuardRailError> {
    let mut warnings = ConfigWarnings::default();

    if !(0..=9).contains(&config.archive.zip_level) {
        return Err(ConfigGuardRailError::InvalidZipLevel(
            config.archive.zip_level,
        ));
    }

    if config.links.length == 0 {
        return Err(ConfigGuardRailError::EmptyLinkLength);
    }

    // Scratch directories are wiped on startup.
    let storage = &config.storage;
    let files = lexical(&storage.files_dir);
    let scratch = [
        ("storage.incoming_dir", lexical(&storage.incoming_dir)),
        ("storage.zip_dir", lexical(&storage.zip_dir)),
    ];
    for (field, path) in &scratch {
        reject_nested(*field, path, &files)?;
    }

    let mut kept = vec![
        ("storage.files_dir", files),
        ("storage.store_path", lexical(&storage.store_path)),
    ];
    if let Some(assets) = &storage.assets_dir {
        kept.push(("storage.assets_dir", lexical(assets)));
    }
    for (scratch_field, scratch_dir) in &scratch {
        for (field, path) in &kept {
            if path.starts_with(scratch_dir) {
                return Err(ConfigGuardRailError::InsideScratchDirectory {
                    field: *field,
                    path: path.display().to_string(),
                    scratch: *scratch_field,
                });
            }
        }
    }

    if config.links.length < MIN_LINK_LENGTH {
        warnings.push_with_hint(
            format!(
                "links.length = {} makes short links easy to guess",
                config.links.length
            ),
            "Use a link length of at least 3",
        );
    }

    for (name, window) in [
        ("sync.debounce_ms", config.sync.debounce),
        ("sync.throttle_ms", config.sync.throttle),
    ] {
        if window < MIN_TIMER_WINDOW {
            warnings.push_with_hint(
                format!("{name} = {}ms is very small", window.as_millis()),
                "Small windows send one update per filesystem event; 250ms is the default",
            );
        }
    }

    if config.storage.assets_dir.is_none() {
        warnings.push("No assets_dir configured; only the HTTP API and WebSocket are served");
    }

    Ok(warnings)
}

fn reject_nested(
    field: &'static str,
    path: &Path,
    files_dir: &Path,
) -> Result<(), ConfigGuardRailError> {
    if path.starts_with(files_dir) {
        return Err(ConfigGuardRailError::NestedScratchDirectory {
            field,
            path: path.display().to_string(),
        });
    }
    Ok(())
}

/// `path` without `.` components, so `./temp` and `temp` compare equal.
fn lexical(path: &Path) -> PathBuf {
    path.components()
        .filter(|component| !matches!(component, Component::CurDir))
        .collect()
}
