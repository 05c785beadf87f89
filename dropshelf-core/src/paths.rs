//! Logical (client-visible) path handling.
//!
//! Clients only ever see paths rooted at `/`. [`PathTranslator`] maps them
//! onto the configured files root, refusing anything that would climb out of
//! it.

use std::path::PathBuf;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{Result, ShareError};

static FORBIDDEN_NAME_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"[\\*{}/?|<>"]"#).expect("static regex"));

static DOTS_ONLY: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\.+$").expect("static regex"));

pub const ROOT: &str = "/";

#[derive(Debug, Clone)]
pub struct PathTranslator {
    root: PathBuf,
}

impl PathTranslator {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve a logical path to an absolute path under the root.
    pub fn to_fs(&self, logical: &str) -> Result<PathBuf> {
        let normalized = normalize(logical)?;
        let mut resolved = self.root.clone();
        for segment in segments(&normalized) {
            resolved.push(segment);
        }
        Ok(resolved)
    }
}

/// Canonical form of a logical path: leading `/`, no empty or `.` segments,
/// no trailing slash (except the root itself). `..` is rejected outright.
pub fn normalize(logical: &str) -> Result<String> {
    if !logical.starts_with('/') {
        return Err(ShareError::InvalidPath(logical.to_string()));
    }

    let mut out = String::with_capacity(logical.len());
    for segment in logical.split('/') {
        match segment {
            "" | "." => continue,
            ".." => return Err(ShareError::InvalidPath(logical.to_string())),
            seg => {
                out.push('/');
                out.push_str(seg);
            }
        }
    }

    if out.is_empty() {
        out.push('/');
    }
    Ok(out)
}

/// Validation applied to directory switches: must be rooted and must not be a
/// bare run of dots.
pub fn validate_directory(logical: &str) -> Result<String> {
    if !logical.starts_with('/') || DOTS_ONLY.is_match(logical) {
        return Err(ShareError::InvalidPath(logical.to_string()));
    }
    normalize(logical)
}

/// Validation for a single user-supplied file or folder name.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || FORBIDDEN_NAME_CHARS.is_match(name) || DOTS_ONLY.is_match(name) {
        return Err(ShareError::InvalidPath(name.to_string()));
    }
    Ok(())
}

/// Validate a `/`-separated relative destination (uploads, zero-byte files).
/// Every segment must pass [`validate_name`].
pub fn validate_relative(relative: &str) -> Result<Vec<&str>> {
    let parts: Vec<&str> = relative.split('/').filter(|s| !s.is_empty()).collect();
    if parts.is_empty() {
        return Err(ShareError::InvalidPath(relative.to_string()));
    }
    for part in &parts {
        validate_name(part).map_err(|_| ShareError::InvalidPath(relative.to_string()))?;
    }
    Ok(parts)
}

/// Join a logical directory with a relative name.
pub fn join(dir: &str, name: &str) -> String {
    if dir == ROOT {
        format!("/{name}")
    } else {
        format!("{}/{}", dir.trim_end_matches('/'), name)
    }
}

/// Final segment of a logical path.
pub fn basename(logical: &str) -> &str {
    logical.rsplit('/').next().unwrap_or_default()
}

fn segments(normalized: &str) -> impl Iterator<Item = &str> {
    normalized.split('/').filter(|s| !s.is_empty())
}
