use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Raw configuration as defined in a TOML file.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct FileConfig {
    #[serde(default)]
    pub server: FileServerConfig,
    #[serde(default)]
    pub storage: FileStorageConfig,
    #[serde(default)]
    pub sync: FileSyncConfig,
    #[serde(default)]
    pub links: FileLinksConfig,
    #[serde(default)]
    pub archive: FileArchiveConfig,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileServerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileStorageConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub incoming_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zip_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assets_dir: Option<PathBuf>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileSyncConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debounce_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub throttle_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivery_timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileLinksConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub length: Option<usize>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileArchiveConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zip_level: Option<i64>,
}

/// Configuration values sourced from environment variables.
#[derive(Debug, Default, Clone)]
pub struct EnvConfig {
    pub config_path: Option<PathBuf>,
    pub server_host: Option<String>,
    pub server_port: Option<u16>,
    pub files_dir: Option<PathBuf>,
    pub incoming_dir: Option<PathBuf>,
    pub zip_dir: Option<PathBuf>,
    pub store_path: Option<PathBuf>,
    pub assets_dir: Option<PathBuf>,
    pub debounce_ms: Option<u64>,
    pub throttle_ms: Option<u64>,
    pub delivery_timeout_ms: Option<u64>,
    pub link_length: Option<usize>,
    pub zip_level: Option<i64>,
}

impl EnvConfig {
    pub fn gather() -> Self {
        Self {
            config_path: path_var("DROPSHELF_CONFIG"),
            server_host: non_empty_var("SERVER_HOST"),
            server_port: parse_var("SERVER_PORT"),
            files_dir: path_var("FILES_DIR"),
            incoming_dir: path_var("INCOMING_DIR"),
            zip_dir: path_var("ZIP_DIR"),
            store_path: path_var("STORE_PATH"),
            assets_dir: path_var("ASSETS_DIR"),
            debounce_ms: parse_var("DEBOUNCE_MS"),
            throttle_ms: parse_var("THROTTLE_MS"),
            delivery_timeout_ms: parse_var("DELIVERY_TIMEOUT_MS"),
            link_length: parse_var("LINK_LENGTH"),
            zip_level: parse_var("ZIP_LEVEL"),
        }
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn path_var(key: &str) -> Option<PathBuf> {
    non_empty_var(key).map(PathBuf::from)
}

fn parse_var<T: std::str::FromStr>(key: &str) -> Option<T> {
    non_empty_var(key).and_then(|value| value.parse().ok())
}
