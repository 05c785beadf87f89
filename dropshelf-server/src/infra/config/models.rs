use std::path::{Path, PathBuf};
use std::time::Duration;

use dropshelf_core::HubConfig;

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub sync: SyncConfig,
    pub links: LinksConfig,
    pub archive: ArchiveConfig,
    pub metadata: ConfigMetadata,
}

impl Config {
    pub fn ensure_directories(&self) -> anyhow::Result<()> {
        self.storage.ensure_directories()
    }

    pub fn normalize_paths(&mut self) -> anyhow::Result<()> {
        self.storage.normalize_paths()
    }

    pub fn files_dir(&self) -> &Path {
        &self.storage.files_dir
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Engine settings derived from this configuration.
    pub fn hub_config(&self) -> HubConfig {
        let mut hub = HubConfig::new(
            &self.storage.files_dir,
            &self.storage.incoming_dir,
            &self.storage.zip_dir,
        );
        hub.debounce = self.sync.debounce;
        hub.throttle = self.sync.throttle;
        hub.delivery_timeout = self.sync.delivery_timeout;
        hub.link_length = self.links.length;
        hub.zip_level = self.archive.zip_level;
        hub
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub files_dir: PathBuf,
    pub incoming_dir: PathBuf,
    pub zip_dir: PathBuf,
    pub store_path: PathBuf,
    pub assets_dir: Option<PathBuf>,
}

impl StorageConfig {
    fn ensure_directories(&self) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.files_dir)?;
        std::fs::create_dir_all(&self.incoming_dir)?;
        std::fs::create_dir_all(&self.zip_dir)?;
        if let Some(parent) = self.store_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }

    fn normalize_paths(&mut self) -> anyhow::Result<()> {
        self.files_dir = std::fs::canonicalize(&self.files_dir)?;
        self.incoming_dir = std::fs::canonicalize(&self.incoming_dir)?;
        self.zip_dir = std::fs::canonicalize(&self.zip_dir)?;
        if let Some(assets) = self.assets_dir.as_mut() {
            *assets = std::fs::canonicalize(&*assets)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub debounce: Duration,
    pub throttle: Duration,
    pub delivery_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct LinksConfig {
    pub length: usize,
}

#[derive(Debug, Clone)]
pub struct ArchiveConfig {
    /// Deflate level, 0-9.
    pub zip_level: i64,
}

#[derive(Debug, Clone, Default)]
pub struct ConfigMetadata {
    pub config_path: Option<PathBuf>,
    pub env_file_loaded: bool,
}
