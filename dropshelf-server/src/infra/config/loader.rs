use once_cell::sync::Lazy;
use std::{fs, path::PathBuf, time::Duration};
use thiserror::Error;

use super::{
    models::{
        ArchiveConfig, Config, ConfigMetadata, LinksConfig, ServerConfig, StorageConfig,
        SyncConfig,
    },
    sources::{EnvConfig, FileConfig},
    validation::{self, ConfigGuardRailError, ConfigWarnings},
};

static DEFAULT_CONFIG_LOCATIONS: Lazy<Vec<PathBuf>> = Lazy::new(|| {
    vec![
        PathBuf::from("dropshelf.toml"),
        PathBuf::from("config/dropshelf.toml"),
    ]
});

#[derive(Debug, Default, Clone)]
pub struct ConfigLoaderOptions {
    pub config_path: Option<PathBuf>,
    pub env_file: Option<PathBuf>,
}

#[derive(Debug, Default)]
pub struct ConfigLoader {
    options: ConfigLoaderOptions,
}

#[derive(Debug)]
pub struct ConfigLoad {
    pub config: Config,
    pub warnings: ConfigWarnings,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: ConfigLoaderOptions) -> Self {
        Self { options }
    }

    pub fn with_config_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.config_path = Some(path.into());
        self
    }

    pub fn with_env_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.env_file = Some(path.into());
        self
    }

    pub fn load(&self) -> Result<ConfigLoad, ConfigLoadError> {
        let env_file_loaded = match &self.options.env_file {
            Some(path) => dotenvy::from_path(path)
                .map(|_| true)
                .or_else(|err| match err {
                    dotenvy::Error::Io(_) => Ok(false),
                    _ => Err(err),
                })?,
            None => dotenvy::dotenv()
                .map(|_| true)
                .or_else(|err| match err {
                    dotenvy::Error::Io(_) => Ok(false),
                    _ => Err(err),
                })?,
        };

        self.load_with_env(EnvConfig::gather(), env_file_loaded)
    }

    fn load_with_env(
        &self,
        env_config: EnvConfig,
        env_file_loaded: bool,
    ) -> Result<ConfigLoad, ConfigLoadError> {
        let (file_config, config_path) = self.load_file_config(&env_config)?;
        let (config, warnings) =
            self.compose_config(file_config, env_config, config_path, env_file_loaded)?;
        Ok(ConfigLoad { config, warnings })
    }

    fn load_file_config(
        &self,
        env_config: &EnvConfig,
    ) -> Result<(Option<FileConfig>, Option<PathBuf>), ConfigLoadError> {
        let mut source = ConfigPathSource::default();

        if let Some(explicit) = &self.options.config_path {
            source.explicit = Some(explicit.clone());
        } else if let Some(from_env) = &env_config.config_path {
            source.env = Some(from_env.clone());
        }

        if source.is_empty() {
            source.default = DEFAULT_CONFIG_LOCATIONS
                .iter()
                .find(|candidate| candidate.exists())
                .cloned();
        }

        let Some((path, provenance)) = source.resolved_path() else {
            return Ok((None, None));
        };

        if !path.exists() {
            if provenance.is_explicit() {
                return Err(ConfigLoadError::MissingConfig { path });
            }
            return Ok((None, None));
        }

        let contents = fs::read_to_string(&path).map_err(|err| ConfigLoadError::Io {
            path: path.clone(),
            source: err,
        })?;
        let file_config: FileConfig =
            toml::from_str(&contents).map_err(|err| ConfigLoadError::Parse {
                path: path.clone(),
                source: err,
            })?;

        Ok((Some(file_config), Some(path)))
    }

    fn compose_config(
        &self,
        file_config: Option<FileConfig>,
        env: EnvConfig,
        config_path: Option<PathBuf>,
        env_file_loaded: bool,
    ) -> Result<(Config, ConfigWarnings), ConfigLoadError> {
        let mut warnings = ConfigWarnings::default();

        if file_config.is_none() {
            warnings.push_with_hint(
                "No dropshelf.toml detected; using environment variables and defaults",
                "Create dropshelf.toml or pass --config to pin storage locations",
            );
        }

        let FileConfig {
            server: file_server,
            storage: file_storage,
            sync: file_sync,
            links: file_links,
            archive: file_archive,
        } = file_config.unwrap_or_default();

        let server = ServerConfig {
            host: env
                .server_host
                .or(file_server.host)
                .unwrap_or_else(|| "0.0.0.0".to_string()),
            port: env.server_port.or(file_server.port).unwrap_or(8989),
        };

        let storage = StorageConfig {
            files_dir: env
                .files_dir
                .or(file_storage.files_dir)
                .unwrap_or_else(|| PathBuf::from("./files")),
            incoming_dir: env
                .incoming_dir
                .or(file_storage.incoming_dir)
                .unwrap_or_else(|| PathBuf::from("./temp/incoming")),
            zip_dir: env
                .zip_dir
                .or(file_storage.zip_dir)
                .unwrap_or_else(|| PathBuf::from("./temp/zip")),
            store_path: env
                .store_path
                .or(file_storage.store_path)
                .unwrap_or_else(|| PathBuf::from("./db.json")),
            assets_dir: env.assets_dir.or(file_storage.assets_dir),
        };

        let sync = SyncConfig {
            debounce: Duration::from_millis(
                env.debounce_ms.or(file_sync.debounce_ms).unwrap_or(250),
            ),
            throttle: Duration::from_millis(
                env.throttle_ms.or(file_sync.throttle_ms).unwrap_or(250),
            ),
            delivery_timeout: Duration::from_millis(
                env.delivery_timeout_ms
                    .or(file_sync.delivery_timeout_ms)
                    .unwrap_or(1000),
            ),
        };

        let links = LinksConfig {
            length: env.link_length.or(file_links.length).unwrap_or(3),
        };

        let archive = ArchiveConfig {
            zip_level: env.zip_level.or(file_archive.zip_level).unwrap_or(1),
        };

        let mut config = Config {
            server,
            storage,
            sync,
            links,
            archive,
            metadata: ConfigMetadata {
                config_path,
                env_file_loaded,
            },
        };

        config
            .ensure_directories()
            .map_err(|err| ConfigLoadError::Filesystem { source: err })?;
        config
            .normalize_paths()
            .map_err(|err| ConfigLoadError::Filesystem { source: err })?;

        let guard_warnings = validation::apply_guard_rails(&config)?;
        warnings.extend(guard_warnings);

        Ok((config, warnings))
    }
}

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("configuration file missing: {path}")]
    MissingConfig { path: PathBuf },
    #[error("failed to read configuration {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("filesystem initialization failed")]
    Filesystem { source: anyhow::Error },
    #[error(transparent)]
    GuardRail(#[from] ConfigGuardRailError),
    #[error(transparent)]
    EnvFile(#[from] dotenvy::Error),
}

#[derive(Debug, Default)]
struct ConfigPathSource {
    explicit: Option<PathBuf>,
    env: Option<PathBuf>,
    default: Option<PathBuf>,
}

impl ConfigPathSource {
    fn is_empty(&self) -> bool {
        self.explicit.is_none() && self.env.is_none() && self.default.is_none()
    }

    fn resolved_path(&self) -> Option<(PathBuf, ConfigPathProvenance)> {
        if let Some(path) = &self.explicit {
            return Some((path.clone(), ConfigPathProvenance::Explicit));
        }
        if let Some(path) = &self.env {
            return Some((path.clone(), ConfigPathProvenance::Env));
        }
        if let Some(path) = &self.default {
            return Some((path.clone(), ConfigPathProvenance::Default));
        }
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConfigPathProvenance {
    Explicit,
    Env,
    Default,
}

impl ConfigPathProvenance {
    fn is_explicit(self) -> bool {
        matches!(
            self,
            ConfigPathProvenance::Explicit | ConfigPathProvenance::Env
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(dir: &std::path::Path, body: &str) -> PathBuf {
        let path = dir.join("dropshelf.toml");
        fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn file_values_are_applied_and_directories_created() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().display();
        let path = write_config(
            tmp.path(),
            &format!(
                r#"
                [server]
                port = 9191

                [storage]
                files_dir = "{root}/share"
                incoming_dir = "{root}/scratch/in"
                zip_dir = "{root}/scratch/zip"
                store_path = "{root}/state/db.json"
                assets_dir = "{root}/share-ui"

                [sync]
                debounce_ms = 400

                [links]
                length = 5
                "#
            ),
        );
        fs::create_dir_all(tmp.path().join("share-ui")).unwrap();

        let load = ConfigLoader::new()
            .with_config_path(&path)
            .load_with_env(EnvConfig::default(), false)
            .unwrap();
        let config = load.config;

        assert_eq!(config.server.port, 9191);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.sync.debounce, Duration::from_millis(400));
        assert_eq!(config.sync.throttle, Duration::from_millis(250));
        assert_eq!(config.links.length, 5);
        assert_eq!(config.archive.zip_level, 1);
        assert!(config.storage.files_dir.is_absolute());
        assert!(tmp.path().join("share").is_dir());
        assert!(tmp.path().join("scratch/in").is_dir());
        assert!(tmp.path().join("state").is_dir());
        assert_eq!(config.metadata.config_path, Some(path));
        assert!(load.warnings.is_empty());
    }

    #[test]
    fn environment_overrides_file() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().display();
        let path = write_config(
            tmp.path(),
            &format!(
                r#"
                [server]
                port = 9191

                [storage]
                files_dir = "{root}/share"
                incoming_dir = "{root}/in"
                zip_dir = "{root}/zip"
                store_path = "{root}/db.json"
                "#
            ),
        );

        let env = EnvConfig {
            server_port: Some(7000),
            zip_level: Some(9),
            ..EnvConfig::default()
        };
        let config = ConfigLoader::new()
            .with_config_path(&path)
            .load_with_env(env, false)
            .unwrap()
            .config;

        assert_eq!(config.server.port, 7000);
        assert_eq!(config.archive.zip_level, 9);
    }

    #[test]
    fn missing_explicit_config_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let err = ConfigLoader::new()
            .with_config_path(tmp.path().join("absent.toml"))
            .load_with_env(EnvConfig::default(), false)
            .unwrap_err();
        assert!(matches!(err, ConfigLoadError::MissingConfig { .. }));
    }

    #[test]
    fn malformed_config_is_a_parse_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_config(tmp.path(), "[server\nport = ");
        let err = ConfigLoader::new()
            .with_config_path(&path)
            .load_with_env(EnvConfig::default(), false)
            .unwrap_err();
        assert!(matches!(err, ConfigLoadError::Parse { .. }));
    }

    #[test]
    fn guard_rails_reject_bad_zip_level() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().display();
        let path = write_config(
            tmp.path(),
            &format!(
                r#"
                [storage]
                files_dir = "{root}/share"
                incoming_dir = "{root}/in"
                zip_dir = "{root}/zip"
                store_path = "{root}/db.json"

                [archive]
                zip_level = 42
                "#
            ),
        );
        let err = ConfigLoader::new()
            .with_config_path(&path)
            .load_with_env(EnvConfig::default(), false)
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigLoadError::GuardRail(ConfigGuardRailError::InvalidZipLevel(42))
        ));
    }
}
