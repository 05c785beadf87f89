pub mod loader;
pub mod models;
pub mod sources;
pub mod validation;

pub use loader::{ConfigLoad, ConfigLoadError, ConfigLoader, ConfigLoaderOptions};
pub use models::{
    ArchiveConfig, Config, ConfigMetadata, LinksConfig, ServerConfig, StorageConfig, SyncConfig,
};
pub use validation::{ConfigGuardRailError, ConfigWarning, ConfigWarnings};
