use std::{path::Path, sync::Arc};

use anyhow::{Context, Result};
use dropshelf_core::{CredentialStore, SyncHub};
use tracing::{info, warn};

use crate::infra::{app_state::AppState, config::Config};

/// Prepare storage and assemble the shared application state.
pub async fn build_state(config: Config) -> Result<AppState> {
    reset_scratch_directories(&config).await?;

    let store = CredentialStore::open(&config.storage.store_path)
        .await
        .with_context(|| {
            format!(
                "failed to open credential store at {}",
                config.storage.store_path.display()
            )
        })?;
    let store = Arc::new(store);

    prune_dead_shortlinks(&store, config.files_dir()).await?;

    if !store.has_users() {
        warn!("no users configured; the first visitor will be asked to create an admin account");
    }

    let hub = Arc::new(SyncHub::new(config.hub_config(), store));
    Ok(AppState::new(hub, Arc::new(config)))
}

/// Upload staging and archive directories never survive a restart.
async fn reset_scratch_directories(config: &Config) -> Result<()> {
    for dir in [&config.storage.incoming_dir, &config.storage.zip_dir] {
        match tokio::fs::remove_dir_all(dir).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err).with_context(|| format!("failed to clear {}", dir.display()));
            }
        }
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }
    tokio::fs::create_dir_all(config.files_dir())
        .await
        .with_context(|| format!("failed to create {}", config.files_dir().display()))?;
    Ok(())
}

async fn prune_dead_shortlinks(store: &CredentialStore, files_dir: &Path) -> Result<()> {
    let removed = store
        .prune_shortlinks(|logical| {
            let relative = logical.trim_start_matches('/');
            relative.is_empty() || files_dir.join(relative).exists()
        })
        .await
        .context("failed to prune short links")?;
    if removed > 0 {
        info!(removed, "pruned short links to missing files");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::infra::config::{
        ArchiveConfig, ConfigMetadata, LinksConfig, ServerConfig, StorageConfig, SyncConfig,
    };

    fn config(root: &Path) -> Config {
        Config {
            server: ServerConfig {
                host: "127.0.0.1".into(),
                port: 0,
            },
            storage: StorageConfig {
                files_dir: root.join("files"),
                incoming_dir: root.join("incoming"),
                zip_dir: root.join("zip"),
                store_path: root.join("db.json"),
                assets_dir: None,
            },
            sync: SyncConfig {
                debounce: Duration::from_millis(250),
                throttle: Duration::from_millis(250),
                delivery_timeout: Duration::from_millis(1000),
            },
            links: LinksConfig { length: 3 },
            archive: ArchiveConfig { zip_level: 1 },
            metadata: ConfigMetadata::default(),
        }
    }

    #[tokio::test]
    async fn startup_wipes_scratch_and_prunes_links() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = config(tmp.path());
        std::fs::create_dir_all(tmp.path().join("incoming")).unwrap();
        std::fs::write(tmp.path().join("incoming/stale.part"), b"x").unwrap();
        std::fs::create_dir_all(tmp.path().join("zip/docs")).unwrap();
        std::fs::create_dir_all(tmp.path().join("files")).unwrap();
        std::fs::write(tmp.path().join("files/kept.txt"), b"k").unwrap();

        {
            let store = CredentialStore::open(tmp.path().join("db.json")).await.unwrap();
            store.create_shortlink("/kept.txt", 3).await.unwrap();
            store.create_shortlink("/gone.txt", 3).await.unwrap();
        }

        let state = build_state(cfg).await.unwrap();

        assert!(tmp.path().join("incoming").is_dir());
        assert!(!tmp.path().join("incoming/stale.part").exists());
        assert!(!tmp.path().join("zip/docs").exists());
        let store = state.hub.store();
        assert!(store.shortlink_for("/kept.txt").is_some());
        assert!(store.shortlink_for("/gone.txt").is_none());
    }
}
