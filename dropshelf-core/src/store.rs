//! JSON-file backed credential store: users, login sessions and short links.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};

use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rand::{Rng, RngCore, rng};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Result, ShareError};

/// Short link tokens avoid characters that are easy to confuse.
pub const LINK_ALPHABET: &[u8] = b"abcdefghjkmnpqrstuvwxyz23456789";

const SALT_LENGTH: usize = 16;
const SESSION_TOKEN_BYTES: usize = 32;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub hash: String,
    pub privileged: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub username: String,
    pub privileged: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub remember: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreData {
    #[serde(default)]
    pub users: BTreeMap<String, UserRecord>,
    #[serde(default)]
    pub sessions: HashMap<String, SessionRecord>,
    #[serde(default)]
    pub shortlinks: BTreeMap<String, String>,
}

/// Mutations hold `write_lock` across the in-memory change and the file
/// write so persisted state is never older than a concurrent reader's view.
pub struct CredentialStore {
    path: Option<PathBuf>,
    data: RwLock<StoreData>,
    write_lock: Mutex<()>,
}

impl fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = self.data.read();
        f.debug_struct("CredentialStore")
            .field("path", &self.path)
            .field("users", &data.users.len())
            .field("sessions", &data.sessions.len())
            .field("shortlinks", &data.shortlinks.len())
            .finish()
    }
}

impl CredentialStore {
    /// Load the store at `path`. A missing or empty file starts a fresh
    /// store and writes it back; unparseable content is an error.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(err) => return Err(ShareError::Io(err)),
        };

        let fresh = contents.trim().is_empty();
        let data = if fresh {
            StoreData::default()
        } else {
            serde_json::from_str(&contents).map_err(|err| {
                ShareError::Store(format!("{} is corrupt: {err}", path.display()))
            })?
        };

        let store = Self {
            path: Some(path),
            data: RwLock::new(data),
            write_lock: Mutex::new(()),
        };

        if fresh {
            let _guard = store.write_lock.lock().await;
            store.persist().await?;
            info!(path = ?store.path, "initialized empty credential store");
        }

        Ok(store)
    }

    /// Store that never touches disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            data: RwLock::new(StoreData::default()),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn has_users(&self) -> bool {
        !self.data.read().users.is_empty()
    }

    /// User name to privilege flag.
    pub fn list_users(&self) -> BTreeMap<String, bool> {
        self.data
            .read()
            .users
            .iter()
            .map(|(name, record)| (name.clone(), record.privileged))
            .collect()
    }

    pub async fn add_or_update_user(
        &self,
        name: &str,
        password: &str,
        privileged: bool,
    ) -> Result<()> {
        if name.is_empty() || password.is_empty() {
            return Err(ShareError::Store(
                "user name and password must not be empty".into(),
            ));
        }
        let hash = hash_password(password)?;

        let _guard = self.write_lock.lock().await;
        self.data
            .write()
            .users
            .insert(name.to_string(), UserRecord { hash, privileged });
        self.persist().await?;
        info!(user = %name, privileged, "user saved");
        Ok(())
    }

    /// Remove a user and every session they own. Returns whether the user
    /// existed.
    pub async fn remove_user(&self, name: &str) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let existed = {
            let mut data = self.data.write();
            let existed = data.users.remove(name).is_some();
            data.sessions.retain(|_, session| session.username != name);
            existed
        };
        if existed {
            self.persist().await?;
            info!(user = %name, "user removed");
        }
        Ok(existed)
    }

    pub fn verify_user(&self, name: &str, password: &str) -> bool {
        let Some(hash) = self.data.read().users.get(name).map(|u| u.hash.clone()) else {
            return false;
        };
        let Ok(parsed) = PasswordHash::new(&hash) else {
            return false;
        };
        Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok()
    }

    /// Issue a new login session token for an existing user.
    pub async fn create_session(&self, name: &str, remember: bool) -> Result<String> {
        let mut token_bytes = [0u8; SESSION_TOKEN_BYTES];
        rng().fill_bytes(&mut token_bytes);
        let token = URL_SAFE_NO_PAD.encode(token_bytes);

        let _guard = self.write_lock.lock().await;
        {
            let mut data = self.data.write();
            let privileged = data
                .users
                .get(name)
                .map(|user| user.privileged)
                .ok_or(ShareError::Unauthorized)?;
            data.sessions.insert(
                token.clone(),
                SessionRecord {
                    username: name.to_string(),
                    privileged,
                    created_at: Utc::now(),
                    remember,
                },
            );
        }
        self.persist().await?;
        debug!(user = %name, "session created");
        Ok(token)
    }

    /// Privilege flag of a known session, `None` for unknown tokens.
    pub fn session_privilege(&self, token: &str) -> Option<bool> {
        self.data.read().sessions.get(token).map(|s| s.privileged)
    }

    pub async fn revoke_session(&self, token: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        if self.data.write().sessions.remove(token).is_some() {
            self.persist().await?;
        }
        Ok(())
    }

    /// Existing link token for `path`, if any.
    pub fn shortlink_for(&self, path: &str) -> Option<String> {
        self.data
            .read()
            .shortlinks
            .iter()
            .find(|(_, target)| target.as_str() == path)
            .map(|(link, _)| link.clone())
    }

    /// Return the link for `path`, minting a new collision-free token of
    /// `length` characters when none exists yet.
    pub async fn create_shortlink(&self, path: &str, length: usize) -> Result<String> {
        let _guard = self.write_lock.lock().await;
        let link = {
            let mut data = self.data.write();
            if let Some((link, _)) = data.shortlinks.iter().find(|(_, target)| *target == path) {
                return Ok(link.clone());
            }
            let mut link = random_link(length.max(1));
            while data.shortlinks.contains_key(&link) {
                link = random_link(length.max(1));
            }
            data.shortlinks.insert(link.clone(), path.to_string());
            link
        };
        self.persist().await?;
        debug!(%link, %path, "short link created");
        Ok(link)
    }

    pub fn resolve_shortlink(&self, link: &str) -> Option<String> {
        self.data.read().shortlinks.get(link).cloned()
    }

    /// Drop every link whose target fails `keep`. Returns the number removed.
    pub async fn prune_shortlinks<F>(&self, mut keep: F) -> Result<usize>
    where
        F: FnMut(&str) -> bool,
    {
        let _guard = self.write_lock.lock().await;
        let removed = {
            let mut data = self.data.write();
            let before = data.shortlinks.len();
            data.shortlinks.retain(|_, target| keep(target));
            before - data.shortlinks.len()
        };
        if removed > 0 {
            self.persist().await?;
        }
        Ok(removed)
    }

    /// Caller must hold `write_lock`.
    async fn persist(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let serialized = serde_json::to_vec_pretty(&*self.data.read())?;

        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &serialized).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

fn hash_password(password: &str) -> Result<String> {
    let mut salt_bytes = [0u8; SALT_LENGTH];
    rng().fill_bytes(&mut salt_bytes);
    let salt = SaltString::encode_b64(&salt_bytes)
        .map_err(|err| ShareError::Internal(format!("salt encoding failed: {err}")))?;
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|err| ShareError::Internal(format!("password hashing failed: {err}")))?;
    Ok(hash.to_string())
}

fn random_link(length: usize) -> String {
    let mut rng = rng();
    (0..length)
        .map(|_| LINK_ALPHABET[rng.random_range(0..LINK_ALPHABET.len())] as char)
        .collect()
}
