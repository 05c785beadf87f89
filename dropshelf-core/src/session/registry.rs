use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info};
use uuid::Uuid;

use super::channel::PushChannel;
use crate::error::{Result, ShareError};
use crate::paths::{self, ROOT};
use crate::store::CredentialStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Client asked to log out; the session is forgotten and revoked.
    Logout,
    /// Network drop or tab close; the session keeps its directory.
    Transient,
}

#[derive(Debug, Clone)]
struct Session {
    directory: String,
    channel: Option<PushChannel>,
    privileged: bool,
}

/// Live sessions keyed by token.
pub struct SessionRegistry {
    sessions: DashMap<String, Session>,
    store: Arc<CredentialStore>,
}

impl fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let connected = self
            .sessions
            .iter()
            .filter(|entry| entry.channel.is_some())
            .count();
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.sessions.len())
            .field("connected", &connected)
            .finish()
    }
}

impl SessionRegistry {
    pub fn new(store: Arc<CredentialStore>) -> Self {
        Self {
            sessions: DashMap::new(),
            store,
        }
    }

    /// Attach `channel` to the session, creating it at `/` on first sight.
    /// Any previous channel is replaced but not closed. Returns the session's
    /// current directory.
    pub fn bind(&self, token: &str, channel: PushChannel) -> Result<String> {
        let privileged = self
            .store
            .session_privilege(token)
            .ok_or(ShareError::Unauthorized)?;

        let mut session = self
            .sessions
            .entry(token.to_string())
            .or_insert_with(|| Session {
                directory: ROOT.to_string(),
                channel: None,
                privileged,
            });
        session.privileged = privileged;
        if session.channel.replace(channel).is_some() {
            debug!("superseded existing channel");
        }
        Ok(session.directory.clone())
    }

    /// Point the session at `path`. Returns the normalized directory.
    pub fn set_directory(&self, token: &str, path: &str) -> Result<String> {
        let directory = paths::validate_directory(path)?;
        let mut session = self
            .sessions
            .get_mut(token)
            .ok_or(ShareError::Unauthorized)?;
        session.directory = directory.clone();
        Ok(directory)
    }

    pub async fn unbind(&self, token: &str, reason: DisconnectReason) -> Result<()> {
        match reason {
            DisconnectReason::Logout => {
                self.sessions.remove(token);
                self.store.revoke_session(token).await?;
                info!("session logged out");
            }
            DisconnectReason::Transient => {
                if let Some(mut session) = self.sessions.get_mut(token) {
                    session.channel = None;
                }
            }
        }
        Ok(())
    }

    /// Like [`unbind`](Self::unbind), but a transient close only detaches
    /// the channel if `channel_id` is still the one bound. Logout always
    /// applies. Returns whether anything changed.
    pub async fn release(
        &self,
        token: &str,
        channel_id: Uuid,
        reason: DisconnectReason,
    ) -> Result<bool> {
        if reason == DisconnectReason::Logout {
            self.unbind(token, reason).await?;
            return Ok(true);
        }

        let Some(mut session) = self.sessions.get_mut(token) else {
            return Ok(false);
        };
        let current = session.channel.as_ref().map(PushChannel::id);
        if current == Some(channel_id) {
            session.channel = None;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Re-read the session's privilege from the store. A session whose
    /// login was revoked is dropped from the registry and yields `None`,
    /// as does a token that was never bound.
    pub fn refresh_privilege(&self, token: &str) -> Option<bool> {
        let Some(privileged) = self.store.session_privilege(token) else {
            if self.sessions.remove(token).is_some() {
                info!("evicted revoked session");
            }
            return None;
        };
        let mut session = self.sessions.get_mut(token)?;
        session.privileged = privileged;
        Some(privileged)
    }

    /// Drop every session whose login no longer exists in the store.
    /// Their channels close once the last sender is gone.
    pub fn evict_revoked(&self) -> Vec<String> {
        let revoked: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| self.store.session_privilege(entry.key()).is_none())
            .map(|entry| entry.key().clone())
            .collect();
        for token in &revoked {
            self.sessions.remove(token);
        }
        if !revoked.is_empty() {
            info!(count = revoked.len(), "evicted revoked sessions");
        }
        revoked
    }

    pub fn contains(&self, token: &str) -> bool {
        self.sessions.contains_key(token)
    }

    pub fn directory(&self, token: &str) -> Option<String> {
        self.sessions.get(token).map(|s| s.directory.clone())
    }

    pub fn channel(&self, token: &str) -> Option<PushChannel> {
        self.sessions.get(token).and_then(|s| s.channel.clone())
    }

    /// Tokens of connected sessions currently viewing `directory`.
    pub fn sessions_in_directory(&self, directory: &str) -> Vec<String> {
        self.sessions
            .iter()
            .filter(|entry| entry.channel.is_some() && entry.directory == directory)
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Directories with at least one connected viewer.
    pub fn referenced_directories(&self) -> HashSet<String> {
        self.sessions
            .iter()
            .filter(|entry| entry.channel.is_some())
            .map(|entry| entry.directory.clone())
            .collect()
    }

    /// Move every session viewing `from` to `to`. Returns the connected
    /// sessions that moved.
    pub fn relocate(&self, from: &str, to: &str) -> Vec<String> {
        let mut moved = Vec::new();
        for mut entry in self.sessions.iter_mut() {
            if entry.directory == from {
                entry.directory = to.to_string();
                if entry.channel.is_some() {
                    moved.push(entry.key().clone());
                }
            }
        }
        moved
    }

    pub fn connected_count(&self) -> usize {
        self.sessions
            .iter()
            .filter(|entry| entry.channel.is_some())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn registry_with_session(privileged: bool) -> (SessionRegistry, String) {
        let store = Arc::new(CredentialStore::in_memory());
        store.add_or_update_user("u", "pw", privileged).await.unwrap();
        let token = store.create_session("u", false).await.unwrap();
        (SessionRegistry::new(store), token)
    }

    #[tokio::test]
    async fn bind_requires_known_token() {
        let (registry, _) = registry_with_session(false).await;
        let (channel, _rx) = PushChannel::pair(4);
        assert!(matches!(
            registry.bind("bogus", channel),
            Err(ShareError::Unauthorized)
        ));
    }

    #[tokio::test]
    async fn transient_disconnect_keeps_directory() {
        let (registry, token) = registry_with_session(true).await;
        let (channel, _rx) = PushChannel::pair(4);
        assert_eq!(registry.bind(&token, channel).unwrap(), "/");
        assert_eq!(registry.refresh_privilege(&token), Some(true));

        registry.set_directory(&token, "/docs/").unwrap();
        assert_eq!(registry.sessions_in_directory("/docs"), vec![token.clone()]);

        registry
            .unbind(&token, DisconnectReason::Transient)
            .await
            .unwrap();
        assert!(registry.referenced_directories().is_empty());

        let (channel, _rx) = PushChannel::pair(4);
        assert_eq!(registry.bind(&token, channel).unwrap(), "/docs");
    }

    #[tokio::test]
    async fn logout_forgets_and_revokes() {
        let (registry, token) = registry_with_session(false).await;
        let (channel, _rx) = PushChannel::pair(4);
        registry.bind(&token, channel).unwrap();

        registry.unbind(&token, DisconnectReason::Logout).await.unwrap();
        assert!(!registry.contains(&token));

        let (channel, _rx) = PushChannel::pair(4);
        assert!(registry.bind(&token, channel).is_err());
    }

    #[tokio::test]
    async fn stale_channel_release_is_ignored() {
        let (registry, token) = registry_with_session(false).await;
        let (old, _rx1) = PushChannel::pair(4);
        let old_id = old.id();
        registry.bind(&token, old).unwrap();
        let (new, _rx2) = PushChannel::pair(4);
        let new_id = new.id();
        registry.bind(&token, new).unwrap();

        let released = registry
            .release(&token, old_id, DisconnectReason::Transient)
            .await
            .unwrap();
        assert!(!released);
        assert_eq!(registry.channel(&token).map(|c| c.id()), Some(new_id));
    }

    #[tokio::test]
    async fn revoked_login_is_evicted() {
        let (registry, token) = registry_with_session(true).await;
        let (channel, mut rx) = PushChannel::pair(4);
        registry.bind(&token, channel).unwrap();
        assert_eq!(registry.refresh_privilege(&token), Some(true));

        registry.store.remove_user("u").await.unwrap();
        assert_eq!(registry.evict_revoked(), vec![token.clone()]);
        assert!(!registry.contains(&token));
        assert_eq!(registry.refresh_privilege(&token), None);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn set_directory_validates() {
        let (registry, token) = registry_with_session(false).await;
        let (channel, _rx) = PushChannel::pair(4);
        registry.bind(&token, channel).unwrap();

        assert!(matches!(
            registry.set_directory(&token, "docs"),
            Err(ShareError::InvalidPath(_))
        ));
        assert_eq!(registry.directory(&token).as_deref(), Some("/"));
    }
}
