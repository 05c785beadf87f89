use std::{fmt, net::IpAddr, sync::Arc, time::Duration};

use dashmap::DashMap;
use dropshelf_core::SyncHub;
use tokio::time::Instant;

use crate::infra::config::Config;

const LOGIN_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<SyncHub>,
    pub config: Arc<Config>,
    /// Last login attempt per client address.
    pub login_attempts: Arc<DashMap<IpAddr, Instant>>,
}

impl fmt::Debug for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}

impl AppState {
    pub fn new(hub: Arc<SyncHub>, config: Arc<Config>) -> Self {
        Self {
            hub,
            config,
            login_attempts: Arc::new(DashMap::new()),
        }
    }

    /// Record a login attempt from `ip`. Returns `false` when the previous
    /// attempt from the same address was less than a second ago.
    pub fn admit_login(&self, ip: IpAddr) -> bool {
        let now = Instant::now();
        let mut admitted = true;
        self.login_attempts
            .entry(ip)
            .and_modify(|last| {
                if now.duration_since(*last) < LOGIN_INTERVAL {
                    admitted = false;
                } else {
                    *last = now;
                }
            })
            .or_insert(now);
        self.login_attempts
            .retain(|_, last| now.duration_since(*last) < LOGIN_INTERVAL);
        admitted
    }
}
