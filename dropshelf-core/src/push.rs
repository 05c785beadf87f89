//! Outbound message delivery.
//!
//! Directory snapshots are throttled per session on the trailing edge: the
//! first update in a quiet period arms a timer, later ones overwrite the
//! pending payload, and only the latest is sent when the timer fires, unless
//! the session has since moved to another folder. Every other message goes out immediately. Messages for a session with no live
//! channel wait briefly in an outbox that is flushed on the next bind.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::{Instant, sleep};
use tracing::{debug, trace};

use crate::protocol::ServerMessage;
use crate::session::{Delivery, SessionRegistry};

/// Upper bound on queued messages per disconnected session.
const OUTBOX_CAPACITY: usize = 64;

#[derive(Clone, Debug)]
pub struct PushConfig {
    /// Trailing-edge throttle window for directory snapshots.
    pub throttle_window: Duration,
    /// How long a send may wait on a full channel, and how long an
    /// undelivered message lives in the outbox.
    pub delivery_timeout: Duration,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            throttle_window: Duration::from_millis(250),
            delivery_timeout: Duration::from_millis(1000),
        }
    }
}

#[derive(Debug, Default)]
struct ThrottleSlot {
    pending: Option<ServerMessage>,
    armed: bool,
}

#[derive(Debug)]
struct Queued {
    message: ServerMessage,
    expires_at: Instant,
}

pub struct PushDispatcher {
    config: PushConfig,
    registry: Arc<SessionRegistry>,
    slots: DashMap<String, ThrottleSlot>,
    outbox: DashMap<String, VecDeque<Queued>>,
    purge_armed: AtomicBool,
}

impl fmt::Debug for PushDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PushDispatcher")
            .field("config", &self.config)
            .field("throttled_sessions", &self.slots.len())
            .field("outboxes", &self.outbox.len())
            .finish()
    }
}

impl PushDispatcher {
    pub fn new(config: PushConfig, registry: Arc<SessionRegistry>) -> Self {
        Self {
            config,
            registry,
            slots: DashMap::new(),
            outbox: DashMap::new(),
            purge_armed: AtomicBool::new(false),
        }
    }

    /// Send `message` to the session behind `token`. Directory updates are
    /// throttled unless `force` is set, in which case they go out now and
    /// any older throttled payload is discarded.
    pub async fn notify(self: &Arc<Self>, token: &str, message: ServerMessage, force: bool) {
        if !message.is_directory_update() {
            self.deliver(token, message).await;
            return;
        }

        if force {
            if let Some(mut slot) = self.slots.get_mut(token) {
                slot.pending = None;
            }
            self.deliver(token, message).await;
            return;
        }

        let arm = {
            let mut slot = self.slots.entry(token.to_string()).or_default();
            slot.pending = Some(message);
            !std::mem::replace(&mut slot.armed, true)
        };
        if arm {
            self.spawn_throttle_timer(token.to_string());
        }
    }

    /// Deliver whatever is still queued for `token`. Called right after a
    /// channel is bound.
    pub async fn flush_outbox(self: &Arc<Self>, token: &str) {
        let Some((_, queue)) = self.outbox.remove(token) else {
            return;
        };
        let now = Instant::now();
        for queued in queue {
            if queued.expires_at > now {
                self.deliver(token, queued.message).await;
            }
        }
    }

    /// Drop throttle and outbox state for a session that logged out.
    pub fn forget(&self, token: &str) {
        self.slots.remove(token);
        self.outbox.remove(token);
    }

    pub fn queued_len(&self, token: &str) -> usize {
        self.outbox.get(token).map_or(0, |queue| queue.len())
    }

    fn spawn_throttle_timer(self: &Arc<Self>, token: String) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            sleep(this.config.throttle_window).await;
            let pending = this.slots.get_mut(&token).and_then(|mut slot| {
                slot.armed = false;
                slot.pending.take()
            });
            let Some(message) = pending else {
                return;
            };
            let current = this.registry.directory(&token);
            if message.folder() == current.as_deref() {
                this.deliver(&token, message).await;
            } else {
                trace!(folder = ?message.folder(), "dropping update for a folder the session left");
            }
        });
    }

    async fn deliver(self: &Arc<Self>, token: &str, message: ServerMessage) {
        let Some(channel) = self.registry.channel(token) else {
            if self.registry.contains(token) {
                self.enqueue(token, message);
            } else {
                trace!("dropping message for unknown session");
            }
            return;
        };

        match channel
            .deliver(message, self.config.delivery_timeout)
            .await
        {
            Delivery::Delivered => {}
            Delivery::TimedOut => {
                debug!("client channel saturated; message dropped");
            }
            Delivery::Closed(message) => self.enqueue(token, message),
        }
    }

    fn enqueue(self: &Arc<Self>, token: &str, message: ServerMessage) {
        {
            let mut queue = self.outbox.entry(token.to_string()).or_default();
            if queue.len() >= OUTBOX_CAPACITY {
                queue.pop_front();
            }
            queue.push_back(Queued {
                message,
                expires_at: Instant::now() + self.config.delivery_timeout,
            });
        }
        self.arm_purge();
    }

    fn arm_purge(self: &Arc<Self>) {
        if self.purge_armed.swap(true, Ordering::AcqRel) {
            return;
        }
        let weak = Arc::downgrade(self);
        let period = self.config.delivery_timeout;
        tokio::spawn(async move {
            loop {
                sleep(period).await;
                let Some(this) = weak.upgrade() else {
                    break;
                };
                this.purge_expired();
                if this.outbox.is_empty() {
                    this.purge_armed.store(false, Ordering::Release);
                    // Re-check: an enqueue may have raced the store above.
                    if this.outbox.is_empty() || this.purge_armed.swap(true, Ordering::AcqRel) {
                        break;
                    }
                }
            }
        });
    }

    fn purge_expired(&self) {
        let now = Instant::now();
        self.outbox.retain(|_, queue| {
            queue.retain(|queued| queued.expires_at > now);
            !queue.is_empty()
        });
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use tokio::sync::mpsc;

    use super::*;
    use crate::session::{DisconnectReason, PushChannel};
    use crate::store::CredentialStore;

    struct Fixture {
        dispatcher: Arc<PushDispatcher>,
        registry: Arc<SessionRegistry>,
        token: String,
        rx: mpsc::Receiver<ServerMessage>,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(CredentialStore::in_memory());
        store.add_or_update_user("u", "pw", false).await.unwrap();
        let token = store.create_session("u", false).await.unwrap();
        let registry = Arc::new(SessionRegistry::new(store));
        let (channel, rx) = PushChannel::pair(16);
        registry.bind(&token, channel).unwrap();
        let dispatcher = Arc::new(PushDispatcher::new(
            PushConfig::default(),
            Arc::clone(&registry),
        ));
        Fixture {
            dispatcher,
            registry,
            token,
            rx,
        }
    }

    fn update(marker: &str) -> ServerMessage {
        ServerMessage::UpdateFiles {
            folder: format!("/{marker}"),
            data: BTreeMap::new(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn burst_collapses_to_latest() {
        let mut fx = fixture().await;
        fx.registry.set_directory(&fx.token, "/c").unwrap();
        for marker in ["a", "b", "c"] {
            fx.dispatcher.notify(&fx.token, update(marker), false).await;
        }
        assert!(fx.rx.try_recv().is_err());

        sleep(Duration::from_millis(300)).await;
        assert_eq!(fx.rx.try_recv().unwrap(), update("c"));
        assert!(fx.rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn force_supersedes_pending() {
        let mut fx = fixture().await;
        fx.dispatcher.notify(&fx.token, update("old"), false).await;
        fx.dispatcher.notify(&fx.token, update("new"), true).await;
        assert_eq!(fx.rx.try_recv().unwrap(), update("new"));

        sleep(Duration::from_millis(300)).await;
        assert!(fx.rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn pending_update_for_left_folder_is_dropped() {
        let mut fx = fixture().await;
        fx.registry.set_directory(&fx.token, "/old").unwrap();
        fx.dispatcher.notify(&fx.token, update("old"), false).await;

        fx.registry.set_directory(&fx.token, "/new").unwrap();
        sleep(Duration::from_millis(300)).await;
        assert!(fx.rx.try_recv().is_err());

        fx.dispatcher.notify(&fx.token, update("new"), false).await;
        sleep(Duration::from_millis(300)).await;
        assert_eq!(fx.rx.try_recv().unwrap(), update("new"));
    }

    #[tokio::test(start_paused = true)]
    async fn one_off_messages_are_immediate() {
        let mut fx = fixture().await;
        fx.dispatcher
            .notify(&fx.token, ServerMessage::UploadDone, false)
            .await;
        assert_eq!(fx.rx.try_recv().unwrap(), ServerMessage::UploadDone);
    }

    #[tokio::test(start_paused = true)]
    async fn outbox_flushes_on_rebind() {
        let fx = fixture().await;
        fx.registry
            .unbind(&fx.token, DisconnectReason::Transient)
            .await
            .unwrap();

        fx.dispatcher
            .notify(&fx.token, ServerMessage::UploadDone, false)
            .await;
        assert_eq!(fx.dispatcher.queued_len(&fx.token), 1);

        let (channel, mut rx) = PushChannel::pair(4);
        fx.registry.bind(&fx.token, channel).unwrap();
        fx.dispatcher.flush_outbox(&fx.token).await;
        assert_eq!(rx.try_recv().unwrap(), ServerMessage::UploadDone);
    }

    #[tokio::test(start_paused = true)]
    async fn outbox_entries_expire() {
        let fx = fixture().await;
        fx.registry
            .unbind(&fx.token, DisconnectReason::Transient)
            .await
            .unwrap();
        fx.dispatcher
            .notify(&fx.token, ServerMessage::UploadDone, false)
            .await;

        sleep(Duration::from_millis(2500)).await;
        assert_eq!(fx.dispatcher.queued_len(&fx.token), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_session_is_dropped() {
        let fx = fixture().await;
        fx.dispatcher
            .notify("nobody", ServerMessage::UploadDone, false)
            .await;
        assert_eq!(fx.dispatcher.queued_len("nobody"), 0);
    }
}
