//! Real-time directory synchronization engine for dropshelf.
//!
//! The entry point is [`SyncHub`], which ties together session tracking,
//! directory watches, throttled push delivery, staged uploads and archive
//! builds around a single shared files root.

pub mod archive;
pub mod error;
pub mod fs_watch;
pub mod hub;
pub mod listing;
pub mod paths;
pub mod protocol;
pub mod push;
pub mod session;
pub mod store;
pub mod upload;

pub use error::{Result, ShareError};
pub use hub::{HubConfig, SyncHub};
pub use protocol::{ClientMessage, ServerMessage};
pub use session::{DisconnectReason, PushChannel};
pub use store::CredentialStore;
