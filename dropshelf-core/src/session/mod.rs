//! Per-connection session state.

pub mod channel;
pub mod registry;

pub use channel::{Delivery, PushChannel};
pub use registry::{DisconnectReason, SessionRegistry};
