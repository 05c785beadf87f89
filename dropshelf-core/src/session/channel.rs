use std::time::Duration;

use tokio::sync::mpsc::{self, error::SendTimeoutError};
use uuid::Uuid;

use crate::protocol::ServerMessage;

/// Outbound half of one live connection.
#[derive(Debug, Clone)]
pub struct PushChannel {
    id: Uuid,
    sender: mpsc::Sender<ServerMessage>,
}

/// Outcome of a bounded delivery attempt.
#[derive(Debug)]
pub enum Delivery {
    Delivered,
    TimedOut,
    /// Receiver is gone; the message is handed back.
    Closed(ServerMessage),
}

impl PushChannel {
    pub fn new(sender: mpsc::Sender<ServerMessage>) -> Self {
        Self {
            id: Uuid::now_v7(),
            sender,
        }
    }

    /// Create a channel pair with the given buffer.
    pub fn pair(capacity: usize) -> (Self, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub async fn deliver(&self, message: ServerMessage, wait: Duration) -> Delivery {
        match self.sender.send_timeout(message, wait).await {
            Ok(()) => Delivery::Delivered,
            Err(SendTimeoutError::Timeout(_)) => Delivery::TimedOut,
            Err(SendTimeoutError::Closed(message)) => Delivery::Closed(message),
        }
    }
}
