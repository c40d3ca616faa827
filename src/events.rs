//! Observability hook: every factory broadcasts call outcomes to subscribers.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::{error::NetworkErrorCode, Method};

/// Events buffered per subscriber before the slowest one starts lagging.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// An event emitted by the clients of a factory.
///
/// Discriminated on the `type` field when serialized to JSON.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    /// A response was received, whatever its status.
    RequestCompleted {
        method: Method,
        url: String,
        status: u16,
        attempts: u32,
        duration_ms: u64,
    },
    /// An attempt failed without a response.
    NetworkError {
        method: Method,
        url: String,
        code: NetworkErrorCode,
        attempt: u32,
        will_retry: bool,
    },
}

#[derive(Debug)]
pub(crate) struct EventBus {
    sender: broadcast::Sender<ClientEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }
}

impl EventBus {
    /// Emitting without subscribers is fine.
    pub(crate) fn emit(&self, event: ClientEvent) {
        let _ = self.sender.send(event);
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.sender.subscribe()
    }
}
