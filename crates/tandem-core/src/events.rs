//! Event notifications.
//!
//! Events go out over a `tokio::sync::broadcast` channel owned by the long-lived
//! server or client object. Short-lived connections publish into a clone of
//! the sender, so a subscriber keeps receiving events across reconnects
//! without re-subscribing.

use crate::config::ProtocolConfig;
use crate::RpcError;
use tokio::sync::broadcast;
use tracing::trace;

/// Something that happened on a server or client.
#[derive(Debug, Clone)]
pub enum RpcEvent {
    /// Handshake accepted. On the server `token` is the new peer; on a client it
    /// is the client's own token.
    Connected { token: String },
    /// Handshake refused, or the connection failed before a handshake reply.
    ConnectError { reason: String },
    /// A connection went away. On the server this is the peer-disconnected
    /// notification for `token`.
    Disconnected { token: String },
    /// Recoverable protocol fault: malformed input, unknown reply id, bad
    /// handshake. The connection stays open unless noted otherwise.
    ProtocolError {
        token: Option<String>,
        error: RpcError,
    },
}

/// Cloneable handle for publishing and subscribing to [`RpcEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RpcEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(ProtocolConfig::EVENT_CHANNEL_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn emit(&self, event: RpcEvent) {
        if self.tx.send(event).is_err() {
            trace!("Event dropped: no subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RpcEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
