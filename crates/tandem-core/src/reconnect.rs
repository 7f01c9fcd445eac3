//! Reconnecting client.
//!
//! A [`ReconnectingClient`] owns a logical session that outlives individual
//! connections. The method registry and event bus belong to the session, so
//! methods registered once stay callable by the server after every reconnect
//! and subscribers keep receiving events without re-subscribing.
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> (drop) -> Disconnected -> Connecting -> ...
//!                     |
//!                     +-- first handshake refused --> Rejected
//! ```
//!
//! Only one supervisor task runs per session. It wakes when the live
//! connection closes and keeps retrying until it succeeds or
//! [`ReconnectingClient::disconnect`] is called. A refusal while reconnecting
//! is reported as `ConnectError` and retried like any other failed attempt.
//! Calls that were in flight when a connection dropped fail with
//! `NotConnected`; they are not replayed.

use crate::client::{attempt, Attempt, ClientConfig};
use crate::context::CallContext;
use crate::events::{EventBus, RpcEvent};
use crate::peer::{PeerEndpoint, PeerStats};
use crate::registry::MethodRegistry;
use crate::{Result, RpcError};
use parking_lot::Mutex;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

/// Connection state of a [`ReconnectingClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// No live connection. Retrying if a session is active.
    Disconnected,
    /// Opening a transport or waiting for the handshake reply.
    Connecting,
    /// Handshake accepted; calls flow in both directions.
    Connected,
    /// The server refused the first handshake. No further attempts are made.
    Rejected,
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientState::Disconnected => write!(f, "DISCONNECTED"),
            ClientState::Connecting => write!(f, "CONNECTING"),
            ClientState::Connected => write!(f, "CONNECTED"),
            ClientState::Rejected => write!(f, "REJECTED"),
        }
    }
}

struct Session {
    id: u64,
    stop: watch::Sender<bool>,
}

struct Inner {
    config: ClientConfig,
    registry: MethodRegistry,
    events: EventBus,
    session: Mutex<Option<Session>>,
    peer: Mutex<Option<PeerEndpoint>>,
    state: watch::Sender<ClientState>,
    next_session: AtomicU64,
}

/// Client that keeps a logical session alive across reconnects.
#[derive(Clone)]
pub struct ReconnectingClient {
    inner: Arc<Inner>,
}

impl ReconnectingClient {
    pub fn new(config: ClientConfig) -> Self {
        let (state, _) = watch::channel(ClientState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                config,
                registry: MethodRegistry::new(),
                events: EventBus::default(),
                session: Mutex::new(None),
                peer: Mutex::new(None),
                state,
                next_session: AtomicU64::new(1),
            }),
        }
    }

    /// Connect and wait for the first handshake.
    ///
    /// Fails with `AlreadyConnected` while a session is active (connected or
    /// retrying). A refusal moves the client to [`ClientState::Rejected`]; a
    /// transport failure leaves it `Disconnected`. Neither starts retrying.
    pub async fn init(&self) -> Result<()> {
        let inner = &self.inner;
        let (session_id, stop) = {
            let mut session = inner.session.lock();
            if session.is_some() {
                return Err(RpcError::AlreadyConnected);
            }
            let id = inner.next_session.fetch_add(1, Ordering::Relaxed);
            let (stop, stop_rx) = watch::channel(false);
            *session = Some(Session { id, stop });
            (id, stop_rx)
        };

        inner.set_state(ClientState::Connecting);
        match attempt(&inner.config, &inner.registry, &inner.events).await {
            Attempt::Accepted(peer) => {
                if !inner.install(session_id, &peer) {
                    peer.close();
                    return Err(RpcError::not_connected("disconnected during init"));
                }
                inner.events.emit(RpcEvent::Connected {
                    token: inner.config.token.clone(),
                });
                inner.set_state(ClientState::Connected);
                tokio::spawn(supervise(self.inner.clone(), session_id, stop, peer));
                Ok(())
            }
            Attempt::Rejected(reason) => {
                inner.end_session(session_id);
                inner.events.emit(RpcEvent::ConnectError {
                    reason: reason.clone(),
                });
                inner.set_state(ClientState::Rejected);
                Err(RpcError::not_connected(reason))
            }
            Attempt::Failed(e) => {
                inner.end_session(session_id);
                let reason = e.into_reason();
                warn!("Initial connection failed: {}", reason);
                inner.events.emit(RpcEvent::ConnectError {
                    reason: reason.clone(),
                });
                inner.set_state(ClientState::Disconnected);
                Err(RpcError::not_connected(reason))
            }
        }
    }

    /// Close the connection and stop reconnecting. `init` may be called again
    /// afterwards.
    pub fn disconnect(&self) {
        let peer = {
            let mut session = self.inner.session.lock();
            if let Some(session) = session.take() {
                session.stop.send_replace(true);
            }
            self.inner.peer.lock().take()
        };
        if let Some(peer) = peer {
            info!("Disconnecting {}", self.inner.config.token);
            peer.close();
        }
        self.inner.set_state(ClientState::Disconnected);
    }

    pub fn state(&self) -> ClientState {
        *self.inner.state.borrow()
    }

    /// Receiver that observes every state transition.
    pub fn watch_state(&self) -> watch::Receiver<ClientState> {
        self.inner.state.subscribe()
    }

    pub fn token(&self) -> &str {
        &self.inner.config.token
    }

    fn live_peer(&self) -> Result<PeerEndpoint> {
        self.inner
            .peer
            .lock()
            .clone()
            .ok_or_else(|| RpcError::not_connected(format!("client is {}", self.state())))
    }

    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        self.live_peer()?.call(method, params).await
    }

    pub async fn call_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value> {
        self.live_peer()?
            .call_with_timeout(method, params, timeout)
            .await
    }

    /// Register a method the server may call. Takes effect on the live
    /// connection immediately and on every later one.
    pub fn register<F, Fut, R, E>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(CallContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, E>> + Send + 'static,
        R: serde::Serialize + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        self.inner.registry.register(name, handler);
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.inner.registry.unregister(name)
    }

    pub fn registry(&self) -> &MethodRegistry {
        &self.inner.registry
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RpcEvent> {
        self.inner.events.subscribe()
    }

    /// Stats of the live connection; zero while disconnected.
    pub fn stats(&self) -> PeerStats {
        self.inner
            .peer
            .lock()
            .as_ref()
            .map(PeerEndpoint::stats)
            .unwrap_or_default()
    }
}

impl fmt::Debug for ReconnectingClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconnectingClient")
            .field("config", &self.inner.config)
            .field("state", &self.state())
            .finish()
    }
}

impl Inner {
    fn set_state(&self, state: ClientState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("Client {}: {} -> {}", self.config.token, previous, state);
        }
    }

    /// Make `peer` the live connection if `session_id` is still current.
    fn install(&self, session_id: u64, peer: &PeerEndpoint) -> bool {
        let session = self.session.lock();
        match session.as_ref() {
            Some(current) if current.id == session_id => {
                *self.peer.lock() = Some(peer.clone());
                true
            }
            _ => false,
        }
    }

    /// Drop the live slot if it still holds `peer`.
    fn clear(&self, peer: &PeerEndpoint) {
        let mut slot = self.peer.lock();
        if slot.as_ref().is_some_and(|live| live.same_connection(peer)) {
            *slot = None;
        }
    }

    fn end_session(&self, session_id: u64) {
        let mut session = self.session.lock();
        if session.as_ref().is_some_and(|s| s.id == session_id) {
            *session = None;
        }
    }
}

fn stopped(stop: &watch::Receiver<bool>) -> bool {
    *stop.borrow() || stop.has_changed().is_err()
}

/// Per-session supervisor: waits for the live connection to close, then
/// reconnects with the configured policy.
async fn supervise(
    inner: Arc<Inner>,
    session_id: u64,
    mut stop: watch::Receiver<bool>,
    mut peer: PeerEndpoint,
) {
    let token = inner.config.token.clone();
    loop {
        let reason = peer.closed().await;
        inner.clear(&peer);
        inner.events.emit(RpcEvent::Disconnected {
            token: token.clone(),
        });

        if stopped(&stop) {
            debug!("Session {} for {} ended", session_id, token);
            return;
        }

        info!("Connection for {} lost ({}), reconnecting", token, reason);
        inner.set_state(ClientState::Disconnected);

        let mut attempt_no: u32 = 0;
        peer = loop {
            let delay = inner.config.reconnect.delay_for(attempt_no);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = stop.wait_for(|stopped| *stopped) => {
                    debug!("Reconnect for {} cancelled", token);
                    return;
                }
            }
            if stopped(&stop) {
                return;
            }

            inner.set_state(ClientState::Connecting);
            match attempt(&inner.config, &inner.registry, &inner.events).await {
                Attempt::Accepted(next) => {
                    if !inner.install(session_id, &next) {
                        next.close();
                        return;
                    }
                    info!("Reconnected {} after {} attempts", token, attempt_no + 1);
                    inner.events.emit(RpcEvent::Connected {
                        token: token.clone(),
                    });
                    inner.set_state(ClientState::Connected);
                    break next;
                }
                Attempt::Rejected(reason) => {
                    // Only the first handshake of a session is final.
                    warn!(
                        "Reconnect attempt {} for {} refused: {}",
                        attempt_no + 1,
                        token,
                        reason
                    );
                    inner.events.emit(RpcEvent::ConnectError { reason });
                }
                Attempt::Failed(e) => {
                    if e.is_retryable() {
                        debug!("Reconnect attempt {} for {} failed: {}", attempt_no + 1, token, e);
                    } else {
                        warn!("Reconnect attempt {} for {} failed: {}", attempt_no + 1, token, e);
                    }
                }
            }
            if stopped(&stop) {
                return;
            }
            inner.set_state(ClientState::Disconnected);
            attempt_no = attempt_no.saturating_add(1);
        };
    }
}
