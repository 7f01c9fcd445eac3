//! Multi-peer RPC server.
//!
//! Accepts TCP connections, admits each one through the identity handshake and
//! keeps at most one live [`PeerEndpoint`] per token. Once admitted, a
//! connection is fully symmetric: the device calls server methods and the
//! server calls device methods with [`Server::call`].
//!
//! # Lifecycle
//!
//! - the first frame must be a `connect` hello carrying a token, received
//!   within the handshake timeout;
//! - the handshake hook decides; the server always answers with a `connect`
//!   reply and closes the socket after a refusal;
//! - a second admission for a token closes the older connection;
//! - when a connection ends its token is dropped and `Disconnected` fires,
//!   unless a newer connection already took the token over.

use crate::config::ProtocolConfig;
use crate::context::{identity_hook, CallContext, ContextHook};
use crate::events::{EventBus, RpcEvent};
use crate::ids::{uuid_generator, IdGenerator};
use crate::peer::{CloseReason, PeerEndpoint, PeerOptions, Role};
use crate::protocol::{read_frame_limited, write_frame, Envelope, Handshake};
use crate::registry::MethodRegistry;
use crate::{Result, RpcError};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Future returned by a handshake hook: admit or not, or the refusal text.
pub type HandshakeFuture = BoxFuture<'static, std::result::Result<bool, String>>;

/// Decides whether a token may connect.
pub type HandshakeHook = Arc<dyn Fn(String) -> HandshakeFuture + Send + Sync>;

/// Hook admitting every token.
pub fn accept_all() -> HandshakeHook {
    Arc::new(|_token| async { Ok(true) }.boxed())
}

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Address used by [`Server::listen`].
    pub bind_addr: String,
    pub handshake: HandshakeHook,
    pub context_hook: ContextHook,
    /// Default timeout for calls the server makes to devices.
    pub call_timeout: Duration,
    /// How long a new connection may take to send its hello.
    pub handshake_timeout: Duration,
    pub max_connections: usize,
    pub max_message_size: usize,
    pub id_generator: IdGenerator,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            handshake: accept_all(),
            context_hook: identity_hook(),
            call_timeout: ProtocolConfig::CALL_TIMEOUT,
            handshake_timeout: ProtocolConfig::HANDSHAKE_TIMEOUT,
            max_connections: ProtocolConfig::MAX_CONNECTIONS,
            max_message_size: ProtocolConfig::MAX_MESSAGE_SIZE,
            id_generator: uuid_generator(),
        }
    }
}

impl ServerConfig {
    pub fn new(bind_addr: impl Into<String>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            ..Self::default()
        }
    }

    /// Install the handshake hook. `Ok(false)` refuses with the default
    /// message; `Err(e)` refuses with `e`'s text.
    pub fn with_handshake<F, Fut, E>(mut self, hook: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<bool, E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        self.handshake = Arc::new(move |token| {
            let fut = hook(token);
            async move { fut.await.map_err(|e| e.to_string()) }.boxed()
        });
        self
    }

    pub fn with_context_hook(mut self, hook: ContextHook) -> Self {
        self.context_hook = hook;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn with_max_message_size(mut self, max: usize) -> Self {
        self.max_message_size = max;
        self
    }

    pub fn with_id_generator(mut self, generator: IdGenerator) -> Self {
        self.id_generator = generator;
        self
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("bind_addr", &self.bind_addr)
            .field("call_timeout", &self.call_timeout)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("max_connections", &self.max_connections)
            .field("max_message_size", &self.max_message_size)
            .finish_non_exhaustive()
    }
}

/// Snapshot of server load.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    /// Tokens with a live connection, sorted.
    pub connected: Vec<String>,
    /// Server-to-device calls waiting for a reply.
    pub pending_requests: usize,
    /// Device-to-server calls whose handler is still running.
    pub active_dispatches: usize,
}

struct PeerSlot {
    conn_id: u64,
    peer: PeerEndpoint,
}

struct ServerShared {
    config: ServerConfig,
    registry: MethodRegistry,
    events: EventBus,
    peers: Mutex<HashMap<String, PeerSlot>>,
    next_conn_id: AtomicU64,
    active_connections: AtomicUsize,
}

/// One counted connection. The count drops when the slot does, including on
/// unwind.
struct ConnectionSlot {
    shared: Arc<ServerShared>,
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.shared.active_connections.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Resolves once `shutdown` is set. Never resolves without a receiver or
/// after the sender is gone unsignalled.
async fn shutdown_requested(shutdown: &mut Option<watch::Receiver<bool>>) {
    if let Some(rx) = shutdown {
        if rx.wait_for(|stop| *stop).await.is_ok() {
            return;
        }
    }
    std::future::pending::<()>().await
}

/// Cloneable handle to the server state.
#[derive(Clone)]
pub struct Server {
    shared: Arc<ServerShared>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            shared: Arc::new(ServerShared {
                config,
                registry: MethodRegistry::new(),
                events: EventBus::default(),
                peers: Mutex::new(HashMap::new()),
                next_conn_id: AtomicU64::new(1),
                active_connections: AtomicUsize::new(0),
            }),
        }
    }

    /// Bind the configured address and start accepting connections.
    pub async fn listen(&self) -> Result<ServerHandle> {
        let listener = TcpListener::bind(&self.shared.config.bind_addr).await?;
        self.listen_on(listener)
    }

    /// Start accepting connections on an already bound listener.
    pub fn listen_on(&self, listener: TcpListener) -> Result<ServerHandle> {
        let addr = listener.local_addr()?;
        info!("RPC server listening on {}", addr);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (conn_shutdown_tx, conn_shutdown_rx) = watch::channel(false);
        let task_handle = tokio::spawn(self.clone().accept_loop(
            listener,
            shutdown_rx,
            conn_shutdown_rx,
        ));

        Ok(ServerHandle {
            server: self.clone(),
            addr,
            shutdown_tx: Some(shutdown_tx),
            conn_shutdown_tx,
            task_handle: Some(task_handle),
        })
    }

    /// Count a new connection unless the server is at capacity.
    fn try_reserve(&self) -> Option<ConnectionSlot> {
        let max = self.shared.config.max_connections;
        self.shared
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                (current < max).then_some(current + 1)
            })
            .ok()
            .map(|_| ConnectionSlot {
                shared: self.shared.clone(),
            })
    }

    async fn accept_loop(
        self,
        listener: TcpListener,
        mut shutdown_rx: oneshot::Receiver<()>,
        conn_shutdown_rx: watch::Receiver<bool>,
    ) {
        let max = self.shared.config.max_connections;
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("RPC server shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            let Some(slot) = self.try_reserve() else {
                                warn!(
                                    "Rejecting connection from {}: at max capacity ({})",
                                    peer_addr, max
                                );
                                continue;
                            };
                            if let Err(e) = stream.set_nodelay(true) {
                                debug!("Failed to set TCP_NODELAY for {}: {}", peer_addr, e);
                            }

                            debug!("Connection from {}", peer_addr);
                            let server = self.clone();
                            let conn_shutdown = Some(conn_shutdown_rx.clone());
                            tokio::spawn(async move {
                                server.serve(stream, slot, conn_shutdown).await;
                                debug!("Connection from {} finished", peer_addr);
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
            }
        }
    }

    /// Run one connection to completion: handshake, then traffic until close.
    ///
    /// For streams accepted outside a listener, such as in-memory pipes. The
    /// connection counts against `max_connections` and is dropped unserved
    /// when the server is full. It ends with [`Server::close_all`] or
    /// [`Server::disconnect`], not with a [`ServerHandle`].
    pub async fn serve_connection<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        match self.try_reserve() {
            Some(slot) => self.serve(stream, slot, None).await,
            None => warn!(
                "Rejecting connection: at max capacity ({})",
                self.shared.config.max_connections
            ),
        }
    }

    async fn serve<S>(
        &self,
        mut stream: S,
        _slot: ConnectionSlot,
        mut shutdown: Option<watch::Receiver<bool>>,
    ) where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let admitted = tokio::select! {
            token = self.admit(&mut stream) => token,
            _ = shutdown_requested(&mut shutdown) => None,
        };
        match admitted {
            Some(token) => self.run_peer(stream, token, &mut shutdown).await,
            None => {
                let _ = stream.shutdown().await;
            }
        }
    }

    /// Read the hello, consult the hook and answer. Returns the admitted token.
    async fn admit<S>(&self, stream: &mut S) -> Option<String>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let config = &self.shared.config;
        let first = tokio::time::timeout(
            config.handshake_timeout,
            read_frame_limited(stream, config.max_message_size),
        )
        .await;

        let frame = match first {
            Ok(Ok(Some(frame))) => frame,
            Ok(Ok(None)) => {
                debug!("Connection closed before handshake");
                return None;
            }
            Ok(Err(e)) => {
                self.protocol_error(None, e);
                return None;
            }
            Err(_) => {
                self.protocol_error(None, RpcError::Timeout(config.handshake_timeout));
                return None;
            }
        };

        let (id, token) = match Envelope::decode(&frame) {
            Envelope::Connect {
                id,
                handshake: Handshake::Hello { token: Some(token) },
            } => (id, token),
            other => {
                let reason = "expected connect handshake with a token";
                self.protocol_error(None, RpcError::invalid(reason));
                let id = other.id().unwrap_or_default().to_string();
                self.reply(stream, id, false, Some(reason.to_string())).await;
                return None;
            }
        };

        let (accepted, message) = match (config.handshake)(token.clone()).await {
            Ok(true) => (true, None),
            Ok(false) => (false, Some(ProtocolConfig::DEFAULT_REJECT_MESSAGE.to_string())),
            Err(e) => (false, Some(e)),
        };

        if !self.reply(stream, id, accepted, message.clone()).await {
            return None;
        }
        if accepted {
            Some(token)
        } else {
            info!(
                "Rejected handshake for {}: {}",
                token,
                message.unwrap_or_default()
            );
            None
        }
    }

    async fn reply<S>(&self, stream: &mut S, id: String, accepted: bool, message: Option<String>) -> bool
    where
        S: AsyncWrite + Unpin,
    {
        let sent = match Envelope::connect_reply(id, accepted, message).encode() {
            Ok(bytes) => write_frame(stream, &bytes).await,
            Err(e) => Err(e),
        };
        if let Err(e) = &sent {
            debug!("Failed to send handshake reply: {}", e);
        }
        sent.is_ok()
    }

    async fn run_peer<S>(
        &self,
        stream: S,
        token: String,
        shutdown: &mut Option<watch::Receiver<bool>>,
    ) where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let shared = &self.shared;
        let config = &shared.config;
        let conn_id = shared.next_conn_id.fetch_add(1, Ordering::Relaxed);

        let peer = PeerEndpoint::spawn(
            stream,
            Role::Server {
                token: token.clone(),
            },
            PeerOptions {
                registry: shared.registry.clone(),
                events: shared.events.clone(),
                context_hook: config.context_hook.clone(),
                id_generator: config.id_generator.clone(),
                call_timeout: config.call_timeout,
                max_message_size: config.max_message_size,
            },
        );

        let stale = shared.peers.lock().insert(
            token.clone(),
            PeerSlot {
                conn_id,
                peer: peer.clone(),
            },
        );
        if let Some(stale) = stale {
            info!("Replacing existing connection for {}", token);
            stale.peer.close();
        }

        info!("Peer {} connected", token);
        shared.events.emit(RpcEvent::Connected {
            token: token.clone(),
        });

        let reason = tokio::select! {
            reason = peer.closed() => reason,
            _ = shutdown_requested(shutdown) => {
                peer.close();
                CloseReason::Local
            }
        };

        let removed = {
            let mut peers = shared.peers.lock();
            match peers.get(&token) {
                Some(slot) if slot.conn_id == conn_id => peers.remove(&token).is_some(),
                _ => false,
            }
        };

        if removed {
            info!("Peer {} disconnected ({})", token, reason);
            shared.events.emit(RpcEvent::Disconnected { token });
        } else {
            debug!("Superseded connection for {} closed ({})", token, reason);
        }
    }

    fn protocol_error(&self, token: Option<String>, error: RpcError) {
        warn!("Handshake protocol error: {}", error);
        self.shared
            .events
            .emit(RpcEvent::ProtocolError { token, error });
    }

    /// Register a method devices may call.
    pub fn register<F, Fut, R, E>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(CallContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, E>> + Send + 'static,
        R: serde::Serialize + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        self.shared.registry.register(name, handler);
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.shared.registry.unregister(name)
    }

    pub fn registry(&self) -> &MethodRegistry {
        &self.shared.registry
    }

    fn peer(&self, token: &str) -> Result<PeerEndpoint> {
        self.shared
            .peers
            .lock()
            .get(token)
            .map(|slot| slot.peer.clone())
            .ok_or_else(|| RpcError::not_connected(format!("no connection for {}", token)))
    }

    /// Call `method` on the device connected as `token`.
    pub async fn call(&self, token: &str, method: &str, params: Value) -> Result<Value> {
        self.peer(token)?.call(method, params).await
    }

    pub async fn call_with_timeout(
        &self,
        token: &str,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value> {
        self.peer(token)?
            .call_with_timeout(method, params, timeout)
            .await
    }

    pub fn is_connected(&self, token: &str) -> bool {
        self.shared.peers.lock().contains_key(token)
    }

    pub fn connected_tokens(&self) -> Vec<String> {
        let mut tokens: Vec<String> = self.shared.peers.lock().keys().cloned().collect();
        tokens.sort_unstable();
        tokens
    }

    pub fn stats(&self) -> ServerStats {
        let peers = self.shared.peers.lock();
        let mut stats = ServerStats {
            connected: peers.keys().cloned().collect(),
            ..ServerStats::default()
        };
        for slot in peers.values() {
            let peer_stats = slot.peer.stats();
            stats.pending_requests += peer_stats.pending_requests;
            stats.active_dispatches += peer_stats.active_dispatches;
        }
        stats.connected.sort_unstable();
        stats
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RpcEvent> {
        self.shared.events.subscribe()
    }

    /// Close the connection for `token`. Returns whether one existed.
    pub fn disconnect(&self, token: &str) -> bool {
        match self.peer(token) {
            Ok(peer) => {
                peer.close();
                true
            }
            Err(_) => false,
        }
    }

    /// Close every admitted connection. Listeners are stopped through their
    /// [`ServerHandle`]; the server itself stays usable.
    pub fn close_all(&self) {
        let peers: Vec<PeerEndpoint> = self
            .shared
            .peers
            .lock()
            .values()
            .map(|slot| slot.peer.clone())
            .collect();
        for peer in peers {
            peer.close();
        }
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.shared.config)
            .field("connected", &self.connected_tokens())
            .finish()
    }
}

/// Handle to one listener. Dropping it stops the listener and closes the
/// connections it accepted.
pub struct ServerHandle {
    server: Server,
    addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    conn_shutdown_tx: watch::Sender<bool>,
    task_handle: Option<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn server(&self) -> &Server {
        &self.server
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting and close the connections this listener accepted,
    /// including ones still in the handshake.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.conn_shutdown_tx.send_replace(true);
    }

    /// Shut down and wait until the listener is released.
    pub async fn stop(mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

impl fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerHandle")
            .field("addr", &self.addr)
            .finish()
    }
}
