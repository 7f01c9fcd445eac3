//! Single-connection RPC client.
//!
//! [`Client::connect`] opens one transport, performs the identity handshake
//! and hands back a client bound to that connection. When the connection
//! drops the client stays dead; use [`crate::ReconnectingClient`] for a
//! session that survives restarts of the server.

use crate::backoff::ReconnectPolicy;
use crate::config::ProtocolConfig;
use crate::context::{identity_hook, CallContext, ContextHook};
use crate::events::{EventBus, RpcEvent};
use crate::ids::{uuid_generator, IdGenerator};
use crate::peer::{CloseReason, HandshakeOutcome, PeerEndpoint, PeerOptions, PeerStats, Role};
use crate::registry::MethodRegistry;
use crate::{Result, RpcError};
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Byte stream a connector produces.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxedTransport = Box<dyn Transport>;

/// Opens a fresh transport to the server.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> Result<BoxedTransport>;

    /// Human-readable target for logs.
    fn describe(&self) -> String;
}

/// Plain TCP connector.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> Result<BoxedTransport> {
        let stream = TcpStream::connect(&self.addr).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }

    fn describe(&self) -> String {
        self.addr.clone()
    }
}

/// Client configuration.
#[derive(Clone)]
pub struct ClientConfig {
    /// Identity presented in the handshake.
    pub token: String,
    pub connector: Arc<dyn Connector>,
    pub context_hook: ContextHook,
    pub call_timeout: Duration,
    /// Bound on opening the transport.
    pub connect_timeout: Duration,
    /// Bound on waiting for the server's handshake reply.
    pub handshake_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    pub id_generator: IdGenerator,
    /// Advertised subprotocols. Logged only; the framed transport does not
    /// negotiate them.
    pub protocols: Vec<String>,
    pub max_message_size: usize,
}

impl ClientConfig {
    /// Connect over TCP to `addr` as `token`.
    pub fn new(token: impl Into<String>, addr: impl Into<String>) -> Self {
        Self::with_connector(token, Arc::new(TcpConnector::new(addr)))
    }

    /// Connect as `token` through a custom transport.
    pub fn with_connector(token: impl Into<String>, connector: Arc<dyn Connector>) -> Self {
        Self {
            token: token.into(),
            connector,
            context_hook: identity_hook(),
            call_timeout: ProtocolConfig::CALL_TIMEOUT,
            connect_timeout: ProtocolConfig::CONNECT_TIMEOUT,
            handshake_timeout: ProtocolConfig::HANDSHAKE_TIMEOUT,
            reconnect: ReconnectPolicy::default(),
            id_generator: uuid_generator(),
            protocols: Vec::new(),
            max_message_size: ProtocolConfig::MAX_MESSAGE_SIZE,
        }
    }

    pub fn with_context_hook(mut self, hook: ContextHook) -> Self {
        self.context_hook = hook;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    pub fn with_id_generator(mut self, generator: IdGenerator) -> Self {
        self.id_generator = generator;
        self
    }

    pub fn with_protocols<I, S>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.protocols = protocols.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_max_message_size(mut self, max: usize) -> Self {
        self.max_message_size = max;
        self
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("token", &self.token)
            .field("target", &self.connector.describe())
            .field("call_timeout", &self.call_timeout)
            .field("connect_timeout", &self.connect_timeout)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("reconnect", &self.reconnect)
            .field("protocols", &self.protocols)
            .finish_non_exhaustive()
    }
}

/// Result of one connection attempt.
pub(crate) enum Attempt {
    Accepted(PeerEndpoint),
    /// The server answered the handshake with a refusal.
    Rejected(String),
    /// No handshake reply: connect failure, timeout or early close.
    Failed(RpcError),
}

/// Open a transport and run the handshake. The returned endpoint publishes
/// into `events` and dispatches from `registry`.
pub(crate) async fn attempt(
    config: &ClientConfig,
    registry: &MethodRegistry,
    events: &EventBus,
) -> Attempt {
    let target = config.connector.describe();
    if config.protocols.is_empty() {
        debug!("Connecting to {} as {}", target, config.token);
    } else {
        debug!(
            "Connecting to {} as {} (protocols: {})",
            target,
            config.token,
            config.protocols.join(", ")
        );
    }

    let stream =
        match tokio::time::timeout(config.connect_timeout, config.connector.connect()).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Attempt::Failed(e),
            Err(_) => return Attempt::Failed(RpcError::Timeout(config.connect_timeout)),
        };

    let peer = PeerEndpoint::spawn(
        stream,
        Role::Client {
            token: config.token.clone(),
        },
        PeerOptions {
            registry: registry.clone(),
            events: events.clone(),
            context_hook: config.context_hook.clone(),
            id_generator: config.id_generator.clone(),
            call_timeout: config.call_timeout,
            max_message_size: config.max_message_size,
        },
    );

    match peer.handshake(config.handshake_timeout).await {
        Ok(HandshakeOutcome { accepted: true, .. }) => {
            info!("Connected to {} as {}", target, config.token);
            Attempt::Accepted(peer)
        }
        Ok(HandshakeOutcome {
            accepted: false,
            message,
        }) => {
            peer.close();
            let reason =
                message.unwrap_or_else(|| ProtocolConfig::DEFAULT_REJECT_MESSAGE.to_string());
            warn!("Handshake with {} rejected: {}", target, reason);
            Attempt::Rejected(reason)
        }
        Err(e) => {
            peer.close();
            Attempt::Failed(e)
        }
    }
}

/// Client bound to one connection.
#[derive(Clone)]
pub struct Client {
    peer: PeerEndpoint,
    registry: MethodRegistry,
    events: EventBus,
}

impl Client {
    /// Connect with a fresh registry and event bus.
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        Self::connect_with(config, MethodRegistry::new(), EventBus::default()).await
    }

    /// Connect using a pre-populated registry and an event bus the caller may
    /// already be subscribed to.
    pub async fn connect_with(
        config: ClientConfig,
        registry: MethodRegistry,
        events: EventBus,
    ) -> Result<Self> {
        let peer = match attempt(&config, &registry, &events).await {
            Attempt::Accepted(peer) => peer,
            Attempt::Rejected(reason) => {
                events.emit(RpcEvent::ConnectError {
                    reason: reason.clone(),
                });
                return Err(RpcError::not_connected(reason));
            }
            Attempt::Failed(e) => {
                let reason = e.into_reason();
                events.emit(RpcEvent::ConnectError {
                    reason: reason.clone(),
                });
                return Err(RpcError::not_connected(reason));
            }
        };

        events.emit(RpcEvent::Connected {
            token: config.token.clone(),
        });

        let watcher = peer.clone();
        let bus = events.clone();
        tokio::spawn(async move {
            let reason = watcher.closed().await;
            debug!("Client {} disconnected: {}", watcher.token(), reason);
            bus.emit(RpcEvent::Disconnected {
                token: watcher.token().to_string(),
            });
        });

        Ok(Self {
            peer,
            registry,
            events,
        })
    }

    pub fn token(&self) -> &str {
        self.peer.token()
    }

    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        self.peer.call(method, params).await
    }

    pub async fn call_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value> {
        self.peer.call_with_timeout(method, params, timeout).await
    }

    /// Register a method the server may call.
    pub fn register<F, Fut, R, E>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(CallContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, E>> + Send + 'static,
        R: serde::Serialize + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        self.registry.register(name, handler);
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.registry.unregister(name)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RpcEvent> {
        self.events.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.peer.is_open()
    }

    pub fn stats(&self) -> PeerStats {
        self.peer.stats()
    }

    pub fn close(&self) {
        self.peer.close();
    }

    pub async fn closed(&self) -> CloseReason {
        self.peer.closed().await
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("peer", &self.peer)
            .field("registry", &self.registry)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{read_frame, write_frame, Envelope, Handshake};
    use parking_lot::Mutex;
    use serde_json::json;
    use tokio::io::DuplexStream;

    /// Connector handing out pre-made in-memory streams.
    struct DuplexConnector {
        streams: Mutex<Vec<DuplexStream>>,
    }

    impl DuplexConnector {
        fn new(streams: Vec<DuplexStream>) -> Arc<Self> {
            Arc::new(Self {
                streams: Mutex::new(streams),
            })
        }
    }

    #[async_trait]
    impl Connector for DuplexConnector {
        async fn connect(&self) -> Result<BoxedTransport> {
            let next = self.streams.lock().pop();
            match next {
                Some(stream) => Ok(Box::new(stream)),
                None => Err(RpcError::Transport {
                    message: "connection refused".into(),
                    source: None,
                }),
            }
        }

        fn describe(&self) -> String {
            "duplex".into()
        }
    }

    /// Answer the hello on `server` with `accepted`.
    async fn answer_hello(server: &mut DuplexStream, accepted: bool, message: Option<&str>) {
        let frame = read_frame(server).await.unwrap().unwrap();
        let id = match Envelope::decode(&frame) {
            Envelope::Connect {
                id,
                handshake: Handshake::Hello { token },
            } => {
                assert_eq!(token.as_deref(), Some("dev-1"));
                id
            }
            other => panic!("Expected hello, got: {:?}", other),
        };
        let reply = Envelope::connect_reply(id, accepted, message.map(String::from));
        write_frame(server, &reply.encode().unwrap()).await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_and_call() {
        let (client_side, mut server_side) = tokio::io::duplex(4096);
        let config = ClientConfig::with_connector("dev-1", DuplexConnector::new(vec![client_side]));

        let server = tokio::spawn(async move {
            answer_hello(&mut server_side, true, None).await;
            let frame = read_frame(&mut server_side).await.unwrap().unwrap();
            let id = Envelope::decode(&frame).id().unwrap().to_string();
            let reply = Envelope::response(id, json!({"ok": true}));
            write_frame(&mut server_side, &reply.encode().unwrap())
                .await
                .unwrap();
            server_side
        });

        let client = Client::connect(config).await.unwrap();
        assert!(client.is_connected());
        let result = client.call("status", Value::Null).await.unwrap();
        assert_eq!(result, json!({"ok": true}));

        drop(server.await.unwrap());
        assert_eq!(client.closed().await, CloseReason::Remote);
    }

    #[tokio::test]
    async fn test_rejection_reports_reason() {
        let (client_side, mut server_side) = tokio::io::duplex(4096);
        let config = ClientConfig::with_connector("dev-1", DuplexConnector::new(vec![client_side]));
        let events = EventBus::default();
        let mut rx = events.subscribe();

        tokio::spawn(async move {
            answer_hello(&mut server_side, false, Some("unknown device")).await;
            server_side
        });

        match Client::connect_with(config, MethodRegistry::new(), events).await {
            Err(RpcError::NotConnected { reason }) => assert_eq!(reason, "unknown device"),
            other => panic!("Expected NotConnected, got: {:?}", other.map(|_| ())),
        }
        match rx.recv().await.unwrap() {
            RpcEvent::ConnectError { reason } => assert_eq!(reason, "unknown device"),
            other => panic!("Expected ConnectError, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_connect_failure_is_not_connected() {
        let config = ClientConfig::with_connector("dev-1", DuplexConnector::new(Vec::new()));
        match Client::connect(config).await {
            Err(RpcError::NotConnected { reason }) => {
                assert!(reason.contains("connection refused"))
            }
            other => panic!("Expected NotConnected, got: {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_config_builder() {
        let config = ClientConfig::new("dev-1", "127.0.0.1:9000")
            .with_call_timeout(Duration::from_secs(3))
            .with_protocols(["tandem.v1"])
            .with_reconnect_policy(ReconnectPolicy::fixed(Duration::from_millis(100)));

        assert_eq!(config.token, "dev-1");
        assert_eq!(config.connector.describe(), "127.0.0.1:9000");
        assert_eq!(config.call_timeout, Duration::from_secs(3));
        assert_eq!(config.protocols, vec!["tandem.v1".to_string()]);
        assert_eq!(
            config.reconnect.delay_for(3),
            Duration::from_millis(100)
        );
    }
}
