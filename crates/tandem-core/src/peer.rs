//! Peer endpoint: one side's live view of a single connection.
//!
//! The same type serves the client side of a connection and each accepted
//! connection on the server; only the [`Role`] differs, and it only matters for
//! `connect` envelopes. Everything else is symmetric: either side may call
//! methods on the other over the same socket.
//!
//! # Tasks
//!
//! - one reader task decodes frames in order, settles replies inline and
//!   spawns a task per inbound request so handlers can overlap;
//! - one writer task owns the write half and drains an mpsc queue.
//!
//! When either task sees the transport end, the endpoint closes: every pending
//! call fails with `NotConnected` and [`PeerEndpoint::closed`] resolves.

use crate::config::ProtocolConfig;
use crate::context::{identity_hook, CallContext, ContextHook};
use crate::events::{EventBus, RpcEvent};
use crate::ids::{uuid_generator, IdGenerator};
use crate::pending::{PendingCalls, Settlement};
use crate::protocol::{read_frame_limited, write_frame, Envelope, Handshake};
use crate::registry::{MethodRegistry, HANDLER_PANICKED};
use crate::{Result, RpcError};
use parking_lot::Mutex;
use serde_json::Value;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, warn};

/// Which side of the handshake this endpoint plays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    /// Initiates the handshake with its own token.
    Client { token: String },
    /// Server-side connection for an admitted peer `token`.
    Server { token: String },
}

impl Role {
    /// Token of the logical peer this connection belongs to.
    pub fn token(&self) -> &str {
        match self {
            Role::Client { token } | Role::Server { token } => token,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Role::Client { .. } => "client",
            Role::Server { .. } => "server",
        }
    }
}

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// This side called `close()`.
    Local,
    /// The remote side closed the socket.
    Remote,
    /// Read or write failed.
    Error(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Local => write!(f, "closed locally"),
            CloseReason::Remote => write!(f, "closed by peer"),
            CloseReason::Error(e) => write!(f, "transport error: {}", e),
        }
    }
}

/// Server's answer to a client handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeOutcome {
    pub accepted: bool,
    pub message: Option<String>,
}

/// In-flight work on one endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerStats {
    /// Outbound calls waiting for a reply.
    pub pending_requests: usize,
    /// Inbound requests whose handler has not finished.
    pub active_dispatches: usize,
}

/// Collaborators shared by every endpoint a server or client creates.
#[derive(Clone)]
pub struct PeerOptions {
    pub registry: MethodRegistry,
    pub events: EventBus,
    pub context_hook: ContextHook,
    pub id_generator: IdGenerator,
    pub call_timeout: Duration,
    pub max_message_size: usize,
}

impl Default for PeerOptions {
    fn default() -> Self {
        Self {
            registry: MethodRegistry::new(),
            events: EventBus::default(),
            context_hook: identity_hook(),
            id_generator: uuid_generator(),
            call_timeout: ProtocolConfig::CALL_TIMEOUT,
            max_message_size: ProtocolConfig::MAX_MESSAGE_SIZE,
        }
    }
}

type HandshakeWaiter = (String, oneshot::Sender<HandshakeOutcome>);

struct Shared {
    role: Role,
    options: PeerOptions,
    open: AtomicBool,
    outbound: mpsc::Sender<Vec<u8>>,
    pending: PendingCalls,
    active_dispatches: AtomicUsize,
    handshake: Mutex<Option<HandshakeWaiter>>,
    shutdown: watch::Sender<bool>,
    closed: watch::Sender<Option<CloseReason>>,
}

/// Handle to a live connection. Clones refer to the same connection.
#[derive(Clone)]
pub struct PeerEndpoint {
    shared: Arc<Shared>,
}

impl PeerEndpoint {
    /// Take ownership of `stream` and start the reader and writer tasks.
    pub fn spawn<S>(stream: S, role: Role, options: PeerOptions) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (outbound, outbound_rx) = mpsc::channel(ProtocolConfig::OUTBOUND_QUEUE_SIZE);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (closed, _) = watch::channel(None);

        debug!("Starting {} endpoint for {}", role.name(), role.token());

        let shared = Arc::new(Shared {
            role,
            options,
            open: AtomicBool::new(true),
            outbound,
            pending: PendingCalls::new(),
            active_dispatches: AtomicUsize::new(0),
            handshake: Mutex::new(None),
            shutdown,
            closed,
        });

        tokio::spawn(read_loop(shared.clone(), reader, shutdown_rx.clone()));
        tokio::spawn(write_loop(shared.clone(), writer, outbound_rx, shutdown_rx));

        Self { shared }
    }

    pub fn role(&self) -> &Role {
        &self.shared.role
    }

    pub fn token(&self) -> &str {
        self.shared.role.token()
    }

    pub fn is_open(&self) -> bool {
        self.shared.is_open()
    }

    /// Whether both handles refer to the same underlying connection.
    pub fn same_connection(&self, other: &PeerEndpoint) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    pub fn registry(&self) -> &MethodRegistry {
        &self.shared.options.registry
    }

    pub fn stats(&self) -> PeerStats {
        PeerStats {
            pending_requests: self.shared.pending.len(),
            active_dispatches: self.shared.active_dispatches.load(Ordering::SeqCst),
        }
    }

    /// Call `method` on the remote side with the default timeout.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        self.call_with_timeout(method, params, self.shared.options.call_timeout)
            .await
    }

    /// Call `method` on the remote side, failing with `request timeout` if no
    /// reply arrives within `timeout`.
    pub async fn call_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value> {
        let shared = &self.shared;
        if !shared.is_open() {
            return Err(RpcError::not_connected("connection closed"));
        }

        let id = (shared.options.id_generator)();
        let frame = Envelope::request(id.clone(), method, params).encode()?;
        let rx = shared.pending.register(&id, method, timeout)?;

        // The connection may have closed between the check above and the
        // registration, after the close already drained the table.
        if !shared.is_open() {
            shared.pending.cancel(&id);
            return Err(RpcError::not_connected("connection closed"));
        }

        if let Err(e) = shared.send(frame).await {
            shared.pending.cancel(&id);
            return Err(e);
        }
        debug!("-> {} {} ({})", shared.role.token(), method, id);

        rx.await
            .unwrap_or_else(|_| Err(RpcError::not_connected("connection closed")))
    }

    /// Send the identity handshake and wait for the server's answer.
    ///
    /// Only valid for [`Role::Client`].
    pub async fn handshake(&self, timeout: Duration) -> Result<HandshakeOutcome> {
        let shared = &self.shared;
        let Role::Client { token } = &shared.role else {
            return Err(RpcError::invalid("only clients initiate the handshake"));
        };

        let id = (shared.options.id_generator)();
        let (tx, rx) = oneshot::channel();
        *shared.handshake.lock() = Some((id.clone(), tx));

        shared
            .send_envelope(&Envelope::connect_hello(id, token.clone()))
            .await?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(_)) => Err(RpcError::not_connected(
                "connection closed during handshake",
            )),
            Err(_) => {
                shared.handshake.lock().take();
                Err(RpcError::Timeout(timeout))
            }
        }
    }

    /// Close the connection. Pending calls fail with `NotConnected`.
    pub fn close(&self) {
        self.shared.finish(CloseReason::Local);
    }

    /// Why the connection ended, or `None` while it is open.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.shared.closed.borrow().clone()
    }

    /// Wait until the connection has ended.
    pub async fn closed(&self) -> CloseReason {
        let mut rx = self.shared.closed.subscribe();
        let reason = match rx.wait_for(Option::is_some).await {
            Ok(reason) => (*reason).clone().unwrap_or(CloseReason::Local),
            Err(_) => CloseReason::Local,
        };
        reason
    }
}

impl fmt::Debug for PeerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerEndpoint")
            .field("role", &self.shared.role)
            .field("open", &self.is_open())
            .field("stats", &self.stats())
            .finish()
    }
}

impl Shared {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn send(&self, frame: Vec<u8>) -> Result<()> {
        if !self.is_open() {
            return Err(RpcError::not_connected("connection closed"));
        }
        self.outbound
            .send(frame)
            .await
            .map_err(|_| RpcError::not_connected("connection closed"))
    }

    async fn send_envelope(&self, envelope: &Envelope) -> Result<()> {
        self.send(envelope.encode()?).await
    }

    fn protocol_error(&self, error: RpcError) {
        warn!(
            "Protocol error on {} endpoint {}: {}",
            self.role.name(),
            self.role.token(),
            error
        );
        self.options.events.emit(RpcEvent::ProtocolError {
            token: Some(self.role.token().to_string()),
            error,
        });
    }

    fn handle_frame(self: &Arc<Self>, frame: &[u8]) {
        match Envelope::decode(frame) {
            Envelope::Request { id, method, params } => self.dispatch(id, method, params),
            Envelope::Response { id, result } => {
                if let Err(e) = self.pending.settle(&id, Settlement::Result(result)) {
                    self.protocol_error(e);
                }
            }
            Envelope::Error { id, error } => {
                if let Err(e) = self.pending.settle(&id, Settlement::Error(error)) {
                    self.protocol_error(e);
                }
            }
            Envelope::Malformed { reason, .. } => self.protocol_error(RpcError::invalid(reason)),
            Envelope::Connect { id, handshake } => self.handle_connect(id, handshake),
        }
    }

    fn handle_connect(&self, id: String, handshake: Handshake) {
        match (&self.role, handshake) {
            (Role::Client { .. }, Handshake::Reply { accepted, message }) => {
                let mut waiter = self.handshake.lock();
                match waiter.take() {
                    Some((expected, tx)) if expected == id => {
                        let _ = tx.send(HandshakeOutcome { accepted, message });
                    }
                    Some(other) => {
                        *waiter = Some(other);
                        drop(waiter);
                        self.protocol_error(RpcError::wrong_request_id());
                    }
                    None => {
                        drop(waiter);
                        self.protocol_error(RpcError::invalid("unexpected handshake reply"));
                    }
                }
            }
            _ => self.protocol_error(RpcError::invalid("unexpected connect message")),
        }
    }

    fn dispatch(self: &Arc<Self>, id: String, method: String, params: Value) {
        debug!("<- {} {} ({})", self.role.token(), method, id);

        self.active_dispatches.fetch_add(1, Ordering::SeqCst);
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            let reply = shared.serve_request(id, method, params).await;
            if let Err(e) = shared.send_envelope(&reply).await {
                debug!("Dropping reply {:?}: {}", reply.id(), e);
            }
            shared.active_dispatches.fetch_sub(1, Ordering::SeqCst);
        });
    }

    /// Build the context through the hook and run the handler. A panicking
    /// hook is answered like a panicking handler.
    async fn serve_request(&self, id: String, method: String, params: Value) -> Envelope {
        let token = Some(self.role.token().to_string());
        let hook = &self.options.context_hook;
        let built = panic::catch_unwind(AssertUnwindSafe(|| {
            hook(CallContext::new(&id, &method, token))
        }));
        let mut ctx = match built {
            Ok(ctx) => ctx,
            Err(_) => {
                error!("Context hook panicked for {} ({})", method, id);
                return Envelope::error(id, HANDLER_PANICKED);
            }
        };
        // The reply must carry the wire id whatever the hook did.
        ctx.id = id;
        ctx.method = method;

        self.options.registry.dispatch(ctx, params).await
    }

    fn finish(&self, reason: CloseReason) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shutdown.send_replace(true);
        self.handshake.lock().take();

        let failed = self
            .pending
            .fail_all(RpcError::not_connected("connection closed"));

        match &reason {
            CloseReason::Error(e) => warn!(
                "{} endpoint {} closed with error: {} ({} pending calls failed)",
                self.role.name(),
                self.role.token(),
                e,
                failed
            ),
            _ => debug!(
                "{} endpoint {} {} ({} pending calls failed)",
                self.role.name(),
                self.role.token(),
                reason,
                failed
            ),
        }

        self.closed.send_replace(Some(reason));
    }
}

async fn read_loop<R>(shared: Arc<Shared>, mut reader: R, mut shutdown: watch::Receiver<bool>)
where
    R: AsyncRead + Unpin,
{
    let max = shared.options.max_message_size;
    let reason = loop {
        tokio::select! {
            result = read_frame_limited(&mut reader, max) => match result {
                Ok(Some(frame)) => shared.handle_frame(&frame),
                Ok(None) => break CloseReason::Remote,
                Err(e) => break CloseReason::Error(e.to_string()),
            },
            _ = shutdown.changed() => break CloseReason::Local,
        }
    };
    shared.finish(reason);
}

async fn write_loop<W>(
    shared: Arc<Shared>,
    mut writer: W,
    mut outbound: mpsc::Receiver<Vec<u8>>,
    mut shutdown: watch::Receiver<bool>,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let frame = tokio::select! {
            frame = outbound.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = shutdown.changed() => break,
        };

        let written = tokio::select! {
            result = write_frame(&mut writer, &frame) => result,
            _ = shutdown.changed() => break,
        };
        if let Err(e) = written {
            shared.finish(CloseReason::Error(e.to_string()));
            break;
        }
    }
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PROCEDURE_NOT_FOUND;
    use crate::protocol::read_frame;
    use serde_json::json;
    use tokio::io::DuplexStream;

    fn options_with(registry: MethodRegistry) -> PeerOptions {
        PeerOptions {
            registry,
            ..PeerOptions::default()
        }
    }

    /// Two endpoints wired back to back over an in-memory pipe.
    fn pair(client: MethodRegistry, server: MethodRegistry) -> (PeerEndpoint, PeerEndpoint) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let role = |server: bool| {
            if server {
                Role::Server {
                    token: "dev-1".into(),
                }
            } else {
                Role::Client {
                    token: "dev-1".into(),
                }
            }
        };
        (
            PeerEndpoint::spawn(a, role(false), options_with(client)),
            PeerEndpoint::spawn(b, role(true), options_with(server)),
        )
    }

    /// One endpoint plus the raw other end of the pipe.
    fn raw(options: PeerOptions) -> (PeerEndpoint, DuplexStream) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let peer = PeerEndpoint::spawn(
            a,
            Role::Client {
                token: "dev-1".into(),
            },
            options,
        );
        (peer, b)
    }

    async fn read_envelope(stream: &mut DuplexStream) -> Envelope {
        let frame = read_frame(stream).await.unwrap().unwrap();
        Envelope::decode(&frame)
    }

    async fn write_envelope(stream: &mut DuplexStream, env: &Envelope) {
        write_frame(stream, &env.encode().unwrap()).await.unwrap();
    }

    #[tokio::test]
    async fn test_calls_flow_both_directions() {
        let on_client = MethodRegistry::new();
        on_client.register("whoami", |ctx: CallContext, _params| async move {
            Ok::<_, String>(ctx.token)
        });
        let on_server = MethodRegistry::new();
        on_server.register("double", |_ctx, params: Value| async move {
            Ok::<_, String>(params["n"].as_i64().unwrap_or(0) * 2)
        });

        let (client, server) = pair(on_client, on_server);

        let doubled = client.call("double", json!({"n": 21})).await.unwrap();
        assert_eq!(doubled, json!(42));

        let who = server.call("whoami", Value::Null).await.unwrap();
        assert_eq!(who, json!("dev-1"));
    }

    #[tokio::test]
    async fn test_missing_procedure_both_directions() {
        let (client, server) = pair(MethodRegistry::new(), MethodRegistry::new());

        for (peer, method) in [(&client, "a"), (&server, "b")] {
            match peer.call(method, Value::Null).await {
                Err(RpcError::ProcedureNotFound { method: m }) => assert_eq!(m, method),
                other => panic!("Expected ProcedureNotFound, got: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_handler_failure_keeps_connection_serving() {
        let on_server = MethodRegistry::new();
        on_server.register("fail", |_ctx, _params| async { Err::<(), _>("nope") });
        on_server.register("ok", |_ctx, _params| async { Ok::<_, String>("fine") });
        let (client, _server) = pair(MethodRegistry::new(), on_server);

        match client.call("fail", Value::Null).await {
            Err(RpcError::Request { message }) => assert_eq!(message, "nope"),
            other => panic!("Expected Request error, got: {:?}", other),
        }
        assert_eq!(client.call("ok", Value::Null).await.unwrap(), json!("fine"));
    }

    #[tokio::test]
    async fn test_handlers_run_concurrently() {
        let on_server = MethodRegistry::new();
        on_server.register("slow", |_ctx, _params| async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, String>("slow")
        });
        on_server.register("fast", |_ctx, _params| async { Ok::<_, String>("fast") });
        let (client, _server) = pair(MethodRegistry::new(), on_server);

        let slow = {
            let client = client.clone();
            tokio::spawn(async move { client.call("slow", Value::Null).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let fast = client.call("fast", Value::Null).await.unwrap();
        assert_eq!(fast, json!("fast"));
        assert!(!slow.is_finished());
        assert_eq!(slow.await.unwrap().unwrap(), json!("slow"));
    }

    #[tokio::test]
    async fn test_context_hook_enriches_dispatch() {
        #[derive(Debug)]
        struct Tenant(String);

        let registry = MethodRegistry::new();
        registry.register("tenant", |ctx: CallContext, _params| async move {
            Ok::<_, String>(ctx.extension::<Tenant>().map(|t| t.0.clone()))
        });
        let hook: ContextHook = Arc::new(|ctx: CallContext| {
            let tenant = Tenant(format!("tenant-of-{}", ctx.token.clone().unwrap_or_default()));
            ctx.with_extension(tenant)
        });

        let (a, b) = tokio::io::duplex(64 * 1024);
        let server = PeerEndpoint::spawn(
            a,
            Role::Server {
                token: "dev-9".into(),
            },
            PeerOptions {
                registry,
                context_hook: hook,
                ..PeerOptions::default()
            },
        );
        let client = PeerEndpoint::spawn(
            b,
            Role::Client {
                token: "dev-9".into(),
            },
            PeerOptions::default(),
        );

        let tenant = client.call("tenant", Value::Null).await.unwrap();
        assert_eq!(tenant, json!("tenant-of-dev-9"));
        drop(server);
    }

    #[tokio::test]
    async fn test_call_after_close_is_not_connected() {
        let (peer, mut remote) = raw(PeerOptions::default());
        peer.close();

        match peer.call("ping", Value::Null).await {
            Err(RpcError::NotConnected { .. }) => {}
            other => panic!("Expected NotConnected, got: {:?}", other),
        }
        assert_eq!(peer.stats().pending_requests, 0);
        assert_eq!(peer.close_reason(), Some(CloseReason::Local));

        // Nothing was written for the refused call.
        assert!(read_frame(&mut remote).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_remote_close_fails_pending_calls() {
        let (peer, mut remote) = raw(PeerOptions::default());

        let call = {
            let peer = peer.clone();
            tokio::spawn(async move { peer.call("ping", Value::Null).await })
        };
        // Wait for the request to be on the wire, then hang up.
        let request = read_envelope(&mut remote).await;
        assert_eq!(request.kind(), "request");
        drop(remote);

        match call.await.unwrap() {
            Err(RpcError::NotConnected { .. }) => {}
            other => panic!("Expected NotConnected, got: {:?}", other),
        }
        assert_eq!(peer.closed().await, CloseReason::Remote);
        assert!(!peer.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_then_late_reply_is_protocol_error() {
        let options = PeerOptions {
            call_timeout: Duration::from_secs(1),
            ..PeerOptions::default()
        };
        let mut events = options.events.subscribe();
        let (peer, mut remote) = raw(options);

        let call = {
            let peer = peer.clone();
            tokio::spawn(async move { peer.call("sleepy", Value::Null).await })
        };
        let id = match read_envelope(&mut remote).await {
            Envelope::Request { id, method, .. } => {
                assert_eq!(method, "sleepy");
                id
            }
            other => panic!("Expected request, got: {:?}", other),
        };

        match call.await.unwrap() {
            Err(RpcError::Request { message }) => assert_eq!(message, "request timeout"),
            other => panic!("Expected timeout, got: {:?}", other),
        }
        assert_eq!(peer.stats().pending_requests, 0);

        write_envelope(&mut remote, &Envelope::response(id, json!("late"))).await;

        match events.recv().await.unwrap() {
            RpcEvent::ProtocolError { error, .. } => {
                assert_eq!(error.to_string(), "Request error: wrong request id")
            }
            other => panic!("Expected ProtocolError, got: {:?}", other),
        }
        assert!(peer.is_open());
    }

    #[tokio::test]
    async fn test_malformed_input_is_reported_and_connection_survives() {
        let registry = MethodRegistry::new();
        registry.register("ping", |_ctx, _params| async { Ok::<_, String>("pong") });
        let options = options_with(registry);
        let mut events = options.events.subscribe();
        let (peer, mut remote) = raw(options);

        write_frame(&mut remote, b"{{{ not json").await.unwrap();
        match events.recv().await.unwrap() {
            RpcEvent::ProtocolError { error, token } => {
                assert!(matches!(error, RpcError::InvalidJsonRpc { .. }));
                assert_eq!(token.as_deref(), Some("dev-1"));
            }
            other => panic!("Expected ProtocolError, got: {:?}", other),
        }

        write_envelope(&mut remote, &Envelope::request("r1", "ping", Value::Null)).await;
        assert_eq!(
            read_envelope(&mut remote).await,
            Envelope::response("r1", json!("pong"))
        );
        assert!(peer.is_open());
    }

    #[tokio::test]
    async fn test_inbound_request_always_gets_one_reply() {
        let (_peer, mut remote) = raw(PeerOptions::default());

        write_envelope(&mut remote, &Envelope::request("r1", "missing", json!({}))).await;
        assert_eq!(
            read_envelope(&mut remote).await,
            Envelope::error("r1", PROCEDURE_NOT_FOUND)
        );
    }

    #[tokio::test]
    async fn test_unregister_applies_to_next_message() {
        let registry = MethodRegistry::new();
        registry.register("ping", |_ctx, _params| async { Ok::<_, String>("pong") });
        let (_peer, mut remote) = raw(options_with(registry.clone()));

        registry.unregister("ping");
        write_envelope(&mut remote, &Envelope::request("r1", "ping", Value::Null)).await;
        assert_eq!(
            read_envelope(&mut remote).await,
            Envelope::error("r1", PROCEDURE_NOT_FOUND)
        );
    }

    #[tokio::test]
    async fn test_client_handshake_accepted() {
        let (peer, mut remote) = raw(PeerOptions::default());

        let handshake = {
            let peer = peer.clone();
            tokio::spawn(async move { peer.handshake(Duration::from_secs(5)).await })
        };
        let id = match read_envelope(&mut remote).await {
            Envelope::Connect {
                id,
                handshake: Handshake::Hello { token },
            } => {
                assert_eq!(token.as_deref(), Some("dev-1"));
                id
            }
            other => panic!("Expected hello, got: {:?}", other),
        };
        write_envelope(&mut remote, &Envelope::connect_reply(id, true, None)).await;

        let outcome = handshake.await.unwrap().unwrap();
        assert!(outcome.accepted);
    }

    #[tokio::test]
    async fn test_server_role_rejects_connect_after_admission() {
        let options = PeerOptions::default();
        let mut events = options.events.subscribe();
        let (a, mut remote) = tokio::io::duplex(4096);
        let peer = PeerEndpoint::spawn(
            a,
            Role::Server {
                token: "dev-2".into(),
            },
            options,
        );

        assert!(peer.handshake(Duration::from_secs(1)).await.is_err());

        write_envelope(&mut remote, &Envelope::connect_hello("h", "dev-2")).await;
        match events.recv().await.unwrap() {
            RpcEvent::ProtocolError { error, .. } => {
                assert!(matches!(error, RpcError::InvalidJsonRpc { .. }))
            }
            other => panic!("Expected ProtocolError, got: {:?}", other),
        }
        assert!(peer.is_open());
    }

    #[tokio::test]
    async fn test_panicking_context_hook_is_answered_and_contained() {
        let registry = MethodRegistry::new();
        registry.register("ping", |_ctx, _params| async { Ok::<_, String>("pong") });
        let hook: ContextHook = Arc::new(|ctx: CallContext| {
            if ctx.method == "boom" {
                panic!("hook failure");
            }
            ctx
        });
        let (peer, mut remote) = raw(PeerOptions {
            registry,
            context_hook: hook,
            ..PeerOptions::default()
        });

        write_envelope(&mut remote, &Envelope::request("r1", "boom", Value::Null)).await;
        assert_eq!(
            read_envelope(&mut remote).await,
            Envelope::error("r1", HANDLER_PANICKED)
        );

        write_envelope(&mut remote, &Envelope::request("r2", "ping", Value::Null)).await;
        assert_eq!(
            read_envelope(&mut remote).await,
            Envelope::response("r2", json!("pong"))
        );
        assert!(peer.is_open());
    }
}
