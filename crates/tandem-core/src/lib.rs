//! Tandem Core - symmetric JSON RPC over a persistent socket.
//!
//! A multi-peer [`Server`] and single-peer clients call named procedures on
//! each other over one long-lived connection. Either side may register
//! methods; either side may call them. Clients identify themselves with a
//! token during a `connect` handshake, and a [`ReconnectingClient`] keeps its
//! registered methods and event subscribers across reconnects.
//!
//! # Example
//!
//! ```rust,ignore
//! use tandem_core::{ClientConfig, ReconnectingClient, Server, ServerConfig};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> tandem_core::Result<()> {
//!     let server = Server::new(ServerConfig::new("127.0.0.1:7400"));
//!     server.register("add", |_ctx, params: serde_json::Value| async move {
//!         Ok::<_, String>(params["a"].as_i64().unwrap_or(0) + params["b"].as_i64().unwrap_or(0))
//!     });
//!     let _handle = server.listen().await?;
//!
//!     let client = ReconnectingClient::new(ClientConfig::new("device-1", "127.0.0.1:7400"));
//!     client.register("status", |_ctx, _params| async { Ok::<_, String>("idle") });
//!     client.init().await?;
//!
//!     let sum = client.call("add", json!({"a": 2, "b": 3})).await?;
//!     let status = server.call("device-1", "status", json!(null)).await?;
//!     println!("{} {}", sum, status);
//!     Ok(())
//! }
//! ```

pub mod backoff;
pub mod client;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod ids;
pub mod peer;
pub mod pending;
pub mod protocol;
pub mod reconnect;
pub mod registry;
pub mod server;

// Re-export commonly used types
pub use backoff::ReconnectPolicy;
pub use client::{BoxedTransport, Client, ClientConfig, Connector, TcpConnector, Transport};
pub use config::ProtocolConfig;
pub use context::{identity_hook, CallContext, ContextHook};
pub use error::{Result, RpcError, PROCEDURE_NOT_FOUND};
pub use events::{EventBus, RpcEvent};
pub use ids::{sequential_generator, uuid_generator, IdGenerator};
pub use peer::{CloseReason, PeerEndpoint, PeerOptions, PeerStats, Role};
pub use protocol::{Envelope, Handshake};
pub use reconnect::{ClientState, ReconnectingClient};
pub use registry::{MethodRegistry, HANDLER_PANICKED};
pub use server::{accept_all, HandshakeHook, Server, ServerConfig, ServerHandle, ServerStats};
