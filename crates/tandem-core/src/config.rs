//! Centralized protocol configuration.
//!
//! Wire constants and the default timings used by servers and clients when the
//! host does not override them.

use std::time::Duration;

/// Protocol-level configuration.
pub struct ProtocolConfig;

impl ProtocolConfig {
    /// Value every envelope must carry in its `version` field.
    pub const VERSION: &'static str = "1.0";
    /// Method name reserved for the identity handshake.
    pub const CONNECT_METHOD: &'static str = "connect";

    // Calls
    pub const CALL_TIMEOUT: Duration = Duration::from_secs(10);

    // Connection lifecycle
    pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    pub const RECONNECT_DELAY: Duration = Duration::from_secs(2);
    pub const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);

    // Limits
    pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024; // 16MB
    pub const MAX_CONNECTIONS: usize = 1024;
    pub const OUTBOUND_QUEUE_SIZE: usize = 256;
    pub const EVENT_CHANNEL_CAPACITY: usize = 128;

    /// Message sent with a handshake rejection when the hook gave no reason.
    pub const DEFAULT_REJECT_MESSAGE: &'static str = "connection rejected";
}
