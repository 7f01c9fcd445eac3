//! Shared wire protocol: envelope classification and socket framing.
//!
//! Used identically by the server's per-connection handlers and by clients.

pub mod envelope;
pub mod framing;

pub use envelope::{Envelope, Handshake};
pub use framing::{read_frame, read_frame_limited, write_frame};
