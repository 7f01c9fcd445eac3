//! Call id generation.
//!
//! Ids only need to be unique among the calls outstanding on one connection,
//! but the default uses random UUIDs so they also stay unique across
//! reconnects and between the two directions of a connection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Injected id source.
pub type IdGenerator = Arc<dyn Fn() -> String + Send + Sync>;

/// Random v4 UUIDs.
pub fn uuid_generator() -> IdGenerator {
    Arc::new(|| uuid::Uuid::new_v4().to_string())
}

/// `<prefix>-1`, `<prefix>-2`, ... Deterministic, useful in logs and tests.
pub fn sequential_generator(prefix: impl Into<String>) -> IdGenerator {
    let prefix = prefix.into();
    let next = AtomicU64::new(1);
    Arc::new(move || format!("{}-{}", prefix, next.fetch_add(1, Ordering::Relaxed)))
}
