//! Table of outbound calls awaiting a reply.
//!
//! Each record is removed exactly once: by a matching settlement, by its
//! deadline timer, or by [`PendingCalls::fail_all`] when the connection goes
//! away. Removal happens under the table lock, so whichever path gets there
//! first wins and the others become no-ops.

use crate::{Result, RpcError};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;

/// What the caller eventually receives.
pub type CallOutcome = Result<Value>;

/// Reply data carried by an inbound `Response` or `Error` envelope.
#[derive(Debug, Clone)]
pub enum Settlement {
    Result(Value),
    Error(String),
}

struct PendingCall {
    method: String,
    tx: oneshot::Sender<CallOutcome>,
    timer: JoinHandle<()>,
}

type Table = Mutex<HashMap<String, PendingCall>>;

/// Per-endpoint map of in-flight outbound calls.
#[derive(Clone, Default)]
pub struct PendingCalls {
    inner: Arc<Table>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a record for `id` and start its deadline.
    ///
    /// Must be called from within a tokio runtime.
    pub fn register(
        &self,
        id: &str,
        method: &str,
        timeout: Duration,
    ) -> Result<oneshot::Receiver<CallOutcome>> {
        let mut table = self.inner.lock();
        if table.contains_key(id) {
            return Err(RpcError::request(format!("duplicate request id {}", id)));
        }

        let (tx, rx) = oneshot::channel();
        let timer = tokio::spawn(deadline(Arc::downgrade(&self.inner), id.to_string(), timeout));
        table.insert(
            id.to_string(),
            PendingCall {
                method: method.to_string(),
                tx,
                timer,
            },
        );
        Ok(rx)
    }

    /// Complete the call `id` with a reply from the peer.
    ///
    /// Returns `wrong request id` when nobody is waiting on `id`; the caller is
    /// expected to publish that as a protocol error.
    pub fn settle(&self, id: &str, settlement: Settlement) -> Result<()> {
        let Some(call) = self.inner.lock().remove(id) else {
            return Err(RpcError::wrong_request_id());
        };
        call.timer.abort();

        let outcome = match settlement {
            Settlement::Result(value) => Ok(value),
            Settlement::Error(message) => Err(RpcError::from_remote(&call.method, message)),
        };
        if call.tx.send(outcome).is_err() {
            debug!("Caller for {} ({}) went away before settlement", id, call.method);
        }
        Ok(())
    }

    /// Fail the call `id` with a timeout if it is still pending.
    pub fn evict(&self, id: &str) -> bool {
        evict_from(&self.inner, id)
    }

    /// Drop the record for `id` without completing it. Used when the request
    /// never made it onto the wire; the caller reports its own error.
    pub fn cancel(&self, id: &str) -> bool {
        match self.inner.lock().remove(id) {
            Some(call) => {
                call.timer.abort();
                true
            }
            None => false,
        }
    }

    /// Fail every pending call, typically because the transport closed.
    pub fn fail_all(&self, error: RpcError) -> usize {
        let drained: Vec<(String, PendingCall)> = self.inner.lock().drain().collect();
        let count = drained.len();
        for (id, call) in drained {
            call.timer.abort();
            debug!("Failing pending call {} ({}): {}", id, call.method, error);
            let _ = call.tx.send(Err(error.clone()));
        }
        count
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

async fn deadline(table: Weak<Table>, id: String, timeout: Duration) {
    tokio::time::sleep(timeout).await;
    if let Some(table) = table.upgrade() {
        evict_from(&table, &id);
    }
}

fn evict_from(table: &Table, id: &str) -> bool {
    let Some(call) = table.lock().remove(id) else {
        return false;
    };
    debug!("Call {} ({}) timed out", id, call.method);
    let _ = call.tx.send(Err(RpcError::request_timeout()));
    true
}
