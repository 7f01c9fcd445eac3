//! Method registry and dispatcher.
//!
//! A registry maps method names to async handlers. It is cheap to clone and
//! clones share the same table, which is how a reconnecting client keeps its
//! methods across connections and how a server shares one set of methods with
//! every device.

use crate::context::CallContext;
use crate::error::PROCEDURE_NOT_FOUND;
use crate::protocol::Envelope;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error};

/// Message sent back when a handler panics instead of returning.
pub const HANDLER_PANICKED: &str = "handler panicked";

/// Future returned by a boxed handler: the JSON result or the failure text.
pub type HandlerFuture = BoxFuture<'static, std::result::Result<Value, String>>;

/// Type-erased handler stored in the registry.
pub type BoxedHandler = Arc<dyn Fn(CallContext, Value) -> HandlerFuture + Send + Sync>;

/// Shared table of callable methods.
#[derive(Clone, Default)]
pub struct MethodRegistry {
    methods: Arc<RwLock<HashMap<String, BoxedHandler>>>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `name`. A later registration for the same name
    /// replaces the earlier one.
    ///
    /// The handler may return any serializable value; `()` and `None` reach the
    /// caller as `null`. Any `Display` error (including `anyhow::Error`) is sent
    /// back as the error text.
    pub fn register<F, Fut, R, E>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(CallContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, E>> + Send + 'static,
        R: Serialize + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let boxed: BoxedHandler = Arc::new(move |ctx, params| {
            let fut = handler(ctx, params);
            async move {
                match fut.await {
                    Ok(value) => serde_json::to_value(value)
                        .map_err(|e| format!("Failed to serialize result: {}", e)),
                    Err(e) => Err(e.to_string()),
                }
            }
            .boxed()
        });
        self.register_boxed(name, boxed);
    }

    /// Register an already type-erased handler.
    pub fn register_boxed(&self, name: impl Into<String>, handler: BoxedHandler) {
        let name = name.into();
        if self.methods.write().insert(name.clone(), handler).is_some() {
            debug!("Replaced handler for {}", name);
        } else {
            debug!("Registered handler for {}", name);
        }
    }

    /// Remove the handler for `name`. Returns whether one was registered.
    pub fn unregister(&self, name: &str) -> bool {
        self.methods.write().remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<BoxedHandler> {
        self.methods.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.methods.read().contains_key(name)
    }

    /// Registered method names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.methods.read().keys().cloned().collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.methods.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.read().is_empty()
    }

    /// Run the handler for `ctx.method` and build the reply envelope.
    ///
    /// Always produces exactly one `Response` or `Error` carrying `ctx.id`.
    /// Handler failures and panics are turned into `Error` envelopes.
    pub async fn dispatch(&self, ctx: CallContext, params: Value) -> Envelope {
        let id = ctx.id.clone();
        let method = ctx.method.clone();

        let Some(handler) = self.get(&method) else {
            debug!("No handler for {}", method);
            return Envelope::error(id, PROCEDURE_NOT_FOUND);
        };

        let call = AssertUnwindSafe(async move { handler(ctx, params).await });
        match call.catch_unwind().await {
            Ok(Ok(result)) => Envelope::response(id, result),
            Ok(Err(message)) => {
                debug!("Handler for {} failed: {}", method, message);
                Envelope::error(id, message)
            }
            Err(_) => {
                error!("Handler for {} panicked", method);
                Envelope::error(id, HANDLER_PANICKED)
            }
        }
    }
}

impl fmt::Debug for MethodRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodRegistry")
            .field("methods", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(method: &str) -> CallContext {
        CallContext::new("call-1", method, Some("dev".into()))
    }

    #[tokio::test]
    async fn test_dispatch_returns_handler_value() {
        let registry = MethodRegistry::new();
        registry.register("add", |_ctx, params: Value| async move {
            let a = params["a"].as_i64().unwrap_or(0);
            let b = params["b"].as_i64().unwrap_or(0);
            Ok::<_, String>(a + b)
        });

        let reply = registry.dispatch(ctx("add"), json!({"a": 2, "b": 5})).await;
        assert_eq!(reply, Envelope::response("call-1", json!(7)));
    }

    #[tokio::test]
    async fn test_unit_result_becomes_null() {
        let registry = MethodRegistry::new();
        registry.register("noop", |_ctx, _params| async { Ok::<_, String>(()) });

        let reply = registry.dispatch(ctx("noop"), Value::Null).await;
        assert_eq!(reply, Envelope::response("call-1", Value::Null));
    }

    #[tokio::test]
    async fn test_missing_method_uses_fixed_message() {
        let registry = MethodRegistry::new();
        let reply = registry.dispatch(ctx("nope"), Value::Null).await;
        assert_eq!(reply, Envelope::error("call-1", PROCEDURE_NOT_FOUND));
    }

    #[tokio::test]
    async fn test_handler_error_becomes_error_envelope() {
        let registry = MethodRegistry::new();
        registry.register("fail", |_ctx, _params| async {
            Err::<Value, _>(anyhow::anyhow!("disk on fire"))
        });

        let reply = registry.dispatch(ctx("fail"), Value::Null).await;
        assert_eq!(reply, Envelope::error("call-1", "disk on fire"));
    }

    #[tokio::test]
    async fn test_handler_panic_is_contained() {
        let registry = MethodRegistry::new();
        registry.register("explode", |_ctx, _params| async {
            if true {
                panic!("kaboom");
            }
            Ok::<_, String>(())
        });

        let reply = registry.dispatch(ctx("explode"), Value::Null).await;
        assert_eq!(reply, Envelope::error("call-1", HANDLER_PANICKED));
    }

    #[tokio::test]
    async fn test_last_registration_wins_and_unregister() {
        let registry = MethodRegistry::new();
        registry.register("v", |_ctx, _params| async { Ok::<_, String>(1) });
        registry.register("v", |_ctx, _params| async { Ok::<_, String>(2) });
        assert_eq!(registry.len(), 1);

        let reply = registry.dispatch(ctx("v"), Value::Null).await;
        assert_eq!(reply, Envelope::response("call-1", json!(2)));

        assert!(registry.unregister("v"));
        assert!(!registry.unregister("v"));
        let reply = registry.dispatch(ctx("v"), Value::Null).await;
        assert_eq!(reply, Envelope::error("call-1", PROCEDURE_NOT_FOUND));
    }

    #[tokio::test]
    async fn test_clones_share_the_table() {
        let registry = MethodRegistry::new();
        let clone = registry.clone();
        clone.register("b", |_ctx, _params| async { Ok::<_, String>("b") });
        registry.register("a", |_ctx, _params| async { Ok::<_, String>("a") });

        assert_eq!(clone.names(), vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_handler_sees_context() {
        let registry = MethodRegistry::new();
        registry.register("whoami", |ctx: CallContext, _params| async move {
            Ok::<_, String>(json!({"id": ctx.id, "token": ctx.token}))
        });

        let reply = registry.dispatch(ctx("whoami"), Value::Null).await;
        assert_eq!(
            reply,
            Envelope::response("call-1", json!({"id": "call-1", "token": "dev"}))
        );
    }
}
