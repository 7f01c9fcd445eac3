//! Built-in methods exposed by the CLI on either side of a connection.

use serde_json::{json, Value};
use tandem_core::{CallContext, MethodRegistry, Server};

/// Methods every endpoint started from the CLI answers.
pub fn register_common(registry: &MethodRegistry) {
    registry.register("ping", |_ctx, _params| async { Ok::<_, String>("pong") });
    registry.register("echo", |_ctx, params: Value| async move { Ok::<_, String>(params) });
    registry.register("whoami", |ctx: CallContext, _params| async move {
        Ok::<_, String>(json!({ "token": ctx.token, "call_id": ctx.id }))
    });
}

/// Server-only methods.
pub fn register_server(server: &Server) {
    register_common(server.registry());

    let stats_server = server.clone();
    server.register("peers", move |_ctx, _params| {
        let server = stats_server.clone();
        async move {
            let stats = server.stats();
            Ok::<_, String>(json!({
                "connected": stats.connected,
                "pending_requests": stats.pending_requests,
                "active_dispatches": stats.active_dispatches,
            }))
        }
    });

    let relay_server = server.clone();
    server.register("relay", move |_ctx, params: Value| relay(relay_server.clone(), params));
}

/// Forward a call to another connected device: `{"token", "method", "params"}`.
async fn relay(server: Server, params: Value) -> Result<Value, String> {
    let token = params["token"].as_str().ok_or("missing token")?;
    let method = params["method"].as_str().ok_or("missing method")?;
    let inner = params.get("params").cloned().unwrap_or(Value::Null);
    server
        .call(token, method, inner)
        .await
        .map_err(|e| e.to_string())
}
