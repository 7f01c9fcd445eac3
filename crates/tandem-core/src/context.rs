//! Per-call context handed to method handlers.
//!
//! The core only knows the call id, the method and the peer's identity token.
//! Hosts that need more (a database handle, a per-device session object, ...)
//! install a [`ContextHook`] that attaches an extension value; handlers read it
//! back with [`CallContext::extension`].

use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Context built for every inbound request.
#[derive(Clone)]
pub struct CallContext {
    /// Id of the inbound call being served.
    pub id: String,
    /// Method being invoked.
    pub method: String,
    /// Identity of the peer. On the server this is the remote client's token;
    /// on a client it is the client's own token.
    pub token: Option<String>,
    extension: Option<Arc<dyn Any + Send + Sync>>,
}

impl CallContext {
    pub fn new(id: impl Into<String>, method: impl Into<String>, token: Option<String>) -> Self {
        Self {
            id: id.into(),
            method: method.into(),
            token,
            extension: None,
        }
    }

    /// Attach a host-defined value. Replaces any previous extension.
    pub fn with_extension<T: Any + Send + Sync>(mut self, value: T) -> Self {
        self.extension = Some(Arc::new(value));
        self
    }

    /// Attach an already shared host-defined value.
    pub fn with_shared_extension(mut self, value: Arc<dyn Any + Send + Sync>) -> Self {
        self.extension = Some(value);
        self
    }

    /// Borrow the extension as `T`, if one of that type was attached.
    pub fn extension<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.extension.as_deref().and_then(|ext| ext.downcast_ref::<T>())
    }

    pub fn has_extension(&self) -> bool {
        self.extension.is_some()
    }
}

impl fmt::Debug for CallContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallContext")
            .field("id", &self.id)
            .field("method", &self.method)
            .field("token", &self.token)
            .field("has_extension", &self.extension.is_some())
            .finish()
    }
}

/// Hook run on every inbound request before dispatch. Default: identity.
pub type ContextHook = Arc<dyn Fn(CallContext) -> CallContext + Send + Sync>;

/// The identity hook.
pub fn identity_hook() -> ContextHook {
    Arc::new(|ctx| ctx)
}
