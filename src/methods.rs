//! Method dispatch table.
//!
//! Maps method names to host-supplied handlers. The name `help` is
//! reserved for the built-in method listing and can never be registered.

use crate::clients::ConnectionSink;
use crate::envelope::Envelope;
use std::collections::BTreeMap;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;

/// Name of the built-in introspection method.
pub const HELP_METHOD: &str = "help";

/// Future returned by a method handler.
///
/// An `Err` means the connection sink is unusable; business failures are
/// reported to the client by the handler itself.
pub type HandlerFuture = Pin<Box<dyn Future<Output = io::Result<()>> + Send>>;

/// A registered method handler.
pub type MethodHandler = Arc<dyn Fn(Envelope, ConnectionSink) -> HandlerFuture + Send + Sync>;

/// Registration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegisterError {
    #[error("Method not allowed: '{0}' is reserved")]
    Reserved(String),
}

/// Method name to handler mapping.
#[derive(Clone, Default)]
pub struct MethodRegistry {
    handlers: BTreeMap<String, MethodHandler>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `handler` to `name`, replacing any earlier handler.
    pub fn register<F, Fut>(&mut self, name: impl Into<String>, handler: F) -> Result<(), RegisterError>
    where
        F: Fn(Envelope, ConnectionSink) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = io::Result<()>> + Send + 'static,
    {
        let name = name.into();
        if name == HELP_METHOD {
            return Err(RegisterError::Reserved(name));
        }

        let handler: MethodHandler =
            Arc::new(move |envelope: Envelope, sink: ConnectionSink| -> HandlerFuture {
                Box::pin(handler(envelope, sink))
            });
        self.handlers.insert(name, handler);
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Option<&MethodHandler> {
        self.handlers.get(name)
    }

    /// `help` followed by every registered name in sorted order.
    pub fn names(&self) -> Vec<String> {
        std::iter::once(HELP_METHOD.to_string())
            .chain(self.handlers.keys().cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for MethodRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.handlers.keys()).finish()
    }
}
