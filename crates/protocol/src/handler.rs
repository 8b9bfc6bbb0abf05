//! Handler contract and the factory table used for type dispatch.
//!
//! A peer announces its client type with the first message it sends. The
//! receiving side looks that name up in a [`HandlerFactories`] table, builds
//! a handler for the connection, and from then on hands every message to it.
//!
//! Handlers run on the connection's reader task. Anything slow belongs on a
//! separate task so the next frame is not held up.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// Receives decoded traffic from one peer.
///
/// `P` is the sender reference the caller provides: a server-side peer handle
/// or the client runtime's own handle. It can be used to reply.
pub trait MessageHandler<P: ?Sized>: Send + Sync {
    /// Handles a decoded text message.
    fn handle_message(&self, sender: &P, message: &str);

    /// Handles a message delivered together with a custom header.
    fn handle_custom_header(&self, sender: &P, message: &str, header: &str) {
        let _ = (sender, message, header);
    }

    /// Handles a file that a collaborator finished receiving to `path`.
    fn handle_file(&self, sender: &P, path: &Path) {
        let _ = (sender, path);
    }
}

/// Builds the handler for a newly classified connection.
pub type HandlerFactory<P> = Arc<dyn Fn(&P) -> Arc<dyn MessageHandler<P>> + Send + Sync>;

/// Mapping from client type name to handler factory.
pub struct HandlerFactories<P> {
    factories: HashMap<String, HandlerFactory<P>>,
}

impl<P> HandlerFactories<P> {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registers a factory for `client_type`, replacing any previous one.
    pub fn register<F>(mut self, client_type: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&P) -> Arc<dyn MessageHandler<P>> + Send + Sync + 'static,
    {
        self.insert(client_type, factory);
        self
    }

    /// Registers a factory in place.
    pub fn insert<F>(&mut self, client_type: impl Into<String>, factory: F)
    where
        F: Fn(&P) -> Arc<dyn MessageHandler<P>> + Send + Sync + 'static,
    {
        self.factories.insert(client_type.into(), Arc::new(factory));
    }

    /// Registers one shared handler instance for every connection of `client_type`.
    pub fn register_shared<H>(self, client_type: impl Into<String>, handler: Arc<H>) -> Self
    where
        H: MessageHandler<P> + 'static,
        P: 'static,
    {
        self.register(client_type, move |_| handler.clone() as Arc<dyn MessageHandler<P>>)
    }

    /// Looks up the factory for a classification token.
    pub fn get(&self, client_type: &str) -> Option<&HandlerFactory<P>> {
        self.factories.get(client_type)
    }

    /// Whether `client_type` is registered.
    pub fn contains(&self, client_type: &str) -> bool {
        self.factories.contains_key(client_type)
    }

    /// Registered type names, sorted.
    pub fn client_types(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Number of registered types.
    pub fn len(&self) -> usize {
        self.factories.len()
    }

    /// Whether no type is registered.
    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl<P> Default for HandlerFactories<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> fmt::Debug for HandlerFactories<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerFactories")
            .field("client_types", &self.client_types())
            .finish()
    }
}
