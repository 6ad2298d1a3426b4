//! Command registry mapping command names to handlers.
//!
//! Handlers are registered as typed closures. The closure's argument type is
//! the command's schema: the request data block is deserialized into it before
//! the handler runs, and a mismatch short-circuits into an `invalid` reply.

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::error;

use super::protocol::Message;
use super::server::Server;
use crate::error::HandlerError;

/// Result type for handler functions.
pub type HandlerResult = Result<Message, HandlerError>;

/// A capability implementing one command
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn call(&self, server: Arc<Server>, message: Message) -> HandlerResult;
}

/// Wrapper that validates the data block before calling the handler.
pub struct TypedHandler<F, T, Fut>
where
    F: Fn(Arc<Server>, Message, T) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    handler: F,
    _phantom: PhantomData<fn(T) -> Fut>,
}

impl<F, T, Fut> TypedHandler<F, T, Fut>
where
    F: Fn(Arc<Server>, Message, T) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

#[async_trait]
impl<F, T, Fut> Handler for TypedHandler<F, T, Fut>
where
    F: Fn(Arc<Server>, Message, T) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn call(&self, server: Arc<Server>, message: Message) -> HandlerResult {
        let data = match &message.data {
            Value::Null => Value::Object(serde_json::Map::new()),
            data => data.clone(),
        };

        let args: T = match serde_json::from_value(data) {
            Ok(args) => args,
            Err(e) => {
                error!(
                    "Received invalid data for command {}: {}",
                    message.command_name(),
                    e
                );
                return Ok(message.invalid(e.to_string()));
            }
        };

        (self.handler)(server, message, args).await
    }
}

/// Name → handler mapping. Re-registering a name replaces the previous handler.
pub struct CommandRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn Handler>>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, name: impl Into<String>, handler: Arc<dyn Handler>) {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        handlers.insert(name.into(), handler);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Handler>> {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        handlers.contains_key(name)
    }

    /// Registered command names, sorted
    pub fn names(&self) -> Vec<String> {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = handlers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::new()
    }
}
