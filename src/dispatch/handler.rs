//! Action handlers and the action table.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;

use super::DispatchError;
use crate::envelope::{Payload, ResponseEnvelope};

/// Result of one handler invocation.
///
/// `Ok` carries the reply, including business-level errors such as
/// "Property already saved". `Err` is a handler failure; the dispatcher turns
/// it into an error envelope whose message is the error's display text.
pub type HandlerResult = Result<ResponseEnvelope, HandlerError>;

/// Handler-level failures.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Handler panicked: {0}")]
    Panicked(String),
}

/// Business function bound to one action.
pub trait ActionHandler: Send + Sync {
    fn handle(&self, payload: Payload) -> BoxFuture<'static, HandlerResult>;
}

impl<F, Fut> ActionHandler for F
where
    F: Fn(Payload) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn handle(&self, payload: Payload) -> BoxFuture<'static, HandlerResult> {
        Box::pin(self(payload))
    }
}

/// Static action -> handler table, built once at startup.
#[derive(Clone, Default)]
pub struct ActionTable {
    handlers: HashMap<String, Arc<dyn ActionHandler>>,
}

impl ActionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `handler` to `action`. Each action can be bound once.
    pub fn register<H>(&mut self, action: impl Into<String>, handler: H) -> Result<(), DispatchError>
    where
        H: ActionHandler + 'static,
    {
        let action = action.into();
        if action.is_empty() {
            return Err(DispatchError::EmptyAction);
        }
        if self.handlers.contains_key(&action) {
            return Err(DispatchError::DuplicateAction(action));
        }
        self.handlers.insert(action, Arc::new(handler));
        Ok(())
    }

    pub fn get(&self, action: &str) -> Option<Arc<dyn ActionHandler>> {
        self.handlers.get(action).cloned()
    }

    /// Registered actions, sorted.
    pub fn actions(&self) -> Vec<&str> {
        let mut actions: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        actions.sort_unstable();
        actions
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for ActionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionTable")
            .field("actions", &self.actions())
            .finish()
    }
}
