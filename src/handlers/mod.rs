//! Business handlers, grouped by the topic queue that serves them.

pub mod auth;
pub mod saved_properties;

use std::sync::Arc;

use serde_json::Value;

pub use auth::{auth_table, InMemoryUserStore, User, UserStore, UserStoreError};
pub use saved_properties::{
    property_table, InMemorySavedPropertyStore, NewSavedProperty, SavedProperty,
    SavedPropertyStore, StoreError,
};

use crate::dispatch::{ActionTable, DispatchError, HandlerError};
use crate::envelope::Payload;
use crate::topic::Topic;

/// Topics this crate has handlers for. Market data is served externally.
pub const SERVED_TOPICS: &[Topic] = &[Topic::Auth, Topic::PropertyManagement];

pub(crate) const MISSING_FIELDS: &str = "Missing required fields";

/// Stores shared by every dispatcher in one process.
#[derive(Clone)]
pub struct Stores {
    pub users: Arc<dyn UserStore>,
    pub properties: Arc<dyn SavedPropertyStore>,
}

impl Stores {
    pub fn in_memory() -> Self {
        Self {
            users: Arc::new(InMemoryUserStore::new()),
            properties: Arc::new(InMemorySavedPropertyStore::new()),
        }
    }
}

/// Action table served on a topic's request queue.
pub fn action_table(topic: Topic, stores: &Stores) -> Result<ActionTable, DispatchError> {
    match topic {
        Topic::Auth => auth_table(Arc::clone(&stores.users)),
        Topic::PropertyManagement => property_table(Arc::clone(&stores.properties)),
        Topic::MarketData => Err(DispatchError::UnservedTopic(topic)),
    }
}

/// `user_id` as an integer. Numeric strings are accepted; anything else
/// that is present is an invalid payload.
pub(crate) fn user_id(payload: &Payload) -> Result<Option<i64>, HandlerError> {
    match payload.get("user_id") {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_i64()
            .map(Some)
            .ok_or_else(|| HandlerError::InvalidPayload("user_id must be an integer".to_string())),
        Some(Value::String(s)) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| HandlerError::InvalidPayload("user_id must be an integer".to_string())),
        Some(_) => Err(HandlerError::InvalidPayload(
            "user_id must be an integer".to_string(),
        )),
    }
}

/// Non-empty string field; numbers are rendered as text.
pub(crate) fn text(payload: &Payload, key: &str) -> Option<String> {
    match payload.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
