//! Saved-property actions served on the `property_management` queue.
//!
//! - `saveProperty`: requires `user_id`, `property_id`, `address`
//! - `getSavedProperties`: requires `user_id`, newest first
//! - `deleteSavedProperty`: requires `user_id`, `property_id`
//!
//! Redelivered `saveProperty` requests hit the store's (user, property)
//! uniqueness constraint and answer `Property already saved` instead of
//! creating a second record.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::info;

use super::{text, user_id, MISSING_FIELDS};
use crate::dispatch::{ActionTable, DispatchError, HandlerError, HandlerResult};
use crate::envelope::{Payload, ResponseEnvelope};

pub const SAVE_PROPERTY: &str = "saveProperty";
pub const GET_SAVED_PROPERTIES: &str = "getSavedProperties";
pub const DELETE_SAVED_PROPERTY: &str = "deleteSavedProperty";

/// A property a user has bookmarked.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SavedProperty {
    pub id: u64,
    pub user_id: i64,
    pub property_id: String,
    pub address: String,
    pub price: Option<f64>,
    pub bedrooms: Option<f64>,
    pub bathrooms: Option<f64>,
    pub sqft: Option<f64>,
    pub property_type: Option<String>,
    pub image_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Fields of a property to save.
#[derive(Debug, Clone, PartialEq)]
pub struct NewSavedProperty {
    pub user_id: i64,
    pub property_id: String,
    pub address: String,
    pub price: Option<f64>,
    pub bedrooms: Option<f64>,
    pub bathrooms: Option<f64>,
    pub sqft: Option<f64>,
    pub property_type: Option<String>,
    pub image_url: Option<String>,
}

/// Errors from a saved-property store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Property {property_id} already saved for user {user_id}")]
    Duplicate { user_id: i64, property_id: String },

    #[error("Backend error: {0}")]
    Backend(String),
}

/// Persistence for saved properties.
///
/// A user can save a given property once; `insert` on an existing
/// (user_id, property_id) pair fails with `StoreError::Duplicate`.
#[async_trait]
pub trait SavedPropertyStore: Send + Sync {
    async fn insert(&self, property: NewSavedProperty) -> Result<SavedProperty, StoreError>;

    /// Saved properties of a user, most recently saved first.
    async fn list(&self, user_id: i64) -> Result<Vec<SavedProperty>, StoreError>;

    /// Remove a saved property. Returns false if there was none.
    async fn remove(&self, user_id: i64, property_id: &str) -> Result<bool, StoreError>;
}

type PropertyKey = (i64, String);

/// In-memory saved-property store.
#[derive(Default)]
pub struct InMemorySavedPropertyStore {
    properties: RwLock<HashMap<PropertyKey, SavedProperty>>,
    next_id: AtomicU64,
}

impl InMemorySavedPropertyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SavedPropertyStore for InMemorySavedPropertyStore {
    async fn insert(&self, property: NewSavedProperty) -> Result<SavedProperty, StoreError> {
        let key = (property.user_id, property.property_id.clone());
        let mut properties = self.properties.write().await;
        if properties.contains_key(&key) {
            return Err(StoreError::Duplicate {
                user_id: property.user_id,
                property_id: property.property_id,
            });
        }

        let saved = SavedProperty {
            id: self.next_id.fetch_add(1, Ordering::Relaxed) + 1,
            user_id: property.user_id,
            property_id: property.property_id,
            address: property.address,
            price: property.price,
            bedrooms: property.bedrooms,
            bathrooms: property.bathrooms,
            sqft: property.sqft,
            property_type: property.property_type,
            image_url: property.image_url,
            created_at: Utc::now(),
        };
        properties.insert(key, saved.clone());
        Ok(saved)
    }

    async fn list(&self, user_id: i64) -> Result<Vec<SavedProperty>, StoreError> {
        let mut saved: Vec<SavedProperty> = self
            .properties
            .read()
            .await
            .values()
            .filter(|p| p.user_id == user_id)
            .cloned()
            .collect();
        saved.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(saved)
    }

    async fn remove(&self, user_id: i64, property_id: &str) -> Result<bool, StoreError> {
        let key = (user_id, property_id.to_string());
        Ok(self.properties.write().await.remove(&key).is_some())
    }
}

/// Action table for the property-management dispatcher.
pub fn property_table(store: Arc<dyn SavedPropertyStore>) -> Result<ActionTable, DispatchError> {
    let mut table = ActionTable::new();

    let s = Arc::clone(&store);
    table.register(SAVE_PROPERTY, move |payload: Payload| {
        let store = Arc::clone(&s);
        async move { save_property(store.as_ref(), payload).await }
    })?;

    let s = Arc::clone(&store);
    table.register(GET_SAVED_PROPERTIES, move |payload: Payload| {
        let store = Arc::clone(&s);
        async move { get_saved_properties(store.as_ref(), payload).await }
    })?;

    table.register(DELETE_SAVED_PROPERTY, move |payload: Payload| {
        let store = Arc::clone(&store);
        async move { delete_saved_property(store.as_ref(), payload).await }
    })?;

    Ok(table)
}

pub async fn save_property(store: &dyn SavedPropertyStore, payload: Payload) -> HandlerResult {
    let (Some(user_id), Some(property_id), Some(address)) = (
        user_id(&payload)?,
        text(&payload, "property_id"),
        text(&payload, "address"),
    ) else {
        return Ok(ResponseEnvelope::error(MISSING_FIELDS));
    };

    let property = NewSavedProperty {
        user_id,
        property_id,
        address,
        price: number(&payload, "price"),
        bedrooms: number(&payload, "bedrooms"),
        bathrooms: number(&payload, "bathrooms"),
        sqft: number(&payload, "sqft"),
        property_type: text(&payload, "property_type"),
        image_url: text(&payload, "image_url"),
    };

    match store.insert(property).await {
        Ok(saved) => {
            info!(user_id, property_id = %saved.property_id, "Property saved");
            Ok(ResponseEnvelope::success()
                .with_message("Property saved successfully")
                .with("property_id", saved.property_id))
        }
        Err(StoreError::Duplicate { .. }) => Ok(ResponseEnvelope::error("Property already saved")),
        Err(e) => Err(HandlerError::Storage(e.to_string())),
    }
}

pub async fn get_saved_properties(store: &dyn SavedPropertyStore, payload: Payload) -> HandlerResult {
    let Some(user_id) = user_id(&payload)? else {
        return Ok(ResponseEnvelope::error("Missing user ID"));
    };

    let properties = store
        .list(user_id)
        .await
        .map_err(|e| HandlerError::Storage(e.to_string()))?;
    let properties =
        serde_json::to_value(&properties).map_err(|e| HandlerError::Storage(e.to_string()))?;

    Ok(ResponseEnvelope::success().with("properties", properties))
}

pub async fn delete_saved_property(store: &dyn SavedPropertyStore, payload: Payload) -> HandlerResult {
    let (Some(user_id), Some(property_id)) = (user_id(&payload)?, text(&payload, "property_id"))
    else {
        return Ok(ResponseEnvelope::error(MISSING_FIELDS));
    };

    let removed = store
        .remove(user_id, &property_id)
        .await
        .map_err(|e| HandlerError::Storage(e.to_string()))?;

    if removed {
        info!(user_id, property_id = %property_id, "Property removed");
        Ok(ResponseEnvelope::success().with_message("Property removed from saved list"))
    } else {
        Ok(ResponseEnvelope::error("Property not found in saved list"))
    }
}

fn number(payload: &Payload, key: &str) -> Option<f64> {
    match payload.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
