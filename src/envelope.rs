//! Request and response envelopes carried as message bodies.
//!
//! Every body on the wire is UTF-8 JSON. Requests name an `action` and carry a
//! payload map; responses always carry `status` and optionally `message`, with
//! any other handler data flattened alongside.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Payload map handed to handlers.
pub type Payload = Map<String, Value>;

/// Message returned when a request body cannot be parsed.
pub const INVALID_REQUEST: &str = "Invalid request";
/// Message returned when a reply body is not a response envelope.
pub const INVALID_RESPONSE: &str = "Invalid response";
/// Message returned when no reply arrives before the deadline.
pub const TIMEOUT: &str = "timeout";
/// Message returned when the broker refuses the call outright.
pub const SERVICE_UNAVAILABLE: &str = "service unavailable";

/// Errors from parsing a request body.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("Body is not valid JSON: {0}")]
    Json(String),

    #[error("Body is not a JSON object")]
    NotAnObject,

    #[error("Missing or empty action")]
    MissingAction,

    #[error("Payload is not a JSON object")]
    PayloadNotAnObject,
}

/// Request envelope: `{ action, payload }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub action: String,
    #[serde(default)]
    pub payload: Payload,
}

impl RequestEnvelope {
    pub fn new(action: impl Into<String>, payload: Payload) -> Self {
        Self {
            action: action.into(),
            payload,
        }
    }

    /// Parse a request body.
    ///
    /// Accepts the nested form `{"action": .., "payload": {..}}`. When no
    /// `payload` key is present, the remaining top-level fields become the
    /// payload, so flat bodies like `{"action": "login", "email": ..}` are
    /// understood as well.
    pub fn parse(body: &[u8]) -> Result<Self, EnvelopeError> {
        let value: Value =
            serde_json::from_slice(body).map_err(|e| EnvelopeError::Json(e.to_string()))?;

        let Value::Object(mut fields) = value else {
            return Err(EnvelopeError::NotAnObject);
        };

        let action = match fields.remove("action") {
            Some(Value::String(action)) if !action.is_empty() => action,
            _ => return Err(EnvelopeError::MissingAction),
        };

        let payload = match fields.remove("payload") {
            Some(Value::Object(payload)) => payload,
            Some(Value::Null) => Payload::new(),
            Some(_) => return Err(EnvelopeError::PayloadNotAnObject),
            None => fields,
        };

        Ok(Self { action, payload })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        // A struct of a string and a string-keyed map always serializes.
        serde_json::to_vec(self).unwrap_or_default()
    }
}

/// Outcome discriminator of a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Error,
}

/// Response envelope: `{ status, message?, ...data }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

impl ResponseEnvelope {
    pub fn success() -> Self {
        Self {
            status: Status::Success,
            message: None,
            data: Map::new(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: Status::Error,
            message: Some(message.into()),
            data: Map::new(),
        }
    }

    /// Synthetic envelope for a malformed request.
    pub fn invalid_request() -> Self {
        Self::error(INVALID_REQUEST)
    }

    /// Synthetic envelope for an action no handler is registered for.
    pub fn unknown_action(action: &str) -> Self {
        Self::error(format!("Unknown action: {}", action))
    }

    pub fn timeout() -> Self {
        Self::error(TIMEOUT)
    }

    pub fn service_unavailable() -> Self {
        Self::error(SERVICE_UNAVAILABLE)
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Attach a data field. `status` and `message` are reserved and ignored.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let key = key.into();
        if key != "status" && key != "message" {
            self.data.insert(key, value.into());
        }
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }

    /// Parse a reply body.
    pub fn parse(body: &[u8]) -> Result<Self, EnvelopeError> {
        serde_json::from_slice(body).map_err(|e| EnvelopeError::Json(e.to_string()))
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }
}
