//! Event envelope and handler contracts

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Rejection reasons for malformed event payloads
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ValidationError {
    /// The payload is not a JSON object
    #[error("event payload must be a JSON object")]
    NotAnObject,

    /// The `type` field is missing or not a non-empty string
    #[error("event payload is missing a \"type\" field")]
    MissingType,

    /// The `id` field is present but not a UUID
    #[error("event id is not a valid uuid: {0}")]
    InvalidId(String),
}

/// A validated event: identity, routing type, and the remaining payload
///
/// Serialization round-trips to the flat JSON shape producers send:
/// `{"id": ..., "type": ..., ...payload fields...}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventEnvelope {
    /// Delivery identity, stable across retries
    pub id: Uuid,

    /// Routing key
    #[serde(rename = "type")]
    pub event_type: String,

    /// Everything else in the payload, passed through untouched
    #[serde(flatten)]
    pub payload: serde_json::Map<String, serde_json::Value>,
}

impl EventEnvelope {
    /// Validate a raw payload into an envelope
    ///
    /// A missing `id` is assigned here, so the envelope (not the raw
    /// payload) is what gets persisted for retry: the identity stays
    /// stable across delivery attempts.
    pub fn from_value(value: &serde_json::Value) -> Result<Self, ValidationError> {
        let object = value.as_object().ok_or(ValidationError::NotAnObject)?;

        let event_type = object
            .get("type")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or(ValidationError::MissingType)?
            .to_string();

        let id = match object.get("id") {
            Some(raw) => raw
                .as_str()
                .and_then(|s| Uuid::parse_str(s).ok())
                .ok_or_else(|| ValidationError::InvalidId(raw.to_string()))?,
            None => Uuid::now_v7(),
        };

        let payload = object
            .iter()
            .filter(|(k, _)| k.as_str() != "id" && k.as_str() != "type")
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Ok(Self {
            id,
            event_type,
            payload,
        })
    }

    /// A payload field by name
    pub fn field(&self, name: &str) -> Option<&serde_json::Value> {
        self.payload.get(name)
    }
}

/// Error returned by an event handler
///
/// Delivery failures carry no retryable flag: every failure is retried
/// until the attempt cap, then dead-lettered.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(err.to_string())
    }
}

/// Consumer of one event type
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    /// Deliver one event
    ///
    /// Must be idempotent: at-least-once delivery means the same envelope
    /// (same `id`) can arrive more than once.
    async fn handle(&self, event: &EventEnvelope) -> Result<(), HandlerError>;
}
