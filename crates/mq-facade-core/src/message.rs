//! Message types for broker operations including core identifiers.

use crate::destination::Destination;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;

// ============================================================================
// Core Identifiers
// ============================================================================

/// Unique identifier assigned to a message when it is sent
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(String);

impl MessageId {
    /// Generate new random message ID
    pub fn new() -> Self {
        Self(format!("ID:{}", uuid::Uuid::new_v4()))
    }

    /// Get message ID as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MessageId {
    type Err = crate::error::ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(crate::error::ValidationError::Required {
                field: "message_id".to_string(),
            });
        }

        Ok(Self(s.to_string()))
    }
}

/// Timestamp wrapper for consistent time handling
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Create timestamp for current time
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Create timestamp from DateTime
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }

    /// Get underlying DateTime
    pub fn as_datetime(&self) -> DateTime<Utc> {
        self.0
    }

    /// Timestamp offset from this one by `duration`, or `None` when the
    /// result falls outside the representable range
    pub fn plus(&self, duration: Duration) -> Option<Self> {
        self.0.checked_add_signed(duration).map(Self)
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d %H:%M:%S%.3f UTC"))
    }
}

// ============================================================================
// Delivery Mode
// ============================================================================

/// Whether the broker must durably store a message until it is delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// Broker stores the message durably until delivered
    Persistent,
    /// Best effort, lost on broker restart
    NonPersistent,
}

impl DeliveryMode {
    /// Map a persistence flag onto a delivery mode
    pub fn from_persistent(persistent: bool) -> Self {
        if persistent {
            Self::Persistent
        } else {
            Self::NonPersistent
        }
    }

    pub fn is_persistent(&self) -> bool {
        matches!(self, Self::Persistent)
    }
}

impl std::fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Persistent => write!(f, "persistent"),
            Self::NonPersistent => write!(f, "non-persistent"),
        }
    }
}

// ============================================================================
// Payloads
// ============================================================================

/// Key-value payload carried by map messages
pub type MapBody = serde_json::Map<String, serde_json::Value>;

/// Body of a message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum Payload {
    Text(String),
    Map(MapBody),
}

impl Payload {
    /// Which accessor this payload satisfies
    pub fn kind(&self) -> PayloadKind {
        match self {
            Self::Text(_) => PayloadKind::Text,
            Self::Map(_) => PayloadKind::Map,
        }
    }
}

/// Discriminant of [`Payload`], used in type mismatch reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Text,
    Map,
}

impl std::fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Map => write!(f, "map"),
        }
    }
}

// ============================================================================
// Message Types
// ============================================================================

/// A message to be sent through a producer.
///
/// Delivery mode, expiration and message id are stamped by the producer at
/// send time and therefore do not appear here.
#[derive(Debug, Clone)]
pub struct Message {
    pub payload: Payload,
    pub reply_to: Option<Destination>,
    pub correlation_id: Option<String>,
    pub properties: HashMap<String, String>,
}

impl Message {
    /// Create new text message
    pub fn text(body: impl Into<String>) -> Self {
        Self::new(Payload::Text(body.into()))
    }

    /// Create new map message
    pub fn map(body: MapBody) -> Self {
        Self::new(Payload::Map(body))
    }

    fn new(payload: Payload) -> Self {
        Self {
            payload,
            reply_to: None,
            correlation_id: None,
            properties: HashMap::new(),
        }
    }

    /// Attach a reply-to destination
    pub fn with_reply_to(mut self, reply_to: Option<Destination>) -> Self {
        self.reply_to = reply_to;
        self
    }

    /// Add correlation ID for request/response tracking
    pub fn with_correlation_id(mut self, correlation_id: String) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Add a custom property
    pub fn with_property(mut self, key: String, value: String) -> Self {
        self.properties.insert(key, value);
        self
    }
}

/// A message received from a consumer with delivery metadata
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub message_id: MessageId,
    pub payload: Payload,
    pub destination: Destination,
    pub reply_to: Option<Destination>,
    pub correlation_id: Option<String>,
    pub properties: HashMap<String, String>,
    pub delivery_mode: DeliveryMode,
    pub timestamp: Timestamp,
    pub expiration: Option<Timestamp>,
    pub redelivered: bool,
    pub delivery_count: u32,
}

impl ReceivedMessage {
    /// Text body, if this is a text message
    pub fn text(&self) -> Option<&str> {
        match &self.payload {
            Payload::Text(text) => Some(text),
            Payload::Map(_) => None,
        }
    }

    /// Map body, if this is a map message
    pub fn map(&self) -> Option<&MapBody> {
        match &self.payload {
            Payload::Map(map) => Some(map),
            Payload::Text(_) => None,
        }
    }

    pub fn payload_kind(&self) -> PayloadKind {
        self.payload.kind()
    }

    /// Convert back to Message (for forwarding or replying)
    pub fn message(&self) -> Message {
        Message {
            payload: self.payload.clone(),
            reply_to: self.reply_to.clone(),
            correlation_id: self.correlation_id.clone(),
            properties: self.properties.clone(),
        }
    }
}

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;
