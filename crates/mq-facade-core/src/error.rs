//! Error types for broker facade operations.

use crate::message::{PayloadKind, ReceivedMessage};
use chrono::Duration;
use thiserror::Error;

/// Comprehensive error type for all facade and transport operations
#[derive(Debug, Error)]
pub enum MqError {
    /// Connection, session or destination creation failed. Fatal to the
    /// calling operation.
    #[error("Transport failure ({url}): {message}")]
    Transport { url: String, message: String },

    /// Operation attempted before `connect`
    #[error("Operation '{operation}' requires a connected facade")]
    NotConnected { operation: String },

    /// A message arrived whose payload does not match the requested accessor.
    ///
    /// The message is handed back inside the error so it is never lost.
    #[error("Expected a {expected} message but received a {actual} message ({})", message.message_id)]
    TypeMismatch {
        expected: PayloadKind,
        actual: PayloadKind,
        message: Box<ReceivedMessage>,
    },

    /// Releasing a resource failed. Never surfaced by `close`, only recorded
    /// in a release report.
    #[error("Failed to release {resource}: {message}")]
    ResourceRelease { resource: String, message: String },

    /// Operation not allowed in the resource's current state (closed,
    /// not transacted, subscription still active, ...)
    #[error("Illegal state: {message}")]
    IllegalState { message: String },

    #[error("Client id '{client_id}' is already in use on broker '{broker}'")]
    ClientIdConflict { client_id: String, broker: String },

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

impl MqError {
    /// Build a transport error for the given broker URL
    pub fn transport(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            url: url.into(),
            message: message.into(),
        }
    }

    /// Build a not-connected error for the named operation
    pub fn not_connected(operation: impl Into<String>) -> Self {
        Self::NotConnected {
            operation: operation.into(),
        }
    }

    /// Build an illegal-state error
    pub fn illegal_state(message: impl Into<String>) -> Self {
        Self::IllegalState {
            message: message.into(),
        }
    }

    /// Check if error is transient and the operation may succeed when retried
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport { .. } => true,
            Self::NotConnected { .. } => false,
            Self::TypeMismatch { .. } => false,
            Self::ResourceRelease { .. } => false,
            Self::IllegalState { .. } => false,
            Self::ClientIdConflict { .. } => true,
            Self::Configuration(_) => false,
            Self::Validation(_) => false,
        }
    }

    /// Get suggested retry delay
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Transport { .. } => Some(Duration::seconds(5)),
            Self::ClientIdConflict { .. } => Some(Duration::seconds(1)),
            _ => None,
        }
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required configuration: {key}")]
    Missing { key: String },

    #[error("Configuration parsing failed: {message}")]
    Parsing { message: String },
}

/// Validation errors
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    Required { field: String },

    #[error("Invalid format for {field}: {message}")]
    InvalidFormat { field: String, message: String },

    #[error("Value out of range for {field}: {message}")]
    OutOfRange { field: String, message: String },
}

/// Render an error and its chain of sources on a single line.
pub fn error_chain(error: &(dyn std::error::Error + 'static)) -> String {
    let mut rendered = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        rendered.push_str(": ");
        rendered.push_str(&cause.to_string());
        source = cause.source();
    }
    rendered
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
