//! Destination handles and the per-facade destination cache.
//!
//! A logical `(kind, name)` pair resolves to exactly one [`Destination`] for
//! the lifetime of the owning session. The first lookup asks the session to
//! create the destination, later lookups return the cached handle.
//! Temporary destinations are provider-named and single-use, so they are
//! never cached under the requested logical name.

use crate::error::{MqError, ValidationError};
use crate::transport::Session;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

#[cfg(test)]
#[path = "destination_tests.rs"]
mod tests;

// ============================================================================
// Destination Kind
// ============================================================================

/// Delivery semantics of a destination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DestinationKind {
    /// Point-to-point, each message is delivered to one consumer
    Queue,
    /// Publish/subscribe, each subscriber receives every message
    Topic,
}

impl std::fmt::Display for DestinationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queue => write!(f, "queue"),
            Self::Topic => write!(f, "topic"),
        }
    }
}

impl FromStr for DestinationKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "queue" => Ok(Self::Queue),
            "topic" => Ok(Self::Topic),
            other => Err(ValidationError::InvalidFormat {
                field: "destination_kind".to_string(),
                message: format!("'{}' is neither 'queue' nor 'topic'", other),
            }),
        }
    }
}

// ============================================================================
// Destination
// ============================================================================

#[derive(Debug)]
struct DestinationInner {
    kind: DestinationKind,
    name: String,
    temporary: bool,
}

/// Handle to an addressable queue or topic on the broker.
///
/// Cloning is cheap and preserves identity: [`Destination::is_same`] is true
/// for clones of the same handle. Equality compares kind and name, so a
/// reply-to destination that travelled through the broker compares equal to
/// the handle it was created from.
#[derive(Debug, Clone)]
pub struct Destination(Arc<DestinationInner>);

impl Destination {
    /// Create a named destination handle
    pub fn new(kind: DestinationKind, name: impl Into<String>) -> Self {
        Self(Arc::new(DestinationInner {
            kind,
            name: name.into(),
            temporary: false,
        }))
    }

    /// Create a temporary destination handle with a provider-generated name
    pub fn temporary(kind: DestinationKind, generated_name: impl Into<String>) -> Self {
        Self(Arc::new(DestinationInner {
            kind,
            name: generated_name.into(),
            temporary: true,
        }))
    }

    pub fn kind(&self) -> DestinationKind {
        self.0.kind
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn is_temporary(&self) -> bool {
        self.0.temporary
    }

    pub fn is_queue(&self) -> bool {
        self.0.kind == DestinationKind::Queue
    }

    pub fn is_topic(&self) -> bool {
        self.0.kind == DestinationKind::Topic
    }

    /// True when both handles are the same resolved object
    pub fn is_same(&self, other: &Destination) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl PartialEq for Destination {
    fn eq(&self, other: &Self) -> bool {
        self.0.kind == other.0.kind && self.0.name == other.0.name
    }
}

impl Eq for Destination {}

impl std::hash::Hash for Destination {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.kind.hash(state);
        self.0.name.hash(state);
    }
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.0.kind, self.0.temporary) {
            (DestinationKind::Queue, false) => write!(f, "queue://{}", self.0.name),
            (DestinationKind::Topic, false) => write!(f, "topic://{}", self.0.name),
            (DestinationKind::Queue, true) => write!(f, "temp-queue://{}", self.0.name),
            (DestinationKind::Topic, true) => write!(f, "temp-topic://{}", self.0.name),
        }
    }
}

/// Validate a logical destination name
pub fn validate_name(name: &str) -> Result<(), ValidationError> {
    if name.trim().is_empty() {
        return Err(ValidationError::Required {
            field: "destination_name".to_string(),
        });
    }

    if name.len() > 255 {
        return Err(ValidationError::OutOfRange {
            field: "destination_name".to_string(),
            message: "maximum 255 characters".to_string(),
        });
    }

    if name.chars().any(|c| c.is_control() || c.is_whitespace()) {
        return Err(ValidationError::InvalidFormat {
            field: "destination_name".to_string(),
            message: "whitespace and control characters are not allowed".to_string(),
        });
    }

    Ok(())
}

// ============================================================================
// Destination Cache
// ============================================================================

/// How cached destinations (and producers) are keyed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheKeyPolicy {
    /// A queue and a topic with the same name are distinct entries
    #[default]
    KindAndName,
    /// Lookup by name only; the first kind resolved for a name wins
    NameOnly,
}

/// Key under which a destination or producer is cached
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DestinationKey {
    kind: Option<DestinationKind>,
    name: String,
}

impl DestinationKey {
    /// Build the key for `(kind, name)` under `policy`
    pub fn new(policy: CacheKeyPolicy, kind: DestinationKind, name: &str) -> Self {
        let kind = match policy {
            CacheKeyPolicy::KindAndName => Some(kind),
            CacheKeyPolicy::NameOnly => None,
        };
        Self {
            kind,
            name: name.to_string(),
        }
    }

    /// Key for an already resolved destination (e.g. a temporary one)
    pub fn for_destination(policy: CacheKeyPolicy, destination: &Destination) -> Self {
        Self::new(policy, destination.kind(), destination.name())
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Instance-scoped mapping from logical destination name to resolved handle
#[derive(Debug, Default)]
pub struct DestinationCache {
    policy: CacheKeyPolicy,
    entries: HashMap<DestinationKey, Destination>,
}

impl DestinationCache {
    pub fn new(policy: CacheKeyPolicy) -> Self {
        Self {
            policy,
            entries: HashMap::new(),
        }
    }

    pub fn policy(&self) -> CacheKeyPolicy {
        self.policy
    }

    /// Cache key for `(kind, name)` under this cache's policy
    pub fn key_for(&self, kind: DestinationKind, name: &str) -> DestinationKey {
        DestinationKey::new(self.policy, kind, name)
    }

    /// Cached destination for `(kind, name)`, if any
    pub fn get(&self, kind: DestinationKind, name: &str) -> Option<&Destination> {
        self.entries.get(&self.key_for(kind, name))
    }

    /// Resolve `(kind, name)` to a destination, creating it through `session`
    /// on a cache miss.
    ///
    /// With `temporary` set, a fresh provider-named temporary destination of
    /// the requested kind is created on every call and nothing is cached.
    pub async fn resolve(
        &mut self,
        session: &dyn Session,
        kind: DestinationKind,
        name: &str,
        temporary: bool,
    ) -> Result<Destination, MqError> {
        if temporary {
            let destination = match kind {
                DestinationKind::Queue => session.create_temporary_queue().await?,
                DestinationKind::Topic => session.create_temporary_topic().await?,
            };
            debug!(requested = name, destination = %destination, "Created temporary destination");
            return Ok(destination);
        }

        validate_name(name)?;

        let key = self.key_for(kind, name);
        if let Some(existing) = self.entries.get(&key) {
            return Ok(existing.clone());
        }

        let destination = match kind {
            DestinationKind::Queue => session.create_queue(name).await?,
            DestinationKind::Topic => session.create_topic(name).await?,
        };
        debug!(destination = %destination, "Resolved destination");
        self.entries.insert(key, destination.clone());
        Ok(destination)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Forget every cached destination (used when the owning session is released)
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
