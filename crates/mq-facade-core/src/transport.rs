//! Transport traits consumed by the producer and consumer facades.
//!
//! The broker wire protocol is supplied by a provider implementing these
//! traits. Creation, send and receive are async; release operations are
//! synchronous so they can run from `Drop`.

use crate::destination::Destination;
use crate::error::MqError;
use crate::message::{DeliveryMode, Message, MessageId, ReceivedMessage};
use crate::providers::InMemoryConnectionFactory;
use async_trait::async_trait;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use url::Url;

#[cfg(test)]
#[path = "transport_tests.rs"]
mod tests;

// ============================================================================
// Session Options
// ============================================================================

/// How messages consumed by a session are acknowledged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcknowledgeMode {
    /// Acknowledged as soon as `receive` returns
    Auto,
    /// Acknowledged explicitly by the caller after processing
    Client,
}

/// Options fixed at session creation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    pub transacted: bool,
    pub acknowledge_mode: AcknowledgeMode,
}

impl SessionOptions {
    /// Non-transacted, auto-acknowledge session (producer default)
    pub fn auto_acknowledge() -> Self {
        Self {
            transacted: false,
            acknowledge_mode: AcknowledgeMode::Auto,
        }
    }

    /// Non-transacted, client-acknowledge session (consumer default)
    pub fn client_acknowledge() -> Self {
        Self {
            transacted: false,
            acknowledge_mode: AcknowledgeMode::Client,
        }
    }
}

// ============================================================================
// Broker URL
// ============================================================================

/// Parsed broker URL such as `vm://localhost?broker.persistent=false`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerUrl {
    raw: String,
    url: Url,
}

impl BrokerUrl {
    /// Parse a broker URL. A malformed URL is a transport failure.
    pub fn parse(raw: &str) -> Result<Self, MqError> {
        let url = Url::parse(raw)
            .map_err(|e| MqError::transport(raw, format!("malformed broker URL: {}", e)))?;

        if url.host_str().map(str::is_empty).unwrap_or(true) {
            return Err(MqError::transport(raw, "broker URL has no host"));
        }

        Ok(Self {
            raw: raw.to_string(),
            url,
        })
    }

    pub fn scheme(&self) -> &str {
        self.url.scheme()
    }

    /// Host part; for `vm://` URLs this names the in-process broker
    pub fn host(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }

    pub fn port(&self) -> Option<u16> {
        self.url.port()
    }

    /// Query parameters as a map (last value wins)
    pub fn options(&self) -> HashMap<String, String> {
        self.url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect()
    }

    pub fn option(&self, key: &str) -> Option<String> {
        self.url
            .query_pairs()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl std::fmt::Display for BrokerUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.raw)
    }
}

// ============================================================================
// Transport Traits
// ============================================================================

/// Creates broker connections for a URL
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Establish a new, not yet started, connection
    async fn create_connection(&self, url: &BrokerUrl) -> Result<Arc<dyn Connection>, MqError>;
}

/// An established link to the broker, shareable between facades
#[async_trait]
pub trait Connection: Send + Sync {
    /// Provider-assigned identifier
    fn connection_id(&self) -> &str;

    /// Begin delivery of messages to consumers created from this connection
    async fn start(&self) -> Result<(), MqError>;

    fn is_started(&self) -> bool;

    /// Set the client identifier used for durable subscriptions
    fn set_client_id(&self, client_id: &str) -> Result<(), MqError>;

    fn client_id(&self) -> Option<String>;

    async fn create_session(&self, options: SessionOptions) -> Result<Box<dyn Session>, MqError>;

    /// Close the connection. Closing twice is not an error.
    fn close(&self) -> Result<(), MqError>;

    fn is_closed(&self) -> bool;
}

/// Single-threaded context for producing and consuming messages
#[async_trait]
pub trait Session: Send + Sync {
    fn options(&self) -> SessionOptions;

    async fn create_queue(&self, name: &str) -> Result<Destination, MqError>;

    async fn create_topic(&self, name: &str) -> Result<Destination, MqError>;

    async fn create_temporary_queue(&self) -> Result<Destination, MqError>;

    async fn create_temporary_topic(&self) -> Result<Destination, MqError>;

    async fn create_producer(
        &self,
        destination: &Destination,
    ) -> Result<Box<dyn MessageProducer>, MqError>;

    async fn create_consumer(
        &self,
        destination: &Destination,
    ) -> Result<Box<dyn MessageConsumer>, MqError>;

    /// Create a named durable subscriber on a topic. Requires a client id
    /// on the owning connection.
    async fn create_durable_subscriber(
        &self,
        topic: &Destination,
        subscription_name: &str,
    ) -> Result<Box<dyn MessageConsumer>, MqError>;

    /// Remove a durable subscription and its retained messages
    async fn unsubscribe(&self, subscription_name: &str) -> Result<(), MqError>;

    /// Acknowledge every message consumed by this session so far
    async fn acknowledge(&self) -> Result<(), MqError>;

    /// Redeliver every unacknowledged message consumed by this session
    async fn recover(&self) -> Result<(), MqError>;

    async fn commit(&self) -> Result<(), MqError>;

    async fn rollback(&self) -> Result<(), MqError>;

    fn close(&self) -> Result<(), MqError>;
}

/// Sends messages to one destination
#[async_trait]
pub trait MessageProducer: Send + Sync {
    fn destination(&self) -> &Destination;

    fn set_delivery_mode(&self, mode: DeliveryMode);

    fn delivery_mode(&self) -> DeliveryMode;

    /// `None` means messages never expire
    fn set_time_to_live(&self, ttl: Option<Duration>);

    fn time_to_live(&self) -> Option<Duration>;

    /// Stamp delivery mode and expiration onto `message` and send it
    async fn send(&self, message: Message) -> Result<MessageId, MqError>;

    fn close(&self) -> Result<(), MqError>;
}

/// Receives messages from one destination or durable subscription
#[async_trait]
pub trait MessageConsumer: Send + Sync {
    fn destination(&self) -> &Destination;

    /// Wait up to `timeout` for a message. A zero timeout polls once.
    async fn receive(&self, timeout: Duration) -> Result<Option<ReceivedMessage>, MqError>;

    fn close(&self) -> Result<(), MqError>;
}

// ============================================================================
// Transport Registry
// ============================================================================

/// Routes broker URLs to connection factories by scheme
#[derive(Clone)]
pub struct TransportRegistry {
    factories: HashMap<String, Arc<dyn ConnectionFactory>>,
}

impl TransportRegistry {
    /// Registry without any transports
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry with the in-process `vm` transport
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register("vm", Arc::new(InMemoryConnectionFactory::shared()));
        registry
    }

    /// Register (or replace) the factory for a URL scheme
    pub fn register(&mut self, scheme: &str, factory: Arc<dyn ConnectionFactory>) {
        self.factories.insert(scheme.to_ascii_lowercase(), factory);
    }

    pub fn supports(&self, scheme: &str) -> bool {
        self.factories.contains_key(&scheme.to_ascii_lowercase())
    }

    /// Schemes with a registered factory, sorted
    pub fn schemes(&self) -> Vec<String> {
        let mut schemes: Vec<String> = self.factories.keys().cloned().collect();
        schemes.sort();
        schemes
    }
}

impl Default for TransportRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[async_trait]
impl ConnectionFactory for TransportRegistry {
    async fn create_connection(&self, url: &BrokerUrl) -> Result<Arc<dyn Connection>, MqError> {
        let factory = self.factories.get(url.scheme()).ok_or_else(|| {
            MqError::transport(
                url.as_str(),
                format!("no transport registered for scheme '{}'", url.scheme()),
            )
        })?;
        factory.create_connection(url).await
    }
}
