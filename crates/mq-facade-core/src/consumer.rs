//! Consumer facade: receive messages from a queue, topic or durable
//! subscription.
//!
//! Sessions default to client acknowledgement, so a message is redelivered
//! unless the caller acknowledges it. Receives block for at most the
//! configured timeout and report "nothing available" as `Ok(None)`.

use crate::config::MqConfig;
use crate::connection::ConnectionManager;
use crate::destination::{
    validate_name, CacheKeyPolicy, Destination, DestinationCache, DestinationKind,
};
use crate::error::MqError;
use crate::message::{Payload, PayloadKind, ReceivedMessage};
use crate::release::ReleaseReport;
use crate::transport::{
    AcknowledgeMode, Connection, ConnectionFactory, MessageConsumer, Session, SessionOptions,
};
use chrono::Duration;
use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[cfg(test)]
#[path = "consumer_tests.rs"]
mod tests;

/// Default receive timeout
pub const DEFAULT_RECEIVE_TIMEOUT_MS: i64 = 5000;

/// Receive-side facade over a broker connection.
///
/// A consumer may be moved to another task but not shared between tasks.
pub struct Consumer {
    connection: ConnectionManager,
    session: Option<Box<dyn Session>>,
    session_connection: Option<String>,
    destinations: DestinationCache,
    consumer: Option<Box<dyn MessageConsumer>>,
    durable_subscription: Option<String>,
    timeout: Duration,
    acknowledge_mode: AcknowledgeMode,
    use_transactions: bool,
    use_temporary: bool,
    _not_sync: PhantomData<Cell<()>>,
}

impl Consumer {
    /// Consumer for `url` using the default transports
    pub fn new(url: impl Into<String>) -> Self {
        Self::from_manager(ConnectionManager::new(url))
    }

    /// Consumer for `url` using a specific connection factory
    pub fn with_factory(url: impl Into<String>, factory: Arc<dyn ConnectionFactory>) -> Self {
        Self::from_manager(ConnectionManager::with_factory(url, factory))
    }

    /// Consumer configured from the `consumer` and `destinations` sections
    pub fn from_config(config: &MqConfig) -> Self {
        let mut consumer = Self::new(config.broker_url.clone());
        consumer.apply_config(config);
        consumer
    }

    /// Same as [`Consumer::from_config`] with a specific connection factory
    pub fn from_config_with_factory(config: &MqConfig, factory: Arc<dyn ConnectionFactory>) -> Self {
        let mut consumer = Self::with_factory(config.broker_url.clone(), factory);
        consumer.apply_config(config);
        consumer
    }

    fn from_manager(connection: ConnectionManager) -> Self {
        Self {
            connection,
            session: None,
            session_connection: None,
            destinations: DestinationCache::default(),
            consumer: None,
            durable_subscription: None,
            timeout: Duration::milliseconds(DEFAULT_RECEIVE_TIMEOUT_MS),
            acknowledge_mode: AcknowledgeMode::Client,
            use_transactions: false,
            use_temporary: false,
            _not_sync: PhantomData,
        }
    }

    fn apply_config(&mut self, config: &MqConfig) {
        self.set_timeout(config.consumer.receive_timeout());
        self.acknowledge_mode = config.consumer.acknowledge_mode;
        self.use_transactions = config.consumer.use_transactions;
        self.use_temporary = config.consumer.use_temporary;
        self.destinations = DestinationCache::new(config.destinations.cache_key_policy);
    }

    // ------------------------------------------------------------------------
    // Connection
    // ------------------------------------------------------------------------

    /// Connect to the broker (once) and consume from `(kind, name)`.
    ///
    /// Reconnecting to the destination already consumed from keeps the
    /// existing consumer; any other destination replaces it.
    pub async fn connect(&mut self, kind: DestinationKind, name: &str) -> Result<(), MqError> {
        let connection = self.connection.ensure_connection().await?;
        self.bind(connection, kind, name).await
    }

    /// Like [`Consumer::connect`] but on a connection owned by the caller,
    /// which this facade never closes.
    pub async fn connect_with_connection(
        &mut self,
        kind: DestinationKind,
        name: &str,
        connection: Arc<dyn Connection>,
    ) -> Result<(), MqError> {
        if !self.connection.is_bound_to(&connection) {
            let released = self.release_session_resources();
            if !released.is_empty() {
                debug!(%released, "Released consumer resources before rebinding");
            }
            self.connection.bind_shared(connection.clone()).await?;
        }
        self.bind(connection, kind, name).await
    }

    /// Subscribe durably to `topic` as `subscription_name` under `client_id`.
    ///
    /// Messages published while no subscriber is attached are kept by the
    /// broker and delivered on the next durable connect. The topic is not
    /// taken from or added to the destination cache.
    pub async fn connect_durable(
        &mut self,
        topic: &str,
        client_id: &str,
        subscription_name: &str,
    ) -> Result<(), MqError> {
        validate_name(topic)?;
        let connection = self.connection.ensure_connection().await?;
        connection.set_client_id(client_id)?;
        self.ensure_session(&connection).await?;

        self.release_consumer();
        let session = self
            .session
            .as_deref()
            .ok_or_else(|| MqError::not_connected("connect_durable"))?;
        let destination = session.create_topic(topic).await?;
        let consumer = session
            .create_durable_subscriber(&destination, subscription_name)
            .await?;

        info!(
            destination = %destination,
            client_id,
            subscription = subscription_name,
            "Durable subscriber connected"
        );
        self.consumer = Some(consumer);
        self.durable_subscription = Some(subscription_name.to_string());
        Ok(())
    }

    /// Remove a durable subscription of this consumer's client id.
    ///
    /// If this consumer is currently attached to that subscription it is
    /// detached first.
    pub async fn unsubscribe(&mut self, subscription_name: &str) -> Result<(), MqError> {
        if self.durable_subscription.as_deref() == Some(subscription_name) {
            self.release_consumer();
        }
        let session = self
            .session
            .as_deref()
            .ok_or_else(|| MqError::not_connected("unsubscribe"))?;
        session.unsubscribe(subscription_name).await?;
        info!(subscription = subscription_name, "Durable subscription removed");
        Ok(())
    }

    async fn ensure_session(&mut self, connection: &Arc<dyn Connection>) -> Result<(), MqError> {
        let stale = self
            .session_connection
            .as_deref()
            .is_some_and(|id| id != connection.connection_id());
        if stale {
            let released = self.release_session_resources();
            info!(
                connection_id = connection.connection_id(),
                %released,
                "Connection replaced; rebuilding consumer session"
            );
        }

        if self.session.is_none() {
            let options = SessionOptions {
                transacted: self.use_transactions,
                acknowledge_mode: self.acknowledge_mode,
            };
            self.session = Some(connection.create_session(options).await?);
            self.session_connection = Some(connection.connection_id().to_string());
        }
        Ok(())
    }

    async fn bind(
        &mut self,
        connection: Arc<dyn Connection>,
        kind: DestinationKind,
        name: &str,
    ) -> Result<(), MqError> {
        self.ensure_session(&connection).await?;
        let session = self
            .session
            .as_deref()
            .ok_or_else(|| MqError::not_connected("connect"))?;

        let destination = self
            .destinations
            .resolve(session, kind, name, self.use_temporary)
            .await?;

        let reusable = self.durable_subscription.is_none()
            && self
                .consumer
                .as_ref()
                .is_some_and(|current| current.destination() == &destination);
        if reusable {
            debug!(destination = %destination, "Reusing consumer");
            return Ok(());
        }

        let consumer = session.create_consumer(&destination).await?;
        self.release_consumer();
        info!(destination = %destination, "Consumer connected");
        self.consumer = Some(consumer);
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected() && self.consumer.is_some()
    }

    /// Connection in use, for sharing with other facades
    pub fn connection(&self) -> Option<Arc<dyn Connection>> {
        self.connection.connection()
    }

    /// Destination currently consumed from
    pub fn destination(&self) -> Option<&Destination> {
        self.consumer.as_ref().map(|consumer| consumer.destination())
    }

    /// Name of the durable subscription currently attached, if any
    pub fn durable_subscription(&self) -> Option<&str> {
        self.durable_subscription.as_deref()
    }

    /// Options of the session, once created
    pub fn session_options(&self) -> Option<SessionOptions> {
        self.session.as_ref().map(|session| session.options())
    }

    // ------------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------------

    /// How long a receive waits for a message. Zero polls once.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout.max(Duration::zero());
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Use a transacted session. Must be set before the first `connect`.
    pub fn set_use_transactions(&mut self, use_transactions: bool) {
        if self.session.is_some() && use_transactions != self.use_transactions {
            warn!("Session already created; transaction setting applies after close");
        }
        self.use_transactions = use_transactions;
    }

    /// Consume from provider-named temporary destinations. Takes effect on
    /// the next `connect`.
    pub fn set_use_temporary(&mut self, use_temporary: bool) {
        self.use_temporary = use_temporary;
    }

    /// Acknowledgement mode of the session. Must be set before the first
    /// `connect`.
    pub fn set_acknowledge_mode(&mut self, mode: AcknowledgeMode) {
        if self.session.is_some() && mode != self.acknowledge_mode {
            warn!("Session already created; acknowledge mode applies after close");
        }
        self.acknowledge_mode = mode;
    }

    pub fn acknowledge_mode(&self) -> AcknowledgeMode {
        self.acknowledge_mode
    }

    /// Key policy for the destination cache. Must be set before the first
    /// `connect`.
    pub fn set_cache_key_policy(&mut self, policy: CacheKeyPolicy) {
        if !self.destinations.is_empty() {
            warn!("Destinations already resolved; cache key policy not changed");
            return;
        }
        self.destinations = DestinationCache::new(policy);
    }

    // ------------------------------------------------------------------------
    // Receiving
    // ------------------------------------------------------------------------

    /// Wait up to the timeout for the next message of any payload type
    pub async fn receive(&mut self) -> Result<Option<ReceivedMessage>, MqError> {
        let consumer = self
            .consumer
            .as_deref()
            .ok_or_else(|| MqError::not_connected("receive"))?;
        consumer.receive(self.timeout).await
    }

    /// Wait up to the timeout for a text message.
    ///
    /// A non-text message fails with [`MqError::TypeMismatch`], which carries
    /// the message so it is not lost.
    pub async fn get_text_message(&mut self) -> Result<Option<String>, MqError> {
        let Some(message) = self.receive().await? else {
            return Ok(None);
        };

        match message.payload {
            Payload::Text(text) => Ok(Some(text)),
            Payload::Map(_) => Err(MqError::TypeMismatch {
                expected: PayloadKind::Text,
                actual: PayloadKind::Map,
                message: Box::new(message),
            }),
        }
    }

    /// Wait up to the timeout for a message and return it unchecked; read
    /// its key-value body with [`ReceivedMessage::map`].
    pub async fn get_map_message(&mut self) -> Result<Option<ReceivedMessage>, MqError> {
        self.receive().await
    }

    // ------------------------------------------------------------------------
    // Acknowledgement and transactions
    // ------------------------------------------------------------------------

    fn require_session(&self, operation: &str) -> Result<&dyn Session, MqError> {
        self.session
            .as_deref()
            .ok_or_else(|| MqError::not_connected(operation))
    }

    /// Acknowledge every message received so far (client acknowledgement)
    pub async fn acknowledge(&mut self) -> Result<(), MqError> {
        let session = self.require_session("acknowledge")?;
        session.acknowledge().await
    }

    /// Redeliver every unacknowledged message
    pub async fn recover(&mut self) -> Result<(), MqError> {
        let session = self.require_session("recover")?;
        session.recover().await
    }

    pub async fn commit(&mut self) -> Result<(), MqError> {
        let session = self.require_session("commit")?;
        session.commit().await
    }

    pub async fn rollback(&mut self) -> Result<(), MqError> {
        let session = self.require_session("rollback")?;
        session.rollback().await
    }

    // ------------------------------------------------------------------------
    // Release
    // ------------------------------------------------------------------------

    /// Close the consumer, then the session, then the connection (unless it
    /// is shared). Never fails; failures are logged and returned in the
    /// report. Calling `close` again does nothing.
    pub fn close(&mut self) -> ReleaseReport {
        let mut report = self.release_session_resources();
        report.merge(self.connection.close());
        if !report.is_empty() {
            debug!(%report, "Consumer closed");
        }
        report
    }

    fn release_consumer(&mut self) -> ReleaseReport {
        let mut report = ReleaseReport::new();
        if let Some(consumer) = self.consumer.take() {
            report.record(format!("consumer {}", consumer.destination()), consumer.close());
        }
        self.durable_subscription = None;
        report
    }

    fn release_session_resources(&mut self) -> ReleaseReport {
        let mut report = self.release_consumer();
        if let Some(session) = self.session.take() {
            report.record("consumer session", session.close());
        }
        self.session_connection = None;
        self.destinations.clear();
        report
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("connection", &self.connection)
            .field("destination", &self.destination())
            .field("durable_subscription", &self.durable_subscription)
            .field("timeout_ms", &self.timeout.num_milliseconds())
            .field("acknowledge_mode", &self.acknowledge_mode)
            .field("use_transactions", &self.use_transactions)
            .finish()
    }
}
