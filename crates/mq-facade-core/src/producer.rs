//! Producer facade: send text and map messages to a queue or topic.
//!
//! A [`Producer`] owns one session and a cache of message producers keyed by
//! destination. Calling [`Producer::connect`] again with a name already seen
//! re-selects the cached producer instead of creating a new one. The
//! configured persistence is re-applied to whichever producer is selected.

use crate::config::MqConfig;
use crate::connection::ConnectionManager;
use crate::destination::{
    CacheKeyPolicy, Destination, DestinationCache, DestinationKey, DestinationKind,
};
use crate::error::MqError;
use crate::message::{DeliveryMode, MapBody, Message, MessageId};
use crate::release::ReleaseReport;
use crate::transport::{
    AcknowledgeMode, Connection, ConnectionFactory, MessageProducer, Session, SessionOptions,
};
use chrono::Duration;
use std::cell::Cell;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[cfg(test)]
#[path = "producer_tests.rs"]
mod tests;

/// Send-side facade over a broker connection.
///
/// A producer may be moved to another task but not shared between tasks.
pub struct Producer {
    connection: ConnectionManager,
    session: Option<Box<dyn Session>>,
    session_connection: Option<String>,
    destinations: DestinationCache,
    producers: HashMap<DestinationKey, Box<dyn MessageProducer>>,
    active: Option<DestinationKey>,
    persistent: bool,
    default_time_to_live: Option<Duration>,
    reply_to: Option<Destination>,
    use_temporary: bool,
    use_transactions: bool,
    _not_sync: PhantomData<Cell<()>>,
}

impl Producer {
    /// Producer for `url` using the default transports
    pub fn new(url: impl Into<String>) -> Self {
        Self::from_manager(ConnectionManager::new(url))
    }

    /// Producer for `url` using a specific connection factory
    pub fn with_factory(url: impl Into<String>, factory: Arc<dyn ConnectionFactory>) -> Self {
        Self::from_manager(ConnectionManager::with_factory(url, factory))
    }

    /// Producer configured from the `producer` and `destinations` sections
    pub fn from_config(config: &MqConfig) -> Self {
        let mut producer = Self::new(config.broker_url.clone());
        producer.apply_config(config);
        producer
    }

    /// Same as [`Producer::from_config`] with a specific connection factory
    pub fn from_config_with_factory(config: &MqConfig, factory: Arc<dyn ConnectionFactory>) -> Self {
        let mut producer = Self::with_factory(config.broker_url.clone(), factory);
        producer.apply_config(config);
        producer
    }

    fn from_manager(connection: ConnectionManager) -> Self {
        Self {
            connection,
            session: None,
            session_connection: None,
            destinations: DestinationCache::default(),
            producers: HashMap::new(),
            active: None,
            persistent: false,
            default_time_to_live: None,
            reply_to: None,
            use_temporary: false,
            use_transactions: false,
            _not_sync: PhantomData,
        }
    }

    fn apply_config(&mut self, config: &MqConfig) {
        self.persistent = config.producer.persistent;
        self.default_time_to_live = config.producer.time_to_live();
        self.use_temporary = config.producer.use_temporary;
        self.use_transactions = config.producer.use_transactions;
        self.destinations = DestinationCache::new(config.destinations.cache_key_policy);
    }

    // ------------------------------------------------------------------------
    // Connection
    // ------------------------------------------------------------------------

    /// Connect to the broker (once) and select the producer for `(kind, name)`.
    ///
    /// Repeated calls reuse the connection, the session, resolved
    /// destinations and cached producers.
    pub async fn connect(&mut self, kind: DestinationKind, name: &str) -> Result<(), MqError> {
        let connection = self.connection.ensure_connection().await?;
        self.select(connection, kind, name).await
    }

    /// Like [`Producer::connect`] but on a connection owned by the caller.
    ///
    /// The facade never closes that connection. Binding to a different
    /// connection than the current one releases the current producers and
    /// session first.
    pub async fn connect_with_connection(
        &mut self,
        kind: DestinationKind,
        name: &str,
        connection: Arc<dyn Connection>,
    ) -> Result<(), MqError> {
        if !self.connection.is_bound_to(&connection) {
            let released = self.release_session_resources();
            if !released.is_empty() {
                debug!(%released, "Released producer resources before rebinding");
            }
            self.connection.bind_shared(connection.clone()).await?;
        }
        self.select(connection, kind, name).await
    }

    async fn select(
        &mut self,
        connection: Arc<dyn Connection>,
        kind: DestinationKind,
        name: &str,
    ) -> Result<(), MqError> {
        self.discard_stale_session(&connection);
        if self.session.is_none() {
            let options = SessionOptions {
                transacted: self.use_transactions,
                acknowledge_mode: AcknowledgeMode::Auto,
            };
            self.session = Some(connection.create_session(options).await?);
            self.session_connection = Some(connection.connection_id().to_string());
        }
        let session = self
            .session
            .as_deref()
            .ok_or_else(|| MqError::not_connected("connect"))?;

        let destination = self
            .destinations
            .resolve(session, kind, name, self.use_temporary)
            .await?;

        let key = if self.use_temporary {
            DestinationKey::for_destination(self.destinations.policy(), &destination)
        } else {
            self.destinations.key_for(kind, name)
        };

        if self.producers.contains_key(&key) {
            debug!(destination = %destination, "Reusing cached producer");
        } else {
            let producer = session.create_producer(&destination).await?;
            if let Some(ttl) = self.default_time_to_live {
                producer.set_time_to_live(Some(ttl));
            }
            debug!(destination = %destination, "Created producer");
            self.producers.insert(key.clone(), producer);
        }

        if let Some(previous) = self.active.replace(key) {
            self.release_if_temporary(previous);
        }
        self.apply_persistence();
        info!(destination = %destination, persistent = self.persistent, "Producer connected");
        Ok(())
    }

    /// Drop the session and producers if they belong to a connection other
    /// than `connection` (the owned one was closed and has been replaced).
    fn discard_stale_session(&mut self, connection: &Arc<dyn Connection>) {
        let stale = self
            .session_connection
            .as_deref()
            .is_some_and(|id| id != connection.connection_id());
        if stale {
            let released = self.release_session_resources();
            info!(
                connection_id = connection.connection_id(),
                %released,
                "Connection replaced; rebuilding producer session"
            );
        }
    }

    /// Temporary destinations are single use: close the producer of one that
    /// is no longer selected.
    fn release_if_temporary(&mut self, previous: DestinationKey) {
        if self.active.as_ref() == Some(&previous) {
            return;
        }
        let temporary = self
            .producers
            .get(&previous)
            .is_some_and(|producer| producer.destination().is_temporary());
        if !temporary {
            return;
        }
        if let Some(producer) = self.producers.remove(&previous) {
            if let Err(e) = producer.close() {
                warn!(destination = %producer.destination(), error = %e, "Failed to close temporary producer");
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected() && self.active.is_some()
    }

    /// Connection in use, for sharing with other facades
    pub fn connection(&self) -> Option<Arc<dyn Connection>> {
        self.connection.connection()
    }

    /// Destination of the currently selected producer
    pub fn destination(&self) -> Option<&Destination> {
        self.active_producer().map(|producer| producer.destination())
    }

    fn active_producer(&self) -> Option<&dyn MessageProducer> {
        self.active
            .as_ref()
            .and_then(|key| self.producers.get(key))
            .map(|producer| producer.as_ref())
    }

    fn require_producer(&self, operation: &str) -> Result<&dyn MessageProducer, MqError> {
        self.active_producer()
            .ok_or_else(|| MqError::not_connected(operation))
    }

    // ------------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------------

    /// Set the persistence used for later sends. Applied to the selected
    /// producer immediately and to every producer selected afterwards.
    pub fn set_persistence(&mut self, persistent: bool) {
        self.persistent = persistent;
        self.apply_persistence();
    }

    pub fn persistence(&self) -> bool {
        self.persistent
    }

    fn apply_persistence(&self) {
        if let Some(producer) = self.active_producer() {
            producer.set_delivery_mode(DeliveryMode::from_persistent(self.persistent));
        }
    }

    /// Set the time-to-live of the selected producer's later messages.
    /// A zero duration means messages never expire. Does nothing before
    /// the first `connect`.
    pub fn set_ttl(&mut self, ttl: Duration) {
        match self.active_producer() {
            Some(producer) => {
                let ttl = (ttl > Duration::zero()).then_some(ttl);
                producer.set_time_to_live(ttl);
            }
            None => debug!("No active producer; time-to-live not applied"),
        }
    }

    /// Time-to-live of the selected producer
    pub fn ttl(&self) -> Option<Duration> {
        self.active_producer()
            .and_then(|producer| producer.time_to_live())
    }

    /// Default reply-to attached to every message sent without an explicit one
    pub fn set_reply_to(&mut self, reply_to: Option<Destination>) {
        self.reply_to = reply_to;
    }

    pub fn reply_to(&self) -> Option<&Destination> {
        self.reply_to.as_ref()
    }

    /// Send to provider-named temporary destinations. Takes effect on the
    /// next `connect`.
    pub fn set_use_temporary(&mut self, use_temporary: bool) {
        self.use_temporary = use_temporary;
    }

    /// Use a transacted session. Must be set before the first `connect`.
    pub fn set_use_transactions(&mut self, use_transactions: bool) {
        if self.session.is_some() && use_transactions != self.use_transactions {
            warn!("Session already created; transaction setting applies after close");
        }
        self.use_transactions = use_transactions;
    }

    /// Key policy for the destination and producer caches. Must be set before
    /// the first `connect`.
    pub fn set_cache_key_policy(&mut self, policy: CacheKeyPolicy) {
        if !self.destinations.is_empty() {
            warn!("Destinations already resolved; cache key policy not changed");
            return;
        }
        self.destinations = DestinationCache::new(policy);
    }

    // ------------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------------

    /// Send a text message with the default reply-to.
    ///
    /// Empty or absent text sends nothing and is not an error.
    pub async fn send_message<'a>(
        &mut self,
        text: impl Into<Option<&'a str>>,
    ) -> Result<Option<MessageId>, MqError> {
        let reply_to = self.reply_to.clone();
        self.send_text(text.into(), reply_to).await
    }

    /// Send a text message replying to `reply_to` instead of the default.
    pub async fn send_message_with_reply_to<'a>(
        &mut self,
        text: impl Into<Option<&'a str>>,
        reply_to: &Destination,
    ) -> Result<Option<MessageId>, MqError> {
        self.send_text(text.into(), Some(reply_to.clone())).await
    }

    async fn send_text(
        &mut self,
        text: Option<&str>,
        reply_to: Option<Destination>,
    ) -> Result<Option<MessageId>, MqError> {
        let Some(text) = text.filter(|text| !text.is_empty()) else {
            debug!("Ignoring empty message");
            return Ok(None);
        };

        let producer = self.require_producer("send_message")?;
        let message_id = producer
            .send(Message::text(text).with_reply_to(reply_to))
            .await?;
        debug!(message_id = %message_id, destination = %producer.destination(), "Sent text message");
        Ok(Some(message_id))
    }

    /// Send a key-value message with the default reply-to
    pub async fn send_map_message(&mut self, body: MapBody) -> Result<MessageId, MqError> {
        let message = Message::map(body).with_reply_to(self.reply_to.clone());
        let producer = self.require_producer("send_map_message")?;
        let message_id = producer.send(message).await?;
        debug!(message_id = %message_id, destination = %producer.destination(), "Sent map message");
        Ok(message_id)
    }

    /// Send a fully built message as is
    pub async fn send(&mut self, message: Message) -> Result<MessageId, MqError> {
        let producer = self.require_producer("send")?;
        producer.send(message).await
    }

    // ------------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------------

    /// Commit messages sent since the last commit (transacted sessions only)
    pub async fn commit(&mut self) -> Result<(), MqError> {
        let session = self
            .session
            .as_deref()
            .ok_or_else(|| MqError::not_connected("commit"))?;
        session.commit().await
    }

    /// Discard messages sent since the last commit (transacted sessions only)
    pub async fn rollback(&mut self) -> Result<(), MqError> {
        let session = self
            .session
            .as_deref()
            .ok_or_else(|| MqError::not_connected("rollback"))?;
        session.rollback().await
    }

    // ------------------------------------------------------------------------
    // Release
    // ------------------------------------------------------------------------

    /// Close producers, then the session, then the connection (unless it is
    /// shared). Never fails; failures are logged and returned in the report.
    /// Calling `close` again does nothing.
    pub fn close(&mut self) -> ReleaseReport {
        let mut report = self.release_session_resources();
        report.merge(self.connection.close());
        if !report.is_empty() {
            debug!(%report, "Producer closed");
        }
        report
    }

    fn release_session_resources(&mut self) -> ReleaseReport {
        let mut report = ReleaseReport::new();
        self.active = None;
        for (_, producer) in self.producers.drain() {
            report.record(format!("producer {}", producer.destination()), producer.close());
        }
        if let Some(session) = self.session.take() {
            report.record("producer session", session.close());
        }
        self.session_connection = None;
        self.destinations.clear();
        report
    }
}

impl Drop for Producer {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Producer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Producer")
            .field("connection", &self.connection)
            .field("destination", &self.destination())
            .field("producers", &self.producers.len())
            .field("persistent", &self.persistent)
            .field("use_temporary", &self.use_temporary)
            .field("use_transactions", &self.use_transactions)
            .finish()
    }
}
