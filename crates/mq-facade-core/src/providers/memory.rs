//! In-process broker transport for `vm://` URLs.
//!
//! This module provides a fully functional in-memory broker that:
//! - Delivers queue messages to competing consumers in FIFO order
//! - Fans topic messages out to every current subscription
//! - Retains messages for inactive durable subscriptions
//! - Honours message time-to-live and delivery mode
//! - Tracks client acknowledgement and transactions per session
//! - Deletes temporary destinations when their connection closes
//!
//! Brokers are addressed by the host part of the URL (`vm://localhost`) and
//! are created on first connection unless the URL carries `create=false`.
//! This provider is intended for:
//! - Unit and integration testing of facade consumers
//! - Single-process applications that only need in-process messaging
//! - Reference implementation for networked providers

use crate::destination::{Destination, DestinationKind};
use crate::error::MqError;
use crate::message::{DeliveryMode, Message, MessageId, ReceivedMessage, Timestamp};
use crate::transport::{
    AcknowledgeMode, BrokerUrl, Connection, ConnectionFactory, MessageConsumer, MessageProducer,
    Session, SessionOptions,
};
use async_trait::async_trait;
use chrono::Duration;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use tokio::sync::Notify;
use tracing::{debug, info};

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Internal Storage Structures
// ============================================================================

/// FIFO of messages waiting for one queue or one topic subscription
struct Mailbox {
    messages: Mutex<VecDeque<ReceivedMessage>>,
    available: Notify,
}

impl Mailbox {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            messages: Mutex::new(VecDeque::new()),
            available: Notify::new(),
        })
    }

    fn push(&self, message: ReceivedMessage) {
        lock(&self.messages).push_back(message);
        self.available.notify_one();
    }

    /// Put a message back at the head for redelivery
    fn requeue(&self, message: ReceivedMessage) {
        lock(&self.messages).push_front(message);
        self.available.notify_one();
    }

    /// Pop the first message that has not expired, discarding expired ones
    fn pop_live(&self) -> Option<ReceivedMessage> {
        let now = Timestamp::now();
        let mut messages = lock(&self.messages);
        while let Some(message) = messages.pop_front() {
            if message.expiration.as_ref().is_some_and(|at| now >= *at) {
                debug!(
                    message_id = %message.message_id,
                    destination = %message.destination,
                    "Discarding expired message"
                );
                continue;
            }
            return Some(message);
        }
        None
    }

    async fn receive(&self, timeout: std::time::Duration) -> Option<ReceivedMessage> {
        // No deadline when the timeout is too long to represent.
        let deadline = tokio::time::Instant::now().checked_add(timeout);
        loop {
            if let Some(message) = self.pop_live() {
                return Some(message);
            }
            let Some(deadline) = deadline else {
                self.available.notified().await;
                continue;
            };
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            if tokio::time::timeout_at(deadline, self.available.notified())
                .await
                .is_err()
            {
                return self.pop_live();
            }
        }
    }

    fn len(&self) -> usize {
        lock(&self.messages).len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DurableKey {
    client_id: String,
    subscription: String,
}

struct DurableSubscription {
    topic: String,
    mailbox: Arc<Mailbox>,
    active: bool,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, Arc<Mailbox>>,
    topic_subscribers: HashMap<String, HashMap<u64, Arc<Mailbox>>>,
    durable: HashMap<DurableKey, DurableSubscription>,
    temporaries: HashSet<(DestinationKind, String)>,
    client_ids: HashSet<String>,
}

// ============================================================================
// InMemoryBroker
// ============================================================================

/// A named broker living inside the process
pub struct InMemoryBroker {
    name: String,
    state: Mutex<BrokerState>,
    sequence: AtomicU64,
}

impl InMemoryBroker {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(BrokerState::default()),
            sequence: AtomicU64::new(1),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of messages waiting on a queue (expired ones included until
    /// a receive discards them)
    pub fn queue_depth(&self, queue: &str) -> usize {
        lock(&self.state)
            .queues
            .get(queue)
            .map(|mailbox| mailbox.len())
            .unwrap_or(0)
    }

    /// Number of non-durable subscribers currently attached to a topic
    pub fn subscriber_count(&self, topic: &str) -> usize {
        lock(&self.state)
            .topic_subscribers
            .get(topic)
            .map(HashMap::len)
            .unwrap_or(0)
    }

    pub fn durable_subscription_count(&self) -> usize {
        lock(&self.state).durable.len()
    }

    /// Messages retained for a durable subscription, `None` if it does not exist
    pub fn durable_backlog(&self, client_id: &str, subscription: &str) -> Option<usize> {
        let key = DurableKey {
            client_id: client_id.to_string(),
            subscription: subscription.to_string(),
        };
        lock(&self.state)
            .durable
            .get(&key)
            .map(|durable| durable.mailbox.len())
    }

    /// Whether a temporary destination still exists on the broker
    pub fn has_temporary(&self, destination: &Destination) -> bool {
        lock(&self.state)
            .temporaries
            .contains(&(destination.kind(), destination.name().to_string()))
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    fn queue_mailbox(&self, queue: &str) -> Arc<Mailbox> {
        lock(&self.state)
            .queues
            .entry(queue.to_string())
            .or_insert_with(Mailbox::new)
            .clone()
    }

    fn publish(&self, message: ReceivedMessage) -> Result<(), MqError> {
        let destination = message.destination.clone();
        let name = destination.name().to_string();
        let state = lock(&self.state);

        if destination.is_temporary()
            && !state.temporaries.contains(&(destination.kind(), name.clone()))
        {
            return Err(MqError::illegal_state(format!(
                "temporary destination {} has been deleted",
                destination
            )));
        }

        match destination.kind() {
            DestinationKind::Queue => {
                let mailbox = state.queues.get(&name).cloned();
                drop(state);
                let mailbox = mailbox.unwrap_or_else(|| self.queue_mailbox(&name));
                mailbox.push(message);
            }
            DestinationKind::Topic => {
                let mut targets: Vec<Arc<Mailbox>> = state
                    .topic_subscribers
                    .get(&name)
                    .map(|subscribers| subscribers.values().cloned().collect())
                    .unwrap_or_default();
                targets.extend(
                    state
                        .durable
                        .values()
                        .filter(|durable| durable.topic == name)
                        .map(|durable| durable.mailbox.clone()),
                );
                drop(state);

                if targets.is_empty() {
                    debug!(destination = %destination, "Topic has no subscribers; message dropped");
                }
                for mailbox in targets {
                    mailbox.push(message.clone());
                }
            }
        }

        Ok(())
    }

    fn register_client_id(&self, client_id: &str) -> Result<(), MqError> {
        let mut state = lock(&self.state);
        if !state.client_ids.insert(client_id.to_string()) {
            return Err(MqError::ClientIdConflict {
                client_id: client_id.to_string(),
                broker: self.name.clone(),
            });
        }
        Ok(())
    }

    fn release_client_id(&self, client_id: &str) {
        lock(&self.state).client_ids.remove(client_id);
    }

    fn create_temporary(&self, kind: DestinationKind, connection_id: &str) -> Destination {
        let name = format!("{}:{}", connection_id, self.next_sequence());
        let mut state = lock(&self.state);
        state.temporaries.insert((kind, name.clone()));
        if kind == DestinationKind::Queue {
            state.queues.insert(name.clone(), Mailbox::new());
        }
        Destination::temporary(kind, name)
    }

    fn delete_temporary(&self, destination: &Destination) {
        let name = destination.name();
        let mut state = lock(&self.state);
        state
            .temporaries
            .remove(&(destination.kind(), name.to_string()));
        match destination.kind() {
            DestinationKind::Queue => {
                state.queues.remove(name);
            }
            DestinationKind::Topic => {
                state.topic_subscribers.remove(name);
            }
        }
    }

    fn subscribe_topic(&self, topic: &str) -> (u64, Arc<Mailbox>) {
        let id = self.next_sequence();
        let mailbox = Mailbox::new();
        lock(&self.state)
            .topic_subscribers
            .entry(topic.to_string())
            .or_default()
            .insert(id, mailbox.clone());
        (id, mailbox)
    }

    fn unsubscribe_topic(&self, topic: &str, id: u64) {
        let mut state = lock(&self.state);
        if let Some(subscribers) = state.topic_subscribers.get_mut(topic) {
            subscribers.remove(&id);
            if subscribers.is_empty() {
                state.topic_subscribers.remove(topic);
            }
        }
    }

    fn attach_durable(&self, key: &DurableKey, topic: &str) -> Result<Arc<Mailbox>, MqError> {
        let mut state = lock(&self.state);
        match state.durable.get_mut(key) {
            Some(existing) if existing.active => Err(MqError::illegal_state(format!(
                "durable subscription '{}' for client '{}' already has an active subscriber",
                key.subscription, key.client_id
            ))),
            Some(existing) if existing.topic == topic => {
                existing.active = true;
                Ok(existing.mailbox.clone())
            }
            _ => {
                // A new subscription, or an existing one re-pointed at a
                // different topic, starts with an empty backlog.
                let mailbox = Mailbox::new();
                state.durable.insert(
                    key.clone(),
                    DurableSubscription {
                        topic: topic.to_string(),
                        mailbox: mailbox.clone(),
                        active: true,
                    },
                );
                Ok(mailbox)
            }
        }
    }

    fn detach_durable(&self, key: &DurableKey) {
        if let Some(durable) = lock(&self.state).durable.get_mut(key) {
            durable.active = false;
        }
    }

    fn remove_durable(&self, key: &DurableKey) -> Result<(), MqError> {
        let mut state = lock(&self.state);
        match state.durable.get(key) {
            None => Err(MqError::illegal_state(format!(
                "no durable subscription named '{}' for client '{}'",
                key.subscription, key.client_id
            ))),
            Some(durable) if durable.active => Err(MqError::illegal_state(format!(
                "durable subscription '{}' is still in use",
                key.subscription
            ))),
            Some(_) => {
                state.durable.remove(key);
                Ok(())
            }
        }
    }
}

// ============================================================================
// InMemoryConnectionFactory
// ============================================================================

type BrokerMap = Arc<Mutex<HashMap<String, Arc<InMemoryBroker>>>>;

/// Connection factory for `vm://<broker-name>` URLs
#[derive(Clone, Default)]
pub struct InMemoryConnectionFactory {
    brokers: BrokerMap,
}

impl InMemoryConnectionFactory {
    /// Factory with its own, isolated set of brokers
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory over the process-wide set of brokers, so every facade in the
    /// process that connects to `vm://name` reaches the same broker
    pub fn shared() -> Self {
        static SHARED: OnceLock<BrokerMap> = OnceLock::new();
        Self {
            brokers: SHARED.get_or_init(BrokerMap::default).clone(),
        }
    }

    /// Running broker with the given name
    pub fn broker(&self, name: &str) -> Option<Arc<InMemoryBroker>> {
        lock(&self.brokers).get(name).cloned()
    }
}

#[async_trait]
impl ConnectionFactory for InMemoryConnectionFactory {
    async fn create_connection(&self, url: &BrokerUrl) -> Result<Arc<dyn Connection>, MqError> {
        let create = url
            .option("create")
            .map(|value| value != "false")
            .unwrap_or(true);

        let broker = {
            let mut brokers = lock(&self.brokers);
            match brokers.get(url.host()) {
                Some(broker) => broker.clone(),
                None if create => {
                    info!(broker = url.host(), "Starting in-memory broker");
                    let broker = Arc::new(InMemoryBroker::new(url.host()));
                    brokers.insert(url.host().to_string(), broker.clone());
                    broker
                }
                None => {
                    return Err(MqError::transport(
                        url.as_str(),
                        format!("broker '{}' is not running", url.host()),
                    ));
                }
            }
        };

        let id = format!("ID:{}-{}", broker.name(), uuid::Uuid::new_v4());
        debug!(connection_id = %id, url = %url, "Created in-memory connection");
        Ok(Arc::new(InMemoryConnection {
            shared: Arc::new(ConnectionShared {
                id,
                url: url.as_str().to_string(),
                broker,
                started: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                client_id: Mutex::new(None),
                temporaries: Mutex::new(Vec::new()),
                sessions: Mutex::new(Vec::new()),
            }),
        }))
    }
}

// ============================================================================
// InMemoryConnection
// ============================================================================

struct ConnectionShared {
    id: String,
    url: String,
    broker: Arc<InMemoryBroker>,
    started: AtomicBool,
    closed: AtomicBool,
    client_id: Mutex<Option<String>>,
    temporaries: Mutex<Vec<Destination>>,
    sessions: Mutex<Vec<Arc<SessionShared>>>,
}

impl ConnectionShared {
    fn ensure_open(&self) -> Result<(), MqError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MqError::transport(&self.url, "connection is closed"));
        }
        Ok(())
    }
}

/// Connection to an in-memory broker
pub struct InMemoryConnection {
    shared: Arc<ConnectionShared>,
}

impl InMemoryConnection {
    /// Broker this connection is attached to
    pub fn broker(&self) -> &Arc<InMemoryBroker> {
        &self.shared.broker
    }
}

#[async_trait]
impl Connection for InMemoryConnection {
    fn connection_id(&self) -> &str {
        &self.shared.id
    }

    async fn start(&self) -> Result<(), MqError> {
        self.shared.ensure_open()?;
        self.shared.started.store(true, Ordering::Release);
        Ok(())
    }

    fn is_started(&self) -> bool {
        self.shared.started.load(Ordering::Acquire)
    }

    fn set_client_id(&self, client_id: &str) -> Result<(), MqError> {
        self.shared.ensure_open()?;
        let mut current = lock(&self.shared.client_id);
        match current.as_deref() {
            Some(existing) if existing == client_id => Ok(()),
            Some(existing) => Err(MqError::illegal_state(format!(
                "client id is already set to '{}'",
                existing
            ))),
            None => {
                self.shared.broker.register_client_id(client_id)?;
                *current = Some(client_id.to_string());
                Ok(())
            }
        }
    }

    fn client_id(&self) -> Option<String> {
        lock(&self.shared.client_id).clone()
    }

    async fn create_session(&self, options: SessionOptions) -> Result<Box<dyn Session>, MqError> {
        self.shared.ensure_open()?;
        let session = Arc::new(SessionShared {
            connection: self.shared.clone(),
            options,
            closed: AtomicBool::new(false),
            unacknowledged: Mutex::new(Vec::new()),
            pending_sends: Mutex::new(Vec::new()),
            consumers: Mutex::new(Vec::new()),
        });
        lock(&self.shared.sessions).push(session.clone());
        Ok(Box::new(InMemorySession { shared: session }))
    }

    fn close(&self) -> Result<(), MqError> {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let sessions = std::mem::take(&mut *lock(&self.shared.sessions));
        for session in sessions {
            session.close();
        }

        let temporaries = std::mem::take(&mut *lock(&self.shared.temporaries));
        for destination in &temporaries {
            self.shared.broker.delete_temporary(destination);
        }

        if let Some(client_id) = lock(&self.shared.client_id).take() {
            self.shared.broker.release_client_id(&client_id);
        }

        self.shared.started.store(false, Ordering::Release);
        debug!(connection_id = %self.shared.id, "Closed in-memory connection");
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }
}

// ============================================================================
// InMemorySession
// ============================================================================

struct SessionShared {
    connection: Arc<ConnectionShared>,
    options: SessionOptions,
    closed: AtomicBool,
    unacknowledged: Mutex<Vec<(Arc<Mailbox>, ReceivedMessage)>>,
    pending_sends: Mutex<Vec<ReceivedMessage>>,
    consumers: Mutex<Vec<Arc<ConsumerShared>>>,
}

impl SessionShared {
    fn ensure_open(&self) -> Result<(), MqError> {
        self.connection.ensure_open()?;
        if self.closed.load(Ordering::Acquire) {
            return Err(MqError::illegal_state("session is closed"));
        }
        Ok(())
    }

    fn tracks_deliveries(&self) -> bool {
        self.options.transacted || self.options.acknowledge_mode == AcknowledgeMode::Client
    }

    fn record_delivery(&self, mailbox: &Arc<Mailbox>, message: &ReceivedMessage) {
        if self.tracks_deliveries() {
            lock(&self.unacknowledged).push((mailbox.clone(), message.clone()));
        }
    }

    fn redeliver_unacknowledged(&self) -> usize {
        let unacknowledged = std::mem::take(&mut *lock(&self.unacknowledged));
        let count = unacknowledged.len();
        // Requeue newest first so the head of each mailbox keeps delivery order.
        for (mailbox, message) in unacknowledged.into_iter().rev() {
            mailbox.requeue(message);
        }
        count
    }

    fn dispatch(&self, message: ReceivedMessage) -> Result<(), MqError> {
        if self.options.transacted {
            lock(&self.pending_sends).push(message);
            Ok(())
        } else {
            self.connection.broker.publish(message)
        }
    }

    fn ensure_transacted(&self, operation: &str) -> Result<(), MqError> {
        if !self.options.transacted {
            return Err(MqError::illegal_state(format!(
                "{} requires a transacted session",
                operation
            )));
        }
        Ok(())
    }

    fn durable_key(&self, subscription_name: &str) -> Result<DurableKey, MqError> {
        let client_id = lock(&self.connection.client_id).clone().ok_or_else(|| {
            MqError::illegal_state("a client id must be set on the connection for durable subscriptions")
        })?;
        Ok(DurableKey {
            client_id,
            subscription: subscription_name.to_string(),
        })
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        lock(&self.pending_sends).clear();
        let consumers = std::mem::take(&mut *lock(&self.consumers));
        for consumer in consumers {
            consumer.shutdown();
        }
        let redelivered = self.redeliver_unacknowledged();
        if redelivered > 0 {
            debug!(
                redelivered,
                "Returned unacknowledged messages to the broker on session close"
            );
        }
    }
}

/// Session on an in-memory connection
pub struct InMemorySession {
    shared: Arc<SessionShared>,
}

impl InMemorySession {
    fn register_consumer(
        &self,
        destination: &Destination,
        mailbox: Arc<Mailbox>,
        subscription: Subscription,
    ) -> Box<dyn MessageConsumer> {
        let consumer = Arc::new(ConsumerShared {
            broker: self.shared.connection.broker.clone(),
            subscription,
            closed: AtomicBool::new(false),
        });
        lock(&self.shared.consumers).push(consumer.clone());
        Box::new(InMemoryConsumer {
            session: self.shared.clone(),
            consumer,
            mailbox,
            destination: destination.clone(),
        })
    }
}

#[async_trait]
impl Session for InMemorySession {
    fn options(&self) -> SessionOptions {
        self.shared.options
    }

    async fn create_queue(&self, name: &str) -> Result<Destination, MqError> {
        self.shared.ensure_open()?;
        self.shared.connection.broker.queue_mailbox(name);
        Ok(Destination::new(DestinationKind::Queue, name))
    }

    async fn create_topic(&self, name: &str) -> Result<Destination, MqError> {
        self.shared.ensure_open()?;
        Ok(Destination::new(DestinationKind::Topic, name))
    }

    async fn create_temporary_queue(&self) -> Result<Destination, MqError> {
        self.shared.ensure_open()?;
        let connection = &self.shared.connection;
        let destination = connection
            .broker
            .create_temporary(DestinationKind::Queue, &connection.id);
        lock(&connection.temporaries).push(destination.clone());
        Ok(destination)
    }

    async fn create_temporary_topic(&self) -> Result<Destination, MqError> {
        self.shared.ensure_open()?;
        let connection = &self.shared.connection;
        let destination = connection
            .broker
            .create_temporary(DestinationKind::Topic, &connection.id);
        lock(&connection.temporaries).push(destination.clone());
        Ok(destination)
    }

    async fn create_producer(
        &self,
        destination: &Destination,
    ) -> Result<Box<dyn MessageProducer>, MqError> {
        self.shared.ensure_open()?;
        Ok(Box::new(InMemoryProducer {
            session: self.shared.clone(),
            destination: destination.clone(),
            delivery_mode: Mutex::new(DeliveryMode::Persistent),
            time_to_live: Mutex::new(None),
            closed: AtomicBool::new(false),
        }))
    }

    async fn create_consumer(
        &self,
        destination: &Destination,
    ) -> Result<Box<dyn MessageConsumer>, MqError> {
        self.shared.ensure_open()?;
        let broker = &self.shared.connection.broker;

        if destination.is_temporary() && !broker.has_temporary(destination) {
            return Err(MqError::illegal_state(format!(
                "temporary destination {} has been deleted",
                destination
            )));
        }

        let consumer = match destination.kind() {
            DestinationKind::Queue => {
                let mailbox = broker.queue_mailbox(destination.name());
                self.register_consumer(destination, mailbox, Subscription::Queue)
            }
            DestinationKind::Topic => {
                let (id, mailbox) = broker.subscribe_topic(destination.name());
                let subscription = Subscription::Topic {
                    topic: destination.name().to_string(),
                    id,
                };
                self.register_consumer(destination, mailbox, subscription)
            }
        };
        Ok(consumer)
    }

    async fn create_durable_subscriber(
        &self,
        topic: &Destination,
        subscription_name: &str,
    ) -> Result<Box<dyn MessageConsumer>, MqError> {
        self.shared.ensure_open()?;
        if !topic.is_topic() || topic.is_temporary() {
            return Err(MqError::illegal_state(format!(
                "durable subscriptions require a named topic, got {}",
                topic
            )));
        }

        let key = self.shared.durable_key(subscription_name)?;
        let mailbox = self
            .shared
            .connection
            .broker
            .attach_durable(&key, topic.name())?;
        Ok(self.register_consumer(topic, mailbox, Subscription::Durable(key)))
    }

    async fn unsubscribe(&self, subscription_name: &str) -> Result<(), MqError> {
        self.shared.ensure_open()?;
        let key = self.shared.durable_key(subscription_name)?;
        self.shared.connection.broker.remove_durable(&key)
    }

    async fn acknowledge(&self) -> Result<(), MqError> {
        self.shared.ensure_open()?;
        if !self.shared.options.transacted
            && self.shared.options.acknowledge_mode == AcknowledgeMode::Client
        {
            lock(&self.shared.unacknowledged).clear();
        }
        Ok(())
    }

    async fn recover(&self) -> Result<(), MqError> {
        self.shared.ensure_open()?;
        if self.shared.options.transacted {
            return Err(MqError::illegal_state(
                "recover is not available on a transacted session; use rollback",
            ));
        }
        self.shared.redeliver_unacknowledged();
        Ok(())
    }

    async fn commit(&self) -> Result<(), MqError> {
        self.shared.ensure_open()?;
        self.shared.ensure_transacted("commit")?;
        let pending = std::mem::take(&mut *lock(&self.shared.pending_sends));
        for message in pending {
            self.shared.connection.broker.publish(message)?;
        }
        lock(&self.shared.unacknowledged).clear();
        Ok(())
    }

    async fn rollback(&self) -> Result<(), MqError> {
        self.shared.ensure_open()?;
        self.shared.ensure_transacted("rollback")?;
        lock(&self.shared.pending_sends).clear();
        self.shared.redeliver_unacknowledged();
        Ok(())
    }

    fn close(&self) -> Result<(), MqError> {
        self.shared.close();
        Ok(())
    }
}

// ============================================================================
// InMemoryProducer
// ============================================================================

/// Producer bound to one destination of an in-memory broker
pub struct InMemoryProducer {
    session: Arc<SessionShared>,
    destination: Destination,
    delivery_mode: Mutex<DeliveryMode>,
    time_to_live: Mutex<Option<Duration>>,
    closed: AtomicBool,
}

#[async_trait]
impl MessageProducer for InMemoryProducer {
    fn destination(&self) -> &Destination {
        &self.destination
    }

    fn set_delivery_mode(&self, mode: DeliveryMode) {
        *lock(&self.delivery_mode) = mode;
    }

    fn delivery_mode(&self) -> DeliveryMode {
        *lock(&self.delivery_mode)
    }

    fn set_time_to_live(&self, ttl: Option<Duration>) {
        *lock(&self.time_to_live) = ttl;
    }

    fn time_to_live(&self) -> Option<Duration> {
        *lock(&self.time_to_live)
    }

    async fn send(&self, message: Message) -> Result<MessageId, MqError> {
        self.session.ensure_open()?;
        if self.closed.load(Ordering::Acquire) {
            return Err(MqError::illegal_state("producer is closed"));
        }

        let timestamp = Timestamp::now();
        let expiration = self
            .time_to_live()
            .filter(|ttl| *ttl > Duration::zero())
            // A TTL past the end of the calendar never expires.
            .and_then(|ttl| timestamp.plus(ttl));
        let message_id = MessageId::new();

        self.session.dispatch(ReceivedMessage {
            message_id: message_id.clone(),
            payload: message.payload,
            destination: self.destination.clone(),
            reply_to: message.reply_to,
            correlation_id: message.correlation_id,
            properties: message.properties,
            delivery_mode: self.delivery_mode(),
            timestamp,
            expiration,
            redelivered: false,
            delivery_count: 0,
        })?;

        Ok(message_id)
    }

    fn close(&self) -> Result<(), MqError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

// ============================================================================
// InMemoryConsumer
// ============================================================================

enum Subscription {
    Queue,
    Topic { topic: String, id: u64 },
    Durable(DurableKey),
}

struct ConsumerShared {
    broker: Arc<InMemoryBroker>,
    subscription: Subscription,
    closed: AtomicBool,
}

impl ConsumerShared {
    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        match &self.subscription {
            Subscription::Queue => {}
            Subscription::Topic { topic, id } => self.broker.unsubscribe_topic(topic, *id),
            Subscription::Durable(key) => self.broker.detach_durable(key),
        }
    }
}

/// Consumer bound to a queue, a topic subscription or a durable subscription
pub struct InMemoryConsumer {
    session: Arc<SessionShared>,
    consumer: Arc<ConsumerShared>,
    mailbox: Arc<Mailbox>,
    destination: Destination,
}

#[async_trait]
impl MessageConsumer for InMemoryConsumer {
    fn destination(&self) -> &Destination {
        &self.destination
    }

    async fn receive(&self, timeout: Duration) -> Result<Option<ReceivedMessage>, MqError> {
        self.session.ensure_open()?;
        if self.consumer.closed.load(Ordering::Acquire) {
            return Err(MqError::illegal_state("consumer is closed"));
        }

        let wait = timeout.to_std().unwrap_or_default();
        if !self.session.connection.started.load(Ordering::Acquire) {
            // Nothing is delivered on a connection that has not been started.
            tokio::time::sleep(wait).await;
            return Ok(None);
        }

        match self.mailbox.receive(wait).await {
            Some(mut message) => {
                message.delivery_count += 1;
                message.redelivered = message.delivery_count > 1;
                self.session.record_delivery(&self.mailbox, &message);
                Ok(Some(message))
            }
            None => Ok(None),
        }
    }

    fn close(&self) -> Result<(), MqError> {
        self.consumer.shutdown();
        Ok(())
    }
}
