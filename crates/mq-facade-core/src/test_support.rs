//! Instrumented transport wrappers for unit tests.
//!
//! [`RecordingFactory`] wraps the in-memory transport, counts what the
//! facades create and can be told to fail individual release steps.

use crate::destination::Destination;
use crate::error::MqError;
use crate::message::{DeliveryMode, Message, MessageId, ReceivedMessage};
use crate::providers::InMemoryConnectionFactory;
use crate::transport::{
    BrokerUrl, Connection, ConnectionFactory, MessageConsumer, MessageProducer, Session,
    SessionOptions,
};
use async_trait::async_trait;
use chrono::Duration;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Broker URL naming a broker no other test uses
pub(crate) fn unique_url() -> String {
    format!(
        "vm://test-{}?broker.persistent=false",
        uuid::Uuid::new_v4().simple()
    )
}

/// Switches and counters shared by every wrapper of one factory
#[derive(Default)]
pub(crate) struct Counters {
    pub fail_connection_close: AtomicBool,
    pub fail_session_close: AtomicBool,
    pub fail_producer_close: AtomicBool,
    pub fail_consumer_close: AtomicBool,
    pub fail_start: AtomicBool,
    pub connections_created: AtomicUsize,
    pub sessions_created: AtomicUsize,
    pub destinations_created: AtomicUsize,
    pub producers_created: AtomicUsize,
    pub consumers_created: AtomicUsize,
    released: Mutex<Vec<String>>,
}

impl Counters {
    pub fn set(flag: &AtomicBool) {
        flag.store(true, Ordering::SeqCst);
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    /// Kinds of resources closed, in close order
    pub fn released(&self) -> Vec<String> {
        self.released
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    fn release(&self, resource: &str, fail: &AtomicBool) -> Result<(), MqError> {
        self.released
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(resource.to_string());
        if fail.load(Ordering::SeqCst) {
            return Err(MqError::illegal_state(format!("{} close refused", resource)));
        }
        Ok(())
    }
}

pub(crate) struct RecordingFactory {
    inner: InMemoryConnectionFactory,
    pub counters: Arc<Counters>,
}

impl RecordingFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: InMemoryConnectionFactory::new(),
            counters: Arc::new(Counters::default()),
        })
    }
}

#[async_trait]
impl ConnectionFactory for RecordingFactory {
    async fn create_connection(&self, url: &BrokerUrl) -> Result<Arc<dyn Connection>, MqError> {
        let inner = self.inner.create_connection(url).await?;
        self.counters.connections_created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(RecordingConnection {
            inner,
            counters: self.counters.clone(),
        }))
    }
}

struct RecordingConnection {
    inner: Arc<dyn Connection>,
    counters: Arc<Counters>,
}

#[async_trait]
impl Connection for RecordingConnection {
    fn connection_id(&self) -> &str {
        self.inner.connection_id()
    }

    async fn start(&self) -> Result<(), MqError> {
        if self.counters.fail_start.load(Ordering::SeqCst) {
            return Err(MqError::transport("vm://recording", "start refused"));
        }
        self.inner.start().await
    }

    fn is_started(&self) -> bool {
        self.inner.is_started()
    }

    fn set_client_id(&self, client_id: &str) -> Result<(), MqError> {
        self.inner.set_client_id(client_id)
    }

    fn client_id(&self) -> Option<String> {
        self.inner.client_id()
    }

    async fn create_session(&self, options: SessionOptions) -> Result<Box<dyn Session>, MqError> {
        let inner = self.inner.create_session(options).await?;
        self.counters.sessions_created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(RecordingSession {
            inner,
            counters: self.counters.clone(),
        }))
    }

    fn close(&self) -> Result<(), MqError> {
        let inner = self.inner.close();
        self.counters
            .release("connection", &self.counters.fail_connection_close)
            .and(inner)
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

struct RecordingSession {
    inner: Box<dyn Session>,
    counters: Arc<Counters>,
}

#[async_trait]
impl Session for RecordingSession {
    fn options(&self) -> SessionOptions {
        self.inner.options()
    }

    async fn create_queue(&self, name: &str) -> Result<Destination, MqError> {
        self.counters.destinations_created.fetch_add(1, Ordering::SeqCst);
        self.inner.create_queue(name).await
    }

    async fn create_topic(&self, name: &str) -> Result<Destination, MqError> {
        self.counters.destinations_created.fetch_add(1, Ordering::SeqCst);
        self.inner.create_topic(name).await
    }

    async fn create_temporary_queue(&self) -> Result<Destination, MqError> {
        self.counters.destinations_created.fetch_add(1, Ordering::SeqCst);
        self.inner.create_temporary_queue().await
    }

    async fn create_temporary_topic(&self) -> Result<Destination, MqError> {
        self.counters.destinations_created.fetch_add(1, Ordering::SeqCst);
        self.inner.create_temporary_topic().await
    }

    async fn create_producer(
        &self,
        destination: &Destination,
    ) -> Result<Box<dyn MessageProducer>, MqError> {
        let inner = self.inner.create_producer(destination).await?;
        self.counters.producers_created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(RecordingProducer {
            inner,
            counters: self.counters.clone(),
        }))
    }

    async fn create_consumer(
        &self,
        destination: &Destination,
    ) -> Result<Box<dyn MessageConsumer>, MqError> {
        let inner = self.inner.create_consumer(destination).await?;
        self.counters.consumers_created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(RecordingConsumer {
            inner,
            counters: self.counters.clone(),
        }))
    }

    async fn create_durable_subscriber(
        &self,
        topic: &Destination,
        subscription_name: &str,
    ) -> Result<Box<dyn MessageConsumer>, MqError> {
        let inner = self
            .inner
            .create_durable_subscriber(topic, subscription_name)
            .await?;
        self.counters.consumers_created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(RecordingConsumer {
            inner,
            counters: self.counters.clone(),
        }))
    }

    async fn unsubscribe(&self, subscription_name: &str) -> Result<(), MqError> {
        self.inner.unsubscribe(subscription_name).await
    }

    async fn acknowledge(&self) -> Result<(), MqError> {
        self.inner.acknowledge().await
    }

    async fn recover(&self) -> Result<(), MqError> {
        self.inner.recover().await
    }

    async fn commit(&self) -> Result<(), MqError> {
        self.inner.commit().await
    }

    async fn rollback(&self) -> Result<(), MqError> {
        self.inner.rollback().await
    }

    fn close(&self) -> Result<(), MqError> {
        let inner = self.inner.close();
        self.counters
            .release("session", &self.counters.fail_session_close)
            .and(inner)
    }
}

struct RecordingProducer {
    inner: Box<dyn MessageProducer>,
    counters: Arc<Counters>,
}

#[async_trait]
impl MessageProducer for RecordingProducer {
    fn destination(&self) -> &Destination {
        self.inner.destination()
    }

    fn set_delivery_mode(&self, mode: DeliveryMode) {
        self.inner.set_delivery_mode(mode)
    }

    fn delivery_mode(&self) -> DeliveryMode {
        self.inner.delivery_mode()
    }

    fn set_time_to_live(&self, ttl: Option<Duration>) {
        self.inner.set_time_to_live(ttl)
    }

    fn time_to_live(&self) -> Option<Duration> {
        self.inner.time_to_live()
    }

    async fn send(&self, message: Message) -> Result<MessageId, MqError> {
        self.inner.send(message).await
    }

    fn close(&self) -> Result<(), MqError> {
        let inner = self.inner.close();
        self.counters
            .release("producer", &self.counters.fail_producer_close)
            .and(inner)
    }
}

struct RecordingConsumer {
    inner: Box<dyn MessageConsumer>,
    counters: Arc<Counters>,
}

#[async_trait]
impl MessageConsumer for RecordingConsumer {
    fn destination(&self) -> &Destination {
        self.inner.destination()
    }

    async fn receive(&self, timeout: Duration) -> Result<Option<ReceivedMessage>, MqError> {
        self.inner.receive(timeout).await
    }

    fn close(&self) -> Result<(), MqError> {
        let inner = self.inner.close();
        self.counters
            .release("consumer", &self.counters.fail_consumer_close)
            .and(inner)
    }
}
