//! # MQ Facade Core
//!
//! Producer and consumer facades over a message-broker transport.
//!
//! This library provides:
//! - Lazily created, idempotently closed broker connections
//! - Destination resolution cached per facade
//! - Producer caching with persistence, time-to-live and reply-to handling
//! - Blocking receive with timeout and type-checked text extraction
//! - Cooperative shutdown of receive loops
//! - An in-process `vm://` broker for tests and single-process use
//!
//! ## Module Organization
//!
//! - [`error`] - Error types for all facade and transport operations
//! - [`message`] - Messages, payloads and identifiers
//! - [`destination`] - Destination handles and the destination cache
//! - [`transport`] - Transport traits and the scheme registry
//! - [`providers`] - Transport implementations
//! - [`connection`] - Connection manager shared by both facades
//! - [`producer`] / [`consumer`] - The facades
//! - [`shutdown`] / [`worker`] - Shutdown coordination and the worker loop
//! - [`profiling`] - Operation timers
//! - [`config`] - Layered configuration
//!
//! ## Example
//!
//! ```no_run
//! use mq_facade_core::{Consumer, DestinationKind, Producer};
//!
//! # async fn example() -> Result<(), mq_facade_core::MqError> {
//! let mut producer = Producer::new("vm://localhost?broker.persistent=false");
//! producer.connect(DestinationKind::Queue, "orders").await?;
//! producer.send_message("hello").await?;
//!
//! let mut consumer = Consumer::new("vm://localhost?broker.persistent=false");
//! consumer.connect(DestinationKind::Queue, "orders").await?;
//! let text = consumer.get_text_message().await?;
//! consumer.acknowledge().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod consumer;
pub mod destination;
pub mod error;
pub mod message;
pub mod producer;
pub mod profiling;
pub mod providers;
pub mod release;
pub mod shutdown;
pub mod transport;
pub mod worker;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export commonly used types at crate root for convenience
pub use crate::config::{
    ConsumerConfig, DestinationConfig, MqConfig, ProducerConfig, ProfilingConfig, ShutdownConfig,
};
pub use connection::ConnectionManager;
pub use consumer::Consumer;
pub use destination::{CacheKeyPolicy, Destination, DestinationCache, DestinationKind};
pub use error::{ConfigurationError, MqError, ValidationError};
pub use message::{
    DeliveryMode, MapBody, Message, MessageId, Payload, PayloadKind, ReceivedMessage, Timestamp,
};
pub use producer::Producer;
pub use profiling::Profiler;
pub use providers::InMemoryConnectionFactory;
pub use release::{ReleaseFailure, ReleaseReport};
pub use shutdown::{ShutdownCoordinator, ShutdownPhase, ShutdownState};
pub use transport::{
    AcknowledgeMode, BrokerUrl, Connection, ConnectionFactory, MessageConsumer, MessageProducer,
    Session, SessionOptions, TransportRegistry,
};
pub use worker::{run_until_shutdown, WorkerStats};
