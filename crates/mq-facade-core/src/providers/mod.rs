//! Transport provider implementations.
//!
//! This module contains concrete implementations of the transport traits in
//! [`crate::transport`]. Networked providers plug in through
//! [`crate::transport::TransportRegistry`].

pub mod memory;

pub use memory::{
    InMemoryBroker, InMemoryConnection, InMemoryConnectionFactory, InMemoryConsumer,
    InMemoryProducer, InMemorySession,
};
