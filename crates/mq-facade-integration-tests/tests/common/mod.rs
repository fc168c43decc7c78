//! Common test utilities for mq-facade integration tests
//!
//! This module provides:
//! - Unique in-process broker URLs so tests never share state
//! - Helpers for connected producers and consumers

use chrono::Duration;
use mq_facade_core::{Consumer, DestinationKind, Producer};

/// A `vm://` URL naming a broker no other test uses
pub fn unique_url() -> String {
    format!(
        "vm://it-{}?broker.persistent=false",
        uuid::Uuid::new_v4().simple()
    )
}

/// Producer connected to `(kind, name)`
#[allow(dead_code)]
pub async fn connected_producer(url: &str, kind: DestinationKind, name: &str) -> Producer {
    let mut producer = Producer::new(url);
    producer
        .connect(kind, name)
        .await
        .expect("producer should connect to the in-process broker");
    producer
}

/// Consumer connected to `(kind, name)` with a short receive timeout
#[allow(dead_code)]
pub async fn connected_consumer(url: &str, kind: DestinationKind, name: &str) -> Consumer {
    let mut consumer = Consumer::new(url);
    consumer.set_timeout(Duration::milliseconds(200));
    consumer
        .connect(kind, name)
        .await
        .expect("consumer should connect to the in-process broker");
    consumer
}

/// Receive every text message currently available
#[allow(dead_code)]
pub async fn drain_text(consumer: &mut Consumer) -> Vec<String> {
    let mut received = Vec::new();
    while let Some(text) = consumer
        .get_text_message()
        .await
        .expect("receive should succeed")
    {
        received.push(text);
    }
    consumer.acknowledge().await.expect("acknowledge should succeed");
    received
}
