//! Tests for the [`Consumer`] facade.

use super::*;
use crate::message::MapBody;
use crate::producer::Producer;
use crate::test_support::{unique_url, Counters, RecordingFactory};

async fn producer_for(url: &str, kind: DestinationKind, name: &str) -> Producer {
    let mut producer = Producer::new(url);
    producer.connect(kind, name).await.unwrap();
    producer
}

fn quick_consumer(url: &str) -> Consumer {
    let mut consumer = Consumer::new(url);
    consumer.set_timeout(Duration::milliseconds(100));
    consumer
}

mod receive_tests {
    use super::*;

    /// Verify that text messages are returned and timeouts yield none.
    #[tokio::test]
    async fn test_get_text_message_and_timeout() {
        // Arrange
        let url = unique_url();
        let mut consumer = quick_consumer(&url);
        consumer.connect(DestinationKind::Queue, "inbox").await.unwrap();
        let mut producer = producer_for(&url, DestinationKind::Queue, "inbox").await;

        // Act
        producer.send_message("hello").await.unwrap();
        let received = consumer.get_text_message().await.unwrap();
        let timed_out = consumer.get_text_message().await.unwrap();

        // Assert
        assert_eq!(received.as_deref(), Some("hello"));
        assert_eq!(timed_out, None);
    }

    /// Verify that a map message read as text fails without losing it.
    #[tokio::test]
    async fn test_get_text_message_type_mismatch() {
        let url = unique_url();
        let mut consumer = quick_consumer(&url);
        consumer.connect(DestinationKind::Queue, "mixed").await.unwrap();
        let mut producer = producer_for(&url, DestinationKind::Queue, "mixed").await;
        let mut body = MapBody::new();
        body.insert("k".to_string(), serde_json::json!("v"));
        producer.send_map_message(body.clone()).await.unwrap();

        let result = consumer.get_text_message().await;

        match result {
            Err(MqError::TypeMismatch {
                expected,
                actual,
                message,
            }) => {
                assert_eq!(expected, PayloadKind::Text);
                assert_eq!(actual, PayloadKind::Map);
                assert_eq!(message.map(), Some(&body));
            }
            other => panic!("expected type mismatch, got {:?}", other),
        }
    }

    /// Verify that the map accessor returns whatever arrives unchecked.
    #[tokio::test]
    async fn test_get_map_message_is_unchecked() {
        let url = unique_url();
        let mut consumer = quick_consumer(&url);
        consumer.connect(DestinationKind::Queue, "maps").await.unwrap();
        let mut producer = producer_for(&url, DestinationKind::Queue, "maps").await;
        producer.send_message("not a map").await.unwrap();

        let message = consumer.get_map_message().await.unwrap().unwrap();

        assert_eq!(message.map(), None);
        assert_eq!(message.text(), Some("not a map"));
    }

    /// Verify that receiving before connect fails with not connected.
    #[tokio::test]
    async fn test_receive_before_connect_fails() {
        let mut consumer = Consumer::new(unique_url());

        assert!(matches!(
            consumer.get_text_message().await,
            Err(MqError::NotConnected { .. })
        ));
        assert!(matches!(
            consumer.acknowledge().await,
            Err(MqError::NotConnected { .. })
        ));
    }

    #[test]
    fn test_timeout_defaults_and_setter() {
        let mut consumer = Consumer::new(unique_url());
        let default_timeout = consumer.timeout();

        consumer.set_timeout(Duration::milliseconds(250));
        let custom = consumer.timeout();
        consumer.set_timeout(Duration::milliseconds(-5));

        assert_eq!(default_timeout, Duration::milliseconds(5000));
        assert_eq!(custom, Duration::milliseconds(250));
        assert_eq!(consumer.timeout(), Duration::zero());
    }

    /// Verify that a timeout too long for a deadline still receives.
    #[tokio::test]
    async fn test_unbounded_timeout_receives() {
        let url = unique_url();
        let mut config = MqConfig {
            broker_url: url.clone(),
            ..Default::default()
        };
        config.consumer.receive_timeout_ms = u64::MAX;
        let mut consumer = Consumer::from_config(&config);
        consumer.connect(DestinationKind::Queue, "patient").await.unwrap();
        let mut producer = producer_for(&url, DestinationKind::Queue, "patient").await;

        producer.send_message("eventually").await.unwrap();
        let text = consumer.get_text_message().await.unwrap();

        assert_eq!(consumer.timeout(), Duration::milliseconds(i64::MAX));
        assert_eq!(text.as_deref(), Some("eventually"));
    }
}

mod acknowledgement_tests {
    use super::*;

    /// Verify that unacknowledged messages come back after recover.
    #[tokio::test]
    async fn test_client_acknowledge_by_default() {
        let url = unique_url();
        let mut consumer = quick_consumer(&url);
        consumer.connect(DestinationKind::Queue, "jobs").await.unwrap();
        let mut producer = producer_for(&url, DestinationKind::Queue, "jobs").await;
        producer.send_message("job-1").await.unwrap();

        consumer.get_text_message().await.unwrap();
        consumer.recover().await.unwrap();
        let redelivered = consumer.receive().await.unwrap().unwrap();
        consumer.acknowledge().await.unwrap();
        consumer.recover().await.unwrap();

        assert_eq!(consumer.acknowledge_mode(), AcknowledgeMode::Client);
        assert!(redelivered.redelivered);
        assert!(consumer.receive().await.unwrap().is_none());
    }

    /// Verify that auto acknowledgement never redelivers.
    #[tokio::test]
    async fn test_auto_acknowledge_mode() {
        let url = unique_url();
        let mut consumer = quick_consumer(&url);
        consumer.set_acknowledge_mode(AcknowledgeMode::Auto);
        consumer.connect(DestinationKind::Queue, "auto").await.unwrap();
        let mut producer = producer_for(&url, DestinationKind::Queue, "auto").await;
        producer.send_message("once").await.unwrap();

        consumer.get_text_message().await.unwrap();
        consumer.recover().await.unwrap();

        assert!(consumer.receive().await.unwrap().is_none());
    }

    /// Verify transacted consumption with rollback and commit.
    #[tokio::test]
    async fn test_transacted_consumer() {
        let url = unique_url();
        let mut consumer = quick_consumer(&url);
        consumer.set_use_transactions(true);
        consumer.connect(DestinationKind::Queue, "tx").await.unwrap();
        let mut producer = producer_for(&url, DestinationKind::Queue, "tx").await;
        producer.send_message("payment").await.unwrap();

        consumer.get_text_message().await.unwrap();
        consumer.rollback().await.unwrap();
        let again = consumer.get_text_message().await.unwrap();
        consumer.commit().await.unwrap();

        assert_eq!(again.as_deref(), Some("payment"));
        assert_eq!(consumer.session_options().map(|o| o.transacted), Some(true));
        assert!(consumer.receive().await.unwrap().is_none());
    }
}

mod connect_tests {
    use super::*;

    /// Verify that reconnecting to a different destination replaces the
    /// consumer and closes the old one.
    #[tokio::test]
    async fn test_reconnect_replaces_consumer() {
        let factory = RecordingFactory::new();
        let mut consumer = Consumer::with_factory(unique_url(), factory.clone());

        consumer.connect(DestinationKind::Queue, "first").await.unwrap();
        consumer.connect(DestinationKind::Queue, "first").await.unwrap();
        consumer.connect(DestinationKind::Topic, "second").await.unwrap();

        assert_eq!(Counters::count(&factory.counters.consumers_created), 2);
        assert_eq!(factory.counters.released(), vec!["consumer".to_string()]);
        assert_eq!(consumer.destination().map(|d| d.is_topic()), Some(true));
        assert_eq!(Counters::count(&factory.counters.connections_created), 1);
    }

    /// Verify that a closed connection is replaced on the next connect and
    /// receives come from a fresh session.
    #[tokio::test]
    async fn test_connect_after_connection_closed_rebuilds_session() {
        // Arrange
        let url = unique_url();
        let factory = RecordingFactory::new();
        let mut consumer = Consumer::with_factory(url.clone(), factory.clone());
        consumer.set_timeout(Duration::milliseconds(200));
        consumer.connect(DestinationKind::Queue, "jobs").await.unwrap();
        let first = consumer.connection().unwrap();
        first.close().unwrap();

        // Act
        consumer.connect(DestinationKind::Queue, "jobs").await.unwrap();
        let mut producer = producer_for(&url, DestinationKind::Queue, "jobs").await;
        producer.send_message("after").await.unwrap();
        let received = consumer.get_text_message().await;

        // Assert
        assert_eq!(received.unwrap().as_deref(), Some("after"));
        assert_ne!(
            consumer.connection().unwrap().connection_id(),
            first.connection_id()
        );
        assert_eq!(Counters::count(&factory.counters.connections_created), 2);
        assert_eq!(Counters::count(&factory.counters.sessions_created), 2);
        assert_eq!(Counters::count(&factory.counters.consumers_created), 2);
    }

    /// Verify that temporary mode consumes from a provider-named queue that
    /// a responder can reply to.
    #[tokio::test]
    async fn test_temporary_reply_queue() {
        // Arrange
        let url = unique_url();
        let mut replies = quick_consumer(&url);
        replies.set_use_temporary(true);
        replies.connect(DestinationKind::Queue, "replies").await.unwrap();
        let reply_queue = replies.destination().cloned().unwrap();
        let mut requester = Producer::new(url.clone());
        requester
            .connect_with_connection(
                DestinationKind::Queue,
                "requests",
                replies.connection().unwrap(),
            )
            .await
            .unwrap();
        requester.set_reply_to(Some(reply_queue.clone()));
        let mut server = quick_consumer(&url);
        server.connect(DestinationKind::Queue, "requests").await.unwrap();

        // Act
        requester.send_message("ping").await.unwrap();
        let request = server.receive().await.unwrap().unwrap();
        let reply_to = request.reply_to.clone().unwrap();
        let mut responder = producer_for(&url, DestinationKind::Queue, reply_to.name()).await;
        responder.send_message("pong").await.unwrap();
        let reply = replies.get_text_message().await.unwrap();

        // Assert
        assert!(reply_queue.is_temporary());
        assert_eq!(reply_to, reply_queue);
        assert_eq!(reply.as_deref(), Some("pong"));
    }

    /// Verify durable connect, retention across disconnects and unsubscribe.
    #[tokio::test]
    async fn test_durable_subscription_lifecycle() {
        // Arrange
        let url = unique_url();
        let mut subscriber = quick_consumer(&url);
        subscriber
            .connect_durable("ledger", "auditor", "audit")
            .await
            .unwrap();
        let mut producer = producer_for(&url, DestinationKind::Topic, "ledger").await;

        // Act
        subscriber.close();
        producer.send_message("while away").await.unwrap();
        subscriber
            .connect_durable("ledger", "auditor", "audit")
            .await
            .unwrap();
        let retained = subscriber.get_text_message().await.unwrap();
        subscriber.acknowledge().await.unwrap();
        subscriber.unsubscribe("audit").await.unwrap();
        let unsubscribe_again = subscriber.unsubscribe("audit").await;

        // Assert
        assert_eq!(retained.as_deref(), Some("while away"));
        assert_eq!(subscriber.durable_subscription(), None);
        assert!(matches!(
            unsubscribe_again,
            Err(MqError::IllegalState { .. })
        ));
    }

    /// Verify that two facades cannot use the same client id at once.
    #[tokio::test]
    async fn test_durable_client_id_conflict() {
        let url = unique_url();
        let mut first = quick_consumer(&url);
        let mut second = quick_consumer(&url);
        first.connect_durable("ledger", "auditor", "a").await.unwrap();

        let result = second.connect_durable("ledger", "auditor", "b").await;

        assert!(matches!(result, Err(MqError::ClientIdConflict { .. })));
    }
}

mod close_tests {
    use super::*;

    /// Verify that close releases consumer, session then connection and is
    /// idempotent.
    #[tokio::test]
    async fn test_close_order_and_idempotence() {
        let factory = RecordingFactory::new();
        let mut consumer = Consumer::with_factory(unique_url(), factory.clone());
        consumer.connect(DestinationKind::Queue, "orders").await.unwrap();

        let first = consumer.close();
        let second = consumer.close();

        assert!(first.is_clean());
        assert!(second.is_empty());
        assert_eq!(
            factory.counters.released(),
            vec!["consumer".to_string(), "session".to_string(), "connection".to_string()]
        );
    }

    /// Verify that a failing consumer close is reported and later steps
    /// still run.
    #[tokio::test]
    async fn test_close_failure_reported() {
        let factory = RecordingFactory::new();
        Counters::set(&factory.counters.fail_consumer_close);
        let mut consumer = Consumer::with_factory(unique_url(), factory.clone());
        consumer.connect(DestinationKind::Queue, "orders").await.unwrap();
        let connection = consumer.connection().unwrap();

        let report = consumer.close();

        assert_eq!(report.failures().len(), 1);
        assert!(connection.is_closed());
    }

    /// Verify that rebinding to another connection releases the old session.
    #[tokio::test]
    async fn test_rebinding_releases_previous_resources() {
        let url = unique_url();
        let mut consumer = quick_consumer(&url);
        consumer.connect(DestinationKind::Queue, "orders").await.unwrap();
        let owned = consumer.connection().unwrap();
        let mut other = producer_for(&url, DestinationKind::Queue, "orders").await;
        let shared = other.connection().unwrap();

        consumer
            .connect_with_connection(DestinationKind::Queue, "orders", shared.clone())
            .await
            .unwrap();
        other.send_message("via shared").await.unwrap();
        let received = consumer.get_text_message().await.unwrap();
        consumer.close();

        assert!(owned.is_closed());
        assert!(!shared.is_closed());
        assert_eq!(received.as_deref(), Some("via shared"));
    }
}
