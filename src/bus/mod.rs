//! Messaging capabilities used by the bridge.
//!
//! This module contains:
//! - `BrokerConnector` / `BrokerSession`: one live broker connection, its topology and consumers
//! - `TopicSender`: in-process fan-out to live subscribers
//! - `CommandPublisher`: fire-and-forget outbound commands
//! - Implementations: AMQP (RabbitMQ), in-process channel, mock broker

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::Serialize;

use crate::bridge::EventBinding;
use crate::events::DomainEvent;
use crate::utils::ShutdownToken;

// Implementation modules
#[cfg(feature = "amqp")]
pub mod amqp;
pub mod channel;
pub mod mock;

// Re-exports
#[cfg(feature = "amqp")]
pub use amqp::{AmqpCommandPublisher, AmqpConnector};
pub use channel::{ChannelTopicSender, TopicSubscription};
pub use mock::MockBroker;

// ============================================================================
// Errors
// ============================================================================

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Errors on the broker side of the bridge.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BridgeError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Topology declaration failed: {0}")]
    Topology(String),

    #[error("Consume failed: {0}")]
    Consume(String),

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Publish failed: {0}")]
    Publish(String),
}

impl BridgeError {
    /// Whether the error ends the current connection and sends the
    /// supervisor into backoff.
    pub fn is_lifecycle(&self) -> bool {
        !matches!(self, BridgeError::Publish(_))
    }
}

/// Fan-out rejections. Never fatal to a consumer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("Send cancelled by shutdown")]
    Cancelled,

    #[error("Topic sender closed: {0}")]
    Closed(String),

    #[error("Topic sender panicked on {0}")]
    Panicked(String),
}

// ============================================================================
// Broker seam
// ============================================================================

/// One raw message taken off a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub exchange: String,
    pub routing_key: String,
    pub data: Vec<u8>,
}

/// Messages from one queue. Ends or yields an error when the connection dies.
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// Establishes broker sessions.
///
/// Every call creates a brand-new connection; sessions are never pooled or
/// reused across reconnects.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    /// Open a connection and a channel.
    async fn connect(&self) -> Result<Box<dyn BrokerSession>>;

    /// Human-readable target for logs.
    fn describe(&self) -> String;
}

/// A live connection plus channel, exclusively owned by the supervisor.
#[async_trait]
pub trait BrokerSession: Send + Sync {
    /// Idempotently declare every exchange, queue and queue binding.
    async fn declare_topology(&self, bindings: &[EventBinding]) -> Result<()>;

    /// Register an auto-ack consumer on the binding's queue.
    ///
    /// The stream is only valid while this session lives.
    async fn start_consuming(&self, binding: &EventBinding) -> Result<DeliveryStream>;

    /// Resolves when the broker reports the connection dead.
    async fn closed(&mut self) -> BridgeError;

    /// Release the channel and connection. Failures are swallowed.
    async fn close(&mut self);
}

// ============================================================================
// Collaborator contracts
// ============================================================================

/// In-process pub/sub to live subscribers.
///
/// Must be safe to call concurrently from independent consumers.
#[async_trait]
pub trait TopicSender: Send + Sync {
    async fn send(
        &self,
        topic: &str,
        event: DomainEvent,
        shutdown: &ShutdownToken,
    ) -> std::result::Result<(), SendError>;
}

/// Fire-and-forget publish of outbound commands.
#[async_trait]
pub trait CommandPublisher: Send + Sync {
    async fn send(&self, exchange: &str, routing_key: &str, body: Vec<u8>) -> Result<()>;
}

/// Serialize a command as JSON and hand it to a publisher.
pub async fn send_command<C: Serialize + Sync>(
    publisher: &dyn CommandPublisher,
    exchange: &str,
    routing_key: &str,
    command: &C,
) -> Result<()> {
    let body = serde_json::to_vec(command)
        .map_err(|e| BridgeError::Publish(format!("Failed to encode command: {}", e)))?;
    publisher.send(exchange, routing_key, body).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RequestAnalysis;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingPublisher {
        sent: Mutex<Vec<(String, String, Vec<u8>)>>,
    }

    #[async_trait]
    impl CommandPublisher for RecordingPublisher {
        async fn send(&self, exchange: &str, routing_key: &str, body: Vec<u8>) -> Result<()> {
            self.sent
                .lock()
                .unwrap()
                .push((exchange.to_string(), routing_key.to_string(), body));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_send_command_encodes_json() {
        let publisher = RecordingPublisher::default();
        let cmd = RequestAnalysis {
            correlation_id: "abc".to_string(),
            object_key: "file.csv".to_string(),
        };

        send_command(&publisher, RequestAnalysis::EXCHANGE, "", &cmd)
            .await
            .unwrap();

        let sent = publisher.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "analysis.requests");
        assert_eq!(sent[0].1, "");
        let decoded: RequestAnalysis = serde_json::from_slice(&sent[0].2).unwrap();
        assert_eq!(decoded, cmd);
    }

    #[test]
    fn test_lifecycle_classification() {
        assert!(BridgeError::Connection("x".into()).is_lifecycle());
        assert!(BridgeError::Topology("x".into()).is_lifecycle());
        assert!(BridgeError::ConnectionLost("x".into()).is_lifecycle());
        assert!(!BridgeError::Publish("x".into()).is_lifecycle());
    }
}
