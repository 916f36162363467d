//! AMQP (RabbitMQ) broker implementation.
//!
//! Each bound exchange is a durable fanout; each queue is durable and shared,
//! so messages published while the bridge is down wait for the next connection.
//! Consumers run with auto-ack: a message counts as delivered once the broker
//! hands it over, whatever the pipeline does with it.

mod publisher;

pub use publisher::AmqpCommandPublisher;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    options::{BasicConsumeOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    types::FieldTable,
    uri::{AMQPUri, AMQPUserInfo},
    Channel, Connection, ConnectionProperties, ExchangeKind,
};
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::{BridgeError, BrokerConnector, BrokerSession, Delivery, DeliveryStream, Result};
use crate::bridge::binding::{distinct_exchanges, distinct_queues};
use crate::bridge::EventBinding;
use crate::config::BrokerSettings;

/// Prefix for consumer tags, followed by the queue name and a random suffix.
const CONSUMER_TAG_PREFIX: &str = "analysis-bridge";

/// Reply code sent with a normal close.
const REPLY_SUCCESS: u16 = 200;

/// Build the connection URI from validated settings.
fn amqp_uri(settings: &BrokerSettings) -> AMQPUri {
    let mut uri = AMQPUri::default();
    uri.authority.host = settings.host.clone();
    uri.authority.port = settings.port;
    uri.authority.userinfo = AMQPUserInfo {
        username: settings.username.clone(),
        password: settings.password.clone(),
    };
    uri.vhost = settings.vhost.clone();
    uri.query.heartbeat = (settings.heartbeat_secs > 0).then_some(settings.heartbeat_secs);
    uri
}

fn consumer_tag(queue: &str) -> String {
    format!("{}.{}.{}", CONSUMER_TAG_PREFIX, queue, uuid::Uuid::new_v4())
}

/// Open a connection and a channel on it.
async fn open_channel(settings: &BrokerSettings) -> Result<(Connection, Channel)> {
    let connection = Connection::connect_uri(amqp_uri(settings), ConnectionProperties::default())
        .await
        .map_err(|e| {
            BridgeError::Connection(format!(
                "Failed to connect to {}: {}",
                settings.endpoint(),
                e
            ))
        })?;

    match connection.create_channel().await {
        Ok(channel) => Ok((connection, channel)),
        Err(e) => {
            let _ = connection.close(REPLY_SUCCESS, "channel setup failed").await;
            Err(BridgeError::Connection(format!(
                "Failed to create channel: {}",
                e
            )))
        }
    }
}

/// Opens one fresh AMQP connection per [`BrokerConnector::connect`] call.
#[derive(Debug, Clone)]
pub struct AmqpConnector {
    settings: BrokerSettings,
}

impl AmqpConnector {
    pub fn new(settings: BrokerSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl BrokerConnector for AmqpConnector {
    async fn connect(&self) -> Result<Box<dyn BrokerSession>> {
        let (connection, channel) = open_channel(&self.settings).await?;

        let (errors_tx, errors) = mpsc::unbounded_channel();
        connection.on_error(move |e| {
            let _ = errors_tx.send(e);
        });

        info!(endpoint = %self.settings.endpoint(), "Connected to AMQP");
        Ok(Box::new(AmqpSession {
            connection,
            channel,
            errors,
        }))
    }

    fn describe(&self) -> String {
        format!("amqp://{}", self.settings.endpoint())
    }
}

/// A live AMQP connection with the single channel used for topology and
/// consumers.
pub struct AmqpSession {
    connection: Connection,
    channel: Channel,
    errors: mpsc::UnboundedReceiver<lapin::Error>,
}

#[async_trait]
impl BrokerSession for AmqpSession {
    async fn declare_topology(&self, bindings: &[EventBinding]) -> Result<()> {
        for exchange in distinct_exchanges(bindings) {
            self.channel
                .exchange_declare(
                    exchange,
                    ExchangeKind::Fanout,
                    ExchangeDeclareOptions {
                        durable: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|e| {
                    BridgeError::Topology(format!(
                        "Failed to declare exchange '{}': {}",
                        exchange, e
                    ))
                })?;
        }

        for (queue, exchange) in distinct_queues(bindings) {
            self.channel
                .queue_declare(
                    queue,
                    QueueDeclareOptions {
                        durable: true,
                        exclusive: false,
                        auto_delete: false,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|e| {
                    BridgeError::Topology(format!("Failed to declare queue '{}': {}", queue, e))
                })?;

            // Fanout exchanges ignore the routing key.
            self.channel
                .queue_bind(
                    queue,
                    exchange,
                    "",
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| {
                    BridgeError::Topology(format!(
                        "Failed to bind queue '{}' to '{}': {}",
                        queue, exchange, e
                    ))
                })?;

            debug!(queue = %queue, exchange = %exchange, "Bound queue to exchange");
        }

        Ok(())
    }

    async fn start_consuming(&self, binding: &EventBinding) -> Result<DeliveryStream> {
        let tag = consumer_tag(&binding.queue);
        let consumer = self
            .channel
            .basic_consume(
                &binding.queue,
                &tag,
                BasicConsumeOptions {
                    no_ack: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                BridgeError::Consume(format!(
                    "Failed to start consumer on '{}': {}",
                    binding.queue, e
                ))
            })?;

        debug!(queue = %binding.queue, consumer_tag = %tag, "Consumer registered");

        Ok(consumer
            .map(|delivery| {
                delivery
                    .map(|d| Delivery {
                        exchange: d.exchange.as_str().to_string(),
                        routing_key: d.routing_key.as_str().to_string(),
                        data: d.data,
                    })
                    .map_err(|e| BridgeError::Consume(e.to_string()))
            })
            .boxed())
    }

    async fn closed(&mut self) -> BridgeError {
        match self.errors.recv().await {
            Some(e) => BridgeError::ConnectionLost(e.to_string()),
            None => BridgeError::ConnectionLost("Connection error handler dropped".to_string()),
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.channel.close(REPLY_SUCCESS, "bridge stopping").await {
            debug!(error = %e, "Channel close failed");
        }
        if let Err(e) = self.connection.close(REPLY_SUCCESS, "bridge stopping").await {
            debug!(error = %e, "Connection close failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uri_from_settings() {
        let mut settings = BrokerSettings::local("bridge", "s3cret");
        settings.host = "rabbit.internal".to_string();
        settings.port = 5673;
        settings.vhost = "analysis".to_string();

        let uri = amqp_uri(&settings);
        assert_eq!(uri.authority.host, "rabbit.internal");
        assert_eq!(uri.authority.port, 5673);
        assert_eq!(uri.authority.userinfo.username, "bridge");
        assert_eq!(uri.authority.userinfo.password, "s3cret");
        assert_eq!(uri.vhost, "analysis");
        assert_eq!(uri.query.heartbeat, Some(settings.heartbeat_secs));
    }

    #[test]
    fn test_zero_heartbeat_leaves_server_default() {
        let mut settings = BrokerSettings::local("guest", "guest");
        settings.heartbeat_secs = 0;
        assert_eq!(amqp_uri(&settings).query.heartbeat, None);
    }

    #[test]
    fn test_consumer_tags_are_unique_per_registration() {
        let a = consumer_tag("analysis.started.bridge");
        let b = consumer_tag("analysis.started.bridge");
        assert!(a.starts_with("analysis-bridge.analysis.started.bridge."));
        assert_ne!(a, b);
    }

    #[test]
    fn test_describe_hides_credentials() {
        let connector = AmqpConnector::new(BrokerSettings::local("guest", "hunter2"));
        let described = connector.describe();
        assert!(described.starts_with("amqp://"));
        assert!(!described.contains("hunter2"));
    }
}
