//! Outbound command publishing over its own AMQP connection.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use backon::{BackoffBuilder, ExponentialBuilder};
use lapin::{
    options::{BasicPublishOptions, ExchangeDeclareOptions},
    types::FieldTable,
    BasicProperties, Channel, Connection, ExchangeKind,
};
use tokio::sync::Mutex;
use tracing::{debug, error};

use super::{open_channel, REPLY_SUCCESS};
use crate::bus::{BridgeError, CommandPublisher, Result};
use crate::config::BrokerSettings;

const MAX_RETRIES: usize = 5;

/// Cached connection plus the exchanges already declared on it.
struct Link {
    connection: Connection,
    channel: Channel,
    declared: HashSet<String>,
}

/// Arguments for the exchange declaration made before the first publish.
///
/// Without a kind the declaration is passive: the exchange must already
/// exist, and whatever type it was created with is left alone.
fn exchange_declaration(kind: Option<&ExchangeKind>) -> (ExchangeKind, ExchangeDeclareOptions) {
    match kind {
        Some(kind) => (
            kind.clone(),
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
        ),
        None => (
            ExchangeKind::Direct,
            ExchangeDeclareOptions {
                passive: true,
                ..Default::default()
            },
        ),
    }
}

/// Publishes persistent JSON commands to existing exchanges.
///
/// The connection is opened lazily on first use and kept separate from the
/// bridge consumers. Any failure drops it; the next attempt reconnects.
pub struct AmqpCommandPublisher {
    settings: BrokerSettings,
    exchange_kind: Option<ExchangeKind>,
    link: Mutex<Option<Link>>,
}

impl AmqpCommandPublisher {
    pub fn new(settings: BrokerSettings) -> Self {
        Self {
            settings,
            exchange_kind: None,
            link: Mutex::new(None),
        }
    }

    /// Create missing exchanges as durable exchanges of `kind` instead of
    /// requiring them to exist.
    pub fn with_exchange_kind(mut self, kind: ExchangeKind) -> Self {
        self.exchange_kind = Some(kind);
        self
    }

    async fn publish_once(
        &self,
        slot: &mut Option<Link>,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
    ) -> Result<()> {
        if slot.is_none() {
            let (connection, channel) = open_channel(&self.settings).await?;
            *slot = Some(Link {
                connection,
                channel,
                declared: HashSet::new(),
            });
        }
        let link = slot
            .as_mut()
            .ok_or_else(|| BridgeError::Publish("No publisher connection".to_string()))?;

        if !link.declared.contains(exchange) {
            let (kind, options) = exchange_declaration(self.exchange_kind.as_ref());
            link.channel
                .exchange_declare(exchange, kind, options, FieldTable::default())
                .await
                .map_err(|e| {
                    BridgeError::Publish(format!(
                        "Failed to declare exchange '{}': {}",
                        exchange, e
                    ))
                })?;
            link.declared.insert(exchange.to_string());
        }

        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(2); // persistent

        link.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                properties,
            )
            .await
            .map_err(|e| BridgeError::Publish(format!("Failed to publish: {}", e)))?
            .await
            .map_err(|e| BridgeError::Publish(format!("Publish confirmation failed: {}", e)))?;

        Ok(())
    }

    /// Drop the cached connection so the next attempt starts clean.
    async fn reset(slot: &mut Option<Link>) {
        if let Some(link) = slot.take() {
            if let Err(e) = link
                .connection
                .close(REPLY_SUCCESS, "publisher reconnecting")
                .await
            {
                debug!(error = %e, "Publisher connection close failed");
            }
        }
    }
}

#[async_trait]
impl CommandPublisher for AmqpCommandPublisher {
    async fn send(&self, exchange: &str, routing_key: &str, body: Vec<u8>) -> Result<()> {
        // Exponential backoff with jitter to prevent thundering herd
        let backoff = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(5))
            .with_max_times(MAX_RETRIES)
            .with_jitter()
            .build();

        let mut slot = self.link.lock().await;
        let mut last_error = None;

        for (attempt, delay) in std::iter::once(Duration::ZERO).chain(backoff).enumerate() {
            if attempt > 0 {
                tokio::time::sleep(delay).await;
            }

            match self
                .publish_once(&mut slot, exchange, routing_key, &body)
                .await
            {
                Ok(()) => {
                    debug!(
                        exchange = %exchange,
                        routing_key = %routing_key,
                        bytes = body.len(),
                        "Published command"
                    );
                    return Ok(());
                }
                Err(e) => {
                    error!(
                        attempt = attempt + 1,
                        max_retries = MAX_RETRIES,
                        exchange = %exchange,
                        error = %e,
                        "Command publish failed, retrying..."
                    );
                    Self::reset(&mut slot).await;
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| BridgeError::Publish("Max retries exceeded".to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_declaration_is_passive() {
        let (_, options) = exchange_declaration(None);
        assert!(options.passive);
        assert!(!options.durable);
    }

    #[test]
    fn test_configured_kind_is_declared_durable() {
        let (kind, options) = exchange_declaration(Some(&ExchangeKind::Topic));
        assert!(matches!(kind, ExchangeKind::Topic));
        assert!(options.durable);
        assert!(!options.passive);
    }

    #[test]
    fn test_publisher_defaults_to_passive_declaration() {
        let publisher = AmqpCommandPublisher::new(BrokerSettings::local("guest", "guest"));
        assert!(publisher.exchange_kind.is_none());

        let publisher = publisher.with_exchange_kind(ExchangeKind::Direct);
        assert!(matches!(publisher.exchange_kind, Some(ExchangeKind::Direct)));
    }
}
