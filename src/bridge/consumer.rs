//! Topic consumer: drains one queue into the pipeline.

use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{EventBinding, Pipeline};
use crate::bus::{BridgeError, DeliveryStream};
use crate::utils::ShutdownToken;

/// Per-queue counters, returned when the consumer stops.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerStats {
    pub received: u64,
    pub forwarded: u64,
    pub dropped: u64,
}

/// Process deliveries in broker order until the stream ends, errors, or
/// shutdown is signalled.
///
/// End-of-stream and stream errors mean the owning connection is gone; they
/// are reported on `lost` so the supervisor can reconnect. Shutdown is not
/// reported.
pub async fn run_consumer(
    binding: EventBinding,
    mut deliveries: DeliveryStream,
    pipeline: Pipeline,
    shutdown: ShutdownToken,
    lost: mpsc::Sender<BridgeError>,
) -> ConsumerStats {
    let mut stats = ConsumerStats::default();
    info!(queue = %binding.queue, topic = binding.topic, "Consumer started");

    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                debug!(queue = %binding.queue, "Consumer stopping on shutdown");
                return stats;
            }
            next = deliveries.next() => next,
        };

        match next {
            Some(Ok(delivery)) => {
                stats.received += 1;
                if pipeline
                    .handle(&delivery.data, &binding, &shutdown)
                    .await
                    .is_forwarded()
                {
                    stats.forwarded += 1;
                } else {
                    stats.dropped += 1;
                }
            }
            Some(Err(e)) => {
                if !shutdown.is_cancelled() {
                    warn!(queue = %binding.queue, error = %e, "Consumer stream failed");
                    let _ = lost
                        .send(BridgeError::ConnectionLost(format!(
                            "Consumer on '{}' failed: {}",
                            binding.queue, e
                        )))
                        .await;
                }
                return stats;
            }
            None => {
                if !shutdown.is_cancelled() {
                    info!(queue = %binding.queue, "Consumer stream ended");
                    let _ = lost
                        .send(BridgeError::ConnectionLost(format!(
                            "Consumer on '{}' ended",
                            binding.queue
                        )))
                        .await;
                }
                return stats;
            }
        }
    }
}
