//! Decode-and-forward: one raw body in, at most one fan-out publish out.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tracing::{debug, warn};

use super::EventBinding;
use crate::bus::{SendError, TopicSender};
use crate::events::DecodeError;
use crate::utils::ShutdownToken;

/// What happened to a single message.
#[derive(Debug)]
pub enum HandleOutcome {
    /// Decoded and published to the binding's topic.
    Forwarded,
    /// Body did not decode; nothing was published.
    Dropped(DecodeError),
    /// Decoded, but the topic sender refused it.
    Rejected(SendError),
}

impl HandleOutcome {
    pub fn is_forwarded(&self) -> bool {
        matches!(self, HandleOutcome::Forwarded)
    }
}

/// Stateless message handler shared by all consumers.
#[derive(Clone)]
pub struct Pipeline {
    sender: Arc<dyn TopicSender>,
}

impl Pipeline {
    pub fn new(sender: Arc<dyn TopicSender>) -> Self {
        Self { sender }
    }

    /// Decode `raw` with the binding's decoder and publish it on the
    /// binding's topic. Never fails: every problem is contained here,
    /// including a panicking sender.
    pub async fn handle(
        &self,
        raw: &[u8],
        binding: &EventBinding,
        shutdown: &ShutdownToken,
    ) -> HandleOutcome {
        let event = match binding.decode(raw) {
            Ok(event) => event,
            Err(e) => {
                warn!(
                    queue = %binding.queue,
                    event = binding.kind.name(),
                    bytes = raw.len(),
                    error = %e,
                    "Dropping undecodable message"
                );
                return HandleOutcome::Dropped(e);
            }
        };

        let correlation_id = event.correlation_id().to_string();
        let sent = AssertUnwindSafe(self.sender.send(binding.topic, event, shutdown))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(SendError::Panicked(binding.topic.to_string())));

        match sent {
            Ok(()) => {
                debug!(
                    topic = binding.topic,
                    correlation_id = %correlation_id,
                    "Forwarded event"
                );
                HandleOutcome::Forwarded
            }
            Err(SendError::Cancelled) => {
                debug!(topic = binding.topic, "Forward skipped, shutting down");
                HandleOutcome::Rejected(SendError::Cancelled)
            }
            Err(e) => {
                warn!(
                    topic = binding.topic,
                    correlation_id = %correlation_id,
                    error = %e,
                    "Topic sender rejected event"
                );
                HandleOutcome::Rejected(e)
            }
        }
    }
}
