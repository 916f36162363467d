//! In-memory topic fan-out.
//!
//! Uses one tokio broadcast channel per topic. Every subscription receives
//! every event published after it subscribed, exactly once. Publishing never
//! waits on subscribers: a subscriber that falls more than `capacity` events
//! behind skips the oldest ones instead of holding up the bridge.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::{SendError, TopicSender};
use crate::config::DEFAULT_CHANNEL_CAPACITY;
use crate::events::DomainEvent;
use crate::utils::ShutdownToken;

/// Topic-keyed broadcast fan-out.
pub struct ChannelTopicSender {
    capacity: usize,
    topics: RwLock<HashMap<String, broadcast::Sender<Arc<DomainEvent>>>>,
    closed: AtomicBool,
}

impl Default for ChannelTopicSender {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

impl ChannelTopicSender {
    /// Create a fan-out buffering up to `capacity` events per topic.
    pub fn new(capacity: usize) -> Self {
        info!(capacity, "Channel topic sender initialized");
        Self {
            capacity: capacity.max(1),
            topics: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Attach a new subscriber to `topic`.
    ///
    /// After [`shutdown`](Self::shutdown) the subscription is already ended.
    pub fn subscribe(&self, topic: &str) -> TopicSubscription {
        let receiver = match self.sender_for(topic) {
            Some(sender) => sender.subscribe(),
            None => broadcast::channel(1).1,
        };
        debug!(topic = %topic, "Subscriber attached");
        TopicSubscription {
            topic: topic.to_string(),
            receiver,
        }
    }

    /// Number of live subscribers on `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.read_topics()
            .get(topic)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }

    /// Reject further sends and end every subscription.
    pub fn shutdown(&self) {
        let mut topics = match self.topics.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        self.closed.store(true, Ordering::SeqCst);
        topics.clear();
        drop(topics);
        info!("Channel topic sender shut down");
    }

    /// Sender for `topic`, created on first use. `None` once shut down.
    fn sender_for(&self, topic: &str) -> Option<broadcast::Sender<Arc<DomainEvent>>> {
        if let Some(sender) = self.read_topics().get(topic) {
            return Some(sender.clone());
        }
        let mut topics = match self.topics.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        // Checked under the write lock so shutdown cannot race a re-insert.
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        Some(
            topics
                .entry(topic.to_string())
                .or_insert_with(|| broadcast::channel(self.capacity).0)
                .clone(),
        )
    }

    fn read_topics(
        &self,
    ) -> std::sync::RwLockReadGuard<'_, HashMap<String, broadcast::Sender<Arc<DomainEvent>>>> {
        match self.topics.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl TopicSender for ChannelTopicSender {
    async fn send(
        &self,
        topic: &str,
        event: DomainEvent,
        shutdown: &ShutdownToken,
    ) -> Result<(), SendError> {
        if shutdown.is_cancelled() {
            return Err(SendError::Cancelled);
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(SendError::Closed(topic.to_string()));
        }

        let Some(sender) = self.sender_for(topic) else {
            return Err(SendError::Closed(topic.to_string()));
        };
        match sender.send(Arc::new(event)) {
            Ok(receivers) => {
                debug!(topic = %topic, receivers, "Published event to topic");
            }
            Err(_) => {
                // No subscribers right now, nothing to deliver.
                debug!(topic = %topic, "Published event (no subscribers)");
            }
        }
        Ok(())
    }
}

/// A live subscriber on one topic.
pub struct TopicSubscription {
    topic: String,
    receiver: broadcast::Receiver<Arc<DomainEvent>>,
}

impl TopicSubscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next event, or `None` once the sender has shut down.
    ///
    /// Lag is logged and skipped rather than surfaced.
    pub async fn recv(&mut self) -> Option<Arc<DomainEvent>> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(topic = %self.topic, skipped, "Subscriber lagged, skipped events");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
