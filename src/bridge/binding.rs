//! Routing table from broker queues to fan-out topics.

use std::collections::BTreeSet;
use std::fmt;

use crate::config::TopologyConfig;
use crate::events::{DecodeError, DecodeFn, DomainEvent, EventKind};

/// One route: exchange → queue → fan-out topic, with the decoder for the
/// event type carried on it. Fixed at startup.
#[derive(Clone)]
pub struct EventBinding {
    pub kind: EventKind,
    pub exchange: String,
    pub queue: String,
    pub topic: &'static str,
    pub decode: DecodeFn,
}

impl fmt::Debug for EventBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBinding")
            .field("kind", &self.kind)
            .field("exchange", &self.exchange)
            .field("queue", &self.queue)
            .field("topic", &self.topic)
            .finish()
    }
}

impl EventBinding {
    /// Binding for `kind`, using its registered topic and decoder.
    pub fn new(kind: EventKind, exchange: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            kind,
            exchange: exchange.into(),
            queue: queue.into(),
            topic: kind.topic(),
            decode: kind.decoder(),
        }
    }

    pub fn decode(&self, raw: &[u8]) -> Result<DomainEvent, DecodeError> {
        (self.decode)(raw)
    }
}

/// The started and completed bindings, named per `topology`.
pub fn analysis_bindings(topology: &TopologyConfig) -> Vec<EventBinding> {
    vec![
        EventBinding::new(
            EventKind::AnalysisStarted,
            &topology.started_exchange,
            &topology.started_queue,
        ),
        EventBinding::new(
            EventKind::AnalysisCompleted,
            &topology.completed_exchange,
            &topology.completed_queue,
        ),
    ]
}

/// Distinct exchange names, in stable order.
pub fn distinct_exchanges(bindings: &[EventBinding]) -> Vec<&str> {
    bindings
        .iter()
        .map(|b| b.exchange.as_str())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Distinct (queue, exchange) pairs, in stable order.
pub fn distinct_queues(bindings: &[EventBinding]) -> Vec<(&str, &str)> {
    bindings
        .iter()
        .map(|b| (b.queue.as_str(), b.exchange.as_str()))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{COMPLETED_TOPIC, STARTED_TOPIC};

    #[test]
    fn test_analysis_bindings_use_fixed_topics() {
        let bindings = analysis_bindings(&TopologyConfig::default());
        assert_eq!(bindings.len(), 2);
        assert_eq!(bindings[0].topic, STARTED_TOPIC);
        assert_eq!(bindings[0].queue, "analysis.started.bridge");
        assert_eq!(bindings[1].topic, COMPLETED_TOPIC);
        assert_eq!(bindings[1].exchange, "analysis.completed");
    }

    #[test]
    fn test_binding_decodes_its_own_event_type() {
        let bindings = analysis_bindings(&TopologyConfig::default());
        let started = br#"{"correlationId":"abc123","objectKey":"file.csv"}"#;
        assert!(bindings[0].decode(started).is_ok());
        // Started payload lacks `result`, so the completed decoder rejects it.
        assert!(bindings[1].decode(started).is_err());
    }

    #[test]
    fn test_distinct_exchanges_and_queues() {
        let bindings = vec![
            EventBinding::new(EventKind::AnalysisStarted, "shared", "q1"),
            EventBinding::new(EventKind::AnalysisCompleted, "shared", "q2"),
            EventBinding::new(EventKind::AnalysisCompleted, "shared", "q2"),
        ];
        assert_eq!(distinct_exchanges(&bindings), vec!["shared"]);
        assert_eq!(
            distinct_queues(&bindings),
            vec![("q1", "shared"), ("q2", "shared")]
        );
    }
}
