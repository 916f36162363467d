//! Event contracts that cross the broker boundary.
//!
//! Each inbound event type has a fixed JSON shape (camelCase fields) and a
//! fixed fan-out topic. Decoding is tolerant of field-name casing: the
//! producer may send `CorrelationId`, `correlationId` or `correlationid` and
//! all map onto the same field. Unknown fields are ignored. Missing fields,
//! wrong types and non-object bodies are rejected.

mod commands;

pub use commands::RequestAnalysis;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Fan-out topic carrying [`AnalysisStarted`] events.
pub const STARTED_TOPIC: &str = "analysis/started";
/// Fan-out topic carrying [`AnalysisCompleted`] events.
pub const COMPLETED_TOPIC: &str = "analysis/completed";

/// Errors decoding a raw message body into a domain event.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Malformed JSON: {0}")]
    Json(#[source] serde_json::Error),

    #[error("Expected a JSON object for {event}")]
    NotAnObject { event: &'static str },

    #[error("Payload does not match {event}: {source}")]
    Contract {
        event: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Signature shared by all decode functions in the binding table.
pub type DecodeFn = fn(&[u8]) -> Result<DomainEvent, DecodeError>;

/// An analysis job was accepted and processing began.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisStarted {
    pub correlation_id: String,
    pub object_key: String,
}

/// An analysis job finished.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisCompleted {
    pub correlation_id: String,
    pub result: String,
}

/// A decoded event, ready for fan-out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum DomainEvent {
    Started(AnalysisStarted),
    Completed(AnalysisCompleted),
}

impl DomainEvent {
    /// Contract name of the wrapped event.
    pub fn name(&self) -> &'static str {
        self.kind().name()
    }

    pub fn kind(&self) -> EventKind {
        match self {
            DomainEvent::Started(_) => EventKind::AnalysisStarted,
            DomainEvent::Completed(_) => EventKind::AnalysisCompleted,
        }
    }

    pub fn correlation_id(&self) -> &str {
        match self {
            DomainEvent::Started(e) => &e.correlation_id,
            DomainEvent::Completed(e) => &e.correlation_id,
        }
    }
}

/// Shape of an event type as it appears on the wire.
pub trait EventContract: Serialize + DeserializeOwned {
    /// Contract name, used in logs.
    const NAME: &'static str;

    /// Canonical (camelCase) field names.
    const FIELDS: &'static [&'static str];

    fn into_domain(self) -> DomainEvent;
}

impl EventContract for AnalysisStarted {
    const NAME: &'static str = "AnalysisStarted";
    const FIELDS: &'static [&'static str] = &["correlationId", "objectKey"];

    fn into_domain(self) -> DomainEvent {
        DomainEvent::Started(self)
    }
}

impl EventContract for AnalysisCompleted {
    const NAME: &'static str = "AnalysisCompleted";
    const FIELDS: &'static [&'static str] = &["correlationId", "result"];

    fn into_domain(self) -> DomainEvent {
        DomainEvent::Completed(self)
    }
}

/// Registry of the inbound event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    AnalysisStarted,
    AnalysisCompleted,
}

impl EventKind {
    pub const ALL: [EventKind; 2] = [EventKind::AnalysisStarted, EventKind::AnalysisCompleted];

    pub fn name(self) -> &'static str {
        match self {
            EventKind::AnalysisStarted => AnalysisStarted::NAME,
            EventKind::AnalysisCompleted => AnalysisCompleted::NAME,
        }
    }

    /// Fan-out topic subscribers listen on for this event type.
    pub fn topic(self) -> &'static str {
        match self {
            EventKind::AnalysisStarted => STARTED_TOPIC,
            EventKind::AnalysisCompleted => COMPLETED_TOPIC,
        }
    }

    pub fn decoder(self) -> DecodeFn {
        match self {
            EventKind::AnalysisStarted => decode::<AnalysisStarted>,
            EventKind::AnalysisCompleted => decode::<AnalysisCompleted>,
        }
    }
}

/// Decode a UTF-8 JSON body into the domain event described by `E`.
pub fn decode<E: EventContract>(raw: &[u8]) -> Result<DomainEvent, DecodeError> {
    let value: Value = serde_json::from_slice(raw).map_err(DecodeError::Json)?;
    let Value::Object(fields) = value else {
        return Err(DecodeError::NotAnObject { event: E::NAME });
    };

    let canonical = canonicalize_keys(fields, E::FIELDS);
    let event: E = serde_json::from_value(Value::Object(canonical)).map_err(|source| {
        DecodeError::Contract {
            event: E::NAME,
            source,
        }
    })?;

    Ok(event.into_domain())
}

/// Rename keys that match a known field case-insensitively to the field's
/// canonical spelling. An exact match wins over a case-folded one.
fn canonicalize_keys(fields: Map<String, Value>, known: &[&str]) -> Map<String, Value> {
    let mut out = Map::with_capacity(fields.len());
    let mut folded = Vec::new();

    for (key, value) in fields {
        if known.contains(&key.as_str()) {
            out.insert(key, value);
            continue;
        }
        match known.iter().find(|k| k.eq_ignore_ascii_case(&key)) {
            Some(canonical) => folded.push((canonical.to_string(), value)),
            None => {
                out.insert(key, value);
            }
        }
    }

    for (key, value) in folded {
        out.entry(key).or_insert(value);
    }

    out
}
