//! The event bridge: broker queues in, fan-out topics out.
//!
//! ```text
//! exchange ─> queue ─> consumer ─> pipeline (decode) ─> TopicSender ─> subscribers
//! ```
//!
//! - `binding`: the static routing table
//! - `pipeline`: decode-and-forward for a single message
//! - `consumer`: one task per queue, feeding the pipeline in broker order
//! - `supervisor`: connection lifecycle, reconnect backoff and shutdown

pub mod binding;
pub mod consumer;
pub mod pipeline;
pub mod supervisor;

pub use binding::{analysis_bindings, EventBinding};
pub use consumer::ConsumerStats;
pub use pipeline::{HandleOutcome, Pipeline};
pub use supervisor::{BridgeWorker, WorkerState};
