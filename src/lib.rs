//! Analysis bridge - RabbitMQ to in-process event fan-out
//!
//! Consumes analysis lifecycle events from durable broker queues, decodes
//! them into typed domain events and republishes each one to an in-process
//! topic for live subscribers. A supervisor keeps exactly one broker
//! connection alive and reconnects with backoff until shutdown.

pub mod bridge;
pub mod bus;
pub mod config;
pub mod events;
pub mod utils;
