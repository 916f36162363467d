//! Shared helpers: process bootstrap, shutdown signalling and reconnect backoff.

pub mod bootstrap;
pub mod retry;

pub use bootstrap::{shutdown_channel, ShutdownHandle, ShutdownToken};
pub use retry::ReconnectBackoff;
