//! Bootstrap utilities for the bridge binary.
//!
//! Tracing setup and the shutdown signal shared by every long-lived task.

use std::future::Future;

use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{LOG_ENV_VAR, LOG_FORMAT_ENV_VAR};

/// Initialize tracing with BRIDGE_LOG environment variable.
///
/// Defaults to "info" level if BRIDGE_LOG is not set. Set BRIDGE_LOG_FORMAT=json
/// for JSON lines output.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let json = std::env::var(LOG_FORMAT_ENV_VAR)
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Config file path from `--config <path>` or `--config=<path>`, if given.
pub fn parse_config_path() -> Option<String> {
    config_path_from(std::env::args().skip(1))
}

fn config_path_from(mut args: impl Iterator<Item = String>) -> Option<String> {
    while let Some(arg) = args.next() {
        if arg == "--config" || arg == "-c" {
            return args.next();
        }
        if let Some(path) = arg.strip_prefix("--config=") {
            return Some(path.to_string());
        }
    }
    None
}

/// Wait for `worker`, triggering `shutdown` when `signal` fires.
///
/// A signal listener that fails is logged and ignored; the worker keeps
/// running until it exits on its own or is stopped some other way.
pub async fn run_until_signal<F>(
    signal: F,
    shutdown: &ShutdownHandle,
    mut worker: JoinHandle<()>,
) -> Result<(), JoinError>
where
    F: Future<Output = std::io::Result<()>>,
{
    tokio::select! {
        result = signal => match result {
            Ok(()) => {
                info!("Shutdown requested");
                shutdown.trigger();
                worker.await
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for shutdown signal");
                worker.await
            }
        },
        result = &mut worker => result,
    }
}

/// Create a linked shutdown handle and token.
pub fn shutdown_channel() -> (ShutdownHandle, ShutdownToken) {
    let (tx, rx) = watch::channel(false);
    (ShutdownHandle { tx }, ShutdownToken { rx })
}

/// Raises the shutdown signal.
///
/// Dropping every handle also counts as shutdown: nothing could ever stop the
/// worker otherwise.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

impl ShutdownHandle {
    /// Signal every token to stop. Idempotent.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    /// A new token observing this handle.
    pub fn token(&self) -> ShutdownToken {
        ShutdownToken {
            rx: self.tx.subscribe(),
        }
    }
}

/// Observes the shutdown signal. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ShutdownToken {
    rx: watch::Receiver<bool>,
}

impl ShutdownToken {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    /// Resolves once shutdown has been signalled.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // Err means every handle is gone.
        let _ = rx.wait_for(|stop| *stop).await;
    }
}
