//! analysis-bridge: RabbitMQ to in-process event bridge
//!
//! Consumes analysis lifecycle events from durable RabbitMQ queues and
//! republishes them to in-process topics.
//!
//! ## Architecture
//! ```text
//! [analysis.started]   -> [analysis.started.bridge]   --+
//!                                                       +--> [analysis-bridge] -> analysis/started
//! [analysis.completed] -> [analysis.completed.bridge] --+                      -> analysis/completed
//! ```
//!
//! ## Configuration
//! - BRIDGE__BROKER__HOST / USERNAME / PASSWORD: required broker settings
//! - BRIDGE_CONFIG or `--config <path>`: optional YAML file
//! - BRIDGE_LOG: tracing filter (default "info")
//! - BRIDGE_LOG_FORMAT=json: JSON log lines

use std::sync::Arc;

use tracing::{error, info};

use analysis_bridge::bridge::{analysis_bindings, BridgeWorker};
use analysis_bridge::bus::{AmqpConnector, ChannelTopicSender};
use analysis_bridge::config::Config;
use analysis_bridge::utils::{bootstrap, shutdown_channel};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    bootstrap::init_tracing();

    let config_path = bootstrap::parse_config_path();
    let config = Config::load(config_path.as_deref()).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;
    let settings = config.broker().map_err(|e| {
        error!("Invalid broker configuration: {}", e);
        e
    })?;

    info!(endpoint = %settings.endpoint(), "Starting analysis-bridge");

    let sender = Arc::new(ChannelTopicSender::new(config.fanout.capacity));
    let worker = BridgeWorker::new(
        Arc::new(AmqpConnector::new(settings.clone())),
        analysis_bindings(&config.topology),
        sender.clone(),
    )
    .with_reconnect(config.reconnect.clone())
    .with_connect_timeout(settings.connect_timeout);

    let (shutdown, token) = shutdown_channel();
    let task = tokio::spawn(worker.run(token));

    bootstrap::run_until_signal(tokio::signal::ctrl_c(), &shutdown, task).await?;

    sender.shutdown();
    info!("analysis-bridge exited");
    Ok(())
}
