//! Supervisor loop: owns the worker lifetime and turns broker failures into
//! retries.
//!
//! ```text
//!            ┌──────────── failure ────────────┐
//!            v                                 │
//! Starting ──ok──> Running ──connection lost──> Backoff ──delay──> Starting
//!    │                │                            │
//!    └── shutdown ────┴────────── shutdown ────────┴──> Stopped
//! ```
//!
//! Only cancellation ends the loop. Each pass through Starting opens a fresh
//! connection; the previous one is always torn down first.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::consumer::run_consumer;
use super::{EventBinding, Pipeline};
use crate::bus::{BridgeError, BrokerConnector, BrokerSession, TopicSender};
use crate::config::ReconnectConfig;
use crate::utils::{ReconnectBackoff, ShutdownToken};

/// Default bound on connect and topology declaration.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Bound on releasing a connection during teardown.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Supervisor states, observable through [`BridgeWorker::state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Starting,
    Running,
    Backoff,
    Stopped,
}

/// How a connected session ended.
enum SessionEnd {
    Cancelled,
    Failed(BridgeError),
}

/// The event bridge worker.
pub struct BridgeWorker {
    connector: Arc<dyn BrokerConnector>,
    bindings: Arc<[EventBinding]>,
    pipeline: Pipeline,
    reconnect: ReconnectConfig,
    connect_timeout: Duration,
    state: watch::Sender<WorkerState>,
}

impl BridgeWorker {
    pub fn new(
        connector: Arc<dyn BrokerConnector>,
        bindings: Vec<EventBinding>,
        sender: Arc<dyn TopicSender>,
    ) -> Self {
        let (state, _) = watch::channel(WorkerState::Starting);
        Self {
            connector,
            bindings: bindings.into(),
            pipeline: Pipeline::new(sender),
            reconnect: ReconnectConfig::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            state,
        }
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Watch the supervisor state.
    pub fn state(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: WorkerState) {
        self.state.send_replace(state);
    }

    /// Run until `shutdown` is signalled. Broker failures are retried forever.
    pub async fn run(self, shutdown: ShutdownToken) {
        let mut backoff = ReconnectBackoff::new(self.reconnect.clone());
        info!(
            broker = %self.connector.describe(),
            bindings = self.bindings.len(),
            "Bridge worker starting"
        );

        loop {
            self.set_state(WorkerState::Starting);
            if shutdown.is_cancelled() {
                break;
            }

            match self.run_session(&shutdown, &mut backoff).await {
                SessionEnd::Cancelled => break,
                SessionEnd::Failed(e) => {
                    let delay = backoff.next_delay();
                    error!(
                        error = %e,
                        backoff_ms = %delay.as_millis(),
                        "Bridge connection failed, retrying after backoff"
                    );
                    self.set_state(WorkerState::Backoff);
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        self.set_state(WorkerState::Stopped);
        info!("Bridge worker stopped");
    }

    /// Starting + Running for one connection. Always leaves no connection open.
    async fn run_session(
        &self,
        shutdown: &ShutdownToken,
        backoff: &mut ReconnectBackoff,
    ) -> SessionEnd {
        let connected = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return SessionEnd::Cancelled,
            r = tokio::time::timeout(self.connect_timeout, self.connector.connect()) => r,
        };
        let mut session = match connected {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => return SessionEnd::Failed(e),
            Err(_) => {
                return SessionEnd::Failed(BridgeError::Connection(format!(
                    "Timed out after {:?} connecting to {}",
                    self.connect_timeout,
                    self.connector.describe()
                )))
            }
        };

        let (lost_tx, mut lost_rx) = mpsc::channel(self.bindings.len().max(1));
        let mut consumers = JoinSet::new();

        let prepared = tokio::select! {
            biased;
            _ = shutdown.cancelled() => Err(SessionEnd::Cancelled),
            r = self.prepare(session.as_ref(), shutdown, &lost_tx, &mut consumers) => {
                r.map_err(SessionEnd::Failed)
            }
        };
        drop(lost_tx);

        let end = match prepared {
            Err(end) => end,
            Ok(()) => {
                self.set_state(WorkerState::Running);
                backoff.reset();
                info!(
                    broker = %self.connector.describe(),
                    consumers = consumers.len(),
                    "Bridge running"
                );

                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => SessionEnd::Cancelled,
                    Some(e) = lost_rx.recv() => SessionEnd::Failed(e),
                    Some(joined) = consumers.join_next() => {
                        // Consumers only stop on their own after reporting on
                        // `lost`; anything else leaves a queue unconsumed.
                        let reason = match joined {
                            Ok(()) => "Consumer task exited".to_string(),
                            Err(e) if e.is_panic() => "Consumer task panicked".to_string(),
                            Err(e) => format!("Consumer task failed: {}", e),
                        };
                        SessionEnd::Failed(BridgeError::ConnectionLost(reason))
                    }
                    e = session.closed() => SessionEnd::Failed(e),
                }
            }
        };

        Self::teardown(session, consumers, &end).await;
        end
    }

    /// Declare topology and start one consumer task per binding.
    async fn prepare(
        &self,
        session: &dyn BrokerSession,
        shutdown: &ShutdownToken,
        lost: &mpsc::Sender<BridgeError>,
        consumers: &mut JoinSet<()>,
    ) -> Result<(), BridgeError> {
        match tokio::time::timeout(self.connect_timeout, session.declare_topology(&self.bindings))
            .await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(BridgeError::Topology(format!(
                    "Timed out after {:?} declaring topology",
                    self.connect_timeout
                )))
            }
        }
        debug!(bindings = self.bindings.len(), "Topology declared");

        for binding in self.bindings.iter() {
            let deliveries = session.start_consuming(binding).await?;
            let binding = binding.clone();
            let pipeline = self.pipeline.clone();
            let shutdown = shutdown.clone();
            let lost = lost.clone();
            consumers.spawn(async move {
                let queue = binding.queue.clone();
                let stats = run_consumer(binding, deliveries, pipeline, shutdown, lost).await;
                debug!(
                    queue = %queue,
                    received = stats.received,
                    forwarded = stats.forwarded,
                    dropped = stats.dropped,
                    "Consumer finished"
                );
            });
        }
        Ok(())
    }

    /// Stop consumers, then release the channel and connection.
    async fn teardown(
        mut session: Box<dyn BrokerSession>,
        mut consumers: JoinSet<()>,
        end: &SessionEnd,
    ) {
        consumers.abort_all();
        while consumers.join_next().await.is_some() {}

        if tokio::time::timeout(CLOSE_TIMEOUT, session.close())
            .await
            .is_err()
        {
            match end {
                SessionEnd::Cancelled => debug!("Timed out closing broker connection"),
                SessionEnd::Failed(_) => warn!("Timed out closing broker connection"),
            }
        }
        drop(session);
        debug!("Broker connection released");
    }
}
