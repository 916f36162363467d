//! Mock broker for testing.
//!
//! Scriptable stand-in for a RabbitMQ connection: connects and topology
//! declarations can be made to fail or hang, messages can be pushed onto
//! queues of the current session, consumers can be crashed, and the current
//! connection can be dropped as if the broker went away.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::{BridgeError, BrokerConnector, BrokerSession, Delivery, DeliveryStream, Result};
use crate::bridge::EventBinding;

/// What a mock queue hands to its consumer stream.
enum MockItem {
    Message(Result<Delivery>),
    Crash,
}

#[derive(Default)]
struct MockState {
    connect_failures: usize,
    connect_hangs: usize,
    topology_failures: usize,
    topology_hangs: usize,
    connects: usize,
    declarations: usize,
    closes: usize,
    live_sessions: usize,
    max_live_sessions: usize,
    next_session: u64,
    current: Option<u64>,
    /// Declared queue name to the exchange it is bound to.
    declared: HashMap<String, String>,
    queues: HashMap<String, mpsc::UnboundedSender<MockItem>>,
    kill: Option<oneshot::Sender<String>>,
}

/// In-memory broker. Clones share state.
#[derive(Clone, Default)]
pub struct MockBroker {
    state: Arc<Mutex<MockState>>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Make the next `n` connection attempts fail.
    pub fn fail_next_connects(&self, n: usize) {
        self.lock().connect_failures = n;
    }

    /// Make the next `n` topology declarations fail.
    pub fn fail_next_declarations(&self, n: usize) {
        self.lock().topology_failures = n;
    }

    /// Make the next `n` connection attempts never complete.
    pub fn hang_next_connects(&self, n: usize) {
        self.lock().connect_hangs = n;
    }

    /// Make the next `n` topology declarations never complete.
    pub fn hang_next_declarations(&self, n: usize) {
        self.lock().topology_hangs = n;
    }

    pub fn connect_count(&self) -> usize {
        self.lock().connects
    }

    pub fn declare_count(&self) -> usize {
        self.lock().declarations
    }

    pub fn close_count(&self) -> usize {
        self.lock().closes
    }

    pub fn live_sessions(&self) -> usize {
        self.lock().live_sessions
    }

    /// Highest number of simultaneously open sessions observed.
    pub fn max_live_sessions(&self) -> usize {
        self.lock().max_live_sessions
    }

    /// Exchange a queue was bound to, if declared.
    pub fn bound_exchange(&self, queue: &str) -> Option<String> {
        self.lock().declared.get(queue).cloned()
    }

    /// Whether the current session has a consumer on `queue`.
    pub fn is_consuming(&self, queue: &str) -> bool {
        self.lock()
            .queues
            .get(queue)
            .map(|tx| !tx.is_closed())
            .unwrap_or(false)
    }

    /// Push a message onto `queue`. Returns false if nobody is consuming it.
    pub fn deliver(&self, queue: &str, data: impl Into<Vec<u8>>) -> bool {
        let state = self.lock();
        let Some(tx) = state.queues.get(queue) else {
            return false;
        };
        let exchange = state.declared.get(queue).cloned().unwrap_or_default();
        tx.send(MockItem::Message(Ok(Delivery {
            exchange,
            routing_key: String::new(),
            data: data.into(),
        })))
        .is_ok()
    }

    /// Make the consumer stream on `queue` panic on its next poll.
    pub fn crash_consumer(&self, queue: &str) -> bool {
        self.lock()
            .queues
            .get(queue)
            .map(|tx| tx.send(MockItem::Crash).is_ok())
            .unwrap_or(false)
    }

    /// Simulate the broker closing the current connection.
    pub fn drop_connection(&self, reason: &str) -> bool {
        let mut state = self.lock();
        state.queues.clear();
        match state.kill.take() {
            Some(kill) => kill.send(reason.to_string()).is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl BrokerConnector for MockBroker {
    async fn connect(&self) -> Result<Box<dyn BrokerSession>> {
        let hang = {
            let mut state = self.lock();
            state.connects += 1;
            let hang = state.connect_hangs > 0;
            if hang {
                state.connect_hangs -= 1;
            }
            hang
        };
        if hang {
            std::future::pending::<()>().await;
        }

        let mut state = self.lock();
        if state.connect_failures > 0 {
            state.connect_failures -= 1;
            return Err(BridgeError::Connection("Mock connection refused".to_string()));
        }

        state.next_session += 1;
        let id = state.next_session;
        state.current = Some(id);
        state.queues.clear();
        state.live_sessions += 1;
        state.max_live_sessions = state.max_live_sessions.max(state.live_sessions);

        let (kill_tx, kill_rx) = oneshot::channel();
        state.kill = Some(kill_tx);

        Ok(Box::new(MockSession {
            id,
            broker: self.clone(),
            killed: Some(kill_rx),
            open: true,
        }))
    }

    fn describe(&self) -> String {
        "mock://broker".to_string()
    }
}

struct MockSession {
    id: u64,
    broker: MockBroker,
    killed: Option<oneshot::Receiver<String>>,
    open: bool,
}

impl MockSession {
    fn release(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        let mut state = self.broker.lock();
        state.live_sessions -= 1;
        if state.current == Some(self.id) {
            state.current = None;
            state.queues.clear();
            state.kill = None;
        }
    }
}

#[async_trait]
impl BrokerSession for MockSession {
    async fn declare_topology(&self, bindings: &[EventBinding]) -> Result<()> {
        let hang = {
            let mut state = self.broker.lock();
            state.declarations += 1;
            let hang = state.topology_hangs > 0;
            if hang {
                state.topology_hangs -= 1;
            }
            hang
        };
        if hang {
            std::future::pending::<()>().await;
        }

        let mut state = self.broker.lock();
        if state.topology_failures > 0 {
            state.topology_failures -= 1;
            return Err(BridgeError::Topology(
                "Mock PRECONDITION_FAILED: inequivalent arg 'durable'".to_string(),
            ));
        }
        for binding in bindings {
            state
                .declared
                .insert(binding.queue.clone(), binding.exchange.clone());
        }
        Ok(())
    }

    async fn start_consuming(&self, binding: &EventBinding) -> Result<DeliveryStream> {
        let mut state = self.broker.lock();
        if state.current != Some(self.id) {
            return Err(BridgeError::Consume("Session no longer current".to_string()));
        }
        if !state.declared.contains_key(&binding.queue) {
            return Err(BridgeError::Consume(format!(
                "NOT_FOUND - no queue '{}'",
                binding.queue
            )));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.queues.insert(binding.queue.clone(), tx);
        Ok(UnboundedReceiverStream::new(rx)
            .map(|item| match item {
                MockItem::Message(delivery) => delivery,
                MockItem::Crash => panic!("mock consumer crashed"),
            })
            .boxed())
    }

    async fn closed(&mut self) -> BridgeError {
        let Some(killed) = self.killed.as_mut() else {
            return BridgeError::ConnectionLost("Mock connection already closed".to_string());
        };
        let outcome = killed.await;
        self.killed = None;
        match outcome {
            Ok(reason) => BridgeError::ConnectionLost(reason),
            Err(_) => BridgeError::ConnectionLost("Mock connection dropped".to_string()),
        }
    }

    async fn close(&mut self) {
        self.broker.lock().closes += 1;
        self.release();
    }
}

impl Drop for MockSession {
    fn drop(&mut self) {
        self.release();
    }
}
