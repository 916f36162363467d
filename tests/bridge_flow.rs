//! End-to-end bridge tests against the in-memory broker.
//!
//! Run with: cargo test --test bridge_flow
//!
//! Drives the public API only: a `BridgeWorker` wired to a `MockBroker` and a
//! `ChannelTopicSender`, observed through topic subscriptions.

use std::sync::Arc;
use std::time::Duration;

use analysis_bridge::bridge::{analysis_bindings, BridgeWorker, WorkerState};
use analysis_bridge::bus::{ChannelTopicSender, MockBroker, TopicSubscription};
use analysis_bridge::config::{ReconnectConfig, TopologyConfig};
use analysis_bridge::events::{
    AnalysisCompleted, AnalysisStarted, DomainEvent, COMPLETED_TOPIC, STARTED_TOPIC,
};
use analysis_bridge::utils::{shutdown_channel, ShutdownHandle};
use tokio::sync::watch;
use tokio::task::JoinHandle;

const STARTED_QUEUE: &str = "analysis.started.bridge";
const COMPLETED_QUEUE: &str = "analysis.completed.bridge";
const WAIT: Duration = Duration::from_secs(5);

struct Bridge {
    broker: MockBroker,
    sender: Arc<ChannelTopicSender>,
    state: watch::Receiver<WorkerState>,
    shutdown: ShutdownHandle,
    task: JoinHandle<()>,
}

impl Bridge {
    fn start() -> Self {
        let broker = MockBroker::new();
        let sender = Arc::new(ChannelTopicSender::default());
        let worker = BridgeWorker::new(
            Arc::new(broker.clone()),
            analysis_bindings(&TopologyConfig::default()),
            sender.clone(),
        )
        .with_reconnect(ReconnectConfig::fixed(Duration::from_millis(20)));
        let state = worker.state();
        let (shutdown, token) = shutdown_channel();
        let task = tokio::spawn(worker.run(token));
        Self {
            broker,
            sender,
            state,
            shutdown,
            task,
        }
    }

    async fn running(&mut self) {
        tokio::time::timeout(WAIT, self.state.wait_for(|s| *s == WorkerState::Running))
            .await
            .expect("bridge never reached Running")
            .unwrap();
    }

    async fn stop(self) {
        self.shutdown.trigger();
        tokio::time::timeout(WAIT, self.task)
            .await
            .expect("bridge did not stop")
            .unwrap();
        self.sender.shutdown();
    }
}

async fn next(sub: &mut TopicSubscription) -> Arc<DomainEvent> {
    tokio::time::timeout(WAIT, sub.recv())
        .await
        .expect("timed out waiting for event")
        .expect("subscription closed")
}

async fn assert_quiet(sub: &mut TopicSubscription) {
    assert!(
        tokio::time::timeout(Duration::from_millis(50), sub.recv())
            .await
            .is_err(),
        "unexpected event on {}",
        sub.topic()
    );
}

#[tokio::test]
async fn test_started_event_reaches_started_topic_only() {
    let mut bridge = Bridge::start();
    let mut started = bridge.sender.subscribe(STARTED_TOPIC);
    let mut completed = bridge.sender.subscribe(COMPLETED_TOPIC);
    bridge.running().await;

    assert!(bridge.broker.deliver(
        STARTED_QUEUE,
        r#"{"correlationId":"abc123","objectKey":"file.csv"}"#
    ));

    assert_eq!(
        *next(&mut started).await,
        DomainEvent::Started(AnalysisStarted {
            correlation_id: "abc123".to_string(),
            object_key: "file.csv".to_string(),
        })
    );
    assert_quiet(&mut started).await;
    assert_quiet(&mut completed).await;

    bridge.stop().await;
}

#[tokio::test]
async fn test_completed_event_with_mixed_case_fields() {
    let mut bridge = Bridge::start();
    let mut completed = bridge.sender.subscribe(COMPLETED_TOPIC);
    bridge.running().await;

    assert!(bridge.broker.deliver(
        COMPLETED_QUEUE,
        r#"{"CorrelationId":"c-7","RESULT":"clean","extra":true}"#
    ));

    assert_eq!(
        *next(&mut completed).await,
        DomainEvent::Completed(AnalysisCompleted {
            correlation_id: "c-7".to_string(),
            result: "clean".to_string(),
        })
    );

    bridge.stop().await;
}

#[tokio::test]
async fn test_every_subscriber_receives_each_event_once() {
    let mut bridge = Bridge::start();
    let mut first = bridge.sender.subscribe(STARTED_TOPIC);
    let mut second = bridge.sender.subscribe(STARTED_TOPIC);
    bridge.running().await;

    assert!(bridge
        .broker
        .deliver(STARTED_QUEUE, r#"{"correlationId":"fan","objectKey":"k"}"#));

    assert_eq!(next(&mut first).await.correlation_id(), "fan");
    assert_eq!(next(&mut second).await.correlation_id(), "fan");
    assert_quiet(&mut first).await;
    assert_quiet(&mut second).await;

    bridge.stop().await;
}

#[tokio::test]
async fn test_queue_order_preserved() {
    let mut bridge = Bridge::start();
    let mut started = bridge.sender.subscribe(STARTED_TOPIC);
    bridge.running().await;

    for i in 0..25 {
        let body = format!(r#"{{"correlationId":"{}","objectKey":"obj-{}"}}"#, i, i);
        assert!(bridge.broker.deliver(STARTED_QUEUE, body));
    }

    for i in 0..25 {
        assert_eq!(next(&mut started).await.correlation_id(), i.to_string());
    }

    bridge.stop().await;
}

#[tokio::test]
async fn test_poison_messages_are_skipped() {
    let mut bridge = Bridge::start();
    let mut started = bridge.sender.subscribe(STARTED_TOPIC);
    bridge.running().await;

    for poison in [
        "not json",
        "[1,2,3]",
        r#"{"correlationId":"missing-object-key"}"#,
        r#"{"correlationId":42,"objectKey":"k"}"#,
    ] {
        assert!(bridge.broker.deliver(STARTED_QUEUE, poison));
    }
    assert!(bridge
        .broker
        .deliver(STARTED_QUEUE, r#"{"correlationId":"good","objectKey":"k"}"#));

    assert_eq!(next(&mut started).await.correlation_id(), "good");
    assert_quiet(&mut started).await;
    assert_eq!(bridge.broker.connect_count(), 1);

    bridge.stop().await;
}

#[tokio::test]
async fn test_survives_broker_restart() {
    let mut bridge = Bridge::start();
    let mut completed = bridge.sender.subscribe(COMPLETED_TOPIC);
    bridge.running().await;

    assert!(bridge
        .broker
        .deliver(COMPLETED_QUEUE, r#"{"correlationId":"before","result":"r"}"#));
    assert_eq!(next(&mut completed).await.correlation_id(), "before");

    assert!(bridge.broker.drop_connection("CONNECTION_FORCED"));
    tokio::time::timeout(WAIT, async {
        while !(bridge.broker.connect_count() >= 2 && bridge.broker.is_consuming(COMPLETED_QUEUE))
        {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("bridge did not reconnect");

    assert!(bridge
        .broker
        .deliver(COMPLETED_QUEUE, r#"{"correlationId":"after","result":"r"}"#));
    assert_eq!(next(&mut completed).await.correlation_id(), "after");
    assert_eq!(bridge.broker.max_live_sessions(), 1);

    bridge.stop().await;
}

#[tokio::test]
async fn test_shutdown_releases_broker_and_ends_subscriptions() {
    let mut bridge = Bridge::start();
    let mut started = bridge.sender.subscribe(STARTED_TOPIC);
    bridge.running().await;

    let broker = bridge.broker.clone();
    let mut state = bridge.state.clone();
    bridge.stop().await;

    assert_eq!(*state.borrow_and_update(), WorkerState::Stopped);
    assert_eq!(broker.live_sessions(), 0);
    assert!(!broker.is_consuming(STARTED_QUEUE));
    assert!(started.recv().await.is_none());
}
