//! Connect, publish policy, health and shutdown behaviour of the bus.

mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{eventually, TestBus};
use serde::{Deserialize, Serialize};
use serde_json::json;
use skillhub_events::broker::memory::{MemoryLogBroker, MemoryQueueBroker};
use skillhub_events::{
    AckHandle, DurabilityPolicy, Event, EventBus, EventEnvelope, EventError, HandlerError,
    PublishOptions, RecordContext, StreamOptions, SubscribeOptions,
};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct SkillCreated {
    skill_id: String,
    title: String,
    tags: Vec<String>,
}

impl Event for SkillCreated {
    const EVENT_TYPE: &'static str = "skill.created";
}

#[tokio::test]
async fn test_operations_require_connection() {
    let t = TestBus::disconnected_with(TestBus::config());

    let result = t
        .bus
        .publish("skill.created", json!({}), PublishOptions::default())
        .await;
    assert!(matches!(result, Err(EventError::NotConnected)));

    let handler = |_e: EventEnvelope, _a: AckHandle| async { Ok::<(), HandlerError>(()) };
    let result = t
        .bus
        .subscribe("skill.*", handler, SubscribeOptions::default())
        .await;
    assert!(matches!(result, Err(EventError::NotConnected)));

    let health = t.bus.health_check();
    assert!(!health.reliable && !health.stream && !health.overall);
}

#[tokio::test]
async fn test_disconnect_is_idempotent() {
    let never = TestBus::disconnected_with(TestBus::config());
    assert!(matches!(
        never.bus.disconnect().await,
        Err(EventError::NotConnected)
    ));

    let t = TestBus::connected().await;
    assert!(t.bus.is_connected());
    assert!(t.bus.disconnect().await.is_ok());
    assert!(matches!(
        t.bus.disconnect().await,
        Err(EventError::NotConnected)
    ));
    assert!(!t.bus.health_check().overall);
}

#[tokio::test]
async fn test_reconnect_after_disconnect() {
    let t = TestBus::connected().await;
    t.bus.disconnect().await.unwrap();
    t.bus.connect(&CancellationToken::new()).await.unwrap();

    let id = t
        .bus
        .publish("skill.created", json!({}), PublishOptions::default())
        .await
        .unwrap();
    assert!(!id.is_empty());
    assert!(t.bus.health_check().is_healthy());
}

#[tokio::test]
async fn test_connect_fails_when_stream_is_down() {
    let queues = MemoryQueueBroker::new();
    let logs = MemoryLogBroker::new();
    logs.set_available(false);
    let config = TestBus::config().build().unwrap();
    let bus = EventBus::in_memory(config, &queues, &logs);

    let result = bus.connect(&CancellationToken::new()).await;
    assert!(result.is_err());
    assert!(!bus.is_connected());
    // The reliable channel opened first is closed again
    assert!(!bus.health_check().reliable);
}

#[tokio::test]
async fn test_connect_honours_cancellation() {
    let t = TestBus::disconnected_with(TestBus::config());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = t.bus.connect(&cancel).await;
    assert!(matches!(result, Err(EventError::Cancelled)));
    assert!(!t.bus.is_connected());
}

#[tokio::test]
async fn test_health_aggregates_both_channels() {
    let t = TestBus::connected().await;
    assert!(t.bus.health_check().is_healthy());

    t.logs.set_available(false);
    let status = t.bus.health_check();
    assert!(status.reliable);
    assert!(!status.stream);
    assert!(!status.overall);

    t.logs.set_available(true);
    assert!(eventually(Duration::from_secs(2), || t.bus.health_check().overall).await);
}

#[tokio::test]
async fn test_require_reliable_publishes_through_stream_outage() {
    let t = TestBus::connected().await;
    t.bus
        .subscribe(
            "skill.*",
            |_e: EventEnvelope, _a: AckHandle| async { Ok::<(), HandlerError>(()) },
            SubscribeOptions::default().with_queue_name("skills"),
        )
        .await
        .unwrap();
    t.logs.set_available(false);

    let result = t
        .bus
        .publish("skill.created", json!({}), PublishOptions::default())
        .await;
    assert!(result.is_ok());
    assert_eq!(t.bus.health_check().stream_publish_failures, 1);
}

#[tokio::test]
async fn test_require_both_fails_on_stream_outage() {
    let t = TestBus::connected_with(TestBus::config().durability(DurabilityPolicy::RequireBoth))
        .await;
    t.logs.set_available(false);

    let result = t
        .bus
        .publish("skill.created", json!({}), PublishOptions::default())
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_typed_event_round_trip() {
    let t = TestBus::connected().await;
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let handler = move |envelope: EventEnvelope, _ctx: RecordContext| {
        let _ = tx.send(envelope.data_as::<SkillCreated>());
        std::future::ready(Ok::<(), HandlerError>(()))
    };

    let topic = SkillCreated::topic();
    t.bus
        .subscribe_stream(&[topic.as_str()], None, handler, StreamOptions::default())
        .await
        .unwrap();

    let event = SkillCreated {
        skill_id: "sk-1".to_string(),
        title: "Rust for services".to_string(),
        tags: vec!["rust".to_string(), "async".to_string()],
    };
    t.bus
        .publish_event(&event, PublishOptions::default())
        .await
        .unwrap();

    let received = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(received, event);
}

#[tokio::test]
async fn test_disconnect_drains_in_flight_handler() {
    let t = TestBus::connected().await;
    let started = Arc::new(AtomicBool::new(false));
    let finished = Arc::new(AtomicUsize::new(0));

    let (s, f) = (started.clone(), finished.clone());
    let handler = move |_e: EventEnvelope, _a: AckHandle| {
        let (s, f) = (s.clone(), f.clone());
        async move {
            s.store(true, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(200)).await;
            f.fetch_add(1, Ordering::SeqCst);
            Ok::<(), HandlerError>(())
        }
    };

    t.bus
        .subscribe(
            "slow.*",
            handler,
            SubscribeOptions::default().with_queue_name("slow"),
        )
        .await
        .unwrap();
    t.bus
        .publish("slow.job", json!({}), PublishOptions::default())
        .await
        .unwrap();
    assert!(eventually(Duration::from_secs(2), || started.load(Ordering::SeqCst)).await);

    t.bus.disconnect().await.unwrap();
    assert_eq!(finished.load(Ordering::SeqCst), 1);
    assert_eq!(t.queues.queue_depth("slow"), 0);
}

#[tokio::test]
async fn test_shutdown_grace_bounds_disconnect() {
    let t = TestBus::connected_with(TestBus::config().shutdown_grace(Duration::from_millis(100)))
        .await;
    let started = Arc::new(AtomicBool::new(false));

    let s = started.clone();
    let handler = move |_e: EventEnvelope, _a: AckHandle| {
        let s = s.clone();
        async move {
            s.store(true, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok::<(), HandlerError>(())
        }
    };

    t.bus
        .subscribe(
            "stuck.*",
            handler,
            SubscribeOptions::default().with_queue_name("stuck"),
        )
        .await
        .unwrap();
    t.bus
        .publish("stuck.job", json!({}), PublishOptions::default())
        .await
        .unwrap();
    assert!(eventually(Duration::from_secs(2), || started.load(Ordering::SeqCst)).await);

    let begun = tokio::time::Instant::now();
    t.bus.disconnect().await.unwrap();
    assert!(begun.elapsed() < Duration::from_secs(5));

    // The unacknowledged message goes back to the queue
    assert!(eventually(Duration::from_secs(2), || t.queues.queue_depth("stuck") == 1).await);
}
