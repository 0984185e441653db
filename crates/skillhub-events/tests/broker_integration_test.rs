//! Round trips against real brokers.
//!
//! Requires a running AMQP broker and Kafka cluster:
//! `AMQP_URL=amqp://127.0.0.1:5672/%2f KAFKA_BOOTSTRAP_SERVERS=127.0.0.1:9092 \
//!  cargo test -p skillhub-events --features integration`

#![cfg(feature = "integration")]

mod common;

use std::time::Duration;

use common::init_test_logging;
use serde_json::json;
use skillhub_events::{
    AckHandle, EventBus, EventBusConfig, EventEnvelope, HandlerError, PublishOptions,
    RecordContext, StreamOptions, SubscribeOptions,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(30);

async fn connected_bus(run: &str) -> EventBus {
    init_test_logging();
    let mut config = EventBusConfig::from_env().expect("broker configuration in env");
    config.reliable.exchange = format!("skillhub.it.{run}");
    config.consumer_group = format!("it-{run}");

    let bus = EventBus::from_config(config);
    bus.connect(&CancellationToken::new())
        .await
        .expect("brokers reachable");
    bus
}

#[tokio::test]
async fn test_reliable_round_trip() {
    let run = Uuid::new_v4().simple().to_string();
    let bus = connected_bus(&run).await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    bus.subscribe(
        "booking.*",
        move |envelope: EventEnvelope, _ack: AckHandle| {
            let _ = tx.send(envelope);
            std::future::ready(Ok::<(), HandlerError>(()))
        },
        SubscribeOptions::default(),
    )
    .await
    .unwrap();

    let id = bus
        .publish("booking.created", json!({"id": "b1"}), PublishOptions::default())
        .await
        .unwrap();

    let envelope = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(envelope.id(), id);
    assert_eq!(envelope.data()["id"], "b1");
    assert!(bus.health_check().is_healthy());

    bus.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_stream_round_trip() {
    let run = Uuid::new_v4().simple().to_string();
    let bus = connected_bus(&run).await;
    let topic = format!("skill_created_{run}");
    let (tx, mut rx) = mpsc::unbounded_channel();

    let id = bus
        .publish(
            "skill.created",
            json!({"skill_id": "sk-1"}),
            PublishOptions::default().with_topic(topic.clone()),
        )
        .await
        .unwrap();

    bus.subscribe_stream(
        &[topic.as_str()],
        None,
        move |envelope: EventEnvelope, ctx: RecordContext| {
            let _ = tx.send((envelope, ctx));
            std::future::ready(Ok::<(), HandlerError>(()))
        },
        StreamOptions::default().from_beginning(),
    )
    .await
    .unwrap();

    let (envelope, ctx) = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(envelope.id(), id);
    assert_eq!(ctx.topic, topic);
    assert_eq!(ctx.headers["eventType"], "skill.created");

    bus.disconnect().await.unwrap();
}
