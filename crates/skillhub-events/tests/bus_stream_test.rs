//! Stream channel consumption through the bus facade.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{eventually, TestBus};
use serde_json::json;
use skillhub_events::broker::memory::{MemoryLogClient, MemoryLogConnector};
use skillhub_events::channel::LogClient;
use skillhub_events::connection::Connector;
use skillhub_events::envelope::Headers;
use skillhub_events::{
    EventEnvelope, HandlerError, PublishOptions, RecordContext, StreamHandler, StreamOptions,
};
use tokio::sync::mpsc;

const WAIT: Duration = Duration::from_secs(2);

fn forwarding() -> (
    impl StreamHandler,
    mpsc::UnboundedReceiver<(EventEnvelope, RecordContext)>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler = move |envelope: EventEnvelope, ctx: RecordContext| {
        let _ = tx.send((envelope, ctx));
        std::future::ready(Ok::<(), HandlerError>(()))
    };
    (handler, rx)
}

async fn raw_client(t: &TestBus) -> MemoryLogClient {
    MemoryLogConnector::new(t.logs.clone())
        .connect()
        .await
        .unwrap()
}

fn envelope_bytes(event_type: &str, data: serde_json::Value) -> (String, Vec<u8>) {
    let envelope = EventEnvelope::new(event_type, data, &PublishOptions::default(), "raw").unwrap();
    (envelope.id().to_string(), envelope.to_json_bytes().unwrap())
}

async fn publish_n(t: &TestBus, event_type: &str, n: usize) -> Vec<String> {
    let mut ids = Vec::with_capacity(n);
    for i in 0..n {
        let id = t
            .bus
            .publish(event_type, json!({ "n": i }), PublishOptions::default())
            .await
            .unwrap();
        ids.push(id);
    }
    ids
}

#[tokio::test]
async fn test_published_events_are_mirrored_to_derived_topic() {
    let t = TestBus::connected().await;
    let (handler, mut rx) = forwarding();

    t.bus
        .subscribe_stream(&["booking_created"], None, handler, StreamOptions::default())
        .await
        .unwrap();
    let id = t
        .bus
        .publish("booking.created", json!({"id": "b1"}), PublishOptions::default())
        .await
        .unwrap();

    let (envelope, ctx) = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(envelope.id(), id);
    assert_eq!(envelope.data()["id"], "b1");
    assert_eq!(ctx.topic, "booking_created");
    assert_eq!(ctx.headers["eventType"], "booking.created");

    assert!(eventually(WAIT, || {
        t.logs.committed_offset("test", "booking_created", ctx.partition) == Some(ctx.offset + 1)
    })
    .await);
}

#[tokio::test]
async fn test_from_beginning_reads_existing_records() {
    let t = TestBus::connected().await;
    let ids = publish_n(&t, "skill.created", 3).await;

    let (handler, mut rx) = forwarding();
    t.bus
        .subscribe_stream(
            &["skill_created"],
            Some("catalog"),
            handler,
            StreamOptions::default().from_beginning(),
        )
        .await
        .unwrap();

    let mut seen = Vec::new();
    for _ in 0..3 {
        let (envelope, _) = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        seen.push(envelope.id().to_string());
    }
    seen.sort();
    let mut expected = ids;
    expected.sort();
    assert_eq!(seen, expected);
}

#[tokio::test]
async fn test_latest_skips_existing_records() {
    let t = TestBus::connected().await;
    publish_n(&t, "skill.created", 2).await;

    let (handler, mut rx) = forwarding();
    t.bus
        .subscribe_stream(&["skill_created"], None, handler, StreamOptions::default())
        .await
        .unwrap();
    let fresh = t
        .bus
        .publish("skill.created", json!({"fresh": true}), PublishOptions::default())
        .await
        .unwrap();

    let (envelope, _) = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(envelope.id(), fresh);
    assert!(tokio::time::timeout(Duration::from_millis(300), rx.recv())
        .await
        .is_err());
}

#[tokio::test]
async fn test_failed_record_is_redelivered_before_offset_moves() {
    let t = TestBus::connected().await;
    let calls = Arc::new(AtomicUsize::new(0));
    let (tx, mut rx) = mpsc::unbounded_channel();

    let counter = calls.clone();
    let handler = move |envelope: EventEnvelope, ctx: RecordContext| {
        let attempt = counter.fetch_add(1, Ordering::SeqCst);
        let tx = tx.clone();
        async move {
            if attempt == 0 {
                return Err::<(), HandlerError>("warehouse offline".into());
            }
            let _ = tx.send((envelope, ctx));
            Ok(())
        }
    };

    t.bus
        .subscribe_stream(&["report_generated"], None, handler, StreamOptions::default())
        .await
        .unwrap();
    let id = t
        .bus
        .publish("report.generated", json!({}), PublishOptions::default())
        .await
        .unwrap();

    let (envelope, ctx) = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(envelope.id(), id);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(eventually(WAIT, || {
        t.logs.committed_offset("test", "report_generated", ctx.partition) == Some(ctx.offset + 1)
    })
    .await);
    assert_eq!(t.bus.health_check().handler_failures, 1);
}

#[tokio::test]
async fn test_records_within_partition_stay_ordered() {
    let t = TestBus::connected().await;
    let (handler, mut rx) = forwarding();

    t.bus
        .subscribe_stream(
            &["ledger_entry"],
            None,
            handler,
            StreamOptions::default().with_concurrency(3),
        )
        .await
        .unwrap();
    publish_n(&t, "ledger.entry", 12).await;

    let mut last_offset: std::collections::HashMap<i32, i64> = std::collections::HashMap::new();
    for _ in 0..12 {
        let (_, ctx) = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        if let Some(previous) = last_offset.insert(ctx.partition, ctx.offset) {
            assert!(ctx.offset > previous, "partition {} went backwards", ctx.partition);
        }
    }
}

#[tokio::test]
async fn test_replay_from_offset() {
    let t = TestBus::connected().await;
    publish_n(&t, "audit.entry", 6).await;

    let topic_records = t.logs.records("audit_entry");
    assert_eq!(topic_records.len(), 6);
    let expected = topic_records.iter().filter(|r| r.offset >= 1).count();

    // Every partition restarts at offset 1.
    let (handler, mut rx) = forwarding();
    t.bus
        .subscribe_stream(
            &["audit_entry"],
            Some("replayer"),
            handler,
            StreamOptions::default().replay_from(1),
        )
        .await
        .unwrap();

    for _ in 0..expected {
        let (_, ctx) = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert!(ctx.offset >= 1);
    }
    assert!(tokio::time::timeout(Duration::from_millis(300), rx.recv())
        .await
        .is_err());
}

#[tokio::test]
async fn test_group_resumes_from_committed_offset() {
    let t = TestBus::connected().await;
    let (handler, mut rx) = forwarding();
    let first = t
        .bus
        .subscribe_stream(
            &["invoice_issued"],
            Some("billing"),
            handler,
            StreamOptions::default().from_beginning(),
        )
        .await
        .unwrap();

    publish_n(&t, "invoice.issued", 2).await;
    for _ in 0..2 {
        tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    }
    t.bus.unsubscribe(first).await.unwrap();

    let later = publish_n(&t, "invoice.issued", 1).await;

    let (handler, mut rx) = forwarding();
    t.bus
        .subscribe_stream(
            &["invoice_issued"],
            Some("billing"),
            handler,
            StreamOptions::default().from_beginning(),
        )
        .await
        .unwrap();

    let (envelope, _) = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(envelope.id(), later[0]);
    assert!(tokio::time::timeout(Duration::from_millis(300), rx.recv())
        .await
        .is_err());
}

#[tokio::test]
async fn test_latest_group_does_not_replay_history_after_outage() {
    let t = TestBus::connected().await;
    publish_n(&t, "skill.created", 3).await;

    let (handler, mut rx) = forwarding();
    t.bus
        .subscribe_stream(&["skill_created"], Some("fresh"), handler, StreamOptions::default())
        .await
        .unwrap();

    t.logs.set_available(false);
    assert!(eventually(WAIT, || t.bus.health_check().stream_consumers_down == 1).await);
    t.logs.set_available(true);
    assert!(eventually(WAIT, || t.bus.health_check().stream).await);

    // History published before the subscription stays skipped
    assert!(tokio::time::timeout(Duration::from_millis(500), rx.recv())
        .await
        .is_err());

    let fresh = t
        .bus
        .publish("skill.created", json!({"fresh": true}), PublishOptions::default())
        .await
        .unwrap();
    let (envelope, _) = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(envelope.id(), fresh);
}

#[tokio::test]
async fn test_undecodable_record_is_skipped_and_committed() {
    let t = TestBus::connected().await;
    let (handler, mut rx) = forwarding();
    t.bus
        .subscribe_stream(&["ingest_raw"], None, handler, StreamOptions::default())
        .await
        .unwrap();

    let client = raw_client(&t).await;
    let (bad_partition, bad_offset) = client
        .produce("ingest_raw", "k-1", b"{not json".to_vec(), Headers::new())
        .await
        .unwrap();
    let (good_id, good_bytes) = envelope_bytes("ingest.raw", json!({"n": 1}));
    let (good_partition, good_offset) = client
        .produce("ingest_raw", "k-1", good_bytes, Headers::new())
        .await
        .unwrap();
    assert_eq!(bad_partition, good_partition);
    assert_eq!(good_offset, bad_offset + 1);

    let (envelope, ctx) = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(envelope.id(), good_id);
    assert_eq!(ctx.offset, good_offset);
    assert!(eventually(WAIT, || {
        t.logs.committed_offset("test", "ingest_raw", good_partition) == Some(good_offset + 1)
    })
    .await);
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_undecodable_record_alone_still_advances_offset() {
    let t = TestBus::connected().await;
    let (handler, mut rx) = forwarding();
    t.bus
        .subscribe_stream(&["ingest_raw"], None, handler, StreamOptions::default())
        .await
        .unwrap();

    let client = raw_client(&t).await;
    let (partition, offset) = client
        .produce("ingest_raw", "k-2", vec![0xff, 0x00, 0x13], Headers::new())
        .await
        .unwrap();

    assert!(eventually(WAIT, || {
        t.logs.committed_offset("test", "ingest_raw", partition) == Some(offset + 1)
    })
    .await);
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_panicking_stream_handler_is_redelivered_without_commit() {
    let t = TestBus::connected().await;
    let calls = Arc::new(AtomicUsize::new(0));
    let (tx, mut rx) = mpsc::unbounded_channel();

    let counter = calls.clone();
    let logs = t.logs.clone();
    let handler = move |envelope: EventEnvelope, ctx: RecordContext| {
        let attempt = counter.fetch_add(1, Ordering::SeqCst);
        let committed = logs.committed_offset("test", &ctx.topic, ctx.partition);
        let tx = tx.clone();
        async move {
            if attempt == 0 {
                panic!("index rebuild blew up");
            }
            let _ = tx.send((envelope, ctx, committed));
            Ok::<(), HandlerError>(())
        }
    };

    t.bus
        .subscribe_stream(&["index_rebuilt"], None, handler, StreamOptions::default())
        .await
        .unwrap();
    let id = t
        .bus
        .publish("index.rebuilt", json!({}), PublishOptions::default())
        .await
        .unwrap();

    let (envelope, ctx, committed_before_retry) =
        tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(envelope.id(), id);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(committed_before_retry, None);
    assert_eq!(t.bus.health_check().handler_panics, 1);
    assert!(eventually(WAIT, || {
        t.logs.committed_offset("test", "index_rebuilt", ctx.partition) == Some(ctx.offset + 1)
    })
    .await);
}

#[tokio::test]
async fn test_replay_group_resumes_after_outage() {
    let t = TestBus::connected().await;
    publish_n(&t, "audit.trail", 4).await;

    let (handler, mut rx) = forwarding();
    t.bus
        .subscribe_stream(
            &["audit_trail"],
            Some("auditor"),
            handler,
            StreamOptions::default().replay_from(0),
        )
        .await
        .unwrap();
    for _ in 0..4 {
        tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    }

    t.logs.set_available(false);
    assert!(eventually(WAIT, || t.bus.health_check().stream_consumers_down == 1).await);
    t.logs.set_available(true);
    assert!(eventually(WAIT, || t.bus.health_check().stream).await);

    // Records handled before the outage are not replayed again
    assert!(tokio::time::timeout(Duration::from_millis(500), rx.recv())
        .await
        .is_err());
}
