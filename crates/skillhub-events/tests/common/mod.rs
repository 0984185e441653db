//! Shared helpers for event bus integration tests.

#![allow(dead_code)]

use std::sync::Once;
use std::time::Duration;

use skillhub_events::broker::memory::{MemoryLogBroker, MemoryQueueBroker};
use skillhub_events::{EventBus, EventBusConfig, EventBusConfigBuilder, RetryPolicy};
use tokio_util::sync::CancellationToken;

static INIT: Once = Once::new();

/// Initialize logging for tests (once).
pub fn init_test_logging() {
    INIT.call_once(|| {
        // Only initialize if RUST_LOG is set
        if std::env::var("RUST_LOG").is_ok() {
            tracing_subscriber::fmt()
                .with_test_writer()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .try_init()
                .ok();
        }
    });
}

/// In-memory brokers plus a bus wired to them.
pub struct TestBus {
    pub queues: MemoryQueueBroker,
    pub logs: MemoryLogBroker,
    pub bus: EventBus,
}

impl TestBus {
    pub fn config() -> EventBusConfigBuilder {
        EventBusConfig::builder()
            .bootstrap_servers("memory")
            .source("test-service")
            .consumer_group("test")
            .reconnect(
                RetryPolicy::new(20)
                    .with_initial_backoff(10)
                    .with_max_backoff(50)
                    .with_jitter(false),
            )
            .shutdown_grace(Duration::from_secs(2))
    }

    pub async fn connected() -> Self {
        Self::connected_with(Self::config()).await
    }

    pub async fn connected_with(config: EventBusConfigBuilder) -> Self {
        init_test_logging();
        let test_bus = Self::disconnected_with(config);
        test_bus
            .bus
            .connect(&CancellationToken::new())
            .await
            .expect("in-memory bus connects");
        test_bus
    }

    pub fn disconnected_with(config: EventBusConfigBuilder) -> Self {
        let queues = MemoryQueueBroker::new();
        let logs = MemoryLogBroker::new();
        let config = config.build().expect("valid test config");
        let bus = EventBus::in_memory(config, &queues, &logs);
        Self { queues, logs, bus }
    }
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
