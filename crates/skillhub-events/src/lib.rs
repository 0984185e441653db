//! # skillhub-events
//!
//! Dual-transport event bus for skillhub services.
//!
//! One publish/subscribe contract over two brokers:
//!
//! - **Reliable channel**: acknowledged, topic-routed queues (AMQP). Every
//!   event lands here first; consumers ack, nack or reject each delivery.
//! - **Stream channel**: partitioned, replayable log (Kafka). Every event is
//!   mirrored here for analytics and replay; consumer groups commit offsets
//!   only after successful processing.
//!
//! Delivery is at-least-once on both channels. Handlers should be
//! idempotent on [`EventEnvelope::id`]; see [`ProcessedEvents`].
//!
//! ## Cargo Features
//!
//! - `amqp`: AMQP queue broker adapter (lapin)
//! - `kafka`: Kafka log broker adapter (requires librdkafka)
//! - `kafka-static`: Build librdkafka from source (requires cmake)
//! - `integration`: Enable broker-backed integration tests
//!
//! In-process brokers in [`broker::memory`] are always available.
//!
//! ## Example
//!
//! ```rust,ignore
//! use serde_json::json;
//! use skillhub_events::{
//!     AckHandle, EventBus, EventBusConfig, EventEnvelope, PublishOptions, SubscribeOptions,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! let bus = EventBus::from_config(EventBusConfig::from_env()?);
//! bus.connect(&CancellationToken::new()).await?;
//!
//! bus.subscribe(
//!     "booking.*",
//!     |envelope: EventEnvelope, _ack: AckHandle| async move {
//!         println!("{} {}", envelope.event_type(), envelope.data());
//!         Ok(())
//!     },
//!     SubscribeOptions::default(),
//! )
//! .await?;
//!
//! bus.publish("booking.created", json!({"id": "b1"}), PublishOptions::default()).await?;
//! ```

pub mod broker;
pub mod bus;
pub mod channel;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod envelope;
pub mod error;
pub mod event;
pub mod health;
pub mod idempotence;
pub mod publisher;
pub mod retry;
pub mod topic;

pub use bus::EventBus;
pub use channel::{AckHandle, RecordContext, StartPosition};
pub use config::{DurabilityPolicy, EventBusConfig, EventBusConfigBuilder};
pub use dispatcher::{EventHandler, StreamHandler, StreamOptions, SubscribeOptions, SubscriptionId};
pub use envelope::{EventEnvelope, PublishOptions};
pub use error::{EventError, HandlerError};
pub use event::Event;
pub use health::HealthStatus;
pub use idempotence::ProcessedEvents;
pub use retry::RetryPolicy;
pub use topic::derive_topic;
