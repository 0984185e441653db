//! Broker client implementations.
//!
//! - [`memory`]: in-process queue and log brokers, always available
//! - `amqp`: AMQP 0-9-1 client via lapin (feature `amqp`)
//! - `kafka`: Kafka client via rdkafka (feature `kafka`)

pub mod memory;

#[cfg(feature = "amqp")]
pub mod amqp;

#[cfg(feature = "kafka")]
pub mod kafka;
