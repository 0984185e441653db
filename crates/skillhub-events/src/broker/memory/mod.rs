//! In-process brokers for tests and single-node development.
//!
//! Both brokers keep all state behind an `Arc`, so a clone handed to the bus
//! and a clone kept by a test observe the same queues and logs.

mod log;
mod queue;

pub use log::{MemoryLogBroker, MemoryLogClient, MemoryLogConnector};
pub use queue::{MemoryQueueBroker, MemoryQueueClient, MemoryQueueConnector, StoredMessage};
