//! Duplicate suppression for at-least-once consumers.

use std::collections::{HashSet, VecDeque};

use parking_lot::Mutex;
use tracing::debug;

const DEFAULT_CAPACITY: usize = 10_000;

/// Bounded record of envelope ids already handled by one consumer group.
///
/// When full, the oldest id is evicted. Handlers call
/// [`try_mark_processed`](Self::try_mark_processed) before doing work and
/// [`forget`](Self::forget) when the work failed so a redelivery is processed.
pub struct ProcessedEvents {
    consumer_group: String,
    capacity: usize,
    inner: Mutex<Seen>,
}

#[derive(Default)]
struct Seen {
    ids: HashSet<String>,
    order: VecDeque<String>,
}

impl ProcessedEvents {
    pub fn new(consumer_group: impl Into<String>) -> Self {
        Self::with_capacity(consumer_group, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(consumer_group: impl Into<String>, capacity: usize) -> Self {
        Self {
            consumer_group: consumer_group.into(),
            capacity: capacity.max(1),
            inner: Mutex::new(Seen::default()),
        }
    }

    #[must_use]
    pub fn is_processed(&self, event_id: &str) -> bool {
        self.inner.lock().ids.contains(event_id)
    }

    /// Mark `event_id` processed.
    ///
    /// Returns true if this call marked it, false if it was already marked.
    pub fn try_mark_processed(&self, event_id: &str) -> bool {
        let mut seen = self.inner.lock();
        if seen.ids.contains(event_id) {
            debug!(
                consumer_group = %self.consumer_group,
                event_id = %event_id,
                "Event already processed, skipping"
            );
            return false;
        }

        if seen.order.len() >= self.capacity {
            if let Some(oldest) = seen.order.pop_front() {
                seen.ids.remove(&oldest);
            }
        }
        seen.ids.insert(event_id.to_string());
        seen.order.push_back(event_id.to_string());
        true
    }

    /// Drop the mark so a redelivery of `event_id` is processed again.
    pub fn forget(&self, event_id: &str) {
        let mut seen = self.inner.lock();
        if seen.ids.remove(event_id) {
            seen.order.retain(|id| id != event_id);
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().ids.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn consumer_group(&self) -> &str {
        &self.consumer_group
    }
}
