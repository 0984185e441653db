//! Dual-channel publishing.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::channel::{ReliableTransport, StreamTransport};
use crate::config::{DurabilityPolicy, EventBusConfig};
use crate::envelope::{EventEnvelope, PublishOptions};
use crate::error::EventError;
use crate::health::HealthMonitor;

/// Writes each event to the reliable channel, then mirrors it to the stream.
pub struct Publisher {
    reliable: Arc<dyn ReliableTransport>,
    stream: Arc<dyn StreamTransport>,
    health: Arc<HealthMonitor>,
    source: String,
    timeout: Duration,
    durability: DurabilityPolicy,
}

impl Publisher {
    pub fn new(
        reliable: Arc<dyn ReliableTransport>,
        stream: Arc<dyn StreamTransport>,
        health: Arc<HealthMonitor>,
        config: &EventBusConfig,
    ) -> Self {
        Self {
            reliable,
            stream,
            health,
            source: config.source.clone(),
            timeout: config.publish_timeout,
            durability: config.durability,
        }
    }

    /// Build one envelope and write it to both channels.
    ///
    /// Returns the envelope id. Both writes share one `publish_timeout`
    /// deadline and honour `cancel`. Once the reliable write succeeded, a
    /// failed, late or cancelled stream write only fails the call under
    /// [`DurabilityPolicy::RequireBoth`].
    #[instrument(skip(self, data, options, cancel))]
    pub async fn publish(
        &self,
        event_type: &str,
        data: Value,
        options: &PublishOptions,
        cancel: &CancellationToken,
    ) -> Result<String, EventError> {
        let envelope = EventEnvelope::new(event_type, data, options, &self.source)?;
        let durability = options.durability.unwrap_or(self.durability);
        let deadline = Instant::now() + self.timeout;

        let reliable = self
            .reliable
            .publish(&envelope, options.routing_key.as_deref());
        self.bounded(event_type, deadline, cancel, reliable).await?;

        let mirror = self.stream.publish(&envelope, options.topic.as_deref());
        if let Err(e) = self.bounded(event_type, deadline, cancel, mirror).await {
            self.health.record_stream_failure(&e);
            match durability {
                DurabilityPolicy::RequireReliable => warn!(
                    event_id = %envelope.id(),
                    error = %e,
                    "Stream mirror failed, event delivered on reliable channel only"
                ),
                DurabilityPolicy::RequireBoth => return Err(e),
            }
        }

        debug!(event_id = %envelope.id(), "Event published");
        Ok(envelope.id().to_string())
    }

    async fn bounded<F>(
        &self,
        event_type: &str,
        deadline: Instant,
        cancel: &CancellationToken,
        write: F,
    ) -> Result<(), EventError>
    where
        F: Future<Output = Result<(), EventError>>,
    {
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(EventError::Cancelled),
            written = tokio::time::timeout_at(deadline, write) => {
                written.unwrap_or_else(|_| {
                    Err(EventError::PublishTimeout {
                        event_type: event_type.to_string(),
                        timeout_ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
                    })
                })
            }
        }
    }
}
