//! The event bus facade.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::broker::memory::{
    MemoryLogBroker, MemoryLogConnector, MemoryQueueBroker, MemoryQueueConnector,
};
use crate::channel::{Channel, ReliableChannel, ReliableTransport, StreamChannel, StreamTransport};
use crate::config::EventBusConfig;
use crate::connection::ConnectionEvent;
use crate::dispatcher::{
    DispatchDefaults, Dispatcher, EventHandler, StreamHandler, StreamOptions, SubscribeOptions,
    SubscriptionId,
};
use crate::envelope::PublishOptions;
use crate::error::EventError;
use crate::event::Event;
use crate::health::{HealthMonitor, HealthStatus};
use crate::publisher::Publisher;

/// Background reconnect tasks for one connected session.
struct Supervision {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

/// Publish/subscribe over a reliable queue broker and a partitioned log broker.
///
/// ```rust
/// # async fn demo() -> Result<(), skillhub_events::EventError> {
/// use skillhub_events::broker::memory::{MemoryLogBroker, MemoryQueueBroker};
/// use skillhub_events::{EventBus, EventBusConfig, PublishOptions};
/// use tokio_util::sync::CancellationToken;
///
/// let config = EventBusConfig::builder().bootstrap_servers("memory").build()?;
/// let bus = EventBus::in_memory(config, &MemoryQueueBroker::new(), &MemoryLogBroker::new());
///
/// bus.connect(&CancellationToken::new()).await?;
/// let id = bus
///     .publish("booking.created", serde_json::json!({"id": "b1"}), PublishOptions::default())
///     .await?;
/// assert!(!id.is_empty());
/// bus.disconnect().await?;
/// # Ok(())
/// # }
/// ```
pub struct EventBus {
    config: EventBusConfig,
    reliable: Arc<dyn ReliableTransport>,
    stream: Arc<dyn StreamTransport>,
    health: Arc<HealthMonitor>,
    publisher: Publisher,
    dispatcher: Dispatcher,
    connected: AtomicBool,
    /// Serialises connect and disconnect.
    lifecycle: Mutex<Option<Supervision>>,
}

impl EventBus {
    /// Build a bus over caller-supplied channel adapters.
    pub fn new(
        config: EventBusConfig,
        reliable: Arc<dyn ReliableTransport>,
        stream: Arc<dyn StreamTransport>,
    ) -> Self {
        let health = Arc::new(HealthMonitor::new(
            Arc::clone(&reliable),
            Arc::clone(&stream),
        ));
        let publisher = Publisher::new(
            Arc::clone(&reliable),
            Arc::clone(&stream),
            Arc::clone(&health),
            &config,
        );
        let dispatcher = Dispatcher::new(
            Arc::clone(&reliable),
            Arc::clone(&stream),
            Arc::clone(&health),
            DispatchDefaults {
                consumer_group: config.consumer_group.clone(),
                requeue_on_error: config.requeue_on_error,
                prefetch: config.reliable.prefetch,
            },
        );

        Self {
            config,
            reliable,
            stream,
            health,
            publisher,
            dispatcher,
            connected: AtomicBool::new(false),
            lifecycle: Mutex::new(None),
        }
    }

    /// Build a bus over in-process brokers.
    pub fn in_memory(
        config: EventBusConfig,
        queues: &MemoryQueueBroker,
        logs: &MemoryLogBroker,
    ) -> Self {
        let reliable = Arc::new(ReliableChannel::new(
            MemoryQueueConnector::new(queues.clone()),
            config.reliable.exchange.clone(),
            config.reconnect.clone(),
        ));
        let stream = Arc::new(StreamChannel::new(
            MemoryLogConnector::new(logs.clone()),
            config.reconnect.clone(),
        ));
        Self::new(config, reliable, stream)
    }

    /// Build a bus over AMQP and Kafka from configuration.
    #[cfg(all(feature = "amqp", feature = "kafka"))]
    pub fn from_config(config: EventBusConfig) -> Self {
        use crate::broker::amqp::AmqpConnector;
        use crate::broker::kafka::KafkaConnector;

        let reliable = Arc::new(ReliableChannel::new(
            AmqpConnector::new(config.reliable.url.clone()),
            config.reliable.exchange.clone(),
            config.reconnect.clone(),
        ));
        let stream = Arc::new(StreamChannel::new(
            KafkaConnector::new(config.stream.clone()),
            config.reconnect.clone(),
        ));
        Self::new(config, reliable, stream)
    }

    #[must_use]
    pub fn config(&self) -> &EventBusConfig {
        &self.config
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Connect the reliable channel (with topology), then the stream channel.
    ///
    /// On any failure the channels opened so far are closed again and the
    /// bus stays disconnected. Connecting a connected bus is a no-op.
    #[instrument(skip(self, cancel))]
    pub async fn connect(&self, cancel: &CancellationToken) -> Result<(), EventError> {
        let mut lifecycle = self.lifecycle.lock().await;
        if self.is_connected() {
            return Ok(());
        }

        self.reliable.connect(cancel).await?;
        if let Err(e) = self.stream.connect(cancel).await {
            if let Err(close_err) = self.reliable.close().await {
                warn!(error = %close_err, "Failed to close reliable channel");
            }
            return Err(e);
        }

        let supervisor = CancellationToken::new();
        let tasks = vec![
            tokio::spawn(supervise(Arc::clone(&self.reliable), supervisor.clone())),
            tokio::spawn(supervise(Arc::clone(&self.stream), supervisor.clone())),
        ];
        *lifecycle = Some(Supervision {
            cancel: supervisor,
            tasks,
        });
        self.connected.store(true, Ordering::SeqCst);

        info!(
            exchange = %self.config.reliable.exchange,
            source = %self.config.source,
            "Event bus connected"
        );
        Ok(())
    }

    /// Publish `data` as `event_type` on both channels. Returns the event id.
    pub async fn publish(
        &self,
        event_type: &str,
        data: impl Serialize,
        options: PublishOptions,
    ) -> Result<String, EventError> {
        self.publish_with_cancel(event_type, data, options, &CancellationToken::new())
            .await
    }

    /// [`publish`](Self::publish) with caller cancellation.
    pub async fn publish_with_cancel(
        &self,
        event_type: &str,
        data: impl Serialize,
        options: PublishOptions,
        cancel: &CancellationToken,
    ) -> Result<String, EventError> {
        self.ensure_connected()?;
        let data = serde_json::to_value(data).map_err(|e| EventError::SerializationFailed {
            event_type: event_type.to_string(),
            cause: e.to_string(),
        })?;
        self.publisher
            .publish(event_type, data, &options, cancel)
            .await
    }

    /// Publish a typed event under its declared event type.
    pub async fn publish_event<E: Event>(
        &self,
        event: &E,
        options: PublishOptions,
    ) -> Result<String, EventError> {
        self.publish(E::EVENT_TYPE, event, options).await
    }

    /// Subscribe `handler` to reliable-channel events matching `pattern`.
    ///
    /// `*` matches one dot-separated segment, `#` matches zero or more.
    pub async fn subscribe<H: EventHandler>(
        &self,
        pattern: &str,
        handler: H,
        options: SubscribeOptions,
    ) -> Result<SubscriptionId, EventError> {
        self.ensure_connected()?;
        self.dispatcher
            .subscribe(pattern, Arc::new(handler), options)
            .await
    }

    /// Subscribe `handler` to stream-channel `topics` as `group_id`
    /// (default: the configured consumer group).
    pub async fn subscribe_stream<H: StreamHandler>(
        &self,
        topics: &[&str],
        group_id: Option<&str>,
        handler: H,
        options: StreamOptions,
    ) -> Result<SubscriptionId, EventError> {
        self.ensure_connected()?;
        let topics: Vec<String> = topics.iter().map(|t| (*t).to_string()).collect();
        self.dispatcher
            .subscribe_stream(&topics, group_id, Arc::new(handler), options)
            .await
    }

    pub async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), EventError> {
        self.dispatcher.unsubscribe(id).await
    }

    #[must_use]
    pub fn health_check(&self) -> HealthStatus {
        self.health.check()
    }

    /// Drain subscriptions within the shutdown grace period, then close the
    /// stream and reliable channels.
    ///
    /// Close errors are logged, not returned. Fails with
    /// [`EventError::NotConnected`] when the bus is not connected.
    #[instrument(skip(self))]
    pub async fn disconnect(&self) -> Result<(), EventError> {
        let mut lifecycle = self.lifecycle.lock().await;
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Err(EventError::NotConnected);
        }

        if let Some(supervision) = lifecycle.take() {
            supervision.cancel.cancel();
            for task in supervision.tasks {
                if let Err(e) = task.await {
                    warn!(error = %e, "Reconnect supervisor failed");
                }
            }
        }

        self.dispatcher.shutdown(self.config.shutdown_grace).await;

        if let Err(e) = self.stream.close().await {
            warn!(error = %e, "Failed to close stream channel");
        }
        if let Err(e) = self.reliable.close().await {
            warn!(error = %e, "Failed to close reliable channel");
        }

        info!("Event bus disconnected");
        Ok(())
    }

    fn ensure_connected(&self) -> Result<(), EventError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(EventError::NotConnected)
        }
    }
}

/// Reconnect `channel` whenever its connection reports going down.
async fn supervise<T: Channel + ?Sized>(channel: Arc<T>, cancel: CancellationToken) {
    let mut events = channel.connection_events();
    let kind = channel.kind();

    loop {
        let event = tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            event = events.recv() => event,
        };

        match event {
            Ok(ConnectionEvent::Disconnected) if !channel.is_healthy() => {
                warn!(channel = %kind, "Connection lost, reconnecting");
                match channel.reconnect(&cancel).await {
                    Ok(()) => info!(channel = %kind, "Connection restored"),
                    Err(EventError::Cancelled) => return,
                    Err(e) => error!(channel = %kind, error = %e, "Reconnect failed"),
                }
            }
            Ok(_) | Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => return,
        }
    }
}
