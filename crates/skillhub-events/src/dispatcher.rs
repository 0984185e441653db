//! Subscription registry and per-subscription receive loops.
//!
//! Every subscription owns one task. Reliable loops translate handler
//! outcomes into broker acknowledgements; stream loops commit offsets only
//! after the handler succeeded for a record.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{FutureExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use crate::channel::{
    AckHandle, Delivery, DeliveryStream, GroupConsumer, QueueOptions, RecordContext,
    ReliableTransport, StartPosition, StreamRecord, StreamTransport,
};
use crate::envelope::EventEnvelope;
use crate::error::{EventError, HandlerError};
use crate::health::HealthMonitor;
use crate::topic::default_queue_name;

/// Pause before re-reading a partition whose handler failed.
const REDELIVERY_DELAY: Duration = Duration::from_millis(100);

/// Handles events delivered on the reliable channel.
///
/// With `auto_ack` the dispatcher settles the delivery from the returned
/// result; otherwise the handler settles it through the [`AckHandle`].
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn handle(&self, envelope: EventEnvelope, ack: AckHandle) -> Result<(), HandlerError>;
}

#[async_trait]
impl<F, Fut> EventHandler for F
where
    F: Fn(EventEnvelope, AckHandle) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, envelope: EventEnvelope, ack: AckHandle) -> Result<(), HandlerError> {
        (self)(envelope, ack).await
    }
}

/// Handles records read from the stream channel.
#[async_trait]
pub trait StreamHandler: Send + Sync + 'static {
    async fn handle(&self, envelope: EventEnvelope, ctx: RecordContext) -> Result<(), HandlerError>;
}

#[async_trait]
impl<F, Fut> StreamHandler for F
where
    F: Fn(EventEnvelope, RecordContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, envelope: EventEnvelope, ctx: RecordContext) -> Result<(), HandlerError> {
        (self)(envelope, ctx).await
    }
}

/// Options for a reliable-channel subscription.
#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    /// Queue name; defaults to `"{group}.{pattern}"`.
    pub queue_name: Option<String>,
    /// Consumer group used for the default queue name.
    pub group_id: Option<String>,
    /// Ack on success and nack on failure without handler involvement.
    pub auto_ack: bool,
    /// Requeue failed deliveries; defaults to the bus configuration.
    pub requeue_on_error: Option<bool>,
    pub durable: bool,
    /// Handler invocations in flight at once.
    pub concurrency: usize,
    /// Broker prefetch; defaults to the bus configuration.
    pub prefetch: Option<u16>,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            queue_name: None,
            group_id: None,
            auto_ack: true,
            requeue_on_error: None,
            durable: true,
            concurrency: 1,
            prefetch: None,
        }
    }
}

impl SubscribeOptions {
    #[must_use]
    pub fn with_queue_name(mut self, queue_name: impl Into<String>) -> Self {
        self.queue_name = Some(queue_name.into());
        self
    }

    #[must_use]
    pub fn with_group_id(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    #[must_use]
    pub fn with_auto_ack(mut self, auto_ack: bool) -> Self {
        self.auto_ack = auto_ack;
        self
    }

    #[must_use]
    pub fn with_requeue_on_error(mut self, requeue: bool) -> Self {
        self.requeue_on_error = Some(requeue);
        self
    }

    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    #[must_use]
    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = Some(prefetch);
        self
    }
}

/// Options for a stream-channel subscription.
#[derive(Debug, Clone)]
pub struct StreamOptions {
    /// Start at the beginning of the log when the group has no committed offset.
    pub from_beginning: bool,
    /// Replay every partition from this offset, ignoring committed offsets.
    pub replay_from: Option<i64>,
    /// Records fetched per poll.
    pub batch_size: usize,
    /// Partitions processed at once.
    pub concurrency: usize,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            from_beginning: false,
            replay_from: None,
            batch_size: 100,
            concurrency: 1,
        }
    }
}

impl StreamOptions {
    #[must_use]
    pub fn from_beginning(mut self) -> Self {
        self.from_beginning = true;
        self
    }

    #[must_use]
    pub fn replay_from(mut self, offset: i64) -> Self {
        self.replay_from = Some(offset);
        self
    }

    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    fn start_position(&self) -> StartPosition {
        match (self.replay_from, self.from_beginning) {
            (Some(offset), _) => StartPosition::Offset(offset),
            (None, true) => StartPosition::Earliest,
            (None, false) => StartPosition::Latest,
        }
    }
}

/// Handle to an active subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Settings shared by every subscription of one bus.
#[derive(Debug, Clone)]
pub struct DispatchDefaults {
    pub consumer_group: String,
    pub requeue_on_error: bool,
    pub prefetch: u16,
}

struct SubscriptionEntry {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Owns subscription loops and their lifecycle.
pub struct Dispatcher {
    reliable: Arc<dyn ReliableTransport>,
    stream: Arc<dyn StreamTransport>,
    health: Arc<HealthMonitor>,
    defaults: DispatchDefaults,
    subscriptions: RwLock<HashMap<SubscriptionId, SubscriptionEntry>>,
    next_id: AtomicU64,
    /// Parent of every loop token; replaced after each shutdown.
    shutdown: Mutex<CancellationToken>,
}

impl Dispatcher {
    pub fn new(
        reliable: Arc<dyn ReliableTransport>,
        stream: Arc<dyn StreamTransport>,
        health: Arc<HealthMonitor>,
        defaults: DispatchDefaults,
    ) -> Self {
        Self {
            reliable,
            stream,
            health,
            defaults,
            subscriptions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            shutdown: Mutex::new(CancellationToken::new()),
        }
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn active(&self) -> usize {
        self.subscriptions.read().len()
    }

    /// Bind a queue to `pattern` and start delivering to `handler`.
    pub async fn subscribe(
        &self,
        pattern: &str,
        handler: Arc<dyn EventHandler>,
        options: SubscribeOptions,
    ) -> Result<SubscriptionId, EventError> {
        let group = options
            .group_id
            .clone()
            .unwrap_or_else(|| self.defaults.consumer_group.clone());
        let queue = options
            .queue_name
            .clone()
            .unwrap_or_else(|| default_queue_name(&group, pattern));
        let queue_options = QueueOptions {
            durable: options.durable,
            prefetch: options.prefetch.unwrap_or(self.defaults.prefetch),
        };

        let deliveries = self
            .reliable
            .subscribe(pattern, &queue, &queue_options)
            .await?;

        let id = self.next_id();
        let cancel = self.shutdown.lock().child_token();
        let ctx = Arc::new(ReliableContext {
            transport: Arc::clone(&self.reliable),
            health: Arc::clone(&self.health),
            handler,
            pattern: pattern.to_string(),
            queue: queue.clone(),
            queue_options,
            auto_ack: options.auto_ack,
            requeue_on_error: options
                .requeue_on_error
                .unwrap_or(self.defaults.requeue_on_error),
            concurrency: options.concurrency.max(1),
        });

        let span = tracing::info_span!("reliable_subscription", subscription = %id, queue = %queue);
        let task = tokio::spawn(reliable_loop(ctx, deliveries, cancel.clone()).instrument(span));
        self.subscriptions
            .write()
            .insert(id, SubscriptionEntry { cancel, task });

        Ok(id)
    }

    /// Join `group_id` on `topics` and start delivering to `handler`.
    pub async fn subscribe_stream(
        &self,
        topics: &[String],
        group_id: Option<&str>,
        handler: Arc<dyn StreamHandler>,
        options: StreamOptions,
    ) -> Result<SubscriptionId, EventError> {
        let group_id = group_id.map_or_else(|| self.defaults.consumer_group.clone(), str::to_string);
        let start = options.start_position();

        let consumer = self
            .stream
            .subscribe_stream(topics, &group_id, start)
            .await?;

        let id = self.next_id();
        let cancel = self.shutdown.lock().child_token();
        let ctx = Arc::new(StreamContext {
            transport: Arc::clone(&self.stream),
            health: Arc::clone(&self.health),
            handler,
            topics: topics.to_vec(),
            group_id: group_id.clone(),
            start,
            batch_size: options.batch_size.max(1),
            concurrency: options.concurrency.max(1),
        });

        let span = tracing::info_span!("stream_subscription", subscription = %id, group_id = %group_id);
        let task = tokio::spawn(stream_loop(ctx, consumer, cancel.clone()).instrument(span));
        self.subscriptions
            .write()
            .insert(id, SubscriptionEntry { cancel, task });

        Ok(id)
    }

    /// Stop one subscription and wait for its loop to finish.
    pub async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), EventError> {
        let entry = self
            .subscriptions
            .write()
            .remove(&id)
            .ok_or(EventError::UnknownSubscription { id: id.0 })?;

        entry.cancel.cancel();
        if let Err(e) = entry.task.await {
            if e.is_panic() {
                error!(subscription = %id, "Subscription loop panicked");
            }
        }
        info!(subscription = %id, "Unsubscribed");
        Ok(())
    }

    /// Cancel every loop, let in-flight handlers finish within `grace`,
    /// then abort whatever is left.
    pub async fn shutdown(&self, grace: Duration) {
        let parent = std::mem::replace(&mut *self.shutdown.lock(), CancellationToken::new());
        parent.cancel();
        let entries: Vec<(SubscriptionId, SubscriptionEntry)> =
            self.subscriptions.write().drain().collect();
        if entries.is_empty() {
            return;
        }

        info!(subscriptions = entries.len(), "Draining subscriptions");
        let deadline = tokio::time::Instant::now() + grace;
        for (id, entry) in entries {
            let abort = entry.task.abort_handle();
            match tokio::time::timeout_at(deadline, entry.task).await {
                Ok(Ok(())) => debug!(subscription = %id, "Subscription drained"),
                Ok(Err(e)) => warn!(subscription = %id, error = %e, "Subscription task failed"),
                Err(_) => {
                    warn!(subscription = %id, "Grace period elapsed, aborting subscription");
                    abort.abort();
                }
            }
        }
    }

    fn next_id(&self) -> SubscriptionId {
        SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }
}

struct ReliableContext {
    transport: Arc<dyn ReliableTransport>,
    health: Arc<HealthMonitor>,
    handler: Arc<dyn EventHandler>,
    pattern: String,
    queue: String,
    queue_options: QueueOptions,
    auto_ack: bool,
    requeue_on_error: bool,
    concurrency: usize,
}

async fn reliable_loop(
    ctx: Arc<ReliableContext>,
    mut deliveries: DeliveryStream,
    cancel: CancellationToken,
) {
    info!("Starting consumer loop");
    let permits = Arc::new(Semaphore::new(ctx.concurrency));
    let mut in_flight = JoinSet::new();

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                if let Err(e) = joined {
                    error!(error = %e, "Delivery task failed");
                }
            }
            next = deliveries.next(), if permits.available_permits() > 0 => match next {
                Some(Ok(delivery)) => {
                    let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                        break;
                    };
                    in_flight.spawn(process_delivery(Arc::clone(&ctx), delivery, permit));
                }
                Some(Err(e)) => {
                    warn!(error = %e, "Delivery stream failed");
                    match resubscribe(&ctx, &cancel).await {
                        Some(stream) => deliveries = stream,
                        None => break,
                    }
                }
                None => {
                    warn!("Delivery stream ended");
                    match resubscribe(&ctx, &cancel).await {
                        Some(stream) => deliveries = stream,
                        None => break,
                    }
                }
            },
        }
    }

    // Settle in-flight deliveries before the consumer goes away.
    while let Some(joined) = in_flight.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "Delivery task failed");
        }
    }
    drop(deliveries);
    info!("Consumer loop ended");
}

/// Reconnect with backoff and consume the queue again.
async fn resubscribe(ctx: &ReliableContext, cancel: &CancellationToken) -> Option<DeliveryStream> {
    loop {
        if cancel.is_cancelled() {
            return None;
        }

        match ctx
            .transport
            .subscribe(&ctx.pattern, &ctx.queue, &ctx.queue_options)
            .await
        {
            Ok(deliveries) => {
                info!("Resubscribed after transport failure");
                return Some(deliveries);
            }
            Err(e) => debug!(error = %e, "Resubscribe failed, reconnecting"),
        }

        match ctx.transport.reconnect(cancel).await {
            Ok(()) => {}
            Err(EventError::Cancelled) => return None,
            Err(e) => {
                error!(error = %e, "Giving up on subscription");
                return None;
            }
        }
    }
}

async fn process_delivery(ctx: Arc<ReliableContext>, delivery: Delivery, _permit: OwnedSemaphorePermit) {
    let envelope = match EventEnvelope::from_json_bytes(&delivery.body) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(error = %e, "Discarding undecodable message");
            if let Err(e) = delivery.acker.nack(false).await {
                error!(error = %e, "Failed to discard message");
            }
            return;
        }
    };

    let event_id = envelope.id().to_string();
    let ack = AckHandle::new(&event_id, delivery.acker, delivery.redelivered);

    debug!(
        event_id = %event_id,
        event_type = %envelope.event_type(),
        redelivered = delivery.redelivered,
        "Received message"
    );

    let outcome = AssertUnwindSafe(ctx.handler.handle(envelope, ack.clone()))
        .catch_unwind()
        .await;

    let settled = match outcome {
        Ok(Ok(())) if ctx.auto_ack && !ack.is_settled() => ack.ack().await,
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            ctx.health.record_handler_failure();
            warn!(
                event_id = %event_id,
                error = %e,
                requeue = ctx.requeue_on_error,
                "Handler failed"
            );
            if ack.is_settled() {
                Ok(())
            } else {
                ack.nack(ctx.requeue_on_error).await
            }
        }
        Err(_) => {
            ctx.health.record_handler_panic();
            error!(event_id = %event_id, "Handler panicked, requeueing");
            if ack.is_settled() {
                Ok(())
            } else {
                ack.nack(true).await
            }
        }
    };

    match settled {
        Ok(()) => {}
        Err(EventError::AlreadySettled { .. }) => {}
        Err(e) => error!(event_id = %event_id, error = %e, "Failed to settle delivery"),
    }
}

struct StreamContext {
    transport: Arc<dyn StreamTransport>,
    health: Arc<HealthMonitor>,
    handler: Arc<dyn StreamHandler>,
    topics: Vec<String>,
    group_id: String,
    /// Where the group started; reused when rejoining.
    start: StartPosition,
    batch_size: usize,
    concurrency: usize,
}

/// How far one partition run got.
enum PartitionRun {
    /// Every record handled or skipped; commit the next offset.
    Completed { next_offset: Option<i64> },
    /// Stopped at `failed_offset`; commit what succeeded and seek back.
    Stopped {
        next_offset: Option<i64>,
        failed_offset: i64,
    },
}

impl PartitionRun {
    /// Next offset this subscription should read, if the run moved it.
    fn resume_offset(&self) -> Option<i64> {
        match self {
            Self::Completed { next_offset } => *next_offset,
            Self::Stopped { failed_offset, .. } => Some(*failed_offset),
        }
    }
}

async fn stream_loop(
    ctx: Arc<StreamContext>,
    mut consumer: Box<dyn GroupConsumer>,
    cancel: CancellationToken,
) {
    info!(topics = ?ctx.topics, "Starting consumer loop");
    let permits = Arc::new(Semaphore::new(ctx.concurrency));
    // Read position per partition reached by this loop.
    let mut resume: HashMap<(String, i32), i64> = HashMap::new();

    loop {
        let polled = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            polled = consumer.poll(ctx.batch_size) => polled,
        };

        let records = match polled {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "Poll failed");
                if let Err(e) = consumer.close().await {
                    debug!(error = %e, "Failed to leave group");
                }
                let _outage = ctx.health.stream_consumer_outage();
                match rejoin(&ctx, &resume, &cancel).await {
                    Some(rejoined) => {
                        consumer = rejoined;
                        continue;
                    }
                    None => return,
                }
            }
        };
        if records.is_empty() {
            continue;
        }

        let mut partitions: BTreeMap<(String, i32), Vec<StreamRecord>> = BTreeMap::new();
        for record in records {
            partitions
                .entry((record.topic.clone(), record.partition))
                .or_default()
                .push(record);
        }

        let mut runs = JoinSet::new();
        for ((topic, partition), batch) in partitions {
            let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                break;
            };
            let ctx = Arc::clone(&ctx);
            runs.spawn(async move {
                let _permit = permit;
                let run = process_partition(&ctx, batch).await;
                (topic, partition, run)
            });
        }

        let mut stopped = false;
        while let Some(joined) = runs.join_next().await {
            let (topic, partition, run) = match joined {
                Ok(result) => result,
                Err(e) => {
                    error!(error = %e, "Partition task failed");
                    continue;
                }
            };
            if let Some(offset) = run.resume_offset() {
                resume.insert((topic.clone(), partition), offset);
            }
            stopped |= settle_partition(consumer.as_mut(), &topic, partition, run).await;
        }

        if stopped {
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(REDELIVERY_DELAY) => {}
            }
        }
    }

    if let Err(e) = consumer.close().await {
        debug!(error = %e, "Failed to leave group");
    }
    info!("Consumer loop ended");
}

/// Join the group again with the original start position, then move every
/// partition this loop already read back to where it left off.
async fn rejoin(
    ctx: &StreamContext,
    resume: &HashMap<(String, i32), i64>,
    cancel: &CancellationToken,
) -> Option<Box<dyn GroupConsumer>> {
    loop {
        if cancel.is_cancelled() {
            return None;
        }

        match ctx
            .transport
            .subscribe_stream(&ctx.topics, &ctx.group_id, ctx.start)
            .await
        {
            Ok(mut consumer) => {
                for ((topic, partition), offset) in resume {
                    if let Err(e) = consumer.seek(topic, *partition, *offset).await {
                        debug!(topic = %topic, partition, offset, error = %e, "Resume seek failed");
                    }
                }
                info!(resumed = resume.len(), "Rejoined consumer group after transport failure");
                return Some(consumer);
            }
            Err(e) => debug!(error = %e, "Rejoin failed, reconnecting"),
        }

        match ctx.transport.reconnect(cancel).await {
            Ok(()) => {}
            Err(EventError::Cancelled) => return None,
            Err(e) => {
                error!(error = %e, "Giving up on stream subscription");
                return None;
            }
        }
    }
}

async fn process_partition(ctx: &StreamContext, batch: Vec<StreamRecord>) -> PartitionRun {
    let mut next_offset = None;

    for record in batch {
        let envelope = match EventEnvelope::from_json_bytes(&record.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(
                    topic = %record.topic,
                    partition = record.partition,
                    offset = record.offset,
                    error = %e,
                    "Skipping undecodable record"
                );
                next_offset = Some(record.offset + 1);
                continue;
            }
        };

        let event_id = envelope.id().to_string();
        let outcome = AssertUnwindSafe(ctx.handler.handle(envelope, RecordContext::from(&record)))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(())) => {
                debug!(event_id = %event_id, offset = record.offset, "Record processed");
                next_offset = Some(record.offset + 1);
            }
            Ok(Err(e)) => {
                ctx.health.record_handler_failure();
                warn!(event_id = %event_id, offset = record.offset, error = %e, "Handler failed");
                return PartitionRun::Stopped {
                    next_offset,
                    failed_offset: record.offset,
                };
            }
            Err(_) => {
                ctx.health.record_handler_panic();
                error!(event_id = %event_id, offset = record.offset, "Handler panicked");
                return PartitionRun::Stopped {
                    next_offset,
                    failed_offset: record.offset,
                };
            }
        }
    }

    PartitionRun::Completed { next_offset }
}

/// Commit progress and seek back on failure. Returns whether the run stopped early.
async fn settle_partition(
    consumer: &mut dyn GroupConsumer,
    topic: &str,
    partition: i32,
    run: PartitionRun,
) -> bool {
    let (commit, seek) = match run {
        PartitionRun::Completed { next_offset } => (next_offset, None),
        PartitionRun::Stopped {
            next_offset,
            failed_offset,
        } => (next_offset, Some(failed_offset)),
    };

    if let Some(next_offset) = commit {
        if let Err(e) = consumer.commit(topic, partition, next_offset).await {
            error!(topic = %topic, partition, error = %e, "Offset commit failed");
        }
    }
    if let Some(offset) = seek {
        if let Err(e) = consumer.seek(topic, partition, offset).await {
            error!(topic = %topic, partition, offset, error = %e, "Seek failed");
        }
    }
    seek.is_some()
}
