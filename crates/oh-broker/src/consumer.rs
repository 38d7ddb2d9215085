//! Consumer Dispatch Loop
//!
//! One consumer per queue. The intake task reads deliveries off the channel
//! and hands them to a per-consumer [`MessageScheduler`]; the scheduler
//! starts handlers in arrival order on a bounded number of workers, so a
//! slow handler never stalls intake. Completion order is not guaranteed.

use std::collections::HashMap;
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use futures::{Stream, StreamExt};
use lapin::options::{BasicCancelOptions, BasicConsumeOptions, BasicQosOptions};
use lapin::types::FieldTable;
use lapin::Consumer;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::connection::{BrokerChannel, ConnectionManager};
use crate::dispatch::{dispatch, Acknowledger, DeliveryAcker, InboundMessage, MessageHandler};
use crate::{BrokerError, Result};

struct Scheduled {
    message: InboundMessage,
    acker: Box<dyn Acknowledger>,
}

/// Arrival-ordered, bounded-concurrency executor for one consumer.
///
/// Cancelling drops every message that has not started; started handlers
/// run to completion. Dropped messages are never acknowledged, so the
/// broker redelivers them once the channel closes.
pub struct MessageScheduler {
    queue: String,
    sender: mpsc::UnboundedSender<Scheduled>,
    pending: Arc<AtomicUsize>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    intake_ended: AtomicBool,
}

impl MessageScheduler {
    pub fn start(queue: impl Into<String>, handler: Arc<dyn MessageHandler>, concurrency: usize) -> Self {
        let queue = queue.into();
        let (sender, receiver) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();

        tracker.spawn(run_scheduler(
            queue.clone(),
            receiver,
            handler,
            Arc::new(Semaphore::new(concurrency.max(1))),
            Arc::clone(&pending),
            cancel.clone(),
            tracker.clone(),
        ));

        Self {
            queue,
            sender,
            pending,
            cancel,
            tracker,
            intake_ended: AtomicBool::new(false),
        }
    }

    /// Queue a message. Returns false if the scheduler was cancelled.
    pub fn schedule(&self, message: InboundMessage, acker: Box<dyn Acknowledger>) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.sender.send(Scheduled { message, acker }).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return false;
        }
        true
    }

    /// Messages queued but not yet started.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// True once the delivery stream feeding this scheduler has stopped.
    pub fn intake_ended(&self) -> bool {
        self.intake_ended.load(Ordering::SeqCst)
    }

    fn mark_intake_ended(&self) {
        self.intake_ended.store(true, Ordering::SeqCst);
    }

    /// Drop every message that has not started.
    pub fn cancel(&self) {
        if !self.cancel.is_cancelled() {
            debug!(queue = %self.queue, pending = self.pending(), "Cancelling scheduled messages");
            self.cancel.cancel();
        }
    }

    /// Cancel, then wait for in-flight handlers to finish.
    pub async fn shutdown(&self) {
        self.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

async fn run_scheduler(
    queue: String,
    mut receiver: mpsc::UnboundedReceiver<Scheduled>,
    handler: Arc<dyn MessageHandler>,
    workers: Arc<Semaphore>,
    pending: Arc<AtomicUsize>,
    cancel: CancellationToken,
    tracker: TaskTracker,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            next = receiver.recv() => next,
        };
        let Some(scheduled) = next else { break };

        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            permit = Arc::clone(&workers).acquire_owned() => permit.ok(),
        };
        pending.fetch_sub(1, Ordering::SeqCst);
        let Some(permit) = permit else {
            debug!(queue = %queue, delivery_tag = scheduled.message.delivery_tag, "Dropped unstarted message");
            break;
        };

        let handler = Arc::clone(&handler);
        tracker.spawn(async move {
            dispatch(handler.as_ref(), &scheduled.message, scheduled.acker.as_ref()).await;
            drop(permit);
        });
    }

    receiver.close();
    let mut dropped = 0usize;
    while receiver.try_recv().is_ok() {
        pending.fetch_sub(1, Ordering::SeqCst);
        dropped += 1;
    }
    if dropped > 0 {
        info!(queue = %queue, dropped, "Discarded unprocessed queued messages");
    }
}

// ============================================================================
// Consumer registry
// ============================================================================

#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub uri: String,
    /// Logical connection consumers open their channels on
    pub connection_name: String,
    pub prefetch_count: u16,
    pub worker_concurrency: usize,
}

impl ConsumerSettings {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            connection_name: "consumer".to_string(),
            prefetch_count: 10,
            worker_concurrency: 8,
        }
    }
}

struct ActiveConsumer {
    channel: BrokerChannel,
    consumer_tag: String,
    scheduler: Arc<MessageScheduler>,
    intake: JoinHandle<()>,
}

impl ActiveConsumer {
    /// Intake stopped on its own; the subscription is gone.
    fn is_dead(&self) -> bool {
        self.scheduler.intake_ended() && !self.scheduler.is_cancelled()
    }

    /// Stop dispatching and close the channel. Intake is not aborted.
    async fn retire(self) {
        self.scheduler.shutdown().await;
        self.channel.close().await;
    }
}

type ConsumerTable = Arc<Mutex<HashMap<String, ActiveConsumer>>>;

/// Registered consumers, one per queue.
///
/// A consumer whose delivery stream ends (channel or connection lost) is
/// evicted, so registering the queue again opens a fresh subscription.
pub struct ConsumerRegistry {
    connections: Arc<ConnectionManager>,
    settings: ConsumerSettings,
    consumers: ConsumerTable,
}

impl ConsumerRegistry {
    pub fn new(connections: Arc<ConnectionManager>, settings: ConsumerSettings) -> Self {
        Self {
            connections,
            settings,
            consumers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn settings(&self) -> &ConsumerSettings {
        &self.settings
    }

    /// Start consuming `queue`. Returns false if a consumer already exists.
    pub async fn register_consumer(&self, queue: &str, handler: Arc<dyn MessageHandler>) -> Result<bool> {
        let mut consumers = self.consumers.lock().await;
        match consumers.get(queue) {
            Some(active) if active.is_dead() => {
                if let Some(dead) = consumers.remove(queue) {
                    info!(queue = %queue, "Replacing consumer whose delivery stream ended");
                    dead.retire().await;
                }
            }
            Some(_) => {
                debug!(queue = %queue, "Consumer already registered");
                return Ok(false);
            }
            None => {}
        }

        let channel = self
            .connections
            .create_channel(&self.settings.connection_name, &self.settings.uri)
            .await?;

        if let Err(e) = self.subscribe(queue, &channel, handler, &mut consumers).await {
            channel.close().await;
            return Err(e);
        }
        Ok(true)
    }

    async fn subscribe(
        &self,
        queue: &str,
        channel: &BrokerChannel,
        handler: Arc<dyn MessageHandler>,
        consumers: &mut HashMap<String, ActiveConsumer>,
    ) -> Result<()> {
        channel
            .channel()
            .basic_qos(self.settings.prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|e| BrokerError::Channel(format!("Failed to set QoS: {}", e)))?;

        let consumer_tag = format!("ohana-{}-{}", queue, uuid::Uuid::new_v4());
        let consumer = channel
            .channel()
            .basic_consume(
                queue,
                &consumer_tag,
                BasicConsumeOptions {
                    no_ack: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Channel(format!("Failed to consume '{}': {}", queue, e)))?;

        let scheduler = Arc::new(MessageScheduler::start(queue, handler, self.settings.worker_concurrency));
        let intake = tokio::spawn(run_intake(
            queue.to_string(),
            consumer_tag.clone(),
            consumer,
            Arc::clone(&scheduler),
            channel.clone(),
            Arc::downgrade(&self.consumers),
        ));

        consumers.insert(
            queue.to_string(),
            ActiveConsumer {
                channel: channel.clone(),
                consumer_tag,
                scheduler,
                intake,
            },
        );

        info!(
            queue = %queue,
            prefetch = self.settings.prefetch_count,
            workers = self.settings.worker_concurrency,
            "Registered consumer"
        );
        Ok(())
    }

    /// Stop consuming `queue` and close its channel. Returns false if no
    /// consumer was registered.
    pub async fn unregister_consumer(&self, queue: &str) -> Result<bool> {
        let Some(active) = self.consumers.lock().await.remove(queue) else {
            return Ok(false);
        };

        if active.channel.channel().status().connected() {
            if let Err(e) = active
                .channel
                .channel()
                .basic_cancel(&active.consumer_tag, BasicCancelOptions::default())
                .await
            {
                warn!(queue = %queue, error = %e, "Failed to cancel consumer");
            }
        }
        active.intake.abort();
        active.scheduler.shutdown().await;
        active.channel.close().await;

        info!(queue = %queue, "Unregistered consumer");
        Ok(true)
    }

    pub async fn unregister_all(&self) {
        for queue in self.queues().await {
            if let Err(e) = self.unregister_consumer(&queue).await {
                warn!(queue = %queue, error = %e, "Failed to unregister consumer");
            }
        }
    }

    /// Drop every scheduled-but-unstarted message across all consumers.
    /// Consumers stop dispatching; unregister them to release channels.
    pub async fn teardown_unprocessed_queued_messages(&self) {
        let consumers = self.consumers.lock().await;
        for active in consumers.values() {
            active.scheduler.cancel();
        }
    }

    pub async fn is_registered(&self, queue: &str) -> bool {
        self.consumers.lock().await.contains_key(queue)
    }

    pub async fn queues(&self) -> Vec<String> {
        let mut queues: Vec<String> = self.consumers.lock().await.keys().cloned().collect();
        queues.sort();
        queues
    }
}

/// Why a consumer's intake loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IntakeEnd {
    /// The broker closed the delivery stream.
    Closed,
    /// Receiving failed; the channel is no longer usable.
    Failed,
}

/// Hand deliveries to the scheduler until the stream ends or fails.
pub(crate) async fn feed_scheduler<S, E>(queue: &str, deliveries: S, scheduler: &MessageScheduler) -> IntakeEnd
where
    S: Stream<Item = std::result::Result<(InboundMessage, Box<dyn Acknowledger>), E>>,
    E: Display,
{
    let mut deliveries = std::pin::pin!(deliveries);
    let end = loop {
        match deliveries.next().await {
            Some(Ok((message, acker))) => {
                if !scheduler.schedule(message, acker) {
                    debug!(queue = %queue, "Scheduler stopped, leaving delivery unacknowledged");
                }
            }
            Some(Err(e)) => {
                error!(queue = %queue, error = %e, "Error receiving message");
                break IntakeEnd::Failed;
            }
            None => break IntakeEnd::Closed,
        }
    };
    scheduler.mark_intake_ended();
    end
}

async fn run_intake(
    queue: String,
    consumer_tag: String,
    consumer: Consumer,
    scheduler: Arc<MessageScheduler>,
    channel: BrokerChannel,
    table: Weak<Mutex<HashMap<String, ActiveConsumer>>>,
) {
    let deliveries = consumer.map(|delivery| {
        delivery.map(|delivery| {
            let message = InboundMessage::from_delivery(&queue, &delivery);
            let acker: Box<dyn Acknowledger> = Box::new(DeliveryAcker(delivery.acker));
            (message, acker)
        })
    });

    let end = feed_scheduler(&queue, deliveries, &scheduler).await;
    if end == IntakeEnd::Failed {
        channel.mark_unhealthy();
    }
    if scheduler.is_cancelled() {
        return;
    }

    warn!(queue = %queue, reason = ?end, "Consumer stream ended, evicting consumer");
    let Some(table) = table.upgrade() else { return };
    let evicted = {
        let mut consumers = table.lock().await;
        match consumers.get(&queue) {
            Some(active) if active.consumer_tag == consumer_tag => consumers.remove(&queue),
            _ => None,
        }
    };
    if let Some(active) = evicted {
        active.retire().await;
    }
}
