//! The queue fabric: topics, subscriptions, and result correlation.
//!
//! One dispatcher task per topic pops messages in priority order and fans
//! them out to per-subscriber delivery channels. Each subscriber consumes
//! its channel sequentially, so equal-priority messages arrive at a single
//! subscriber in publish order. Handler execution holds a permit from the
//! fabric-wide worker pool.
//!
//! Contract (not enforced): a subscriber handler must not block on a
//! `publish` to its own topic, or the dispatcher can deadlock behind the
//! subscriber's full delivery channel.

use crate::message::{
    DeliverySemantics, MessageMeta, PublishOptions, PublishResult, QueueMessage, QueuePayload,
};
use crate::topic::{Popped, Topic};
use dashmap::DashMap;
use gati_core::config::GatiConfig;
use gati_core::envelope::ResponseEnvelope;
use gati_core::error::GatiError;
use gati_core::global::EventPublisher;
use gati_core::metrics::Metrics;
use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio_util::sync::CancellationToken;

/// A subscriber callback. Returning `Err` counts as a failed delivery
/// attempt and triggers redelivery (at-least-once).
pub type SubscriberHandler = Arc<
    dyn Fn(QueueMessage) -> Pin<Box<dyn Future<Output = Result<(), GatiError>> + Send>>
        + Send
        + Sync,
>;

/// Options for one subscription.
#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    pub semantics: DeliverySemantics,
    /// Delivery attempt ceiling; the configured default when absent.
    pub max_attempts: Option<u32>,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        SubscribeOptions {
            semantics: DeliverySemantics::AtLeastOnce,
            max_attempts: None,
        }
    }
}

impl SubscribeOptions {
    pub fn exactly_once() -> Self {
        SubscribeOptions {
            semantics: DeliverySemantics::ExactlyOnce,
            max_attempts: None,
        }
    }
}

/// Identifies one subscription for `unsubscribe`.
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    topic: String,
    id: u64,
}

/// Bounded FIFO ring of recently delivered message ids, for exactly-once.
struct DedupRing {
    seen: HashSet<String>,
    order: VecDeque<String>,
    cap: usize,
}

impl DedupRing {
    fn new(cap: usize) -> Self {
        DedupRing {
            seen: HashSet::new(),
            order: VecDeque::new(),
            cap,
        }
    }

    /// Record an id. Returns `true` when it was not seen within the
    /// retention window.
    fn observe(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            return false;
        }
        self.seen.insert(id.to_string());
        self.order.push_back(id.to_string());
        if self.order.len() > self.cap {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        true
    }
}

struct SubscriberEntry {
    id: u64,
    sender: mpsc::Sender<QueueMessage>,
}

struct TopicHub {
    topic: Arc<Topic>,
    subscribers: std::sync::RwLock<Vec<SubscriberEntry>>,
}

/// Capacity of each per-subscriber delivery channel. The bounded depth
/// limit lives on the topic queue; this only smooths fan-out.
const DELIVERY_CHANNEL_CAPACITY: usize = 64;

/// In-process priority pub/sub with per-topic depth limits and a
/// per-request result channel. No durability across process restart.
pub struct QueueFabric {
    config: GatiConfig,
    metrics: Metrics,
    hubs: DashMap<String, Arc<TopicHub>>,
    results: Arc<DashMap<String, oneshot::Sender<ResponseEnvelope>>>,
    workers: Arc<Semaphore>,
    cancel: CancellationToken,
    next_subscriber: AtomicU64,
}

impl QueueFabric {
    pub fn new(config: GatiConfig, metrics: Metrics) -> Arc<Self> {
        let workers = Arc::new(Semaphore::new(config.runtime_workers));
        Arc::new(QueueFabric {
            config,
            metrics,
            hubs: DashMap::new(),
            results: Arc::new(DashMap::new()),
            workers,
            cancel: CancellationToken::new(),
            next_subscriber: AtomicU64::new(0),
        })
    }

    /// Publish a payload to a topic. Fails fast with `Backpressure` when
    /// the topic is at its depth limit and with an internal error after
    /// shutdown.
    pub fn publish(
        self: &Arc<Self>,
        topic: &str,
        payload: QueuePayload,
        options: PublishOptions,
    ) -> Result<PublishResult, GatiError> {
        if self.cancel.is_cancelled() {
            return Err(GatiError::Internal("fabric is shut down".into()));
        }
        let hub = self.hub(topic);
        let message_id = options
            .message_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let message = QueueMessage {
            topic: topic.to_string(),
            payload,
            meta: MessageMeta {
                message_id: message_id.clone(),
                attempt: 1,
                priority: options.priority,
                semantics: options.semantics,
                deadline: options.deadline,
                enqueued_at: Instant::now(),
            },
        };
        let depth = hub.topic.push(message)?;
        self.metrics.incr("queue.published");
        Ok(PublishResult { message_id, depth })
    }

    /// Subscribe to a topic. The handler runs on the fabric's worker pool;
    /// deliveries to this subscriber are sequential.
    pub fn subscribe(
        self: &Arc<Self>,
        topic: &str,
        options: SubscribeOptions,
        handler: SubscriberHandler,
    ) -> SubscriptionHandle {
        let hub = self.hub(topic);
        let id = self.next_subscriber.fetch_add(1, Ordering::SeqCst);
        let (sender, receiver) = mpsc::channel(DELIVERY_CHANNEL_CAPACITY);
        hub.subscribers
            .write()
            .expect("subscriber list poisoned")
            .push(SubscriberEntry { id, sender });
        self.spawn_subscriber(hub.clone(), options, handler, receiver);
        SubscriptionHandle {
            topic: topic.to_string(),
            id,
        }
    }

    /// Remove a subscription; queued deliveries for it are discarded.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) {
        if let Some(hub) = self.hubs.get(&handle.topic) {
            hub.subscribers
                .write()
                .expect("subscriber list poisoned")
                .retain(|entry| entry.id != handle.id);
        }
    }

    /// Register the result channel for a request id. Must happen before the
    /// envelope is published, or a fast response could be dropped.
    pub fn register_result_handler(&self, request_id: &str) -> oneshot::Receiver<ResponseEnvelope> {
        let (sender, receiver) = oneshot::channel();
        self.results.insert(request_id.to_string(), sender);
        receiver
    }

    /// Deliver a response envelope to the registered handler, at most once.
    /// Returns `false` when no handler is registered (already delivered or
    /// expired); the envelope is then dropped with a metric increment.
    pub fn deliver_result(&self, request_id: &str, envelope: ResponseEnvelope) -> bool {
        match self.results.remove(request_id) {
            Some((_, sender)) => sender.send(envelope).is_ok(),
            None => {
                self.metrics.incr("fabric.result.dropped");
                tracing::debug!(request_id, "late or duplicate result dropped");
                false
            }
        }
    }

    /// Drop the result registration so a late response is discarded.
    pub fn unregister_result_handler(&self, request_id: &str) {
        self.results.remove(request_id);
    }

    /// Stop dispatchers and subscriber tasks. Queued messages are drained
    /// to the dispatchers but no new publish is accepted.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn topic_depth(&self, topic: &str) -> usize {
        self.hubs.get(topic).map(|hub| hub.topic.depth()).unwrap_or(0)
    }

    pub fn backpressure_active(&self, topic: &str) -> bool {
        self.hubs
            .get(topic)
            .map(|hub| hub.topic.backpressure_active())
            .unwrap_or(false)
    }

    pub fn dead_letter_count(&self, topic: &str) -> usize {
        self.hubs
            .get(topic)
            .map(|hub| hub.topic.dead_letter_count())
            .unwrap_or(0)
    }

    fn hub(self: &Arc<Self>, topic: &str) -> Arc<TopicHub> {
        if let Some(hub) = self.hubs.get(topic) {
            return hub.clone();
        }
        // Exactly one dispatcher per topic: only the inserting caller
        // spawns it.
        match self.hubs.entry(topic.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(entry) => entry.get().clone(),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let hub = Arc::new(TopicHub {
                    topic: Arc::new(Topic::new(
                        topic,
                        self.config.queue_max_depth,
                        self.config.queue_low_watermark(),
                        self.metrics.clone(),
                    )),
                    subscribers: std::sync::RwLock::new(Vec::new()),
                });
                slot.insert(hub.clone());
                self.spawn_dispatcher(hub.clone());
                hub
            }
        }
    }

    fn spawn_dispatcher(self: &Arc<Self>, hub: Arc<TopicHub>) {
        let cancel = self.cancel.clone();
        let results = self.results.clone();
        let metrics = self.metrics.clone();
        tokio::spawn(async move {
            while let Some(popped) = hub.topic.pop(&cancel).await {
                match popped {
                    Popped::Expired(message) => {
                        expire_message(&results, &metrics, &message);
                    }
                    Popped::Ready(message) => {
                        let senders: Vec<mpsc::Sender<QueueMessage>> = hub
                            .subscribers
                            .read()
                            .expect("subscriber list poisoned")
                            .iter()
                            .map(|entry| entry.sender.clone())
                            .collect();
                        for sender in senders {
                            // Awaiting here is the fan-out suspension point;
                            // a closed channel means the subscriber left.
                            let _ = sender.send(message.clone()).await;
                        }
                    }
                }
            }
        });
    }

    fn spawn_subscriber(
        self: &Arc<Self>,
        hub: Arc<TopicHub>,
        options: SubscribeOptions,
        handler: SubscriberHandler,
        mut receiver: mpsc::Receiver<QueueMessage>,
    ) {
        let cancel = self.cancel.clone();
        let workers = self.workers.clone();
        let metrics = self.metrics.clone();
        let max_attempts = options
            .max_attempts
            .unwrap_or(self.config.queue_max_attempts)
            .max(1);
        let mut dedup = match options.semantics {
            DeliverySemantics::ExactlyOnce => Some(DedupRing::new(self.config.queue_dedup_ring)),
            DeliverySemantics::AtLeastOnce => None,
        };
        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    received = receiver.recv() => match received {
                        Some(message) => message,
                        None => break,
                    },
                    _ = cancel.cancelled() => break,
                };
                if let Some(ring) = dedup.as_mut() {
                    if !ring.observe(&message.meta.message_id) {
                        metrics.incr("queue.duplicate_dropped");
                        continue;
                    }
                }
                let permit = match workers.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };
                let mut attempt = message.meta.attempt;
                loop {
                    let mut delivery = message.clone();
                    delivery.meta.attempt = attempt;
                    match handler(delivery).await {
                        Ok(()) => break,
                        Err(err) => {
                            metrics.incr("queue.delivery_failed");
                            if attempt >= max_attempts {
                                let mut dead = message.clone();
                                dead.meta.attempt = attempt;
                                hub.topic.dead_letter(dead);
                                break;
                            }
                            tracing::debug!(
                                message_id = %message.meta.message_id,
                                attempt,
                                error = %err,
                                "redelivering after failed attempt"
                            );
                            attempt += 1;
                        }
                    }
                }
                drop(permit);
            }
        });
    }
}

fn expire_message(
    results: &DashMap<String, oneshot::Sender<ResponseEnvelope>>,
    metrics: &Metrics,
    message: &QueueMessage,
) {
    metrics.incr("queue.message_expired_dropped");
    if let Some(request_id) = message.payload.request_id() {
        let error = GatiError::Expired {
            topic: message.topic.clone(),
        };
        if let Some((_, sender)) = results.remove(request_id) {
            let _ = sender.send(error.to_envelope(request_id));
        }
    }
}

/// [`EventPublisher`] adapter so user code can emit events through the
/// global context.
pub struct FabricPublisher {
    fabric: Arc<QueueFabric>,
}

impl FabricPublisher {
    pub fn new(fabric: Arc<QueueFabric>) -> Self {
        FabricPublisher { fabric }
    }
}

impl EventPublisher for FabricPublisher {
    fn publish(&self, topic: &str, payload: serde_json::Value) -> Result<(), GatiError> {
        self.fabric
            .publish(topic, QueuePayload::Control(payload), PublishOptions::default())
            .map(|_| ())
    }
}
