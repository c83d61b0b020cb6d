//! Per-topic bounded priority queue.
//!
//! Ten FIFO rings, one per priority class, behind a single mutex. Strict
//! priority across classes, FIFO within a class. Depth counts all rings;
//! reaching the maximum activates backpressure, which only clears once the
//! depth falls below the low watermark (hysteresis).

use crate::message::QueueMessage;
use gati_core::error::GatiError;
use gati_core::metrics::Metrics;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Instant;
use tokio::sync::Notify;

const PRIORITY_CLASSES: usize = 10;

/// What a pop produced.
pub enum Popped {
    Ready(QueueMessage),
    /// Deadline passed while queued; the caller owes the result handler a
    /// timeout response.
    Expired(QueueMessage),
}

struct TopicState {
    rings: [VecDeque<QueueMessage>; PRIORITY_CLASSES],
    depth: usize,
    backpressure: bool,
    dead_letters: Vec<QueueMessage>,
}

pub struct Topic {
    name: String,
    max_depth: usize,
    low_watermark: usize,
    state: Mutex<TopicState>,
    notify: Notify,
    metrics: Metrics,
}

impl Topic {
    pub fn new(name: impl Into<String>, max_depth: usize, low_watermark: usize, metrics: Metrics) -> Self {
        Topic {
            name: name.into(),
            max_depth,
            low_watermark,
            state: Mutex::new(TopicState {
                rings: Default::default(),
                depth: 0,
                backpressure: false,
                dead_letters: Vec::new(),
            }),
            notify: Notify::new(),
            metrics,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueue. Fails fast with `Backpressure` at the depth limit; the
    /// caller chooses policy.
    pub fn push(&self, message: QueueMessage) -> Result<usize, GatiError> {
        let mut state = self.state.lock().expect("topic lock poisoned");
        if state.depth >= self.max_depth {
            if !state.backpressure {
                state.backpressure = true;
                self.metrics.gauge("queue.backpressure.active", 1.0);
                tracing::warn!(topic = %self.name, depth = state.depth, "backpressure activated");
            }
            return Err(GatiError::Backpressure {
                topic: self.name.clone(),
                depth: state.depth,
            });
        }
        let class = message.meta.priority.class_index();
        state.rings[class].push_back(message);
        state.depth += 1;
        let depth = state.depth;
        drop(state);
        self.notify.notify_one();
        Ok(depth)
    }

    /// Dequeue the next message in strict priority order, waiting when the
    /// topic is empty. Returns `None` once cancelled and drained.
    pub async fn pop(&self, cancel: &tokio_util::sync::CancellationToken) -> Option<Popped> {
        loop {
            if let Some(popped) = self.try_pop() {
                return Some(popped);
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = cancel.cancelled() => {
                    // Drain whatever is left, then stop.
                    return self.try_pop();
                }
            }
        }
    }

    fn try_pop(&self) -> Option<Popped> {
        let mut state = self.state.lock().expect("topic lock poisoned");
        let now = Instant::now();
        for ring in state.rings.iter_mut() {
            if let Some(message) = ring.pop_front() {
                state.depth -= 1;
                self.update_backpressure(&mut state);
                return Some(if message.is_expired(now) {
                    self.metrics.incr("queue.expired");
                    Popped::Expired(message)
                } else {
                    Popped::Ready(message)
                });
            }
        }
        None
    }

    fn update_backpressure(&self, state: &mut TopicState) {
        if state.backpressure && state.depth < self.low_watermark {
            state.backpressure = false;
            self.metrics.gauge("queue.backpressure.active", 0.0);
            tracing::info!(topic = %self.name, depth = state.depth, "backpressure cleared");
        }
    }

    pub fn depth(&self) -> usize {
        self.state.lock().expect("topic lock poisoned").depth
    }

    pub fn backpressure_active(&self) -> bool {
        self.state.lock().expect("topic lock poisoned").backpressure
    }

    /// Record a message whose delivery attempts are exhausted.
    pub fn dead_letter(&self, message: QueueMessage) {
        self.metrics.incr("queue.dead_letter");
        tracing::warn!(
            topic = %self.name,
            message_id = %message.meta.message_id,
            attempts = message.meta.attempt,
            "message dead-lettered"
        );
        self.state
            .lock()
            .expect("topic lock poisoned")
            .dead_letters
            .push(message);
    }

    pub fn dead_letter_count(&self) -> usize {
        self.state.lock().expect("topic lock poisoned").dead_letters.len()
    }
}
