//! Queue messages and their metadata.

use gati_core::envelope::{Priority, RequestEnvelope};
use std::sync::Arc;
use std::time::Instant;

/// Delivery guarantee requested for a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliverySemantics {
    /// Default: failed handlers are redelivered up to the attempt ceiling,
    /// then dead-lettered. Duplicates are possible.
    AtLeastOnce,
    /// A bounded ring of recently seen message ids suppresses duplicates
    /// within the retention window.
    ExactlyOnce,
}

/// What travels on a topic: a request envelope or an opaque control record.
#[derive(Debug, Clone)]
pub enum QueuePayload {
    Request(Arc<RequestEnvelope>),
    Control(serde_json::Value),
}

impl QueuePayload {
    /// The request id carried by this payload, when it is an envelope.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            QueuePayload::Request(envelope) => Some(&envelope.request_id),
            QueuePayload::Control(_) => None,
        }
    }
}

/// Per-message metadata.
#[derive(Debug, Clone)]
pub struct MessageMeta {
    pub message_id: String,
    /// Delivery attempt counter, starting at 1 for the first delivery.
    pub attempt: u32,
    pub priority: Priority,
    pub semantics: DeliverySemantics,
    /// Messages still queued past this instant are dropped as expired.
    pub deadline: Option<Instant>,
    pub enqueued_at: Instant,
}

/// One message on one topic.
#[derive(Debug, Clone)]
pub struct QueueMessage {
    pub topic: String,
    pub payload: QueuePayload,
    pub meta: MessageMeta,
}

impl QueueMessage {
    pub fn is_expired(&self, now: Instant) -> bool {
        self.meta.deadline.is_some_and(|deadline| now >= deadline)
    }
}

/// Knobs for one publish call.
#[derive(Debug, Clone)]
pub struct PublishOptions {
    pub priority: Priority,
    pub semantics: DeliverySemantics,
    pub deadline: Option<Instant>,
    /// Supply an id to make redundant publishes deduplicable downstream;
    /// generated when absent.
    pub message_id: Option<String>,
}

impl Default for PublishOptions {
    fn default() -> Self {
        PublishOptions {
            priority: Priority::default(),
            semantics: DeliverySemantics::AtLeastOnce,
            deadline: None,
            message_id: None,
        }
    }
}

impl PublishOptions {
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn exactly_once(mut self) -> Self {
        self.semantics = DeliverySemantics::ExactlyOnce;
        self
    }

    pub fn deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }
}

/// Outcome of a successful publish.
#[derive(Debug, Clone)]
pub struct PublishResult {
    pub message_id: String,
    /// Topic depth right after the enqueue.
    pub depth: usize,
}
