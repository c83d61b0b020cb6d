//! In-process priority pub/sub fabric.
//!
//! The fabric decouples the HTTP front door from the routing and execution
//! plane: ingress publishes request envelopes to the routing topic and
//! awaits a per-request result channel; route-manager workers consume the
//! topic and deliver response envelopes back through the same fabric.
//!
//! Guarantees, per topic: strict priority across classes, FIFO within a
//! class, bounded depth with hysteresis backpressure, at-least-once
//! delivery with a configurable attempt ceiling (exactly-once on request
//! via a bounded dedup ring). Nothing survives a process restart.

mod fabric;
mod message;
mod topic;

pub use fabric::{
    FabricPublisher, QueueFabric, SubscribeOptions, SubscriberHandler, SubscriptionHandle,
};
pub use message::{
    DeliverySemantics, MessageMeta, PublishOptions, PublishResult, QueueMessage, QueuePayload,
};
pub use topic::Popped;
