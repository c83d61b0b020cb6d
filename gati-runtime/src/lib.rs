//! Runtime assembly: ingress, hook orchestration, handler execution.
//!
//! This crate glues the core subsystems into one process. Inbound HTTP is
//! admitted and translated to envelopes by the ingress adapter, decoupled
//! from routing by the queue fabric, resolved by the route manager, and
//! executed by the local-context controller around the handler worker.

pub mod admission;
pub mod app;
pub mod hooks;
pub mod ingress;
pub mod lcc;
pub mod worker;

pub use admission::{AuthMode, TokenValidator};
pub use app::{GatiApp, RuntimeBuilder};
pub use hooks::{HandlerRegistry, HookRegistry};
pub use ingress::{
    IngressState, CLIENT_ID_HEADER, PRIORITY_HEADER, REQUEST_ID_HEADER, ROUTING_TOPIC,
    TRACE_ID_HEADER, VERSION_HEADER,
};
pub use lcc::Lcc;
