//! Route manager: versioned routing decisions over the manifest store.
//!
//! Consumes request envelopes (from the routing topic or over RPC; the
//! contract is identical), matches them against the registered patterns,
//! resolves the handler version through the version graph, enforces
//! manifest policies, and returns a [`RoutingDecision`]. Decisions are
//! deterministic for a fixed store snapshot.

pub mod decision;
pub mod manager;
pub mod policy;
pub mod split;

pub use decision::{RouteRequest, RouteResponse, RouteResponseKind, RoutingDecision};
pub use manager::RouteManager;
pub use policy::{AllowAllProbe, InMemoryTokenBucket, RateLimitProbe};
pub use split::{pick_weighted, CanaryHealth};
