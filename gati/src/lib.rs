//! Gati — an application runtime with versioned routing, a hook
//! lifecycle, and module RPC behind an HTTP front door.
//!
//! This facade crate re-exports the sub-crates through a single
//! dependency with feature flags. Import everything you need with:
//!
//! ```ignore
//! use gati::prelude::*;
//! ```
//!
//! # Feature flags
//!
//! | Feature        | Default | Crate          |
//! |----------------|---------|----------------|
//! | `runtime`      | **yes** | `gati-runtime` |
//! | `test-harness` | no      | `gati-test`    |
//! | `full`         | no      | All of the above |

pub use gati_core;
pub use gati_fabric;
pub use gati_manifest;
pub use gati_router;
pub use gati_rpc;

// Re-export everything from gati-core at the top level for convenience.
pub use gati_core::*;

#[cfg(feature = "runtime")]
pub use gati_runtime;

#[cfg(feature = "test-harness")]
pub use gati_test;

/// Unified prelude — import everything with `use gati::prelude::*`.
pub mod prelude {
    pub use gati_core::{
        AuthContext, FnHandler, FnHook, GatiConfig, GatiError, GlobalContext, Handler,
        HandlerRequest, Headers, Hook, HookArgs, HookOutcome, HookPhase, LocalContext, Method,
        Priority, RequestEnvelope, ResponseBuilder, ResponseEnvelope, VersionPreference,
    };
    pub use gati_fabric::{PublishOptions, QueueFabric, QueuePayload, SubscribeOptions};
    pub use gati_manifest::{HandlerManifest, ManifestStore, ModuleManifest, RuntimeKind};
    pub use gati_router::{RouteManager, RoutingDecision};
    pub use gati_rpc::{LocalTransportBuilder, ModuleClient, TcpTransport};

    #[cfg(feature = "runtime")]
    pub use gati_runtime::{AuthMode, GatiApp, RuntimeBuilder};

    #[cfg(feature = "test-harness")]
    pub use gati_test::{TestApp, TestResponse};
}
