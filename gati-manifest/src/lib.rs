//! Manifest catalog, version graphs, and route matching.
//!
//! The store is the read-mostly source of truth the route manager works
//! from: handler manifests indexed by id and by route, module manifests,
//! schemas, and per-path version graphs with transformer edges. Reads go
//! through an immutable snapshot pointer; writes are serialized, validated
//! (module dependencies, content hashes, graph acyclicity), and swapped in
//! atomically.

pub mod artifact;
pub mod manifest;
pub mod matcher;
pub mod store;
pub mod version;

pub use artifact::{ingest, load_tree, Bundle, EdgeSpec};
pub use manifest::{
    fnv1a64, HandlerManifest, HookBindings, MethodSignature, ModuleManifest, PolicyBlock,
    RateLimitSpec, ResourceHints, RuntimeKind,
};
pub use matcher::{RouteMatch, RouteMatcher};
pub use store::{ManifestStore, StoreSnapshot, StoreVersionResolver};
pub use version::{Resolution, VersionEdge};
