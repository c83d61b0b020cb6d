pub mod config;
pub mod envelope;
pub mod error;
pub mod global;
pub mod handler;
pub mod hook;
pub mod local;
pub mod metrics;
pub mod observe;
pub mod schema;
pub mod secrets;

pub use config::{ConfigError, GatiConfig};
pub use envelope::{
    normalize_path, AuthContext, Headers, Method, Priority, RequestEnvelope,
    RequestEnvelopeBuilder, ResponseEnvelope, VersionPreference,
};
pub use error::{AdmissionError, GatiError, HookPhase, PolicyKind, RpcError};
pub use global::{
    EventPublisher, GlobalContext, ModuleInvoker, ModuleRegistry, NoopPublisher, VersionResolver,
};
pub use handler::{FnHandler, Handler, HandlerFuture, HandlerRequest, ResponseBuilder};
pub use hook::{FnHook, Hook, HookArgs, HookFuture, HookOutcome};
pub use local::{CleanupFn, LocalContext, LocalHook, Phase, PromiseGuard, RegistrationId, SnapshotToken};
pub use metrics::{InMemoryMetrics, Metrics, MetricsSink, NoopMetrics};
pub use observe::{init_tracing, with_span, LogLevel, Logger};
pub use schema::{GType, SchemaRegistry, Violation};
pub use secrets::{EnvSecretStore, SecretStore, StaticSecretStore};
