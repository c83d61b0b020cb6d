//! Global context: the process-wide registry.
//!
//! Created once at startup and shared by reference. Readers observe an
//! immutable module-registry snapshot behind a pointer; hot reload builds
//! a new registry and swaps the pointer atomically, so registration is
//! append-only from the perspective of running requests.

use crate::config::GatiConfig;
use crate::envelope::VersionPreference;
use crate::error::{GatiError, RpcError};
use crate::metrics::Metrics;
use crate::observe::Logger;
use crate::secrets::SecretStore;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::time::Duration;

type InvokeFuture<'a> = Pin<Box<dyn Future<Output = Result<serde_json::Value, RpcError>> + Send + 'a>>;

/// RPC stub for one registered module. Implemented by the module RPC
/// client; the core only sees this seam.
pub trait ModuleInvoker: Send + Sync + 'static {
    fn module_id(&self) -> &str;

    /// Call a method declared in the module's manifest. The deadline bounds
    /// the whole call including retries.
    fn invoke<'a>(
        &'a self,
        method: &'a str,
        args: serde_json::Value,
        deadline: Duration,
    ) -> InvokeFuture<'a>;

    /// Whether the module currently has a healthy endpoint.
    fn healthy(&self) -> bool {
        true
    }
}

/// Seam for publishing events onto the queue fabric from user code.
pub trait EventPublisher: Send + Sync + 'static {
    fn publish(&self, topic: &str, payload: serde_json::Value) -> Result<(), GatiError>;
}

/// Publisher that drops events; used before the fabric is wired and in
/// unit tests.
pub struct NoopPublisher;

impl EventPublisher for NoopPublisher {
    fn publish(&self, _topic: &str, _payload: serde_json::Value) -> Result<(), GatiError> {
        Ok(())
    }
}

/// Seam for resolving a version preference to a concrete version id.
/// Implemented over the manifest store.
pub trait VersionResolver: Send + Sync + 'static {
    fn resolve(&self, path: &str, preference: &VersionPreference) -> Result<String, GatiError>;
}

/// Immutable snapshot of the module registry.
#[derive(Default)]
pub struct ModuleRegistry {
    modules: HashMap<String, Arc<dyn ModuleInvoker>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_module(mut self, module: Arc<dyn ModuleInvoker>) -> Self {
        self.modules.insert(module.module_id().to_string(), module);
        self
    }

    pub fn insert(&mut self, module: Arc<dyn ModuleInvoker>) {
        self.modules.insert(module.module_id().to_string(), module);
    }

    pub fn get(&self, id: &str) -> Option<&Arc<dyn ModuleInvoker>> {
        self.modules.get(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.modules.keys().map(|k| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

/// Process-wide registry handed to hooks and handlers.
pub struct GlobalContext {
    config: GatiConfig,
    modules: RwLock<Arc<ModuleRegistry>>,
    secrets: Arc<dyn SecretStore>,
    metrics: Metrics,
    publisher: Arc<dyn EventPublisher>,
    version_resolver: RwLock<Option<Arc<dyn VersionResolver>>>,
}

impl GlobalContext {
    pub fn new(
        config: GatiConfig,
        modules: ModuleRegistry,
        secrets: Arc<dyn SecretStore>,
        metrics: Metrics,
        publisher: Arc<dyn EventPublisher>,
    ) -> Self {
        GlobalContext {
            config,
            modules: RwLock::new(Arc::new(modules)),
            secrets,
            metrics,
            publisher,
            version_resolver: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &GatiConfig {
        &self.config
    }

    /// The current module registry snapshot. Cheap; callers keep the Arc
    /// for the duration of their work and never block the writer.
    pub fn modules(&self) -> Arc<ModuleRegistry> {
        self.modules.read().expect("module registry lock poisoned").clone()
    }

    /// Typed proxy for one module.
    pub fn module(&self, id: &str) -> Option<Arc<dyn ModuleInvoker>> {
        self.modules().get(id).cloned()
    }

    /// Replace the whole registry atomically (hot reload).
    pub fn replace_modules(&self, registry: ModuleRegistry) {
        *self.modules.write().expect("module registry lock poisoned") = Arc::new(registry);
    }

    /// Asynchronous secret lookup; backend failures propagate.
    pub async fn secret(&self, name: &str) -> Result<Option<String>, GatiError> {
        self.secrets.get(name).await
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Root logger for a request; per-request contexts derive children.
    pub fn logger(&self, request_id: &str, trace_id: &str, client_id: &str) -> Logger {
        Logger::for_request(request_id, trace_id, client_id)
    }

    /// Publish an event onto the fabric from user code.
    pub fn publish(&self, topic: &str, payload: serde_json::Value) -> Result<(), GatiError> {
        self.publisher.publish(topic, payload)
    }

    pub fn set_version_resolver(&self, resolver: Arc<dyn VersionResolver>) {
        *self
            .version_resolver
            .write()
            .expect("version resolver lock poisoned") = Some(resolver);
    }

    /// Resolve a version preference for a path to a concrete version id.
    pub fn resolve_version(
        &self,
        path: &str,
        preference: &VersionPreference,
    ) -> Result<String, GatiError> {
        let resolver = self
            .version_resolver
            .read()
            .expect("version resolver lock poisoned")
            .clone();
        match resolver {
            Some(resolver) => resolver.resolve(path, preference),
            None => Err(GatiError::Internal("no version resolver installed".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::InMemoryMetrics;
    use crate::secrets::StaticSecretStore;

    struct EchoModule;

    impl ModuleInvoker for EchoModule {
        fn module_id(&self) -> &str {
            "echo"
        }

        fn invoke<'a>(
            &'a self,
            _method: &'a str,
            args: serde_json::Value,
            _deadline: Duration,
        ) -> InvokeFuture<'a> {
            Box::pin(async move { Ok(args) })
        }
    }

    fn gctx() -> GlobalContext {
        GlobalContext::new(
            GatiConfig::default(),
            ModuleRegistry::new().with_module(Arc::new(EchoModule)),
            Arc::new(StaticSecretStore::new([(
                "api.key".to_string(),
                "k".to_string(),
            )])),
            Metrics::new(Arc::new(InMemoryMetrics::new()), true),
            Arc::new(NoopPublisher),
        )
    }

    #[tokio::test]
    async fn module_lookup_and_invoke() {
        let ctx = gctx();
        let module = ctx.module("echo").unwrap();
        let result = module
            .invoke("ping", serde_json::json!({"x": 1}), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(result["x"], 1);
        assert!(ctx.module("missing").is_none());
    }

    #[tokio::test]
    async fn replace_swaps_the_whole_registry() {
        let ctx = gctx();
        let snapshot_before = ctx.modules();
        ctx.replace_modules(ModuleRegistry::new());
        assert!(ctx.module("echo").is_none());
        // The old snapshot stays readable for holders.
        assert!(snapshot_before.get("echo").is_some());
    }

    #[tokio::test]
    async fn secrets_resolve_through_the_store() {
        let ctx = gctx();
        assert_eq!(ctx.secret("api.key").await.unwrap().as_deref(), Some("k"));
        assert_eq!(ctx.secret("nope").await.unwrap(), None);
    }

    #[test]
    fn version_resolution_requires_a_resolver() {
        let ctx = gctx();
        assert!(ctx
            .resolve_version("/a", &VersionPreference::Latest)
            .is_err());
    }
}
