//! Runtime assembly.
//!
//! The builder wires config, manifest store, fabric, global context,
//! route manager, LCC, and the ingress router into one process. The
//! execution plane is a fabric subscriber on the routing topic: it asks
//! the route manager for a decision, runs forwarded requests through the
//! LCC, and delivers the result envelope back through the fabric's
//! per-request channel.

use crate::admission::AuthMode;
use crate::hooks::{HandlerRegistry, HookRegistry};
use crate::ingress::{self, IngressState, ROUTING_TOPIC, VERSION_HEADER};
use crate::lcc::Lcc;
use gati_core::config::GatiConfig;
use gati_core::envelope::ResponseEnvelope;
use gati_core::error::{GatiError, HookPhase};
use gati_core::global::{GlobalContext, ModuleInvoker, ModuleRegistry};
use gati_core::handler::Handler;
use gati_core::hook::Hook;
use gati_core::metrics::{InMemoryMetrics, Metrics, MetricsSink};
use gati_core::secrets::{EnvSecretStore, SecretStore};
use gati_fabric::{
    FabricPublisher, QueueFabric, QueuePayload, SubscribeOptions, SubscriberHandler,
};
use gati_manifest::{HandlerManifest, ManifestStore, ModuleManifest, StoreVersionResolver};
use gati_router::{InMemoryTokenBucket, RateLimitProbe, RouteManager};
use gati_rpc::{ModuleClient, ModuleTransport};
use std::path::PathBuf;
use std::sync::Arc;

enum ModuleSpec {
    /// Built into a pooled RPC client over the given transport.
    Transport(ModuleManifest, Arc<dyn ModuleTransport>),
    /// Pre-built invoker (in-process modules, tests).
    Invoker(ModuleManifest, Arc<dyn ModuleInvoker>),
}

/// Assembles a [`GatiApp`].
pub struct RuntimeBuilder {
    config: GatiConfig,
    metrics_sink: Arc<dyn MetricsSink>,
    secrets: Arc<dyn SecretStore>,
    rate_probe: Arc<dyn RateLimitProbe>,
    auth: Option<AuthMode>,
    hooks: HookRegistry,
    handlers: HandlerRegistry,
    manifests: Vec<HandlerManifest>,
    modules: Vec<ModuleSpec>,
    schemas: Vec<(String, gati_core::GType)>,
    artifact_dir: Option<PathBuf>,
}

impl RuntimeBuilder {
    pub fn new(config: GatiConfig) -> Self {
        RuntimeBuilder {
            config,
            metrics_sink: Arc::new(InMemoryMetrics::new()),
            secrets: Arc::new(EnvSecretStore),
            rate_probe: Arc::new(InMemoryTokenBucket::new()),
            auth: None,
            hooks: HookRegistry::new(),
            handlers: HandlerRegistry::new(),
            manifests: Vec::new(),
            modules: Vec::new(),
            schemas: Vec::new(),
            artifact_dir: None,
        }
    }

    pub fn metrics(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.metrics_sink = sink;
        self
    }

    pub fn secrets(mut self, store: Arc<dyn SecretStore>) -> Self {
        self.secrets = store;
        self
    }

    pub fn rate_probe(mut self, probe: Arc<dyn RateLimitProbe>) -> Self {
        self.rate_probe = probe;
        self
    }

    pub fn auth(mut self, mode: AuthMode) -> Self {
        self.auth = Some(mode);
        self
    }

    /// Hook that runs for every request in the given phase.
    pub fn global_hook(mut self, phase: HookPhase, hook: Arc<dyn Hook>) -> Self {
        self.hooks.register_global(phase, hook);
        self
    }

    /// Named hook bindable from handler manifests.
    pub fn named_hook(mut self, hook: Arc<dyn Hook>) -> Self {
        self.hooks.register_named(hook);
        self
    }

    /// Register a handler implementation together with its manifest.
    pub fn handler(mut self, manifest: HandlerManifest, implementation: Arc<dyn Handler>) -> Self {
        self.manifests.push(manifest);
        self.handlers.register(implementation);
        self
    }

    /// Module reached over a transport (framed TCP for remote/sandboxed
    /// runtimes).
    pub fn module(mut self, manifest: ModuleManifest, transport: Arc<dyn ModuleTransport>) -> Self {
        self.modules.push(ModuleSpec::Transport(manifest, transport));
        self
    }

    /// Module with a pre-built invoker.
    pub fn module_invoker(
        mut self,
        manifest: ModuleManifest,
        invoker: Arc<dyn ModuleInvoker>,
    ) -> Self {
        self.modules.push(ModuleSpec::Invoker(manifest, invoker));
        self
    }

    /// Named schema resolvable from manifest request/response refs.
    pub fn schema(mut self, id: impl Into<String>, schema: gati_core::GType) -> Self {
        self.schemas.push((id.into(), schema));
        self
    }

    /// Directory of manifest artifact files ingested at startup.
    pub fn artifacts(mut self, dir: impl Into<PathBuf>) -> Self {
        self.artifact_dir = Some(dir.into());
        self
    }

    /// Wire everything together. Fails (fatally, for the launcher) on
    /// unresolved dependencies: missing modules, missing handler
    /// implementations, or dangling hook ids.
    pub async fn build(self) -> Result<GatiApp, GatiError> {
        let config = self.config;
        let metrics = Metrics::new(self.metrics_sink, config.metrics_enabled);
        let store = Arc::new(ManifestStore::new());

        // Modules land first so handler dependency validation sees them.
        let mut registry = ModuleRegistry::new();
        for spec in self.modules {
            match spec {
                ModuleSpec::Transport(manifest, transport) => {
                    store.store_module(manifest.clone())?;
                    let client =
                        ModuleClient::new(Arc::new(manifest), transport, &config, metrics.clone());
                    client.warm().await;
                    registry.insert(client);
                }
                ModuleSpec::Invoker(manifest, invoker) => {
                    store.store_module(manifest)?;
                    registry.insert(invoker);
                }
            }
        }

        for (id, schema) in self.schemas {
            store.store_schema(id, schema)?;
        }
        if let Some(dir) = &self.artifact_dir {
            let loaded = gati_manifest::load_tree(&store, dir)?;
            tracing::info!(dir = %dir.display(), files = loaded, "manifest artifacts ingested");
        }
        for manifest in self.manifests {
            store.store_manifest(manifest)?;
        }

        // Startup integrity: every manifest needs an implementation and
        // resolvable hook bindings.
        let handlers = Arc::new(self.handlers);
        let hooks = Arc::new(self.hooks);
        let snapshot = store.snapshot();
        for manifest in snapshot.handlers() {
            if handlers.get(&manifest.handler_id).is_none() {
                return Err(GatiError::Internal(format!(
                    "manifest '{}' has no registered handler implementation",
                    manifest.handler_id
                )));
            }
            for ids in [
                &manifest.hooks.before,
                &manifest.hooks.after,
                &manifest.hooks.catch,
            ] {
                hooks.validate(ids).map_err(GatiError::Internal)?;
            }
        }

        let fabric = QueueFabric::new(config.clone(), metrics.clone());
        let gctx = Arc::new(GlobalContext::new(
            config.clone(),
            registry,
            self.secrets,
            metrics.clone(),
            Arc::new(FabricPublisher::new(fabric.clone())),
        ));
        gctx.set_version_resolver(Arc::new(StoreVersionResolver::new(
            store.clone(),
            config.transformer_chain_max,
        )));

        let route_manager = RouteManager::new(store.clone(), gctx.clone(), self.rate_probe);
        let lcc = Lcc::new(gctx.clone(), hooks);
        subscribe_execution_plane(
            &fabric,
            store.clone(),
            route_manager.clone(),
            lcc,
            handlers,
        );

        let auth = self
            .auth
            .unwrap_or_else(|| AuthMode::from_config(&config));
        let ingress_state = Arc::new(IngressState {
            fabric: fabric.clone(),
            config: config.clone(),
            auth,
            metrics,
        });
        let router = ingress::router(ingress_state);

        Ok(GatiApp {
            router,
            fabric,
            gctx,
            store,
            route_manager,
            config,
        })
    }
}

/// The routing-topic subscriber: decision, execution, result delivery.
/// Exactly-once semantics plus request-id message ids make a retried
/// ingress publish idempotent.
fn subscribe_execution_plane(
    fabric: &Arc<QueueFabric>,
    store: Arc<ManifestStore>,
    route_manager: Arc<RouteManager>,
    lcc: Arc<Lcc>,
    handlers: Arc<HandlerRegistry>,
) {
    let delivery_fabric = fabric.clone();
    let handler: SubscriberHandler = Arc::new(move |message| {
        let store = store.clone();
        let route_manager = route_manager.clone();
        let lcc = lcc.clone();
        let handlers = handlers.clone();
        let fabric = delivery_fabric.clone();
        Box::pin(async move {
            let QueuePayload::Request(envelope) = message.payload else {
                return Ok(());
            };
            let response = match route_manager.route(&envelope) {
                gati_router::RoutingDecision::Handled {
                    status,
                    body,
                    headers,
                } => {
                    let mut response = ResponseEnvelope::new(&envelope.request_id, status);
                    response.headers = headers;
                    response.body = body;
                    response
                }
                gati_router::RoutingDecision::Unavailable { reason } => {
                    GatiError::Unavailable { reason }.to_envelope(&envelope.request_id)
                }
                gati_router::RoutingDecision::Forward {
                    handler_id,
                    version_id,
                    params,
                    pattern,
                    transformer_chain,
                    ..
                } => {
                    if !transformer_chain.is_empty() {
                        tracing::debug!(
                            request_id = %envelope.request_id,
                            chain = ?transformer_chain,
                            "serving through a transformer chain"
                        );
                    }
                    let snapshot = store.snapshot();
                    let manifest = snapshot.handler(&handler_id).cloned();
                    match (manifest, handlers.get(&handler_id)) {
                        (Some(manifest), Some(implementation)) => {
                            // Handler-boundary validation: the declared
                            // request schema gates entry.
                            if let Some(violation) =
                                check_schema(&snapshot, manifest.request_schema.as_deref(), envelope.body.as_ref())
                            {
                                GatiError::Admission(gati_core::AdmissionError::Malformed(
                                    format!("request body: {violation}"),
                                ))
                                .to_envelope(&envelope.request_id)
                            } else {
                                let mut response = lcc
                                    .execute(envelope.clone(), &manifest, implementation, params)
                                    .await;
                                response.headers.insert(VERSION_HEADER, version_id.clone());
                                if let Some(violation) = check_schema(
                                    &snapshot,
                                    manifest.response_schema.as_deref(),
                                    response.body.as_ref(),
                                ) {
                                    response
                                        .warnings
                                        .push(format!("response body: {violation}"));
                                }
                                route_manager.record_outcome(
                                    &pattern,
                                    &version_id,
                                    response.status < 500,
                                );
                                response
                            }
                        }
                        _ => GatiError::Internal(format!(
                            "no implementation for handler '{handler_id}'"
                        ))
                        .to_envelope(&envelope.request_id),
                    }
                }
            };
            fabric.deliver_result(&envelope.request_id, response);
            Ok(())
        })
    });
    fabric.subscribe(ROUTING_TOPIC, SubscribeOptions::exactly_once(), handler);
}

/// Validate a body against a schema reference from the store. `None` means
/// conformant (or no schema declared); `Some` carries the joined
/// violations.
fn check_schema(
    snapshot: &gati_manifest::StoreSnapshot,
    schema_id: Option<&str>,
    body: Option<&serde_json::Value>,
) -> Option<String> {
    let schema = snapshot.schemas().get(schema_id?)?;
    let body = body.cloned().unwrap_or(serde_json::Value::Null);
    let violations = schema.validate(&body, snapshot.schemas());
    if violations.is_empty() {
        return None;
    }
    Some(
        violations
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join("; "),
    )
}

/// A running (or runnable) Gati process.
pub struct GatiApp {
    router: axum::Router,
    pub fabric: Arc<QueueFabric>,
    pub gctx: Arc<GlobalContext>,
    pub store: Arc<ManifestStore>,
    pub route_manager: Arc<RouteManager>,
    config: GatiConfig,
}

impl GatiApp {
    /// The assembled ingress router; tests drive it in-process.
    pub fn router(&self) -> axum::Router {
        self.router.clone()
    }

    pub fn config(&self) -> &GatiConfig {
        &self.config
    }

    /// Serve until ctrl-c, then shut the fabric down.
    pub async fn serve(self, addr: std::net::SocketAddr) -> Result<(), GatiError> {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|err| GatiError::Internal(format!("bind {addr}: {err}")))?;
        tracing::info!(%addr, workers = self.config.runtime_workers, "gati runtime listening");
        let fabric = self.fabric.clone();
        axum::serve(listener, self.router)
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("shutdown signal received");
            })
            .await
            .map_err(|err| GatiError::Internal(format!("serve: {err}")))?;
        fabric.shutdown();
        Ok(())
    }

    pub fn shutdown(&self) {
        self.fabric.shutdown();
    }
}
