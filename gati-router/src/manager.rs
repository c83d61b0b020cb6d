//! The route manager.
//!
//! Resolves an envelope to a handler version and enforces manifest
//! policies. Decisions are deterministic: the same envelope against the
//! same store snapshot and registry state yields the same decision, and
//! traffic splitting hashes the request id rather than rolling dice.

use crate::decision::RoutingDecision;
use crate::policy::{check_rate_limit, check_roles, RateLimitProbe};
use crate::split::{pick_weighted, CanaryHealth};
use gati_core::envelope::{normalize_path, RequestEnvelope};
use gati_core::error::GatiError;
use gati_core::global::GlobalContext;
use gati_manifest::{HandlerManifest, ManifestStore, Resolution};
use std::sync::Arc;

pub struct RouteManager {
    store: Arc<ManifestStore>,
    gctx: Arc<GlobalContext>,
    rate_probe: Arc<dyn RateLimitProbe>,
    health: Arc<CanaryHealth>,
}

impl RouteManager {
    pub fn new(
        store: Arc<ManifestStore>,
        gctx: Arc<GlobalContext>,
        rate_probe: Arc<dyn RateLimitProbe>,
    ) -> Arc<Self> {
        Arc::new(RouteManager {
            store,
            gctx,
            rate_probe,
            health: Arc::new(CanaryHealth::new()),
        })
    }

    /// Canary health feedback from the execution plane.
    pub fn record_outcome(&self, pattern: &str, version: &str, success: bool) {
        self.health.record(pattern, version, success);
    }

    /// Decide how to serve one envelope.
    pub fn route(&self, envelope: &RequestEnvelope) -> RoutingDecision {
        let metrics = self.gctx.metrics();
        let path = normalize_path(&envelope.path);
        let snapshot = self.store.snapshot();

        // 1+2. Match method and path; misses are final decisions.
        let matched = match snapshot.matcher().match_route(envelope.method, &path) {
            Ok(matched) => matched,
            Err(err) => {
                metrics.incr("route.decision.handled");
                return handled_from(&err, &envelope.request_id);
            }
        };

        // 3. Resolve the version.
        let versions = snapshot.route_versions(envelope.method, &matched.pattern);
        let resolution = if envelope.version.is_latest() {
            self.split_latest(envelope, &matched.pattern, versions)
        } else {
            snapshot
                .resolve(
                    envelope.method,
                    &matched.pattern,
                    &envelope.version,
                    self.gctx.config().transformer_chain_max,
                )
                .map_err(|err| {
                    tracing::debug!(
                        path = %path,
                        request_id = %envelope.request_id,
                        error = %err,
                        "version resolution failed"
                    );
                    "version_unresolved".to_string()
                })
        };
        let resolution = match resolution {
            Ok(resolution) => resolution,
            Err(reason) => {
                metrics.incr("route.decision.unavailable");
                return RoutingDecision::Unavailable { reason };
            }
        };
        let manifest = resolution.manifest;

        // 4. Manifest policies: roles, then the consulted rate limit.
        if let Err(err) = check_roles(&manifest.policy.roles, &envelope.auth) {
            metrics.incr("route.decision.handled");
            return handled_from(&err, &envelope.request_id);
        }
        if let Some(spec) = &manifest.policy.rate_limit {
            if let Err(err) =
                check_rate_limit(self.rate_probe.as_ref(), spec, &matched.pattern, envelope)
            {
                metrics.incr("route.decision.handled");
                return handled_from(&err, &envelope.request_id);
            }
        }

        // 5. Every required module needs a healthy endpoint.
        let registry = self.gctx.modules();
        for module_id in &manifest.modules {
            let healthy = registry.get(module_id).is_some_and(|m| m.healthy());
            if !healthy {
                tracing::warn!(
                    module = %module_id,
                    handler = %manifest.handler_id,
                    "required module has no healthy endpoint"
                );
                metrics.incr("route.decision.unavailable");
                return RoutingDecision::Unavailable {
                    reason: "no_healthy_module".to_string(),
                };
            }
        }

        // 6. Forward.
        metrics.incr("route.decision.forward");
        RoutingDecision::Forward {
            handler_id: manifest.handler_id.clone(),
            version_id: manifest.version.clone(),
            params: matched.params,
            pattern: matched.pattern,
            transformer_chain: resolution.chain,
            module_endpoints: manifest.modules.clone(),
        }
    }

    /// Latest-preference selection.
    ///
    /// Splitting is opted into by weights: versions carrying an explicit
    /// weight share traffic by deterministic hash of the request id, with
    /// unhealthy canaries excluded. Without weighted versions the newest
    /// active serves. If health exclusion empties the split pool, fall
    /// back to all actives rather than blackholing the route.
    fn split_latest(
        &self,
        envelope: &RequestEnvelope,
        pattern: &str,
        versions: &[Arc<HandlerManifest>],
    ) -> Result<Resolution, String> {
        let actives: Vec<&Arc<HandlerManifest>> = versions.iter().filter(|m| m.active).collect();
        if actives.is_empty() {
            return Err("version_unresolved".to_string());
        }
        let weighted: Vec<&Arc<HandlerManifest>> = actives
            .iter()
            .copied()
            .filter(|m| m.weight.is_some())
            .collect();
        let manifest = if weighted.len() < 2 {
            (*actives
                .iter()
                .max_by_key(|m| m.created_at)
                .expect("actives is non-empty"))
            .clone()
        } else {
            let threshold = self.gctx.config().canary_health_threshold;
            let healthy: Vec<&Arc<HandlerManifest>> = weighted
                .iter()
                .copied()
                .filter(|m| self.health.eligible(pattern, &m.version, threshold))
                .collect();
            let pool = if healthy.is_empty() { weighted } else { healthy };
            pick_weighted(&pool, &envelope.request_id)
                .expect("pool is non-empty")
                .clone()
        };
        Ok(Resolution {
            manifest,
            chain: Vec::new(),
        })
    }
}

fn handled_from(err: &GatiError, request_id: &str) -> RoutingDecision {
    let envelope = err.to_envelope(request_id);
    RoutingDecision::Handled {
        status: envelope.status,
        body: envelope.body,
        headers: envelope.headers,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{AllowAllProbe, InMemoryTokenBucket};
    use chrono::{Duration, Utc};
    use gati_core::config::GatiConfig;
    use gati_core::envelope::{AuthContext, Method, VersionPreference};
    use gati_core::global::{ModuleInvoker, ModuleRegistry, NoopPublisher};
    use gati_core::metrics::{InMemoryMetrics, Metrics};
    use gati_core::secrets::StaticSecretStore;
    use gati_manifest::{HookBindings, PolicyBlock, RateLimitSpec};
    use std::sync::atomic::{AtomicBool, Ordering};

    struct ToggleModule {
        id: String,
        healthy: Arc<AtomicBool>,
    }

    impl ModuleInvoker for ToggleModule {
        fn module_id(&self) -> &str {
            &self.id
        }

        fn invoke<'a>(
            &'a self,
            _method: &'a str,
            args: serde_json::Value,
            _deadline: std::time::Duration,
        ) -> std::pin::Pin<
            Box<
                dyn std::future::Future<Output = Result<serde_json::Value, gati_core::error::RpcError>>
                    + Send
                    + 'a,
            >,
        > {
            Box::pin(async move { Ok(args) })
        }

        fn healthy(&self) -> bool {
            self.healthy.load(Ordering::SeqCst)
        }
    }

    fn handler(id: &str, path: &str, version: &str, age_secs: i64) -> HandlerManifest {
        HandlerManifest {
            handler_id: id.to_string(),
            path: path.to_string(),
            method: Method::Get,
            request_schema: None,
            response_schema: None,
            hooks: HookBindings::default(),
            version: version.to_string(),
            tags: Vec::new(),
            modules: Vec::new(),
            policy: PolicyBlock::default(),
            weight: None,
            active: true,
            content_hash: String::new(),
            created_at: Utc::now() - Duration::seconds(age_secs),
        }
    }

    struct Fixture {
        store: Arc<ManifestStore>,
        manager: Arc<RouteManager>,
        module_health: Arc<AtomicBool>,
    }

    fn fixture(probe: Arc<dyn RateLimitProbe>) -> Fixture {
        let store = Arc::new(ManifestStore::new());
        let module_health = Arc::new(AtomicBool::new(true));
        let registry = ModuleRegistry::new().with_module(Arc::new(ToggleModule {
            id: "users".to_string(),
            healthy: module_health.clone(),
        }));
        let gctx = Arc::new(GlobalContext::new(
            GatiConfig::default(),
            registry,
            Arc::new(StaticSecretStore::new([])),
            Metrics::new(Arc::new(InMemoryMetrics::new()), true),
            Arc::new(NoopPublisher),
        ));
        let manager = RouteManager::new(store.clone(), gctx, probe);
        Fixture {
            store,
            manager,
            module_health,
        }
    }

    fn envelope(path: &str) -> RequestEnvelope {
        RequestEnvelope::builder(Method::Get, path).build()
    }

    #[tokio::test]
    async fn unknown_path_is_handled_404() {
        let f = fixture(Arc::new(AllowAllProbe));
        match f.manager.route(&envelope("/absent")) {
            RoutingDecision::Handled { status, .. } => assert_eq!(status, 404),
            other => panic!("expected Handled, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn wrong_method_is_handled_405_with_allow() {
        let f = fixture(Arc::new(AllowAllProbe));
        let mut m = handler("create", "/things", "v1", 0);
        m.method = Method::Post;
        f.store.store_manifest(m).unwrap();
        match f.manager.route(&envelope("/things")) {
            RoutingDecision::Handled { status, headers, .. } => {
                assert_eq!(status, 405);
                assert_eq!(headers.get("allow"), Some("POST"));
            }
            other => panic!("expected Handled, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn forward_carries_params_and_version() {
        let f = fixture(Arc::new(AllowAllProbe));
        f.store
            .store_manifest(handler("get-user", "/users/:id", "v1", 0))
            .unwrap();
        match f.manager.route(&envelope("/users/42")) {
            RoutingDecision::Forward {
                handler_id,
                version_id,
                params,
                pattern,
                ..
            } => {
                assert_eq!(handler_id, "get-user");
                assert_eq!(version_id, "v1");
                assert_eq!(params.get("id").map(String::as_str), Some("42"));
                assert_eq!(pattern, "/users/:id");
            }
            other => panic!("expected Forward, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn version_preference_selects_and_unknown_is_unavailable() {
        let f = fixture(Arc::new(AllowAllProbe));
        f.store.store_manifest(handler("p1", "/posts", "v1", 200)).unwrap();
        f.store.store_manifest(handler("p2", "/posts", "v2", 100)).unwrap();

        let mut req = envelope("/posts");
        req = req.to_builder().version(VersionPreference::Named("v1".into())).build();
        match f.manager.route(&req) {
            RoutingDecision::Forward { handler_id, .. } => assert_eq!(handler_id, "p1"),
            other => panic!("expected Forward, got {other:?}"),
        }

        // No preference: newest active.
        match f.manager.route(&envelope("/posts")) {
            RoutingDecision::Forward { handler_id, .. } => assert_eq!(handler_id, "p2"),
            other => panic!("expected Forward, got {other:?}"),
        }

        let req = envelope("/posts")
            .to_builder()
            .version(VersionPreference::Named("v9".into()))
            .build();
        match f.manager.route(&req) {
            RoutingDecision::Unavailable { reason } => assert_eq!(reason, "version_unresolved"),
            other => panic!("expected Unavailable, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn role_policy_denies_with_403() {
        let f = fixture(Arc::new(AllowAllProbe));
        let mut m = handler("admin-only", "/admin", "v1", 0);
        m.policy.roles = vec!["admin".to_string()];
        f.store.store_manifest(m).unwrap();

        match f.manager.route(&envelope("/admin")) {
            RoutingDecision::Handled { status, .. } => assert_eq!(status, 403),
            other => panic!("expected Handled, got {other:?}"),
        }

        let mut auth = AuthContext::anonymous();
        auth.roles = vec!["admin".to_string()];
        let req = envelope("/admin").to_builder().auth(auth).build();
        assert!(matches!(f.manager.route(&req), RoutingDecision::Forward { .. }));
    }

    #[tokio::test]
    async fn rate_limit_consultation_denies_with_429() {
        let f = fixture(Arc::new(InMemoryTokenBucket::new()));
        let mut m = handler("limited", "/limited", "v1", 0);
        m.policy.rate_limit = Some(RateLimitSpec {
            key: "global".to_string(),
            max: 1,
            window_secs: 3600,
        });
        f.store.store_manifest(m).unwrap();

        assert!(matches!(
            f.manager.route(&envelope("/limited")),
            RoutingDecision::Forward { .. }
        ));
        match f.manager.route(&envelope("/limited")) {
            RoutingDecision::Handled { status, .. } => assert_eq!(status, 429),
            other => panic!("expected Handled, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unhealthy_module_makes_the_route_unavailable() {
        let f = fixture(Arc::new(AllowAllProbe));
        f.store
            .store_module(gati_manifest::ModuleManifest {
                module_id: "users".to_string(),
                version: "1".to_string(),
                runtime: gati_manifest::RuntimeKind::InProcess,
                methods: Default::default(),
                capabilities: Vec::new(),
                resources: Default::default(),
            })
            .unwrap();
        let mut m = handler("needs-users", "/users/:id", "v1", 0);
        m.modules = vec!["users".to_string()];
        f.store.store_manifest(m).unwrap();

        assert!(matches!(
            f.manager.route(&envelope("/users/1")),
            RoutingDecision::Forward { .. }
        ));
        f.module_health.store(false, Ordering::SeqCst);
        match f.manager.route(&envelope("/users/1")) {
            RoutingDecision::Unavailable { reason } => assert_eq!(reason, "no_healthy_module"),
            other => panic!("expected Unavailable, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn decisions_are_deterministic_for_identical_envelopes() {
        let f = fixture(Arc::new(AllowAllProbe));
        let mut v1 = handler("s1", "/split", "v1", 200);
        v1.weight = Some(50);
        let mut v2 = handler("s2", "/split", "v2", 100);
        v2.weight = Some(50);
        f.store.store_manifest(v1).unwrap();
        f.store.store_manifest(v2).unwrap();

        let req = envelope("/split").to_builder().request_id("fixed-id").build();
        let first = f.manager.route(&req);
        for _ in 0..50 {
            assert_eq!(f.manager.route(&req), first);
        }
    }

    #[tokio::test]
    async fn weighted_versions_split_but_unweighted_serve_newest() {
        let f = fixture(Arc::new(AllowAllProbe));
        let mut v1 = handler("w1", "/split", "v1", 200);
        v1.weight = Some(50);
        let mut v2 = handler("w2", "/split", "v2", 100);
        v2.weight = Some(50);
        f.store.store_manifest(v1).unwrap();
        f.store.store_manifest(v2).unwrap();

        let mut seen = std::collections::BTreeSet::new();
        for i in 0..200 {
            let req = envelope("/split")
                .to_builder()
                .request_id(format!("req-{i}"))
                .build();
            if let RoutingDecision::Forward { version_id, .. } = f.manager.route(&req) {
                seen.insert(version_id);
            }
        }
        assert_eq!(seen.len(), 2, "both weighted versions should receive traffic");
    }

    #[tokio::test]
    async fn failing_canary_is_excluded_from_the_split() {
        let f = fixture(Arc::new(AllowAllProbe));
        let mut v1 = handler("c1", "/split", "v1", 200);
        v1.weight = Some(50);
        let mut v2 = handler("c2", "/split", "v2", 100);
        v2.weight = Some(50);
        f.store.store_manifest(v1).unwrap();
        f.store.store_manifest(v2).unwrap();

        for _ in 0..20 {
            f.manager.record_outcome("/split", "v2", false);
        }
        for i in 0..100 {
            let req = envelope("/split")
                .to_builder()
                .request_id(format!("req-{i}"))
                .build();
            match f.manager.route(&req) {
                RoutingDecision::Forward { version_id, .. } => assert_eq!(version_id, "v1"),
                other => panic!("expected Forward, got {other:?}"),
            }
        }
    }
}
