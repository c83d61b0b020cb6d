//! Manifest and version store.
//!
//! Read-mostly catalog with three indexes (handler id, route, module id).
//! Readers observe an immutable snapshot behind a pointer and never take
//! the writer lock; writes rebuild the snapshot under a single writer
//! mutex, validate it, and swap the pointer. A snapshot held across a
//! swap stays fully readable.

use crate::manifest::{HandlerManifest, ModuleManifest};
use crate::matcher::RouteMatcher;
use crate::version::{self, Resolution, VersionEdge};
use gati_core::envelope::{Method, VersionPreference};
use gati_core::error::GatiError;
use gati_core::global::VersionResolver;
use gati_core::schema::{GType, SchemaRegistry};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

/// Immutable view of the catalog at one instant.
pub struct StoreSnapshot {
    handlers: HashMap<String, Arc<HandlerManifest>>,
    routes: HashMap<(Method, String), Vec<Arc<HandlerManifest>>>,
    by_path: HashMap<String, Vec<Arc<HandlerManifest>>>,
    modules: HashMap<String, Arc<ModuleManifest>>,
    schemas: SchemaRegistry,
    edges: HashMap<String, Vec<VersionEdge>>,
    matcher: RouteMatcher,
}

impl StoreSnapshot {
    pub fn handler(&self, id: &str) -> Option<&Arc<HandlerManifest>> {
        self.handlers.get(id)
    }

    /// Versions registered at `(method, path)`, oldest first.
    pub fn route_versions(&self, method: Method, path: &str) -> &[Arc<HandlerManifest>] {
        self.routes
            .get(&(method, path.to_string()))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Versions registered at `path` across methods, oldest first.
    pub fn path_versions(&self, path: &str) -> &[Arc<HandlerManifest>] {
        self.by_path.get(path).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn module(&self, id: &str) -> Option<&Arc<ModuleManifest>> {
        self.modules.get(id)
    }

    pub fn schemas(&self) -> &SchemaRegistry {
        &self.schemas
    }

    pub fn matcher(&self) -> &RouteMatcher {
        &self.matcher
    }

    pub fn edges(&self, path: &str) -> &[VersionEdge] {
        self.edges.get(path).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Resolve a version preference for one route.
    pub fn resolve(
        &self,
        method: Method,
        path: &str,
        preference: &VersionPreference,
        chain_max: usize,
    ) -> Result<Resolution, GatiError> {
        version::resolve(
            path,
            self.route_versions(method, path),
            self.edges(path),
            preference,
            chain_max,
        )
    }

    /// Every registered handler manifest, in no particular order.
    pub fn handlers(&self) -> impl Iterator<Item = &Arc<HandlerManifest>> {
        self.handlers.values()
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    pub fn module_count(&self) -> usize {
        self.modules.len()
    }
}

/// Mutable truth behind the snapshot, owned by the writer lock.
#[derive(Default, Clone)]
struct StoreContents {
    handlers: Vec<Arc<HandlerManifest>>,
    modules: HashMap<String, Arc<ModuleManifest>>,
    schemas: SchemaRegistry,
    edges: HashMap<String, Vec<VersionEdge>>,
}

impl StoreContents {
    fn build_snapshot(&self) -> Result<StoreSnapshot, GatiError> {
        let mut handlers = HashMap::new();
        let mut routes: HashMap<(Method, String), Vec<Arc<HandlerManifest>>> = HashMap::new();
        let mut by_path: HashMap<String, Vec<Arc<HandlerManifest>>> = HashMap::new();
        // Registration order drives matcher tie-breaking.
        let mut route_order: Vec<(Method, String)> = Vec::new();

        for manifest in &self.handlers {
            for module_id in &manifest.modules {
                if !self.modules.contains_key(module_id) {
                    return Err(GatiError::UnresolvedDependency {
                        handler_id: manifest.handler_id.clone(),
                        module_id: module_id.clone(),
                    });
                }
            }
            handlers.insert(manifest.handler_id.clone(), manifest.clone());
            let key = (manifest.method, manifest.path.clone());
            if !routes.contains_key(&key) {
                route_order.push(key.clone());
            }
            routes.entry(key).or_default().push(manifest.clone());
            by_path
                .entry(manifest.path.clone())
                .or_default()
                .push(manifest.clone());
        }
        for versions in routes.values_mut() {
            versions.sort_by_key(|m| m.created_at);
        }
        for versions in by_path.values_mut() {
            versions.sort_by_key(|m| m.created_at);
        }

        let mut matcher = RouteMatcher::new();
        for (method, path) in &route_order {
            let versions = &routes[&(*method, path.clone())];
            let representative = versions
                .iter()
                .filter(|m| m.active)
                .max_by_key(|m| m.created_at)
                .unwrap_or_else(|| versions.last().expect("route has at least one version"));
            matcher.register(*method, path, representative.handler_id.clone());
        }

        Ok(StoreSnapshot {
            handlers,
            routes,
            by_path,
            modules: self.modules.clone(),
            schemas: self.schemas.clone(),
            edges: self.edges.clone(),
            matcher,
        })
    }
}

/// The store: copy-on-write snapshot pointer, single-writer mutation.
pub struct ManifestStore {
    contents: Mutex<StoreContents>,
    snapshot: RwLock<Arc<StoreSnapshot>>,
}

impl ManifestStore {
    pub fn new() -> Self {
        let contents = StoreContents::default();
        let snapshot = contents
            .build_snapshot()
            .expect("empty snapshot always builds");
        ManifestStore {
            contents: Mutex::new(contents),
            snapshot: RwLock::new(Arc::new(snapshot)),
        }
    }

    /// The current snapshot. Lock-free for practical purposes: the read
    /// lock is held only for the pointer clone.
    pub fn snapshot(&self) -> Arc<StoreSnapshot> {
        self.snapshot.read().expect("snapshot lock poisoned").clone()
    }

    /// Append or replace a handler manifest.
    ///
    /// The manifest is sealed first: a declared content hash must match the
    /// content. A different handler id claiming an existing
    /// `(method, path, version)` is rejected. The write fails with
    /// `UnresolvedDependency` when a declared module is absent.
    pub fn store_manifest(&self, manifest: HandlerManifest) -> Result<(), GatiError> {
        let manifest = manifest.sealed().map_err(GatiError::Internal)?;
        self.mutate(|contents| {
            let conflict = contents.handlers.iter().any(|existing| {
                existing.handler_id != manifest.handler_id
                    && existing.method == manifest.method
                    && existing.path == manifest.path
                    && existing.version == manifest.version
            });
            if conflict {
                return Err(GatiError::Internal(format!(
                    "version '{}' already registered at {} {}",
                    manifest.version, manifest.method, manifest.path
                )));
            }
            contents
                .handlers
                .retain(|existing| existing.handler_id != manifest.handler_id);
            contents.handlers.push(Arc::new(manifest));
            Ok(())
        })
    }

    /// Fetch by handler id; with a version, fetch that version of the same
    /// route. Without one, the newest version of the route.
    pub fn get_manifest(&self, id: &str, version: Option<&str>) -> Option<Arc<HandlerManifest>> {
        let snapshot = self.snapshot();
        let manifest = snapshot.handler(id)?;
        let family = snapshot.route_versions(manifest.method, &manifest.path);
        match version {
            Some(name) => family.iter().find(|m| m.answers_to(name)).cloned(),
            None => family.iter().max_by_key(|m| m.created_at).cloned(),
        }
    }

    /// All versions registered at a path, oldest first.
    pub fn list_versions(&self, path: &str) -> Vec<Arc<HandlerManifest>> {
        self.snapshot().path_versions(path).to_vec()
    }

    pub fn store_module(&self, manifest: ModuleManifest) -> Result<(), GatiError> {
        self.mutate(|contents| {
            contents
                .modules
                .insert(manifest.module_id.clone(), Arc::new(manifest));
            Ok(())
        })
    }

    pub fn get_module(&self, id: &str) -> Option<Arc<ModuleManifest>> {
        self.snapshot().module(id).cloned()
    }

    pub fn store_schema(&self, id: impl Into<String>, schema: GType) -> Result<(), GatiError> {
        let id = id.into();
        self.mutate(|contents| {
            contents.schemas.register(id.clone(), schema.clone());
            Ok(())
        })
    }

    /// Publish a transformer edge between two versions of a path.
    /// Transformers are immutable: re-publishing an existing edge fails, as
    /// does any edge that would close a cycle.
    pub fn store_version_edge(
        &self,
        path: &str,
        from: &str,
        to: &str,
        transformer: &str,
    ) -> Result<(), GatiError> {
        self.mutate(|contents| {
            let known = |version: &str| {
                contents
                    .handlers
                    .iter()
                    .any(|m| m.path == path && m.version == version)
            };
            if !known(from) || !known(to) {
                return Err(GatiError::Internal(format!(
                    "edge endpoints '{from}' -> '{to}' must both exist at {path}"
                )));
            }
            let edges = contents.edges.entry(path.to_string()).or_default();
            if edges.iter().any(|e| e.from == from && e.to == to) {
                return Err(GatiError::Internal(format!(
                    "transformer '{from}' -> '{to}' is already published"
                )));
            }
            if version::would_cycle(edges, from, to) {
                return Err(GatiError::Internal(format!(
                    "edge '{from}' -> '{to}' would create a cycle at {path}"
                )));
            }
            edges.push(VersionEdge {
                from: from.to_string(),
                to: to.to_string(),
                transformer: transformer.to_string(),
            });
            Ok(())
        })
    }

    /// Apply a change transactionally: work on a scratch copy, validate by
    /// building the snapshot, and only then commit and swap the pointer.
    fn mutate(
        &self,
        apply: impl FnOnce(&mut StoreContents) -> Result<(), GatiError>,
    ) -> Result<(), GatiError> {
        let mut contents = self.contents.lock().expect("store writer lock poisoned");
        let mut scratch = contents.clone();
        apply(&mut scratch)?;
        let snapshot = scratch.build_snapshot()?;
        *contents = scratch;
        *self.snapshot.write().expect("snapshot lock poisoned") = Arc::new(snapshot);
        Ok(())
    }
}

impl Default for ManifestStore {
    fn default() -> Self {
        Self::new()
    }
}

/// [`VersionResolver`] over the store, installed into the global context.
pub struct StoreVersionResolver {
    store: Arc<ManifestStore>,
    chain_max: usize,
}

impl StoreVersionResolver {
    pub fn new(store: Arc<ManifestStore>, chain_max: usize) -> Self {
        StoreVersionResolver { store, chain_max }
    }
}

impl VersionResolver for StoreVersionResolver {
    fn resolve(&self, path: &str, preference: &VersionPreference) -> Result<String, GatiError> {
        let snapshot = self.store.snapshot();
        let resolution = version::resolve(
            path,
            snapshot.path_versions(path),
            snapshot.edges(path),
            preference,
            self.chain_max,
        )?;
        Ok(resolution.manifest.version.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{HookBindings, PolicyBlock, RuntimeKind};
    use chrono::{Duration, Utc};
    use std::collections::BTreeMap;

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

    fn module(id: &str) -> ModuleManifest {
        ModuleManifest {
            module_id: id.to_string(),
            version: "1".to_string(),
            runtime: RuntimeKind::InProcess,
            methods: BTreeMap::new(),
            capabilities: Vec::new(),
            resources: Default::default(),
        }
    }

    #[test]
    fn store_and_fetch_by_id_and_version() {
        let store = ManifestStore::new();
        store.store_manifest(handler("posts-v1", "/posts", "v1", 200)).unwrap();
        store.store_manifest(handler("posts-v2", "/posts", "v2", 100)).unwrap();

        // Missing version returns the newest of the family.
        let latest = store.get_manifest("posts-v1", None).unwrap();
        assert_eq!(latest.version, "v2");
        let v1 = store.get_manifest("posts-v2", Some("v1")).unwrap();
        assert_eq!(v1.handler_id, "posts-v1");
        assert_eq!(store.list_versions("/posts").len(), 2);
    }

    #[test]
    fn unresolved_module_dependency_fails_the_write() {
        let store = ManifestStore::new();
        let mut m = handler("h", "/x", "v1", 0);
        m.modules = vec!["ghost".to_string()];
        match store.store_manifest(m.clone()) {
            Err(GatiError::UnresolvedDependency { module_id, .. }) => {
                assert_eq!(module_id, "ghost");
            }
            other => panic!("expected UnresolvedDependency, got {other:?}"),
        }
        // The failed write must not corrupt the published snapshot.
        assert_eq!(store.snapshot().handler_count(), 0);

        store.store_module(module("ghost")).unwrap();
        store.store_manifest(m).unwrap();
        assert_eq!(store.snapshot().handler_count(), 1);
    }

    #[test]
    fn duplicate_version_under_different_id_is_rejected() {
        let store = ManifestStore::new();
        store.store_manifest(handler("a", "/x", "v1", 0)).unwrap();
        assert!(store.store_manifest(handler("b", "/x", "v1", 0)).is_err());
        // Same id replaces.
        store.store_manifest(handler("a", "/x", "v1", 0)).unwrap();
    }

    #[test]
    fn tampered_hash_is_rejected() {
        let store = ManifestStore::new();
        let mut m = handler("a", "/x", "v1", 0);
        m.content_hash = "deadbeefdeadbeef".to_string();
        assert!(store.store_manifest(m).is_err());
    }

    #[test]
    fn snapshot_survives_later_writes() {
        let store = ManifestStore::new();
        store.store_manifest(handler("a", "/x", "v1", 0)).unwrap();
        let before = store.snapshot();
        store.store_manifest(handler("b", "/y", "v1", 0)).unwrap();
        assert_eq!(before.handler_count(), 1);
        assert_eq!(store.snapshot().handler_count(), 2);
    }

    #[test]
    fn version_edges_validate_endpoints_immutability_and_cycles() {
        let store = ManifestStore::new();
        store.store_manifest(handler("a", "/x", "v1", 200)).unwrap();
        store.store_manifest(handler("b", "/x", "v2", 100)).unwrap();

        assert!(store.store_version_edge("/x", "v2", "v9", "t").is_err());
        store.store_version_edge("/x", "v2", "v1", "down").unwrap();
        assert!(store.store_version_edge("/x", "v2", "v1", "again").is_err());
        assert!(store.store_version_edge("/x", "v1", "v2", "cycle").is_err());
    }

    #[test]
    fn matcher_follows_the_active_representative() {
        let store = ManifestStore::new();
        store.store_manifest(handler("old", "/posts", "v1", 200)).unwrap();
        store.store_manifest(handler("new", "/posts", "v2", 100)).unwrap();
        let snapshot = store.snapshot();
        let hit = snapshot.matcher().match_route(Method::Get, "/posts").unwrap();
        assert_eq!(hit.handler_id, "new");
    }

    #[test]
    fn store_version_resolver_resolves_through_global_seam() {
        let store = Arc::new(ManifestStore::new());
        store.store_manifest(handler("a", "/posts", "v1", 200)).unwrap();
        store.store_manifest(handler("b", "/posts", "v2", 100)).unwrap();
        let resolver = StoreVersionResolver::new(store, 10);
        assert_eq!(
            resolver.resolve("/posts", &VersionPreference::Latest).unwrap(),
            "v2"
        );
        assert_eq!(
            resolver
                .resolve("/posts", &VersionPreference::Named("v1".into()))
                .unwrap(),
            "v1"
        );
    }
}
