//! Handler and module manifests.
//!
//! Manifests are produced by external tooling and ingested at startup (or
//! hot-reloaded). They carry a content hash; the store rejects artifacts
//! whose declared hash does not match their content.

use chrono::{DateTime, Utc};
use gati_core::envelope::Method;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Hook ids per phase, in execution order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HookBindings {
    #[serde(default)]
    pub before: Vec<String>,
    #[serde(default)]
    pub after: Vec<String>,
    #[serde(default)]
    pub catch: Vec<String>,
}

/// Rate limit consulted (not implemented) by the route manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitSpec {
    /// Bucket key template: `global`, `ip`, or `principal`.
    pub key: String,
    pub max: u64,
    pub window_secs: u64,
}

/// Manifest-declared policies checked before forwarding.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyBlock {
    /// Roles of which the auth context must hold at least one. Empty means
    /// no role restriction.
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub rate_limit: Option<RateLimitSpec>,
}

/// One versioned handler registration.
///
/// `handler_id` is unique; `(method, path, version)` is unique. Multiple
/// manifests may share `(method, path)` and differ only by version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerManifest {
    pub handler_id: String,
    /// Route pattern: literal segments and `:name` parameters.
    pub path: String,
    pub method: Method,
    #[serde(default)]
    pub request_schema: Option<String>,
    #[serde(default)]
    pub response_schema: Option<String>,
    #[serde(default)]
    pub hooks: HookBindings,
    /// Version identifier, unique within `(method, path)`.
    pub version: String,
    /// Semantic tags resolvable as version preferences (e.g. `stable`).
    #[serde(default)]
    pub tags: Vec<String>,
    /// Module ids this handler requires; must resolve in the store.
    #[serde(default)]
    pub modules: Vec<String>,
    #[serde(default)]
    pub policy: PolicyBlock,
    /// Traffic weight. Only versions carrying an explicit weight take part
    /// in traffic splitting; without one the newest active version serves.
    #[serde(default)]
    pub weight: Option<u32>,
    #[serde(default = "default_true")]
    pub active: bool,
    /// FNV-1a 64 of the manifest content with this field cleared.
    #[serde(default)]
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
}

fn default_true() -> bool {
    true
}

impl HandlerManifest {
    /// A minimal manifest with defaults for everything optional.
    pub fn new(
        handler_id: impl Into<String>,
        method: Method,
        path: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        HandlerManifest {
            handler_id: handler_id.into(),
            path: path.into(),
            method,
            request_schema: None,
            response_schema: None,
            hooks: HookBindings::default(),
            version: version.into(),
            tags: Vec::new(),
            modules: Vec::new(),
            policy: PolicyBlock::default(),
            weight: None,
            active: true,
            content_hash: String::new(),
            created_at: Utc::now(),
        }
    }

    /// Compute the canonical content hash: FNV-1a 64 of the manifest's
    /// JSON serialization with `content_hash` cleared.
    pub fn compute_hash(&self) -> String {
        let mut canonical = self.clone();
        canonical.content_hash = String::new();
        let json = serde_json::to_string(&canonical).expect("manifest serializes");
        format!("{:016x}", fnv1a64(json.as_bytes()))
    }

    /// Fill in the content hash when absent; verify it when present.
    pub fn sealed(mut self) -> Result<Self, String> {
        let computed = self.compute_hash();
        if self.content_hash.is_empty() {
            self.content_hash = computed;
            return Ok(self);
        }
        if self.content_hash != computed {
            return Err(format!(
                "content hash mismatch for handler '{}': declared {}, computed {computed}",
                self.handler_id, self.content_hash
            ));
        }
        Ok(self)
    }

    /// Whether this version name or one of its tags matches `name`.
    pub fn answers_to(&self, name: &str) -> bool {
        self.version == name || self.tags.iter().any(|t| t == name)
    }
}

/// Where a module's code runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeKind {
    InProcess,
    SandboxedProcess,
    RemoteService,
}

/// Input/output schema references of one exported method.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MethodSignature {
    #[serde(default)]
    pub input: Option<String>,
    #[serde(default)]
    pub output: Option<String>,
}

/// Best-effort scheduling hints; the core records them, it does not
/// enforce them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceHints {
    #[serde(default)]
    pub cpu_millis: Option<u64>,
    #[serde(default)]
    pub memory_mb: Option<u64>,
}

/// One registered module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleManifest {
    pub module_id: String,
    pub version: String,
    pub runtime: RuntimeKind,
    /// Exported method table: method name to schema refs.
    #[serde(default)]
    pub methods: BTreeMap<String, MethodSignature>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub resources: ResourceHints,
}

impl ModuleManifest {
    pub fn exports(&self, method: &str) -> bool {
        self.methods.contains_key(method)
    }
}

/// FNV-1a, 64-bit. Also the hash family behind deterministic traffic
/// selection; the constants are the standard offset basis and prime.
pub fn fnv1a64(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = OFFSET;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn manifest(id: &str, version: &str) -> HandlerManifest {
        HandlerManifest {
            handler_id: id.to_string(),
            path: "/posts".to_string(),
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
            created_at: Utc::now(),
        }
    }

    #[test]
    fn hash_is_stable_and_ignores_existing_hash_field() {
        let m = manifest("h1", "v1");
        let sealed = m.clone().sealed().unwrap();
        assert!(!sealed.content_hash.is_empty());
        // Hashing again over the sealed manifest reproduces the same value.
        assert_eq!(sealed.compute_hash(), sealed.content_hash);
    }

    #[test]
    fn sealed_rejects_tampered_content() {
        let sealed = manifest("h1", "v1").sealed().unwrap();
        let mut tampered = sealed.clone();
        tampered.path = "/other".to_string();
        assert!(tampered.sealed().is_err());
    }

    #[test]
    fn answers_to_matches_version_and_tags() {
        let mut m = manifest("h1", "v2");
        m.tags = vec!["stable".to_string()];
        assert!(m.answers_to("v2"));
        assert!(m.answers_to("stable"));
        assert!(!m.answers_to("v1"));
    }

    #[test]
    fn fnv_vectors() {
        // Standard FNV-1a test vectors.
        assert_eq!(fnv1a64(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a64(b"a"), 0xaf63_dc4c_8601_ec8c);
    }

    #[test]
    fn manifest_round_trips_with_defaults() {
        let json = serde_json::json!({
            "handler_id": "h",
            "path": "/x",
            "method": "GET",
            "version": "v1",
            "created_at": "2024-01-01T00:00:00Z",
        });
        let m: HandlerManifest = serde_json::from_value(json).unwrap();
        assert_eq!(m.weight, None);
        assert!(m.active);
        assert!(m.hooks.before.is_empty());
    }
}
