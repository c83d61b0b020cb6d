//! Deterministic traffic splitting and canary health.
//!
//! When several active versions share a path, one is picked by a weighted
//! hash of the request id, so retries and replays of the same request
//! route identically. The hash family is FNV-1a 64 over the raw id bytes.
//! A canary whose windowed success ratio drops below the configured
//! threshold is excluded from selection.

use dashmap::DashMap;
use gati_manifest::{fnv1a64, HandlerManifest};
use std::collections::VecDeque;
use std::sync::Arc;

/// Outcomes kept per (path, version) window.
const HEALTH_WINDOW: usize = 50;
/// Below this many observations a canary is considered healthy.
const HEALTH_MIN_SAMPLES: usize = 10;

/// Pick among active versions by weighted deterministic hash of the
/// request id. `candidates` must be in a stable order (the store keeps
/// them sorted by creation time).
pub fn pick_weighted<'a>(
    candidates: &[&'a Arc<HandlerManifest>],
    request_id: &str,
) -> Option<&'a Arc<HandlerManifest>> {
    if candidates.is_empty() {
        return None;
    }
    if candidates.len() == 1 {
        return Some(candidates[0]);
    }
    let total: u64 = candidates.iter().map(|m| effective_weight(m)).sum();
    let point = fnv1a64(request_id.as_bytes()) % total;
    let mut cumulative = 0u64;
    for manifest in candidates {
        cumulative += effective_weight(manifest);
        if point < cumulative {
            return Some(manifest);
        }
    }
    candidates.last().copied()
}

fn effective_weight(manifest: &HandlerManifest) -> u64 {
    u64::from(manifest.weight.unwrap_or(100).max(1))
}

struct Window {
    outcomes: VecDeque<bool>,
}

/// Sliding success window per (path, version), fed by the execution plane.
#[derive(Default)]
pub struct CanaryHealth {
    windows: DashMap<String, Window>,
}

impl CanaryHealth {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(path: &str, version: &str) -> String {
        format!("{path}|{version}")
    }

    /// Record the outcome of one request served by `version` at `path`.
    pub fn record(&self, path: &str, version: &str, success: bool) {
        let mut window = self
            .windows
            .entry(Self::key(path, version))
            .or_insert_with(|| Window {
                outcomes: VecDeque::new(),
            });
        window.outcomes.push_back(success);
        if window.outcomes.len() > HEALTH_WINDOW {
            window.outcomes.pop_front();
        }
    }

    /// Success ratio over the window; `None` below the sample minimum.
    pub fn success_ratio(&self, path: &str, version: &str) -> Option<f64> {
        let window = self.windows.get(&Self::key(path, version))?;
        if window.outcomes.len() < HEALTH_MIN_SAMPLES {
            return None;
        }
        let ok = window.outcomes.iter().filter(|&&b| b).count();
        Some(ok as f64 / window.outcomes.len() as f64)
    }

    /// Whether the version may receive split traffic.
    pub fn eligible(&self, path: &str, version: &str, threshold: f64) -> bool {
        match self.success_ratio(path, version) {
            Some(ratio) => ratio >= threshold,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use gati_core::envelope::Method;
    use gati_manifest::{HookBindings, PolicyBlock};

    fn manifest(version: &str, weight: Option<u32>) -> Arc<HandlerManifest> {
        Arc::new(HandlerManifest {
            handler_id: format!("h-{version}"),
            path: "/posts".to_string(),
            method: Method::Get,
            request_schema: None,
            response_schema: None,
            hooks: HookBindings::default(),
            version: version.to_string(),
            tags: Vec::new(),
            modules: Vec::new(),
            policy: PolicyBlock::default(),
            weight,
            active: true,
            content_hash: String::new(),
            created_at: Utc::now(),
        })
    }

    #[test]
    fn same_request_id_always_picks_the_same_version() {
        let a = manifest("v1", Some(50));
        let b = manifest("v2", Some(50));
        let candidates = vec![&a, &b];
        let first = pick_weighted(&candidates, "req-abc").unwrap();
        for _ in 0..100 {
            assert_eq!(pick_weighted(&candidates, "req-abc").unwrap().version, first.version);
        }
    }

    #[test]
    fn split_is_roughly_proportional() {
        let a = manifest("v1", Some(90));
        let b = manifest("v2", Some(10));
        let candidates = vec![&a, &b];
        let mut v1 = 0;
        for i in 0..1000 {
            let picked = pick_weighted(&candidates, &format!("request-{i}")).unwrap();
            if picked.version == "v1" {
                v1 += 1;
            }
        }
        // 90/10 weights: accept a generous band around the expectation.
        assert!((800..=980).contains(&v1), "v1 won {v1}/1000");
    }

    #[test]
    fn zero_weight_still_terminates() {
        let a = manifest("v1", Some(0));
        let candidates = vec![&a];
        assert_eq!(pick_weighted(&candidates, "x").unwrap().version, "v1");
    }

    #[test]
    fn canary_health_requires_minimum_samples() {
        let health = CanaryHealth::new();
        for _ in 0..5 {
            health.record("/posts", "v2", false);
        }
        // Below the sample floor it stays eligible.
        assert!(health.eligible("/posts", "v2", 0.5));
        for _ in 0..10 {
            health.record("/posts", "v2", false);
        }
        assert!(!health.eligible("/posts", "v2", 0.5));
    }

    #[test]
    fn window_slides_and_recovers() {
        let health = CanaryHealth::new();
        for _ in 0..HEALTH_WINDOW {
            health.record("/posts", "v2", false);
        }
        assert!(!health.eligible("/posts", "v2", 0.5));
        for _ in 0..HEALTH_WINDOW {
            health.record("/posts", "v2", true);
        }
        assert!(health.eligible("/posts", "v2", 0.5));
        assert_eq!(health.success_ratio("/posts", "v2"), Some(1.0));
    }
}
