//! Version graphs and preference resolution.
//!
//! Per route path, versions form an ordered sequence (by creation time)
//! with transformer edges between nodes. Resolution picks the manifest to
//! serve and, when the requested version is not the active one, the
//! transformer chain that bridges the gap. Chains longer than the
//! configured maximum fail with `VersionUnresolved`.

use crate::manifest::HandlerManifest;
use gati_core::envelope::VersionPreference;
use gati_core::error::GatiError;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// A transformer published between two versions of one path. Directed;
/// bundles typically publish both directions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionEdge {
    pub from: String,
    pub to: String,
    /// Opaque reference to the transformer artifact. Immutable once
    /// published.
    pub transformer: String,
}

/// A resolved version decision.
#[derive(Debug, Clone)]
pub struct Resolution {
    /// The manifest that will serve the request.
    pub manifest: Arc<HandlerManifest>,
    /// Transformer refs bridging from the serving version to the requested
    /// one; empty for a direct hit.
    pub chain: Vec<String>,
}

/// Whether adding `from -> to` would close a cycle (a path `to -> from`
/// already exists).
pub fn would_cycle(edges: &[VersionEdge], from: &str, to: &str) -> bool {
    if from == to {
        return true;
    }
    shortest_chain(edges, to, from, usize::MAX).is_some()
}

/// Breadth-first shortest transformer chain from `from` to `to`, bounded
/// by `max_len` hops. Returns the transformer refs along the path.
pub fn shortest_chain(
    edges: &[VersionEdge],
    from: &str,
    to: &str,
    max_len: usize,
) -> Option<Vec<String>> {
    if from == to {
        return Some(Vec::new());
    }
    let mut adjacency: HashMap<&str, Vec<&VersionEdge>> = HashMap::new();
    for edge in edges {
        adjacency.entry(edge.from.as_str()).or_default().push(edge);
    }
    let mut queue: VecDeque<(&str, Vec<String>)> = VecDeque::new();
    let mut visited: Vec<&str> = vec![from];
    queue.push_back((from, Vec::new()));
    while let Some((node, chain)) = queue.pop_front() {
        if chain.len() >= max_len {
            continue;
        }
        for edge in adjacency.get(node).into_iter().flatten() {
            if visited.contains(&edge.to.as_str()) {
                continue;
            }
            let mut next = chain.clone();
            next.push(edge.transformer.clone());
            if edge.to == to {
                return Some(next);
            }
            visited.push(edge.to.as_str());
            queue.push_back((edge.to.as_str(), next));
        }
    }
    None
}

/// Resolve a version preference over the versions registered at one path.
///
/// - `Latest` serves the newest active version.
/// - A named preference (version id or tag) serves that version directly
///   when it is active; an inactive target is served by the newest active
///   version plus the transformer chain reaching the target.
/// - A timestamp serves the newest version created at or before it, with
///   the same active/chain rule.
pub fn resolve(
    path: &str,
    versions: &[Arc<HandlerManifest>],
    edges: &[VersionEdge],
    preference: &VersionPreference,
    chain_max: usize,
) -> Result<Resolution, GatiError> {
    let latest_active = versions
        .iter()
        .filter(|m| m.active)
        .max_by_key(|m| m.created_at);

    let unresolved = |reason: &str| GatiError::VersionUnresolved {
        path: path.to_string(),
        reason: reason.to_string(),
    };

    let target = match preference {
        VersionPreference::Latest => {
            let manifest = latest_active.ok_or_else(|| unresolved("no active version"))?;
            return Ok(Resolution {
                manifest: manifest.clone(),
                chain: Vec::new(),
            });
        }
        VersionPreference::Named(name) => versions
            .iter()
            .find(|m| m.answers_to(name))
            .ok_or_else(|| unresolved(&format!("unknown version '{name}'")))?,
        VersionPreference::Timestamp(ts) => versions
            .iter()
            .filter(|m| m.created_at <= *ts)
            .max_by_key(|m| m.created_at)
            .ok_or_else(|| unresolved("no version at or before the requested time"))?,
    };

    if target.active {
        return Ok(Resolution {
            manifest: target.clone(),
            chain: Vec::new(),
        });
    }

    let serving = latest_active.ok_or_else(|| unresolved("no active version"))?;
    match shortest_chain(edges, &serving.version, &target.version, chain_max) {
        Some(chain) => Ok(Resolution {
            manifest: serving.clone(),
            chain,
        }),
        None => Err(unresolved(&format!(
            "no transformer chain of length <= {chain_max} from '{}' to '{}'",
            serving.version, target.version
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{HookBindings, PolicyBlock};
    use chrono::{Duration, Utc};
    use gati_core::envelope::Method;

    fn manifest(version: &str, active: bool, age_secs: i64) -> Arc<HandlerManifest> {
        Arc::new(HandlerManifest {
            handler_id: format!("posts-{version}"),
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
            active,
            content_hash: String::new(),
            created_at: Utc::now() - Duration::seconds(age_secs),
        })
    }

    fn edge(from: &str, to: &str) -> VersionEdge {
        VersionEdge {
            from: from.to_string(),
            to: to.to_string(),
            transformer: format!("{from}->{to}"),
        }
    }

    #[test]
    fn latest_picks_newest_active() {
        let versions = vec![manifest("v1", true, 300), manifest("v2", true, 200), manifest("v3", false, 100)];
        let r = resolve("/posts", &versions, &[], &VersionPreference::Latest, 10).unwrap();
        assert_eq!(r.manifest.version, "v2");
        assert!(r.chain.is_empty());
    }

    #[test]
    fn named_active_version_is_direct() {
        let versions = vec![manifest("v1", true, 300), manifest("v2", true, 200)];
        let r = resolve(
            "/posts",
            &versions,
            &[],
            &VersionPreference::Named("v1".into()),
            10,
        )
        .unwrap();
        assert_eq!(r.manifest.version, "v1");
        assert!(r.chain.is_empty());
    }

    #[test]
    fn inactive_target_resolves_through_chain() {
        let versions = vec![manifest("v1", false, 300), manifest("v2", true, 200)];
        let edges = vec![edge("v2", "v1")];
        let r = resolve(
            "/posts",
            &versions,
            &edges,
            &VersionPreference::Named("v1".into()),
            10,
        )
        .unwrap();
        assert_eq!(r.manifest.version, "v2");
        assert_eq!(r.chain, vec!["v2->v1".to_string()]);
    }

    #[test]
    fn chain_longer_than_max_is_unresolved() {
        let versions = vec![
            manifest("v1", false, 400),
            manifest("v2", false, 300),
            manifest("v3", true, 200),
        ];
        let edges = vec![edge("v3", "v2"), edge("v2", "v1")];
        let ok = resolve(
            "/posts",
            &versions,
            &edges,
            &VersionPreference::Named("v1".into()),
            2,
        )
        .unwrap();
        assert_eq!(ok.chain.len(), 2);
        let err = resolve(
            "/posts",
            &versions,
            &edges,
            &VersionPreference::Named("v1".into()),
            1,
        );
        assert!(matches!(err, Err(GatiError::VersionUnresolved { .. })));
    }

    #[test]
    fn unknown_version_is_unresolved() {
        let versions = vec![manifest("v1", true, 100)];
        let err = resolve(
            "/posts",
            &versions,
            &[],
            &VersionPreference::Named("v9".into()),
            10,
        );
        assert!(matches!(err, Err(GatiError::VersionUnresolved { .. })));
    }

    #[test]
    fn timestamp_picks_newest_at_or_before() {
        let old = manifest("v1", true, 300);
        let newer = manifest("v2", true, 100);
        let cutoff = Utc::now() - Duration::seconds(200);
        let r = resolve(
            "/posts",
            &[old, newer],
            &[],
            &VersionPreference::Timestamp(cutoff),
            10,
        )
        .unwrap();
        assert_eq!(r.manifest.version, "v1");
    }

    #[test]
    fn cycle_detection() {
        let edges = vec![edge("v1", "v2"), edge("v2", "v3")];
        assert!(would_cycle(&edges, "v3", "v1"));
        assert!(!would_cycle(&edges, "v1", "v3"));
        assert!(would_cycle(&edges, "v1", "v1"));
    }

    #[test]
    fn shortest_chain_prefers_fewest_hops() {
        let edges = vec![
            edge("a", "b"),
            edge("b", "c"),
            VersionEdge {
                from: "a".to_string(),
                to: "c".to_string(),
                transformer: "direct".to_string(),
            },
        ];
        let chain = shortest_chain(&edges, "a", "c", 10).unwrap();
        assert_eq!(chain, vec!["direct".to_string()]);
    }
}
