//! Route matcher.
//!
//! Patterns are literal segments and single-segment `:name` parameters; no
//! regex, no greedy wildcards. Method match is strict, and "no such path"
//! is distinguished from "path exists, wrong method".
//!
//! Disambiguation among matching patterns:
//! 1. exact literal patterns precede parameterized ones at the same depth,
//! 2. the longer literal prefix wins,
//! 3. ties fall to the earliest-registered pattern (stable).

use gati_core::envelope::Method;
use gati_core::error::GatiError;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Param(String),
}

#[derive(Debug, Clone)]
struct CompiledRoute {
    handler_id: String,
    method: Method,
    pattern: String,
    segments: Vec<Segment>,
    registered: usize,
}

/// A winning match: the handler id, extracted parameters, and the matched
/// pattern (for metrics).
#[derive(Debug, Clone, PartialEq)]
pub struct RouteMatch {
    pub handler_id: String,
    pub params: BTreeMap<String, String>,
    pub pattern: String,
}

/// Pattern set with first-registered-wins tie-breaking.
#[derive(Debug, Clone, Default)]
pub struct RouteMatcher {
    routes: Vec<CompiledRoute>,
}

impl RouteMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pattern. Registration order is significant for
    /// tie-breaking.
    pub fn register(&mut self, method: Method, pattern: &str, handler_id: impl Into<String>) {
        let segments = compile(pattern);
        self.routes.push(CompiledRoute {
            handler_id: handler_id.into(),
            method,
            pattern: pattern.to_string(),
            segments,
            registered: self.routes.len(),
        });
    }

    /// Match a normalized path. `NoMatch` and `MethodNotAllowed` are
    /// routing decisions, not failures.
    pub fn match_route(&self, method: Method, path: &str) -> Result<RouteMatch, GatiError> {
        let segments: Vec<&str> = split_path(path);
        let mut best: Option<(&CompiledRoute, BTreeMap<String, String>)> = None;
        let mut allowed: Vec<String> = Vec::new();

        for route in &self.routes {
            let Some(params) = bind(&route.segments, &segments) else {
                continue;
            };
            if route.method != method {
                let name = route.method.as_str().to_string();
                if !allowed.contains(&name) {
                    allowed.push(name);
                }
                continue;
            }
            let better = match &best {
                None => true,
                Some((current, _)) => prefers(route, current),
            };
            if better {
                best = Some((route, params));
            }
        }

        match best {
            Some((route, params)) => Ok(RouteMatch {
                handler_id: route.handler_id.clone(),
                params,
                pattern: route.pattern.clone(),
            }),
            None if !allowed.is_empty() => {
                allowed.sort();
                Err(GatiError::MethodNotAllowed {
                    path: path.to_string(),
                    allowed,
                })
            }
            None => Err(GatiError::NoMatch {
                path: path.to_string(),
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

fn compile(pattern: &str) -> Vec<Segment> {
    split_path(pattern)
        .into_iter()
        .map(|segment| match segment.strip_prefix(':') {
            Some(name) => Segment::Param(name.to_string()),
            None => Segment::Literal(segment.to_string()),
        })
        .collect()
}

fn split_path(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

/// Try to bind a path against a pattern; `None` when it does not match.
fn bind(pattern: &[Segment], path: &[&str]) -> Option<BTreeMap<String, String>> {
    if pattern.len() != path.len() {
        return None;
    }
    let mut params = BTreeMap::new();
    for (segment, actual) in pattern.iter().zip(path) {
        match segment {
            Segment::Literal(expected) => {
                if expected != actual {
                    return None;
                }
            }
            Segment::Param(name) => {
                params.insert(name.clone(), (*actual).to_string());
            }
        }
    }
    Some(params)
}

/// Number of leading literal segments. A fully-literal pattern's prefix
/// equals its depth, so rule 1 falls out of rule 2.
fn literal_prefix(route: &CompiledRoute) -> usize {
    route
        .segments
        .iter()
        .take_while(|s| matches!(s, Segment::Literal(_)))
        .count()
}

fn prefers(candidate: &CompiledRoute, current: &CompiledRoute) -> bool {
    let (c, b) = (literal_prefix(candidate), literal_prefix(current));
    if c != b {
        return c > b;
    }
    candidate.registered < current.registered
}
