//! Policy checks: roles and consulted rate limits.
//!
//! Rate limits are consulted, not implemented, by the route manager: the
//! [`RateLimitProbe`] seam asks an external token bucket whether the
//! request may pass. The in-memory probe exists for single-process
//! deployments and tests.

use dashmap::DashMap;
use gati_core::envelope::{AuthContext, RequestEnvelope};
use gati_core::error::{GatiError, PolicyKind};
use gati_manifest::RateLimitSpec;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// External token-bucket consultation.
pub trait RateLimitProbe: Send + Sync + 'static {
    /// `true` when the request may pass, `false` when rate-limited.
    fn try_acquire(&self, key: &str, max: u64, window_secs: u64) -> bool;
}

/// Probe that never limits; the default when no backend is wired.
pub struct AllowAllProbe;

impl RateLimitProbe for AllowAllProbe {
    fn try_acquire(&self, _key: &str, _max: u64, _window_secs: u64) -> bool {
        true
    }
}

struct Bucket {
    tokens: f64,
    max_tokens: f64,
    window: Duration,
    last_refill: Instant,
}

/// In-memory token bucket keyed by string. Each key's max/window are fixed
/// by the first call for that key.
#[derive(Clone, Default)]
pub struct InMemoryTokenBucket {
    buckets: Arc<DashMap<String, Bucket>>,
}

impl InMemoryTokenBucket {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RateLimitProbe for InMemoryTokenBucket {
    fn try_acquire(&self, key: &str, max: u64, window_secs: u64) -> bool {
        let max_tokens = max as f64;
        let window = Duration::from_secs(window_secs);
        let mut entry = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| Bucket {
                tokens: max_tokens,
                max_tokens,
                window,
                last_refill: Instant::now(),
            });
        let bucket = entry.value_mut();

        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill);
        let refill = (elapsed.as_secs_f64() / bucket.window.as_secs_f64()) * bucket.max_tokens;
        bucket.tokens = (bucket.tokens + refill).min(bucket.max_tokens);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Check manifest roles against the auth context. An empty role list means
/// no restriction; otherwise the context must hold at least one.
pub fn check_roles(required: &[String], auth: &AuthContext) -> Result<(), GatiError> {
    if required.is_empty() {
        return Ok(());
    }
    if required.iter().any(|role| auth.has_role(role)) {
        return Ok(());
    }
    Err(GatiError::PolicyDenied {
        kind: PolicyKind::Role,
        detail: format!("requires one of: {}", required.join(", ")),
    })
}

/// Consult the rate limiter for a manifest's limit spec. The bucket key is
/// the route pattern plus the spec's discriminator (`global`, `ip`, or
/// `principal`).
pub fn check_rate_limit(
    probe: &dyn RateLimitProbe,
    spec: &RateLimitSpec,
    pattern: &str,
    envelope: &RequestEnvelope,
) -> Result<(), GatiError> {
    let discriminator = match spec.key.as_str() {
        "ip" => envelope.client_ip.clone().unwrap_or_else(|| "unknown".to_string()),
        "principal" => envelope
            .auth
            .principal
            .clone()
            .unwrap_or_else(|| "anonymous".to_string()),
        _ => "global".to_string(),
    };
    let key = format!("{pattern}:{discriminator}");
    if probe.try_acquire(&key, spec.max, spec.window_secs) {
        Ok(())
    } else {
        Err(GatiError::PolicyDenied {
            kind: PolicyKind::RateLimit,
            detail: format!("rate limit exceeded for {key}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gati_core::envelope::Method;

    fn auth(roles: &[&str]) -> AuthContext {
        AuthContext {
            method: "bearer".to_string(),
            principal: Some("alice".to_string()),
            roles: roles.iter().map(|r| r.to_string()).collect(),
            claims: serde_json::Value::Null,
        }
    }

    #[test]
    fn empty_role_list_is_unrestricted() {
        assert!(check_roles(&[], &AuthContext::anonymous()).is_ok());
    }

    #[test]
    fn any_required_role_suffices() {
        let required = vec!["admin".to_string(), "editor".to_string()];
        assert!(check_roles(&required, &auth(&["editor"])).is_ok());
        let err = check_roles(&required, &auth(&["viewer"])).unwrap_err();
        assert_eq!(err.code(), "policy.denied.role");
    }

    #[test]
    fn token_bucket_exhausts_and_refills() {
        let probe = InMemoryTokenBucket::new();
        assert!(probe.try_acquire("k", 2, 60));
        assert!(probe.try_acquire("k", 2, 60));
        assert!(!probe.try_acquire("k", 2, 60));
        // A different key has its own bucket.
        assert!(probe.try_acquire("other", 2, 60));
    }

    #[test]
    fn rate_limit_key_uses_the_principal() {
        let probe = InMemoryTokenBucket::new();
        let spec = RateLimitSpec {
            key: "principal".to_string(),
            max: 1,
            window_secs: 60,
        };
        let envelope = RequestEnvelope::builder(Method::Get, "/posts")
            .auth(auth(&[]))
            .build();
        assert!(check_rate_limit(&probe, &spec, "/posts", &envelope).is_ok());
        let err = check_rate_limit(&probe, &spec, "/posts", &envelope).unwrap_err();
        assert_eq!(err.code(), "policy.denied.rate");
        assert_eq!(err.status(), 429);
    }
}
