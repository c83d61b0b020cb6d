//! Runtime error taxonomy.
//!
//! Every error the runtime can surface to a client maps to a stable,
//! machine-readable dot-notation code (e.g. `handler.timeout`,
//! `rpc.transport.exhausted`) and an HTTP status. Errors raised below the
//! hook boundary (admission, routing) are surfaced directly; errors raised
//! inside the before/handler/after phases enter the catch-hook chain first.

use crate::envelope::ResponseEnvelope;

/// Rejections decided at ingress, before a request enters the fabric.
#[derive(Debug, Clone)]
pub enum AdmissionError {
    /// Authentication failed for the configured method.
    Unauthorized(String),
    /// Request body exceeded the configured maximum.
    BodyTooLarge { limit: usize, actual: usize },
    /// Header count exceeded the configured maximum.
    TooManyHeaders { limit: usize },
    /// The request was syntactically invalid (bad id, bad priority, bad body).
    Malformed(String),
}

impl AdmissionError {
    pub fn code(&self) -> &'static str {
        match self {
            AdmissionError::Unauthorized(_) => "admission.unauthorized",
            AdmissionError::BodyTooLarge { .. } => "admission.body_too_large",
            AdmissionError::TooManyHeaders { .. } => "admission.too_many_headers",
            AdmissionError::Malformed(_) => "admission.malformed",
        }
    }

    pub fn status(&self) -> u16 {
        match self {
            AdmissionError::Unauthorized(_) => 401,
            AdmissionError::BodyTooLarge { .. } => 413,
            AdmissionError::TooManyHeaders { .. } => 431,
            AdmissionError::Malformed(_) => 400,
        }
    }
}

impl std::fmt::Display for AdmissionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdmissionError::Unauthorized(msg) => write!(f, "unauthorized: {msg}"),
            AdmissionError::BodyTooLarge { limit, actual } => {
                write!(f, "body of {actual} bytes exceeds limit of {limit}")
            }
            AdmissionError::TooManyHeaders { limit } => {
                write!(f, "header count exceeds limit of {limit}")
            }
            AdmissionError::Malformed(msg) => write!(f, "malformed request: {msg}"),
        }
    }
}

/// Which policy check denied the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyKind {
    /// The auth context lacks a required role.
    Role,
    /// The consulted rate limiter refused a token.
    RateLimit,
}

/// Module RPC failure category.
///
/// Retryability is a property of the category: transport errors retry with
/// exponential backoff, serialization and protocol errors never do, and
/// timeouts retry only when the caller opted in.
#[derive(Debug, Clone)]
pub enum RpcError {
    /// Connection/read/write failure. `exhausted` is set by the client once
    /// the retry budget is spent, which changes the surfaced code.
    Transport {
        module: String,
        method: String,
        cause: String,
        exhausted: bool,
    },
    /// The per-call deadline elapsed before a response arrived.
    Timeout {
        module: String,
        method: String,
        deadline_ms: u64,
    },
    /// Argument or result encode/decode failed. Never retried.
    Serialization {
        module: String,
        method: String,
        cause: String,
    },
    /// The peer broke the framing or reply contract. Never retried.
    Protocol {
        module: String,
        method: String,
        cause: String,
    },
    /// No pooled connection became available within the connection deadline.
    ConnectionTimeout { module: String, waited_ms: u64 },
}

impl RpcError {
    pub fn code(&self) -> &'static str {
        match self {
            RpcError::Transport { exhausted: true, .. } => "rpc.transport.exhausted",
            RpcError::Transport { .. } => "rpc.transport",
            RpcError::Timeout { .. } => "rpc.timeout",
            RpcError::Serialization { .. } => "rpc.serialization",
            RpcError::Protocol { .. } => "rpc.protocol",
            RpcError::ConnectionTimeout { .. } => "rpc.connection_timeout",
        }
    }

    pub fn status(&self) -> u16 {
        match self {
            RpcError::Transport { .. } => 502,
            RpcError::Timeout { .. } => 502,
            RpcError::Serialization { .. } => 500,
            RpcError::Protocol { .. } => 500,
            RpcError::ConnectionTimeout { .. } => 502,
        }
    }

    /// Whether the retry loop may attempt this call again.
    ///
    /// `retry_on_timeout` reflects the caller's configuration for the
    /// timeout category.
    pub fn retryable(&self, retry_on_timeout: bool) -> bool {
        match self {
            RpcError::Transport { exhausted, .. } => !exhausted,
            RpcError::Timeout { .. } => retry_on_timeout,
            RpcError::Serialization { .. } => false,
            RpcError::Protocol { .. } => false,
            RpcError::ConnectionTimeout { .. } => false,
        }
    }

    pub fn module(&self) -> &str {
        match self {
            RpcError::Transport { module, .. }
            | RpcError::Timeout { module, .. }
            | RpcError::Serialization { module, .. }
            | RpcError::Protocol { module, .. }
            | RpcError::ConnectionTimeout { module, .. } => module,
        }
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RpcError::Transport {
                module,
                method,
                cause,
                exhausted,
            } => {
                if *exhausted {
                    write!(f, "rpc {module}.{method}: transport retries exhausted: {cause}")
                } else {
                    write!(f, "rpc {module}.{method}: transport error: {cause}")
                }
            }
            RpcError::Timeout {
                module,
                method,
                deadline_ms,
            } => write!(f, "rpc {module}.{method}: deadline of {deadline_ms}ms exceeded"),
            RpcError::Serialization {
                module,
                method,
                cause,
            } => write!(f, "rpc {module}.{method}: serialization failed: {cause}"),
            RpcError::Protocol {
                module,
                method,
                cause,
            } => write!(f, "rpc {module}.{method}: protocol violation: {cause}"),
            RpcError::ConnectionTimeout { module, waited_ms } => {
                write!(f, "rpc {module}: connection timeout after {waited_ms}ms")
            }
        }
    }
}

impl std::error::Error for RpcError {}

/// Phase in which a hook deadline was exceeded or a hook raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPhase {
    Before,
    After,
    Catch,
}

impl std::fmt::Display for HookPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HookPhase::Before => "before",
            HookPhase::After => "after",
            HookPhase::Catch => "catch",
        };
        f.write_str(s)
    }
}

/// The runtime error taxonomy.
///
/// Variants correspond one-to-one with the surfaced error kinds; each knows
/// its dot-notation code and HTTP mapping.
#[derive(Debug, Clone)]
pub enum GatiError {
    Admission(AdmissionError),
    /// No registered pattern matched the path.
    NoMatch { path: String },
    /// The path matched, but not with this method.
    MethodNotAllowed { path: String, allowed: Vec<String> },
    /// The version preference is absent from the graph and no transformer
    /// chain within the configured maximum reaches it.
    VersionUnresolved { path: String, reason: String },
    PolicyDenied { kind: PolicyKind, detail: String },
    /// The topic queue is at its depth limit.
    Backpressure { topic: String, depth: usize },
    /// The message deadline passed while still queued.
    Expired { topic: String },
    HandlerTimeout { handler_id: String, deadline_ms: u64 },
    /// The whole request deadline elapsed at ingress before a result
    /// envelope arrived; the result registration is dropped so a late
    /// response is discarded.
    RequestTimeout { deadline_ms: u64 },
    HookTimeout { hook_id: String, phase: HookPhase },
    /// Raised by user handler or hook code.
    Handler { detail: String },
    Rpc(RpcError),
    /// A handler's declared module dependency does not resolve. Fatal at
    /// startup / manifest load.
    UnresolvedDependency { handler_id: String, module_id: String },
    /// Finalize exceeded its settle deadline. Logged, never surfaced.
    CleanupTimeout { request_id: String },
    /// The route manager declined to forward (e.g. no healthy module).
    Unavailable { reason: String },
    Internal(String),
}

impl GatiError {
    /// Stable machine-readable code, dot notation.
    pub fn code(&self) -> &'static str {
        match self {
            GatiError::Admission(e) => e.code(),
            GatiError::NoMatch { .. } => "route.no_match",
            GatiError::MethodNotAllowed { .. } => "route.method_not_allowed",
            GatiError::VersionUnresolved { .. } => "route.version_unresolved",
            GatiError::PolicyDenied { kind: PolicyKind::Role, .. } => "policy.denied.role",
            GatiError::PolicyDenied { kind: PolicyKind::RateLimit, .. } => "policy.denied.rate",
            GatiError::Backpressure { .. } => "queue.backpressure",
            GatiError::Expired { .. } => "queue.expired",
            GatiError::HandlerTimeout { .. } => "handler.timeout",
            GatiError::RequestTimeout { .. } => "request.timeout",
            GatiError::HookTimeout { .. } => "hook.timeout",
            GatiError::Handler { .. } => "handler.error",
            GatiError::Rpc(e) => e.code(),
            GatiError::UnresolvedDependency { .. } => "manifest.unresolved_dependency",
            GatiError::CleanupTimeout { .. } => "cleanup.timeout",
            GatiError::Unavailable { .. } => "route.unavailable",
            GatiError::Internal(_) => "internal",
        }
    }

    /// HTTP status this error surfaces as.
    pub fn status(&self) -> u16 {
        match self {
            GatiError::Admission(e) => e.status(),
            GatiError::NoMatch { .. } => 404,
            GatiError::MethodNotAllowed { .. } => 405,
            GatiError::VersionUnresolved { .. } => 503,
            GatiError::PolicyDenied { kind: PolicyKind::Role, .. } => 403,
            GatiError::PolicyDenied { kind: PolicyKind::RateLimit, .. } => 429,
            GatiError::Backpressure { .. } => 503,
            GatiError::Expired { .. } => 504,
            GatiError::HandlerTimeout { .. } => 504,
            GatiError::RequestTimeout { .. } => 504,
            GatiError::HookTimeout { .. } => 500,
            GatiError::Handler { .. } => 500,
            GatiError::Rpc(e) => e.status(),
            GatiError::UnresolvedDependency { .. } => 500,
            GatiError::CleanupTimeout { .. } => 500,
            GatiError::Unavailable { .. } => 503,
            GatiError::Internal(_) => 500,
        }
    }

    /// Whether this error is fatal to the process (startup integrity).
    pub fn is_fatal(&self) -> bool {
        matches!(self, GatiError::UnresolvedDependency { .. })
    }

    /// Map this error to a terminal response envelope for the given request.
    ///
    /// The body carries the code and message; the envelope echoes the
    /// request id. `MethodNotAllowed` additionally sets the `Allow` header,
    /// and `Backpressure` sets a retry hint.
    pub fn to_envelope(&self, request_id: &str) -> ResponseEnvelope {
        let body = serde_json::json!({
            "error": self.to_string(),
            "code": self.code(),
            "request_id": request_id,
        });
        let mut envelope = ResponseEnvelope::new(request_id, self.status()).with_body(body);
        match self {
            GatiError::MethodNotAllowed { allowed, .. } => {
                envelope.headers.insert("Allow", allowed.join(", "));
            }
            GatiError::Backpressure { .. } => {
                envelope.headers.insert("Retry-After", "1");
            }
            _ => {}
        }
        envelope
    }
}

impl std::fmt::Display for GatiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GatiError::Admission(e) => write!(f, "{e}"),
            GatiError::NoMatch { path } => write!(f, "no handler matches path '{path}'"),
            GatiError::MethodNotAllowed { path, allowed } => {
                write!(f, "method not allowed for '{path}' (allowed: {})", allowed.join(", "))
            }
            GatiError::VersionUnresolved { path, reason } => {
                write!(f, "version unresolved for '{path}': {reason}")
            }
            GatiError::PolicyDenied { detail, .. } => write!(f, "policy denied: {detail}"),
            GatiError::Backpressure { topic, depth } => {
                write!(f, "topic '{topic}' saturated at depth {depth}")
            }
            GatiError::Expired { topic } => {
                write!(f, "message expired while queued on '{topic}'")
            }
            GatiError::HandlerTimeout { handler_id, deadline_ms } => {
                write!(f, "handler '{handler_id}' exceeded deadline of {deadline_ms}ms")
            }
            GatiError::RequestTimeout { deadline_ms } => {
                write!(f, "request exceeded total deadline of {deadline_ms}ms")
            }
            GatiError::HookTimeout { hook_id, phase } => {
                write!(f, "hook '{hook_id}' timed out in {phase} phase")
            }
            GatiError::Handler { detail } => write!(f, "handler error: {detail}"),
            GatiError::Rpc(e) => write!(f, "{e}"),
            GatiError::UnresolvedDependency { handler_id, module_id } => {
                write!(f, "handler '{handler_id}' depends on unknown module '{module_id}'")
            }
            GatiError::CleanupTimeout { request_id } => {
                write!(f, "cleanup timed out for request '{request_id}'")
            }
            GatiError::Unavailable { reason } => write!(f, "unavailable: {reason}"),
            GatiError::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for GatiError {}

impl From<RpcError> for GatiError {
    fn from(err: RpcError) -> Self {
        GatiError::Rpc(err)
    }
}

impl From<AdmissionError> for GatiError {
    fn from(err: AdmissionError) -> Self {
        GatiError::Admission(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_dot_notation() {
        let errs: Vec<GatiError> = vec![
            GatiError::NoMatch { path: "/x".into() },
            GatiError::HandlerTimeout { handler_id: "h".into(), deadline_ms: 1 },
            GatiError::Rpc(RpcError::Transport {
                module: "m".into(),
                method: "f".into(),
                cause: "reset".into(),
                exhausted: true,
            }),
        ];
        assert_eq!(errs[0].code(), "route.no_match");
        assert_eq!(errs[1].code(), "handler.timeout");
        assert_eq!(errs[2].code(), "rpc.transport.exhausted");
    }

    #[test]
    fn status_mapping_follows_taxonomy() {
        assert_eq!(GatiError::NoMatch { path: "/".into() }.status(), 404);
        assert_eq!(
            GatiError::MethodNotAllowed { path: "/".into(), allowed: vec!["POST".into()] }.status(),
            405
        );
        assert_eq!(
            GatiError::PolicyDenied { kind: PolicyKind::RateLimit, detail: String::new() }.status(),
            429
        );
        assert_eq!(
            GatiError::Backpressure { topic: "t".into(), depth: 10 }.status(),
            503
        );
        assert_eq!(
            GatiError::HandlerTimeout { handler_id: "h".into(), deadline_ms: 1 }.status(),
            504
        );
        assert_eq!(
            GatiError::Rpc(RpcError::Serialization {
                module: "m".into(),
                method: "f".into(),
                cause: "bad".into()
            })
            .status(),
            500
        );
    }

    #[test]
    fn serialization_errors_never_retry() {
        let err = RpcError::Serialization {
            module: "m".into(),
            method: "f".into(),
            cause: "bad".into(),
        };
        assert!(!err.retryable(true));
        assert!(!err.retryable(false));
    }

    #[test]
    fn timeout_retry_is_opt_in() {
        let err = RpcError::Timeout {
            module: "m".into(),
            method: "f".into(),
            deadline_ms: 10,
        };
        assert!(err.retryable(true));
        assert!(!err.retryable(false));
    }

    #[test]
    fn method_not_allowed_envelope_sets_allow_header() {
        let err = GatiError::MethodNotAllowed {
            path: "/things".into(),
            allowed: vec!["POST".into()],
        };
        let envelope = err.to_envelope("req-1");
        assert_eq!(envelope.status, 405);
        assert_eq!(envelope.headers.get("allow"), Some("POST"));
        assert_eq!(envelope.request_id, "req-1");
    }

    #[test]
    fn error_envelope_carries_code_and_request_id() {
        let err = GatiError::HandlerTimeout { handler_id: "h".into(), deadline_ms: 5 };
        let envelope = err.to_envelope("req-9");
        let body = envelope.body.unwrap();
        assert_eq!(body["code"], "handler.timeout");
        assert_eq!(body["request_id"], "req-9");
    }
}
