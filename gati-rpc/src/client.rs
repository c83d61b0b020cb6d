//! Typed, pooled, retrying module client.
//!
//! One client per registered module. A call borrows a pooled connection,
//! issues the framed request with the remaining deadline, and maps
//! failures onto the RPC error taxonomy. Transport errors and explicit
//! wire retry hints back off exponentially; serialization and protocol
//! errors never retry; deadline expiry retries only when configured.

use crate::codec::{CallFrame, ReplyStatus};
use crate::pool::{ConnectionPool, PoolConfig};
use crate::transport::ModuleTransport;
use gati_core::config::GatiConfig;
use gati_core::error::RpcError;
use gati_core::global::ModuleInvoker;
use gati_core::metrics::Metrics;
use gati_manifest::ModuleManifest;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Consecutive-failure threshold beyond which the module reports
/// unhealthy to the route manager.
const UNHEALTHY_AFTER: u32 = 3;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_initial: Duration,
    pub backoff_mult: f64,
    pub backoff_max: Duration,
    pub retry_on_timeout: bool,
    /// Default overall deadline when the caller supplies none.
    pub call_timeout: Duration,
}

impl RetryPolicy {
    pub fn from_runtime(config: &GatiConfig) -> Self {
        RetryPolicy {
            max_retries: config.module_rpc_max_retries,
            backoff_initial: Duration::from_millis(config.module_rpc_backoff_initial_ms),
            backoff_mult: config.module_rpc_backoff_mult,
            backoff_max: Duration::from_millis(config.module_rpc_backoff_max_ms),
            retry_on_timeout: config.module_rpc_retry_on_timeout,
            call_timeout: Duration::from_millis(config.module_rpc_timeout_ms),
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = self.backoff_mult.powi(attempt.saturating_sub(1) as i32);
        let millis = (self.backoff_initial.as_millis() as f64 * factor) as u64;
        Duration::from_millis(millis).min(self.backoff_max)
    }
}

/// RPC stub for one module.
pub struct ModuleClient {
    manifest: Arc<ModuleManifest>,
    pool: Arc<ConnectionPool>,
    policy: RetryPolicy,
    metrics: Metrics,
    consecutive_failures: AtomicU32,
}

impl ModuleClient {
    pub fn new(
        manifest: Arc<ModuleManifest>,
        transport: Arc<dyn ModuleTransport>,
        config: &GatiConfig,
        metrics: Metrics,
    ) -> Arc<Self> {
        let pool = ConnectionPool::new(
            manifest.module_id.clone(),
            transport,
            PoolConfig::from_runtime(config),
            metrics.clone(),
        );
        Arc::new(ModuleClient {
            manifest,
            pool,
            policy: RetryPolicy::from_runtime(config),
            metrics,
            consecutive_failures: AtomicU32::new(0),
        })
    }

    /// Keep the minimum pool warm; call once at startup.
    pub async fn warm(&self) {
        self.pool.warm().await;
    }

    pub fn manifest(&self) -> &ModuleManifest {
        &self.manifest
    }

    /// Invoke a declared method with the policy's default deadline.
    pub async fn call(
        &self,
        method: &str,
        args: serde_json::Value,
    ) -> Result<serde_json::Value, RpcError> {
        self.call_with_deadline(method, args, self.policy.call_timeout)
            .await
    }

    /// Invoke with an explicit overall deadline covering every attempt and
    /// backoff sleep.
    pub async fn call_with_deadline(
        &self,
        method: &str,
        args: serde_json::Value,
        deadline: Duration,
    ) -> Result<serde_json::Value, RpcError> {
        let module = self.manifest.module_id.clone();
        if !self.manifest.exports(method) {
            return Err(RpcError::Protocol {
                module,
                method: method.to_string(),
                cause: "method not declared in module manifest".to_string(),
            });
        }
        self.metrics.incr("rpc.calls");
        let deadline_at = Instant::now() + deadline;
        let max_attempts = self.policy.max_retries + 1;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let outcome = self
                .attempt(&module, method, args.clone(), deadline_at, attempt)
                .await;
            match outcome {
                Ok(value) => {
                    self.consecutive_failures.store(0, Ordering::SeqCst);
                    return Ok(value);
                }
                Err((error, hinted_retryable)) => {
                    let retryable =
                        hinted_retryable.unwrap_or_else(|| error.retryable(self.policy.retry_on_timeout));
                    let backoff = self.policy.backoff(attempt);
                    let out_of_budget =
                        attempt >= max_attempts || Instant::now() + backoff >= deadline_at;
                    if retryable && !out_of_budget {
                        self.metrics.incr("rpc.retries");
                        tracing::debug!(
                            module = %module,
                            method,
                            attempt,
                            backoff_ms = backoff.as_millis() as u64,
                            error = %error,
                            "retrying module call"
                        );
                        tokio::time::sleep(backoff).await;
                        continue;
                    }
                    self.metrics.incr("rpc.failures");
                    self.consecutive_failures.fetch_add(1, Ordering::SeqCst);
                    return Err(self.finalize_error(error, retryable && out_of_budget));
                }
            }
        }
    }

    /// Whether the module has a healthy endpoint, judged by recent calls.
    pub fn healthy(&self) -> bool {
        self.consecutive_failures.load(Ordering::SeqCst) < UNHEALTHY_AFTER
    }

    pub fn pool_stats(&self) -> (usize, usize, usize) {
        self.pool.stats()
    }

    /// One delivery attempt. The second tuple element carries an explicit
    /// wire retry hint, when the callee sent one.
    async fn attempt(
        &self,
        module: &str,
        method: &str,
        args: serde_json::Value,
        deadline_at: Instant,
        attempt: u32,
    ) -> Result<serde_json::Value, (RpcError, Option<bool>)> {
        let remaining = deadline_at.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err((
                RpcError::Timeout {
                    module: module.to_string(),
                    method: method.to_string(),
                    deadline_ms: 0,
                },
                None,
            ));
        }

        let mut lease = match tokio::time::timeout(remaining, self.pool.acquire()).await {
            Ok(Ok(lease)) => lease,
            Ok(Err(err)) => return Err((err, None)),
            Err(_) => {
                return Err((
                    RpcError::ConnectionTimeout {
                        module: module.to_string(),
                        waited_ms: remaining.as_millis() as u64,
                    },
                    None,
                ));
            }
        };

        let remaining = deadline_at.saturating_duration_since(Instant::now());
        let frame = CallFrame {
            module: module.to_string(),
            method: method.to_string(),
            args,
            deadline_ms: remaining.as_millis() as u64,
            attempt,
        };
        let reply = match tokio::time::timeout(remaining, lease.connection().call(frame)).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(err)) => return Err((err, None)),
            Err(_) => {
                // The stream may hold half a frame; never reuse it.
                lease.discard();
                return Err((
                    RpcError::Timeout {
                        module: module.to_string(),
                        method: method.to_string(),
                        deadline_ms: remaining.as_millis() as u64,
                    },
                    None,
                ));
            }
        };

        match reply.status {
            ReplyStatus::Ok => Ok(reply.result.unwrap_or(serde_json::Value::Null)),
            ReplyStatus::Error => {
                let wire = reply.error.unwrap_or_else(|| crate::codec::WireError {
                    code: "unknown".to_string(),
                    message: "module returned an error without detail".to_string(),
                    retryable: false,
                });
                Err((
                    RpcError::Transport {
                        module: module.to_string(),
                        method: method.to_string(),
                        cause: format!("{}: {}", wire.code, wire.message),
                        exhausted: false,
                    },
                    Some(wire.retryable),
                ))
            }
        }
    }

    fn finalize_error(&self, error: RpcError, exhausted: bool) -> RpcError {
        match error {
            RpcError::Transport {
                module,
                method,
                cause,
                ..
            } if exhausted => RpcError::Transport {
                module,
                method,
                cause,
                exhausted: true,
            },
            other => other,
        }
    }
}

impl ModuleInvoker for ModuleClient {
    fn module_id(&self) -> &str {
        &self.manifest.module_id
    }

    fn invoke<'a>(
        &'a self,
        method: &'a str,
        args: serde_json::Value,
        deadline: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<serde_json::Value, RpcError>> + Send + 'a>> {
        Box::pin(self.call_with_deadline(method, args, deadline))
    }

    fn healthy(&self) -> bool {
        ModuleClient::healthy(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{
        LocalTransportBuilder, ModuleConnection, ModuleTransport, TransportFuture,
    };
    use gati_core::metrics::InMemoryMetrics;
    use gati_manifest::{MethodSignature, RuntimeKind};
    use std::collections::BTreeMap;
    use std::sync::atomic::AtomicUsize;

    fn manifest() -> Arc<ModuleManifest> {
        let mut methods = BTreeMap::new();
        methods.insert("find".to_string(), MethodSignature::default());
        methods.insert("slow".to_string(), MethodSignature::default());
        Arc::new(ModuleManifest {
            module_id: "users".to_string(),
            version: "1".to_string(),
            runtime: RuntimeKind::RemoteService,
            methods,
            capabilities: Vec::new(),
            resources: Default::default(),
        })
    }

    fn fast_config() -> GatiConfig {
        let mut config = GatiConfig::default();
        config.module_rpc_backoff_initial_ms = 10;
        config.module_rpc_backoff_mult = 2.0;
        config.module_rpc_backoff_max_ms = 100;
        config.module_rpc_max_retries = 3;
        config.module_rpc_timeout_ms = 2_000;
        config
    }

    /// Transport whose connections fail with transport errors for the
    /// first `failures` calls, then succeed.
    struct FlakyTransport {
        calls: Arc<AtomicUsize>,
        failures: usize,
    }

    impl ModuleTransport for FlakyTransport {
        fn connect(&self) -> TransportFuture<'_, Box<dyn ModuleConnection>> {
            let calls = self.calls.clone();
            let failures = self.failures;
            Box::pin(async move {
                Ok(Box::new(FlakyConnection { calls, failures }) as Box<dyn ModuleConnection>)
            })
        }
    }

    struct FlakyConnection {
        calls: Arc<AtomicUsize>,
        failures: usize,
    }

    impl ModuleConnection for FlakyConnection {
        fn call<'a>(&'a mut self, frame: CallFrame) -> TransportFuture<'a, crate::codec::ReplyFrame> {
            Box::pin(async move {
                let n = self.calls.fetch_add(1, Ordering::SeqCst);
                if n < self.failures {
                    Err(RpcError::Transport {
                        module: frame.module,
                        method: frame.method,
                        cause: "connection reset".to_string(),
                        exhausted: false,
                    })
                } else {
                    Ok(crate::codec::ReplyFrame::ok(serde_json::json!({
                        "attempt": frame.attempt,
                    })))
                }
            })
        }
    }

    fn client_with(transport: Arc<dyn ModuleTransport>, config: &GatiConfig) -> Arc<ModuleClient> {
        ModuleClient::new(
            manifest(),
            transport,
            config,
            Metrics::new(Arc::new(InMemoryMetrics::new()), true),
        )
    }

    #[tokio::test]
    async fn transient_transport_errors_retry_then_succeed() {
        let calls = Arc::new(AtomicUsize::new(0));
        let client = client_with(
            Arc::new(FlakyTransport {
                calls: calls.clone(),
                failures: 2,
            }),
            &fast_config(),
        );
        let started = Instant::now();
        let result = client.call("find", serde_json::json!({})).await.unwrap();
        // Two failures then a success: exactly 3 attempts...
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(result["attempt"], 3);
        // ...separated by at least initial + initial*mult of backoff.
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert!(client.healthy());
    }

    #[tokio::test]
    async fn attempts_are_bounded_and_exhaustion_is_marked() {
        let calls = Arc::new(AtomicUsize::new(0));
        let client = client_with(
            Arc::new(FlakyTransport {
                calls: calls.clone(),
                failures: usize::MAX,
            }),
            &fast_config(),
        );
        let err = client.call("find", serde_json::json!({})).await.unwrap_err();
        // max_retries + 1 total attempts.
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(err.code(), "rpc.transport.exhausted");
    }

    #[tokio::test]
    async fn undeclared_method_is_a_protocol_error() {
        let client = client_with(
            Arc::new(LocalTransportBuilder::new().build()),
            &fast_config(),
        );
        let err = client.call("absent", serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, RpcError::Protocol { .. }));
    }

    #[tokio::test]
    async fn wire_error_without_retry_hint_is_not_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        let transport = LocalTransportBuilder::new()
            .method("find", move |_| {
                let calls = counted.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(RpcError::Serialization {
                        module: "users".to_string(),
                        method: "find".to_string(),
                        cause: "bad payload".to_string(),
                    })
                }
            })
            .build();
        let client = client_with(Arc::new(transport), &fast_config());
        let err = client.call("find", serde_json::json!({})).await.unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(err, RpcError::Serialization { .. }));
    }

    #[tokio::test]
    async fn deadline_bounds_total_elapsed() {
        let calls = Arc::new(AtomicUsize::new(0));
        let client = client_with(
            Arc::new(FlakyTransport {
                calls: calls.clone(),
                failures: usize::MAX,
            }),
            &fast_config(),
        );
        let started = Instant::now();
        let err = client
            .call_with_deadline("find", serde_json::json!({}), Duration::from_millis(25))
            .await
            .unwrap_err();
        assert!(started.elapsed() < Duration::from_millis(200));
        // Fewer than the full 4 attempts fit into 25ms of budget.
        assert!(calls.load(Ordering::SeqCst) < 4);
        drop(err);
    }

    #[tokio::test]
    async fn slow_call_times_out_and_discards_the_connection() {
        let transport = LocalTransportBuilder::new()
            .method("slow", |_| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(serde_json::Value::Null)
            })
            .build();
        let mut config = fast_config();
        config.module_rpc_retry_on_timeout = false;
        let client = client_with(Arc::new(transport), &config);
        let err = client
            .call_with_deadline("slow", serde_json::json!({}), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Timeout { .. }));
    }

    #[tokio::test]
    async fn repeated_failures_mark_the_module_unhealthy() {
        let client = client_with(
            Arc::new(FlakyTransport {
                calls: Arc::new(AtomicUsize::new(0)),
                failures: usize::MAX,
            }),
            &fast_config(),
        );
        for _ in 0..3 {
            let _ = client.call("find", serde_json::json!({})).await;
        }
        assert!(!client.healthy());
    }
}
