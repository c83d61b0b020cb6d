//! Per-module connection pool.
//!
//! Bounded by a configured maximum with a warm minimum. Idle connections
//! are reaped after the idle timeout; any connection past the absolute
//! lifetime is recycled instead of reused. Callers that cannot acquire a
//! connection before the acquire deadline get a connection timeout.

use crate::transport::{ModuleConnection, ModuleTransport};
use gati_core::config::GatiConfig;
use gati_core::error::RpcError;
use gati_core::metrics::Metrics;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max: usize,
    pub min: usize,
    pub idle: Duration,
    pub lifetime: Duration,
    pub acquire_timeout: Duration,
}

impl PoolConfig {
    pub fn from_runtime(config: &GatiConfig) -> Self {
        PoolConfig {
            max: config.module_pool_max,
            min: config.module_pool_min,
            idle: Duration::from_millis(config.module_pool_idle_ms),
            lifetime: Duration::from_millis(config.module_pool_lifetime_ms),
            acquire_timeout: Duration::from_millis(config.module_rpc_timeout_ms),
        }
    }
}

struct PooledConnection {
    conn: Box<dyn ModuleConnection>,
    created_at: Instant,
    last_used: Instant,
}

struct PoolState {
    idle: Vec<PooledConnection>,
    total: usize,
}

pub struct ConnectionPool {
    module_id: String,
    transport: Arc<dyn ModuleTransport>,
    config: PoolConfig,
    state: Mutex<PoolState>,
    notify: Notify,
    metrics: Metrics,
}

impl ConnectionPool {
    pub fn new(
        module_id: impl Into<String>,
        transport: Arc<dyn ModuleTransport>,
        config: PoolConfig,
        metrics: Metrics,
    ) -> Arc<Self> {
        Arc::new(ConnectionPool {
            module_id: module_id.into(),
            transport,
            config,
            state: Mutex::new(PoolState {
                idle: Vec::new(),
                total: 0,
            }),
            notify: Notify::new(),
            metrics,
        })
    }

    /// Open connections up to the configured minimum. Failures are logged,
    /// not fatal; the pool fills lazily afterwards.
    pub async fn warm(self: &Arc<Self>) {
        for _ in 0..self.config.min {
            match self.open().await {
                Ok(lease) => drop(lease),
                Err(err) => {
                    tracing::warn!(module = %self.module_id, error = %err, "pool warm-up connect failed");
                    break;
                }
            }
        }
    }

    /// Borrow a connection, waiting up to the acquire timeout.
    pub async fn acquire(self: &Arc<Self>) -> Result<PoolLease, RpcError> {
        let started = Instant::now();
        let deadline = started + self.config.acquire_timeout;
        loop {
            let action = {
                let mut state = self.state.lock().expect("pool lock poisoned");
                self.reap_locked(&mut state);
                if let Some(pooled) = state.idle.pop() {
                    self.export_stats(&state);
                    Some(Ok(pooled))
                } else if state.total < self.config.max {
                    state.total += 1;
                    self.export_stats(&state);
                    None // caller opens a fresh connection
                } else {
                    Some(Err(()))
                }
            };
            match action {
                Some(Ok(pooled)) => {
                    return Ok(PoolLease {
                        pool: self.clone(),
                        pooled: Some(pooled),
                    });
                }
                None => return self.open_reserved().await,
                Some(Err(())) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(RpcError::ConnectionTimeout {
                            module: self.module_id.clone(),
                            waited_ms: started.elapsed().as_millis() as u64,
                        });
                    }
                    let wait = deadline - now;
                    if tokio::time::timeout(wait, self.notify.notified()).await.is_err() {
                        return Err(RpcError::ConnectionTimeout {
                            module: self.module_id.clone(),
                            waited_ms: started.elapsed().as_millis() as u64,
                        });
                    }
                }
            }
        }
    }

    /// Current (total, in-use, idle) counts.
    pub fn stats(&self) -> (usize, usize, usize) {
        let state = self.state.lock().expect("pool lock poisoned");
        let idle = state.idle.len();
        (state.total, state.total - idle, idle)
    }

    async fn open(self: &Arc<Self>) -> Result<PoolLease, RpcError> {
        {
            let mut state = self.state.lock().expect("pool lock poisoned");
            if state.total >= self.config.max {
                return Err(RpcError::ConnectionTimeout {
                    module: self.module_id.clone(),
                    waited_ms: 0,
                });
            }
            state.total += 1;
        }
        self.open_reserved().await
    }

    /// Open a connection for an already-reserved slot; the reservation is
    /// rolled back on failure.
    async fn open_reserved(self: &Arc<Self>) -> Result<PoolLease, RpcError> {
        match self.transport.connect().await {
            Ok(conn) => {
                let now = Instant::now();
                Ok(PoolLease {
                    pool: self.clone(),
                    pooled: Some(PooledConnection {
                        conn,
                        created_at: now,
                        last_used: now,
                    }),
                })
            }
            Err(err) => {
                let mut state = self.state.lock().expect("pool lock poisoned");
                state.total -= 1;
                self.export_stats(&state);
                drop(state);
                self.notify.notify_one();
                Err(err)
            }
        }
    }

    fn release(&self, mut pooled: PooledConnection) {
        let now = Instant::now();
        let keep = pooled.conn.reusable() && now.duration_since(pooled.created_at) < self.config.lifetime;
        let mut state = self.state.lock().expect("pool lock poisoned");
        if keep {
            pooled.last_used = now;
            state.idle.push(pooled);
        } else {
            state.total -= 1;
        }
        self.export_stats(&state);
        drop(state);
        self.notify.notify_one();
    }

    fn discard_slot(&self) {
        let mut state = self.state.lock().expect("pool lock poisoned");
        state.total -= 1;
        self.export_stats(&state);
        drop(state);
        self.notify.notify_one();
    }

    fn reap_locked(&self, state: &mut PoolState) {
        let now = Instant::now();
        let (idle, lifetime) = (self.config.idle, self.config.lifetime);
        let before = state.idle.len();
        state.idle.retain(|pooled| {
            now.duration_since(pooled.last_used) < idle
                && now.duration_since(pooled.created_at) < lifetime
        });
        state.total -= before - state.idle.len();
    }

    fn export_stats(&self, state: &PoolState) {
        let idle = state.idle.len();
        let prefix = format!("rpc.pool.{}", self.module_id);
        self.metrics.gauge(&format!("{prefix}.total"), state.total as f64);
        self.metrics
            .gauge(&format!("{prefix}.in_use"), (state.total - idle) as f64);
        self.metrics.gauge(&format!("{prefix}.idle"), idle as f64);
    }
}

/// A borrowed connection. Dropping the lease returns a reusable connection
/// to the pool and discards a broken or over-age one.
pub struct PoolLease {
    pool: Arc<ConnectionPool>,
    pooled: Option<PooledConnection>,
}

impl std::fmt::Debug for PoolLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolLease").finish_non_exhaustive()
    }
}

impl PoolLease {
    pub fn connection(&mut self) -> &mut Box<dyn ModuleConnection> {
        &mut self.pooled.as_mut().expect("lease already released").conn
    }

    /// Close the connection instead of returning it. For connections in an
    /// unknown state (e.g. a call that timed out mid-frame).
    pub fn discard(mut self) {
        if self.pooled.take().is_some() {
            self.pool.discard_slot();
        }
    }
}

impl Drop for PoolLease {
    fn drop(&mut self) {
        if let Some(pooled) = self.pooled.take() {
            self.pool.release(pooled);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{LocalTransportBuilder, TransportFuture};
    use gati_core::metrics::{InMemoryMetrics, Metrics};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingTransport {
        inner: crate::transport::LocalTransport,
        connects: AtomicUsize,
    }

    impl CountingTransport {
        fn new() -> Arc<Self> {
            Arc::new(CountingTransport {
                inner: LocalTransportBuilder::new()
                    .method("ping", |_| async { Ok(serde_json::json!("pong")) })
                    .build(),
                connects: AtomicUsize::new(0),
            })
        }
    }

    impl ModuleTransport for CountingTransport {
        fn connect(&self) -> TransportFuture<'_, Box<dyn ModuleConnection>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            self.inner.connect()
        }
    }

    fn pool_config(max: usize) -> PoolConfig {
        PoolConfig {
            max,
            min: 1,
            idle: Duration::from_secs(60),
            lifetime: Duration::from_secs(600),
            acquire_timeout: Duration::from_millis(100),
        }
    }

    fn pool(transport: Arc<CountingTransport>, config: PoolConfig) -> Arc<ConnectionPool> {
        ConnectionPool::new(
            "m",
            transport,
            config,
            Metrics::new(Arc::new(InMemoryMetrics::new()), true),
        )
    }

    #[tokio::test]
    async fn released_connections_are_reused() {
        let transport = CountingTransport::new();
        let pool = pool(transport.clone(), pool_config(4));
        let lease = pool.acquire().await.unwrap();
        drop(lease);
        let lease = pool.acquire().await.unwrap();
        drop(lease);
        assert_eq!(transport.connects.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats(), (1, 0, 1));
    }

    #[tokio::test]
    async fn acquire_times_out_when_exhausted() {
        let transport = CountingTransport::new();
        let pool = pool(transport, pool_config(1));
        let _held = pool.acquire().await.unwrap();
        let err = pool.acquire().await.unwrap_err();
        match err {
            RpcError::ConnectionTimeout { waited_ms, .. } => assert!(waited_ms >= 100),
            other => panic!("expected ConnectionTimeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn waiting_acquire_wakes_on_release() {
        let transport = CountingTransport::new();
        let pool = pool(transport, pool_config(1));
        let held = pool.acquire().await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(held);
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn over_lifetime_connections_are_recycled() {
        let transport = CountingTransport::new();
        let mut config = pool_config(2);
        config.lifetime = Duration::from_millis(10);
        let pool = pool(transport.clone(), config);
        let lease = pool.acquire().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(lease); // past lifetime: discarded, not returned
        assert_eq!(pool.stats().0, 0);
        let _lease = pool.acquire().await.unwrap();
        assert_eq!(transport.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn warm_fills_to_min() {
        let transport = CountingTransport::new();
        let mut config = pool_config(4);
        config.min = 2;
        let pool = pool(transport.clone(), config);
        pool.warm().await;
        assert_eq!(pool.stats(), (2, 0, 2));
        assert_eq!(transport.connects.load(Ordering::SeqCst), 2);
    }
}
