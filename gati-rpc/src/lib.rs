//! Module RPC client.
//!
//! Handlers reach user modules through typed proxies built here: a framed
//! JSON wire codec, per-module connection pools (warm minimum, idle
//! reaping, lifetime recycling), and a retry loop with exponential backoff
//! bounded by both the retry ceiling and the overall call deadline.

pub mod client;
pub mod codec;
pub mod pool;
pub mod transport;

pub use client::{ModuleClient, RetryPolicy};
pub use codec::{CallFrame, ReplyFrame, ReplyStatus, WireError, MAX_FRAME_BYTES};
pub use pool::{ConnectionPool, PoolConfig, PoolLease};
pub use transport::{
    LocalTransport, LocalTransportBuilder, ModuleConnection, ModuleTransport, TcpTransport,
    TransportFuture,
};
