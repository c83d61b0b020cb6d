//! Transport seam for module RPC.
//!
//! The client speaks to a [`ModuleTransport`], which opens
//! [`ModuleConnection`]s. Two implementations ship: a framed TCP transport
//! for sandboxed/remote modules and an in-process dispatch table for
//! in-process modules (and for tests).

use crate::codec::{read_frame, write_frame, CallFrame, ReplyFrame};
use gati_core::error::RpcError;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::net::TcpStream;

pub type TransportFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, RpcError>> + Send + 'a>>;

/// One reusable connection to a module endpoint.
pub trait ModuleConnection: Send {
    fn call<'a>(&'a mut self, frame: CallFrame) -> TransportFuture<'a, ReplyFrame>;

    /// Whether the connection may be returned to the pool. Connections
    /// that saw an I/O error report `false` and are discarded.
    fn reusable(&self) -> bool {
        true
    }
}

/// Factory for connections to one module endpoint.
pub trait ModuleTransport: Send + Sync + 'static {
    fn connect(&self) -> TransportFuture<'_, Box<dyn ModuleConnection>>;
}

// ── TCP ────────────────────────────────────────────────────────────────

/// Persistent framed-TCP transport.
pub struct TcpTransport {
    module_id: String,
    addr: String,
}

impl TcpTransport {
    pub fn new(module_id: impl Into<String>, addr: impl Into<String>) -> Self {
        TcpTransport {
            module_id: module_id.into(),
            addr: addr.into(),
        }
    }
}

impl ModuleTransport for TcpTransport {
    fn connect(&self) -> TransportFuture<'_, Box<dyn ModuleConnection>> {
        Box::pin(async move {
            let stream = TcpStream::connect(&self.addr).await.map_err(|e| {
                RpcError::Transport {
                    module: self.module_id.clone(),
                    method: String::new(),
                    cause: format!("connect {}: {e}", self.addr),
                    exhausted: false,
                }
            })?;
            stream.set_nodelay(true).ok();
            Ok(Box::new(TcpConnection {
                stream,
                broken: false,
            }) as Box<dyn ModuleConnection>)
        })
    }
}

struct TcpConnection {
    stream: TcpStream,
    broken: bool,
}

impl ModuleConnection for TcpConnection {
    fn call<'a>(&'a mut self, frame: CallFrame) -> TransportFuture<'a, ReplyFrame> {
        Box::pin(async move {
            let module = frame.module.clone();
            let method = frame.method.clone();
            let result: Result<ReplyFrame, RpcError> = async {
                write_frame(&mut self.stream, &frame, &module, &method).await?;
                read_frame(&mut self.stream, &module, &method).await
            }
            .await;
            if matches!(result, Err(RpcError::Transport { .. })) {
                self.broken = true;
            }
            result
        })
    }

    fn reusable(&self) -> bool {
        !self.broken
    }
}

// ── In-process ─────────────────────────────────────────────────────────

type LocalMethod = Arc<
    dyn Fn(serde_json::Value) -> Pin<Box<dyn Future<Output = Result<serde_json::Value, RpcError>> + Send>>
        + Send
        + Sync,
>;

/// Dispatch table for in-process modules. Connections are free and always
/// reusable; the pool still bounds concurrent calls.
#[derive(Clone, Default)]
pub struct LocalTransport {
    methods: Arc<HashMap<String, LocalMethod>>,
}

/// Builder for a [`LocalTransport`] method table.
#[derive(Default)]
pub struct LocalTransportBuilder {
    methods: HashMap<String, LocalMethod>,
}

impl LocalTransportBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn method<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value, RpcError>> + Send + 'static,
    {
        self.methods
            .insert(name.into(), Arc::new(move |args| Box::pin(f(args))));
        self
    }

    pub fn build(self) -> LocalTransport {
        LocalTransport {
            methods: Arc::new(self.methods),
        }
    }
}

impl ModuleTransport for LocalTransport {
    fn connect(&self) -> TransportFuture<'_, Box<dyn ModuleConnection>> {
        let methods = self.methods.clone();
        Box::pin(async move { Ok(Box::new(LocalConnection { methods }) as Box<dyn ModuleConnection>) })
    }
}

struct LocalConnection {
    methods: Arc<HashMap<String, LocalMethod>>,
}

impl ModuleConnection for LocalConnection {
    fn call<'a>(&'a mut self, frame: CallFrame) -> TransportFuture<'a, ReplyFrame> {
        Box::pin(async move {
            let Some(method) = self.methods.get(&frame.method) else {
                return Err(RpcError::Protocol {
                    module: frame.module.clone(),
                    method: frame.method.clone(),
                    cause: "method not exported".to_string(),
                });
            };
            match method(frame.args).await {
                Ok(result) => Ok(ReplyFrame::ok(result)),
                Err(err) => Err(err),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ReplyStatus;

    fn call(method: &str) -> CallFrame {
        CallFrame {
            module: "m".to_string(),
            method: method.to_string(),
            args: serde_json::json!({"n": 2}),
            deadline_ms: 1000,
            attempt: 1,
        }
    }

    #[tokio::test]
    async fn local_transport_dispatches_methods() {
        let transport = LocalTransportBuilder::new()
            .method("double", |args| async move {
                let n = args["n"].as_i64().unwrap_or(0);
                Ok(serde_json::json!({"doubled": n * 2}))
            })
            .build();
        let mut conn = transport.connect().await.unwrap();
        let reply = conn.call(call("double")).await.unwrap();
        assert_eq!(reply.status, ReplyStatus::Ok);
        assert_eq!(reply.result.unwrap()["doubled"], 4);
    }

    #[tokio::test]
    async fn unknown_method_is_a_protocol_error() {
        let transport = LocalTransportBuilder::new().build();
        let mut conn = transport.connect().await.unwrap();
        let err = conn.call(call("absent")).await.unwrap_err();
        assert!(matches!(err, RpcError::Protocol { .. }));
    }

    #[tokio::test]
    async fn tcp_transport_round_trips_against_a_fake_module() {
        // A minimal module server: read one call, double the input, reply.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let frame: CallFrame = read_frame(&mut socket, "m", "f").await.unwrap();
            let n = frame.args["n"].as_i64().unwrap();
            let reply = ReplyFrame::ok(serde_json::json!({"doubled": n * 2}));
            write_frame(&mut socket, &reply, "m", "f").await.unwrap();
        });

        let transport = TcpTransport::new("m", addr.to_string());
        let mut conn = transport.connect().await.unwrap();
        let reply = conn.call(call("double")).await.unwrap();
        assert_eq!(reply.result.unwrap()["doubled"], 4);
        assert!(conn.reusable());
    }

    #[tokio::test]
    async fn tcp_connection_marks_itself_broken_on_io_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            drop(socket);
        });

        let transport = TcpTransport::new("m", addr.to_string());
        let mut conn = transport.connect().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let err = conn.call(call("double")).await.unwrap_err();
        assert!(matches!(err, RpcError::Transport { .. }));
        assert!(!conn.reusable());
    }
}
