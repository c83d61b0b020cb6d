//! Handler trait, the immutable request view, and the single-assignment
//! response builder.

use crate::envelope::{Headers, RequestEnvelope, ResponseEnvelope};
use crate::error::GatiError;
use crate::global::GlobalContext;
use crate::local::LocalContext;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// What a handler sees: the envelope, the extracted path parameters, and a
/// cancellation token it should observe at its own suspension points.
pub struct HandlerRequest {
    pub envelope: Arc<RequestEnvelope>,
    pub params: BTreeMap<String, String>,
    /// Cancelled when the handler deadline expires or the request is
    /// cancelled. Cooperative: user code checks it, the runtime does not
    /// preempt.
    pub cancel: CancellationToken,
}

impl HandlerRequest {
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(|v| v.as_str())
    }

    pub fn body(&self) -> Option<&serde_json::Value> {
        self.envelope.body.as_ref()
    }
}

/// Single-assignment response builder.
///
/// The first terminal call (`send_json`, `send_status`, `finish`)
/// freezes the response; later terminal calls are ignored, logged, and
/// recorded as a warning on the envelope. Non-terminal mutators
/// (`status`, `header`) are also ignored after the freeze.
pub struct ResponseBuilder {
    request_id: String,
    status: u16,
    headers: Headers,
    body: Option<serde_json::Value>,
    warnings: Vec<String>,
    frozen: bool,
}

impl ResponseBuilder {
    pub fn new(request_id: impl Into<String>) -> Self {
        ResponseBuilder {
            request_id: request_id.into(),
            status: 200,
            headers: Headers::new(),
            body: None,
            warnings: Vec::new(),
            frozen: false,
        }
    }

    pub fn status(&mut self, status: u16) -> &mut Self {
        if self.frozen {
            self.ignored("status");
        } else {
            self.status = status;
        }
        self
    }

    pub fn header(&mut self, name: impl AsRef<str>, value: impl Into<String>) -> &mut Self {
        if self.frozen {
            self.ignored("header");
        } else {
            self.headers.insert(name, value);
        }
        self
    }

    /// Terminal: set the body and freeze.
    pub fn send_json(&mut self, body: serde_json::Value) {
        if self.frozen {
            self.ignored("send_json");
            return;
        }
        self.body = Some(body);
        self.frozen = true;
    }

    /// Terminal: set the status with no body and freeze.
    pub fn send_status(&mut self, status: u16) {
        if self.frozen {
            self.ignored("send_status");
            return;
        }
        self.status = status;
        self.frozen = true;
    }

    /// Terminal: freeze with whatever has been staged so far.
    pub fn finish(&mut self) {
        if self.frozen {
            self.ignored("finish");
            return;
        }
        self.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Produce the response envelope. Unfrozen builders yield an empty 200;
    /// the handler worker treats that as a completed response.
    pub fn into_envelope(self) -> ResponseEnvelope {
        let mut envelope = ResponseEnvelope::new(self.request_id, self.status);
        envelope.headers = self.headers;
        envelope.body = self.body;
        envelope.warnings = self.warnings;
        envelope
    }

    fn ignored(&mut self, call: &str) {
        tracing::warn!(
            request_id = %self.request_id,
            call,
            "response already frozen; call ignored"
        );
        self.warnings
            .push(format!("{call} after response freeze was ignored"));
    }
}

pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Result<(), GatiError>> + Send + 'a>>;

/// User-authored request handler.
///
/// A handler produces its response through the builder; returning `Err`
/// routes the request into the catch-hook chain.
pub trait Handler: Send + Sync + 'static {
    fn id(&self) -> &str;

    fn call<'a>(
        &'a self,
        request: &'a HandlerRequest,
        gctx: &'a GlobalContext,
        lctx: &'a mut LocalContext,
        response: &'a mut ResponseBuilder,
    ) -> HandlerFuture<'a>;
}

type BoxedHandlerFn = Box<
    dyn for<'a> Fn(
            &'a HandlerRequest,
            &'a GlobalContext,
            &'a mut LocalContext,
            &'a mut ResponseBuilder,
        ) -> HandlerFuture<'a>
        + Send
        + Sync,
>;

/// [`Handler`] built from a closure.
pub struct FnHandler {
    id: String,
    f: BoxedHandlerFn,
}

impl FnHandler {
    pub fn new<F>(id: impl Into<String>, f: F) -> Arc<Self>
    where
        F: for<'a> Fn(
                &'a HandlerRequest,
                &'a GlobalContext,
                &'a mut LocalContext,
                &'a mut ResponseBuilder,
            ) -> HandlerFuture<'a>
            + Send
            + Sync
            + 'static,
    {
        Arc::new(FnHandler {
            id: id.into(),
            f: Box::new(f),
        })
    }
}

impl Handler for FnHandler {
    fn id(&self) -> &str {
        &self.id
    }

    fn call<'a>(
        &'a self,
        request: &'a HandlerRequest,
        gctx: &'a GlobalContext,
        lctx: &'a mut LocalContext,
        response: &'a mut ResponseBuilder,
    ) -> HandlerFuture<'a> {
        (self.f)(request, gctx, lctx, response)
    }
}
