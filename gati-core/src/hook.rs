//! Hook trait and registration scopes.
//!
//! Hooks run around the handler in named phases. Execution order within a
//! phase is scope order (global, then route-scoped, then locally
//! registered) for before/after, and the reverse (innermost first) for
//! catch. Scopes are flat ordered vectors with a tag; there is no hook
//! graph.

use crate::envelope::{RequestEnvelope, ResponseEnvelope};
use crate::error::{GatiError, HookPhase};
use crate::global::GlobalContext;
use crate::local::LocalContext;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// What a hook asks the orchestrator to do next.
#[derive(Debug)]
pub enum HookOutcome {
    /// Proceed with the phase.
    Continue,
    /// Only meaningful in the catch phase: recover with this response
    /// envelope, short-circuiting the remaining catch hooks.
    Recover(ResponseEnvelope),
}

/// Everything a hook may see. `response` is populated in the after phase,
/// `error` in the catch phase.
pub struct HookArgs<'a> {
    pub phase: HookPhase,
    pub envelope: &'a RequestEnvelope,
    pub gctx: &'a GlobalContext,
    pub lctx: &'a mut LocalContext,
    pub response: Option<&'a mut ResponseEnvelope>,
    pub error: Option<&'a GatiError>,
}

pub type HookFuture<'a> = Pin<Box<dyn Future<Output = Result<HookOutcome, GatiError>> + Send + 'a>>;

/// A function registered to run in a named phase around the handler.
pub trait Hook: Send + Sync + 'static {
    /// Stable identifier, used in manifests and in `HookTimeout` reports.
    fn id(&self) -> &str;

    fn call<'a>(&'a self, args: HookArgs<'a>) -> HookFuture<'a>;
}

type BoxedHookFn = Box<dyn for<'a> Fn(HookArgs<'a>) -> HookFuture<'a> + Send + Sync>;

/// [`Hook`] built from a closure.
///
/// ```ignore
/// let hook = FnHook::new("audit", |args| {
///     Box::pin(async move {
///         args.lctx.log_info("request seen");
///         Ok(HookOutcome::Continue)
///     })
/// });
/// ```
pub struct FnHook {
    id: String,
    f: BoxedHookFn,
}

impl FnHook {
    pub fn new<F>(id: impl Into<String>, f: F) -> Arc<Self>
    where
        F: for<'a> Fn(HookArgs<'a>) -> HookFuture<'a> + Send + Sync + 'static,
    {
        Arc::new(FnHook {
            id: id.into(),
            f: Box::new(f),
        })
    }
}

impl Hook for FnHook {
    fn id(&self) -> &str {
        &self.id
    }

    fn call<'a>(&'a self, args: HookArgs<'a>) -> HookFuture<'a> {
        (self.f)(args)
    }
}
