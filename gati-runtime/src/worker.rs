//! Handler worker.
//!
//! Executes a resolved handler under a deadline derived from the
//! envelope's remaining budget minus a guard band for the after and
//! finalize phases. Cancellation is cooperative: the handler's request
//! carries a child token that fires when the deadline expires, and the
//! handler future itself is dropped at the deadline, so a late response
//! has nowhere to go.

use gati_core::envelope::ResponseEnvelope;
use gati_core::error::GatiError;
use gati_core::global::GlobalContext;
use gati_core::handler::{Handler, HandlerRequest, ResponseBuilder};
use gati_core::local::LocalContext;
use std::sync::Arc;
use std::time::Duration;

/// Slack reserved on top of the cleanup budget when deriving the handler
/// deadline from the remaining request budget.
const GUARD_BAND_SLACK: Duration = Duration::from_millis(100);

/// Smallest deadline a handler is ever given; below this the request is
/// effectively out of budget already.
const MIN_HANDLER_DEADLINE: Duration = Duration::from_millis(5);

/// Derive the handler deadline: the configured handler timeout, clipped to
/// what remains of the request budget after the guard band.
pub fn handler_deadline(
    remaining_budget: Duration,
    handler_timeout: Duration,
    cleanup_timeout: Duration,
) -> Duration {
    let guard = cleanup_timeout + GUARD_BAND_SLACK;
    handler_timeout
        .min(remaining_budget.saturating_sub(guard))
        .max(MIN_HANDLER_DEADLINE)
}

/// Run the handler to a response envelope.
///
/// A thrown error propagates for the catch phase; deadline expiry raises
/// `HandlerTimeout` and cancels the request token.
pub async fn execute(
    handler: Arc<dyn Handler>,
    request: &HandlerRequest,
    gctx: &GlobalContext,
    lctx: &mut LocalContext,
    deadline: Duration,
) -> Result<ResponseEnvelope, GatiError> {
    let mut builder = ResponseBuilder::new(&request.envelope.request_id);
    let outcome = tokio::time::timeout(
        deadline,
        handler.call(request, gctx, lctx, &mut builder),
    )
    .await;
    match outcome {
        Ok(Ok(())) => Ok(builder.into_envelope()),
        Ok(Err(err)) => Err(err),
        Err(_) => {
            request.cancel.cancel();
            gctx.metrics().incr("handler.timeout");
            Err(GatiError::HandlerTimeout {
                handler_id: handler.id().to_string(),
                deadline_ms: deadline.as_millis() as u64,
            })
        }
    }
}
