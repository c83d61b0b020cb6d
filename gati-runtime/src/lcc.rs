//! Local-context controller: the per-request phase machine.
//!
//! Phase ordering is strict: before, handler, then after on success or
//! catch on error, then finalize exactly once. Within before/after, hooks
//! run sequentially in scope order (global, route-scoped, locally
//! registered); catch runs innermost first (local, route, global) and the
//! first recovery envelope wins. Every hook is bounded by the hook
//! deadline; an overrun is recorded as `HookTimeout` and treated as a
//! thrown error.

use crate::hooks::HookRegistry;
use crate::worker;
use gati_core::envelope::{RequestEnvelope, ResponseEnvelope};
use gati_core::error::{GatiError, HookPhase};
use gati_core::global::GlobalContext;
use gati_core::handler::{Handler, HandlerRequest};
use gati_core::hook::{Hook, HookArgs, HookOutcome};
use gati_core::local::{LocalContext, Phase};
use gati_manifest::HandlerManifest;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Index into `LocalContext::hook_cursors` per phase.
fn cursor_index(phase: HookPhase) -> usize {
    match phase {
        HookPhase::Before => 0,
        HookPhase::After => 1,
        HookPhase::Catch => 2,
    }
}

pub struct Lcc {
    gctx: Arc<GlobalContext>,
    hooks: Arc<HookRegistry>,
}

impl Lcc {
    pub fn new(gctx: Arc<GlobalContext>, hooks: Arc<HookRegistry>) -> Arc<Self> {
        Arc::new(Lcc { gctx, hooks })
    }

    /// Run one request through the full lifecycle and produce its terminal
    /// response envelope. Never panics outward; never skips finalize.
    pub async fn execute(
        &self,
        envelope: Arc<RequestEnvelope>,
        manifest: &HandlerManifest,
        handler: Arc<dyn Handler>,
        params: BTreeMap<String, String>,
    ) -> ResponseEnvelope {
        let config = self.gctx.config();
        let mut lctx = LocalContext::new(
            &envelope.request_id,
            &envelope.trace_id,
            &envelope.client_id,
            config.snapshot_max,
        );
        let mut error: Option<GatiError> = None;
        let mut response: Option<ResponseEnvelope> = None;

        // Before phase.
        lctx.set_phase(Phase::Before);
        if let Err(err) = self
            .run_sequence(HookPhase::Before, &envelope, &mut lctx, &mut None, manifest)
            .await
        {
            error = Some(err);
        }

        // Handler phase.
        if error.is_none() {
            lctx.set_phase(Phase::Handler);
            let remaining =
                envelope.remaining_budget(Duration::from_millis(config.request_timeout_ms));
            let deadline = worker::handler_deadline(
                remaining,
                Duration::from_millis(config.handler_timeout_ms),
                Duration::from_millis(config.cleanup_timeout_ms),
            );
            let request = HandlerRequest {
                envelope: envelope.clone(),
                params,
                cancel: CancellationToken::new(),
            };
            match worker::execute(handler, &request, &self.gctx, &mut lctx, deadline).await {
                Ok(produced) => response = Some(produced),
                Err(err) => error = Some(err),
            }
        }

        // After phase; never runs once the handler aborted into catch.
        if error.is_none() {
            lctx.set_phase(Phase::After);
            let mut slot = response.take();
            let result = self
                .run_sequence(HookPhase::After, &envelope, &mut lctx, &mut slot, manifest)
                .await;
            response = slot;
            if let Err(err) = result {
                error = Some(err);
            }
        }

        // Catch phase, only on error.
        if let Some(err) = &error {
            lctx.set_phase(Phase::Catch);
            self.gctx.metrics().incr("lcc.catch_entered");
            let recovered = self.run_catch(&envelope, &mut lctx, err, manifest).await;
            response = Some(match recovered {
                Some(recovery) => recovery,
                None => err.to_envelope(&envelope.request_id),
            });
        }

        // Finalize, exactly once, success or not.
        self.finalize(&mut lctx).await;

        let mut response =
            response.unwrap_or_else(|| ResponseEnvelope::new(&envelope.request_id, 200));
        if response.request_id != envelope.request_id {
            tracing::warn!(
                expected = %envelope.request_id,
                actual = %response.request_id,
                "response request id drifted; restoring"
            );
            response.request_id = envelope.request_id.clone();
        }
        response
    }

    /// Run a before/after phase: global, then route-scoped, then local.
    /// Local hooks may be registered mid-phase by earlier hooks and still
    /// run; the cursor in the local context tracks progress.
    async fn run_sequence(
        &self,
        phase: HookPhase,
        envelope: &RequestEnvelope,
        lctx: &mut LocalContext,
        response: &mut Option<ResponseEnvelope>,
        manifest: &HandlerManifest,
    ) -> Result<(), GatiError> {
        let bound = match phase {
            HookPhase::Before => &manifest.hooks.before,
            HookPhase::After => &manifest.hooks.after,
            HookPhase::Catch => &manifest.hooks.catch,
        };
        let mut ordered: Vec<Arc<dyn Hook>> = self.hooks.global(phase).to_vec();
        ordered.extend(self.hooks.resolve(bound));

        for hook in ordered {
            self.run_hook(phase, &hook, envelope, lctx, response, None)
                .await?;
        }
        loop {
            let cursor = lctx.hook_cursors[cursor_index(phase)];
            let Some(entry) = lctx.local_hooks(phase).get(cursor) else {
                break;
            };
            let hook = entry.hook.clone();
            lctx.hook_cursors[cursor_index(phase)] = cursor + 1;
            self.run_hook(phase, &hook, envelope, lctx, response, None)
                .await?;
        }
        Ok(())
    }

    /// Run one hook under the hook deadline. A timeout or error aborts the
    /// phase; a `Recover` outside catch is ignored with a warning.
    async fn run_hook(
        &self,
        phase: HookPhase,
        hook: &Arc<dyn Hook>,
        envelope: &RequestEnvelope,
        lctx: &mut LocalContext,
        response: &mut Option<ResponseEnvelope>,
        error: Option<&GatiError>,
    ) -> Result<Option<ResponseEnvelope>, GatiError> {
        let timeout = Duration::from_millis(self.gctx.config().hook_timeout_ms);
        let request_id_before = response.as_ref().map(|r| r.request_id.clone());
        let args = HookArgs {
            phase,
            envelope,
            gctx: &self.gctx,
            lctx,
            response: response.as_mut(),
            error,
        };
        let outcome = match tokio::time::timeout(timeout, hook.call(args)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                self.gctx.metrics().incr("hook.timeout");
                return Err(GatiError::HookTimeout {
                    hook_id: hook.id().to_string(),
                    phase,
                });
            }
        };
        // After-hooks may amend status and headers but never the
        // correlation id.
        if let (Some(previous), Some(current)) = (request_id_before, response.as_mut()) {
            if current.request_id != previous {
                tracing::warn!(hook_id = %hook.id(), "after-hook changed the request id; reverted");
                current.request_id = previous;
            }
        }
        match outcome? {
            HookOutcome::Continue => Ok(None),
            HookOutcome::Recover(envelope) if phase == HookPhase::Catch => Ok(Some(envelope)),
            HookOutcome::Recover(_) => {
                tracing::warn!(
                    hook_id = %hook.id(),
                    phase = %phase,
                    "recovery envelope outside catch phase ignored"
                );
                Ok(None)
            }
        }
    }

    /// Catch chain, innermost to outermost: locally registered hooks in
    /// reverse registration order, then route-scoped, then global. The
    /// first recovery envelope wins. A catch hook that itself fails or
    /// times out is logged and skipped; it cannot re-enter catch.
    async fn run_catch(
        &self,
        envelope: &RequestEnvelope,
        lctx: &mut LocalContext,
        error: &GatiError,
        manifest: &HandlerManifest,
    ) -> Option<ResponseEnvelope> {
        let mut ordered: Vec<Arc<dyn Hook>> = lctx
            .local_hooks(HookPhase::Catch)
            .iter()
            .rev()
            .map(|entry| entry.hook.clone())
            .collect();
        ordered.extend(self.hooks.resolve(&manifest.hooks.catch));
        ordered.extend(self.hooks.global(HookPhase::Catch).to_vec());

        for hook in ordered {
            let mut no_response = None;
            match self
                .run_hook(
                    HookPhase::Catch,
                    &hook,
                    envelope,
                    lctx,
                    &mut no_response,
                    Some(error),
                )
                .await
            {
                Ok(Some(recovery)) => return Some(recovery),
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(
                        hook_id = %hook.id(),
                        error = %err,
                        "catch hook failed; continuing the chain"
                    );
                }
            }
        }
        None
    }

    /// Cleanups in reverse registration order, each bounded by the cleanup
    /// deadline and isolated from panics; then wait for the outstanding
    /// counter to settle, bounded by the same deadline.
    async fn finalize(&self, lctx: &mut LocalContext) {
        lctx.set_phase(Phase::Finalized);
        let timeout = Duration::from_millis(self.gctx.config().cleanup_timeout_ms);
        for (id, cleanup) in lctx.take_cleanups() {
            let mut task = tokio::spawn(cleanup());
            match tokio::time::timeout(timeout, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(join_err)) => {
                    self.gctx.metrics().incr("cleanup.panicked");
                    tracing::warn!(cleanup = ?id, error = %join_err, "cleanup panicked; swallowed");
                }
                Err(_) => {
                    task.abort();
                    self.gctx.metrics().incr("cleanup.timeout");
                    tracing::warn!(cleanup = ?id, "cleanup exceeded its deadline");
                }
            }
        }
        let settle_deadline = Instant::now() + timeout;
        while lctx.outstanding() > 0 {
            if Instant::now() >= settle_deadline {
                // Logged and swallowed; finalize proceeds regardless.
                let err = GatiError::CleanupTimeout {
                    request_id: lctx.request_id.clone(),
                };
                self.gctx.metrics().incr("cleanup.timeout");
                lctx.log(gati_core::observe::LogLevel::Warn, &err.to_string());
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}
