//! Local context: the per-request scratchpad.
//!
//! Exclusively owned by the orchestrator task of one request. User state
//! is an ordered map (insertion order matters for snapshot replay); hook
//! registrations live until the request terminates; snapshots form a
//! bounded LIFO. Nothing here is shared across requests.

use crate::error::HookPhase;
use crate::hook::Hook;
use crate::observe::{LogLevel, Logger};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Lifecycle phase of one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Received,
    Before,
    Handler,
    After,
    Catch,
    Finalized,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Received => "received",
            Phase::Before => "before",
            Phase::Handler => "handler",
            Phase::After => "after",
            Phase::Catch => "catch",
            Phase::Finalized => "finalized",
        }
    }
}

/// Identifier returned by hook and cleanup registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegistrationId(u64);

/// Token addressing one snapshot on the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotToken(u64);

/// A locally registered hook with its registration id.
pub struct LocalHook {
    pub id: RegistrationId,
    pub hook: Arc<dyn Hook>,
}

/// A finalize-time cleanup, registered on the local context. The shape
/// matches the runtime's shutdown hooks: consumed once, async body.
pub type CleanupFn = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;
type LocalSubscriber = Box<dyn Fn(&serde_json::Value) + Send>;

struct Snapshot {
    token: SnapshotToken,
    state: Vec<(String, serde_json::Value)>,
    hook_cursors: [usize; 3],
    phase: Phase,
    outstanding: u64,
}

/// Guard for an outstanding async operation tracked by the settle-before-
/// finalize invariant. Dropping the guard marks the operation settled.
pub struct PromiseGuard {
    counter: Arc<AtomicU64>,
}

impl Drop for PromiseGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Per-request state store, hook registry, and snapshot stack.
pub struct LocalContext {
    pub request_id: String,
    pub trace_id: String,
    pub client_id: String,
    logger: Logger,
    phase: Phase,
    transitions: Vec<Phase>,
    state: Vec<(String, serde_json::Value)>,
    before: Vec<LocalHook>,
    after: Vec<LocalHook>,
    catch: Vec<LocalHook>,
    cleanups: Vec<(RegistrationId, CleanupFn)>,
    snapshots: Vec<Snapshot>,
    snapshot_max: usize,
    /// Cursor per phase (before/after/catch), maintained by the
    /// orchestrator as it advances through hook lists.
    pub hook_cursors: [usize; 3],
    outstanding: Arc<AtomicU64>,
    subscribers: Vec<(String, LocalSubscriber)>,
    published: Vec<(String, serde_json::Value)>,
    next_registration: u64,
    next_token: u64,
}

impl LocalContext {
    pub fn new(
        request_id: impl Into<String>,
        trace_id: impl Into<String>,
        client_id: impl Into<String>,
        snapshot_max: usize,
    ) -> Self {
        let request_id = request_id.into();
        let trace_id = trace_id.into();
        let client_id = client_id.into();
        let logger = Logger::for_request(&request_id, &trace_id, &client_id);
        LocalContext {
            request_id,
            trace_id,
            client_id,
            logger,
            phase: Phase::Received,
            transitions: vec![Phase::Received],
            state: Vec::new(),
            before: Vec::new(),
            after: Vec::new(),
            catch: Vec::new(),
            cleanups: Vec::new(),
            snapshots: Vec::new(),
            snapshot_max,
            hook_cursors: [0; 3],
            outstanding: Arc::new(AtomicU64::new(0)),
            subscribers: Vec::new(),
            published: Vec::new(),
            next_registration: 0,
            next_token: 0,
        }
    }

    // ── User state ─────────────────────────────────────────────────────

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.state.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Insert or replace. Replacement keeps the key's original position so
    /// snapshot replay sees a stable order.
    pub fn set(&mut self, key: impl Into<String>, value: serde_json::Value) {
        let key = key.into();
        match self.state.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => *slot = value,
            None => self.state.push((key, value)),
        }
    }

    pub fn delete(&mut self, key: &str) -> bool {
        let before = self.state.len();
        self.state.retain(|(k, _)| k != key);
        self.state.len() != before
    }

    /// Clear user state. Metadata (ids, hooks, snapshots, phase) survives.
    pub fn clean(&mut self) {
        self.state.clear();
    }

    pub fn state_len(&self) -> usize {
        self.state.len()
    }

    /// The user-state entries in insertion order.
    pub fn entries(&self) -> &[(String, serde_json::Value)] {
        &self.state
    }

    // ── Phase tracking ─────────────────────────────────────────────────

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn set_phase(&mut self, phase: Phase) {
        self.phase = phase;
        self.transitions.push(phase);
    }

    /// Observed phase transitions since receipt, in order.
    pub fn transitions(&self) -> &[Phase] {
        &self.transitions
    }

    // ── Hook registration ──────────────────────────────────────────────

    pub fn register_before(&mut self, hook: Arc<dyn Hook>) -> RegistrationId {
        let id = self.next_registration_id();
        self.before.push(LocalHook { id, hook });
        id
    }

    pub fn register_after(&mut self, hook: Arc<dyn Hook>) -> RegistrationId {
        let id = self.next_registration_id();
        self.after.push(LocalHook { id, hook });
        id
    }

    pub fn register_catch(&mut self, hook: Arc<dyn Hook>) -> RegistrationId {
        let id = self.next_registration_id();
        self.catch.push(LocalHook { id, hook });
        id
    }

    pub fn local_hooks(&self, phase: HookPhase) -> &[LocalHook] {
        match phase {
            HookPhase::Before => &self.before,
            HookPhase::After => &self.after,
            HookPhase::Catch => &self.catch,
        }
    }

    /// Register a cleanup to run at finalize, in reverse registration
    /// order.
    pub fn register_cleanup<F, Fut>(&mut self, cleanup: F) -> RegistrationId
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = self.next_registration_id();
        self.cleanups
            .push((id, Box::new(move || Box::pin(cleanup()))));
        id
    }

    /// Drain cleanups for finalize, already reversed.
    pub fn take_cleanups(&mut self) -> Vec<(RegistrationId, CleanupFn)> {
        let mut cleanups = std::mem::take(&mut self.cleanups);
        cleanups.reverse();
        cleanups
    }

    // ── Snapshots ──────────────────────────────────────────────────────

    /// Capture user state, hook cursors, phase, and the advisory
    /// outstanding-promise count. Beyond the cap the oldest snapshot is
    /// evicted.
    pub fn snapshot(&mut self) -> SnapshotToken {
        let token = SnapshotToken(self.next_token);
        self.next_token += 1;
        self.snapshots.push(Snapshot {
            token,
            state: self.state.clone(),
            hook_cursors: self.hook_cursors,
            phase: self.phase,
            outstanding: self.outstanding.load(Ordering::SeqCst),
        });
        if self.snapshots.len() > self.snapshot_max {
            self.snapshots.remove(0);
        }
        token
    }

    /// Reinstall the state captured under `token`. Snapshots taken after it
    /// are discarded (LIFO discipline); the restored snapshot itself stays
    /// on the stack and can be restored again. Returns `false` when the
    /// token is unknown (evicted or never issued).
    pub fn restore(&mut self, token: SnapshotToken) -> bool {
        let Some(index) = self.snapshots.iter().position(|s| s.token == token) else {
            return false;
        };
        self.snapshots.truncate(index + 1);
        let snapshot = &self.snapshots[index];
        self.state = snapshot.state.clone();
        self.hook_cursors = snapshot.hook_cursors;
        self.phase = snapshot.phase;
        true
    }

    pub fn snapshot_count(&self) -> usize {
        self.snapshots.len()
    }

    /// Advisory outstanding count recorded in the given snapshot, for
    /// debug tooling.
    pub fn snapshot_outstanding(&self, token: SnapshotToken) -> Option<u64> {
        self.snapshots
            .iter()
            .find(|s| s.token == token)
            .map(|s| s.outstanding)
    }

    // ── Outstanding promises ───────────────────────────────────────────

    /// Track an async operation the request launched; finalize waits for
    /// all guards to drop (bounded by the settle deadline).
    pub fn track_async(&self) -> PromiseGuard {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        PromiseGuard {
            counter: self.outstanding.clone(),
        }
    }

    pub fn outstanding(&self) -> u64 {
        self.outstanding.load(Ordering::SeqCst)
    }

    pub(crate) fn outstanding_counter(&self) -> Arc<AtomicU64> {
        self.outstanding.clone()
    }

    // ── Request-local events ───────────────────────────────────────────

    /// Subscribe to events published on this request only. Subscribers die
    /// with the request; nothing crosses to other requests or tasks.
    pub fn subscribe_local<F>(&mut self, topic: impl Into<String>, subscriber: F)
    where
        F: Fn(&serde_json::Value) + Send + 'static,
    {
        self.subscribers.push((topic.into(), Box::new(subscriber)));
    }

    /// Publish an event scoped to this request.
    pub fn publish_local(&mut self, topic: &str, payload: serde_json::Value) {
        for (t, subscriber) in &self.subscribers {
            if t == topic {
                subscriber(&payload);
            }
        }
        self.published.push((topic.to_string(), payload));
    }

    /// Events published on this request, in order.
    pub fn published(&self) -> &[(String, serde_json::Value)] {
        &self.published
    }

    // ── Logging ────────────────────────────────────────────────────────

    /// Always tagged with request id, trace id, and client id.
    pub fn log(&self, level: LogLevel, message: &str) {
        self.logger.log(level, message);
    }

    pub fn log_info(&self, message: &str) {
        self.log(LogLevel::Info, message);
    }

    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    fn next_registration_id(&mut self) -> RegistrationId {
        let id = RegistrationId(self.next_registration);
        self.next_registration += 1;
        id
    }
}
