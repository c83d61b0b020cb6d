//! Hook and handler registries.
//!
//! Hooks live in flat ordered vectors with a scope tag: global hooks run
//! for every request, route-scoped hooks are referenced by id from handler
//! manifests, and locally registered hooks live on the request's local
//! context. There is no hook graph; execution order is the concatenation
//! in scope order.

use gati_core::error::HookPhase;
use gati_core::handler::Handler;
use gati_core::hook::Hook;
use std::collections::HashMap;
use std::sync::Arc;

/// Process-wide hook registry, assembled by the runtime builder.
#[derive(Default)]
pub struct HookRegistry {
    global_before: Vec<Arc<dyn Hook>>,
    global_after: Vec<Arc<dyn Hook>>,
    global_catch: Vec<Arc<dyn Hook>>,
    named: HashMap<String, Arc<dyn Hook>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a hook that runs for every request, in registration order.
    pub fn register_global(&mut self, phase: HookPhase, hook: Arc<dyn Hook>) {
        match phase {
            HookPhase::Before => self.global_before.push(hook),
            HookPhase::After => self.global_after.push(hook),
            HookPhase::Catch => self.global_catch.push(hook),
        }
    }

    /// Register a named hook that manifests can bind by id.
    pub fn register_named(&mut self, hook: Arc<dyn Hook>) {
        self.named.insert(hook.id().to_string(), hook);
    }

    pub fn global(&self, phase: HookPhase) -> &[Arc<dyn Hook>] {
        match phase {
            HookPhase::Before => &self.global_before,
            HookPhase::After => &self.global_after,
            HookPhase::Catch => &self.global_catch,
        }
    }

    /// Resolve manifest hook ids to hooks, preserving order. Unknown ids
    /// are logged and skipped; `validate` catches them at startup.
    pub fn resolve(&self, ids: &[String]) -> Vec<Arc<dyn Hook>> {
        ids.iter()
            .filter_map(|id| match self.named.get(id) {
                Some(hook) => Some(hook.clone()),
                None => {
                    tracing::warn!(hook_id = %id, "manifest references unknown hook");
                    None
                }
            })
            .collect()
    }

    /// Every id must resolve; used when activating manifests.
    pub fn validate(&self, ids: &[String]) -> Result<(), String> {
        for id in ids {
            if !self.named.contains_key(id) {
                return Err(format!("unknown hook id '{id}'"));
            }
        }
        Ok(())
    }
}

/// Handler id to implementation.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn Handler>) {
        self.handlers.insert(handler.id().to_string(), handler);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
