use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, PoisonError};

use rand::Rng;

use crate::module::BackendEndpoint;

/// What a selection policy may look at when picking a backend.
#[derive(Debug, Clone, Copy)]
pub struct RequestContext<'a> {
    pub module: &'a str,
    /// Stage issuing the call, when dispatched from a pipeline.
    pub stage: Option<&'a str>,
    /// Caller's preferred instance type. Opaque to every policy but
    /// [`PreferInstanceType`].
    pub instance_type_hint: Option<&'a str>,
    /// Calls currently in flight per candidate, index-aligned with the candidates.
    pub in_flight: &'a [usize],
    /// 0 for the first attempt, incremented per retry.
    pub attempt: u32,
}

/// Picks one backend instance out of a module's candidates.
pub trait SelectionPolicy: Send + Sync + fmt::Debug {
    /// Return the index of the chosen candidate, or `None` to refuse the call.
    fn select(&self, candidates: &[BackendEndpoint], ctx: &RequestContext<'_>) -> Option<usize>;

    /// Drop any state kept for `module` after it is removed.
    fn forget_module(&self, _module: &str) {}
}

/// Cycles through a module's backends, one counter per module.
#[derive(Debug, Default)]
pub struct RoundRobin {
    next: Mutex<HashMap<String, usize>>,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SelectionPolicy for RoundRobin {
    fn select(&self, candidates: &[BackendEndpoint], ctx: &RequestContext<'_>) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        let mut next = self.next.lock().unwrap_or_else(PoisonError::into_inner);
        let counter = next.entry(ctx.module.to_string()).or_insert(0);
        let idx = *counter % candidates.len();
        *counter = counter.wrapping_add(1);
        Some(idx)
    }

    fn forget_module(&self, module: &str) {
        self.next
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(module);
    }
}

/// Uniformly random choice.
#[derive(Debug, Default)]
pub struct RandomChoice;

impl SelectionPolicy for RandomChoice {
    fn select(&self, candidates: &[BackendEndpoint], _ctx: &RequestContext<'_>) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        Some(rand::thread_rng().gen_range(0..candidates.len()))
    }
}

/// Fewest calls in flight wins; ties go to the earliest candidate.
#[derive(Debug, Default)]
pub struct LeastInFlight;

impl SelectionPolicy for LeastInFlight {
    fn select(&self, candidates: &[BackendEndpoint], ctx: &RequestContext<'_>) -> Option<usize> {
        (0..candidates.len()).min_by_key(|&i| ctx.in_flight.get(i).copied().unwrap_or(0))
    }
}

/// Restricts the choice to backends of the hinted instance type, then
/// delegates to `inner`. Without a hint, or when no backend matches, all
/// candidates are offered to `inner`.
#[derive(Debug, Default)]
pub struct PreferInstanceType<P> {
    inner: P,
}

impl<P: SelectionPolicy> PreferInstanceType<P> {
    pub fn new(inner: P) -> Self {
        Self { inner }
    }
}

impl<P: SelectionPolicy> SelectionPolicy for PreferInstanceType<P> {
    fn select(&self, candidates: &[BackendEndpoint], ctx: &RequestContext<'_>) -> Option<usize> {
        let Some(hint) = ctx.instance_type_hint else {
            return self.inner.select(candidates, ctx);
        };
        let matching: Vec<usize> = candidates
            .iter()
            .enumerate()
            .filter(|(_, b)| b.instance_type == hint)
            .map(|(i, _)| i)
            .collect();
        if matching.is_empty() {
            return self.inner.select(candidates, ctx);
        }

        let subset: Vec<BackendEndpoint> =
            matching.iter().map(|&i| candidates[i].clone()).collect();
        let in_flight: Vec<usize> = matching
            .iter()
            .map(|&i| ctx.in_flight.get(i).copied().unwrap_or(0))
            .collect();
        let sub_ctx = RequestContext {
            in_flight: &in_flight,
            ..*ctx
        };
        self.inner
            .select(&subset, &sub_ctx)
            .and_then(|i| matching.get(i).copied())
    }

    fn forget_module(&self, module: &str) {
        self.inner.forget_module(module);
    }
}
