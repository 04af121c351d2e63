//! Interception points on a processor instance.
//!
//! Every hook is optional; an unset hook behaves as documented on its field.

use std::sync::Arc;
use std::time::Duration;

use crate::budget::InvocationContext;
use crate::processor::PassReport;

pub type LockVeto = Arc<dyn Fn(InvocationContext) -> bool + Send + Sync>;
pub type TimeLimitOverride = Arc<dyn Fn(Duration) -> Duration + Send + Sync>;
pub type MemoryOverride = Arc<dyn Fn(bool) -> bool + Send + Sync>;
pub type DispatchVeto = Arc<dyn Fn(u64) -> bool + Send + Sync>;
pub type PassObserver = Arc<dyn Fn(&PassReport) + Send + Sync>;

#[derive(Clone, Default)]
pub struct Hooks {
    /// Runs before lock acquisition; returning `false` skips the pass.
    /// Unset: every pass proceeds.
    pub before_lock: Option<LockVeto>,
    /// Maps the configured time limit to the one used for a pass.
    /// Unset: the configured limit.
    pub time_limit_override: Option<TimeLimitOverride>,
    /// Sees the computed memory verdict and may change it.
    /// Unset: the computed verdict.
    pub memory_exceeded_override: Option<MemoryOverride>,
    /// Receives the remaining batch count before a continuation is fired;
    /// returning `false` suppresses it (the health check still restarts the
    /// queue later). Unset: always continue.
    pub before_dispatch: Option<DispatchVeto>,
    /// Observes the report of every pass that took the lock. Unset: no-op.
    pub after_pass: Option<PassObserver>,
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn before_lock(mut self, f: impl Fn(InvocationContext) -> bool + Send + Sync + 'static) -> Self {
        self.before_lock = Some(Arc::new(f));
        self
    }

    pub fn time_limit_override(mut self, f: impl Fn(Duration) -> Duration + Send + Sync + 'static) -> Self {
        self.time_limit_override = Some(Arc::new(f));
        self
    }

    pub fn memory_exceeded_override(mut self, f: impl Fn(bool) -> bool + Send + Sync + 'static) -> Self {
        self.memory_exceeded_override = Some(Arc::new(f));
        self
    }

    pub fn before_dispatch(mut self, f: impl Fn(u64) -> bool + Send + Sync + 'static) -> Self {
        self.before_dispatch = Some(Arc::new(f));
        self
    }

    pub fn after_pass(mut self, f: impl Fn(&PassReport) + Send + Sync + 'static) -> Self {
        self.after_pass = Some(Arc::new(f));
        self
    }

    pub(crate) fn allow_lock(&self, context: InvocationContext) -> bool {
        self.before_lock.as_ref().map_or(true, |f| f(context))
    }

    pub(crate) fn time_limit(&self, configured: Duration) -> Duration {
        self.time_limit_override.as_ref().map_or(configured, |f| f(configured))
    }

    pub(crate) fn memory_exceeded(&self, computed: bool) -> bool {
        self.memory_exceeded_override.as_ref().map_or(computed, |f| f(computed))
    }

    pub(crate) fn allow_dispatch(&self, remaining_batches: u64) -> bool {
        self.before_dispatch.as_ref().map_or(true, |f| f(remaining_batches))
    }

    pub(crate) fn observe(&self, report: &PassReport) {
        if let Some(f) = &self.after_pass {
            f(report);
        }
    }
}

impl std::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hooks")
            .field("before_lock", &self.before_lock.is_some())
            .field("time_limit_override", &self.time_limit_override.is_some())
            .field("memory_exceeded_override", &self.memory_exceeded_override.is_some())
            .field("before_dispatch", &self.before_dispatch.is_some())
            .field("after_pass", &self.after_pass.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_hooks_use_defaults() {
        let hooks = Hooks::new();
        assert!(hooks.allow_lock(InvocationContext::Trigger));
        assert_eq!(hooks.time_limit(Duration::from_secs(20)), Duration::from_secs(20));
        assert!(hooks.memory_exceeded(true));
        assert!(!hooks.memory_exceeded(false));
        assert!(hooks.allow_dispatch(3));
    }

    #[test]
    fn set_hooks_intercept() {
        let hooks = Hooks::new()
            .before_lock(|ctx| ctx != InvocationContext::HealthCheck)
            .time_limit_override(|d| d * 2)
            .memory_exceeded_override(|_| false)
            .before_dispatch(|remaining| remaining < 10);

        assert!(!hooks.allow_lock(InvocationContext::HealthCheck));
        assert!(hooks.allow_lock(InvocationContext::Cli));
        assert_eq!(hooks.time_limit(Duration::from_secs(20)), Duration::from_secs(40));
        assert!(!hooks.memory_exceeded(true));
        assert!(!hooks.allow_dispatch(10));
    }
}
