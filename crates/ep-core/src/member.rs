//! Per-tag member state shared across all frontends.
//!
//! Failure counters, the blacklist state machine and the active-connection
//! gauge live here, keyed by node tag, so a node failing in pool mode is
//! equally unhealthy behind its multi-port listener (hybrid mode depends on
//! this). The registry is a plain value owned by the runtime and handed to
//! the monitor and every frontend; it holds only weak links to the
//! monitor-owned entry handles.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::monitor::EntryHandle;

/// Result of one `record_failure` call.
#[derive(Debug, Clone, Copy)]
pub struct FailureOutcome {
    /// Failure count after the increment (0 when the blacklist triggered).
    pub count: u32,
    pub triggered: bool,
    pub until: Option<Instant>,
}

#[derive(Default)]
struct MemberInner {
    failures: u32,
    blacklisted: bool,
    blacklisted_until: Option<Instant>,
    entry: Weak<EntryHandle>,
}

/// Failure/blacklist/active bookkeeping for one tag.
#[derive(Default)]
pub struct MemberState {
    inner: Mutex<MemberInner>,
    active: AtomicI64,
}

impl MemberState {
    /// Wire up the monitor's entry so state transitions become visible in
    /// snapshots. The link is weak; the monitor owns the handle.
    pub fn attach_entry(&self, entry: &Arc<EntryHandle>) {
        self.inner.lock().entry = Arc::downgrade(entry);
    }

    fn entry(&self) -> Option<Arc<EntryHandle>> {
        self.inner.lock().entry.upgrade()
    }

    /// Count a failure; at `threshold` the failure counter resets and the
    /// tag enters the blacklist until `now + duration`.
    pub fn record_failure(
        &self,
        cause: &str,
        threshold: u32,
        duration: Duration,
    ) -> FailureOutcome {
        let (outcome, entry) = {
            let mut inner = self.inner.lock();
            inner.failures += 1;
            let mut outcome = FailureOutcome {
                count: inner.failures,
                triggered: false,
                until: None,
            };
            if inner.failures >= threshold {
                let until = Instant::now() + duration;
                inner.failures = 0;
                inner.blacklisted = true;
                inner.blacklisted_until = Some(until);
                outcome.count = 0;
                outcome.triggered = true;
                outcome.until = Some(until);
            }
            (outcome, inner.entry.upgrade())
        };

        if let Some(entry) = entry {
            entry.record_failure(cause);
            if outcome.triggered {
                entry.blacklist();
            }
        }
        outcome
    }

    pub fn record_success(&self) {
        let entry = {
            let mut inner = self.inner.lock();
            inner.failures = 0;
            inner.entry.upgrade()
        };
        if let Some(entry) = entry {
            entry.record_success();
        }
    }

    /// Read-through lazy expiry: observing an expired blacklist clears it.
    /// This is the sole path by which a node re-enters rotation without an
    /// external event.
    pub fn is_blacklisted(&self, now: Instant) -> bool {
        let (blacklisted, expired, entry) = {
            let mut inner = self.inner.lock();
            let expired = inner.blacklisted
                && inner.blacklisted_until.map_or(true, |until| now > until);
            if expired {
                inner.blacklisted = false;
                inner.blacklisted_until = None;
            }
            (inner.blacklisted, expired, inner.entry.upgrade())
        };
        if expired {
            if let Some(entry) = entry {
                entry.clear_blacklist();
            }
        }
        blacklisted
    }

    /// Clear everything, used by the control plane's unblacklist.
    pub fn force_release(&self) {
        let entry = {
            let mut inner = self.inner.lock();
            inner.failures = 0;
            inner.blacklisted = false;
            inner.blacklisted_until = None;
            inner.entry.upgrade()
        };
        if let Some(entry) = entry {
            entry.clear_blacklist();
        }
    }

    pub fn inc_active(&self) {
        self.active.fetch_add(1, Ordering::Relaxed);
        if let Some(entry) = self.entry() {
            entry.inc_active();
        }
    }

    pub fn dec_active(&self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
        if let Some(entry) = self.entry() {
            entry.dec_active();
        }
    }

    pub fn active_count(&self) -> i64 {
        self.active.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub(crate) fn failures(&self) -> u32 {
        self.inner.lock().failures
    }
}

/// RAII active-connection increment; the gauge returns to its prior value
/// on every exit path of a tunnel.
pub struct ActiveGuard(Arc<MemberState>);

impl ActiveGuard {
    pub fn new(state: Arc<MemberState>) -> Self {
        state.inc_active();
        Self(state)
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.dec_active();
    }
}

/// Process-wide `tag → MemberState` mapping, concurrent, created lazily.
#[derive(Default)]
pub struct MemberRegistry {
    store: DashMap<String, Arc<MemberState>>,
}

impl MemberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get-or-create, atomic.
    pub fn acquire(&self, tag: &str) -> Arc<MemberState> {
        self.store
            .entry(tag.to_string())
            .or_default()
            .clone()
    }

    pub fn lookup(&self, tag: &str) -> Option<Arc<MemberState>> {
        self.store.get(tag).map(|s| s.clone())
    }

    /// Lazy-expiring blacklist check for a tag; unknown tags are clean.
    pub fn is_blacklisted(&self, tag: &str, now: Instant) -> bool {
        self.lookup(tag).is_some_and(|s| s.is_blacklisted(now))
    }

    pub fn force_release(&self, tag: &str) -> bool {
        match self.lookup(tag) {
            Some(state) => {
                state.force_release();
                true
            }
            None => false,
        }
    }

    /// Wholesale clear, used on config reload.
    pub fn reset(&self) {
        self.store.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const D: Duration = Duration::from_secs(60);

    #[test]
    fn blacklist_triggers_at_threshold_and_resets_counter() {
        let state = MemberState::default();
        let before = Instant::now();

        let first = state.record_failure("dial", 3, D);
        assert_eq!(first.count, 1);
        assert!(!first.triggered);
        let second = state.record_failure("dial", 3, D);
        assert_eq!(second.count, 2);
        assert!(!second.triggered);

        let third = state.record_failure("dial", 3, D);
        assert!(third.triggered);
        assert_eq!(third.count, 0);
        let until = third.until.unwrap();
        assert!(until > before);
        assert_eq!(state.failures(), 0);
        assert!(state.is_blacklisted(Instant::now()));
    }

    #[test]
    fn success_resets_the_streak() {
        let state = MemberState::default();
        state.record_failure("dial", 3, D);
        state.record_failure("dial", 3, D);
        state.record_success();
        let outcome = state.record_failure("dial", 3, D);
        assert_eq!(outcome.count, 1);
        assert!(!outcome.triggered);
    }

    #[test]
    fn blacklist_expires_on_read() {
        let state = MemberState::default();
        let outcome = state.record_failure("dial", 1, Duration::from_millis(10));
        assert!(outcome.triggered);
        assert!(state.is_blacklisted(Instant::now()));

        let later = Instant::now() + Duration::from_millis(20);
        assert!(!state.is_blacklisted(later));
        // deadline cleared, not just hidden
        assert!(!state.is_blacklisted(Instant::now()));
    }

    #[test]
    fn force_release_clears_everything() {
        let state = MemberState::default();
        state.record_failure("dial", 1, D);
        assert!(state.is_blacklisted(Instant::now()));
        state.force_release();
        assert!(!state.is_blacklisted(Instant::now()));
        assert_eq!(state.failures(), 0);
    }

    #[test]
    fn active_guard_conserves_the_gauge() {
        let registry = MemberRegistry::new();
        let state = registry.acquire("t");
        {
            let _a = ActiveGuard::new(state.clone());
            let _b = ActiveGuard::new(state.clone());
            assert_eq!(state.active_count(), 2);
        }
        assert_eq!(state.active_count(), 0);
    }

    #[test]
    fn acquire_is_get_or_create() {
        let registry = MemberRegistry::new();
        let a = registry.acquire("x");
        let b = registry.acquire("x");
        assert!(Arc::ptr_eq(&a, &b));
        registry.reset();
        assert!(registry.lookup("x").is_none());
    }
}
