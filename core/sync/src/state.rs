//! Process-wide connectivity and sync-pass state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};

use offsync_storage::clock::from_millis;

/// Phase of the sync coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncPhase {
    /// No pass running.
    Idle,
    /// A pass is draining the queue.
    Syncing,
}

/// Shared flags read by the monitor, coordinator and façade.
///
/// `syncing` is the only mutual-exclusion mechanism between passes; it is
/// claimed through [`SyncState::try_begin_pass`] and released when the
/// returned guard drops, including on early return or panic.
#[derive(Debug)]
pub struct SyncState {
    online: AtomicBool,
    syncing: AtomicBool,
    /// Unix millis of the last fully successful pass, `i64::MIN` if none.
    last_success: AtomicI64,
    /// Consecutive pass-level failures.
    pass_attempt: AtomicU32,
}

impl SyncState {
    pub fn new(online: bool) -> Self {
        Self {
            online: AtomicBool::new(online),
            syncing: AtomicBool::new(false),
            last_success: AtomicI64::new(i64::MIN),
            pass_attempt: AtomicU32::new(0),
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Record connectivity; returns the previous value.
    pub fn set_online(&self, online: bool) -> bool {
        self.online.swap(online, Ordering::SeqCst)
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::SeqCst)
    }

    pub fn phase(&self) -> SyncPhase {
        if self.is_syncing() {
            SyncPhase::Syncing
        } else {
            SyncPhase::Idle
        }
    }

    /// Move `Idle -> Syncing`. Returns `None` if a pass is already running.
    pub fn try_begin_pass(&self) -> Option<PassGuard<'_>> {
        self.syncing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| PassGuard { state: self })
    }

    pub fn last_successful_sync(&self) -> Option<DateTime<Utc>> {
        match self.last_success.load(Ordering::SeqCst) {
            i64::MIN => None,
            millis => Some(from_millis(millis)),
        }
    }

    /// Record a fully successful pass and reset the backoff stage.
    pub fn record_success(&self, at: DateTime<Utc>) {
        self.last_success.store(at.timestamp_millis(), Ordering::SeqCst);
        self.pass_attempt.store(0, Ordering::SeqCst);
    }

    /// Current backoff stage.
    pub fn pass_attempt(&self) -> u32 {
        self.pass_attempt.load(Ordering::SeqCst)
    }

    /// Count a pass-level failure; returns the stage it was recorded at.
    pub fn record_pass_failure(&self) -> u32 {
        self.pass_attempt.fetch_add(1, Ordering::SeqCst)
    }

    /// Forget prior pass-level failures (external triggers start fresh).
    pub fn reset_pass_attempts(&self) {
        self.pass_attempt.store(0, Ordering::SeqCst);
    }
}

impl Default for SyncState {
    fn default() -> Self {
        Self::new(false)
    }
}

/// Holds the `Syncing` phase; dropping it returns the state to `Idle`.
#[derive(Debug)]
pub struct PassGuard<'a> {
    state: &'a SyncState,
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.state.syncing.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pass_guard_is_exclusive() {
        let state = SyncState::new(true);
        assert_eq!(state.phase(), SyncPhase::Idle);

        let guard = state.try_begin_pass().unwrap();
        assert_eq!(state.phase(), SyncPhase::Syncing);
        assert!(state.try_begin_pass().is_none());

        drop(guard);
        assert_eq!(state.phase(), SyncPhase::Idle);
        assert!(state.try_begin_pass().is_some());
    }

    #[test]
    fn test_guard_released_on_panic() {
        let state = SyncState::new(true);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = state.try_begin_pass().unwrap();
            panic!("pass blew up");
        }));

        assert!(result.is_err());
        assert!(!state.is_syncing());
    }

    #[test]
    fn test_online_swap() {
        let state = SyncState::new(false);
        assert!(!state.set_online(true));
        assert!(state.set_online(true));
        assert!(state.is_online());
    }

    #[test]
    fn test_pass_attempts_and_success() {
        let state = SyncState::default();
        assert!(state.last_successful_sync().is_none());

        assert_eq!(state.record_pass_failure(), 0);
        assert_eq!(state.record_pass_failure(), 1);
        assert_eq!(state.pass_attempt(), 2);

        let now = from_millis(1_700_000_000_000);
        state.record_success(now);
        assert_eq!(state.pass_attempt(), 0);
        assert_eq!(state.last_successful_sync(), Some(now));
    }
}
