//! Failure injection for commit-path testing
//!
//! The store consults its [`FaultInjector`] at fixed points of the write
//! path. Nothing is armed by default, so production code pays one atomic
//! load per check.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Where a commit may be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPoint {
    /// Before the batch reaches the commit sink (write-ahead log)
    BeforeLog,
    /// After the sink accepted the batch, before the store applies it
    AfterLog,
}

/// Armed failures, consumed as they fire
#[derive(Debug, Default)]
pub struct FaultInjector {
    armed: AtomicBool,
    commit_failure: Mutex<Option<FailPoint>>,
    deadlocks: AtomicU32,
}

impl FaultInjector {
    /// Nothing armed
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next top-level commit at `point`
    pub fn fail_next_commit(&self, point: FailPoint) {
        *self.commit_failure.lock() = Some(point);
        self.armed.store(true, Ordering::Release);
    }

    /// Make the next `count` write-lock acquisitions report a deadlock
    pub fn inject_deadlocks(&self, count: u32) {
        self.deadlocks.store(count, Ordering::Release);
        self.armed.store(true, Ordering::Release);
    }

    /// Disarm everything
    pub fn clear(&self) {
        *self.commit_failure.lock() = None;
        self.deadlocks.store(0, Ordering::Release);
        self.armed.store(false, Ordering::Release);
    }

    pub(crate) fn take_commit_failure(&self, point: FailPoint) -> bool {
        if !self.armed.load(Ordering::Acquire) {
            return false;
        }
        let mut slot = self.commit_failure.lock();
        if *slot == Some(point) {
            *slot = None;
            true
        } else {
            false
        }
    }

    pub(crate) fn take_deadlock(&self) -> bool {
        if !self.armed.load(Ordering::Acquire) {
            return false;
        }
        self.deadlocks
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }
}
