//! Run counters - launched, completed and errored scripts

use super::events::{Observers, RunnerEvent, SubscriptionId};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

const SETTLE_POLL: Duration = Duration::from_millis(20);

/// Counts the aggregator does not own; supplied by the caller per snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SnapshotContext {
    pub total: u64,
    pub selected: u64,
    pub running: u64,
}

/// Point-in-time view of the run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub total: u64,
    pub selected: u64,
    pub running: u64,
    pub launched: u64,
    pub completed: u64,
    pub errors: u64,
}

impl StatsSnapshot {
    /// Scripts that have finished, successfully or not
    pub fn finished(&self) -> u64 {
        self.completed + self.errors
    }
}

/// Atomic run counters with change notification
pub struct StatsAggregator {
    launched: AtomicU64,
    completed: AtomicU64,
    errors: AtomicU64,
    // Increments share it, reset takes it exclusively so a reset is
    // never half-visible.
    reset_gate: RwLock<()>,
    observers: Observers<StatsSnapshot>,
}

impl StatsAggregator {
    pub fn new() -> Self {
        Self {
            launched: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            reset_gate: RwLock::new(()),
            observers: Observers::new(),
        }
    }

    pub fn increment_launched(&self, n: u64) {
        self.add(&self.launched, n);
    }

    pub fn increment_completed(&self, n: u64) {
        self.add(&self.completed, n);
    }

    pub fn increment_errors(&self, n: u64) {
        self.add(&self.errors, n);
    }

    fn add(&self, counter: &AtomicU64, n: u64) {
        if n == 0 {
            return;
        }
        {
            let _shared = self.reset_gate.read().unwrap_or_else(PoisonError::into_inner);
            counter.fetch_add(n, Ordering::AcqRel);
        }
        self.notify(SnapshotContext::default());
    }

    /// Current counters combined with the caller's derived counts
    pub fn snapshot(&self, context: SnapshotContext) -> StatsSnapshot {
        let _shared = self.reset_gate.read().unwrap_or_else(PoisonError::into_inner);
        StatsSnapshot {
            total: context.total,
            selected: context.selected,
            running: context.running,
            launched: self.launched.load(Ordering::Acquire),
            completed: self.completed.load(Ordering::Acquire),
            errors: self.errors.load(Ordering::Acquire),
        }
    }

    /// Zero all counters as one step
    pub fn reset(&self) {
        {
            let _exclusive = self.reset_gate.write().unwrap_or_else(PoisonError::into_inner);
            self.launched.store(0, Ordering::Release);
            self.completed.store(0, Ordering::Release);
            self.errors.store(0, Ordering::Release);
        }
        self.notify(SnapshotContext::default());
    }

    /// Wait until every launched script has been counted as finished.
    ///
    /// Returns `false` if `limit` passes first.
    pub async fn wait_finished(&self, limit: Duration) -> bool {
        let settled = async {
            loop {
                let snapshot = self.snapshot(SnapshotContext::default());
                if snapshot.finished() >= snapshot.launched {
                    return;
                }
                tokio::time::sleep(SETTLE_POLL).await;
            }
        };
        tokio::time::timeout(limit, settled).await.is_ok()
    }

    /// Drive the counters from runner events.
    ///
    /// Exit code 0 counts as completed; any other or unknown code is an error.
    pub fn record_event(&self, event: &RunnerEvent) {
        match event {
            RunnerEvent::Started { .. } => self.increment_launched(1),
            RunnerEvent::Exited {
                exit_code: Some(0), ..
            } => self.increment_completed(1),
            RunnerEvent::Exited { .. } => self.increment_errors(1),
            RunnerEvent::Output { .. } => {}
        }
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&StatsSnapshot) + Send + Sync + 'static,
    {
        self.observers.subscribe(callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.observers.unsubscribe(id)
    }

    fn notify(&self, context: SnapshotContext) {
        if self.observers.is_empty() {
            return;
        }
        let snapshot = self.snapshot(context);
        self.observers.publish(&snapshot);
    }
}

impl Default for StatsAggregator {
    fn default() -> Self {
        Self::new()
    }
}
