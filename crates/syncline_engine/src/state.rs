//! Worker state, statistics, and the state shared across restarts.

use crate::queue::ChangeQueue;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use syncline_protocol::ChangeNotification;

/// The current state of the sync worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Waiting for queued changes or the poll deadline.
    Idle,
    /// Pulling notifications off the queue and building messages.
    Draining,
    /// Waiting for the remote authority to answer.
    Dispatching,
    /// Applying the responses to local storage.
    Applying,
    /// Waiting out a retry delay after a transport failure.
    Backoff,
    /// The worker died; the supervisor is about to restart it.
    Failed,
    /// The worker was shut down cleanly (or never started).
    Stopped,
}

impl SyncState {
    /// Returns true while a cycle is in progress.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SyncState::Draining | SyncState::Dispatching | SyncState::Applying
        )
    }
}

/// Statistics about sync operations.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Cycles that dispatched a batch, whatever the outcome.
    pub cycles_completed: u64,
    /// Cycles the remote authority did not fully process.
    pub partial_cycles: u64,
    /// Cycles that failed in transport (including timeouts).
    pub transport_failures: u64,
    /// `ChangesHappened` messages sent.
    pub changes_sent: u64,
    /// `BriefMe` messages sent.
    pub brief_me_sent: u64,
    /// Responses applied to local storage.
    pub responses_applied: u64,
    /// Responses that could not be applied.
    pub apply_failures: u64,
    /// Notifications skipped (entity vanished, nothing outstanding, errors).
    pub items_skipped: u64,
    /// Notifications put back on the queue for a later cycle.
    pub items_requeued: u64,
    /// Notifications abandoned after faulting the worker too many times.
    pub items_dropped: u64,
    /// Worker restarts performed by the supervisor.
    pub restarts: u64,
    /// Batch size the worker will use for its next cycle.
    pub batch_size: usize,
    /// When the last cycle finished.
    pub last_sync_time: Option<Instant>,
    /// Last error message.
    pub last_error: Option<String>,
}

/// Result of one sync cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncCycleResult {
    /// Notifications drained from the queue.
    pub drained: usize,
    /// `ChangesHappened` messages dispatched.
    pub changes_sent: usize,
    /// `BriefMe` messages dispatched.
    pub brief_me_sent: usize,
    /// Responses applied.
    pub applied: usize,
    /// Responses that failed to apply.
    pub apply_failures: usize,
    /// Notifications put back on the queue.
    pub requeued: usize,
    /// Whether the remote authority processed the whole batch.
    pub complete: bool,
    /// Batch size after adjustment.
    pub batch_size: usize,
    /// Duration of the cycle.
    pub duration: Duration,
}

/// State owned outside any single worker's lifetime.
///
/// The queue, the in-flight slot, and the published status survive worker
/// restarts; the batch size does not.
#[derive(Debug)]
pub(crate) struct WorkerShared {
    pub(crate) queue: Arc<ChangeQueue>,
    pub(crate) in_flight: Mutex<Vec<ChangeNotification>>,
    fault_counts: Mutex<HashMap<ChangeNotification, u32>>,
    state: RwLock<SyncState>,
    stats: RwLock<SyncStats>,
    live_workers: AtomicUsize,
}

impl WorkerShared {
    pub(crate) fn new(queue: Arc<ChangeQueue>) -> Self {
        Self {
            queue,
            in_flight: Mutex::new(Vec::new()),
            fault_counts: Mutex::new(HashMap::new()),
            state: RwLock::new(SyncState::Stopped),
            stats: RwLock::new(SyncStats {
                batch_size: 1,
                ..SyncStats::default()
            }),
            live_workers: AtomicUsize::new(0),
        }
    }

    pub(crate) fn state(&self) -> SyncState {
        *self.state.read()
    }

    pub(crate) fn set_state(&self, state: SyncState) {
        *self.state.write() = state;
    }

    pub(crate) fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    pub(crate) fn update_stats(&self, f: impl FnOnce(&mut SyncStats)) {
        f(&mut self.stats.write());
    }

    pub(crate) fn live_workers(&self) -> usize {
        self.live_workers.load(Ordering::SeqCst)
    }

    /// Moves the in-flight notifications back to the head of the queue.
    pub(crate) fn recover_in_flight(&self) -> usize {
        let items = std::mem::take(&mut *self.in_flight.lock());
        let count = items.len();
        self.queue.requeue_front(items);
        count
    }

    /// Recovers the in-flight notifications after the worker died.
    ///
    /// Every notification that was in flight is charged one fault. Those
    /// that reach `max_faults` are dropped; the rest go to the tail of the
    /// queue so a poisoned item cannot starve the work behind it.
    pub(crate) fn recover_after_fault(&self, max_faults: u32) -> Recovery {
        let items = std::mem::take(&mut *self.in_flight.lock());
        let mut counts = self.fault_counts.lock();
        let mut requeue = Vec::with_capacity(items.len());
        let mut dropped = Vec::new();

        for item in items {
            if requeue.contains(&item) || dropped.contains(&item) {
                continue;
            }
            let faults = counts.entry(item).or_insert(0);
            *faults += 1;
            if *faults >= max_faults {
                counts.remove(&item);
                dropped.push(item);
            } else {
                requeue.push(item);
            }
        }
        drop(counts);

        let requeued = requeue.len();
        self.queue.requeue_back(requeue);
        Recovery { requeued, dropped }
    }

    /// Forgets past faults of notifications that went through a cycle.
    pub(crate) fn clear_faults(&self, items: &[ChangeNotification]) {
        let mut counts = self.fault_counts.lock();
        if counts.is_empty() {
            return;
        }
        for item in items {
            counts.remove(item);
        }
    }

    /// Ends a cycle that returned normally.
    pub(crate) fn settle_in_flight(&self) {
        let items = std::mem::take(&mut *self.in_flight.lock());
        self.clear_faults(&items);
    }
}

/// Outcome of [`WorkerShared::recover_after_fault`].
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct Recovery {
    pub(crate) requeued: usize,
    pub(crate) dropped: Vec<ChangeNotification>,
}

/// Counts a worker as live for as long as it exists, panics included.
pub(crate) struct LiveGuard {
    shared: Arc<WorkerShared>,
}

impl LiveGuard {
    pub(crate) fn new(shared: Arc<WorkerShared>) -> Self {
        shared.live_workers.fetch_add(1, Ordering::SeqCst);
        Self { shared }
    }
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.shared.live_workers.fetch_sub(1, Ordering::SeqCst);
    }
}
