//! Change queue and wake signal.
//!
//! Producers append [`ChangeNotification`]s from any thread; the single sync
//! worker drains them. One mutex guards the queue and the wake flags, and
//! one condition variable wakes the worker when there is something to do.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use syncline_protocol::{ChangeNotification, EntityId, EntityType};

/// Why [`ChangeQueue::wait_for_work`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    /// The queue is non-empty.
    Work,
    /// The poll deadline passed.
    Deadline,
    /// The host asked for an immediate background sync.
    PollRequested,
    /// The queue was shut down.
    Shutdown,
}

#[derive(Debug, Default)]
struct QueueState {
    items: VecDeque<ChangeNotification>,
    poll_requested: bool,
    shutdown: bool,
}

/// Ordered, thread-safe queue of pending change notifications.
///
/// Duplicates are kept; the worker processes each entry independently.
#[derive(Debug, Default)]
pub struct ChangeQueue {
    state: Mutex<QueueState>,
    wake: Condvar,
}

impl ChangeQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a notification and wakes the worker.
    ///
    /// Never fails. Notifications enqueued after shutdown are kept but no
    /// longer processed.
    pub fn enqueue(&self, item: ChangeNotification) {
        self.state.lock().items.push_back(item);
        self.wake.notify_all();
    }

    /// Shorthand for enqueueing `(entity_id, entity_type)`.
    pub fn enqueue_change(&self, entity_id: EntityId, entity_type: EntityType) {
        self.enqueue(ChangeNotification::new(entity_id, entity_type));
    }

    /// Removes and returns up to `n` notifications in FIFO order.
    pub fn drain_up_to(&self, n: usize) -> Vec<ChangeNotification> {
        let mut state = self.state.lock();
        let take = n.min(state.items.len());
        state.items.drain(..take).collect()
    }

    /// Puts notifications back behind everything already queued.
    pub fn requeue_back(&self, items: Vec<ChangeNotification>) {
        if items.is_empty() {
            return;
        }
        self.state.lock().items.extend(items);
        self.wake.notify_all();
    }

    /// Puts notifications back at the head, preserving their order.
    pub fn requeue_front(&self, items: Vec<ChangeNotification>) {
        if items.is_empty() {
            return;
        }
        {
            let mut state = self.state.lock();
            for item in items.into_iter().rev() {
                state.items.push_front(item);
            }
        }
        self.wake.notify_all();
    }

    /// Returns the number of queued notifications.
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    /// Returns true if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    /// Wakes the worker and makes the next idle cycle poll the server.
    pub fn request_poll(&self) {
        self.state.lock().poll_requested = true;
        self.wake.notify_all();
    }

    /// Consumes a pending poll request.
    pub fn take_poll_request(&self) -> bool {
        std::mem::take(&mut self.state.lock().poll_requested)
    }

    /// Shuts the queue down, waking every waiter for good.
    pub fn shutdown(&self) {
        self.state.lock().shutdown = true;
        self.wake.notify_all();
    }

    /// Returns true once [`shutdown`](Self::shutdown) was called.
    pub fn is_shutdown(&self) -> bool {
        self.state.lock().shutdown
    }

    /// Blocks until there is work, the deadline passes, a poll is
    /// requested, or the queue shuts down.
    ///
    /// `None` waits without a deadline. Spurious wakeups re-check the
    /// conditions and keep waiting.
    pub fn wait_for_work(&self, deadline: Option<Instant>) -> WakeReason {
        let mut state = self.state.lock();
        loop {
            if state.shutdown {
                return WakeReason::Shutdown;
            }
            if !state.items.is_empty() {
                return WakeReason::Work;
            }
            if state.poll_requested {
                return WakeReason::PollRequested;
            }
            match deadline {
                Some(deadline) if Instant::now() >= deadline => return WakeReason::Deadline,
                Some(deadline) => {
                    self.wake.wait_until(&mut state, deadline);
                }
                None => self.wake.wait(&mut state),
            }
        }
    }

    /// Sleeps for `duration` unless the queue shuts down first.
    ///
    /// Enqueues do not cut the pause short. Returns true on shutdown.
    pub fn pause(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut state = self.state.lock();
        while !state.shutdown {
            if self.wake.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        state.shutdown
    }
}
