//! Bounded, cancellable network dispatch.
//!
//! The channel call runs on a short-lived helper thread while the worker
//! waits for its result with a deadline, checking for shutdown in between.
//! A channel that never returns therefore cannot wedge the worker: on
//! timeout the helper is abandoned and its late result is dropped. At most
//! one helper is outstanding; while an abandoned one is still stuck in the
//! channel, further dispatches fail fast instead of piling up threads.

use crate::error::{SyncError, SyncResult};
use crate::queue::ChangeQueue;
use crate::transport::RemoteChannel;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use syncline_protocol::{BatchReply, OutgoingMessage};
use tracing::warn;

/// How often a waiting dispatch checks for shutdown.
const CANCEL_CHECK_INTERVAL: Duration = Duration::from_millis(25);

/// Sends batches to the remote authority with a timeout.
///
/// Clones share the outstanding-helper slot, so a replacement worker still
/// sees a helper its predecessor abandoned.
#[derive(Clone)]
pub struct Dispatcher {
    channel: Arc<dyn RemoteChannel>,
    timeout: Duration,
    busy: Arc<AtomicBool>,
}

/// Releases the helper slot when the helper finishes, panics included.
struct BusyGuard(Arc<AtomicBool>);

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Dispatcher {
    /// Creates a dispatcher.
    pub fn new(channel: Arc<dyn RemoteChannel>, timeout: Duration) -> Self {
        Self {
            channel,
            timeout,
            busy: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Returns true while a helper thread is still inside the channel.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Returns the dispatch timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Sends one batch as a single round trip.
    ///
    /// Fails with [`SyncError::Timeout`] when the deadline passes and with
    /// [`SyncError::Cancelled`] when `queue` shuts down first. A panic
    /// inside the channel surfaces as [`SyncError::Fault`]. While an earlier
    /// helper has not returned yet, the batch is not sent and a retryable
    /// transport error is returned.
    pub fn dispatch(
        &self,
        batch: Vec<OutgoingMessage>,
        queue: &ChangeQueue,
    ) -> SyncResult<BatchReply> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("previous dispatch still in flight, skipping send");
            return Err(SyncError::transport_retryable(
                "previous dispatch still in flight",
            ));
        }
        let guard = BusyGuard(Arc::clone(&self.busy));

        let (tx, rx) = mpsc::sync_channel(1);
        let channel = Arc::clone(&self.channel);
        thread::Builder::new()
            .name("syncline-dispatch".into())
            .spawn(move || {
                let result = channel.send(&batch);
                drop(guard);
                // The worker may have given up already.
                let _ = tx.send(result);
            })?;

        let deadline = Instant::now() + self.timeout;
        loop {
            if queue.is_shutdown() {
                return Err(SyncError::Cancelled);
            }
            let now = Instant::now();
            if now >= deadline {
                warn!(timeout = ?self.timeout, "dispatch timed out");
                return Err(SyncError::Timeout);
            }
            match rx.recv_timeout((deadline - now).min(CANCEL_CHECK_INTERVAL)) {
                Ok(result) => return result,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(SyncError::Fault("dispatch thread died without a reply".into()))
                }
            }
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("timeout", &self.timeout)
            .field("busy", &self.is_busy())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MockChannel, MockStep};
    use syncline_protocol::EntityType;

    fn brief() -> Vec<OutgoingMessage> {
        vec![OutgoingMessage::BriefMe {
            entity_type: EntityType::new(1),
            last_synced: 0,
        }]
    }

    #[test]
    fn returns_reply() {
        let mock = Arc::new(MockChannel::new());
        let dispatcher = Dispatcher::new(mock.clone(), Duration::from_secs(5));
        let reply = dispatcher.dispatch(brief(), &ChangeQueue::new()).unwrap();
        assert!(reply.complete);
        assert_eq!(mock.call_count(), 1);
    }

    #[test]
    fn passes_transport_errors_through() {
        let mock = Arc::new(MockChannel::new());
        mock.fail_next("reset by peer");
        let dispatcher = Dispatcher::new(mock, Duration::from_secs(5));
        let err = dispatcher.dispatch(brief(), &ChangeQueue::new()).unwrap_err();
        assert!(matches!(err, SyncError::Transport { .. }));
    }

    #[test]
    fn stuck_channel_times_out() {
        let mock = Arc::new(MockChannel::new());
        mock.push_step(MockStep::Stall(Duration::from_secs(2)));
        let dispatcher = Dispatcher::new(mock, Duration::from_millis(50));

        let start = Instant::now();
        let err = dispatcher.dispatch(brief(), &ChangeQueue::new()).unwrap_err();
        assert!(matches!(err, SyncError::Timeout));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn abandoned_helper_blocks_further_sends() {
        let mock = Arc::new(MockChannel::new());
        mock.push_step(MockStep::Stall(Duration::from_millis(300)));
        let dispatcher = Dispatcher::new(mock.clone(), Duration::from_millis(30));
        let queue = ChangeQueue::new();

        let err = dispatcher.dispatch(brief(), &queue).unwrap_err();
        assert!(matches!(err, SyncError::Timeout));
        assert!(dispatcher.is_busy());

        // A clone, as handed to a replacement worker, sees the same helper.
        let err = dispatcher.clone().dispatch(brief(), &queue).unwrap_err();
        assert!(matches!(err, SyncError::Transport { .. }));
        assert_eq!(mock.call_count(), 1);

        thread::sleep(Duration::from_millis(400));
        assert!(!dispatcher.is_busy());
        assert!(dispatcher.dispatch(brief(), &queue).is_ok());
        assert_eq!(mock.call_count(), 2);
    }

    #[test]
    fn shutdown_cancels_the_wait() {
        let mock = Arc::new(MockChannel::new());
        mock.push_step(MockStep::Stall(Duration::from_secs(2)));
        let dispatcher = Dispatcher::new(mock, Duration::from_secs(30));
        let queue = Arc::new(ChangeQueue::new());

        let stopper = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                queue.shutdown();
            })
        };
        let err = dispatcher.dispatch(brief(), &queue).unwrap_err();
        stopper.join().unwrap();
        assert!(matches!(err, SyncError::Cancelled));
    }

    #[test]
    fn channel_panic_is_a_fault() {
        let mock = Arc::new(MockChannel::new());
        mock.push_step(MockStep::Panic("injected".into()));
        let dispatcher = Dispatcher::new(mock, Duration::from_secs(5));
        let err = dispatcher.dispatch(brief(), &ChangeQueue::new()).unwrap_err();
        assert!(err.is_fatal());
    }
}
