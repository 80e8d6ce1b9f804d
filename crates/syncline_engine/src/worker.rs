//! The sync worker loop.
//!
//! One cycle walks `Idle → Draining → Dispatching → Applying` and returns
//! to `Idle`. Per-item and transport failures end the cycle normally; only
//! a fault escapes [`SyncWorker::run`].

use crate::batch::BatchController;
use crate::builder::MessageBuilder;
use crate::config::SyncConfig;
use crate::dispatch::Dispatcher;
use crate::error::{SyncError, SyncResult};
use crate::state::{LiveGuard, SyncCycleResult, SyncState, WorkerShared};
use std::sync::Arc;
use std::time::Instant;
use syncline_protocol::{BatchReply, ChangeNotification, Entity, EntityType, ResponseMessage};
use tracing::{debug, info, warn};

/// A single sync worker.
///
/// Owns its batch size, so a replacement worker starts from the floor.
pub(crate) struct SyncWorker {
    shared: Arc<WorkerShared>,
    builder: Arc<MessageBuilder>,
    dispatcher: Dispatcher,
    config: SyncConfig,
    batch: BatchController,
    last_background_sync: Option<Instant>,
    /// Types of the current poll round the remote authority has not briefed yet.
    pending_brief: Vec<EntityType>,
    transport_failures: u32,
    _live: LiveGuard,
}

impl SyncWorker {
    pub(crate) fn new(
        shared: Arc<WorkerShared>,
        builder: Arc<MessageBuilder>,
        dispatcher: Dispatcher,
        config: SyncConfig,
    ) -> Self {
        let batch = BatchController::with_ceiling(config.max_batch_size);
        shared.update_stats(|stats| stats.batch_size = batch.current_size());
        Self {
            _live: LiveGuard::new(Arc::clone(&shared)),
            shared,
            builder,
            dispatcher,
            config,
            batch,
            last_background_sync: None,
            pending_brief: Vec::new(),
            transport_failures: 0,
        }
    }

    /// Runs cycles until the queue shuts down or a fault escapes.
    pub(crate) fn run(mut self) -> SyncResult<()> {
        info!(batch_size = self.batch.current_size(), "sync worker started");
        let queue = Arc::clone(&self.shared.queue);

        loop {
            self.shared.set_state(SyncState::Idle);
            let reason = queue.wait_for_work(Some(self.poll_deadline()));
            if queue.is_shutdown() {
                break;
            }
            debug!(?reason, "sync worker woke");

            match self.run_cycle() {
                Ok(_) => {}
                Err(SyncError::Cancelled) => break,
                Err(e) => return Err(e),
            }

            if self.transport_failures > 0 {
                let delay = self.config.retry.delay_for_attempt(self.transport_failures);
                self.shared.set_state(SyncState::Backoff);
                debug!(?delay, failures = self.transport_failures, "backing off");
                if queue.pause(delay) {
                    break;
                }
            }
        }

        self.shared.set_state(SyncState::Stopped);
        info!("sync worker stopped");
        Ok(())
    }

    fn poll_deadline(&self) -> Instant {
        match self.last_background_sync {
            Some(_) if !self.pending_brief.is_empty() => Instant::now(),
            Some(last) => last + self.config.poll_interval,
            None => Instant::now(),
        }
    }

    fn poll_due(&self) -> bool {
        self.last_background_sync
            .map_or(true, |last| last.elapsed() >= self.config.poll_interval)
    }

    /// Runs one drain-dispatch-apply cycle.
    ///
    /// Returns `None` if there was nothing to dispatch.
    pub(crate) fn run_cycle(&mut self) -> SyncResult<Option<SyncCycleResult>> {
        let start = Instant::now();
        let queue = Arc::clone(&self.shared.queue);

        self.shared.set_state(SyncState::Draining);
        let drained = queue.drain_up_to(self.batch.current_size());
        *self.shared.in_flight.lock() = drained.clone();

        let mut messages = Vec::with_capacity(drained.len());
        let mut sent: Vec<ChangeNotification> = Vec::with_capacity(drained.len());
        let mut skipped = 0u64;
        for item in &drained {
            match self
                .builder
                .build_changes_happened(item.entity_id, item.entity_type)
            {
                Ok(Some(message)) => {
                    messages.push(message);
                    sent.push(*item);
                }
                Ok(None) => skipped += 1,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(
                        entity_type = %item.entity_type,
                        entity_id = item.entity_id,
                        error = %e,
                        "could not build change message, skipping"
                    );
                    skipped += 1;
                }
            }
        }
        let attempted = messages.len();

        let mut previous_poll = None;
        if messages.is_empty() {
            let requested = queue.take_poll_request();
            if self.pending_brief.is_empty() && (requested || self.poll_due()) {
                self.pending_brief = self.builder.tracked_types().collect();
                previous_poll = Some(self.last_background_sync.replace(Instant::now()));
            }
            messages = self
                .pending_brief
                .iter()
                .map(|entity_type| self.builder.build_brief_me(*entity_type))
                .collect();
        }
        let brief_me = messages.len() - attempted;

        if messages.is_empty() {
            self.shared.settle_in_flight();
            self.shared
                .update_stats(|stats| stats.items_skipped += skipped);
            return Ok(None);
        }

        self.shared.set_state(SyncState::Dispatching);
        debug!(
            changes = attempted,
            brief_me,
            batch_size = self.batch.current_size(),
            "dispatching batch"
        );

        let mut result = SyncCycleResult {
            drained: drained.len(),
            changes_sent: attempted,
            brief_me_sent: brief_me,
            applied: 0,
            apply_failures: 0,
            requeued: 0,
            complete: false,
            batch_size: self.batch.current_size(),
            duration: start.elapsed(),
        };

        let reply = match self.dispatcher.dispatch(messages, &queue) {
            Ok(reply) => reply,
            Err(SyncError::Cancelled) => {
                self.shared.recover_in_flight();
                return Err(SyncError::Cancelled);
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!(error = %e, changes = attempted, "dispatch failed, retrying next cycle");
                if let Some(previous) = previous_poll {
                    self.last_background_sync = previous;
                    self.pending_brief.clear();
                }
                result.requeued = sent.len();
                queue.requeue_front(sent);
                self.shared.settle_in_flight();
                self.transport_failures = self.transport_failures.saturating_add(1);
                self.batch.on_cycle_complete(attempted, false);
                result.batch_size = self.batch.current_size();
                result.duration = start.elapsed();
                self.record(&result, skipped, true, Some(e.to_string()));
                return Ok(Some(result));
            }
        };
        self.transport_failures = 0;

        self.shared.set_state(SyncState::Applying);
        for response in &reply.responses {
            match self.apply(response) {
                Ok(()) => result.applied += 1,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(error = %e, "could not apply response");
                    result.apply_failures += 1;
                }
            }
        }

        if !reply.complete {
            let unsettled = unsettled(&sent, &reply);
            result.requeued = unsettled.len();
            queue.requeue_front(unsettled);
        }
        if brief_me > 0 {
            self.settle_briefs(&reply);
        }
        self.shared.settle_in_flight();

        self.batch.on_cycle_complete(attempted, reply.complete);
        result.complete = reply.complete;
        result.batch_size = self.batch.current_size();
        result.duration = start.elapsed();

        debug!(
            applied = result.applied,
            complete = result.complete,
            requeued = result.requeued,
            batch_size = result.batch_size,
            "cycle complete"
        );
        self.record(&result, skipped, false, None);
        Ok(Some(result))
    }

    /// Drops the briefed types from the poll round.
    ///
    /// A truncated reply keeps the types it carries no watermark for, so the
    /// next cycle asks for those alone.
    fn settle_briefs(&mut self, reply: &BatchReply) {
        if reply.complete {
            self.pending_brief.clear();
            return;
        }
        self.pending_brief.retain(|entity_type| {
            !reply.responses.iter().any(|response| {
                matches!(
                    response,
                    ResponseMessage::Watermark { entity_type: t, .. } if t == entity_type
                )
            })
        });
        if !self.pending_brief.is_empty() {
            debug!(remaining = self.pending_brief.len(), "poll round truncated");
        }
    }

    fn apply(&self, response: &ResponseMessage) -> SyncResult<()> {
        match response {
            ResponseMessage::Acknowledged {
                entity_type,
                entity_id,
                through,
            } => self
                .builder
                .store(*entity_type)?
                .acknowledge(*entity_id, *through),
            ResponseMessage::RemoteChanges {
                entity_type,
                entity_id,
                delta,
            } => {
                let store = self.builder.store(*entity_type)?;
                let entity = store
                    .load(*entity_id)?
                    .unwrap_or_else(|| Entity::new(*entity_id, *entity_type));
                store.apply_remote_update(entity, delta)
            }
            ResponseMessage::Rejected {
                entity_type,
                entity_id,
                reason,
            } => {
                warn!(%entity_type, entity_id, reason = %reason, "change rejected by server");
                Ok(())
            }
            ResponseMessage::Watermark {
                entity_type,
                timestamp,
            } => {
                let watermarks = self.builder.watermarks();
                if *timestamp > watermarks.get(*entity_type)? {
                    watermarks.set(*entity_type, *timestamp)?;
                }
                Ok(())
            }
        }
    }

    fn record(
        &self,
        result: &SyncCycleResult,
        skipped: u64,
        transport_failed: bool,
        error: Option<String>,
    ) {
        self.shared.update_stats(|stats| {
            stats.cycles_completed += 1;
            if !result.complete {
                stats.partial_cycles += 1;
            }
            if transport_failed {
                stats.transport_failures += 1;
            } else {
                stats.changes_sent += result.changes_sent as u64;
                stats.brief_me_sent += result.brief_me_sent as u64;
            }
            stats.responses_applied += result.applied as u64;
            stats.apply_failures += result.apply_failures as u64;
            stats.items_skipped += skipped;
            stats.items_requeued += result.requeued as u64;
            stats.batch_size = result.batch_size;
            stats.last_sync_time = Some(Instant::now());
            if error.is_some() {
                stats.last_error = error;
            }
        });
    }
}

/// Notifications whose change the reply neither acknowledged nor rejected.
fn unsettled(sent: &[ChangeNotification], reply: &BatchReply) -> Vec<ChangeNotification> {
    sent.iter()
        .filter(|n| !reply.settles(n.entity_type, n.entity_id))
        .copied()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::ChangeQueue;
    use crate::store::{EntityStore, MemoryEntityStore, MemoryWatermarkStore, WatermarkStore};
    use crate::transport::{MockChannel, MockStep};
    use std::time::Duration;
    use syncline_protocol::{Delta, EntityType, FieldChange, OutgoingMessage};

    const TASK: EntityType = EntityType::new(1);
    const TAG: EntityType = EntityType::new(2);

    struct Fixture {
        queue: Arc<ChangeQueue>,
        tasks: Arc<MemoryEntityStore>,
        tags: Arc<MemoryEntityStore>,
        marks: Arc<MemoryWatermarkStore>,
        mock: Arc<MockChannel>,
        worker: SyncWorker,
    }

    fn fixture(config: SyncConfig) -> Fixture {
        let queue = Arc::new(ChangeQueue::new());
        let tasks = Arc::new(MemoryEntityStore::new(TASK));
        let tags = Arc::new(MemoryEntityStore::new(TAG));
        let marks = Arc::new(MemoryWatermarkStore::new());
        let mock = Arc::new(MockChannel::new());
        let builder = MessageBuilder::new(marks.clone())
            .with_store(TASK, tasks.clone())
            .with_store(TAG, tags.clone());
        let shared = Arc::new(WorkerShared::new(Arc::clone(&queue)));
        let dispatcher = Dispatcher::new(mock.clone(), config.dispatch_timeout);
        let mut worker = SyncWorker::new(shared, Arc::new(builder), dispatcher, config);
        // Keep the poll out of the way unless a test asks for it.
        worker.last_background_sync = Some(Instant::now());
        Fixture {
            queue,
            tasks,
            tags,
            marks,
            mock,
            worker,
        }
    }

    fn quiet() -> SyncConfig {
        SyncConfig::new().with_poll_interval(Duration::from_secs(3600))
    }

    #[test]
    fn empty_queue_without_poll_does_nothing() {
        let mut f = fixture(quiet());
        assert!(f.worker.run_cycle().unwrap().is_none());
        assert_eq!(f.mock.call_count(), 0);
    }

    #[test]
    fn batch_grows_with_available_work() {
        let mut f = fixture(quiet());
        for id in 1..=3 {
            f.tasks.write(id, "title", "x");
            f.queue.enqueue_change(id, TASK);
        }

        let first = f.worker.run_cycle().unwrap().unwrap();
        assert_eq!(first.changes_sent, 1);
        assert_eq!(first.batch_size, 2);

        let second = f.worker.run_cycle().unwrap().unwrap();
        assert_eq!(second.changes_sent, 2);
        assert_eq!(second.batch_size, 4);

        assert!(f.worker.run_cycle().unwrap().is_none());
        assert_eq!(f.worker.batch.current_size(), 4);
        assert!(f.tasks.dirty_ids().is_empty());
    }

    #[test]
    fn deleted_entity_is_skipped_without_fault() {
        let mut f = fixture(quiet());
        f.tasks.write(1, "title", "doomed");
        f.queue.enqueue_change(1, TASK);
        f.tasks.delete(1);

        assert!(f.worker.run_cycle().unwrap().is_none());
        assert_eq!(f.mock.call_count(), 0);
        assert_eq!(f.worker.shared.stats().items_skipped, 1);
    }

    #[test]
    fn deleted_entity_is_left_out_of_a_mixed_batch() {
        let mut f = fixture(quiet());
        f.worker.batch.on_cycle_complete(4, true);
        f.tasks.write(1, "title", "doomed");
        f.tasks.write(2, "title", "kept");
        f.queue.enqueue_change(1, TASK);
        f.queue.enqueue_change(2, TASK);
        f.tasks.delete(1);

        let result = f.worker.run_cycle().unwrap().unwrap();
        assert_eq!(result.changes_sent, 1);
        let batches = f.mock.sent_batches();
        assert_eq!(batches[0].len(), 1);
        assert_eq!(batches[0][0].entity_id(), Some(2));
    }

    #[test]
    fn duplicate_notifications_are_harmless() {
        let mut f = fixture(quiet());
        f.worker.batch.on_cycle_complete(4, true);
        f.tasks.write(1, "title", "once");
        f.queue.enqueue_change(1, TASK);
        f.queue.enqueue_change(1, TASK);

        let result = f.worker.run_cycle().unwrap().unwrap();
        assert_eq!(result.changes_sent, 2);
        let after_first = f.tasks.get(1).unwrap();
        assert!(f.tasks.outstanding(1).is_empty());

        // A late duplicate finds nothing outstanding.
        f.queue.enqueue_change(1, TASK);
        assert!(f.worker.run_cycle().unwrap().is_none());
        assert_eq!(f.tasks.get(1).unwrap(), after_first);
    }

    #[test]
    fn transport_failure_halves_and_requeues() {
        let mut f = fixture(quiet());
        for _ in 0..3 {
            f.worker.batch.on_cycle_complete(100, true);
        }
        for id in 1..=3 {
            f.tasks.write(id, "title", "x");
            f.queue.enqueue_change(id, TASK);
        }
        f.mock.fail_next("connection reset");

        let result = f.worker.run_cycle().unwrap().unwrap();
        assert!(!result.complete);
        assert_eq!(result.requeued, 3);
        assert_eq!(result.batch_size, 4);
        assert_eq!(f.queue.len(), 3);
        assert_eq!(f.worker.transport_failures, 1);
        assert_eq!(f.worker.shared.stats().transport_failures, 1);

        let retry = f.worker.run_cycle().unwrap().unwrap();
        assert!(retry.complete);
        assert_eq!(retry.changes_sent, 3);
        assert_eq!(f.worker.transport_failures, 0);
        assert!(f.tasks.dirty_ids().is_empty());
    }

    #[test]
    fn timeout_counts_as_partial() {
        let mut f = fixture(quiet().with_dispatch_timeout(Duration::from_millis(30)));
        f.worker.batch.on_cycle_complete(1, true);
        f.tasks.write(1, "title", "x");
        f.queue.enqueue_change(1, TASK);
        f.mock.push_step(MockStep::Stall(Duration::from_millis(500)));

        let result = f.worker.run_cycle().unwrap().unwrap();
        assert!(!result.complete);
        assert_eq!(result.batch_size, 1);
        assert_eq!(f.queue.len(), 1);
    }

    #[test]
    fn partial_reply_requeues_only_unsettled() {
        let mut f = fixture(quiet());
        f.worker.batch.on_cycle_complete(4, true);
        f.worker.batch.on_cycle_complete(4, true);
        let first = f.tasks.write(1, "title", "a");
        f.tasks.write(2, "title", "b");
        f.tags.write(3, "name", "c");
        f.queue.enqueue_change(1, TASK);
        f.queue.enqueue_change(2, TASK);
        f.queue.enqueue_change(3, TAG);
        f.mock.reply_next(BatchReply::partial(vec![
            ResponseMessage::Acknowledged {
                entity_type: TASK,
                entity_id: 1,
                through: first.changed_at,
            },
            ResponseMessage::Rejected {
                entity_type: TAG,
                entity_id: 3,
                reason: "read-only".into(),
            },
        ]));

        let result = f.worker.run_cycle().unwrap().unwrap();
        assert!(!result.complete);
        assert_eq!(result.requeued, 1);
        assert_eq!(result.batch_size, 2);
        assert_eq!(f.queue.drain_up_to(10), vec![ChangeNotification::new(2, TASK)]);
        assert!(f.tasks.outstanding(1).is_empty());
    }

    #[test]
    fn idle_poll_sends_brief_me_per_type() {
        let mut f = fixture(quiet());
        f.worker.last_background_sync = None;
        f.marks.set(TASK, 5).unwrap();
        f.mock.reply_next(BatchReply::complete(vec![
            ResponseMessage::Watermark {
                entity_type: TASK,
                timestamp: 50,
            },
            ResponseMessage::Watermark {
                entity_type: TAG,
                timestamp: 60,
            },
            ResponseMessage::RemoteChanges {
                entity_type: TAG,
                entity_id: 8,
                delta: Delta::from_changes(vec![FieldChange::set("name", "home", 55)]),
            },
        ]));

        let result = f.worker.run_cycle().unwrap().unwrap();
        assert_eq!(result.brief_me_sent, 2);
        assert_eq!(result.changes_sent, 0);
        assert_eq!(result.applied, 3);
        assert_eq!(f.marks.get(TASK).unwrap(), 50);
        assert_eq!(f.marks.get(TAG).unwrap(), 60);
        assert_eq!(f.tags.get(8).unwrap().get("name"), Some(&b"home"[..]));

        let batch = &f.mock.sent_batches()[0];
        assert!(batch.contains(&OutgoingMessage::BriefMe {
            entity_type: TASK,
            last_synced: 5,
        }));

        // The poll is not due again until the interval passes.
        assert!(f.worker.run_cycle().unwrap().is_none());
    }

    #[test]
    fn watermark_never_moves_backwards() {
        let mut f = fixture(quiet());
        f.worker.last_background_sync = None;
        f.marks.set(TASK, 100).unwrap();
        f.mock.reply_next(BatchReply::complete(vec![ResponseMessage::Watermark {
            entity_type: TASK,
            timestamp: 40,
        }]));
        f.worker.run_cycle().unwrap();
        assert_eq!(f.marks.get(TASK).unwrap(), 100);
    }

    #[test]
    fn failed_poll_stays_due() {
        let mut f = fixture(quiet());
        f.worker.last_background_sync = None;
        f.mock.fail_next("offline");
        f.worker.run_cycle().unwrap();
        assert!(f.worker.poll_due());
        assert_eq!(f.worker.run_cycle().unwrap().unwrap().brief_me_sent, 2);
    }

    #[test]
    fn poll_request_forces_brief_me() {
        let mut f = fixture(quiet());
        f.queue.request_poll();
        let result = f.worker.run_cycle().unwrap().unwrap();
        assert_eq!(result.brief_me_sent, 2);
    }

    #[test]
    fn due_poll_also_consumes_a_pending_request() {
        let mut f = fixture(quiet());
        f.worker.last_background_sync = None;
        f.queue.request_poll();

        let result = f.worker.run_cycle().unwrap().unwrap();
        assert_eq!(result.brief_me_sent, 2);
        assert!(!f.queue.take_poll_request());
        assert!(f.worker.run_cycle().unwrap().is_none());
        assert_eq!(f.mock.call_count(), 1);
    }

    #[test]
    fn poll_request_waits_behind_queued_changes() {
        let mut f = fixture(quiet());
        f.tasks.write(1, "title", "x");
        f.queue.enqueue_change(1, TASK);
        f.queue.request_poll();

        let first = f.worker.run_cycle().unwrap().unwrap();
        assert_eq!(first.changes_sent, 1);
        assert_eq!(first.brief_me_sent, 0);

        let second = f.worker.run_cycle().unwrap().unwrap();
        assert_eq!(second.brief_me_sent, 2);
    }

    #[test]
    fn truncated_poll_briefs_the_remaining_types_next() {
        let mut f = fixture(quiet());
        f.worker.last_background_sync = None;
        f.mock.reply_next(BatchReply::partial(vec![ResponseMessage::Watermark {
            entity_type: TASK,
            timestamp: 50,
        }]));

        let first = f.worker.run_cycle().unwrap().unwrap();
        assert_eq!(first.brief_me_sent, 2);
        assert!(!first.complete);
        assert!(f.worker.poll_deadline() <= Instant::now());

        let second = f.worker.run_cycle().unwrap().unwrap();
        assert_eq!(second.brief_me_sent, 1);
        assert_eq!(
            f.mock.sent_batches()[1],
            vec![OutgoingMessage::BriefMe {
                entity_type: TAG,
                last_synced: 0,
            }]
        );

        assert!(f.worker.run_cycle().unwrap().is_none());
        assert_eq!(f.marks.get(TASK).unwrap(), 50);
    }

    #[test]
    fn inapplicable_response_is_counted_not_fatal() {
        let mut f = fixture(quiet());
        f.worker.last_background_sync = None;
        f.mock.reply_next(BatchReply::complete(vec![ResponseMessage::RemoteChanges {
            entity_type: EntityType::new(42),
            entity_id: 1,
            delta: Delta::new(),
        }]));
        let result = f.worker.run_cycle().unwrap().unwrap();
        assert_eq!(result.apply_failures, 1);
        assert!(result.complete);
    }

    #[test]
    fn channel_panic_escapes_as_fault() {
        let mut f = fixture(quiet());
        f.tasks.write(1, "title", "x");
        f.queue.enqueue_change(1, TASK);
        f.mock.push_step(MockStep::Panic("injected".into()));

        let err = f.worker.run_cycle().unwrap_err();
        assert!(err.is_fatal());
        // The drained item is still recorded as in flight for recovery.
        assert_eq!(f.worker.shared.in_flight.lock().len(), 1);
    }

    #[test]
    fn clean_cycle_clears_past_faults() {
        let mut f = fixture(quiet());
        let item = ChangeNotification::new(1, TASK);
        *f.worker.shared.in_flight.lock() = vec![item];
        let shared = Arc::clone(&f.worker.shared);
        assert_eq!(shared.recover_after_fault(2).requeued, 1);

        f.tasks.write(1, "title", "x");
        assert_eq!(f.worker.run_cycle().unwrap().unwrap().changes_sent, 1);

        // One more fault would have dropped it had the count survived.
        *shared.in_flight.lock() = vec![item];
        assert_eq!(shared.recover_after_fault(2).requeued, 1);
    }

    #[test]
    fn run_exits_cleanly_on_shutdown() {
        let f = fixture(quiet());
        let shared = Arc::clone(&f.worker.shared);
        let queue = Arc::clone(&f.queue);
        let handle = std::thread::spawn(move || f.worker.run());

        std::thread::sleep(Duration::from_millis(30));
        queue.shutdown();
        assert!(handle.join().unwrap().is_ok());
        assert_eq!(shared.state(), SyncState::Stopped);
        assert_eq!(shared.live_workers(), 0);
    }

    #[test]
    fn stores_see_remote_changes_for_missing_entities() {
        let f = fixture(quiet());
        let delta = Delta::from_changes(vec![FieldChange::set("title", "from server", 9)]);
        f.worker
            .apply(&ResponseMessage::RemoteChanges {
                entity_type: TASK,
                entity_id: 77,
                delta,
            })
            .unwrap();
        assert!(f.tasks.load(77).unwrap().is_some());
    }
}
