//! Worker supervision.
//!
//! The supervisor thread owns the worker's lifecycle: it spawns a worker,
//! joins it, and if the worker died to a fault or panic, puts the worker's
//! in-flight notifications back at the tail of the queue and starts a fresh
//! worker after a bounded backoff. A notification that keeps killing workers
//! is dropped after `max_item_faults` deaths. Worker death is never terminal; only a queue
//! shutdown ends supervision.

use crate::builder::MessageBuilder;
use crate::config::SyncConfig;
use crate::dispatch::Dispatcher;
use crate::state::{SyncState, WorkerShared};
use crate::transport::RemoteChannel;
use crate::worker::SyncWorker;
use std::any::Any;
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tracing::{error, info, warn};

pub(crate) struct Supervisor {
    pub(crate) shared: Arc<WorkerShared>,
    pub(crate) builder: Arc<MessageBuilder>,
    pub(crate) channel: Arc<dyn RemoteChannel>,
    pub(crate) config: SyncConfig,
}

impl Supervisor {
    pub(crate) fn run(self) {
        let mut consecutive_faults = 0u32;
        let dispatcher = Dispatcher::new(Arc::clone(&self.channel), self.config.dispatch_timeout);

        loop {
            if self.shared.queue.is_shutdown() {
                break;
            }

            let started = Instant::now();
            let failure = match self.spawn_worker(dispatcher.clone()) {
                Ok(handle) => match handle.join() {
                    Ok(Ok(())) => break,
                    Ok(Err(e)) => e.to_string(),
                    Err(panic) => format!("worker panicked: {}", panic_message(&*panic)),
                },
                Err(e) => format!("could not spawn worker: {e}"),
            };

            self.shared.set_state(SyncState::Failed);
            let recovery = self.shared.recover_after_fault(self.config.max_item_faults);
            error!(error = %failure, requeued = recovery.requeued, "sync worker died");
            for item in &recovery.dropped {
                error!(
                    entity_type = %item.entity_type,
                    entity_id = item.entity_id,
                    faults = self.config.max_item_faults,
                    "dropping change that keeps faulting the worker"
                );
            }

            if started.elapsed() >= self.config.restart_reset_after {
                consecutive_faults = 0;
            }
            consecutive_faults = consecutive_faults.saturating_add(1);

            self.shared.update_stats(|stats| {
                stats.restarts += 1;
                stats.items_requeued += recovery.requeued as u64;
                stats.items_dropped += recovery.dropped.len() as u64;
                stats.last_error = Some(failure);
            });

            let delay = self.config.restart.delay_for_attempt(consecutive_faults);
            warn!(?delay, attempt = consecutive_faults, "restarting sync worker");
            if self.shared.queue.pause(delay) {
                break;
            }
        }

        self.shared.set_state(SyncState::Stopped);
        info!("sync supervisor stopped");
    }

    fn spawn_worker(
        &self,
        dispatcher: Dispatcher,
    ) -> std::io::Result<thread::JoinHandle<crate::SyncResult<()>>> {
        let worker = SyncWorker::new(
            Arc::clone(&self.shared),
            Arc::clone(&self.builder),
            dispatcher,
            self.config.clone(),
        );
        thread::Builder::new()
            .name(self.config.thread_name.clone())
            .spawn(move || worker.run())
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
