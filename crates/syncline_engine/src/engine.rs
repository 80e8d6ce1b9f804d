//! The host-facing sync engine.

use crate::builder::MessageBuilder;
use crate::config::SyncConfig;
use crate::error::SyncResult;
use crate::queue::ChangeQueue;
use crate::state::{SyncState, SyncStats, WorkerShared};
use crate::supervisor::Supervisor;
use crate::transport::RemoteChannel;
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use syncline_protocol::{EntityId, EntityType};
use tracing::{info, warn};

/// Background synchronization of local changes with a remote authority.
///
/// Producers call [`enqueue_change`](Self::enqueue_change) after every
/// tracked mutation. Once [`start`](Self::start)ed, a supervised worker
/// thread drains the queue in adaptive batches, sends them to the remote
/// authority, applies the responses, and polls for server-side changes
/// when idle.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use syncline_engine::{
///     MemoryEntityStore, MemoryWatermarkStore, MessageBuilder, MockChannel, SyncConfig,
///     SyncEngine,
/// };
/// use syncline_protocol::EntityType;
///
/// const TASK: EntityType = EntityType::new(1);
///
/// let tasks = Arc::new(MemoryEntityStore::new(TASK));
/// let builder = MessageBuilder::new(Arc::new(MemoryWatermarkStore::new()))
///     .with_store(TASK, tasks.clone());
/// let engine = SyncEngine::new(SyncConfig::default(), builder, MockChannel::new());
///
/// tasks.write(1, "title", "buy milk");
/// engine.enqueue_change(1, TASK);
/// engine.start().unwrap();
/// engine.shutdown();
/// ```
pub struct SyncEngine {
    shared: Arc<WorkerShared>,
    builder: Arc<MessageBuilder>,
    channel: Arc<dyn RemoteChannel>,
    config: SyncConfig,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl SyncEngine {
    /// Creates an engine with its own change queue.
    pub fn new(
        config: SyncConfig,
        builder: MessageBuilder,
        channel: impl RemoteChannel + 'static,
    ) -> Self {
        Self::with_queue(
            config,
            Arc::new(ChangeQueue::new()),
            builder,
            Arc::new(channel),
        )
    }

    /// Creates an engine around an externally owned queue and channel.
    pub fn with_queue(
        config: SyncConfig,
        queue: Arc<ChangeQueue>,
        builder: MessageBuilder,
        channel: Arc<dyn RemoteChannel>,
    ) -> Self {
        Self {
            shared: Arc::new(WorkerShared::new(queue)),
            builder: Arc::new(builder),
            channel,
            config,
            supervisor: Mutex::new(None),
        }
    }

    /// Records that an entity may have unsynced changes.
    ///
    /// Fire-and-forget: never blocks on the worker and never fails.
    pub fn enqueue_change(&self, entity_id: EntityId, entity_type: EntityType) {
        self.shared.queue.enqueue_change(entity_id, entity_type);
    }

    /// Asks the worker to poll the remote authority on its next idle cycle.
    pub fn request_sync(&self) {
        self.shared.queue.request_poll();
    }

    /// Starts the supervised worker.
    ///
    /// Idempotent: calling it while the worker is running does nothing.
    /// After [`shutdown`](Self::shutdown) it does nothing either.
    pub fn start(&self) -> SyncResult<()> {
        let mut supervisor = self.supervisor.lock();
        if supervisor.as_ref().is_some_and(|h| !h.is_finished()) {
            return Ok(());
        }
        if self.shared.queue.is_shutdown() {
            warn!("sync engine already shut down, not starting");
            return Ok(());
        }

        let task = Supervisor {
            shared: Arc::clone(&self.shared),
            builder: Arc::clone(&self.builder),
            channel: Arc::clone(&self.channel),
            config: self.config.clone(),
        };
        let handle = thread::Builder::new()
            .name(format!("{}-supervisor", self.config.thread_name))
            .spawn(move || task.run())?;
        *supervisor = Some(handle);
        info!("sync engine started");
        Ok(())
    }

    /// Stops the worker and waits for it to exit.
    ///
    /// Queued notifications stay in the queue. A dispatch in progress is
    /// abandoned.
    pub fn shutdown(&self) {
        self.shared.queue.shutdown();
        let handle = self.supervisor.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("sync supervisor panicked during shutdown");
            }
            info!("sync engine stopped");
        }
    }

    /// Returns true while a worker thread is alive.
    pub fn is_running(&self) -> bool {
        self.shared.live_workers() > 0
    }

    /// Returns the number of live worker threads (0 or 1).
    pub fn live_workers(&self) -> usize {
        self.shared.live_workers()
    }

    /// Gets the current worker state.
    pub fn state(&self) -> SyncState {
        self.shared.state()
    }

    /// Gets the current stats.
    pub fn stats(&self) -> SyncStats {
        self.shared.stats()
    }

    /// Returns the change queue.
    pub fn queue(&self) -> &Arc<ChangeQueue> {
        &self.shared.queue
    }

    /// Returns the message builder.
    pub fn builder(&self) -> &MessageBuilder {
        &self.builder
    }

    /// Returns the configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("state", &self.state())
            .field("queued", &self.shared.queue.len())
            .field("live_workers", &self.live_workers())
            .finish_non_exhaustive()
    }
}
