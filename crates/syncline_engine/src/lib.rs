//! # Syncline Sync Engine
//!
//! Client-side change synchronization: a single background worker that
//! reconciles local mutations with a remote authority.
//!
//! This crate provides:
//! - Change queue and wake signal shared with producers
//! - Adaptive batch sizing (multiplicative increase / decrease)
//! - Message building through a type-to-store registry
//! - A drain → dispatch → apply worker loop with bounded dispatch
//! - A supervisor that restarts the worker after faults, with backoff
//! - Transport abstraction with mock and HTTP (CBOR) channels
//!
//! ## Architecture
//!
//! ```text
//! producers ──enqueue_change──▶ ChangeQueue ──wake──▶ SyncWorker
//!                                                    │  drain up to batch size
//!                                                    │  MessageBuilder
//!                                                    │  Dispatcher ──▶ RemoteChannel
//!                                                    │  apply responses
//!                                                    ▼  BatchController
//!                                            Supervisor (restart on fault)
//! ```
//!
//! ## Key Invariants
//!
//! - Exactly one worker thread is live at a time
//! - One network round trip per cycle
//! - Batch size never drops below 1 and resets to 1 on restart
//! - Producers never see a sync error
//! - Unsettled changes are put back on the queue, never lost

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod batch;
mod builder;
mod config;
mod dispatch;
mod engine;
mod error;
mod http;
mod queue;
mod state;
mod store;
mod supervisor;
mod transport;
mod worker;

pub use batch::BatchController;
pub use builder::MessageBuilder;
pub use config::{RetryConfig, SyncConfig};
pub use dispatch::Dispatcher;
pub use engine::SyncEngine;
pub use error::{SyncError, SyncResult};
pub use http::{HttpChannel, HttpClient, LoopbackClient, LoopbackServer, BATCH_ENDPOINT};
pub use queue::{ChangeQueue, WakeReason};
pub use state::{SyncCycleResult, SyncState, SyncStats};
pub use store::{ChangeClock, EntityStore, MemoryEntityStore, MemoryWatermarkStore, WatermarkStore};
pub use transport::{MockChannel, MockStep, RemoteChannel};
