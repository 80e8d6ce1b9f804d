//! # Syncline Server
//!
//! In-memory reference remote authority for the Syncline sync engine.
//!
//! This crate provides:
//! - A batch handler answering `ChangesHappened` and `BriefMe` messages
//! - A field-level ledger with last-writer-wins merge per field
//! - Batch truncation above a configured size (partial completion)
//! - Read-only entity types (rejected changes)
//! - A CBOR endpoint for loopback HTTP transports
//! - Simulated outages and latency for exercising client retry paths
//!
//! # Protocol
//!
//! Every batch gets exactly one [`BatchReply`](syncline_protocol::BatchReply):
//! 1. Each accepted change is merged and acknowledged up to its newest stamp
//! 2. Each `BriefMe` is answered with the entities modified after the
//!    watermark, followed by the new watermark
//! 3. Messages beyond `max_batch` are left unanswered and the reply is
//!    marked incomplete

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod config;
mod error;
mod ledger;
mod server;

pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use ledger::Ledger;
pub use server::{SyncServer, BATCH_PATH};
