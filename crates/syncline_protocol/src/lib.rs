//! # Syncline Protocol
//!
//! Envelope types exchanged between the Syncline sync worker and a remote
//! authority.
//!
//! This crate provides:
//! - `ChangeNotification` for queued local mutations
//! - `Entity` and `Delta` envelopes (field-level, schema-agnostic)
//! - Outbound messages (`ChangesHappened`, `BriefMe`)
//! - Inbound responses and the per-batch `BatchReply`
//! - CBOR encoding/decoding of batches
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod codec;
mod entity;
mod error;
mod message;

pub use codec::{decode_reply, decode_request, encode_reply, encode_request, BatchRequest};
pub use entity::{Delta, Entity, EntityId, EntityType, FieldChange, FieldValue, Timestamp};
pub use error::{ProtocolError, ProtocolResult};
pub use message::{BatchReply, ChangeNotification, OutgoingMessage, ResponseMessage};

/// Current protocol version carried in every encoded batch.
pub const PROTOCOL_VERSION: u16 = 1;
