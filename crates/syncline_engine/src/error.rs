//! Error types for the sync engine.

use syncline_protocol::{EntityId, EntityType, ProtocolError};
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
///
/// Errors fall into three classes that the worker treats differently:
/// per-item errors are logged and skipped, transport errors end the cycle
/// as fully partial, and faults end the worker thread.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// The remote authority did not answer within the dispatch timeout.
    #[error("operation timed out")]
    Timeout,

    /// The worker is shutting down.
    #[error("sync cancelled")]
    Cancelled,

    /// Malformed or incompatible message.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// An entity store failed for one entity.
    #[error("store error for {entity_type} entity {entity_id:?}: {message}")]
    Store {
        /// Entity type.
        entity_type: EntityType,
        /// Entity ID, if the failure concerns a single entity.
        entity_id: Option<EntityId>,
        /// Error message.
        message: String,
    },

    /// A watermark read or write failed.
    #[error("watermark error for {entity_type}: {message}")]
    Watermark {
        /// Entity type.
        entity_type: EntityType,
        /// Error message.
        message: String,
    },

    /// No store is registered for the entity type.
    #[error("no store registered for {0}")]
    UnknownEntityType(EntityType),

    /// Unexpected failure that must end the worker thread.
    #[error("worker fault: {0}")]
    Fault(String),

    /// A thread could not be spawned.
    #[error("failed to spawn thread: {0}")]
    Spawn(#[from] std::io::Error),
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Creates a store error for a single entity.
    pub fn store(entity_type: EntityType, entity_id: EntityId, message: impl Into<String>) -> Self {
        Self::Store {
            entity_type,
            entity_id: Some(entity_id),
            message: message.into(),
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Timeout => true,
            _ => false,
        }
    }

    /// Returns true if this error means the batch did not make it through
    /// the network exchange.
    ///
    /// A non-retryable transport error is still a transport error: the
    /// cycle counts as fully partial and the items are retried later.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            SyncError::Transport { .. } | SyncError::Timeout | SyncError::Protocol(_)
        )
    }

    /// Returns true if this error must end the worker thread.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::Fault(_) | SyncError::Spawn(_))
    }
}
