//! Error types for the reference server.

use syncline_protocol::ProtocolError;
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur in the reference server.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Request body could not be decoded.
    #[error("invalid request: {0}")]
    InvalidRequest(#[from] ProtocolError),

    /// No handler for the requested path.
    #[error("unknown endpoint: {0}")]
    UnknownEndpoint(String),

    /// Simulated outage.
    #[error("service unavailable (simulated outage #{0})")]
    Unavailable(u64),
}
