//! Batch handler.

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::ledger::Ledger;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use syncline_protocol::{
    decode_request, encode_reply, BatchReply, Delta, EntityId, EntityType, OutgoingMessage,
    ResponseMessage, Timestamp,
};
use tracing::{debug, warn};

/// Path served by [`SyncServer::handle_post`].
pub const BATCH_PATH: &str = "/sync/batch";

/// The reference sync server.
///
/// Answers batches against an in-memory [`Ledger`]. Transports reach it
/// either directly through [`handle_batch`](Self::handle_batch) or as
/// CBOR bytes through [`handle_post`](Self::handle_post).
///
/// # Example
///
/// ```
/// use syncline_protocol::{EntityType, OutgoingMessage};
/// use syncline_server::{ServerConfig, SyncServer};
///
/// let server = SyncServer::new(ServerConfig::default());
/// let reply = server.handle_batch(vec![OutgoingMessage::BriefMe {
///     entity_type: EntityType::new(1),
///     last_synced: 0,
/// }]);
/// assert!(reply.complete);
/// ```
#[derive(Debug)]
pub struct SyncServer {
    config: ServerConfig,
    ledger: Arc<Ledger>,
    requests: AtomicU64,
    batches: AtomicU64,
}

impl SyncServer {
    /// Creates a server with an empty ledger.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_ledger(config, Arc::new(Ledger::new()))
    }

    /// Creates a server over an existing ledger.
    pub fn with_ledger(config: ServerConfig, ledger: Arc<Ledger>) -> Self {
        Self {
            config,
            ledger,
            requests: AtomicU64::new(0),
            batches: AtomicU64::new(0),
        }
    }

    /// Answers one batch.
    pub fn handle_batch(&self, messages: Vec<OutgoingMessage>) -> BatchReply {
        self.batches.fetch_add(1, Ordering::Relaxed);
        let total = messages.len();
        let mut responses = Vec::new();

        for message in messages.into_iter().take(self.config.max_batch) {
            match message {
                OutgoingMessage::ChangesHappened {
                    entity_type,
                    entity_id,
                    outstanding,
                } => responses.push(self.accept_change(entity_type, entity_id, &outstanding)),
                OutgoingMessage::BriefMe {
                    entity_type,
                    last_synced,
                } => self.brief(entity_type, last_synced, &mut responses),
            }
        }

        if total > self.config.max_batch {
            debug!(
                total,
                answered = self.config.max_batch,
                "Batch truncated"
            );
            BatchReply::partial(responses)
        } else {
            BatchReply::complete(responses)
        }
    }

    /// Handles an encoded request on `path`.
    ///
    /// Errors are rendered as strings, the way an HTTP client surfaces a
    /// failed status.
    pub fn handle_post(&self, path: &str, body: &[u8]) -> Result<Vec<u8>, String> {
        self.post(path, body).map_err(|e| {
            warn!(path, error = %e, "Request failed");
            e.to_string()
        })
    }

    fn post(&self, path: &str, body: &[u8]) -> ServerResult<Vec<u8>> {
        let request_no = self.requests.fetch_add(1, Ordering::SeqCst) + 1;

        if let Some(latency) = self.config.latency {
            std::thread::sleep(latency);
        }
        if let Some(n) = self.config.fail_every {
            if request_no % n == 0 {
                return Err(ServerError::Unavailable(request_no));
            }
        }
        if path != BATCH_PATH {
            return Err(ServerError::UnknownEndpoint(path.to_string()));
        }

        let request = decode_request(body)?;
        let reply = self.handle_batch(request.messages);
        Ok(encode_reply(&reply)?)
    }

    fn accept_change(
        &self,
        entity_type: EntityType,
        entity_id: EntityId,
        outstanding: &Delta,
    ) -> ResponseMessage {
        if self.config.read_only_types.contains(&entity_type) {
            return ResponseMessage::Rejected {
                entity_type,
                entity_id,
                reason: format!("{entity_type} is read-only"),
            };
        }

        let applied = self.ledger.merge(entity_type, entity_id, outstanding);
        debug!(%entity_type, entity_id, applied, "Merged change");
        ResponseMessage::Acknowledged {
            entity_type,
            entity_id,
            through: outstanding.through(),
        }
    }

    fn brief(
        &self,
        entity_type: EntityType,
        last_synced: Timestamp,
        responses: &mut Vec<ResponseMessage>,
    ) {
        let (changes, watermark) = self.ledger.changes_since(entity_type, last_synced);
        debug!(%entity_type, last_synced, count = changes.len(), watermark, "Briefing");
        responses.extend(
            changes
                .into_iter()
                .map(|(entity_id, delta)| ResponseMessage::RemoteChanges {
                    entity_type,
                    entity_id,
                    delta,
                }),
        );
        responses.push(ResponseMessage::Watermark {
            entity_type,
            timestamp: watermark,
        });
    }

    /// Returns the ledger.
    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Returns the number of encoded requests received.
    pub fn request_count(&self) -> u64 {
        self.requests.load(Ordering::SeqCst)
    }

    /// Returns the number of batches answered.
    pub fn batch_count(&self) -> u64 {
        self.batches.load(Ordering::Relaxed)
    }
}
