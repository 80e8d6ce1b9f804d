//! Protocol messages.

use crate::entity::{Delta, EntityId, EntityType, Timestamp};
use serde::{Deserialize, Serialize};

/// "This entity may have unsynced local changes."
///
/// Producers enqueue one of these after every tracked mutation. Duplicates
/// are legal; each one is processed independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChangeNotification {
    /// Entity ID.
    pub entity_id: EntityId,
    /// Entity type.
    pub entity_type: EntityType,
}

impl ChangeNotification {
    /// Creates a new notification.
    pub fn new(entity_id: EntityId, entity_type: EntityType) -> Self {
        Self {
            entity_id,
            entity_type,
        }
    }
}

/// A client-to-server message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutgoingMessage {
    /// Local field changes the server has not acknowledged yet.
    ChangesHappened {
        /// Entity type.
        entity_type: EntityType,
        /// Entity ID.
        entity_id: EntityId,
        /// Outstanding field-level changes.
        outstanding: Delta,
    },
    /// Request for server-side changes newer than a watermark.
    BriefMe {
        /// Entity type.
        entity_type: EntityType,
        /// Last point up to which this client has seen server changes.
        last_synced: Timestamp,
    },
}

impl OutgoingMessage {
    /// Returns the entity type this message concerns.
    pub fn entity_type(&self) -> EntityType {
        match self {
            OutgoingMessage::ChangesHappened { entity_type, .. }
            | OutgoingMessage::BriefMe { entity_type, .. } => *entity_type,
        }
    }

    /// Returns the entity ID for change messages.
    pub fn entity_id(&self) -> Option<EntityId> {
        match self {
            OutgoingMessage::ChangesHappened { entity_id, .. } => Some(*entity_id),
            OutgoingMessage::BriefMe { .. } => None,
        }
    }

    /// Returns true for `ChangesHappened`.
    pub fn is_change(&self) -> bool {
        matches!(self, OutgoingMessage::ChangesHappened { .. })
    }
}

/// A server-to-client message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseMessage {
    /// The server accepted local changes up to `through`.
    Acknowledged {
        /// Entity type.
        entity_type: EntityType,
        /// Entity ID.
        entity_id: EntityId,
        /// Newest acknowledged `changed_at`.
        through: Timestamp,
    },
    /// Server-side changes to apply locally.
    RemoteChanges {
        /// Entity type.
        entity_type: EntityType,
        /// Entity ID.
        entity_id: EntityId,
        /// Field changes made on the server.
        delta: Delta,
    },
    /// The server refused a change.
    Rejected {
        /// Entity type.
        entity_type: EntityType,
        /// Entity ID.
        entity_id: EntityId,
        /// Human-readable reason.
        reason: String,
    },
    /// New last-synced baseline for an entity type.
    Watermark {
        /// Entity type.
        entity_type: EntityType,
        /// New watermark.
        timestamp: Timestamp,
    },
}

impl ResponseMessage {
    /// Returns the entity type this response concerns.
    pub fn entity_type(&self) -> EntityType {
        match self {
            ResponseMessage::Acknowledged { entity_type, .. }
            | ResponseMessage::RemoteChanges { entity_type, .. }
            | ResponseMessage::Rejected { entity_type, .. }
            | ResponseMessage::Watermark { entity_type, .. } => *entity_type,
        }
    }

    /// Returns true if this response settles an outgoing change for the
    /// given entity, i.e. the change must not be retried.
    pub fn settles(&self, entity_type: EntityType, entity_id: EntityId) -> bool {
        match self {
            ResponseMessage::Acknowledged {
                entity_type: t,
                entity_id: id,
                ..
            }
            | ResponseMessage::Rejected {
                entity_type: t,
                entity_id: id,
                ..
            } => *t == entity_type && *id == entity_id,
            _ => false,
        }
    }
}

/// The single reply to one dispatched batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReply {
    /// Responses in no particular order.
    pub responses: Vec<ResponseMessage>,
    /// False if the server processed only part of the batch
    /// (rate limiting, truncation, overload).
    pub complete: bool,
}

impl BatchReply {
    /// Creates a reply for a fully processed batch.
    pub fn complete(responses: Vec<ResponseMessage>) -> Self {
        Self {
            responses,
            complete: true,
        }
    }

    /// Creates a reply for a partially processed batch.
    pub fn partial(responses: Vec<ResponseMessage>) -> Self {
        Self {
            responses,
            complete: false,
        }
    }

    /// Returns true if some response settles the given entity's change.
    pub fn settles(&self, entity_type: EntityType, entity_id: EntityId) -> bool {
        self.responses
            .iter()
            .any(|r| r.settles(entity_type, entity_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TASK: EntityType = EntityType::new(1);
    const TAG: EntityType = EntityType::new(2);

    #[test]
    fn outgoing_accessors() {
        let change = OutgoingMessage::ChangesHappened {
            entity_type: TASK,
            entity_id: 9,
            outstanding: Delta::new(),
        };
        assert!(change.is_change());
        assert_eq!(change.entity_id(), Some(9));
        assert_eq!(change.entity_type(), TASK);

        let brief = OutgoingMessage::BriefMe {
            entity_type: TAG,
            last_synced: 0,
        };
        assert!(!brief.is_change());
        assert_eq!(brief.entity_id(), None);
        assert_eq!(brief.entity_type(), TAG);
    }

    #[test]
    fn reply_settles_only_matching_entity() {
        let reply = BatchReply::partial(vec![
            ResponseMessage::Acknowledged {
                entity_type: TASK,
                entity_id: 1,
                through: 10,
            },
            ResponseMessage::Rejected {
                entity_type: TAG,
                entity_id: 2,
                reason: "read-only".into(),
            },
            ResponseMessage::Watermark {
                entity_type: TASK,
                timestamp: 99,
            },
        ]);

        assert!(!reply.complete);
        assert!(reply.settles(TASK, 1));
        assert!(reply.settles(TAG, 2));
        assert!(!reply.settles(TAG, 1));
        assert!(!reply.settles(TASK, 3));
    }
}
