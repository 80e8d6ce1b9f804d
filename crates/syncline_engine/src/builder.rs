//! Builds outbound messages from queued notifications and polling ticks.

use crate::error::{SyncError, SyncResult};
use crate::store::{EntityStore, WatermarkStore};
use std::collections::BTreeMap;
use std::sync::Arc;
use syncline_protocol::{EntityId, EntityType, OutgoingMessage};
use tracing::{debug, warn};

/// Turns change notifications into `ChangesHappened` messages and polling
/// ticks into `BriefMe` messages.
///
/// Entity types are handled through a registry of stores, so tracking a
/// new type is a matter of registering one more store.
pub struct MessageBuilder {
    stores: BTreeMap<EntityType, Arc<dyn EntityStore>>,
    watermarks: Arc<dyn WatermarkStore>,
}

impl MessageBuilder {
    /// Creates a builder with no registered entity types.
    pub fn new(watermarks: Arc<dyn WatermarkStore>) -> Self {
        Self {
            stores: BTreeMap::new(),
            watermarks,
        }
    }

    /// Registers the store for an entity type, replacing any previous one.
    pub fn with_store(mut self, entity_type: EntityType, store: Arc<dyn EntityStore>) -> Self {
        self.register(entity_type, store);
        self
    }

    /// Registers the store for an entity type, replacing any previous one.
    pub fn register(&mut self, entity_type: EntityType, store: Arc<dyn EntityStore>) {
        self.stores.insert(entity_type, store);
    }

    /// Returns the tracked entity types in ascending tag order.
    pub fn tracked_types(&self) -> impl Iterator<Item = EntityType> + '_ {
        self.stores.keys().copied()
    }

    /// Returns the store for an entity type.
    pub fn store(&self, entity_type: EntityType) -> SyncResult<&Arc<dyn EntityStore>> {
        self.stores
            .get(&entity_type)
            .ok_or(SyncError::UnknownEntityType(entity_type))
    }

    /// Returns the watermark store.
    pub fn watermarks(&self) -> &Arc<dyn WatermarkStore> {
        &self.watermarks
    }

    /// Builds the `ChangesHappened` message for one entity.
    ///
    /// Returns `None` if the entity was deleted after the notification was
    /// queued, or if it has nothing outstanding (a duplicate notification
    /// whose changes were already acknowledged).
    pub fn build_changes_happened(
        &self,
        entity_id: EntityId,
        entity_type: EntityType,
    ) -> SyncResult<Option<OutgoingMessage>> {
        let store = self.store(entity_type)?;

        if store.load(entity_id)?.is_none() {
            debug!(%entity_type, entity_id, "entity vanished before sync, skipping");
            return Ok(None);
        }

        let outstanding = store.load_outstanding_delta(entity_id)?;
        if outstanding.is_empty() {
            debug!(%entity_type, entity_id, "nothing outstanding, skipping");
            return Ok(None);
        }

        Ok(Some(OutgoingMessage::ChangesHappened {
            entity_type,
            entity_id,
            outstanding: outstanding.compact(),
        }))
    }

    /// Builds the `BriefMe` message for one entity type.
    ///
    /// A failing watermark read falls back to 0, asking for everything.
    pub fn build_brief_me(&self, entity_type: EntityType) -> OutgoingMessage {
        let last_synced = self.watermarks.get(entity_type).unwrap_or_else(|e| {
            warn!(%entity_type, error = %e, "watermark unavailable, requesting full brief");
            0
        });
        OutgoingMessage::BriefMe {
            entity_type,
            last_synced,
        }
    }

    /// Builds one `BriefMe` per tracked entity type.
    pub fn build_brief_me_all(&self) -> Vec<OutgoingMessage> {
        self.tracked_types()
            .map(|entity_type| self.build_brief_me(entity_type))
            .collect()
    }
}

impl std::fmt::Debug for MessageBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBuilder")
            .field("tracked_types", &self.stores.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}
