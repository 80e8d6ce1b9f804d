//! Server-side entity ledger.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use syncline_protocol::{Delta, Entity, EntityId, EntityType, FieldChange, Timestamp};

#[derive(Debug, Clone)]
struct LedgerEntry {
    entity: Entity,
    /// Server revision of the last effective merge.
    revision: Timestamp,
}

/// Authoritative field state for every entity the server has seen.
///
/// The ledger maintains:
/// - Current field values, merged last-writer-wins on the client stamps
/// - A monotonically increasing server revision per effective merge
///
/// Watermarks handed to clients are server revisions, so a `BriefMe` at
/// watermark `w` returns exactly the entities merged after `w`.
#[derive(Debug, Default)]
pub struct Ledger {
    entries: RwLock<HashMap<(EntityType, EntityId), LedgerEntry>>,
    revision: AtomicU64,
}

impl Ledger {
    /// Creates an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges a delta into an entity, creating the entity if needed.
    ///
    /// Returns the number of fields that changed. Re-merging the same
    /// delta changes nothing and does not bump the revision.
    pub fn merge(&self, entity_type: EntityType, entity_id: EntityId, delta: &Delta) -> usize {
        let mut entries = self.entries.write();
        let entry = entries
            .entry((entity_type, entity_id))
            .or_insert_with(|| LedgerEntry {
                entity: Entity::new(entity_id, entity_type),
                revision: 0,
            });
        let applied = entry.entity.apply(delta);
        if applied > 0 {
            entry.revision = self.revision.fetch_add(1, Ordering::SeqCst) + 1;
        }
        applied
    }

    /// Writes one field on behalf of another client.
    pub fn write(
        &self,
        entity_type: EntityType,
        entity_id: EntityId,
        field: &str,
        value: impl Into<Vec<u8>>,
        changed_at: Timestamp,
    ) -> usize {
        let delta = Delta::from_changes(vec![FieldChange::set(field, value, changed_at)]);
        self.merge(entity_type, entity_id, &delta)
    }

    /// Returns every entity of a type merged after `watermark`, as full
    /// field deltas ordered by ID, plus the new watermark.
    pub fn changes_since(
        &self,
        entity_type: EntityType,
        watermark: Timestamp,
    ) -> (Vec<(EntityId, Delta)>, Timestamp) {
        let entries = self.entries.read();
        let mut high = watermark;
        let mut changes: Vec<(EntityId, Delta)> = entries
            .values()
            .filter(|e| e.entity.entity_type == entity_type && e.revision > watermark)
            .map(|e| {
                high = high.max(e.revision);
                let delta = e
                    .entity
                    .fields
                    .iter()
                    .map(|(field, value)| FieldChange {
                        field: field.clone(),
                        value: value.value.clone(),
                        changed_at: value.changed_at,
                    })
                    .collect();
                (e.entity.id, Delta::from_changes(delta))
            })
            .collect();
        changes.sort_by_key(|(id, _)| *id);
        (changes, high)
    }

    /// Returns a copy of an entity.
    pub fn get(&self, entity_type: EntityType, entity_id: EntityId) -> Option<Entity> {
        self.entries
            .read()
            .get(&(entity_type, entity_id))
            .map(|e| e.entity.clone())
    }

    /// Returns the current server revision.
    pub fn revision(&self) -> Timestamp {
        self.revision.load(Ordering::SeqCst)
    }

    /// Returns the number of entities.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns true if no entity was ever merged.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
