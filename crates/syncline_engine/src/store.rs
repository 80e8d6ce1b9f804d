//! Store interfaces the sync worker reads from and applies to.
//!
//! Entity persistence belongs to the host application. The engine only
//! needs to load an entity and its outstanding delta, apply server-side
//! updates, and clear acknowledged changes. In-memory implementations are
//! provided for tests and simulations.

use crate::error::{SyncError, SyncResult};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use syncline_protocol::{Delta, Entity, EntityId, EntityType, FieldChange, Timestamp};

/// Persistence for one entity type.
///
/// Every call must be safe from the worker thread. Errors are per-item:
/// the worker logs them and moves on.
pub trait EntityStore: Send + Sync {
    /// Loads the current entity, or `None` if it no longer exists.
    fn load(&self, id: EntityId) -> SyncResult<Option<Entity>>;

    /// Loads the changes not yet acknowledged by the remote authority.
    fn load_outstanding_delta(&self, id: EntityId) -> SyncResult<Delta>;

    /// Applies a server-side delta to an entity, atomically for that entity.
    ///
    /// Applying the same delta twice must be harmless.
    fn apply_remote_update(&self, entity: Entity, delta: &Delta) -> SyncResult<()>;

    /// Clears outstanding changes recorded at or before `through`.
    fn acknowledge(&self, id: EntityId, through: Timestamp) -> SyncResult<()>;
}

/// Persistence of the last-synced watermark per entity type.
pub trait WatermarkStore: Send + Sync {
    /// Returns the watermark, 0 if the type never synced.
    fn get(&self, entity_type: EntityType) -> SyncResult<Timestamp>;

    /// Stores a new watermark.
    fn set(&self, entity_type: EntityType, timestamp: Timestamp) -> SyncResult<()>;
}

/// Monotonic millisecond clock for stamping local changes.
///
/// Follows wall-clock time but never repeats or goes backwards.
#[derive(Debug, Default)]
pub struct ChangeClock {
    last: AtomicU64,
}

impl ChangeClock {
    /// Creates a clock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a timestamp strictly greater than any previous one.
    pub fn now(&self) -> Timestamp {
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let mut current = self.last.load(Ordering::SeqCst);
        loop {
            let next = wall.max(current + 1);
            match self
                .last
                .compare_exchange(current, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }
}

#[derive(Debug, Clone)]
struct StoredEntity {
    entity: Entity,
    outstanding: Delta,
}

/// An in-memory entity store for one entity type.
///
/// Besides the [`EntityStore`] interface it offers the host-side mutation
/// helpers a real application would implement on top of its own storage:
/// every local write is applied to the entity and recorded in its
/// outstanding delta.
#[derive(Debug)]
pub struct MemoryEntityStore {
    entity_type: EntityType,
    entities: RwLock<HashMap<EntityId, StoredEntity>>,
    clock: ChangeClock,
}

impl MemoryEntityStore {
    /// Creates an empty store for `entity_type`.
    pub fn new(entity_type: EntityType) -> Self {
        Self {
            entity_type,
            entities: RwLock::new(HashMap::new()),
            clock: ChangeClock::new(),
        }
    }

    /// Returns the entity type this store holds.
    pub fn entity_type(&self) -> EntityType {
        self.entity_type
    }

    /// Sets a field locally and records it as outstanding.
    ///
    /// Creates the entity if it does not exist yet.
    pub fn write(&self, id: EntityId, field: &str, value: impl Into<Vec<u8>>) -> FieldChange {
        let change = FieldChange::set(field, value, self.clock.now());
        self.record(id, change.clone());
        change
    }

    /// Clears a field locally and records it as outstanding.
    pub fn clear(&self, id: EntityId, field: &str) -> FieldChange {
        let change = FieldChange::clear(field, self.clock.now());
        self.record(id, change.clone());
        change
    }

    fn record(&self, id: EntityId, change: FieldChange) {
        let mut entities = self.entities.write();
        let stored = entities.entry(id).or_insert_with(|| StoredEntity {
            entity: Entity::new(id, self.entity_type),
            outstanding: Delta::new(),
        });
        stored
            .entity
            .apply(&Delta::from_changes(vec![change.clone()]));
        stored.outstanding.push(change);
    }

    /// Deletes an entity and its outstanding changes.
    pub fn delete(&self, id: EntityId) -> bool {
        self.entities.write().remove(&id).is_some()
    }

    /// Returns a copy of an entity.
    pub fn get(&self, id: EntityId) -> Option<Entity> {
        self.entities.read().get(&id).map(|s| s.entity.clone())
    }

    /// Returns a copy of an entity's outstanding delta.
    pub fn outstanding(&self, id: EntityId) -> Delta {
        self.entities
            .read()
            .get(&id)
            .map(|s| s.outstanding.clone())
            .unwrap_or_default()
    }

    /// Returns the IDs of entities with unacknowledged changes.
    pub fn dirty_ids(&self) -> Vec<EntityId> {
        let mut ids: Vec<_> = self
            .entities
            .read()
            .iter()
            .filter(|(_, s)| !s.outstanding.is_empty())
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Returns the number of stored entities.
    pub fn len(&self) -> usize {
        self.entities.read().len()
    }

    /// Returns true if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.entities.read().is_empty()
    }

    fn check_type(&self, entity: &Entity) -> SyncResult<()> {
        if entity.entity_type != self.entity_type {
            return Err(SyncError::store(
                self.entity_type,
                entity.id,
                format!("entity has type {}", entity.entity_type),
            ));
        }
        Ok(())
    }
}

impl EntityStore for MemoryEntityStore {
    fn load(&self, id: EntityId) -> SyncResult<Option<Entity>> {
        Ok(self.get(id))
    }

    fn load_outstanding_delta(&self, id: EntityId) -> SyncResult<Delta> {
        Ok(self.outstanding(id))
    }

    fn apply_remote_update(&self, entity: Entity, delta: &Delta) -> SyncResult<()> {
        self.check_type(&entity)?;
        let mut entities = self.entities.write();
        // A concurrent local write may have landed since the worker loaded
        // `entity`; the stored copy wins as the base.
        let stored = entities.entry(entity.id).or_insert_with(|| StoredEntity {
            entity,
            outstanding: Delta::new(),
        });
        stored.entity.apply(delta);
        Ok(())
    }

    fn acknowledge(&self, id: EntityId, through: Timestamp) -> SyncResult<()> {
        if let Some(stored) = self.entities.write().get_mut(&id) {
            stored.outstanding.acknowledge(through);
        }
        Ok(())
    }
}

/// An in-memory watermark store.
#[derive(Debug, Default)]
pub struct MemoryWatermarkStore {
    watermarks: RwLock<HashMap<EntityType, Timestamp>>,
}

impl MemoryWatermarkStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl WatermarkStore for MemoryWatermarkStore {
    fn get(&self, entity_type: EntityType) -> SyncResult<Timestamp> {
        Ok(self
            .watermarks
            .read()
            .get(&entity_type)
            .copied()
            .unwrap_or(0))
    }

    fn set(&self, entity_type: EntityType, timestamp: Timestamp) -> SyncResult<()> {
        self.watermarks.write().insert(entity_type, timestamp);
        Ok(())
    }
}
