//! Entity and delta envelopes.
//!
//! The sync engine never interprets field contents. An entity is a bag of
//! named byte fields, each stamped with the time it last changed, and a
//! delta is a list of such stamped field changes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Local identifier of an entity within its type.
pub type EntityId = u64;

/// Milliseconds since the Unix epoch. `0` means "never".
pub type Timestamp = u64;

/// Opaque entity type tag.
///
/// The host application defines its own constants; the engine only uses the
/// tag as a key into its store registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityType(u16);

impl EntityType {
    /// Creates an entity type from its numeric tag.
    pub const fn new(tag: u16) -> Self {
        Self(tag)
    }

    /// Returns the numeric tag.
    pub const fn tag(&self) -> u16 {
        self.0
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "type#{}", self.0)
    }
}

/// A single field-level change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldChange {
    /// Field name.
    pub field: String,
    /// New value, or `None` if the field was cleared.
    pub value: Option<Vec<u8>>,
    /// When the change was recorded.
    pub changed_at: Timestamp,
}

impl FieldChange {
    /// Creates a change that sets a field.
    pub fn set(field: impl Into<String>, value: impl Into<Vec<u8>>, changed_at: Timestamp) -> Self {
        Self {
            field: field.into(),
            value: Some(value.into()),
            changed_at,
        }
    }

    /// Creates a change that clears a field.
    pub fn clear(field: impl Into<String>, changed_at: Timestamp) -> Self {
        Self {
            field: field.into(),
            value: None,
            changed_at,
        }
    }
}

/// Field changes not yet acknowledged by the remote authority.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delta {
    /// Changes in recording order.
    pub changes: Vec<FieldChange>,
}

impl Delta {
    /// Creates an empty delta.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a delta from a list of changes.
    pub fn from_changes(changes: Vec<FieldChange>) -> Self {
        Self { changes }
    }

    /// Returns true if there is nothing to send.
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Returns the number of changes.
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// Records a change.
    pub fn push(&mut self, change: FieldChange) {
        self.changes.push(change);
    }

    /// The newest `changed_at` in this delta, or 0 if empty.
    ///
    /// Used as the acknowledgement watermark for the whole delta.
    pub fn through(&self) -> Timestamp {
        self.changes.iter().map(|c| c.changed_at).max().unwrap_or(0)
    }

    /// Drops every change recorded at or before `through`.
    pub fn acknowledge(&mut self, through: Timestamp) {
        self.changes.retain(|c| c.changed_at > through);
    }

    /// Collapses repeated writes to the same field, keeping the newest.
    ///
    /// The result is ordered by field name.
    pub fn compact(&self) -> Delta {
        let mut latest: BTreeMap<&str, &FieldChange> = BTreeMap::new();
        for change in &self.changes {
            match latest.get(change.field.as_str()) {
                Some(existing) if existing.changed_at > change.changed_at => {}
                _ => {
                    latest.insert(change.field.as_str(), change);
                }
            }
        }
        Delta {
            changes: latest.into_values().cloned().collect(),
        }
    }
}

/// Stored value of one entity field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldValue {
    /// Current value, `None` if cleared.
    pub value: Option<Vec<u8>>,
    /// When the value was last written.
    pub changed_at: Timestamp,
}

/// The current local state of an entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    /// Entity ID.
    pub id: EntityId,
    /// Entity type.
    pub entity_type: EntityType,
    /// Field values by name.
    pub fields: BTreeMap<String, FieldValue>,
    /// Newest write across all fields.
    pub updated_at: Timestamp,
}

impl Entity {
    /// Creates an entity with no fields.
    pub fn new(id: EntityId, entity_type: EntityType) -> Self {
        Self {
            id,
            entity_type,
            fields: BTreeMap::new(),
            updated_at: 0,
        }
    }

    /// Returns the current value of a field.
    pub fn get(&self, field: &str) -> Option<&[u8]> {
        self.fields
            .get(field)
            .and_then(|v| v.value.as_deref())
    }

    /// Applies a delta with per-field last-writer-wins.
    ///
    /// A change only lands if it is strictly newer than what the field
    /// already holds, so applying the same delta twice is a no-op.
    /// Returns the number of fields that changed.
    pub fn apply(&mut self, delta: &Delta) -> usize {
        let mut applied = 0;
        for change in &delta.changes {
            let newer = self
                .fields
                .get(&change.field)
                .map_or(true, |current| change.changed_at > current.changed_at);
            if newer {
                self.fields.insert(
                    change.field.clone(),
                    FieldValue {
                        value: change.value.clone(),
                        changed_at: change.changed_at,
                    },
                );
                self.updated_at = self.updated_at.max(change.changed_at);
                applied += 1;
            }
        }
        applied
    }
}
