//! Snapshot-based dirty detection.
//!
//! A snapshot is the `(column, value)` list the entity mapper produced when
//! the entity became managed or was last flushed. Dirty checking re-runs the
//! mapper and compares column by column.

use persistctx_core::{Entity, Value, field::find_column};
use std::time::Instant;

/// Copy of an entity's column values at a point in time.
#[derive(Debug, Clone)]
pub struct Snapshot {
    values: Vec<(&'static str, Value)>,
    taken_at: Instant,
}

impl Snapshot {
    /// Take a snapshot of mapper output.
    pub fn take(values: Vec<(&'static str, Value)>) -> Self {
        Self {
            values,
            taken_at: Instant::now(),
        }
    }

    /// Value of one column at snapshot time.
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.values
            .iter()
            .find(|(name, _)| *name == column)
            .map(|(_, v)| v)
    }

    pub fn values(&self) -> &[(&'static str, Value)] {
        &self.values
    }

    /// Get the timestamp when the snapshot was taken.
    pub fn taken_at(&self) -> Instant {
        self.taken_at
    }

    /// Columns of `current` whose value differs from the snapshot.
    ///
    /// Returns the changed `(column, new value)` pairs in mapper order.
    /// Columns missing from the snapshot count as changed.
    pub fn changed_columns(
        &self,
        current: &[(&'static str, Value)],
    ) -> Vec<(&'static str, Value)> {
        let changed: Vec<(&'static str, Value)> = current
            .iter()
            .filter(|(column, value)| {
                self.get(column)
                    .is_none_or(|original| !original.same_key(value))
            })
            .cloned()
            .collect();
        tracing::trace!(
            changed_count = changed.len(),
            columns = ?changed.iter().map(|(c, _)| *c).collect::<Vec<_>>(),
            "Dirty check result"
        );
        changed
    }

    /// Whether any column of `current` differs from the snapshot.
    pub fn is_dirty(&self, current: &[(&'static str, Value)]) -> bool {
        current.iter().any(|(column, value)| {
            self.get(column)
                .is_none_or(|original| !original.same_key(value))
        })
    }

    /// Export the snapshot as a JSON object keyed by column name.
    pub fn to_json(&self) -> serde_json::Value {
        let map: serde_json::Map<String, serde_json::Value> = self
            .values
            .iter()
            .map(|(column, value)| {
                (
                    (*column).to_string(),
                    serde_json::to_value(value).unwrap_or(serde_json::Value::Null),
                )
            })
            .collect();
        serde_json::Value::Object(map)
    }
}

/// Translate changed column names into entity field names.
pub fn changed_fields<E: Entity>(changed: &[(&'static str, Value)]) -> Vec<&'static str> {
    changed
        .iter()
        .map(|(column, _)| find_column(E::fields(), column).map_or(*column, |f| f.name))
        .collect()
}
