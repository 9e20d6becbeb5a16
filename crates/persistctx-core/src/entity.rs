//! Entity mapper trait.
//!
//! The `Entity` trait is the per-type contract between a Rust struct and the
//! rows a storage backend speaks: static column metadata, conversion to and
//! from rows, and primary-key access.

use crate::Result;
use crate::field::FieldInfo;
use crate::row::Row;
use crate::value::Value;
use std::cell::RefCell;
use std::rc::Rc;

/// Shared handle to a managed entity.
///
/// The persistence context hands out the same handle for every lookup of a
/// given key, so `Rc::ptr_eq` is the identity test.
pub type EntityRef<E> = Rc<RefCell<E>>;

/// How an entity's primary key is produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyStrategy {
    /// The caller sets the key before `persist`.
    #[default]
    Assigned,
    /// The backend hands out the next key of a per-table sequence when the
    /// entity is persisted.
    Sequence,
}

/// Metadata about a many-to-one association carried by a `Lazy` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssociationInfo {
    /// Name of the association field, also used as the join alias.
    pub name: &'static str,
    /// The target entity's table name.
    pub target_table: &'static str,
    /// Local foreign key column, e.g. `"team_id"` on `Player`.
    pub foreign_key: &'static str,
}

impl AssociationInfo {
    /// Create a new association descriptor.
    pub const fn new(
        name: &'static str,
        target_table: &'static str,
        foreign_key: &'static str,
    ) -> Self {
        Self {
            name,
            target_table,
            foreign_key,
        }
    }
}

/// Trait for types the persistence context can manage.
///
/// # Example
///
/// ```ignore
/// struct Person {
///     id: Option<i64>,
///     name: String,
/// }
///
/// impl Entity for Person {
///     const ENTITY_NAME: &'static str = "Person";
///     const TABLE_NAME: &'static str = "person";
///     const KEY_COLUMN: &'static str = "id";
///     const KEY_STRATEGY: KeyStrategy = KeyStrategy::Sequence;
///
///     fn fields() -> &'static [FieldInfo] {
///         const FIELDS: &[FieldInfo] = &[
///             FieldInfo::new("id").primary_key(true),
///             FieldInfo::new("name"),
///         ];
///         FIELDS
///     }
///     // to_row / from_row / primary_key_value / set_primary_key ...
/// }
/// ```
pub trait Entity: Sized + 'static {
    /// Name used in logs and error messages.
    const ENTITY_NAME: &'static str;

    /// The name of the backend table.
    const TABLE_NAME: &'static str;

    /// The primary key column name.
    const KEY_COLUMN: &'static str;

    /// How keys are produced for new instances.
    const KEY_STRATEGY: KeyStrategy = KeyStrategy::Assigned;

    /// Many-to-one associations of this entity.
    const ASSOCIATIONS: &'static [AssociationInfo] = &[];

    /// Get field metadata for all columns.
    fn fields() -> &'static [FieldInfo];

    /// Convert this instance to `(column, value)` pairs, one per field.
    fn to_row(&self) -> Vec<(&'static str, Value)>;

    /// Construct an instance from a backend row.
    fn from_row(row: &Row) -> Result<Self>;

    /// Get the primary key value, or `None` if it has not been set.
    fn primary_key_value(&self) -> Option<Value>;

    /// Store a generated primary key.
    fn set_primary_key(&mut self, key: Value) -> Result<()>;

    /// Check if this is a new record (no key yet).
    fn is_new(&self) -> bool {
        self.primary_key_value().is_none_or(|k| k.is_null())
    }

    /// Look up an association descriptor by field name.
    fn association(name: &str) -> Option<&'static AssociationInfo> {
        Self::ASSOCIATIONS.iter().find(|a| a.name == name)
    }

    /// Column names in field order.
    fn column_names() -> Vec<&'static str> {
        Self::fields().iter().map(|f| f.column_name).collect()
    }
}
