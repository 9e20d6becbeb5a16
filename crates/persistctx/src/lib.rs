//! persistctx - a persistence context for Rust.
//!
//! A persistence context is the unit-of-work layer between application code
//! and a storage backend:
//!
//! - **Identity map**: one in-memory instance per (entity type, key) within a
//!   unit of work
//! - **Transparent dirty checking**: mutate a managed entity and the change is
//!   written at the next flush, one `UPDATE` of the changed columns per entity
//! - **Write-behind**: inserts, updates and deletes are queued and sent in
//!   order on flush, commit, or before a read they could affect
//! - **Lazy associations**: many-to-one references resolved on first access,
//!   by fetch join, or in batches
//!
//! # Quick Start
//!
//! ```ignore
//! use persistctx::prelude::*;
//!
//! struct Person {
//!     id: Option<i64>,
//!     name: String,
//! }
//!
//! impl Entity for Person {
//!     const ENTITY_NAME: &'static str = "Person";
//!     const TABLE_NAME: &'static str = "person";
//!     const KEY_COLUMN: &'static str = "id";
//!     const KEY_STRATEGY: KeyStrategy = KeyStrategy::Sequence;
//!
//!     fn fields() -> &'static [FieldInfo] {
//!         const FIELDS: &[FieldInfo] = &[
//!             FieldInfo::new("id").primary_key(true),
//!             FieldInfo::new("name"),
//!         ];
//!         FIELDS
//!     }
//!
//!     fn to_row(&self) -> Vec<(&'static str, Value)> {
//!         vec![("id", self.id.into()), ("name", self.name.clone().into())]
//!     }
//!
//!     fn from_row(row: &Row) -> Result<Self> {
//!         Ok(Self { id: row.get_named("id")?, name: row.get_named("name")? })
//!     }
//!
//!     fn primary_key_value(&self) -> Option<Value> {
//!         self.id.map(Value::BigInt)
//!     }
//!
//!     fn set_primary_key(&mut self, key: Value) -> Result<()> {
//!         self.id = Some(i64::try_from(key)?);
//!         Ok(())
//!     }
//! }
//!
//! fn main() -> Result<()> {
//!     let mut backend = MemoryBackend::new();
//!     backend.create_table::<Person>()?;
//!
//!     let unit = PersistenceUnit::new(PersistenceUnitConfig::from_env()?);
//!     let mut ctx = unit.context(backend);
//!
//!     let ryan = ctx.persist(Person { id: None, name: "ryan".into() })?;
//!     let id = ryan.borrow().id;
//!     let same = ctx.find::<Person>(id)?;          // no read: identity map
//!     ryan.borrow_mut().name = "Ryan".into();      // tracked
//!
//!     let people = ctx.query_list(
//!         &Query::<Person>::new().filter(Condition::col("name").like("R%")),
//!     )?;                                          // auto-flushes first
//!     ctx.commit()?;
//!     Ok(())
//! }
//! ```
//!
//! # Crates
//!
//! - `persistctx-core`: values, rows, the `Entity` trait, statements, queries,
//!   the `StorageBackend` trait and `Lazy`
//! - `persistctx-session`: `PersistenceContext` and its configuration
//! - `persistctx-memory`: the in-memory `MemoryBackend`

pub use persistctx_core::{
    AssociationInfo, BackendError, BackendErrorKind, ColumnRef, CompareOp, Condition,
    ConfigError, DeleteStatement, DuplicateKeyError, Entity, EntityRef, Error, FieldInfo,
    FlushError, FromValue, InsertStatement, JoinClause, KeyStrategy, Lazy, LazyLoader,
    MappingError, NonUniqueError, NotFoundError, OrderBy, OrderDirection, Query, Result, Row,
    SelectStatement, StateError, Statement, StatementKind, StorageBackend, TypeError,
    UpdateStatement, Value, is_loaded,
};

pub use persistctx_session::{
    EntityState, FlushMode, FlushResult, PersistenceContext, PersistenceUnit,
    PersistenceUnitConfig, Snapshot,
};

pub use persistctx_memory::{MemoryBackend, MemoryConfig, TransactionStats};

/// Prelude module for convenient imports.
///
/// ```ignore
/// use persistctx::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        AssociationInfo, Condition, Entity, EntityRef, EntityState, Error, FieldInfo,
        FlushMode, KeyStrategy, Lazy, MemoryBackend, OrderBy, PersistenceContext,
        PersistenceUnit, PersistenceUnitConfig, Query, Result, Row, StorageBackend, Value,
        is_loaded,
    };
}
