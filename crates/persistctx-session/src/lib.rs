//! Persistence context for persistctx.
//!
//! `persistctx-session` is the **unit-of-work layer**. A [`PersistenceContext`]
//! sits between application code and a [`StorageBackend`] and keeps:
//!
//! - **Identity**: one managed instance per (entity type, primary key), so two
//!   lookups of the same key hand back the same `Rc`.
//! - **Dirty checking**: a snapshot of each managed entity's columns. Plain
//!   field mutation is detected at flush time and becomes one `UPDATE` of the
//!   changed columns per entity.
//! - **Write-behind**: inserts, updates and deletes are queued and sent to the
//!   backend in queue order when the context flushes, which happens on
//!   `flush()`, on `commit()`, and (in [`FlushMode::Auto`]) before any read
//!   the pending writes could affect.
//! - **Lazy associations**: [`Lazy`] fields resolve through the context on
//!   first access, or in bulk through fetch joins and [`PersistenceContext::load_many`].
//!
//! # Example
//!
//! ```ignore
//! let unit = PersistenceUnit::new(PersistenceUnitConfig::from_env()?);
//! let mut ctx = unit.context(MemoryBackend::new());
//!
//! let ryan = ctx.persist(Person::new("ryan"))?;      // queued INSERT
//! let again = ctx.find::<Person>(ryan.borrow().id)?;  // identity map hit, no read
//! ryan.borrow_mut().name = "Ryan".into();             // tracked by snapshot
//! ctx.commit()?;                                      // INSERT, UPDATE, COMMIT
//! ```
//!
//! Handles are `Rc<RefCell<E>>`, so a context and its entities stay on one
//! thread.

pub mod change_tracker;
pub mod config;
pub mod flush;
pub mod identity_map;

pub use change_tracker::Snapshot;
pub use config::{FlushMode, PersistenceUnit, PersistenceUnitConfig};
pub use flush::{FlushResult, QueuedStatement, WriteBehindQueue};
pub use identity_map::{IdentityMap, ObjectKey};

use change_tracker::changed_fields;
use persistctx_core::field::find_column;
use persistctx_core::{
    BackendErrorKind, Condition, DeleteStatement, Entity, EntityRef, Error, InsertStatement,
    JoinClause, KeyStrategy, Lazy, LazyLoader, MappingError, NonUniqueError, NotFoundError, Query,
    Result, Row, StateError, Statement, StorageBackend, UpdateStatement, Value,
};
use std::cell::{Ref, RefCell};
use std::fmt;
use std::rc::Rc;

// ============================================================================
// Entity State
// ============================================================================

/// Lifecycle state of an entity relative to one persistence context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityState {
    /// Never persisted, no key yet.
    Transient,
    /// In the identity map and dirty-checked.
    Managed,
    /// Scheduled for deletion; leaves the identity map once the delete runs.
    Removed,
    /// Has a key but is not tracked by this context.
    Detached,
}

impl EntityState {
    pub fn as_str(self) -> &'static str {
        match self {
            EntityState::Transient => "transient",
            EntityState::Managed => "managed",
            EntityState::Removed => "removed",
            EntityState::Detached => "detached",
        }
    }
}

impl fmt::Display for EntityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Persistence Context
// ============================================================================

/// One unit of work over a storage backend.
pub struct PersistenceContext<B: StorageBackend> {
    backend: B,
    config: PersistenceUnitConfig,
    identity_map: IdentityMap,
    queue: WriteBehindQueue,
    in_transaction: bool,
}

impl<B: StorageBackend> PersistenceContext<B> {
    /// Create a context with the default configuration.
    pub fn new(backend: B) -> Self {
        Self::with_config(backend, PersistenceUnitConfig::default())
    }

    /// Create a context with custom configuration.
    pub fn with_config(backend: B, config: PersistenceUnitConfig) -> Self {
        Self {
            backend,
            config,
            identity_map: IdentityMap::new(),
            queue: WriteBehindQueue::new(),
            in_transaction: false,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Give the backend back, dropping all tracking state.
    pub fn into_backend(self) -> B {
        self.backend
    }

    pub fn config(&self) -> &PersistenceUnitConfig {
        &self.config
    }

    /// Whether a backend transaction is open.
    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    /// Number of entities currently in the Managed state.
    pub fn managed_count(&self) -> usize {
        self.identity_map
            .iter()
            .filter(|(_, e)| e.state == EntityState::Managed)
            .count()
    }

    /// Number of statements waiting in the write-behind queue.
    pub fn pending_count(&self) -> usize {
        self.queue.len()
    }

    /// The write-behind queue, front first.
    pub fn pending(&self) -> impl Iterator<Item = &QueuedStatement> {
        self.queue.iter()
    }

    // ========================================================================
    // Lifecycle operations
    // ========================================================================

    /// Make a new entity managed and queue its INSERT.
    ///
    /// Keys of [`KeyStrategy::Sequence`] entities are drawn from the backend
    /// here. An entity without a key under [`KeyStrategy::Assigned`] is
    /// rejected, as is a key that is already managed or removed.
    #[tracing::instrument(level = "debug", skip(self, entity), fields(entity = E::ENTITY_NAME))]
    pub fn persist<E: Entity>(&mut self, mut entity: E) -> Result<EntityRef<E>> {
        if entity.is_new() {
            match E::KEY_STRATEGY {
                KeyStrategy::Sequence => {
                    let key = self.backend.next_key(E::TABLE_NAME)?;
                    tracing::trace!(key = %key, "Generated primary key");
                    entity.set_primary_key(key)?;
                }
                KeyStrategy::Assigned => {
                    return Err(Error::invalid_state(
                        E::ENTITY_NAME,
                        "primary key must be assigned before persist",
                    ));
                }
            }
        }
        let key = entity
            .primary_key_value()
            .filter(|k| !k.is_null())
            .ok_or_else(|| Error::invalid_state(E::ENTITY_NAME, "entity has no primary key"))?;

        let row = entity.to_row();
        check_mapping::<E>(&row)?;

        let handle = Rc::new(RefCell::new(entity));
        self.identity_map
            .insert(key.clone(), &handle, Snapshot::take(row.clone()))?;
        self.queue.push(QueuedStatement {
            statement: Statement::Insert(InsertStatement {
                table: E::TABLE_NAME.to_string(),
                values: row.into_iter().map(|(c, v)| (c.to_string(), v)).collect(),
            }),
            entity: E::ENTITY_NAME,
            key: ObjectKey::of::<E>(key.clone()),
        });
        tracing::debug!(key = %key, "Entity is now managed");
        Ok(handle)
    }

    /// Look up an entity by primary key.
    ///
    /// A managed instance is returned without touching the backend. Otherwise
    /// one read is issued and the row, if any, becomes managed. A removed
    /// instance reads as `None`.
    #[tracing::instrument(level = "debug", skip(self, key), fields(entity = E::ENTITY_NAME))]
    pub fn find<E: Entity>(&mut self, key: impl Into<Value>) -> Result<Option<EntityRef<E>>> {
        let key = key.into();
        if let Some((handle, state)) = self.identity_map.handle::<E>(&key) {
            tracing::trace!(key = %key, state = state.as_str(), "Identity map hit");
            return Ok((state == EntityState::Managed).then_some(handle));
        }

        tracing::trace!(key = %key, "Identity map miss");
        self.ensure_transaction()?;
        let select = Query::<E>::by_key(key).to_select();
        let rows = self.run_query(&Statement::Select(select))?;
        match rows.first() {
            Some(row) => self.materialize::<E>(row),
            None => Ok(None),
        }
    }

    /// Like [`find`](Self::find), but a missing row is [`Error::NotFound`].
    pub fn get<E: Entity>(&mut self, key: impl Into<Value>) -> Result<EntityRef<E>> {
        let key = key.into();
        self.find::<E>(key.clone())?.ok_or_else(|| {
            Error::NotFound(NotFoundError {
                entity: E::ENTITY_NAME,
                key: Some(key),
            })
        })
    }

    /// A lazy reference to the entity with `key`, without reading it.
    ///
    /// Already managed instances come back resolved.
    pub fn reference<E: Entity>(&self, key: impl Into<Value>) -> Lazy<E> {
        let key = key.into();
        match self.identity_map.handle::<E>(&key) {
            Some((handle, EntityState::Managed)) => Lazy::resolved(Some(handle)),
            _ => Lazy::from_key(key),
        }
    }

    /// Schedule a managed entity for deletion.
    ///
    /// The entity is no longer dirty-checked, so changes made to it before the
    /// flush are never written.
    #[tracing::instrument(level = "debug", skip(self, handle), fields(entity = E::ENTITY_NAME))]
    pub fn remove<E: Entity>(&mut self, handle: &EntityRef<E>) -> Result<()> {
        let Some(key) = self.identity_map.key_of(handle).cloned() else {
            return Err(Error::InvalidState(StateError {
                entity: E::ENTITY_NAME,
                key: handle.try_borrow().ok().and_then(|e| e.primary_key_value()),
                message: "entity is not managed by this context".to_string(),
            }));
        };
        let Some(entry) = self.identity_map.get_mut(&key) else {
            return Err(Error::invalid_state(E::ENTITY_NAME, "identity map entry vanished"));
        };
        if entry.state == EntityState::Removed {
            return Err(Error::InvalidState(StateError {
                entity: E::ENTITY_NAME,
                key: Some(key.key().clone()),
                message: "entity is already removed".to_string(),
            }));
        }
        entry.state = EntityState::Removed;
        self.queue.push(QueuedStatement {
            statement: Statement::Delete(DeleteStatement {
                table: E::TABLE_NAME.to_string(),
                key_column: E::KEY_COLUMN.to_string(),
                key: key.key().clone(),
            }),
            entity: E::ENTITY_NAME,
            key: key.clone(),
        });
        tracing::debug!(key = %key.key(), "Entity scheduled for removal");
        Ok(())
    }

    /// Stop tracking one entity and drop its queued statements.
    ///
    /// Returns `false` if the handle was not tracked.
    pub fn detach<E: Entity>(&mut self, handle: &EntityRef<E>) -> bool {
        let Some(key) = self.identity_map.key_of(handle).cloned() else {
            return false;
        };
        let discarded = self.queue.discard_for(&key);
        self.identity_map.remove(&key);
        tracing::debug!(
            entity = E::ENTITY_NAME,
            key = %key.key(),
            discarded,
            "Detached entity"
        );
        true
    }

    /// Detach every entity and discard all queued statements.
    ///
    /// The unit of work stays open; an active transaction is left alone.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn clear(&mut self) {
        let detached = self.identity_map.len();
        let discarded = self.queue.clear();
        self.identity_map.clear();
        tracing::debug!(detached, discarded, "Cleared persistence context");
    }

    // ========================================================================
    // Flush / transaction
    // ========================================================================

    /// Begin a backend transaction.
    pub fn begin(&mut self) -> Result<()> {
        if self.in_transaction {
            return Err(Error::backend(
                BackendErrorKind::Transaction,
                "transaction already active",
            ));
        }
        self.backend.begin()?;
        self.in_transaction = true;
        tracing::debug!("Transaction started");
        Ok(())
    }

    /// Queue updates for dirty entities, then send the whole queue to the
    /// backend in order.
    ///
    /// On failure the error is an [`Error::Flush`] carrying the position of
    /// the failing statement. Statements before it stay executed; it and its
    /// successors stay queued until [`rollback`](Self::rollback).
    #[tracing::instrument(level = "info", skip(self), fields(managed = self.identity_map.len()))]
    pub fn flush(&mut self) -> Result<FlushResult> {
        self.queue_dirty_updates()?;
        if self.queue.is_empty() {
            tracing::debug!("Nothing to flush");
            return Ok(FlushResult::new());
        }
        self.ensure_transaction()?;

        let outcome = self.queue.execute(&mut self.backend);
        let queue = &self.queue;
        let evicted = self
            .identity_map
            .evict_removed(|key| queue.has_pending_delete(key));
        let result = outcome?;

        tracing::info!(
            inserted = result.inserted,
            updated = result.updated,
            deleted = result.deleted,
            evicted,
            "Flush complete"
        );
        Ok(result)
    }

    /// Flush, commit the backend transaction and end the unit of work.
    ///
    /// With `clear_on_commit` (the default) every entity becomes detached.
    /// On failure nothing is cleared and the caller should roll back.
    #[tracing::instrument(level = "info", skip(self))]
    pub fn commit(&mut self) -> Result<FlushResult> {
        let result = self.flush()?;
        if self.in_transaction {
            self.backend.commit()?;
            self.in_transaction = false;
        }
        if self.config.clear_on_commit {
            self.identity_map.clear();
        }
        tracing::info!(statements = result.total(), "Committed");
        Ok(result)
    }

    /// Discard queued statements and the identity map, then roll back the
    /// backend transaction if one is open.
    #[tracing::instrument(level = "info", skip(self))]
    pub fn rollback(&mut self) -> Result<()> {
        let discarded = self.queue.clear();
        let detached = self.identity_map.len();
        self.identity_map.clear();
        if self.in_transaction {
            self.in_transaction = false;
            self.backend.rollback()?;
        }
        tracing::info!(discarded, detached, "Rolled back");
        Ok(())
    }

    fn ensure_transaction(&mut self) -> Result<()> {
        if self.config.auto_begin && !self.in_transaction {
            self.begin()?;
        }
        Ok(())
    }

    /// Append one UPDATE per dirty managed entity and refresh its snapshot.
    fn queue_dirty_updates(&mut self) -> Result<()> {
        let mut dirty = Vec::new();
        for (key, entry) in self.identity_map.iter() {
            if entry.state != EntityState::Managed {
                continue;
            }
            let current = entry.slot().current_row()?;
            let changed = entry.snapshot.changed_columns(&current);
            if changed.is_empty() {
                continue;
            }
            let slot = entry.slot();
            if changed.iter().any(|(column, _)| *column == slot.key_column()) {
                return Err(Error::InvalidState(StateError {
                    entity: slot.entity_name(),
                    key: Some(key.key().clone()),
                    message: "primary key of a managed entity was changed".to_string(),
                }));
            }
            dirty.push((key.clone(), current, changed));
        }

        for (key, current, changed) in dirty {
            let Some(entry) = self.identity_map.get_mut(&key) else {
                continue;
            };
            let slot = entry.slot();
            let entity = slot.entity_name();
            let statement = Statement::Update(UpdateStatement {
                table: slot.table_name().to_string(),
                key_column: slot.key_column().to_string(),
                key: key.key().clone(),
                assignments: changed
                    .into_iter()
                    .map(|(c, v)| (c.to_string(), v))
                    .collect(),
            });
            entry.snapshot = Snapshot::take(current);
            self.queue.push(QueuedStatement {
                statement,
                entity,
                key,
            });
        }
        Ok(())
    }

    /// Whether a flush would send anything.
    fn has_pending_changes(&self) -> bool {
        if !self.queue.is_empty() {
            return true;
        }
        self.identity_map.iter().any(|(_, entry)| {
            entry.state == EntityState::Managed
                && match entry.slot().current_row() {
                    Ok(row) => entry.snapshot.is_dirty(&row),
                    Err(_) => true,
                }
        })
    }

    /// Flush before a read when the flush mode asks for it.
    fn auto_flush(&mut self) -> Result<()> {
        if self.config.flush_mode == FlushMode::Auto && self.has_pending_changes() {
            tracing::debug!("Auto-flushing before read");
            self.flush()?;
        }
        Ok(())
    }

    fn run_query(&mut self, statement: &Statement) -> Result<Vec<Row>> {
        tracing::debug!(sql = %statement, "Executing query");
        let rows = self.backend.execute_query(statement)?;
        tracing::trace!(rows = rows.len(), "Query returned");
        Ok(rows)
    }

    /// Turn a row into a managed handle.
    ///
    /// An instance already in the identity map wins over the row; a removed
    /// one makes the row disappear from the result.
    fn materialize<E: Entity>(&mut self, row: &Row) -> Result<Option<EntityRef<E>>> {
        let entity = E::from_row(row)?;
        let key = entity
            .primary_key_value()
            .filter(|k| !k.is_null())
            .ok_or_else(|| {
                Error::Mapping(MappingError {
                    entity: E::ENTITY_NAME,
                    message: "row carries no primary key".to_string(),
                })
            })?;
        if let Some((handle, state)) = self.identity_map.handle::<E>(&key) {
            tracing::trace!(key = %key, state = state.as_str(), "Keeping tracked instance over fresh row");
            return Ok((state == EntityState::Managed).then_some(handle));
        }
        let snapshot = Snapshot::take(entity.to_row());
        let handle = Rc::new(RefCell::new(entity));
        self.identity_map.insert(key, &handle, snapshot)?;
        Ok(Some(handle))
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// All entities matching `query`, in backend order.
    #[tracing::instrument(level = "debug", skip(self, query), fields(entity = E::ENTITY_NAME))]
    pub fn query_list<E: Entity>(&mut self, query: &Query<E>) -> Result<Vec<EntityRef<E>>> {
        self.auto_flush()?;
        self.ensure_transaction()?;
        let rows = self.run_query(&Statement::Select(query.to_select()))?;
        let mut results = Vec::with_capacity(rows.len());
        for row in &rows {
            if let Some(handle) = self.materialize::<E>(row)? {
                results.push(handle);
            }
        }
        Ok(results)
    }

    /// Exactly one matching entity.
    ///
    /// No match is [`Error::NotFound`]; several are [`Error::NonUniqueResult`].
    pub fn query_one<E: Entity>(&mut self, query: &Query<E>) -> Result<EntityRef<E>> {
        let mut results = self.query_list(query)?;
        match results.len() {
            0 => Err(Error::NotFound(NotFoundError {
                entity: E::ENTITY_NAME,
                key: None,
            })),
            1 => Ok(results.remove(0)),
            count => Err(Error::NonUniqueResult(NonUniqueError {
                entity: E::ENTITY_NAME,
                count,
            })),
        }
    }

    /// The first matching entity, if any.
    ///
    /// Rows of removed instances are skipped, so the backend is asked for one
    /// extra row per pending removal of `E`.
    pub fn query_first<E: Entity>(&mut self, query: &Query<E>) -> Result<Option<EntityRef<E>>> {
        self.auto_flush()?;
        let wanted = 1 + self.identity_map.removed_count::<E>() as u64;
        let limit = query.limit_value().map_or(wanted, |l| l.min(wanted));
        let first = query.clone().limit(limit);
        Ok(self.query_list(&first)?.into_iter().next())
    }

    /// Number of rows matching `query`.
    #[tracing::instrument(level = "debug", skip(self, query), fields(entity = E::ENTITY_NAME))]
    pub fn count<E: Entity>(&mut self, query: &Query<E>) -> Result<u64> {
        self.auto_flush()?;
        self.ensure_transaction()?;
        let rows = self.run_query(&Statement::Select(query.to_count()))?;
        let row = rows.first().ok_or_else(|| {
            Error::backend(BackendErrorKind::Other, "count query returned no row")
        })?;
        let count: i64 = row.get_named("count")?;
        u64::try_from(count).map_err(|_| {
            Error::backend(BackendErrorKind::Other, format!("negative row count {count}"))
        })
    }

    /// Load owners and one many-to-one association in a single round trip.
    ///
    /// Each owner's `Lazy` field (picked by `accessor`) comes back resolved.
    /// Fields that were already resolved keep their target.
    #[tracing::instrument(level = "debug", skip(self, query, accessor), fields(entity = E::ENTITY_NAME))]
    pub fn query_fetch_join<E, T, F>(
        &mut self,
        query: &Query<E>,
        association: &str,
        accessor: F,
    ) -> Result<Vec<EntityRef<E>>>
    where
        E: Entity,
        T: Entity,
        F: Fn(&E) -> &Lazy<T>,
    {
        let info = E::association(association).ok_or_else(|| {
            Error::Mapping(MappingError {
                entity: E::ENTITY_NAME,
                message: format!("no association named '{association}'"),
            })
        })?;
        if info.target_table != T::TABLE_NAME {
            return Err(Error::Mapping(MappingError {
                entity: E::ENTITY_NAME,
                message: format!(
                    "association '{}' targets table '{}', not '{}'",
                    info.name,
                    info.target_table,
                    T::TABLE_NAME
                ),
            }));
        }

        self.auto_flush()?;
        self.ensure_transaction()?;
        let join = JoinClause {
            table: T::TABLE_NAME.to_string(),
            alias: info.name.to_string(),
            local_column: info.foreign_key.to_string(),
            target_column: T::KEY_COLUMN.to_string(),
            columns: T::column_names().into_iter().map(String::from).collect(),
        };
        let rows = self.run_query(&Statement::Select(query.to_join_select(join)))?;

        let mut owners = Vec::with_capacity(rows.len());
        for row in &rows {
            let target = match row.subrow(info.name) {
                Some(sub)
                    if sub
                        .get_by_name(T::KEY_COLUMN)
                        .is_some_and(|k| !k.is_null()) =>
                {
                    self.materialize::<T>(&sub)?
                }
                _ => None,
            };
            let Some(owner) = self.materialize::<E>(row)? else {
                continue;
            };
            let fresh = accessor(&*borrow_entity(&owner)?).set_resolved(target);
            if !fresh {
                tracing::trace!(association = info.name, "Association already resolved");
            }
            owners.push(owner);
        }
        Ok(owners)
    }

    // ========================================================================
    // Associations
    // ========================================================================

    /// Resolve a lazy association through this context.
    ///
    /// The first call reads the target (after an auto-flush) unless it is
    /// already managed; later calls return the cached target.
    pub fn load<T: Entity>(&mut self, lazy: &Lazy<T>) -> Result<Option<EntityRef<T>>> {
        lazy.load(self)
    }

    /// Resolve the association picked by `accessor` on every owner, reading
    /// all missing targets with one query.
    ///
    /// Returns how many owners ended up pointing at an entity.
    #[tracing::instrument(level = "debug", skip(self, owners, accessor), fields(owners = owners.len()))]
    pub fn load_many<P, T, F>(&mut self, owners: &[EntityRef<P>], accessor: F) -> Result<usize>
    where
        P: Entity,
        T: Entity,
        F: Fn(&P) -> &Lazy<T>,
    {
        let mut resolved = 0;
        let mut missing: Vec<Value> = Vec::new();
        for owner in owners {
            let owner = borrow_entity(owner)?;
            let lazy = accessor(&owner);
            if lazy.is_resolved() {
                continue;
            }
            let Some(key) = lazy.key() else {
                lazy.set_resolved(None);
                continue;
            };
            match self.identity_map.handle::<T>(&key) {
                Some((target, EntityState::Managed)) => {
                    lazy.set_resolved(Some(target));
                    resolved += 1;
                }
                _ => {
                    if !missing.iter().any(|k| k.same_key(&key)) {
                        missing.push(key);
                    }
                }
            }
        }

        if missing.is_empty() {
            tracing::debug!(resolved, "All associations resolved from identity map");
            return Ok(resolved);
        }

        tracing::info!(
            owner = P::ENTITY_NAME,
            target = T::ENTITY_NAME,
            keys = missing.len(),
            "Batch loading associations"
        );
        self.auto_flush()?;
        self.ensure_transaction()?;
        let query = Query::<T>::new().filter(Condition::col(T::KEY_COLUMN).in_list(missing));
        let rows = self.run_query(&Statement::Select(query.to_select()))?;
        for row in &rows {
            self.materialize::<T>(row)?;
        }

        for owner in owners {
            let owner = borrow_entity(owner)?;
            let lazy = accessor(&owner);
            if lazy.is_resolved() {
                continue;
            }
            let Some(key) = lazy.key() else {
                continue;
            };
            let target = match self.identity_map.handle::<T>(&key) {
                Some((target, EntityState::Managed)) => Some(target),
                _ => None,
            };
            if target.is_some() {
                resolved += 1;
            }
            lazy.set_resolved(target);
        }
        Ok(resolved)
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    /// Whether `handle` is managed by this context.
    pub fn contains<E: Entity>(&self, handle: &EntityRef<E>) -> bool {
        self.state_of(handle) == EntityState::Managed
    }

    /// Lifecycle state of `handle` relative to this context.
    ///
    /// Untracked handles are [`EntityState::Transient`] while they have no
    /// key and [`EntityState::Detached`] otherwise.
    pub fn state_of<E: Entity>(&self, handle: &EntityRef<E>) -> EntityState {
        if let Some(entry) = self
            .identity_map
            .key_of(handle)
            .and_then(|key| self.identity_map.get(key))
        {
            return entry.state;
        }
        match handle.try_borrow() {
            Ok(entity) if entity.is_new() => EntityState::Transient,
            _ => EntityState::Detached,
        }
    }

    /// Whether a managed entity differs from its snapshot.
    pub fn is_modified<E: Entity>(&self, handle: &EntityRef<E>) -> bool {
        !self.modified_fields(handle).is_empty()
    }

    /// Field names of a managed entity that differ from its snapshot.
    pub fn modified_fields<E: Entity>(&self, handle: &EntityRef<E>) -> Vec<&'static str> {
        let Some(entry) = self
            .identity_map
            .key_of(handle)
            .and_then(|key| self.identity_map.get(key))
        else {
            return Vec::new();
        };
        if entry.state != EntityState::Managed {
            return Vec::new();
        }
        match handle.try_borrow() {
            Ok(entity) => changed_fields::<E>(&entry.snapshot.changed_columns(&entity.to_row())),
            Err(_) => Vec::new(),
        }
    }

    /// The dirty-checking snapshot of a tracked entity, as JSON.
    pub fn snapshot_json<E: Entity>(&self, handle: &EntityRef<E>) -> Option<serde_json::Value> {
        let key = self.identity_map.key_of(handle)?;
        Some(self.identity_map.get(key)?.snapshot.to_json())
    }
}

impl<B: StorageBackend, E: Entity> LazyLoader<E> for PersistenceContext<B> {
    fn load_reference(&mut self, key: &Value) -> Result<Option<EntityRef<E>>> {
        if let Some((handle, state)) = self.identity_map.handle::<E>(key) {
            return Ok((state == EntityState::Managed).then_some(handle));
        }
        self.auto_flush()?;
        self.find::<E>(key.clone())
    }
}

impl<B: StorageBackend> fmt::Debug for PersistenceContext<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistenceContext")
            .field("config", &self.config)
            .field("tracked", &self.identity_map.len())
            .field("pending", &self.queue.len())
            .field("in_transaction", &self.in_transaction)
            .finish_non_exhaustive()
    }
}

fn borrow_entity<E: Entity>(handle: &EntityRef<E>) -> Result<Ref<'_, E>> {
    handle
        .try_borrow()
        .map_err(|_| Error::invalid_state(E::ENTITY_NAME, "entity is mutably borrowed"))
}

/// Reject mapper output that does not line up with the field descriptors.
fn check_mapping<E: Entity>(row: &[(&'static str, Value)]) -> Result<()> {
    let fields = E::fields();
    if let Some((column, _)) = row.iter().find(|(c, _)| find_column(fields, c).is_none()) {
        return Err(Error::Mapping(MappingError {
            entity: E::ENTITY_NAME,
            message: format!("to_row produced unknown column '{column}'"),
        }));
    }
    if row.len() != fields.len() {
        return Err(Error::Mapping(MappingError {
            entity: E::ENTITY_NAME,
            message: format!(
                "to_row produced {} columns, {} fields are declared",
                row.len(),
                fields.len()
            ),
        }));
    }
    if !row.iter().any(|(c, _)| *c == E::KEY_COLUMN) {
        return Err(Error::Mapping(MappingError {
            entity: E::ENTITY_NAME,
            message: format!("to_row is missing key column '{}'", E::KEY_COLUMN),
        }));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use persistctx_core::{AssociationInfo, CompareOp, FieldInfo, StatementKind};
    use std::collections::HashMap;

    #[derive(Debug)]
    struct Team {
        id: i64,
        name: String,
    }

    impl Entity for Team {
        const ENTITY_NAME: &'static str = "Team";
        const TABLE_NAME: &'static str = "teams";
        const KEY_COLUMN: &'static str = "id";

        fn fields() -> &'static [FieldInfo] {
            const FIELDS: &[FieldInfo] = &[
                FieldInfo::new("id").primary_key(true),
                FieldInfo::new("name"),
            ];
            FIELDS
        }

        fn to_row(&self) -> Vec<(&'static str, Value)> {
            vec![("id", self.id.into()), ("name", self.name.clone().into())]
        }

        fn from_row(row: &Row) -> Result<Self> {
            Ok(Self {
                id: row.get_named("id")?,
                name: row.get_named("name")?,
            })
        }

        fn primary_key_value(&self) -> Option<Value> {
            Some(Value::BigInt(self.id))
        }

        fn set_primary_key(&mut self, key: Value) -> Result<()> {
            self.id = i64::try_from(key)?;
            Ok(())
        }
    }

    #[derive(Debug)]
    struct Hero {
        id: Option<i64>,
        name: String,
        team: Lazy<Team>,
    }

    impl Hero {
        fn new(name: &str) -> Self {
            Self {
                id: None,
                name: name.to_string(),
                team: Lazy::empty(),
            }
        }
    }

    impl Entity for Hero {
        const ENTITY_NAME: &'static str = "Hero";
        const TABLE_NAME: &'static str = "heroes";
        const KEY_COLUMN: &'static str = "id";
        const KEY_STRATEGY: KeyStrategy = KeyStrategy::Sequence;
        const ASSOCIATIONS: &'static [AssociationInfo] =
            &[AssociationInfo::new("team", "teams", "team_id")];

        fn fields() -> &'static [FieldInfo] {
            const FIELDS: &[FieldInfo] = &[
                FieldInfo::new("id").primary_key(true),
                FieldInfo::new("name"),
                FieldInfo::new("team_id").nullable(true).references("teams"),
            ];
            FIELDS
        }

        fn to_row(&self) -> Vec<(&'static str, Value)> {
            vec![
                ("id", self.id.into()),
                ("name", self.name.clone().into()),
                ("team_id", self.team.key_value()),
            ]
        }

        fn from_row(row: &Row) -> Result<Self> {
            Ok(Self {
                id: row.get_named("id")?,
                name: row.get_named("name")?,
                team: Lazy::from_key(row.get_by_name("team_id").cloned().unwrap_or(Value::Null)),
            })
        }

        fn primary_key_value(&self) -> Option<Value> {
            self.id.map(Value::BigInt)
        }

        fn set_primary_key(&mut self, key: Value) -> Result<()> {
            self.id = Some(i64::try_from(key)?);
            Ok(())
        }
    }

    /// Records every call; serves canned rows filtered by `=` and `IN`.
    #[derive(Default)]
    struct MockBackend {
        tables: HashMap<String, Vec<Row>>,
        queries: Vec<String>,
        mutations: Vec<Statement>,
        next_id: i64,
        fail_mutation_at: Option<usize>,
        begins: usize,
        commits: usize,
        rollbacks: usize,
    }

    impl MockBackend {
        fn with_teams() -> Self {
            let mut backend = Self::default();
            backend.tables.insert(
                "teams".to_string(),
                vec![
                    Row::new(
                        vec!["id".into(), "name".into()],
                        vec![Value::BigInt(1), Value::Text("Avengers".into())],
                    ),
                    Row::new(
                        vec!["id".into(), "name".into()],
                        vec![Value::BigInt(2), Value::Text("X-Men".into())],
                    ),
                ],
            );
            backend
        }

        fn with_heroes(mut self) -> Self {
            let hero = |id: i64, name: &str, team: Value| {
                Row::new(
                    vec!["id".into(), "name".into(), "team_id".into()],
                    vec![Value::BigInt(id), Value::Text(name.into()), team],
                )
            };
            self.tables.insert(
                "heroes".to_string(),
                vec![
                    hero(10, "Thor", Value::BigInt(1)),
                    hero(11, "Storm", Value::BigInt(2)),
                    hero(12, "Hulk", Value::BigInt(1)),
                    hero(13, "Loner", Value::Null),
                ],
            );
            self
        }

        fn mutation_kinds(&self) -> Vec<StatementKind> {
            self.mutations.iter().map(Statement::kind).collect()
        }
    }

    fn matches(row: &Row, condition: &Condition) -> bool {
        match condition {
            Condition::Compare {
                column,
                op: CompareOp::Eq,
                value,
            } => row.get_by_name(column).is_some_and(|v| v.same_key(value)),
            Condition::In { column, values } => row
                .get_by_name(column)
                .is_some_and(|v| values.iter().any(|x| x.same_key(v))),
            _ => true,
        }
    }

    impl StorageBackend for MockBackend {
        fn execute_query(&mut self, statement: &Statement) -> Result<Vec<Row>> {
            self.queries.push(statement.to_sql());
            let Statement::Select(select) = statement else {
                return Err(Error::backend(BackendErrorKind::Unsupported, "not a select"));
            };
            let rows: Vec<Row> = self
                .tables
                .get(&select.table)
                .cloned()
                .unwrap_or_default()
                .into_iter()
                .filter(|row| select.filters.iter().all(|f| matches(row, f)))
                .collect();
            if select.count {
                return Ok(vec![Row::new(
                    vec!["count".into()],
                    vec![Value::BigInt(i64::try_from(rows.len()).unwrap())],
                )]);
            }
            Ok(rows)
        }

        fn execute_mutation(&mut self, statement: &Statement) -> Result<u64> {
            if self.fail_mutation_at == Some(self.mutations.len()) {
                return Err(Error::backend(BackendErrorKind::Other, "injected failure"));
            }
            self.mutations.push(statement.clone());
            Ok(1)
        }

        fn next_key(&mut self, _table: &str) -> Result<Value> {
            self.next_id += 1;
            Ok(Value::BigInt(self.next_id))
        }

        fn begin(&mut self) -> Result<()> {
            self.begins += 1;
            Ok(())
        }

        fn commit(&mut self) -> Result<()> {
            self.commits += 1;
            Ok(())
        }

        fn rollback(&mut self) -> Result<()> {
            self.rollbacks += 1;
            Ok(())
        }
    }

    fn commit_mode() -> PersistenceUnitConfig {
        PersistenceUnitConfig::new().flush_mode(FlushMode::Commit)
    }

    #[test]
    fn test_persist_then_find_is_same_instance_without_read() {
        let mut ctx = PersistenceContext::new(MockBackend::default());
        let hero = ctx.persist(Hero::new("Spider-Man")).unwrap();
        assert_eq!(hero.borrow().id, Some(1));

        let found = ctx.find::<Hero>(1i64).unwrap().unwrap();
        assert!(Rc::ptr_eq(&hero, &found));
        assert!(ctx.backend().queries.is_empty());
        assert_eq!(ctx.state_of(&hero), EntityState::Managed);
        assert_eq!(ctx.pending_count(), 1);
    }

    #[test]
    fn test_find_reads_once_per_key() {
        let mut ctx = PersistenceContext::new(MockBackend::with_teams());
        let a = ctx.find::<Team>(1i64).unwrap().unwrap();
        let b = ctx.find::<Team>(1i64).unwrap().unwrap();
        assert!(Rc::ptr_eq(&a, &b));
        assert_eq!(ctx.backend().queries.len(), 1);
        assert_eq!(a.borrow().name, "Avengers");

        assert!(ctx.find::<Team>(99i64).unwrap().is_none());
        assert_eq!(ctx.backend().queries.len(), 2);
    }

    #[test]
    fn test_get_missing_is_not_found() {
        let mut ctx = PersistenceContext::new(MockBackend::with_teams());
        let err = ctx.get::<Team>(42i64).unwrap_err();
        assert!(matches!(err, Error::NotFound(NotFoundError { key: Some(_), .. })));
    }

    #[test]
    fn test_clear_detaches_and_forces_new_read() {
        let mut ctx = PersistenceContext::new(MockBackend::with_teams());
        let before = ctx.find::<Team>(1i64).unwrap().unwrap();
        ctx.clear();
        assert_eq!(ctx.state_of(&before), EntityState::Detached);

        let after = ctx.find::<Team>(1i64).unwrap().unwrap();
        assert!(!Rc::ptr_eq(&before, &after));
        assert_eq!(ctx.backend().queries.len(), 2);
    }

    #[test]
    fn test_many_mutations_one_update_of_changed_columns() {
        let mut ctx = PersistenceContext::new(MockBackend::with_teams());
        let team = ctx.find::<Team>(1i64).unwrap().unwrap();
        team.borrow_mut().name = "A".into();
        team.borrow_mut().name = "B".into();
        team.borrow_mut().name = "Avengers Assemble".into();
        assert!(ctx.is_modified(&team));
        assert_eq!(ctx.modified_fields(&team), ["name"]);

        let result = ctx.flush().unwrap();
        assert_eq!(result.updated, 1);
        let Statement::Update(update) = &ctx.backend().mutations[0] else {
            panic!("expected update");
        };
        assert_eq!(
            update.assignments,
            vec![("name".to_string(), Value::Text("Avengers Assemble".into()))]
        );
        assert!(!ctx.is_modified(&team));

        // Clean entities produce nothing.
        assert_eq!(ctx.flush().unwrap().total(), 0);
    }

    #[test]
    fn test_assigned_key_is_required() {
        #[derive(Debug)]
        struct Keyless;
        impl Entity for Keyless {
            const ENTITY_NAME: &'static str = "Keyless";
            const TABLE_NAME: &'static str = "keyless";
            const KEY_COLUMN: &'static str = "id";

            fn fields() -> &'static [FieldInfo] {
                const FIELDS: &[FieldInfo] = &[FieldInfo::new("id").primary_key(true)];
                FIELDS
            }

            fn to_row(&self) -> Vec<(&'static str, Value)> {
                vec![("id", Value::Null)]
            }

            fn from_row(_row: &Row) -> Result<Self> {
                Ok(Keyless)
            }

            fn primary_key_value(&self) -> Option<Value> {
                None
            }

            fn set_primary_key(&mut self, _key: Value) -> Result<()> {
                Ok(())
            }
        }

        let mut ctx = PersistenceContext::new(MockBackend::default());
        let err = ctx.persist(Keyless).unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
        assert_eq!(ctx.pending_count(), 0);
    }

    #[test]
    fn test_persist_existing_key_is_invalid_state() {
        let mut ctx = PersistenceContext::new(MockBackend::with_teams());
        ctx.find::<Team>(1i64).unwrap().unwrap();
        let err = ctx
            .persist(Team {
                id: 1,
                name: "Impostors".into(),
            })
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[test]
    fn test_rename_then_remove_yields_only_delete() {
        let mut ctx = PersistenceContext::new(MockBackend::with_teams());
        let team = ctx.find::<Team>(2i64).unwrap().unwrap();
        team.borrow_mut().name = "Renamed".into();
        ctx.remove(&team).unwrap();
        assert_eq!(ctx.state_of(&team), EntityState::Removed);
        assert!(ctx.find::<Team>(2i64).unwrap().is_none());

        let result = ctx.flush().unwrap();
        assert_eq!(result.deleted, 1);
        assert_eq!(ctx.backend().mutation_kinds(), [StatementKind::Delete]);
        // Evicted once the delete ran.
        assert_eq!(ctx.state_of(&team), EntityState::Detached);
    }

    #[test]
    fn test_remove_requires_managed() {
        let mut ctx = PersistenceContext::new(MockBackend::with_teams());
        let stranger = Rc::new(RefCell::new(Team {
            id: 1,
            name: "x".into(),
        }));
        assert!(matches!(
            ctx.remove(&stranger).unwrap_err(),
            Error::InvalidState(_)
        ));

        let team = ctx.find::<Team>(1i64).unwrap().unwrap();
        ctx.remove(&team).unwrap();
        assert!(ctx.remove(&team).is_err());
    }

    #[test]
    fn test_changing_primary_key_fails_flush() {
        let mut ctx = PersistenceContext::new(MockBackend::with_teams());
        let team = ctx.find::<Team>(1i64).unwrap().unwrap();
        team.borrow_mut().id = 7;
        assert!(matches!(ctx.flush().unwrap_err(), Error::InvalidState(_)));
        assert!(ctx.backend().mutations.is_empty());
    }

    #[test]
    fn test_flush_failure_reports_position_and_rollback_discards() {
        let backend = MockBackend {
            fail_mutation_at: Some(1),
            ..MockBackend::default()
        };
        let mut ctx = PersistenceContext::new(backend);
        ctx.persist(Hero::new("a")).unwrap();
        ctx.persist(Hero::new("b")).unwrap();
        ctx.persist(Hero::new("c")).unwrap();

        let err = ctx.flush().unwrap_err();
        assert_eq!(err.flush_position(), Some(1));
        assert_eq!(ctx.backend().mutations.len(), 1);
        assert_eq!(ctx.pending_count(), 2);

        ctx.rollback().unwrap();
        assert_eq!(ctx.pending_count(), 0);
        assert_eq!(ctx.managed_count(), 0);
        assert_eq!(ctx.backend().rollbacks, 1);
        assert!(!ctx.in_transaction());
    }

    #[test]
    fn test_auto_flush_before_query() {
        let mut ctx = PersistenceContext::new(MockBackend::with_teams());
        ctx.persist(Hero::new("Vision")).unwrap();
        ctx.query_list(&Query::<Team>::new()).unwrap();
        assert_eq!(ctx.backend().mutation_kinds(), [StatementKind::Insert]);
        assert_eq!(ctx.pending_count(), 0);
    }

    #[test]
    fn test_commit_mode_defers_writes() {
        let mut ctx = PersistenceContext::with_config(MockBackend::with_teams(), commit_mode());
        ctx.persist(Hero::new("Vision")).unwrap();
        ctx.query_list(&Query::<Team>::new()).unwrap();
        assert!(ctx.backend().mutations.is_empty());

        ctx.commit().unwrap();
        assert_eq!(ctx.backend().mutation_kinds(), [StatementKind::Insert]);
    }

    #[test]
    fn test_commit_ends_unit_of_work() {
        let mut ctx = PersistenceContext::new(MockBackend::with_teams());
        let hero = ctx.persist(Hero::new("Vision")).unwrap();
        let result = ctx.commit().unwrap();
        assert_eq!(result.inserted, 1);
        assert_eq!(ctx.backend().begins, 1);
        assert_eq!(ctx.backend().commits, 1);
        assert_eq!(ctx.state_of(&hero), EntityState::Detached);
        assert!(!ctx.contains(&hero));
    }

    #[test]
    fn test_commit_without_clear_keeps_managed() {
        let config = PersistenceUnitConfig::new().clear_on_commit(false);
        let mut ctx = PersistenceContext::with_config(MockBackend::with_teams(), config);
        let hero = ctx.persist(Hero::new("Vision")).unwrap();
        ctx.commit().unwrap();
        assert!(ctx.contains(&hero));
    }

    #[test]
    fn test_detach_drops_queued_insert() {
        let mut ctx = PersistenceContext::new(MockBackend::default());
        let keep = ctx.persist(Hero::new("keep")).unwrap();
        let drop_me = ctx.persist(Hero::new("drop")).unwrap();
        assert!(ctx.detach(&drop_me));
        assert!(!ctx.detach(&drop_me));
        assert_eq!(ctx.state_of(&drop_me), EntityState::Detached);
        assert!(ctx.contains(&keep));

        assert_eq!(ctx.flush().unwrap().inserted, 1);
    }

    #[test]
    fn test_lazy_load_reads_once() {
        let mut ctx = PersistenceContext::new(MockBackend::with_teams().with_heroes());
        let thor = ctx.find::<Hero>(10i64).unwrap().unwrap();
        assert!(!thor.borrow().team.is_resolved());

        let team = ctx.load(&thor.borrow().team).unwrap().unwrap();
        let again = ctx.load(&thor.borrow().team).unwrap().unwrap();
        assert!(Rc::ptr_eq(&team, &again));
        assert_eq!(team.borrow().name, "Avengers");
        assert_eq!(ctx.backend().queries.len(), 2);
    }

    #[test]
    fn test_load_many_uses_one_query() {
        let mut ctx = PersistenceContext::new(MockBackend::with_teams().with_heroes());
        let heroes: Vec<EntityRef<Hero>> = [10i64, 11, 12, 13]
            .into_iter()
            .map(|id| ctx.find::<Hero>(id).unwrap().unwrap())
            .collect();
        let reads_before = ctx.backend().queries.len();

        let resolved = ctx.load_many(&heroes, |h| &h.team).unwrap();
        assert_eq!(resolved, 3);
        assert_eq!(ctx.backend().queries.len(), reads_before + 1);
        assert!(ctx.backend().queries[reads_before].contains("IN"));
        assert!(heroes.iter().all(|h| h.borrow().team.is_resolved()));

        let thor_team = heroes[0].borrow().team.get().unwrap();
        let hulk_team = heroes[2].borrow().team.get().unwrap();
        assert!(Rc::ptr_eq(&thor_team, &hulk_team));
        assert!(heroes[3].borrow().team.get().is_none());
    }

    #[test]
    fn test_reference_does_not_read() {
        let mut ctx = PersistenceContext::new(MockBackend::with_teams());
        let lazy = ctx.reference::<Team>(2i64);
        assert!(!lazy.is_resolved());
        assert!(ctx.backend().queries.is_empty());
        let team = ctx.load(&lazy).unwrap().unwrap();
        assert_eq!(team.borrow().name, "X-Men");

        // Managed instances come back resolved.
        assert!(ctx.reference::<Team>(2i64).is_resolved());
    }

    #[test]
    fn test_query_one_and_count() {
        let mut ctx = PersistenceContext::new(MockBackend::with_teams());
        let err = ctx.query_one(&Query::<Team>::new()).unwrap_err();
        assert!(matches!(err, Error::NonUniqueResult(NonUniqueError { count: 2, .. })));

        let err = ctx.query_one(&Query::<Team>::by_key(5i64)).unwrap_err();
        assert!(matches!(err, Error::NotFound(NotFoundError { key: None, .. })));

        let one = ctx.query_one(&Query::<Team>::by_key(2i64)).unwrap();
        assert_eq!(one.borrow().name, "X-Men");
        assert_eq!(ctx.count(&Query::<Team>::new()).unwrap(), 2);
    }

    #[test]
    fn test_query_keeps_tracked_instance_over_row() {
        let mut ctx = PersistenceContext::with_config(MockBackend::with_teams(), commit_mode());
        let team = ctx.find::<Team>(1i64).unwrap().unwrap();
        team.borrow_mut().name = "Local edit".into();
        let listed = ctx.query_list(&Query::<Team>::new()).unwrap();
        assert!(Rc::ptr_eq(&listed[0], &team));
        assert_eq!(listed[0].borrow().name, "Local edit");
    }

    #[test]
    fn test_mapping_mismatch_rejected() {
        #[derive(Debug)]
        struct Broken;
        impl Entity for Broken {
            const ENTITY_NAME: &'static str = "Broken";
            const TABLE_NAME: &'static str = "broken";
            const KEY_COLUMN: &'static str = "id";

            fn fields() -> &'static [FieldInfo] {
                const FIELDS: &[FieldInfo] = &[FieldInfo::new("id").primary_key(true)];
                FIELDS
            }

            fn to_row(&self) -> Vec<(&'static str, Value)> {
                vec![("id", Value::BigInt(1)), ("extra", Value::Null)]
            }

            fn from_row(_row: &Row) -> Result<Self> {
                Ok(Broken)
            }

            fn primary_key_value(&self) -> Option<Value> {
                Some(Value::BigInt(1))
            }

            fn set_primary_key(&mut self, _key: Value) -> Result<()> {
                Ok(())
            }
        }

        let mut ctx = PersistenceContext::new(MockBackend::default());
        assert!(matches!(ctx.persist(Broken).unwrap_err(), Error::Mapping(_)));
    }

    #[test]
    fn test_snapshot_json_reflects_flushed_state() {
        let mut ctx = PersistenceContext::new(MockBackend::with_teams());
        let team = ctx.find::<Team>(1i64).unwrap().unwrap();
        let json = ctx.snapshot_json(&team).unwrap();
        assert_eq!(json["name"], serde_json::json!({"Text": "Avengers"}));
    }
}
