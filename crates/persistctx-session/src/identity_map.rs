//! Identity Map: one managed instance per (entity type, primary key).
//!
//! The map owns a strong reference to every managed handle, so two lookups
//! of the same key always return clones of the same `Rc` and
//! `Rc::ptr_eq` holds between them. Entries are type-erased behind
//! [`ManagedSlot`] so one map can hold every entity type of a unit of work;
//! insertion order is kept so dirty checking visits entities in the order
//! they became managed.

use crate::EntityState;
use crate::change_tracker::Snapshot;
use persistctx_core::{Entity, EntityRef, Error, Result, Value};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

/// Primary key wrapper with the identity semantics of [`Value::same_key`].
#[derive(Debug, Clone)]
pub struct KeyValue(pub Value);

impl PartialEq for KeyValue {
    fn eq(&self, other: &Self) -> bool {
        self.0.same_key(&other.0)
    }
}

impl Eq for KeyValue {}

impl Hash for KeyValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash_key(state);
    }
}

/// Unique key for an entity in the identity map.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    type_id: TypeId,
    key: KeyValue,
}

impl ObjectKey {
    /// Create an object key from entity type and primary key.
    pub fn of<E: Entity>(key: Value) -> Self {
        Self {
            type_id: TypeId::of::<E>(),
            key: KeyValue(key),
        }
    }

    /// Get the type identifier.
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Get the primary key value.
    pub fn key(&self) -> &Value {
        &self.key.0
    }
}

/// Type-erased access to a managed handle.
pub trait ManagedSlot {
    /// The stored `EntityRef<E>`, for downcasting.
    fn as_any(&self) -> &dyn Any;

    /// Current `(column, value)` pairs of the entity.
    ///
    /// Fails if the entity is mutably borrowed elsewhere.
    fn current_row(&self) -> Result<Vec<(&'static str, Value)>>;

    fn entity_name(&self) -> &'static str;
    fn table_name(&self) -> &'static str;
    fn key_column(&self) -> &'static str;

    /// Address of the shared allocation, used to find an entry by handle.
    fn handle_addr(&self) -> usize;
}

struct Slot<E: Entity> {
    handle: EntityRef<E>,
}

impl<E: Entity> ManagedSlot for Slot<E> {
    fn as_any(&self) -> &dyn Any {
        &self.handle
    }

    fn current_row(&self) -> Result<Vec<(&'static str, Value)>> {
        let entity = self.handle.try_borrow().map_err(|_| {
            Error::invalid_state(E::ENTITY_NAME, "managed entity is mutably borrowed")
        })?;
        Ok(entity.to_row())
    }

    fn entity_name(&self) -> &'static str {
        E::ENTITY_NAME
    }

    fn table_name(&self) -> &'static str {
        E::TABLE_NAME
    }

    fn key_column(&self) -> &'static str {
        E::KEY_COLUMN
    }

    fn handle_addr(&self) -> usize {
        handle_addr(&self.handle)
    }
}

/// Address of a handle's allocation.
pub fn handle_addr<E>(handle: &EntityRef<E>) -> usize {
    Rc::as_ptr(handle).cast::<()>() as usize
}

/// A managed or removed entity together with its dirty-checking snapshot.
pub struct ManagedEntry {
    slot: Box<dyn ManagedSlot>,
    pub state: EntityState,
    pub snapshot: Snapshot,
}

impl ManagedEntry {
    pub fn slot(&self) -> &dyn ManagedSlot {
        self.slot.as_ref()
    }

    /// Recover the typed handle.
    pub fn handle<E: Entity>(&self) -> Option<EntityRef<E>> {
        self.slot
            .as_any()
            .downcast_ref::<EntityRef<E>>()
            .map(Rc::clone)
    }
}

/// Identity Map for one unit of work.
#[derive(Default)]
pub struct IdentityMap {
    entries: HashMap<ObjectKey, ManagedEntry>,
    /// Keys in the order their entities became managed.
    order: Vec<ObjectKey>,
    /// Handle address -> key.
    by_handle: HashMap<usize, ObjectKey>,
}

impl IdentityMap {
    /// Create a new empty identity map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handle as managed under `key` with the given snapshot.
    ///
    /// Fails if the key is already present, whatever its state.
    pub fn insert<E: Entity>(
        &mut self,
        key: Value,
        handle: &EntityRef<E>,
        snapshot: Snapshot,
    ) -> Result<()> {
        let object_key = ObjectKey::of::<E>(key);
        if self.entries.contains_key(&object_key) {
            return Err(Error::InvalidState(persistctx_core::StateError {
                entity: E::ENTITY_NAME,
                key: Some(object_key.key().clone()),
                message: "an instance with this key is already managed".to_string(),
            }));
        }
        tracing::trace!(
            entity = E::ENTITY_NAME,
            key = %object_key.key(),
            "Registering managed instance"
        );
        self.by_handle
            .insert(handle_addr(handle), object_key.clone());
        self.order.push(object_key.clone());
        self.entries.insert(
            object_key,
            ManagedEntry {
                slot: Box::new(Slot {
                    handle: Rc::clone(handle),
                }),
                state: EntityState::Managed,
                snapshot,
            },
        );
        Ok(())
    }

    /// Get the entry for a key.
    pub fn get(&self, key: &ObjectKey) -> Option<&ManagedEntry> {
        self.entries.get(key)
    }

    pub fn get_mut(&mut self, key: &ObjectKey) -> Option<&mut ManagedEntry> {
        self.entries.get_mut(key)
    }

    /// Get the typed handle for a key, in any state.
    pub fn handle<E: Entity>(&self, key: &Value) -> Option<(EntityRef<E>, EntityState)> {
        let entry = self.entries.get(&ObjectKey::of::<E>(key.clone()))?;
        Some((entry.handle::<E>()?, entry.state))
    }

    /// Find the key under which `handle` is registered.
    pub fn key_of<E: Entity>(&self, handle: &EntityRef<E>) -> Option<&ObjectKey> {
        let key = self.by_handle.get(&handle_addr(handle))?;
        (key.type_id() == TypeId::of::<E>()).then_some(key)
    }

    /// Remove a single entry.
    pub fn remove(&mut self, key: &ObjectKey) -> Option<ManagedEntry> {
        let entry = self.entries.remove(key)?;
        self.by_handle.remove(&entry.slot.handle_addr());
        self.order.retain(|k| k != key);
        Some(entry)
    }

    /// Drop removed entries whose delete is no longer pending.
    pub fn evict_removed(&mut self, still_pending: impl Fn(&ObjectKey) -> bool) -> usize {
        let evict: Vec<ObjectKey> = self
            .order
            .iter()
            .filter(|k| {
                self.entries
                    .get(*k)
                    .is_some_and(|e| e.state == EntityState::Removed)
                    && !still_pending(*k)
            })
            .cloned()
            .collect();
        for key in &evict {
            self.remove(key);
        }
        evict.len()
    }

    /// Iterate entries in the order they became managed.
    pub fn iter(&self) -> impl Iterator<Item = (&ObjectKey, &ManagedEntry)> {
        self.order
            .iter()
            .filter_map(|k| self.entries.get(k).map(|e| (k, e)))
    }

    /// How many `E` entries are scheduled for removal.
    pub fn removed_count<E: Entity>(&self) -> usize {
        let type_id = TypeId::of::<E>();
        self.entries
            .iter()
            .filter(|(k, e)| ObjectKey::type_id(k) == type_id && e.state == EntityState::Removed)
            .count()
    }

    /// Keys in the order they became managed.
    pub fn keys(&self) -> Vec<ObjectKey> {
        self.order.clone()
    }

    /// Clear all entries from the identity map.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
        self.by_handle.clear();
    }

    /// Get the number of entries in the map.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the map is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
