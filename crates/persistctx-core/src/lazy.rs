//! Lazily resolved many-to-one associations.
//!
//! A `Lazy<E>` field holds either the foreign key of its target or the
//! resolved target handle. Resolution goes through a [`LazyLoader`], which
//! the persistence context implements, so the field itself never holds a
//! reference back to the context that produced it.

use crate::Result;
use crate::entity::{Entity, EntityRef};
use crate::value::Value;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// Minimal loader interface needed to resolve lazy associations.
pub trait LazyLoader<E: Entity> {
    /// Load the managed instance with the given key, if any.
    fn load_reference(&mut self, key: &Value) -> Result<Option<EntityRef<E>>>;
}

enum LazyState<E> {
    Unresolved {
        key: Option<Value>,
    },
    /// `key` is the foreign key the association was resolved from. It is
    /// kept when the target turns out to be missing, so the owner's row
    /// still carries it.
    Resolved {
        key: Option<Value>,
        target: Option<EntityRef<E>>,
    },
}

fn target_key<E: Entity>(target: &EntityRef<E>) -> Option<Value> {
    target.try_borrow().ok()?.primary_key_value()
}

/// A lazily loaded association to one `E`.
///
/// The wrapper keeps its identity across resolution: the state flips from
/// unresolved to resolved in place, behind a `RefCell`, so owners can
/// resolve it through a shared borrow.
///
/// # Example
///
/// ```ignore
/// let player = ctx.find::<Player>(1)?.unwrap();
/// assert!(!player.borrow().team.is_resolved());
/// let team = player.borrow().team.load(&mut ctx)?;   // one read
/// let again = player.borrow().team.load(&mut ctx)?;  // no read
/// ```
pub struct Lazy<E> {
    state: RefCell<LazyState<E>>,
}

impl<E: Entity> Lazy<E> {
    /// Create an empty association (null foreign key, not resolved).
    pub fn empty() -> Self {
        Self {
            state: RefCell::new(LazyState::Unresolved { key: None }),
        }
    }

    /// Create from a foreign key value (not yet resolved).
    ///
    /// A NULL key is the same as [`Lazy::empty`].
    pub fn from_key(key: impl Into<Value>) -> Self {
        let key = key.into();
        Self {
            state: RefCell::new(LazyState::Unresolved {
                key: (!key.is_null()).then_some(key),
            }),
        }
    }

    /// Create an association already resolved to `target`.
    pub fn resolved(target: Option<EntityRef<E>>) -> Self {
        Self {
            state: RefCell::new(LazyState::Resolved {
                key: target.as_ref().and_then(target_key),
                target,
            }),
        }
    }

    /// Whether the target has been resolved.
    pub fn is_resolved(&self) -> bool {
        matches!(*self.state.borrow(), LazyState::Resolved { .. })
    }

    /// Whether the association carries no foreign key.
    pub fn is_empty(&self) -> bool {
        self.key().is_none()
    }

    /// The foreign key value, as it should be written to the owner's row.
    ///
    /// For a resolved association this is the target's current key. When the
    /// target was missing, the key it was resolved from is kept.
    pub fn key(&self) -> Option<Value> {
        match &*self.state.borrow() {
            LazyState::Unresolved { key } => key.clone(),
            LazyState::Resolved { key, target } => target
                .as_ref()
                .and_then(target_key)
                .or_else(|| key.clone()),
        }
    }

    /// Foreign key for `Entity::to_row`, NULL when empty.
    pub fn key_value(&self) -> Value {
        self.key().unwrap_or(Value::Null)
    }

    /// Get the resolved target, without loading.
    ///
    /// Returns `None` when unresolved or resolved to nothing.
    pub fn get(&self) -> Option<EntityRef<E>> {
        match &*self.state.borrow() {
            LazyState::Resolved { target, .. } => target.clone(),
            LazyState::Unresolved { .. } => None,
        }
    }

    /// Resolve through `loader` on first access and return the target.
    ///
    /// Later calls return the cached target without touching the loader.
    /// A loader error leaves the association unresolved.
    pub fn load<L>(&self, loader: &mut L) -> Result<Option<EntityRef<E>>>
    where
        L: LazyLoader<E> + ?Sized,
    {
        let key = match &*self.state.borrow() {
            LazyState::Resolved { target, .. } => return Ok(target.clone()),
            LazyState::Unresolved { key } => key.clone(),
        };
        let target = match &key {
            Some(key) => loader.load_reference(key)?,
            None => None,
        };
        *self.state.borrow_mut() = LazyState::Resolved {
            key,
            target: target.clone(),
        };
        Ok(target)
    }

    /// Mark the association resolved (used by fetch joins and batch loads).
    ///
    /// The foreign key is kept even when `target` is `None`. Returns `false`
    /// and leaves the state untouched if already resolved.
    pub fn set_resolved(&self, target: Option<EntityRef<E>>) -> bool {
        let mut state = self.state.borrow_mut();
        let key = match &*state {
            LazyState::Resolved { .. } => return false,
            LazyState::Unresolved { key } => key.clone(),
        };
        *state = LazyState::Resolved { key, target };
        true
    }

    /// Point the association at a different target.
    ///
    /// `None` clears the foreign key.
    pub fn set(&self, target: Option<EntityRef<E>>) {
        *self.state.borrow_mut() = LazyState::Resolved {
            key: target.as_ref().and_then(target_key),
            target,
        };
    }

    /// Drop the resolved target and go back to holding its key.
    pub fn reset(&self) {
        let key = self.key();
        *self.state.borrow_mut() = LazyState::Unresolved { key };
    }
}

/// Whether a lazy association has been resolved, without loading it.
pub fn is_loaded<E: Entity>(lazy: &Lazy<E>) -> bool {
    lazy.is_resolved()
}

impl<E: Entity> Default for Lazy<E> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<E: Entity> Clone for Lazy<E> {
    fn clone(&self) -> Self {
        let state = match &*self.state.borrow() {
            LazyState::Unresolved { key } => LazyState::Unresolved { key: key.clone() },
            LazyState::Resolved { key, target } => LazyState::Resolved {
                key: key.clone(),
                target: target.as_ref().map(Rc::clone),
            },
        };
        Self {
            state: RefCell::new(state),
        }
    }
}

impl<E: Entity> fmt::Debug for Lazy<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.state.borrow() {
            LazyState::Unresolved { key } => f
                .debug_struct("Lazy")
                .field("target", &E::ENTITY_NAME)
                .field("key", key)
                .field("resolved", &false)
                .finish(),
            LazyState::Resolved { target, .. } => f
                .debug_struct("Lazy")
                .field("target", &E::ENTITY_NAME)
                .field("key", &self.key())
                .field("resolved", &true)
                .field("empty", &target.is_none())
                .finish(),
        }
    }
}
