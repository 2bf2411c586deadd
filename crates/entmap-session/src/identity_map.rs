//! Identity Map pattern for tracking unique object instances per primary key.
//!
//! The Identity Map ensures that each stored row corresponds to exactly one
//! object instance within a session:
//!
//! - **Uniqueness**: Same (type, PK) always returns the same object reference
//! - **Stability**: A lookup never re-reads fields of an instance it already holds
//! - **Consistency**: Changes to an object are visible everywhere it's used
//!
//! # Design
//!
//! Instances live behind `Arc<RwLock<M>>`. The map stores a type-erased
//! [`Managed`] handle over that same `Arc`, so getting an object twice hands
//! out clones of one pointer rather than copies of the model.
//!
//! Instances persisted in this session but not yet flushed have no primary
//! key. They are registered under a transient key and re-keyed once storage
//! assigns their id.
//!
//! # Example
//!
//! ```ignore
//! let mut map = IdentityMap::new();
//!
//! let (risk, created) = map.get_or_create::<Risk>(&pk, || Risk::from_row(&row))?;
//! let again = map.get::<Risk>(&pk).unwrap();
//!
//! assert!(created);
//! assert!(Arc::ptr_eq(&risk, &again));
//! ```

use crate::managed::{AnyRef, Entity, EntityVTable, Managed, ManagedModel, ModelRef, downcast};
use crate::{ObjectKey, ObjectState};
use entmap_core::{Result, Row, Value};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Hash a slice of values for use as a primary key identifier.
///
/// Integer widths hash alike, matching `Value::key_eq`.
pub(crate) fn hash_pk_values(values: &[Value]) -> u64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::Hasher;

    let mut hasher = DefaultHasher::new();
    for v in values {
        hash_single_value(v, &mut hasher);
    }
    hasher.finish()
}

/// Hash a single Value into the hasher.
fn hash_single_value(v: &Value, hasher: &mut impl std::hash::Hasher) {
    use std::hash::Hash;

    match v {
        Value::Null => 0u8.hash(hasher),
        Value::Bool(b) => {
            1u8.hash(hasher);
            b.hash(hasher);
        }
        Value::Int(i) => {
            2u8.hash(hasher);
            i64::from(*i).hash(hasher);
        }
        Value::BigInt(i) => {
            2u8.hash(hasher);
            i.hash(hasher);
        }
        Value::Double(f) => {
            3u8.hash(hasher);
            f.to_bits().hash(hasher);
        }
        Value::Text(s) => {
            4u8.hash(hasher);
            s.hash(hasher);
        }
        Value::Bytes(b) => {
            5u8.hash(hasher);
            b.hash(hasher);
        }
        Value::Json(j) => {
            6u8.hash(hasher);
            j.to_string().hash(hasher);
        }
    }
}

/// One registered instance.
pub struct IdentityEntry {
    pub managed: Box<dyn Managed>,
    pub state: ObjectState,
}

/// Result of resolving a stored row against the map.
pub struct Resolved {
    pub key: ObjectKey,
    pub item: AnyRef,
    /// Set when the row was materialized into a new instance.
    pub fresh: Option<Box<dyn Managed>>,
}

/// Identity Map for tracking unique object instances.
#[derive(Default)]
pub struct IdentityMap {
    entries: HashMap<ObjectKey, IdentityEntry>,
    /// Instance address -> key, for lookups by reference.
    by_address: HashMap<usize, ObjectKey>,
    next_transient: u64,
}

impl IdentityMap {
    /// Create a new empty identity map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get an object by primary key.
    ///
    /// The returned Arc is a clone of the stored Arc, so modifications are
    /// shared.
    pub fn get<M: Entity>(&self, pk_values: &[Value]) -> Option<ModelRef<M>> {
        let entry = self.entries.get(&ObjectKey::from_pk::<M>(pk_values))?;
        downcast::<M>(entry.managed.any_ref()).ok()
    }

    /// Return the instance registered for `pk_values`, or register the one
    /// `loader` builds.
    ///
    /// An existing instance is returned untouched and `loader` is not
    /// called. The flag is `true` when `loader` ran.
    #[allow(clippy::result_large_err)]
    pub fn get_or_create<M: Entity>(
        &mut self,
        pk_values: &[Value],
        loader: impl FnOnce() -> Result<M>,
    ) -> Result<(ModelRef<M>, bool)> {
        if let Some(existing) = self.get::<M>(pk_values) {
            return Ok((existing, false));
        }
        let model = Arc::new(RwLock::new(loader()?));
        let key = ObjectKey::from_pk::<M>(pk_values);
        self.register(
            key,
            Box::new(ManagedModel::new(Arc::clone(&model))),
            ObjectState::Persistent,
        );
        Ok((model, true))
    }

    /// Erased `get_or_create` for a stored row of `vtable`'s entity.
    #[allow(clippy::result_large_err)]
    pub fn resolve_row(&mut self, vtable: &EntityVTable, row: &Row) -> Result<Resolved> {
        let key = ObjectKey::persistent(vtable.type_id, &vtable.primary_key_of_row(row));
        if let Some(entry) = self.entries.get(&key) {
            return Ok(Resolved {
                key,
                item: entry.managed.any_ref(),
                fresh: None,
            });
        }
        let managed = vtable.materialize(row)?;
        let item = managed.any_ref();
        let fresh = managed.clone_box();
        self.register(key, managed, ObjectState::Persistent);
        Ok(Resolved {
            key,
            item,
            fresh: Some(fresh),
        })
    }

    /// Register a new instance under a transient key.
    #[cfg(test)]
    pub(crate) fn insert<M: Entity>(&mut self, model: M) -> (ObjectKey, ModelRef<M>) {
        let model = Arc::new(RwLock::new(model));
        let key = self.attach_new(Box::new(ManagedModel::new(Arc::clone(&model))));
        (key, model)
    }

    /// Register an instance the caller already holds as pending insert.
    pub fn attach_new(&mut self, managed: Box<dyn Managed>) -> ObjectKey {
        self.next_transient += 1;
        let key = ObjectKey::transient(managed.vtable().type_id, self.next_transient);
        self.register(key, managed, ObjectState::New);
        key
    }

    /// Register a pending insert that already carries its primary key.
    ///
    /// The key is final, so nothing is re-keyed after the flush.
    pub fn attach_new_keyed(&mut self, managed: Box<dyn Managed>) -> ObjectKey {
        let key = ObjectKey::persistent(managed.vtable().type_id, &managed.primary_key());
        self.register(key, managed, ObjectState::New);
        key
    }

    fn register(&mut self, key: ObjectKey, managed: Box<dyn Managed>, state: ObjectState) {
        self.by_address.insert(managed.address(), key);
        if let Some(old) = self.entries.insert(key, IdentityEntry { managed, state }) {
            self.by_address.remove(&old.managed.address());
        }
    }

    /// Is anything registered under `key`?
    pub fn contains_key(&self, key: &ObjectKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Is this very instance registered?
    pub fn contains<M: Entity>(&self, model: &ModelRef<M>) -> bool {
        self.key_of(model).is_some()
    }

    /// Key of a registered instance.
    pub fn key_of<M: Entity>(&self, model: &ModelRef<M>) -> Option<ObjectKey> {
        self.key_of_address(crate::managed::model_address(model))
    }

    /// Key of the instance whose allocation starts at `address`.
    pub fn key_of_address(&self, address: usize) -> Option<ObjectKey> {
        self.by_address.get(&address).copied()
    }

    /// Entry registered under `key`.
    pub fn entry(&self, key: &ObjectKey) -> Option<&IdentityEntry> {
        self.entries.get(key)
    }

    /// Record a lifecycle transition for `key`.
    pub fn set_state(&mut self, key: &ObjectKey, state: ObjectState) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.state = state;
        }
    }

    /// Every registered entry.
    pub fn iter(&self) -> impl Iterator<Item = (&ObjectKey, &IdentityEntry)> {
        self.entries.iter()
    }

    /// Unregister an instance. Held references become detached and its
    /// loaded collections are unloaded.
    pub fn remove(&mut self, key: &ObjectKey) -> Option<IdentityEntry> {
        let entry = self.entries.remove(key)?;
        self.by_address.remove(&entry.managed.address());
        entry.managed.unload_collections();
        Some(entry)
    }

    /// Move an entry to a new key, e.g. from transient to persistent.
    pub fn rekey(&mut self, old: &ObjectKey, new: ObjectKey) {
        if let Some(entry) = self.entries.remove(old) {
            self.by_address.insert(entry.managed.address(), new);
            self.entries.insert(new, entry);
        }
    }

    /// Clear all entries from the identity map.
    ///
    /// Loaded collections are unloaded first, so instances that refer to
    /// each other through eager collections are freed once the caller lets
    /// go of them.
    pub fn clear(&mut self) {
        for entry in self.entries.values() {
            entry.managed.unload_collections();
        }
        self.entries.clear();
        self.by_address.clear();
    }

    /// Get the number of entries in the map.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the map is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Drop for IdentityMap {
    fn drop(&mut self) {
        self.clear();
    }
}

impl std::fmt::Debug for IdentityMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityMap")
            .field("entries", &self.entries.len())
            .finish_non_exhaustive()
    }
}
