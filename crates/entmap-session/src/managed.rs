//! Type-erased handles to managed entity instances.
//!
//! The identity map holds instances of many model types side by side, and
//! the loader follows relationships whose target type is only known from
//! static metadata. Both work through two erased views of an entity:
//!
//! - [`Managed`]: an object-safe handle over one `ModelRef<M>`
//! - [`EntityVTable`]: per-type function pointers (materialize a row, read a
//!   primary key, wrap an erased reference)
//!
//! Instances themselves always stay behind the `Arc<RwLock<M>>` handed out to
//! callers, so every erased operation acts on the same object the caller
//! holds.

use crate::collection::{CollectionSlot, CollectionState};
use entmap_core::{
    AutoIncrement, ConsistencyError, Error, Model, RelationshipInfo, Result, Row, Value,
};
use std::any::{Any, TypeId};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, TryLockError};

/// Shared handle to a managed instance.
pub type ModelRef<M> = Arc<RwLock<M>>;

/// A `ModelRef<M>` with the model type erased.
pub type AnyRef = Arc<dyn Any + Send + Sync>;

/// A model the session can manage: storage-assigned ids plus named
/// relationship collections.
///
/// Only collection-valued relationships (one-to-many, many-to-many) hold
/// state on the instance. Many-to-one relationships are plain foreign key
/// fields.
pub trait Entity: Model + AutoIncrement {
    /// The collection backing relationship `name`, if this entity holds one.
    fn collection(&self, name: &str) -> Option<&dyn CollectionSlot> {
        let _ = name;
        None
    }

    fn collection_mut(&mut self, name: &str) -> Option<&mut dyn CollectionSlot> {
        let _ = name;
        None
    }
}

/// Erase the model type of a shared handle.
pub fn erase<M: Entity>(model: &ModelRef<M>) -> AnyRef {
    Arc::clone(model) as AnyRef
}

/// Address of the instance behind an erased handle.
///
/// Equal addresses mean the same instance, whichever view the handle came
/// from.
pub fn address(any: &AnyRef) -> usize {
    Arc::as_ptr(any).cast::<()>().addr()
}

/// Address of the instance behind a typed handle.
pub fn model_address<M: Entity>(model: &ModelRef<M>) -> usize {
    Arc::as_ptr(model).cast::<()>().addr()
}

pub(crate) fn read<M>(model: &RwLock<M>) -> RwLockReadGuard<'_, M> {
    model.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<M>(model: &RwLock<M>) -> RwLockWriteGuard<'_, M> {
    model.write().unwrap_or_else(PoisonError::into_inner)
}

/// Recover the typed handle from an erased one.
#[allow(clippy::result_large_err)]
pub fn downcast<M: Entity>(any: AnyRef) -> Result<ModelRef<M>> {
    Arc::downcast::<RwLock<M>>(any).map_err(|_| {
        Error::Consistency(ConsistencyError {
            table: M::TABLE_NAME,
            message: format!("handle does not hold a '{}'", std::any::type_name::<M>()),
        })
    })
}

/// Per-type operations for an entity whose type is only known at runtime.
#[derive(Clone, Copy)]
pub struct EntityVTable {
    pub type_id: TypeId,
    pub type_name: &'static str,
    pub table: &'static str,
    pub primary_key: &'static [&'static str],
    pub relationships: &'static [RelationshipInfo],
    materialize: fn(&Row) -> Result<Box<dyn Managed>>,
    wrap: fn(&AnyRef) -> Option<Box<dyn Managed>>,
}

impl EntityVTable {
    /// Vtable for entity `M`.
    pub fn of<M: Entity>() -> Self {
        Self {
            type_id: TypeId::of::<M>(),
            type_name: std::any::type_name::<M>(),
            table: M::TABLE_NAME,
            primary_key: M::PRIMARY_KEY,
            relationships: M::RELATIONSHIPS,
            materialize: materialize::<M>,
            wrap: wrap::<M>,
        }
    }

    /// Primary key values of a stored row of this entity.
    pub fn primary_key_of_row(&self, row: &Row) -> Vec<Value> {
        self.primary_key
            .iter()
            .map(|col| row.get_by_name(col).cloned().unwrap_or(Value::Null))
            .collect()
    }

    /// Build a fresh, unmanaged instance from a stored row.
    #[allow(clippy::result_large_err)]
    pub fn materialize(&self, row: &Row) -> Result<Box<dyn Managed>> {
        (self.materialize)(row)
    }

    /// View an erased handle as a managed instance of this entity.
    ///
    /// Returns `None` when the handle holds a different type.
    pub fn wrap(&self, any: &AnyRef) -> Option<Box<dyn Managed>> {
        (self.wrap)(any)
    }

    /// Current primary key of the instance behind `any`.
    pub fn primary_key_of(&self, any: &AnyRef) -> Option<Vec<Value>> {
        self.wrap(any).map(|m| m.primary_key())
    }
}

impl fmt::Debug for EntityVTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityVTable")
            .field("table", &self.table)
            .field("type_name", &self.type_name)
            .finish_non_exhaustive()
    }
}

#[allow(clippy::result_large_err)]
fn materialize<M: Entity>(row: &Row) -> Result<Box<dyn Managed>> {
    let model = M::from_row(row)?;
    Ok(Box::new(ManagedModel::new(Arc::new(RwLock::new(model)))))
}

fn wrap<M: Entity>(any: &AnyRef) -> Option<Box<dyn Managed>> {
    Arc::clone(any)
        .downcast::<RwLock<M>>()
        .ok()
        .map(|model| Box::new(ManagedModel::new(model)) as Box<dyn Managed>)
}

/// Object-safe view over one managed instance.
///
/// Every method takes the instance lock only for its own duration.
pub trait Managed: Send + Sync {
    fn any_ref(&self) -> AnyRef;

    fn address(&self) -> usize;

    fn clone_box(&self) -> Box<dyn Managed>;

    fn vtable(&self) -> EntityVTable;

    fn table(&self) -> &'static str {
        self.vtable().table
    }

    /// Scalar columns as they are now.
    fn row(&self) -> Vec<(&'static str, Value)>;

    fn primary_key(&self) -> Vec<Value>;

    fn is_new(&self) -> bool;

    /// Write back a storage-assigned id, or clear it after a rollback.
    fn assign_id(&self, id: Option<i64>);

    fn collection_state(&self, name: &str) -> Option<CollectionState>;

    /// The entity collection `name` holds.
    fn collection_target(&self, name: &str) -> Option<EntityVTable>;

    /// Move collection `name` to `Loading`.
    ///
    /// Returns the state it was in and the target entity, or `None` if the
    /// instance holds no such collection.
    fn begin_load(&self, name: &str) -> Option<(CollectionState, EntityVTable)>;

    fn abort_load(&self, name: &str, previous: CollectionState);

    #[allow(clippy::result_large_err)]
    fn finish_load(&self, name: &str, items: Vec<AnyRef>) -> Result<()>;

    /// Items of a loaded collection (empty when not loaded).
    fn collection_items(&self, name: &str) -> Vec<AnyRef>;

    /// Pending `(links, unlinks)` of collection `name`.
    fn pending_links(&self, name: &str) -> (Vec<AnyRef>, Vec<AnyRef>);

    /// Forget the pending link operations that reached storage.
    fn settle_links(&self, name: &str, linked: &[AnyRef], unlinked: &[AnyRef]);

    /// Unload every collection, releasing the instances they hold.
    ///
    /// Skipped when the instance is locked elsewhere.
    fn unload_collections(&self);
}

/// The [`Managed`] implementation for every [`Entity`].
pub struct ManagedModel<M: Entity> {
    model: ModelRef<M>,
}

impl<M: Entity> ManagedModel<M> {
    /// Wrap a shared instance.
    pub fn new(model: ModelRef<M>) -> Self {
        Self { model }
    }

    /// The wrapped instance.
    pub fn model(&self) -> &ModelRef<M> {
        &self.model
    }
}

impl<M: Entity> Managed for ManagedModel<M> {
    fn any_ref(&self) -> AnyRef {
        erase(&self.model)
    }

    fn address(&self) -> usize {
        model_address(&self.model)
    }

    fn clone_box(&self) -> Box<dyn Managed> {
        Box::new(Self::new(Arc::clone(&self.model)))
    }

    fn vtable(&self) -> EntityVTable {
        EntityVTable::of::<M>()
    }

    fn table(&self) -> &'static str {
        M::TABLE_NAME
    }

    fn row(&self) -> Vec<(&'static str, Value)> {
        read(&self.model).to_row()
    }

    fn primary_key(&self) -> Vec<Value> {
        read(&self.model).primary_key_value()
    }

    fn is_new(&self) -> bool {
        read(&self.model).is_new()
    }

    fn assign_id(&self, id: Option<i64>) {
        write(&self.model).set_id(id);
    }

    fn collection_state(&self, name: &str) -> Option<CollectionState> {
        read(&self.model).collection(name).map(CollectionSlot::state)
    }

    fn collection_target(&self, name: &str) -> Option<EntityVTable> {
        read(&self.model).collection(name).map(CollectionSlot::target)
    }

    fn begin_load(&self, name: &str) -> Option<(CollectionState, EntityVTable)> {
        let mut model = write(&self.model);
        let slot = model.collection_mut(name)?;
        Some((slot.begin_load(), slot.target()))
    }

    fn abort_load(&self, name: &str, previous: CollectionState) {
        if let Some(slot) = write(&self.model).collection_mut(name) {
            slot.abort_load(previous);
        }
    }

    fn finish_load(&self, name: &str, items: Vec<AnyRef>) -> Result<()> {
        let mut model = write(&self.model);
        let slot = model.collection_mut(name).ok_or_else(|| {
            Error::Consistency(ConsistencyError {
                table: M::TABLE_NAME,
                message: format!("collection '{name}' disappeared while loading"),
            })
        })?;
        slot.finish_load(items)
    }

    fn collection_items(&self, name: &str) -> Vec<AnyRef> {
        read(&self.model)
            .collection(name)
            .map(CollectionSlot::item_refs)
            .unwrap_or_default()
    }

    fn pending_links(&self, name: &str) -> (Vec<AnyRef>, Vec<AnyRef>) {
        read(&self.model)
            .collection(name)
            .map(|slot| (slot.pending_link_refs(), slot.pending_unlink_refs()))
            .unwrap_or_default()
    }

    fn settle_links(&self, name: &str, linked: &[AnyRef], unlinked: &[AnyRef]) {
        if let Some(slot) = write(&self.model).collection_mut(name) {
            slot.settle_links(linked, unlinked);
        }
    }

    fn unload_collections(&self) {
        let mut model = match self.model.try_write() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                tracing::debug!(table = M::TABLE_NAME, "Instance locked; collections left loaded");
                return;
            }
        };
        for rel in M::RELATIONSHIPS.iter().filter(|r| r.is_collection()) {
            if let Some(slot) = model.collection_mut(rel.name) {
                slot.unload();
            }
        }
    }
}
