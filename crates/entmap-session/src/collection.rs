//! Relationship collections.
//!
//! A [`Collection`] is the in-memory side of a one-to-many or many-to-many
//! relationship. It carries a three-state tag:
//!
//! - `Unloaded`: nothing is known about the related rows. This is not the
//!   same as empty, so [`Collection::items`] returns `None`.
//! - `Loading`: a relationship load is in flight.
//! - `Loaded`: the items reflect storage as of the last load, plus any
//!   links made locally since.
//!
//! Only the relationship loader moves a collection between states. Reading
//! a collection never performs I/O.
//!
//! On the owning side of a many-to-many relationship, [`Collection::link`]
//! and [`Collection::unlink`] queue link-table writes for the next flush.

use crate::managed::{AnyRef, Entity, EntityVTable, ModelRef, address, model_address};
use entmap_core::{ConsistencyError, Error, Result};
use std::fmt;
use std::sync::{Arc, RwLock};

/// Load state of a relationship collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CollectionState {
    #[default]
    Unloaded,
    Loading,
    Loaded,
}

/// The related instances of one relationship on one owner.
pub struct Collection<T: Entity> {
    state: CollectionState,
    items: Vec<ModelRef<T>>,
    pending_links: Vec<ModelRef<T>>,
    pending_unlinks: Vec<ModelRef<T>>,
}

impl<T: Entity> Collection<T> {
    /// An unloaded collection with no pending changes.
    pub fn new() -> Self {
        Self {
            state: CollectionState::Unloaded,
            items: Vec::new(),
            pending_links: Vec::new(),
            pending_unlinks: Vec::new(),
        }
    }

    /// Current load state.
    pub fn state(&self) -> CollectionState {
        self.state
    }

    /// Has a load filled this collection?
    pub fn is_loaded(&self) -> bool {
        self.state == CollectionState::Loaded
    }

    /// The related instances, or `None` while the collection is not loaded.
    pub fn items(&self) -> Option<&[ModelRef<T>]> {
        self.is_loaded().then_some(self.items.as_slice())
    }

    /// Is `item` among the loaded items?
    pub fn contains(&self, item: &ModelRef<T>) -> bool {
        self.items.iter().any(|i| Arc::ptr_eq(i, item))
    }

    /// Queue a link to `item`.
    ///
    /// Cancels a pending unlink of the same instance. A loaded collection
    /// shows the item immediately.
    pub fn link(&mut self, item: ModelRef<T>) {
        if let Some(pos) = position(&self.pending_unlinks, &item) {
            self.pending_unlinks.remove(pos);
        } else if position(&self.pending_links, &item).is_none() && !self.contains(&item) {
            self.pending_links.push(Arc::clone(&item));
        }
        if self.is_loaded() && !self.contains(&item) {
            self.items.push(item);
        }
    }

    /// Queue removal of the link to `item`.
    ///
    /// Cancels a pending link of the same instance instead when there is one.
    pub fn unlink(&mut self, item: &ModelRef<T>) {
        if let Some(pos) = position(&self.pending_links, item) {
            self.pending_links.remove(pos);
        } else if position(&self.pending_unlinks, item).is_none() {
            self.pending_unlinks.push(Arc::clone(item));
        }
        if let Some(pos) = position(&self.items, item) {
            self.items.remove(pos);
        }
    }

    /// Items linked since the last flush.
    pub fn pending_links(&self) -> &[ModelRef<T>] {
        &self.pending_links
    }

    /// Items unlinked since the last flush.
    pub fn pending_unlinks(&self) -> &[ModelRef<T>] {
        &self.pending_unlinks
    }

    /// Any link or unlink waiting for a flush?
    pub fn has_pending(&self) -> bool {
        !self.pending_links.is_empty() || !self.pending_unlinks.is_empty()
    }
}

fn position<T: Entity>(list: &[ModelRef<T>], item: &ModelRef<T>) -> Option<usize> {
    list.iter().position(|i| Arc::ptr_eq(i, item))
}

impl<T: Entity> Default for Collection<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Entity> fmt::Debug for Collection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collection")
            .field("target", &T::TABLE_NAME)
            .field("state", &self.state)
            .field("items", &self.items.len())
            .field("pending_links", &self.pending_links.len())
            .field("pending_unlinks", &self.pending_unlinks.len())
            .finish()
    }
}

/// Type-erased access to a [`Collection`], used by the loader and the
/// flush planner.
pub trait CollectionSlot: Send + Sync {
    fn state(&self) -> CollectionState;

    /// The entity this collection holds.
    fn target(&self) -> EntityVTable;

    /// Enter `Loading`, returning the state to restore if the load fails.
    fn begin_load(&mut self) -> CollectionState;

    fn abort_load(&mut self, previous: CollectionState);

    /// Replace the items with a fresh load and enter `Loaded`.
    ///
    /// Pending links stay visible and pending unlinks stay hidden.
    #[allow(clippy::result_large_err)]
    fn finish_load(&mut self, items: Vec<AnyRef>) -> Result<()>;

    fn item_refs(&self) -> Vec<AnyRef>;

    fn pending_link_refs(&self) -> Vec<AnyRef>;

    fn pending_unlink_refs(&self) -> Vec<AnyRef>;

    /// Drop the pending operations that were written.
    fn settle_links(&mut self, linked: &[AnyRef], unlinked: &[AnyRef]);

    /// Forget the loaded items and return to `Unloaded`.
    ///
    /// Pending links and unlinks are kept.
    fn unload(&mut self);
}

impl<T: Entity> CollectionSlot for Collection<T> {
    fn state(&self) -> CollectionState {
        self.state
    }

    fn target(&self) -> EntityVTable {
        EntityVTable::of::<T>()
    }

    fn begin_load(&mut self) -> CollectionState {
        std::mem::replace(&mut self.state, CollectionState::Loading)
    }

    fn abort_load(&mut self, previous: CollectionState) {
        self.state = previous;
    }

    fn finish_load(&mut self, items: Vec<AnyRef>) -> Result<()> {
        let mut loaded = Vec::with_capacity(items.len() + self.pending_links.len());
        for any in items {
            let item = Arc::downcast::<RwLock<T>>(any).map_err(|_| {
                Error::Consistency(ConsistencyError {
                    table: T::TABLE_NAME,
                    message: "loaded row materialized as the wrong type".to_string(),
                })
            })?;
            if position(&self.pending_unlinks, &item).is_none() && position(&loaded, &item).is_none()
            {
                loaded.push(item);
            }
        }
        for pending in &self.pending_links {
            if position(&loaded, pending).is_none() {
                loaded.push(Arc::clone(pending));
            }
        }
        self.items = loaded;
        self.state = CollectionState::Loaded;
        Ok(())
    }

    fn item_refs(&self) -> Vec<AnyRef> {
        if !self.is_loaded() {
            return Vec::new();
        }
        self.items.iter().map(crate::managed::erase).collect()
    }

    fn pending_link_refs(&self) -> Vec<AnyRef> {
        self.pending_links.iter().map(crate::managed::erase).collect()
    }

    fn pending_unlink_refs(&self) -> Vec<AnyRef> {
        self.pending_unlinks.iter().map(crate::managed::erase).collect()
    }

    fn settle_links(&mut self, linked: &[AnyRef], unlinked: &[AnyRef]) {
        let written = |done: &[AnyRef], item: &ModelRef<T>| {
            let addr = model_address(item);
            done.iter().any(|d| address(d) == addr)
        };
        self.pending_links.retain(|item| !written(linked, item));
        self.pending_unlinks.retain(|item| !written(unlinked, item));
    }

    fn unload(&mut self) {
        self.items = Vec::new();
        self.state = CollectionState::Unloaded;
    }
}
