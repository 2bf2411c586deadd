//! Session and Unit of Work for entmap.
//!
//! `entmap-session` is the **unit-of-work layer**. It coordinates object
//! identity, change tracking, relationship loading and persistence against a
//! [`Storage`] backend.
//!
//! # Role In The Architecture
//!
//! - **Identity map**: ensures a single in-memory instance per primary key.
//! - **Change tracking**: snapshots plus explicit marks, keyed per instance.
//! - **Relationship loading**: fills one named collection and nothing else.
//! - **Flush**: inserts, updates, deletes and link rows in FK order, with
//!   rollback or partial settlement on failure.
//!
//! # Design Philosophy
//!
//! - **Explicit scope**: every data access goes through a [`Session`]; there
//!   is no ambient state.
//! - **No autoflush, no lazy I/O**: reading a collection never touches
//!   storage. Only [`Session::load`] and [`Session::get`] do.
//! - **Type erasure**: the identity map stores [`Managed`] handles over the
//!   same `Arc<RwLock<M>>` the caller holds.
//!
//! # Example
//!
//! ```ignore
//! let mut session = Session::new(storage, schema);
//!
//! let risk = session.get::<Risk>(1_i64).await?;
//! session.mark_dirty(&risk, "name", "Updated")?;
//!
//! let causes = session.load::<Risk, Cause>(&risk, "causes").await?;
//! assert_eq!(risk.read().unwrap().name, "Updated");
//!
//! session.flush().await?;
//! ```

pub mod change_tracker;
pub mod collection;
pub mod flush;
pub mod identity_map;
mod loader;
pub mod managed;
pub mod unit_of_work;

pub use change_tracker::ChangeTracker;
pub use collection::{Collection, CollectionSlot, CollectionState};
pub use flush::{
    FlushOrderer, FlushPlan, FlushProgress, FlushResult, LinkEdge, LinkPurge, LinkTableOp,
    PendingOp,
};
pub use identity_map::{IdentityEntry, IdentityMap, Resolved};
pub use managed::{
    AnyRef, Entity, EntityVTable, Managed, ManagedModel, ModelRef, downcast, erase,
};
pub use unit_of_work::{PendingCounts, UnitOfWork, UowError};

use entmap_core::{
    Error, Filter, InvalidStateError, Model, NotFoundError, PersistenceError,
    PersistenceErrorKind, Result, SchemaError, SchemaErrorKind, Storage, Value,
};
use entmap_schema::Schema;
use loader::RelationshipLoader;
use std::any::TypeId;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

// ============================================================================
// Session Events
// ============================================================================

/// Callbacks receive no arguments; returning `Err` aborts the operation.
type SessionEventFn = Box<dyn FnMut() -> Result<()> + Send>;

/// Holds registered session-level event callbacks.
#[derive(Default)]
pub struct SessionEventCallbacks {
    before_flush: Vec<SessionEventFn>,
    after_flush: Vec<SessionEventFn>,
    after_rollback: Vec<SessionEventFn>,
}

impl std::fmt::Debug for SessionEventCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionEventCallbacks")
            .field("before_flush", &self.before_flush.len())
            .field("after_flush", &self.after_flush.len())
            .field("after_rollback", &self.after_rollback.len())
            .finish()
    }
}

impl SessionEventCallbacks {
    #[allow(clippy::result_large_err)]
    fn fire(&mut self, event: SessionEvent) -> Result<()> {
        let callbacks = match event {
            SessionEvent::BeforeFlush => &mut self.before_flush,
            SessionEvent::AfterFlush => &mut self.after_flush,
            SessionEvent::AfterRollback => &mut self.after_rollback,
        };
        for cb in callbacks.iter_mut() {
            cb()?;
        }
        Ok(())
    }
}

/// Session lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Fired before a flush plans anything. An error vetoes the flush.
    BeforeFlush,
    /// Fired after a flush completed and was settled.
    AfterFlush,
    /// Fired after a failed flush was rolled back.
    AfterRollback,
}

// ============================================================================
// Session Configuration
// ============================================================================

/// Configuration for Session behavior.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Wrap each flush in a storage transaction when the backend supports one.
    pub transactional_flush: bool,
    /// Load `Selectin` collections whenever their owner is materialized.
    pub eager_loading: bool,
    /// Check that a relationship load left every scalar field it must not
    /// touch unchanged.
    pub verify_isolation: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            transactional_flush: true,
            eager_loading: true,
            verify_isolation: true,
        }
    }
}

// ============================================================================
// Object Key and State
// ============================================================================

/// Unique key for an object in the identity map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    /// Type identifier for the Model type.
    type_id: TypeId,
    identity: Identity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
enum Identity {
    /// Hash of the primary key value(s).
    Persistent(u64),
    /// Session-local sequence number of a pending insert.
    Transient(u64),
}

impl ObjectKey {
    /// Create an object key from type and primary key.
    pub fn from_pk<M: Model>(pk: &[Value]) -> Self {
        Self::persistent(TypeId::of::<M>(), pk)
    }

    /// Key of a stored row of the entity with `type_id`.
    pub fn persistent(type_id: TypeId, pk: &[Value]) -> Self {
        Self {
            type_id,
            identity: Identity::Persistent(identity_map::hash_pk_values(pk)),
        }
    }

    pub(crate) fn transient(type_id: TypeId, sequence: u64) -> Self {
        Self {
            type_id,
            identity: Identity::Transient(sequence),
        }
    }

    /// Get the type identifier.
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Is this the key of an instance not yet written to storage?
    pub fn is_transient(&self) -> bool {
        matches!(self.identity, Identity::Transient(_))
    }

    /// The primary key hash, for persistent keys.
    pub fn pk_hash(&self) -> Option<u64> {
        match self.identity {
            Identity::Persistent(hash) => Some(hash),
            Identity::Transient(_) => None,
        }
    }
}

/// State of a tracked object in the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectState {
    /// New object, needs INSERT on flush.
    New,
    /// Persistent object loaded from or written to storage.
    Persistent,
    /// Object marked for deletion, needs DELETE on flush.
    Deleted,
    /// Object not managed by this session.
    Detached,
}

// ============================================================================
// Session
// ============================================================================

/// The Session is the unit-of-work scope.
///
/// It owns the identity map and the pending changes of one unit of work, and
/// a storage handle that may be shared with other sessions.
pub struct Session<S: Storage> {
    storage: S,
    schema: Arc<Schema>,
    config: SessionConfig,
    identity_map: IdentityMap,
    unit_of_work: UnitOfWork,
    event_callbacks: SessionEventCallbacks,
}

impl<S: Storage> Session<S> {
    /// Create a new session over `storage` for the entities of `schema`.
    pub fn new(storage: S, schema: Arc<Schema>) -> Self {
        Self::with_config(storage, schema, SessionConfig::default())
    }

    /// Create a new session with custom configuration.
    pub fn with_config(storage: S, schema: Arc<Schema>, config: SessionConfig) -> Self {
        let unit_of_work = UnitOfWork::new(&schema);
        Self {
            storage,
            schema,
            config,
            identity_map: IdentityMap::new(),
            unit_of_work,
            event_callbacks: SessionEventCallbacks::default(),
        }
    }

    /// The storage handle this session writes through.
    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// The schema this session was built for.
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Get the session configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Get the identity map (read-only).
    pub fn identity_map(&self) -> &IdentityMap {
        &self.identity_map
    }

    // ========================================================================
    // Event Callbacks
    // ========================================================================

    /// Register a callback run before every flush.
    pub fn on_before_flush(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.event_callbacks.before_flush.push(Box::new(f));
    }

    /// Register a callback run after every successful flush.
    pub fn on_after_flush(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.event_callbacks.after_flush.push(Box::new(f));
    }

    /// Register a callback run after a failed flush was rolled back.
    pub fn on_after_rollback(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.event_callbacks.after_rollback.push(Box::new(f));
    }

    // ========================================================================
    // Object Operations
    // ========================================================================

    /// Get an instance by primary key, failing with `NotFound` if no row
    /// matches.
    pub async fn get<M: Entity>(&mut self, pk: impl Into<Value>) -> Result<ModelRef<M>> {
        let pk = pk.into();
        match self.find::<M>(pk.clone()).await? {
            Some(model) => Ok(model),
            None => Err(Error::NotFound(NotFoundError {
                table: M::TABLE_NAME,
                pk: vec![pk],
            })),
        }
    }

    /// Get an instance by primary key.
    ///
    /// The identity map is checked first; an instance already managed is
    /// returned as it is, without reading storage. A freshly materialized
    /// instance gets a baseline snapshot and its eager collections loaded.
    #[tracing::instrument(level = "debug", skip(self, pk), fields(table = M::TABLE_NAME))]
    pub async fn find<M: Entity>(&mut self, pk: impl Into<Value>) -> Result<Option<ModelRef<M>>> {
        self.ensure_registered::<M>()?;
        let pk = vec![pk.into()];
        let key = ObjectKey::from_pk::<M>(&pk);

        if let Some(entry) = self.identity_map.entry(&key) {
            if entry.state == ObjectState::Deleted {
                tracing::trace!("Instance is pending delete");
                return Ok(None);
            }
            tracing::trace!("Identity map hit");
            return downcast::<M>(entry.managed.any_ref()).map(Some);
        }

        let rows = self
            .storage
            .query(M::TABLE_NAME, &Filter::by_primary_key(M::PRIMARY_KEY, &pk))
            .await?;
        let Some(row) = rows.first() else {
            tracing::debug!(pk = ?pk, "No row found");
            return Ok(None);
        };

        let (model, created) = self.identity_map.get_or_create::<M>(&pk, || M::from_row(row))?;
        if created {
            let managed = ManagedModel::new(Arc::clone(&model));
            self.unit_of_work
                .change_tracker_mut()
                .snapshot(key, &managed.row())?;
            tracing::debug!(pk = ?pk, "Materialized from storage");
            self.loader().load_eager(vec![Box::new(managed)]).await?;
        }
        Ok(Some(model))
    }

    /// Add a new instance to the session, returning its shared handle.
    #[allow(clippy::result_large_err)]
    pub fn persist<M: Entity>(&mut self, model: M) -> Result<ModelRef<M>> {
        let model = Arc::new(RwLock::new(model));
        self.persist_ref(&model)?;
        Ok(model)
    }

    /// Add an instance the caller already holds.
    ///
    /// Persisting an instance this session manages does nothing. Any other
    /// instance is inserted on the next flush; one that already carries a
    /// primary key is inserted with that key.
    #[allow(clippy::result_large_err)]
    pub fn persist_ref<M: Entity>(&mut self, model: &ModelRef<M>) -> Result<()> {
        self.ensure_registered::<M>()?;
        if let Some(key) = self.identity_map.key_of(model) {
            if self.state_by_key(&key) == ObjectState::Deleted {
                return Err(invalid_state::<M>("instance is scheduled for deletion"));
            }
            return Ok(());
        }

        let managed = Box::new(ManagedModel::new(Arc::clone(model)));
        if managed.is_new() {
            let key = self.identity_map.attach_new(managed);
            self.unit_of_work.track_new(key);
            tracing::debug!(table = M::TABLE_NAME, "Persisting new instance");
            return Ok(());
        }

        let key = ObjectKey::from_pk::<M>(&managed.primary_key());
        if self.identity_map.contains_key(&key) {
            return Err(invalid_state::<M>(
                "another instance with this primary key is already managed",
            ));
        }
        let key = self.identity_map.attach_new_keyed(managed);
        self.unit_of_work.track_new(key);
        tracing::debug!(table = M::TABLE_NAME, "Persisting new instance with explicit key");
        Ok(())
    }

    /// Schedule an instance for deletion.
    ///
    /// A pending-new instance is simply unregistered.
    #[allow(clippy::result_large_err)]
    pub fn remove<M: Entity>(&mut self, model: &ModelRef<M>) -> Result<()> {
        let key = self.managed_key(model)?;
        match self.state_by_key(&key) {
            ObjectState::New => {
                self.identity_map.remove(&key);
                self.unit_of_work.forget(&key);
                tracing::debug!(table = M::TABLE_NAME, "Dropped pending insert");
            }
            ObjectState::Persistent => {
                self.identity_map.set_state(&key, ObjectState::Deleted);
                self.unit_of_work.track_deleted(key);
                tracing::debug!(table = M::TABLE_NAME, "Scheduled delete");
            }
            ObjectState::Deleted | ObjectState::Detached => {}
        }
        Ok(())
    }

    /// Write `value` into `field` and record the field as changed.
    ///
    /// `field` may be the Rust field name or the column name.
    #[allow(clippy::result_large_err)]
    pub fn mark_dirty<M: Entity>(
        &mut self,
        model: &ModelRef<M>,
        field: &str,
        value: impl Into<Value>,
    ) -> Result<()> {
        let key = self.managed_key(model)?;
        if self.state_by_key(&key) == ObjectState::Deleted {
            return Err(invalid_state::<M>("instance is scheduled for deletion"));
        }
        let column = M::fields()
            .iter()
            .find(|f| f.name == field || f.column_name == field)
            .map(|f| f.column_name)
            .ok_or_else(|| Error::InvalidState(InvalidStateError::unknown_field(M::TABLE_NAME, field)))?;

        managed::write(model).set_field(column, value.into())?;
        self.unit_of_work.change_tracker_mut().mark(key, column);
        tracing::trace!(table = M::TABLE_NAME, column, "Marked dirty");
        Ok(())
    }

    /// Columns of `model` the next flush will write.
    #[allow(clippy::result_large_err)]
    pub fn pending_changes<M: Entity>(&self, model: &ModelRef<M>) -> Result<BTreeSet<&'static str>> {
        let key = self.managed_key(model)?;
        if self.state_by_key(&key) == ObjectState::Deleted {
            return Ok(BTreeSet::new());
        }
        let row = managed::read(model).to_row();
        Ok(self.unit_of_work.change_tracker().pending_changes(&key, &row))
    }

    /// Whether `model` has anything to write on the next flush.
    pub fn is_modified<M: Entity>(&self, model: &ModelRef<M>) -> bool {
        let Some(key) = self.identity_map.key_of(model) else {
            return false;
        };
        match self.state_by_key(&key) {
            ObjectState::New | ObjectState::Deleted => true,
            ObjectState::Persistent => {
                let row = managed::read(model).to_row();
                self.unit_of_work.change_tracker().is_dirty(&key, &row)
            }
            ObjectState::Detached => false,
        }
    }

    /// Whether this very instance is managed by the session.
    pub fn contains<M: Entity>(&self, model: &ModelRef<M>) -> bool {
        self.identity_map.contains(model)
    }

    /// Lifecycle state of `model` in this session.
    pub fn state_of<M: Entity>(&self, model: &ModelRef<M>) -> ObjectState {
        self.identity_map
            .key_of(model)
            .map_or(ObjectState::Detached, |key| self.state_by_key(&key))
    }

    // ========================================================================
    // Relationship Loading
    // ========================================================================

    /// Load collection `name` on `owner` and return its items.
    ///
    /// Only that collection changes. Scalar fields of `owner`, its other
    /// collections and every instance the load reuses are left as they are,
    /// including mutations not yet flushed.
    #[tracing::instrument(level = "debug", skip(self, owner), fields(table = P::TABLE_NAME))]
    pub async fn load<P: Entity, T: Entity>(
        &mut self,
        owner: &ModelRef<P>,
        name: &str,
    ) -> Result<Vec<ModelRef<T>>> {
        if managed::read(owner).is_new() {
            return Err(invalid_state::<P>(format!(
                "cannot load '{}' on a '{}' that has no primary key",
                name,
                P::TABLE_NAME
            )));
        }
        let rel = self.schema.relationship(P::TABLE_NAME, name)?;
        if rel.related_table != T::TABLE_NAME {
            return Err(Error::Schema(SchemaError {
                kind: SchemaErrorKind::Invalid,
                message: format!(
                    "'{}.{}' holds '{}', not '{}'",
                    P::TABLE_NAME,
                    name,
                    rel.related_table,
                    T::TABLE_NAME
                ),
            }));
        }
        self.managed_key(owner)?;

        let owner = ManagedModel::new(Arc::clone(owner));
        let items = self.loader().load(&owner, rel).await?;
        items.into_iter().map(downcast::<T>).collect()
    }

    fn loader(&mut self) -> RelationshipLoader<'_, S> {
        RelationshipLoader {
            storage: &self.storage,
            schema: &self.schema,
            identity_map: &mut self.identity_map,
            tracker: self.unit_of_work.change_tracker_mut(),
            config: &self.config,
        }
    }

    // ========================================================================
    // Flush
    // ========================================================================

    /// Write every pending change to storage.
    ///
    /// On success all written instances are settled: new instances are
    /// re-keyed under their assigned ids, snapshots are refreshed and deleted
    /// instances are detached.
    ///
    /// On failure the error is a `PersistenceError` and nothing unwritten is
    /// cleared, so the flush can be retried. With a transactional backend
    /// the whole flush is rolled back and assigned ids are cleared again.
    /// Without one, the writes that reached storage are settled and the rest
    /// stay pending.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn flush(&mut self) -> Result<FlushResult> {
        self.event_callbacks.fire(SessionEvent::BeforeFlush)?;

        let plan = self.unit_of_work.compute_flush_plan(&self.identity_map)?;
        if plan.is_empty() {
            self.discard_inverse_links(&plan);
            tracing::debug!("Nothing to flush");
            self.event_callbacks.fire(SessionEvent::AfterFlush)?;
            return Ok(FlushResult::new());
        }

        let transactional =
            self.config.transactional_flush && self.storage.supports_transactions();
        if transactional {
            self.storage.begin().await.map_err(commit_error)?;
        }

        let mut progress = FlushProgress::default();
        let mut outcome = plan
            .execute(&self.storage, &self.identity_map, &mut progress)
            .await;
        if outcome.is_ok() && transactional {
            outcome = self.storage.commit().await.map_err(commit_error);
        }
        if let Err(e) = outcome {
            return Err(self.recover(e, &progress, transactional).await);
        }

        self.settle_links(
            plan.links.iter().map(LinkTableOp::edge),
            plan.unlinks.iter().map(LinkTableOp::edge),
        );
        self.discard_inverse_links(&plan);
        self.settle_entities(&progress)?;

        let result = progress.result();
        tracing::info!(total = result.total(), "Flush complete");
        self.event_callbacks.fire(SessionEvent::AfterFlush)?;
        Ok(result)
    }

    async fn recover(&mut self, error: Error, progress: &FlushProgress, transactional: bool) -> Error {
        if !transactional {
            tracing::warn!(
                error = %error,
                written = progress.result().total(),
                "Flush failed part way; keeping the writes that reached storage"
            );
            self.settle_links(progress.linked.iter(), progress.unlinked.iter());
            if let Err(settle_err) = self.settle_entities(progress) {
                tracing::warn!(error = %settle_err, "Could not settle partial flush");
            }
            return error;
        }

        if let Err(rollback_err) = self.storage.rollback().await {
            tracing::warn!(
                error = %rollback_err,
                "Rollback after failed flush also failed"
            );
            return error;
        }
        // Only storage-assigned ids are undone; explicit keys stay.
        for key in progress.inserted.iter().filter(|k| k.is_transient()) {
            if let Some(entry) = self.identity_map.entry(key) {
                entry.managed.assign_id(None);
            }
        }
        tracing::warn!(
            error = %error,
            restored = progress.inserted.len(),
            "Flush failed; rolled back"
        );
        if let Err(callback_err) = self.event_callbacks.fire(SessionEvent::AfterRollback) {
            tracing::warn!(error = %callback_err, "after_rollback callback failed");
        }
        match error {
            Error::Persistence(mut e) => {
                e.rolled_back = true;
                Error::Persistence(e)
            }
            other => other,
        }
    }

    /// Drop the pending link operations that reached storage.
    fn settle_links<'a>(
        &self,
        linked: impl Iterator<Item = &'a LinkEdge>,
        unlinked: impl Iterator<Item = &'a LinkEdge>,
    ) {
        let mut by_owner: HashMap<(ObjectKey, &'static str), (Vec<AnyRef>, Vec<AnyRef>)> =
            HashMap::new();
        for edge in linked {
            by_owner
                .entry((edge.owner, edge.relationship))
                .or_default()
                .0
                .push(Arc::clone(&edge.target));
        }
        for edge in unlinked {
            by_owner
                .entry((edge.owner, edge.relationship))
                .or_default()
                .1
                .push(Arc::clone(&edge.target));
        }
        for ((owner, relationship), (linked, unlinked)) in by_owner {
            if let Some(entry) = self.identity_map.entry(&owner) {
                entry.managed.settle_links(relationship, &linked, &unlinked);
            }
        }
    }

    /// Inverse-side link changes never reach storage; forget them.
    fn discard_inverse_links(&self, plan: &FlushPlan) {
        for (key, relationship) in &plan.discarded {
            if let Some(entry) = self.identity_map.entry(key) {
                let (links, unlinks) = entry.managed.pending_links(relationship);
                entry.managed.settle_links(relationship, &links, &unlinks);
            }
        }
    }

    #[allow(clippy::result_large_err)]
    fn settle_entities(&mut self, progress: &FlushProgress) -> Result<()> {
        for key in &progress.inserted {
            let Some(entry) = self.identity_map.entry(key) else {
                continue;
            };
            let managed = entry.managed.clone_box();
            let new_key = ObjectKey::persistent(key.type_id(), &managed.primary_key());
            self.identity_map.rekey(key, new_key);
            self.identity_map.set_state(&new_key, ObjectState::Persistent);
            self.unit_of_work.rekey(key, new_key);
            self.unit_of_work
                .change_tracker_mut()
                .refresh(new_key, &managed.row())?;
        }
        for key in &progress.updated {
            if let Some(entry) = self.identity_map.entry(key) {
                let row = entry.managed.row();
                self.unit_of_work.change_tracker_mut().refresh(*key, &row)?;
            }
        }
        for key in &progress.deleted {
            self.identity_map.remove(key);
            self.unit_of_work.forget(key);
        }
        Ok(())
    }

    // ========================================================================
    // Scope
    // ========================================================================

    /// Reset the scope. Every held reference becomes detached and every
    /// pending change is discarded.
    ///
    /// Loaded collections of the detached instances are unloaded, so a
    /// graph that refers back to itself is freed once the caller drops it.
    pub fn clear(&mut self) {
        let tracked = self.identity_map.len();
        self.identity_map.clear();
        self.unit_of_work.clear();
        tracing::debug!(tracked, "Session cleared");
    }

    /// Detach one instance, discarding its pending changes and unloading
    /// its collections.
    pub fn expunge<M: Entity>(&mut self, model: &ModelRef<M>) {
        if let Some(key) = self.identity_map.key_of(model) {
            self.identity_map.remove(&key);
            self.unit_of_work.forget(&key);
        }
    }

    /// Count of pending operations by kind.
    pub fn pending_count(&self) -> PendingCounts {
        self.unit_of_work.pending_count(&self.identity_map)
    }

    /// Get debug information about the session state.
    pub fn debug_state(&self) -> SessionDebugInfo {
        let counts = self.pending_count();
        SessionDebugInfo {
            tracked: self.identity_map.len(),
            pending_new: counts.new,
            pending_dirty: counts.dirty,
            pending_delete: counts.deleted,
            pending_links: counts.links,
            snapshots: self.unit_of_work.change_tracker().len(),
        }
    }

    // ========================================================================
    // Internal
    // ========================================================================

    #[allow(clippy::result_large_err)]
    fn ensure_registered<M: Entity>(&self) -> Result<()> {
        if self.schema.entity_of::<M>().is_some() {
            return Ok(());
        }
        Err(Error::Schema(SchemaError {
            kind: SchemaErrorKind::TableNotFound,
            message: format!("'{}' is not part of this session's schema", M::TABLE_NAME),
        }))
    }

    #[allow(clippy::result_large_err)]
    fn managed_key<M: Entity>(&self, model: &ModelRef<M>) -> Result<ObjectKey> {
        self.identity_map
            .key_of(model)
            .ok_or_else(|| invalid_state::<M>("instance is not managed by this session"))
    }

    fn state_by_key(&self, key: &ObjectKey) -> ObjectState {
        self.identity_map
            .entry(key)
            .map_or(ObjectState::Detached, |entry| entry.state)
    }
}

impl<S: Storage> std::fmt::Debug for Session<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("config", &self.config)
            .field("identity_map", &self.identity_map)
            .field("unit_of_work", &self.unit_of_work)
            .field("event_callbacks", &self.event_callbacks)
            .finish_non_exhaustive()
    }
}

fn invalid_state<M: Model>(message: impl Into<String>) -> Error {
    Error::InvalidState(InvalidStateError::new(M::TABLE_NAME, message))
}

fn commit_error(e: Error) -> Error {
    Error::Persistence(PersistenceError::wrap(PersistenceErrorKind::Commit, "", e))
}

/// Debug information about session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionDebugInfo {
    /// Total tracked objects.
    pub tracked: usize,
    /// Objects pending INSERT.
    pub pending_new: usize,
    /// Objects pending UPDATE.
    pub pending_dirty: usize,
    /// Objects pending DELETE.
    pub pending_delete: usize,
    /// Link rows pending on owning sides.
    pub pending_links: usize,
    /// Baselines held by the change tracker.
    pub snapshots: usize,
}
