//! Flush operation ordering and execution.
//!
//! This module writes pending changes to storage in an order the foreign
//! keys accept:
//!
//! 1. Link rows being removed, including every link of a deleted entity
//! 2. DELETE child-first
//! 3. INSERT parent-first, writing each assigned id back immediately
//! 4. UPDATE of the dirty columns only
//! 5. New link rows, once both ends have their ids
//!
//! Every storage failure is wrapped in a `PersistenceError` naming the
//! failed step. [`FlushProgress`] records what reached storage so the
//! session can decide what to settle when a write fails.

use crate::ObjectKey;
use crate::identity_map::IdentityMap;
use crate::managed::{AnyRef, EntityVTable};
use entmap_core::{
    Error, Filter, LinkTableInfo, NotFoundError, PersistenceError, PersistenceErrorKind, Result,
    Storage, Value, Write,
};
use entmap_schema::Schema;
use std::collections::HashMap;

/// A pending entity write.
#[derive(Debug, Clone)]
pub enum PendingOp {
    /// Insert a new row.
    Insert {
        /// Object key for identity map.
        key: ObjectKey,
        table: &'static str,
        columns: Vec<&'static str>,
        values: Vec<Value>,
    },
    /// Update the dirty columns of an existing row.
    Update {
        key: ObjectKey,
        table: &'static str,
        pk_columns: &'static [&'static str],
        pk_values: Vec<Value>,
        set_columns: Vec<&'static str>,
        set_values: Vec<Value>,
    },
    /// Delete an existing row.
    Delete {
        key: ObjectKey,
        table: &'static str,
        pk_columns: &'static [&'static str],
        pk_values: Vec<Value>,
    },
}

impl PendingOp {
    /// Table the write targets.
    pub fn table(&self) -> &'static str {
        match self {
            PendingOp::Insert { table, .. }
            | PendingOp::Update { table, .. }
            | PendingOp::Delete { table, .. } => table,
        }
    }

    /// Identity-map key of the written instance.
    pub fn key(&self) -> ObjectKey {
        match self {
            PendingOp::Insert { key, .. }
            | PendingOp::Update { key, .. }
            | PendingOp::Delete { key, .. } => *key,
        }
    }

    /// Is this an insert?
    pub fn is_insert(&self) -> bool {
        matches!(self, PendingOp::Insert { .. })
    }

    /// Primary key the write targets (empty for an insert).
    pub fn pk_values(&self) -> &[Value] {
        match self {
            PendingOp::Insert { .. } => &[],
            PendingOp::Update { pk_values, .. } | PendingOp::Delete { pk_values, .. } => pk_values,
        }
    }

    fn to_write(&self) -> Write {
        match self {
            PendingOp::Insert {
                table,
                columns,
                values,
                ..
            } => Write::Insert {
                table: *table,
                fields: columns.iter().copied().zip(values.iter().cloned()).collect(),
            },
            PendingOp::Update {
                table,
                pk_columns,
                pk_values,
                set_columns,
                set_values,
                ..
            } => Write::Update {
                table: *table,
                filter: Filter::by_primary_key(*pk_columns, pk_values),
                fields: set_columns
                    .iter()
                    .copied()
                    .zip(set_values.iter().cloned())
                    .collect(),
            },
            PendingOp::Delete {
                table,
                pk_columns,
                pk_values,
                ..
            } => Write::Delete {
                table: *table,
                filter: Filter::by_primary_key(*pk_columns, pk_values),
            },
        }
    }

    fn failure_kind(&self) -> PersistenceErrorKind {
        match self {
            PendingOp::Insert { .. } => PersistenceErrorKind::Insert,
            PendingOp::Update { .. } => PersistenceErrorKind::Update,
            PendingOp::Delete { .. } => PersistenceErrorKind::Delete,
        }
    }
}

/// One end-to-end link between an owner and a related instance.
///
/// Primary keys are resolved when the op executes, so links to instances
/// inserted earlier in the same flush see their new ids.
#[derive(Debug, Clone)]
pub struct LinkEdge {
    /// The owning-side instance.
    pub owner: ObjectKey,
    pub relationship: &'static str,
    /// Link table as seen from the owner.
    pub link: LinkTableInfo,
    pub target: AnyRef,
    pub target_vtable: EntityVTable,
}

/// A pending link table operation (for many-to-many relationships).
#[derive(Debug, Clone)]
pub enum LinkTableOp {
    /// Insert a link row.
    Link(LinkEdge),
    /// Delete a link row.
    Unlink(LinkEdge),
}

impl LinkTableOp {
    /// The link-table edge written or removed.
    pub fn edge(&self) -> &LinkEdge {
        match self {
            LinkTableOp::Link(edge) | LinkTableOp::Unlink(edge) => edge,
        }
    }

    /// Link table written.
    pub fn table(&self) -> &'static str {
        self.edge().link.table_name
    }

    /// Does this write a link row?
    pub fn is_link(&self) -> bool {
        matches!(self, LinkTableOp::Link(_))
    }

    /// Does this remove a link row?
    pub fn is_unlink(&self) -> bool {
        matches!(self, LinkTableOp::Unlink(_))
    }

    /// Write this op, returning whether a row was touched.
    #[tracing::instrument(level = "debug", skip_all, fields(table = self.table()))]
    async fn execute<S: Storage>(&self, storage: &S, map: &IdentityMap) -> Result<bool> {
        let edge = self.edge();
        let kind = if self.is_link() {
            PersistenceErrorKind::Link
        } else {
            PersistenceErrorKind::Unlink
        };
        let owner_pk = map
            .entry(&edge.owner)
            .map(|entry| entry.managed.primary_key())
            .and_then(first_key);
        let target_pk = edge
            .target_vtable
            .primary_key_of(&edge.target)
            .and_then(first_key);

        let (Some(local), Some(remote)) = (owner_pk, target_pk) else {
            if self.is_unlink() {
                // Never stored, so there is no row to remove.
                return Ok(false);
            }
            return Err(Error::Persistence(PersistenceError::wrap(
                kind,
                self.table(),
                Error::Custom(format!(
                    "'{}' links an instance that has no primary key; persist it first",
                    edge.relationship
                )),
            )));
        };

        let write = match self {
            LinkTableOp::Link(_) => Write::Insert {
                table: edge.link.table_name,
                fields: vec![(edge.link.local_column, local), (edge.link.remote_column, remote)],
            },
            LinkTableOp::Unlink(_) => Write::Delete {
                table: edge.link.table_name,
                filter: Filter::eq(edge.link.local_column, local)
                    .and_eq(edge.link.remote_column, remote),
            },
        };
        storage
            .apply(&write)
            .await
            .map_err(|e| Error::Persistence(PersistenceError::wrap(kind, self.table(), e)))?;
        Ok(true)
    }
}

fn first_key(pk: Vec<Value>) -> Option<Value> {
    pk.into_iter().next().filter(|v| !v.is_null())
}

/// Removal of every link row that references a deleted entity.
#[derive(Debug, Clone)]
pub struct LinkPurge {
    pub key: ObjectKey,
    pub table: &'static str,
    pub column: &'static str,
    pub value: Value,
}

/// Orders operations by foreign key depth.
///
/// A table's depth is 0 without foreign keys and one more than its deepest
/// referenced table otherwise:
/// - Parents must be inserted before children
/// - Children must be deleted before parents
#[derive(Debug, Default)]
pub struct FlushOrderer {
    depth: HashMap<&'static str, usize>,
}

impl FlushOrderer {
    /// Empty plan.
    pub fn new() -> Self {
        Self::default()
    }

    /// Compute depths for every entity of `schema`.
    ///
    /// Tables on an FK cycle get a finite depth here; the unit of work
    /// rejects such schemas before ordering.
    pub fn from_schema(schema: &Schema) -> Self {
        let mut orderer = Self::new();
        for table in schema.tables_in_dependency_order() {
            let depth = schema
                .dependencies(table)
                .iter()
                .filter_map(|dep| orderer.depth.get(dep))
                .map(|d| d + 1)
                .max()
                .unwrap_or(0);
            orderer.depth.insert(table, depth);
        }
        orderer
    }

    /// Register a table's depth directly.
    pub fn register_table(&mut self, table: &'static str, depth: usize) {
        self.depth.insert(table, depth);
    }

    /// Position of `table` in dependency order; unknown tables sort first.
    pub fn depth(&self, table: &str) -> usize {
        self.depth.get(table).copied().unwrap_or(0)
    }

    /// Sort inserts parent-first and deletes child-first.
    ///
    /// Both sorts are stable, so persist order survives within a table.
    pub fn order(&self, plan: &mut FlushPlan) {
        plan.inserts
            .sort_by_key(|op| (self.depth(op.table()), op.table()));
        plan.deletes
            .sort_by_key(|op| (std::cmp::Reverse(self.depth(op.table())), op.table()));
        plan.updates.sort_by_key(PendingOp::table);
    }
}

/// A plan for executing flush operations.
#[derive(Debug, Default)]
pub struct FlushPlan {
    pub unlinks: Vec<LinkTableOp>,
    pub purges: Vec<LinkPurge>,
    /// Delete operations (ordered child-first).
    pub deletes: Vec<PendingOp>,
    /// Insert operations (ordered parent-first).
    pub inserts: Vec<PendingOp>,
    pub updates: Vec<PendingOp>,
    pub links: Vec<LinkTableOp>,
    /// Pending link ops on inverse sides; they never reach storage.
    pub discarded: Vec<(ObjectKey, &'static str)>,
}

/// What a (possibly failed) execution wrote.
#[derive(Debug, Default)]
pub struct FlushProgress {
    pub inserted: Vec<ObjectKey>,
    pub updated: Vec<ObjectKey>,
    pub deleted: Vec<ObjectKey>,
    pub linked: Vec<LinkEdge>,
    pub unlinked: Vec<LinkEdge>,
}

impl FlushProgress {
    /// Counts of the writes applied so far.
    pub fn result(&self) -> FlushResult {
        FlushResult {
            inserted: self.inserted.len(),
            updated: self.updated.len(),
            deleted: self.deleted.len(),
            linked: self.linked.len(),
            unlinked: self.unlinked.len(),
        }
    }
}

impl FlushPlan {
    /// Nothing applied yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if the plan writes anything.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total number of writes in the plan.
    pub fn len(&self) -> usize {
        self.unlinks.len()
            + self.purges.len()
            + self.deletes.len()
            + self.inserts.len()
            + self.updates.len()
            + self.links.len()
    }

    /// Execute the plan against storage.
    ///
    /// Ids assigned by inserts are written into the instances as they come
    /// back. Stops at the first failure; `progress` then holds exactly the
    /// writes that were applied.
    #[tracing::instrument(level = "info", skip_all)]
    pub async fn execute<S: Storage>(
        &self,
        storage: &S,
        map: &IdentityMap,
        progress: &mut FlushProgress,
    ) -> Result<()> {
        tracing::info!(
            unlinks = self.unlinks.len() + self.purges.len(),
            deletes = self.deletes.len(),
            inserts = self.inserts.len(),
            updates = self.updates.len(),
            links = self.links.len(),
            "Executing flush plan"
        );
        let start = std::time::Instant::now();

        // 1. Link rows first, so deletes are not blocked by them
        for op in &self.unlinks {
            if op.execute(storage, map).await? {
                progress.unlinked.push(op.edge().clone());
            }
        }
        for purge in &self.purges {
            storage
                .delete(purge.table, &Filter::eq(purge.column, purge.value.clone()))
                .await
                .map_err(|e| {
                    Error::Persistence(PersistenceError::wrap(
                        PersistenceErrorKind::Unlink,
                        purge.table,
                        e,
                    ))
                })?;
        }

        // 2. Deletes (child-first)
        for batch in Self::batch_by_table(&self.deletes) {
            tracing::debug!(table = batch[0].table(), rows = batch.len(), "Deleting batch");
            for op in batch {
                Self::apply(storage, op).await?;
                progress.deleted.push(op.key());
            }
        }

        // 3. Inserts (parent-first)
        for batch in Self::batch_by_table(&self.inserts) {
            tracing::debug!(table = batch[0].table(), rows = batch.len(), "Inserting batch");
            for op in batch {
                let id = Self::apply(storage, op).await?;
                if let (Some(entry), Some(id)) = (map.entry(&op.key()), id.as_i64()) {
                    entry.managed.assign_id(Some(id));
                }
                progress.inserted.push(op.key());
            }
        }

        // 4. Updates (one at a time - different columns may be dirty)
        for op in &self.updates {
            Self::apply(storage, op).await?;
            progress.updated.push(op.key());
        }

        // 5. New link rows
        for op in &self.links {
            if op.execute(storage, map).await? {
                progress.linked.push(op.edge().clone());
            }
        }

        let result = progress.result();
        tracing::info!(
            elapsed_ms = start.elapsed().as_millis(),
            inserted = result.inserted,
            updated = result.updated,
            deleted = result.deleted,
            linked = result.linked,
            unlinked = result.unlinked,
            "Flush plan executed"
        );
        Ok(())
    }

    /// Apply one entity write. An update or delete that matches no row
    /// fails, so its change stays pending.
    async fn apply<S: Storage>(storage: &S, op: &PendingOp) -> Result<Value> {
        let fail =
            |e: Error| Error::Persistence(PersistenceError::wrap(op.failure_kind(), op.table(), e));
        let value = storage.apply(&op.to_write()).await.map_err(|e| {
            tracing::debug!(table = op.table(), error = %e, "Flush write failed");
            fail(e)
        })?;
        if !op.is_insert() && value.as_i64() == Some(0) {
            tracing::debug!(
                table = op.table(),
                pk = ?op.pk_values(),
                "Flush write matched no row"
            );
            return Err(fail(Error::NotFound(NotFoundError {
                table: op.table(),
                pk: op.pk_values().to_vec(),
            })));
        }
        Ok(value)
    }

    /// Group consecutive operations by table name.
    fn batch_by_table(ops: &[PendingOp]) -> Vec<Vec<&PendingOp>> {
        let mut batches: Vec<Vec<&PendingOp>> = Vec::new();
        for op in ops {
            match batches.last_mut() {
                Some(batch) if batch[0].table() == op.table() => batch.push(op),
                _ => batches.push(vec![op]),
            }
        }
        batches
    }
}

/// Result of a flush operation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushResult {
    /// Number of rows inserted.
    pub inserted: usize,
    /// Number of rows updated.
    pub updated: usize,
    /// Number of rows deleted.
    pub deleted: usize,
    /// Number of link rows written.
    pub linked: usize,
    /// Number of link rows removed.
    pub unlinked: usize,
}

impl FlushResult {
    /// Orderer with no tables registered.
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of operations performed.
    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.deleted + self.linked + self.unlinked
    }
}
