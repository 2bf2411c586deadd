//! Unit of Work pattern implementation for the session.
//!
//! The Unit of Work tracks all changes made during a session and turns them
//! into a [`FlushPlan`]:
//!
//! - New objects to INSERT, in persist order
//! - Modified (dirty) objects to UPDATE, dirty columns only
//! - Deleted objects to DELETE, together with their link rows
//! - Pending many-to-many links and unlinks from owning-side collections
//!
//! Flush order follows foreign key depth, and FK cycles between tables are
//! reported before anything is written.
//!
//! # Example
//!
//! ```ignore
//! let mut uow = UnitOfWork::new(&schema);
//!
//! uow.track_new(project_key);
//! uow.track_deleted(old_risk_key);
//!
//! // Compute flush plan (checks for cycles)
//! let plan = uow.compute_flush_plan(&identity_map)?;
//! ```

use crate::change_tracker::ChangeTracker;
use crate::flush::{FlushOrderer, FlushPlan, LinkEdge, LinkPurge, LinkTableOp, PendingOp};
use crate::identity_map::IdentityMap;
use crate::{ObjectKey, ObjectState};
use entmap_core::{Error, RelationshipKind};
use entmap_schema::Schema;
use std::collections::{HashMap, HashSet};

/// Tracks and manages all pending changes in a session.
#[derive(Debug, Default)]
pub struct UnitOfWork {
    /// Objects to be inserted, in persist order.
    pending_new: Vec<ObjectKey>,

    /// Objects to be deleted.
    pending_delete: Vec<ObjectKey>,

    /// Change tracker for dirty detection.
    change_tracker: ChangeTracker,

    /// Flush orderer for dependency-based ordering.
    orderer: FlushOrderer,

    /// Tables we've seen (for cycle detection).
    tables: HashSet<&'static str>,

    /// Table -> tables it depends on.
    table_dependencies: HashMap<&'static str, Vec<&'static str>>,
}

/// Error type for Unit of Work operations.
#[derive(Debug, Clone)]
pub enum UowError {
    /// A dependency cycle was detected between tables.
    CycleDetected {
        /// Tables involved in the cycle.
        tables: Vec<&'static str>,
    },
}

impl std::fmt::Display for UowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UowError::CycleDetected { tables } => {
                write!(f, "Dependency cycle detected: {}", tables.join(" -> "))
            }
        }
    }
}

impl std::error::Error for UowError {}

impl From<UowError> for Error {
    fn from(e: UowError) -> Self {
        Error::Custom(e.to_string())
    }
}

impl UnitOfWork {
    /// Create a unit of work for the entities of `schema`.
    #[must_use]
    pub fn new(schema: &Schema) -> Self {
        let mut uow = Self {
            orderer: FlushOrderer::from_schema(schema),
            ..Self::default()
        };
        for entity in schema.entities() {
            uow.register_table(entity.table, entity.dependencies());
        }
        uow
    }

    /// Register a table's FK dependencies for cycle detection.
    pub fn register_table(&mut self, table: &'static str, depends_on: Vec<&'static str>) {
        self.tables.insert(table);
        self.table_dependencies.insert(table, depends_on);
    }

    /// Track a new object for insertion.
    pub fn track_new(&mut self, key: ObjectKey) {
        if !self.pending_new.contains(&key) {
            self.pending_new.push(key);
        }
    }

    /// Track an object for deletion.
    pub fn track_deleted(&mut self, key: ObjectKey) {
        if !self.pending_delete.contains(&key) {
            self.pending_delete.push(key);
        }
    }

    /// Is `key` queued for insertion?
    pub fn is_pending_new(&self, key: &ObjectKey) -> bool {
        self.pending_new.contains(key)
    }

    /// Stop tracking `key` altogether.
    pub fn forget(&mut self, key: &ObjectKey) {
        self.pending_new.retain(|k| k != key);
        self.pending_delete.retain(|k| k != key);
        self.change_tracker.clear(key);
    }

    /// An insert reached storage under a new key.
    pub fn rekey(&mut self, old: &ObjectKey, new: ObjectKey) {
        self.pending_new.retain(|k| k != old);
        self.change_tracker.rekey(old, new);
    }

    /// Check for dependency cycles in the registered tables.
    ///
    /// Returns `Err(UowError::CycleDetected)` if a cycle is found.
    pub fn check_cycles(&self) -> Result<(), UowError> {
        let mut visited = HashSet::new();
        let mut rec_stack = HashSet::new();
        let mut cycle_path = Vec::new();

        let mut tables: Vec<&'static str> = self.tables.iter().copied().collect();
        tables.sort_unstable();
        for table in tables {
            if !visited.contains(table)
                && self.detect_cycle_dfs(table, &mut visited, &mut rec_stack, &mut cycle_path)
            {
                return Err(UowError::CycleDetected { tables: cycle_path });
            }
        }

        Ok(())
    }

    /// DFS helper for cycle detection.
    fn detect_cycle_dfs(
        &self,
        table: &'static str,
        visited: &mut HashSet<&'static str>,
        rec_stack: &mut HashSet<&'static str>,
        path: &mut Vec<&'static str>,
    ) -> bool {
        visited.insert(table);
        rec_stack.insert(table);
        path.push(table);

        if let Some(deps) = self.table_dependencies.get(table) {
            for dep in deps {
                // Only check tables we know about
                if !self.tables.contains(dep) {
                    continue;
                }

                if !visited.contains(dep) {
                    if self.detect_cycle_dfs(dep, visited, rec_stack, path) {
                        return true;
                    }
                } else if rec_stack.contains(dep) {
                    path.push(dep);
                    return true;
                }
            }
        }

        rec_stack.remove(table);
        path.pop();
        false
    }

    /// Compute the flush plan for everything `map` holds.
    ///
    /// # Errors
    ///
    /// Returns `Err` if a dependency cycle is detected.
    pub fn compute_flush_plan(&self, map: &IdentityMap) -> Result<FlushPlan, UowError> {
        self.check_cycles()?;
        let mut plan = FlushPlan::new();

        for key in &self.pending_new {
            let Some(entry) = map.entry(key) else {
                continue;
            };
            let (columns, values) = entry.managed.row().into_iter().unzip();
            plan.inserts.push(PendingOp::Insert {
                key: *key,
                table: entry.managed.table(),
                columns,
                values,
            });
        }

        for key in &self.pending_delete {
            let Some(entry) = map.entry(key) else {
                continue;
            };
            let vtable = entry.managed.vtable();
            let pk_values = entry.managed.primary_key();
            for rel in vtable
                .relationships
                .iter()
                .filter(|r| r.kind == RelationshipKind::ManyToMany)
            {
                if let (Some(link), Some(value)) = (rel.link_table, pk_values.first()) {
                    plan.purges.push(LinkPurge {
                        key: *key,
                        table: link.table_name,
                        column: link.local_column,
                        value: value.clone(),
                    });
                }
            }
            plan.deletes.push(PendingOp::Delete {
                key: *key,
                table: vtable.table,
                pk_columns: vtable.primary_key,
                pk_values,
            });
        }

        let mut entries: Vec<_> = map.iter().collect();
        entries.sort_by_key(|(key, _)| **key);
        for (key, entry) in entries {
            match entry.state {
                ObjectState::Deleted | ObjectState::Detached => continue,
                ObjectState::Persistent => {
                    let row = entry.managed.row();
                    let changed = self.change_tracker.pending_changes(key, &row);
                    if !changed.is_empty() {
                        let (set_columns, set_values) = row
                            .into_iter()
                            .filter(|(column, _)| changed.contains(column))
                            .unzip();
                        let vtable = entry.managed.vtable();
                        plan.updates.push(PendingOp::Update {
                            key: *key,
                            table: vtable.table,
                            pk_columns: vtable.primary_key,
                            pk_values: entry.managed.primary_key(),
                            set_columns,
                            set_values,
                        });
                    }
                }
                ObjectState::New => {}
            }
            self.plan_links(*key, entry.managed.as_ref(), &mut plan);
        }

        self.orderer.order(&mut plan);
        tracing::debug!(writes = plan.len(), "Computed flush plan");
        Ok(plan)
    }

    fn plan_links(&self, key: ObjectKey, managed: &dyn crate::Managed, plan: &mut FlushPlan) {
        for rel in managed
            .vtable()
            .relationships
            .iter()
            .filter(|r| r.kind == RelationshipKind::ManyToMany)
        {
            let (links, unlinks) = managed.pending_links(rel.name);
            if links.is_empty() && unlinks.is_empty() {
                continue;
            }
            let (Some(link), Some(target_vtable), true) = (
                rel.link_table,
                managed.collection_target(rel.name),
                rel.is_owning_side(),
            ) else {
                tracing::debug!(
                    table = managed.table(),
                    relationship = rel.name,
                    dropped = links.len() + unlinks.len(),
                    "Dropping link changes made on the inverse side"
                );
                plan.discarded.push((key, rel.name));
                continue;
            };
            let edge = |target| LinkEdge {
                owner: key,
                relationship: rel.name,
                link,
                target,
                target_vtable,
            };
            plan.unlinks
                .extend(unlinks.into_iter().map(|t| LinkTableOp::Unlink(edge(t))));
            plan.links
                .extend(links.into_iter().map(|t| LinkTableOp::Link(edge(t))));
        }
    }

    /// Clear all tracked changes.
    pub fn clear(&mut self) {
        self.pending_new.clear();
        self.pending_delete.clear();
        self.change_tracker.clear_all();
    }

    /// Get the count of pending operations.
    #[must_use]
    pub fn pending_count(&self, map: &IdentityMap) -> PendingCounts {
        let mut counts = PendingCounts {
            new: self.pending_new.len(),
            deleted: self.pending_delete.len(),
            ..PendingCounts::default()
        };
        for (key, entry) in map.iter() {
            if entry.state == ObjectState::Persistent
                && self.change_tracker.is_dirty(key, &entry.managed.row())
            {
                counts.dirty += 1;
            }
            if entry.state == ObjectState::Deleted {
                continue;
            }
            for rel in entry
                .managed
                .vtable()
                .relationships
                .iter()
                .filter(|r| r.is_owning_side())
            {
                let (links, unlinks) = entry.managed.pending_links(rel.name);
                counts.links += links.len() + unlinks.len();
            }
        }
        counts
    }

    #[must_use]
    pub fn change_tracker(&self) -> &ChangeTracker {
        &self.change_tracker
    }

    /// Mutable access to the change tracker.
    pub fn change_tracker_mut(&mut self) -> &mut ChangeTracker {
        &mut self.change_tracker
    }
}

/// Count of pending operations by type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingCounts {
    /// Objects pending INSERT.
    pub new: usize,
    /// Objects pending UPDATE.
    pub dirty: usize,
    /// Objects pending DELETE.
    pub deleted: usize,
    /// Link rows pending insert or removal.
    pub links: usize,
}

impl PendingCounts {
    /// Total number of pending operations.
    #[must_use]
    pub fn total(&self) -> usize {
        self.new + self.dirty + self.deleted + self.links
    }

    /// Check if there are no pending operations.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}
