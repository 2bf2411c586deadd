//! Relationship loading.
//!
//! [`RelationshipLoader`] fills one collection on one owner from storage:
//!
//! 1. Resolve the target entity and join columns from the relationship
//!    metadata.
//! 2. Query the target rows (one-to-many), or the link rows and then the
//!    target rows (many-to-many, keeping link order).
//! 3. Resolve every row through the identity map. Instances already managed
//!    are reused as they are; only unseen rows are materialized.
//! 4. Replace the items of that one collection and mark it loaded.
//!
//! Nothing else on the owner, and nothing on a reused instance, is read
//! from storage or written. Freshly materialized instances get their eager
//! collections loaded from a worklist.

use crate::SessionConfig;
use crate::change_tracker::ChangeTracker;
use crate::identity_map::IdentityMap;
use crate::managed::{AnyRef, EntityVTable, Managed};
use entmap_core::{
    ConsistencyError, Error, Filter, InvalidStateError, RelationshipInfo, RelationshipKind,
    Result, Row, SchemaError, SchemaErrorKind, Storage, Value,
};
use entmap_schema::Schema;
use std::collections::VecDeque;

/// Borrowed session state for the duration of one load.
pub(crate) struct RelationshipLoader<'a, S: Storage> {
    pub(crate) storage: &'a S,
    pub(crate) schema: &'a Schema,
    pub(crate) identity_map: &'a mut IdentityMap,
    pub(crate) tracker: &'a mut ChangeTracker,
    pub(crate) config: &'a SessionConfig,
}

/// Rows of a reused instance captured when it was resolved.
struct Reused {
    managed: Box<dyn Managed>,
    row: Vec<(&'static str, Value)>,
}

/// Collections of one load.
struct Loaded {
    items: Vec<AnyRef>,
    fresh: Vec<Box<dyn Managed>>,
}

impl<S: Storage> RelationshipLoader<'_, S> {
    /// Load `rel` on `owner`, then the eager collections of every instance
    /// the load materialized.
    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(table = owner.table(), relationship = rel.name)
    )]
    pub(crate) async fn load(
        &mut self,
        owner: &dyn Managed,
        rel: &'static RelationshipInfo,
    ) -> Result<Vec<AnyRef>> {
        let loaded = self.load_one(owner, rel).await?;
        self.load_eager(loaded.fresh).await?;
        Ok(loaded.items)
    }

    /// Load the eager collections of freshly materialized instances.
    ///
    /// Each instance is fresh at most once per scope, so the walk ends.
    pub(crate) async fn load_eager(&mut self, fresh: Vec<Box<dyn Managed>>) -> Result<()> {
        if !self.config.eager_loading {
            return Ok(());
        }
        let mut worklist: VecDeque<(Box<dyn Managed>, &'static RelationshipInfo)> =
            VecDeque::new();
        queue_eager(&mut worklist, fresh);
        while let Some((owner, rel)) = worklist.pop_front() {
            tracing::trace!(table = owner.table(), relationship = rel.name, "Eager load");
            let loaded = self.load_one(owner.as_ref(), rel).await?;
            queue_eager(&mut worklist, loaded.fresh);
        }
        Ok(())
    }

    #[allow(clippy::result_large_err)]
    async fn load_one(
        &mut self,
        owner: &dyn Managed,
        rel: &'static RelationshipInfo,
    ) -> Result<Loaded> {
        if !rel.is_collection() {
            return Err(schema_error(
                SchemaErrorKind::UnsupportedRelationship,
                format!(
                    "'{}.{}' is many-to-one; read its foreign key instead",
                    owner.table(),
                    rel.name
                ),
            ));
        }
        if !self.schema.contains_table(rel.related_table) {
            return Err(schema_error(
                SchemaErrorKind::TableNotFound,
                format!(
                    "'{}.{}' targets unregistered table '{}'",
                    owner.table(),
                    rel.name,
                    rel.related_table
                ),
            ));
        }
        let pk = owner.primary_key();
        let owner_key = match pk.first() {
            Some(value) if !owner.is_new() && !value.is_null() => value.clone(),
            _ => {
                return Err(Error::InvalidState(InvalidStateError::new(
                    owner.table(),
                    format!(
                        "cannot load '{}' on a '{}' that has no primary key",
                        rel.name,
                        owner.table()
                    ),
                )));
            }
        };

        let owner_before = self.config.verify_isolation.then(|| owner.row());
        let Some((previous, target)) = owner.begin_load(rel.name) else {
            return Err(schema_error(
                SchemaErrorKind::UnsupportedRelationship,
                format!("'{}' holds no collection named '{}'", owner.table(), rel.name),
            ));
        };

        let rows = match self.fetch(rel, owner_key, &target).await {
            Ok(rows) => rows,
            Err(e) => {
                owner.abort_load(rel.name, previous);
                return Err(e);
            }
        };

        let mut loaded = Loaded {
            items: Vec::with_capacity(rows.len()),
            fresh: Vec::new(),
        };
        let mut reused = Vec::new();
        for row in &rows {
            let resolved = match self.identity_map.resolve_row(&target, row) {
                Ok(resolved) => resolved,
                Err(e) => {
                    owner.abort_load(rel.name, previous);
                    return Err(e);
                }
            };
            match resolved.fresh {
                Some(fresh) => {
                    if let Err(e) = self.tracker.snapshot(resolved.key, &fresh.row()) {
                        owner.abort_load(rel.name, previous);
                        return Err(e);
                    }
                    loaded.fresh.push(fresh);
                }
                None if self.config.verify_isolation => {
                    if let Some(managed) = target.wrap(&resolved.item) {
                        let row = managed.row();
                        reused.push(Reused { managed, row });
                    }
                }
                None => {}
            }
            loaded.items.push(resolved.item);
        }

        if let Err(e) = owner.finish_load(rel.name, loaded.items.clone()) {
            owner.abort_load(rel.name, previous);
            return Err(e);
        }
        tracing::debug!(
            table = owner.table(),
            relationship = rel.name,
            rows = loaded.items.len(),
            materialized = loaded.fresh.len(),
            "Collection loaded"
        );

        if let Some(before) = owner_before {
            verify_unchanged(owner, &before, rel)?;
            for r in &reused {
                verify_unchanged(r.managed.as_ref(), &r.row, rel)?;
            }
        }
        Ok(loaded)
    }

    async fn fetch(
        &self,
        rel: &'static RelationshipInfo,
        owner_key: Value,
        target: &EntityVTable,
    ) -> Result<Vec<Row>> {
        match rel.kind {
            RelationshipKind::OneToMany => {
                let remote_key = rel.remote_key.ok_or_else(|| missing_join(rel))?;
                self.storage
                    .query(target.table, &Filter::eq(remote_key, owner_key))
                    .await
            }
            RelationshipKind::ManyToMany => {
                let link = rel.link_table.ok_or_else(|| missing_join(rel))?;
                let target_pk = target
                    .primary_key
                    .first()
                    .copied()
                    .ok_or_else(|| missing_join(rel))?;
                let link_rows = self
                    .storage
                    .query(link.table_name, &Filter::eq(link.local_column, owner_key))
                    .await?;
                let ids: Vec<Value> = link_rows
                    .iter()
                    .filter_map(|row| row.get_by_name(link.remote_column).cloned())
                    .collect();
                if ids.is_empty() {
                    return Ok(Vec::new());
                }
                let rows = self
                    .storage
                    .query(target.table, &Filter::is_in(target_pk, ids.clone()))
                    .await?;
                Ok(ids
                    .iter()
                    .filter_map(|id| {
                        rows.iter()
                            .find(|row| row.get_by_name(target_pk).is_some_and(|v| v.key_eq(id)))
                            .cloned()
                    })
                    .collect())
            }
            RelationshipKind::ManyToOne => Err(missing_join(rel)),
        }
    }
}

fn queue_eager(
    worklist: &mut VecDeque<(Box<dyn Managed>, &'static RelationshipInfo)>,
    fresh: Vec<Box<dyn Managed>>,
) {
    for managed in fresh {
        let eager = managed
            .vtable()
            .relationships
            .iter()
            .filter(|r| r.is_eager());
        for rel in eager {
            worklist.push_back((managed.clone_box(), rel));
        }
    }
}

#[allow(clippy::result_large_err)]
fn verify_unchanged(
    managed: &dyn Managed,
    before: &[(&'static str, Value)],
    rel: &RelationshipInfo,
) -> Result<()> {
    if managed.row() == before {
        return Ok(());
    }
    Err(Error::Consistency(ConsistencyError {
        table: managed.table(),
        message: format!("scalar fields changed while loading '{}'", rel.name),
    }))
}

fn schema_error(kind: SchemaErrorKind, message: String) -> Error {
    Error::Schema(SchemaError { kind, message })
}

fn missing_join(rel: &RelationshipInfo) -> Error {
    schema_error(
        SchemaErrorKind::UnsupportedRelationship,
        format!("'{}' declares no join columns", rel.name),
    )
}
