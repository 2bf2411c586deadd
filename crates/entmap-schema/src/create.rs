//! Table definitions derived from the schema.

use crate::registry::{EntityDescriptor, LinkTableDescriptor, Schema};
use entmap_core::{ColumnDef, ForeignKeyDef, Result, SqlType, Storage, TableDef};

/// Table layout for one entity.
pub fn table_def_for(entity: &EntityDescriptor) -> TableDef {
    let columns = entity
        .fields
        .iter()
        .map(|f| ColumnDef {
            name: f.column_name,
            sql_type: f.sql_type,
            nullable: f.nullable,
        })
        .collect();
    let foreign_keys = entity
        .fields
        .iter()
        .filter_map(|f| {
            f.referenced().map(|(ref_table, ref_column)| ForeignKeyDef {
                column: f.column_name,
                ref_table,
                ref_column,
            })
        })
        .collect();
    TableDef {
        name: entity.table,
        columns,
        primary_key: entity.primary_key.to_vec(),
        auto_increment: entity
            .fields
            .iter()
            .find(|f| f.auto_increment)
            .map(|f| f.column_name),
        foreign_keys,
    }
}

/// Table layout for a many-to-many link table.
///
/// Both columns are non-null foreign keys to the joined tables' first
/// primary key column and together form the primary key, so a pair can be
/// linked only once.
pub fn link_table_def(schema: &Schema, link: &LinkTableDescriptor) -> TableDef {
    let key_of = |table: &'static str| {
        schema
            .entity(table)
            .and_then(|e| e.primary_key.first().copied())
            .unwrap_or("id")
    };
    let column = |name| ColumnDef {
        name,
        sql_type: SqlType::BigInt,
        nullable: false,
    };
    TableDef {
        name: link.info.table_name,
        columns: vec![column(link.info.local_column), column(link.info.remote_column)],
        primary_key: vec![link.info.local_column, link.info.remote_column],
        auto_increment: None,
        foreign_keys: vec![
            ForeignKeyDef {
                column: link.info.local_column,
                ref_table: link.owner_table,
                ref_column: key_of(link.owner_table),
            },
            ForeignKeyDef {
                column: link.info.remote_column,
                ref_table: link.target_table,
                ref_column: key_of(link.target_table),
            },
        ],
    }
}

/// Every table the schema needs, parents before children and link tables
/// last.
pub fn table_defs(schema: &Schema) -> Vec<TableDef> {
    let mut defs: Vec<TableDef> = schema
        .tables_in_dependency_order()
        .into_iter()
        .filter_map(|table| schema.entity(table))
        .map(table_def_for)
        .collect();
    defs.extend(schema.link_tables().map(|link| link_table_def(schema, link)));
    defs
}

/// Create every entity and link table in `storage`.
#[tracing::instrument(level = "debug", skip_all)]
pub async fn create_all<S: Storage>(storage: &S, schema: &Schema) -> Result<()> {
    let defs = table_defs(schema);
    for def in &defs {
        storage.create_table(def).await?;
    }
    tracing::info!(tables = defs.len(), "Schema created");
    Ok(())
}
