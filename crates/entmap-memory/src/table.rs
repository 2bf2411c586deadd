//! Table storage and constraint checks.

use entmap_core::error::{QueryError, QueryErrorKind};
use entmap_core::{ColumnInfo, Error, Filter, Result, Row, TableDef, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Rows of one table plus its auto-increment counter.
#[derive(Debug, Clone)]
pub(crate) struct Table {
    pub(crate) def: TableDef,
    columns: Arc<ColumnInfo>,
    pub(crate) rows: Vec<Vec<Value>>,
    pub(crate) next_id: i64,
}

/// What a transaction needs to put a table back the way it found it.
#[derive(Debug, Clone)]
pub(crate) struct TableImage {
    rows: Vec<Vec<Value>>,
    next_id: i64,
}

impl Table {
    pub(crate) fn new(def: TableDef) -> Self {
        let columns = Arc::new(ColumnInfo::new(
            def.columns.iter().map(|c| c.name.to_string()).collect(),
        ));
        Self {
            def,
            columns,
            rows: Vec::new(),
            next_id: 0,
        }
    }

    pub(crate) fn image(&self) -> TableImage {
        TableImage {
            rows: self.rows.clone(),
            next_id: self.next_id,
        }
    }

    pub(crate) fn restore(&mut self, image: TableImage) {
        self.rows = image.rows;
        self.next_id = image.next_id;
    }

    pub(crate) fn truncate(&mut self) {
        self.rows.clear();
        self.next_id = 0;
    }

    fn row(&self, values: &[Value]) -> Row {
        Row::with_columns(Arc::clone(&self.columns), values.to_vec())
    }

    fn index_of(&self, column: &str) -> Result<usize> {
        self.columns
            .index_of(column)
            .ok_or_else(|| unknown_column(self.def.name, column))
    }

    pub(crate) fn matching(&self, filter: &Filter) -> Vec<usize> {
        self.rows
            .iter()
            .enumerate()
            .filter(|(_, values)| filter.matches(&self.row(values)))
            .map(|(i, _)| i)
            .collect()
    }

    pub(crate) fn select(&self, filter: &Filter) -> Vec<Row> {
        self.matching(filter)
            .into_iter()
            .map(|i| self.row(&self.rows[i]))
            .collect()
    }

    /// Does any row hold `value` in `column`?
    pub(crate) fn contains_value(&self, column: &str, value: &Value) -> bool {
        let Some(idx) = self.columns.index_of(column) else {
            return false;
        };
        self.rows.iter().any(|r| r[idx].key_eq(value))
    }

    /// Build a full row from `fields`, filling the auto-increment column.
    ///
    /// Returns the row and the assigned key. The counter is advanced only
    /// once every check has passed.
    pub(crate) fn prepare_insert(
        &self,
        fields: &[(&'static str, Value)],
    ) -> Result<(Vec<Value>, Value, i64)> {
        let mut values = vec![Value::Null; self.def.columns.len()];
        for (name, value) in fields {
            values[self.index_of(name)?] = value.clone();
        }

        let mut next_id = self.next_id;
        let mut key = Value::Null;
        if let Some(auto) = self.def.auto_increment {
            let idx = self.index_of(auto)?;
            match values[idx].as_i64() {
                Some(explicit) => next_id = next_id.max(explicit),
                None if values[idx].is_null() => {
                    next_id += 1;
                    values[idx] = Value::BigInt(next_id);
                }
                None => {}
            }
            key = values[idx].clone();
        }

        self.check_row(&values)?;
        self.check_unique(&values)?;
        Ok((values, key, next_id))
    }

    /// Apply `fields` to a copy of row `idx` and check the result.
    pub(crate) fn prepare_update(
        &self,
        idx: usize,
        fields: &[(&'static str, Value)],
    ) -> Result<Vec<Value>> {
        let mut values = self.rows[idx].clone();
        for (name, value) in fields {
            let col = self.index_of(name)?;
            if self.def.primary_key.contains(name) && !values[col].key_eq(value) {
                return Err(Error::constraint(
                    self.def.name,
                    format!("primary key column '{}' cannot be changed", name),
                ));
            }
            values[col] = value.clone();
        }
        self.check_row(&values)?;
        Ok(values)
    }

    fn check_row(&self, values: &[Value]) -> Result<()> {
        for (col, value) in self.def.columns.iter().zip(values) {
            if value.is_null() && !col.nullable {
                return Err(Error::constraint(
                    self.def.name,
                    format!("NOT NULL constraint failed: {}.{}", self.def.name, col.name),
                ));
            }
            if !col.sql_type.accepts(value) {
                return Err(Error::Query(QueryError {
                    kind: QueryErrorKind::TypeMismatch,
                    table: Some(self.def.name.to_string()),
                    message: format!(
                        "column '{}' is {} but got {}",
                        col.name,
                        col.sql_type.sql_name(),
                        value.type_name()
                    ),
                    source: None,
                }));
            }
        }
        Ok(())
    }

    fn check_unique(&self, values: &[Value]) -> Result<()> {
        let pk: Vec<usize> = self
            .def
            .primary_key
            .iter()
            .filter_map(|c| self.columns.index_of(c))
            .collect();
        if pk.is_empty() {
            return Ok(());
        }
        let duplicate = self
            .rows
            .iter()
            .any(|existing| pk.iter().all(|&c| existing[c].key_eq(&values[c])));
        if duplicate {
            return Err(Error::constraint(
                self.def.name,
                format!("UNIQUE constraint failed: {}", self.def.name),
            ));
        }
        Ok(())
    }
}

/// Check every non-null foreign key in `values` against `tables`.
pub(crate) fn check_foreign_keys(
    tables: &HashMap<String, Table>,
    table: &Table,
    values: &[Value],
) -> Result<()> {
    for fk in &table.def.foreign_keys {
        let Some(idx) = table.columns.index_of(fk.column) else {
            continue;
        };
        let value = &values[idx];
        if value.is_null() {
            continue;
        }
        let found = tables
            .get(fk.ref_table)
            .is_some_and(|target| target.contains_value(fk.ref_column, value));
        if !found {
            return Err(Error::constraint(
                table.def.name,
                format!(
                    "FOREIGN KEY constraint failed: {}.{} = {} has no match in {}.{}",
                    table.def.name, fk.column, value, fk.ref_table, fk.ref_column
                ),
            ));
        }
    }
    Ok(())
}

/// Fail if any table still references one of `doomed` rows of `table`.
pub(crate) fn check_restrict(
    tables: &HashMap<String, Table>,
    table: &Table,
    doomed: &[usize],
) -> Result<()> {
    for other in tables.values() {
        for fk in other
            .def
            .foreign_keys
            .iter()
            .filter(|fk| fk.ref_table == table.def.name)
        {
            let Some(ref_idx) = table.columns.index_of(fk.ref_column) else {
                continue;
            };
            for &row in doomed {
                let key = &table.rows[row][ref_idx];
                if other.contains_value(fk.column, key) {
                    return Err(Error::constraint(
                        table.def.name,
                        format!(
                            "FOREIGN KEY constraint failed: {}.{} = {} is still referenced by {}.{}",
                            table.def.name, fk.ref_column, key, other.def.name, fk.column
                        ),
                    ));
                }
            }
        }
    }
    Ok(())
}

fn unknown_column(table: &str, column: &str) -> Error {
    Error::Query(QueryError {
        kind: QueryErrorKind::Storage,
        table: Some(table.to_string()),
        message: format!("no such column: {}.{}", table, column),
        source: None,
    })
}
