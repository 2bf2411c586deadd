//! Storage backend trait.
//!
//! This module defines the narrow interface the session needs from a
//! backing store:
//!
//! - [`Storage`] - query, insert, update, delete and transactional batches
//! - [`Filter`] - a conjunction of equality and membership predicates
//! - [`Write`] - one buffered write, as applied by [`Storage::apply_batch`]
//! - [`TableDef`] - table layout used to bootstrap a backend
//!
//! All async methods return `impl Future + Send` so sessions can be driven
//! from any executor.

use crate::error::Result;
use crate::row::Row;
use crate::types::SqlType;
use crate::value::Value;
use std::fmt;
use std::future::Future;

/// A single column predicate.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// `column = value`
    Eq(&'static str, Value),
    /// `column IN (values)`
    In(&'static str, Vec<Value>),
}

impl Predicate {
    /// Column the condition tests.
    pub fn column(&self) -> &'static str {
        match self {
            Predicate::Eq(column, _) | Predicate::In(column, _) => column,
        }
    }

    /// Does `row` satisfy this predicate?
    ///
    /// Integer values compare across widths. A missing column never matches.
    pub fn matches(&self, row: &Row) -> bool {
        let Some(actual) = row.get_by_name(self.column()) else {
            return false;
        };
        match self {
            Predicate::Eq(_, expected) => actual.key_eq(expected),
            Predicate::In(_, candidates) => candidates.iter().any(|c| actual.key_eq(c)),
        }
    }
}

/// A conjunction of predicates. The empty filter matches every row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    pub predicates: Vec<Predicate>,
}

impl Filter {
    /// Match every row.
    pub fn all() -> Self {
        Self::default()
    }

    /// Rows where `column` equals `value`.
    pub fn eq(column: &'static str, value: impl Into<Value>) -> Self {
        Self::all().and_eq(column, value)
    }

    /// Rows where `column` is one of `values`.
    pub fn is_in(column: &'static str, values: Vec<Value>) -> Self {
        Self::all().and_in(column, values)
    }

    /// Add an equality condition.
    pub fn and_eq(mut self, column: &'static str, value: impl Into<Value>) -> Self {
        self.predicates.push(Predicate::Eq(column, value.into()));
        self
    }

    /// Add a membership condition.
    pub fn and_in(mut self, column: &'static str, values: Vec<Value>) -> Self {
        self.predicates.push(Predicate::In(column, values));
        self
    }

    /// Match the row whose primary key columns equal `values`, pairwise.
    pub fn by_primary_key(columns: &'static [&'static str], values: &[Value]) -> Self {
        columns
            .iter()
            .zip(values)
            .fold(Self::all(), |filter, (column, value)| {
                filter.and_eq(column, value.clone())
            })
    }

    /// Does the filter match every row?
    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    /// Do all conditions hold for `row`?
    pub fn matches(&self, row: &Row) -> bool {
        self.predicates.iter().all(|p| p.matches(row))
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.predicates.is_empty() {
            return write!(f, "TRUE");
        }
        for (i, predicate) in self.predicates.iter().enumerate() {
            if i > 0 {
                write!(f, " AND ")?;
            }
            match predicate {
                Predicate::Eq(column, value) => write!(f, "{} = {}", column, value)?,
                Predicate::In(column, values) => {
                    let list: Vec<String> = values.iter().map(ToString::to_string).collect();
                    write!(f, "{} IN ({})", column, list.join(", "))?;
                }
            }
        }
        Ok(())
    }
}

/// Which kind of write a [`Write`] performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteKind {
    Insert,
    Update,
    Delete,
}

impl WriteKind {
    /// Lowercase name used in logs and errors.
    pub const fn as_str(&self) -> &'static str {
        match self {
            WriteKind::Insert => "insert",
            WriteKind::Update => "update",
            WriteKind::Delete => "delete",
        }
    }
}

/// One buffered storage write.
#[derive(Debug, Clone, PartialEq)]
pub enum Write {
    Insert {
        table: &'static str,
        fields: Vec<(&'static str, Value)>,
    },
    Update {
        table: &'static str,
        filter: Filter,
        fields: Vec<(&'static str, Value)>,
    },
    Delete {
        table: &'static str,
        filter: Filter,
    },
}

impl Write {
    /// Insert, update or delete.
    pub fn kind(&self) -> WriteKind {
        match self {
            Write::Insert { .. } => WriteKind::Insert,
            Write::Update { .. } => WriteKind::Update,
            Write::Delete { .. } => WriteKind::Delete,
        }
    }

    /// Table the write targets.
    pub fn table(&self) -> &'static str {
        match self {
            Write::Insert { table, .. } | Write::Update { table, .. } | Write::Delete { table, .. } => {
                table
            }
        }
    }
}

/// Column layout of a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: &'static str,
    pub sql_type: SqlType,
    pub nullable: bool,
}

/// A foreign key from `column` to `ref_table.ref_column`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKeyDef {
    pub column: &'static str,
    pub ref_table: &'static str,
    pub ref_column: &'static str,
}

/// Table layout handed to [`Storage::create_table`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDef {
    pub name: &'static str,
    pub columns: Vec<ColumnDef>,
    /// Primary key columns. Unique across the table.
    pub primary_key: Vec<&'static str>,
    /// Column filled from a counter when an insert leaves it NULL
    pub auto_increment: Option<&'static str>,
    pub foreign_keys: Vec<ForeignKeyDef>,
}

impl TableDef {
    /// Definition of the column called `name`.
    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// A backing store for sessions.
///
/// Several sessions may share one storage handle; each handle obtained via
/// `Clone` is free to keep its own transaction state.
///
/// # Example
///
/// ```ignore
/// let rows = storage.query("cause", &Filter::eq("risk_id", 1_i64)).await?;
/// let id = storage.insert("risk", &[("name", Value::from("TestRisk"))]).await?;
/// ```
pub trait Storage: Send + Sync {
    /// Create a table. Fails if it already exists.
    fn create_table(&self, def: &TableDef) -> impl Future<Output = Result<()>> + Send;

    /// Return every row of `table` matching `filter`, in insertion order.
    fn query(&self, table: &str, filter: &Filter) -> impl Future<Output = Result<Vec<Row>>> + Send;

    /// Insert a row and return the assigned primary key.
    ///
    /// Tables without an auto-increment column return `Value::Null`.
    fn insert(
        &self,
        table: &str,
        fields: &[(&'static str, Value)],
    ) -> impl Future<Output = Result<Value>> + Send;

    /// Update matching rows and return how many changed.
    fn update(
        &self,
        table: &str,
        filter: &Filter,
        fields: &[(&'static str, Value)],
    ) -> impl Future<Output = Result<u64>> + Send;

    /// Delete matching rows and return how many were removed.
    fn delete(&self, table: &str, filter: &Filter) -> impl Future<Output = Result<u64>> + Send;

    /// Whether `begin`/`commit`/`rollback` give all-or-nothing semantics.
    fn supports_transactions(&self) -> bool {
        false
    }

    fn begin(&self) -> impl Future<Output = Result<()>> + Send;

    fn commit(&self) -> impl Future<Output = Result<()>> + Send;

    fn rollback(&self) -> impl Future<Output = Result<()>> + Send;

    /// Apply one buffered write.
    ///
    /// Inserts yield the assigned key; updates and deletes yield the number
    /// of affected rows as a `BigInt`.
    fn apply(&self, write: &Write) -> impl Future<Output = Result<Value>> + Send {
        async move {
            match write {
                Write::Insert { table, fields } => self.insert(table, fields).await,
                Write::Update {
                    table,
                    filter,
                    fields,
                } => {
                    let n = self.update(table, filter, fields).await?;
                    Ok(Value::BigInt(n as i64))
                }
                Write::Delete { table, filter } => {
                    let n = self.delete(table, filter).await?;
                    Ok(Value::BigInt(n as i64))
                }
            }
        }
    }

    /// Apply a batch of writes in order, returning one result per write.
    ///
    /// With transaction support the batch is all-or-nothing: any failure
    /// rolls back every earlier write and the original error is returned.
    fn apply_batch(&self, writes: &[Write]) -> impl Future<Output = Result<Vec<Value>>> + Send {
        async move {
            let transactional = self.supports_transactions();
            if transactional {
                self.begin().await?;
            }

            let mut results = Vec::with_capacity(writes.len());
            for write in writes {
                match self.apply(write).await {
                    Ok(value) => results.push(value),
                    Err(e) => {
                        if transactional {
                            if let Err(rollback_err) = self.rollback().await {
                                tracing::warn!(
                                    error = %rollback_err,
                                    "Rollback after failed batch write also failed"
                                );
                            }
                        }
                        return Err(e);
                    }
                }
            }

            if transactional {
                self.commit().await?;
            }
            Ok(results)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::Mutex;

    /// Records every call and fails writes against `poison`.
    #[derive(Default)]
    struct RecordingStorage {
        calls: Mutex<Vec<String>>,
        poison: Option<&'static str>,
        transactional: bool,
    }

    impl RecordingStorage {
        fn log(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl Storage for RecordingStorage {
        async fn create_table(&self, def: &TableDef) -> Result<()> {
            self.log(format!("create {}", def.name));
            Ok(())
        }

        async fn query(&self, table: &str, filter: &Filter) -> Result<Vec<Row>> {
            self.log(format!("query {} {}", table, filter));
            Ok(Vec::new())
        }

        async fn insert(&self, table: &str, _fields: &[(&'static str, Value)]) -> Result<Value> {
            if self.poison == Some(table) {
                return Err(Error::constraint(table, "poisoned"));
            }
            self.log(format!("insert {}", table));
            Ok(Value::BigInt(1))
        }

        async fn update(
            &self,
            table: &str,
            _filter: &Filter,
            _fields: &[(&'static str, Value)],
        ) -> Result<u64> {
            self.log(format!("update {}", table));
            Ok(2)
        }

        async fn delete(&self, table: &str, _filter: &Filter) -> Result<u64> {
            self.log(format!("delete {}", table));
            Ok(0)
        }

        fn supports_transactions(&self) -> bool {
            self.transactional
        }

        async fn begin(&self) -> Result<()> {
            self.log("begin".to_string());
            Ok(())
        }

        async fn commit(&self) -> Result<()> {
            self.log("commit".to_string());
            Ok(())
        }

        async fn rollback(&self) -> Result<()> {
            self.log("rollback".to_string());
            Ok(())
        }
    }

    fn batch() -> Vec<Write> {
        vec![
            Write::Insert {
                table: "risk",
                fields: vec![("name", Value::from("TestRisk"))],
            },
            Write::Update {
                table: "risk",
                filter: Filter::eq("id", 1_i64),
                fields: vec![("name", Value::from("Updated"))],
            },
            Write::Insert {
                table: "cause",
                fields: vec![("risk_id", Value::BigInt(1))],
            },
        ]
    }

    #[test]
    fn test_filter_matching() {
        let row = Row::from_pairs([("id", Value::Int(3)), ("risk_id", Value::BigInt(1))]);
        assert!(Filter::all().matches(&row));
        assert!(Filter::eq("id", 3_i64).matches(&row));
        assert!(Filter::eq("id", 3_i64).and_eq("risk_id", 1_i64).matches(&row));
        assert!(!Filter::eq("id", 3_i64).and_eq("risk_id", 2_i64).matches(&row));
        assert!(Filter::is_in("id", vec![Value::BigInt(1), Value::BigInt(3)]).matches(&row));
        assert!(!Filter::is_in("id", Vec::new()).matches(&row));
        assert!(!Filter::eq("missing", 3_i64).matches(&row));
    }

    #[test]
    fn test_filter_display() {
        let filter = Filter::by_primary_key(&["measure_id", "risk_id"], &[Value::BigInt(1), Value::BigInt(2)])
            .and_in("x", vec![Value::from("a"), Value::Null]);
        assert_eq!(
            filter.to_string(),
            "measure_id = 1 AND risk_id = 2 AND x IN ('a', NULL)"
        );
        assert_eq!(Filter::all().to_string(), "TRUE");
    }

    #[tokio::test]
    async fn test_apply_batch_commits_in_order() {
        let storage = RecordingStorage {
            transactional: true,
            ..Default::default()
        };
        let results = storage.apply_batch(&batch()).await.unwrap();
        assert_eq!(
            results,
            vec![Value::BigInt(1), Value::BigInt(2), Value::BigInt(1)]
        );
        assert_eq!(
            storage.calls(),
            vec!["begin", "insert risk", "update risk", "insert cause", "commit"]
        );
    }

    #[tokio::test]
    async fn test_apply_batch_rolls_back_and_returns_original_error() {
        let storage = RecordingStorage {
            transactional: true,
            poison: Some("cause"),
            ..Default::default()
        };
        let err = storage.apply_batch(&batch()).await.unwrap_err();
        match err {
            Error::Query(q) => assert!(q.is_constraint_violation()),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(
            storage.calls(),
            vec!["begin", "insert risk", "update risk", "rollback"]
        );
    }

    #[tokio::test]
    async fn test_apply_batch_without_transactions_keeps_applied_writes() {
        let storage = RecordingStorage {
            poison: Some("cause"),
            ..Default::default()
        };
        assert!(storage.apply_batch(&batch()).await.is_err());
        assert_eq!(storage.calls(), vec!["insert risk", "update risk"]);
    }

    #[test]
    fn test_write_accessors() {
        let writes = batch();
        assert_eq!(writes[0].kind(), WriteKind::Insert);
        assert_eq!(writes[1].kind().as_str(), "update");
        assert_eq!(writes[2].table(), "cause");
    }
}
