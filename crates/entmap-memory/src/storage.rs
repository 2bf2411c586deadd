//! The in-memory storage backend.

use crate::table::{Table, TableImage, check_foreign_keys, check_restrict};
use entmap_core::error::{QueryError, QueryErrorKind, TransactionError, TransactionErrorKind};
use entmap_core::{
    Error, Filter, Result, Row, SchemaError, SchemaErrorKind, Storage, TableDef, Value, WriteKind,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::OwnedMutexGuard;

#[derive(Debug, Default)]
pub(crate) struct Database {
    tables: HashMap<String, Table>,
}

impl Database {
    fn table(&self, name: &str) -> Result<&Table> {
        self.tables
            .get(name)
            .ok_or_else(|| Error::table_not_found(name))
    }

    fn table_mut(&mut self, name: &str) -> Result<&mut Table> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| Error::table_not_found(name))
    }
}

/// An open transaction: exclusive access to the database plus the images
/// needed to undo it.
struct TxState {
    db: OwnedMutexGuard<Database>,
    undo: HashMap<String, TableImage>,
    created: Vec<String>,
}

impl TxState {
    fn roll_back(mut self) {
        for name in std::mem::take(&mut self.created) {
            self.db.tables.remove(&name);
        }
        for (name, image) in std::mem::take(&mut self.undo) {
            if let Some(table) = self.db.tables.get_mut(&name) {
                table.restore(image);
            }
        }
    }
}

#[derive(Debug, Clone)]
struct Fault {
    table: String,
    kind: WriteKind,
}

/// A transactional in-memory store.
///
/// Handles created with `Clone` or [`MemoryStorage::connect`] share the same
/// data but each carries its own transaction slot, so several sessions can
/// work against one store. A transaction holds the store exclusively until
/// it commits or rolls back; other handles wait and never observe its
/// uncommitted writes.
///
/// Inserts and updates enforce NOT NULL, column types, primary key
/// uniqueness and foreign keys. Deleting a row that is still referenced
/// fails.
///
/// # Example
///
/// ```ignore
/// let storage = MemoryStorage::new();
/// storage.create_table(&def).await?;
/// let id = storage.insert("project", &[]).await?;
/// ```
pub struct MemoryStorage {
    db: Arc<tokio::sync::Mutex<Database>>,
    tx: Mutex<Option<TxState>>,
    faults: Arc<Mutex<Vec<Fault>>>,
    transactional: bool,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for MemoryStorage {
    fn clone(&self) -> Self {
        self.connect()
    }
}

impl std::fmt::Debug for MemoryStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStorage")
            .field("transactional", &self.transactional)
            .field("in_transaction", &self.in_transaction())
            .finish_non_exhaustive()
    }
}

fn relock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryStorage {
    /// Empty, transactional storage.
    pub fn new() -> Self {
        Self {
            db: Arc::new(tokio::sync::Mutex::new(Database::default())),
            tx: Mutex::new(None),
            faults: Arc::new(Mutex::new(Vec::new())),
            transactional: true,
        }
    }

    /// Disable transactions: `supports_transactions` reports false and
    /// `begin` fails, so every write is applied immediately.
    pub fn non_transactional(mut self) -> Self {
        self.transactional = false;
        self
    }

    /// Open another handle onto the same data with its own transaction slot.
    pub fn connect(&self) -> Self {
        Self {
            db: Arc::clone(&self.db),
            tx: Mutex::new(None),
            faults: Arc::clone(&self.faults),
            transactional: self.transactional,
        }
    }

    /// Is a transaction open?
    pub fn in_transaction(&self) -> bool {
        relock(&self.tx).is_some()
    }

    /// Make the next `kind` write against `table` fail.
    ///
    /// Faults are shared by every handle of this store and are consumed in
    /// the order they were registered.
    pub fn fail_next(&self, table: &str, kind: WriteKind) {
        relock(&self.faults).push(Fault {
            table: table.to_string(),
            kind,
        });
    }

    /// Delete every row and reset counters, keeping the tables.
    pub async fn clear_data(&self) {
        let mut db = self.db.lock().await;
        for table in db.tables.values_mut() {
            table.truncate();
        }
        tracing::debug!("Cleared all tables");
    }

    /// Number of rows currently visible in `table`.
    pub async fn row_count(&self, table: &str) -> Result<usize> {
        Ok(self.query(table, &Filter::all()).await?.len())
    }

    fn take_fault(&self, table: &str, kind: WriteKind) -> Result<()> {
        let mut faults = relock(&self.faults);
        if let Some(pos) = faults
            .iter()
            .position(|f| f.table == table && f.kind == kind)
        {
            faults.remove(pos);
            tracing::debug!(table = table, kind = kind.as_str(), "Injected write failure");
            return Err(Error::Query(QueryError {
                kind: QueryErrorKind::Storage,
                table: Some(table.to_string()),
                message: format!("injected {} failure on '{}'", kind.as_str(), table),
                source: None,
            }));
        }
        Ok(())
    }

    /// Run `f` against the database, inside this handle's transaction if
    /// one is open.
    ///
    /// `f` receives the transaction state so writes can record undo images.
    async fn with_db<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Database, Option<&mut TxUndo<'_>>) -> Result<R> + Send,
        R: Send,
    {
        {
            let mut slot = relock(&self.tx);
            if let Some(tx) = slot.as_mut() {
                let TxState { db, undo, created } = tx;
                let mut recorder = TxUndo { undo, created };
                return f(&mut **db, Some(&mut recorder));
            }
        }
        let mut db = self.db.lock().await;
        f(&mut *db, None)
    }
}

/// Undo bookkeeping handed to write closures.
struct TxUndo<'a> {
    undo: &'a mut HashMap<String, TableImage>,
    created: &'a mut Vec<String>,
}

impl TxUndo<'_> {
    fn record(&mut self, db: &Database, table: &str) {
        if self.undo.contains_key(table) || self.created.iter().any(|c| c == table) {
            return;
        }
        if let Some(t) = db.tables.get(table) {
            self.undo.insert(table.to_string(), t.image());
        }
    }
}

fn record(undo: &mut Option<&mut TxUndo<'_>>, db: &Database, table: &str) {
    if let Some(undo) = undo.as_deref_mut() {
        undo.record(db, table);
    }
}

impl Storage for MemoryStorage {
    #[tracing::instrument(level = "debug", skip(self, def), fields(table = def.name))]
    async fn create_table(&self, def: &TableDef) -> Result<()> {
        let def = def.clone();
        self.with_db(move |db, undo| {
            if db.tables.contains_key(def.name) {
                return Err(Error::Schema(SchemaError {
                    kind: SchemaErrorKind::TableExists,
                    message: format!("table '{}' already exists", def.name),
                }));
            }
            if let Some(undo) = undo {
                undo.created.push(def.name.to_string());
            }
            db.tables.insert(def.name.to_string(), Table::new(def));
            Ok(())
        })
        .await
    }

    #[tracing::instrument(level = "trace", skip(self, filter), fields(filter = %filter))]
    async fn query(&self, table: &str, filter: &Filter) -> Result<Vec<Row>> {
        let rows = self
            .with_db(|db, _| Ok(db.table(table)?.select(filter)))
            .await?;
        tracing::trace!(rows = rows.len(), "Query complete");
        Ok(rows)
    }

    #[tracing::instrument(level = "debug", skip(self, fields))]
    async fn insert(&self, table: &str, fields: &[(&'static str, Value)]) -> Result<Value> {
        self.take_fault(table, WriteKind::Insert)?;
        let key = self
            .with_db(|db, mut undo| {
                let target = db.table(table)?;
                let (values, key, next_id) = target.prepare_insert(fields)?;
                check_foreign_keys(&db.tables, target, &values)?;
                record(&mut undo, db, table);
                let target = db.table_mut(table)?;
                target.rows.push(values);
                target.next_id = next_id;
                Ok(key)
            })
            .await?;
        tracing::debug!(key = %key, "Row inserted");
        Ok(key)
    }

    #[tracing::instrument(level = "debug", skip(self, filter, fields), fields(filter = %filter))]
    async fn update(
        &self,
        table: &str,
        filter: &Filter,
        fields: &[(&'static str, Value)],
    ) -> Result<u64> {
        self.take_fault(table, WriteKind::Update)?;
        self.with_db(|db, mut undo| {
            let target = db.table(table)?;
            let mut updated = Vec::new();
            for idx in target.matching(filter) {
                let values = target.prepare_update(idx, fields)?;
                check_foreign_keys(&db.tables, target, &values)?;
                updated.push((idx, values));
            }
            record(&mut undo, db, table);
            let target = db.table_mut(table)?;
            let count = updated.len() as u64;
            for (idx, values) in updated {
                target.rows[idx] = values;
            }
            tracing::debug!(rows = count, "Rows updated");
            Ok(count)
        })
        .await
    }

    #[tracing::instrument(level = "debug", skip(self, filter), fields(filter = %filter))]
    async fn delete(&self, table: &str, filter: &Filter) -> Result<u64> {
        self.take_fault(table, WriteKind::Delete)?;
        self.with_db(|db, mut undo| {
            let target = db.table(table)?;
            let doomed = target.matching(filter);
            check_restrict(&db.tables, target, &doomed)?;
            record(&mut undo, db, table);
            let target = db.table_mut(table)?;
            let count = doomed.len() as u64;
            for idx in doomed.into_iter().rev() {
                target.rows.remove(idx);
            }
            tracing::debug!(rows = count, "Rows deleted");
            Ok(count)
        })
        .await
    }

    fn supports_transactions(&self) -> bool {
        self.transactional
    }

    async fn begin(&self) -> Result<()> {
        if !self.transactional {
            return Err(Error::Transaction(TransactionError {
                kind: TransactionErrorKind::Unsupported,
                message: "storage was opened without transaction support".to_string(),
            }));
        }
        if self.in_transaction() {
            return Err(Error::Transaction(TransactionError {
                kind: TransactionErrorKind::AlreadyActive,
                message: "a transaction is already open on this handle".to_string(),
            }));
        }
        let db = Arc::clone(&self.db).lock_owned().await;
        *relock(&self.tx) = Some(TxState {
            db,
            undo: HashMap::new(),
            created: Vec::new(),
        });
        tracing::trace!("Transaction started");
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        let state = relock(&self.tx).take();
        match state {
            Some(state) => {
                drop(state);
                tracing::trace!("Transaction committed");
                Ok(())
            }
            None => Err(not_active("commit")),
        }
    }

    async fn rollback(&self) -> Result<()> {
        let state = relock(&self.tx).take();
        match state {
            Some(state) => {
                let tables = state.undo.len();
                state.roll_back();
                tracing::debug!(tables = tables, "Transaction rolled back");
                Ok(())
            }
            None => Err(not_active("rollback")),
        }
    }
}

fn not_active(op: &str) -> Error {
    Error::Transaction(TransactionError {
        kind: TransactionErrorKind::NotActive,
        message: format!("cannot {} without an open transaction", op),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use entmap_core::{ColumnDef, ForeignKeyDef, SqlType};

    fn id_column() -> ColumnDef {
        ColumnDef {
            name: "id",
            sql_type: SqlType::BigInt,
            nullable: false,
        }
    }

    fn risk_table() -> TableDef {
        TableDef {
            name: "risk",
            columns: vec![
                id_column(),
                ColumnDef {
                    name: "name",
                    sql_type: SqlType::Text,
                    nullable: false,
                },
            ],
            primary_key: vec!["id"],
            auto_increment: Some("id"),
            foreign_keys: Vec::new(),
        }
    }

    fn cause_table() -> TableDef {
        TableDef {
            name: "cause",
            columns: vec![
                id_column(),
                ColumnDef {
                    name: "risk_id",
                    sql_type: SqlType::BigInt,
                    nullable: true,
                },
            ],
            primary_key: vec!["id"],
            auto_increment: Some("id"),
            foreign_keys: vec![ForeignKeyDef {
                column: "risk_id",
                ref_table: "risk",
                ref_column: "id",
            }],
        }
    }

    async fn storage() -> MemoryStorage {
        let storage = MemoryStorage::new();
        storage.create_table(&risk_table()).await.unwrap();
        storage.create_table(&cause_table()).await.unwrap();
        storage
    }

    fn name(value: &str) -> Vec<(&'static str, Value)> {
        vec![("name", Value::from(value))]
    }

    #[tokio::test]
    async fn test_insert_assigns_increasing_keys() {
        let storage = storage().await;
        assert_eq!(storage.insert("risk", &name("a")).await.unwrap(), Value::BigInt(1));
        assert_eq!(storage.insert("risk", &name("b")).await.unwrap(), Value::BigInt(2));

        let rows = storage.query("risk", &Filter::eq("id", 2_i64)).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get_named::<String>("name").unwrap(), "b");
    }

    #[tokio::test]
    async fn test_constraints_are_enforced() {
        let storage = storage().await;
        let missing_name = storage.insert("risk", &[]).await.unwrap_err();
        assert!(matches!(missing_name, Error::Query(ref q) if q.is_constraint_violation()));

        let dangling = storage
            .insert("cause", &[("risk_id", Value::BigInt(42))])
            .await
            .unwrap_err();
        assert!(dangling.to_string().contains("FOREIGN KEY"));

        let wrong_type = storage
            .insert("risk", &[("name", Value::BigInt(1))])
            .await
            .unwrap_err();
        assert!(matches!(wrong_type, Error::Query(ref q) if q.kind == QueryErrorKind::TypeMismatch));

        storage.insert("risk", &name("a")).await.unwrap();
        let duplicate = storage
            .insert("risk", &[("id", Value::BigInt(1)), ("name", Value::from("b"))])
            .await
            .unwrap_err();
        assert!(duplicate.to_string().contains("UNIQUE"));

        assert!(storage.query("nope", &Filter::all()).await.is_err());
    }

    #[tokio::test]
    async fn test_delete_is_restricted_while_referenced() {
        let storage = storage().await;
        storage.insert("risk", &name("a")).await.unwrap();
        storage
            .insert("cause", &[("risk_id", Value::BigInt(1))])
            .await
            .unwrap();

        assert!(storage.delete("risk", &Filter::eq("id", 1_i64)).await.is_err());
        assert_eq!(storage.delete("cause", &Filter::all()).await.unwrap(), 1);
        assert_eq!(storage.delete("risk", &Filter::eq("id", 1_i64)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_update_counts_matching_rows() {
        let storage = storage().await;
        storage.insert("risk", &name("a")).await.unwrap();
        storage.insert("risk", &name("b")).await.unwrap();

        let n = storage
            .update("risk", &Filter::eq("id", 1_i64), &name("Updated"))
            .await
            .unwrap();
        assert_eq!(n, 1);
        let rows = storage.query("risk", &Filter::eq("name", "Updated")).await.unwrap();
        assert_eq!(rows.len(), 1);

        let pk_change = storage
            .update("risk", &Filter::eq("id", 1_i64), &[("id", Value::BigInt(9))])
            .await;
        assert!(pk_change.is_err());
    }

    #[tokio::test]
    async fn test_rollback_restores_rows_and_counter() {
        let storage = storage().await;
        storage.insert("risk", &name("kept")).await.unwrap();

        storage.begin().await.unwrap();
        assert!(storage.in_transaction());
        storage.insert("risk", &name("gone")).await.unwrap();
        storage
            .update("risk", &Filter::eq("id", 1_i64), &name("changed"))
            .await
            .unwrap();
        assert_eq!(storage.row_count("risk").await.unwrap(), 2);
        storage.rollback().await.unwrap();

        let rows = storage.query("risk", &Filter::all()).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get_named::<String>("name").unwrap(), "kept");
        assert_eq!(storage.insert("risk", &name("next")).await.unwrap(), Value::BigInt(2));
    }

    #[tokio::test]
    async fn test_transaction_misuse() {
        let storage = storage().await;
        assert!(storage.commit().await.is_err());
        assert!(storage.rollback().await.is_err());
        storage.begin().await.unwrap();
        assert!(storage.begin().await.is_err());
        storage.commit().await.unwrap();

        let plain = MemoryStorage::new().non_transactional();
        assert!(!plain.supports_transactions());
        assert!(plain.begin().await.is_err());
    }

    #[tokio::test]
    async fn test_other_handles_see_only_committed_writes() {
        let storage = storage().await;
        let other = storage.connect();

        storage.begin().await.unwrap();
        storage.insert("risk", &name("pending")).await.unwrap();
        storage.commit().await.unwrap();
        assert_eq!(other.row_count("risk").await.unwrap(), 1);

        storage.begin().await.unwrap();
        storage.insert("risk", &name("discarded")).await.unwrap();
        storage.rollback().await.unwrap();
        assert_eq!(other.row_count("risk").await.unwrap(), 1);
        assert!(!other.in_transaction());
    }

    #[tokio::test]
    async fn test_injected_fault_fires_once() {
        let storage = storage().await;
        storage.fail_next("risk", WriteKind::Insert);
        assert!(storage.insert("risk", &name("a")).await.is_err());
        assert_eq!(storage.insert("risk", &name("a")).await.unwrap(), Value::BigInt(1));
    }

    #[tokio::test]
    async fn test_apply_batch_is_all_or_nothing() {
        use entmap_core::Write;

        let storage = storage().await;
        let writes = vec![
            Write::Insert {
                table: "risk",
                fields: name("a"),
            },
            Write::Insert {
                table: "cause",
                fields: vec![("risk_id", Value::BigInt(7))],
            },
        ];
        assert!(storage.apply_batch(&writes).await.is_err());
        assert_eq!(storage.row_count("risk").await.unwrap(), 0);
        assert!(!storage.in_transaction());

        let plain = storage.connect().non_transactional();
        assert!(plain.apply_batch(&writes).await.is_err());
        assert_eq!(plain.row_count("risk").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_clear_data_resets_counters() {
        let storage = storage().await;
        storage.insert("risk", &name("a")).await.unwrap();
        storage.clear_data().await;
        assert_eq!(storage.row_count("risk").await.unwrap(), 0);
        assert_eq!(storage.insert("risk", &name("b")).await.unwrap(), Value::BigInt(1));
    }
}
