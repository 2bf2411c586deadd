//! Core types and traits for entmap.
//!
//! This crate provides the foundational abstractions shared by the schema
//! registry, the storage backends and the session layer:
//!
//! - `Model` trait for mapping structs to storage tables
//! - `FieldInfo` / `RelationshipInfo` static metadata
//! - `Value` and `Row` for dynamically typed column data
//! - `Storage` trait for the backing store (query, insert, update, delete, batches)
//! - `Error` with the invalid-state, not-found, persistence and consistency kinds

pub mod error;
pub mod field;
pub mod model;
pub mod relationship;
pub mod row;
pub mod storage;
pub mod types;
pub mod value;

pub use error::{
    ConsistencyError, Error, InvalidStateError, NotFoundError, PersistenceError,
    PersistenceErrorKind, QueryError, QueryErrorKind, Result, SchemaError, SchemaErrorKind,
    TransactionError, TransactionErrorKind, TypeError,
};
pub use field::FieldInfo;
pub use model::{AutoIncrement, Model};
pub use relationship::{
    LazyLoadStrategy, LinkTableInfo, RelationshipInfo, RelationshipKind, find_back_relationship,
    find_relationship,
};
pub use row::{ColumnInfo, FromValue, Row};
pub use storage::{ColumnDef, Filter, ForeignKeyDef, Predicate, Storage, TableDef, Write, WriteKind};
pub use types::SqlType;
pub use value::Value;
