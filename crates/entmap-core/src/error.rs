//! Error types for entmap operations.

use crate::value::Value;
use std::fmt;

/// The primary error type for all entmap operations.
#[derive(Debug)]
pub enum Error {
    /// Operation not valid for the object's current lifecycle state
    InvalidState(InvalidStateError),
    /// Primary key lookup found no matching row
    NotFound(NotFoundError),
    /// A storage write failed during flush
    Persistence(PersistenceError),
    /// Internal invariant violated (loading touched state it does not own)
    Consistency(ConsistencyError),
    /// Storage read or constraint errors
    Query(QueryError),
    /// Type conversion errors
    Type(TypeError),
    /// Transaction errors
    Transaction(TransactionError),
    /// Schema declaration errors
    Schema(SchemaError),
    /// Serialization/deserialization errors
    Serde(String),
    /// Custom error with message
    Custom(String),
}

#[derive(Debug, Clone)]
pub struct InvalidStateError {
    pub table: &'static str,
    pub message: String,
}

impl InvalidStateError {
    /// Error for an instance of `table`.
    pub fn new(table: &'static str, message: impl Into<String>) -> Self {
        Self {
            table,
            message: message.into(),
        }
    }

    /// The field does not exist on the model or is not writable.
    pub fn unknown_field(table: &'static str, field: &str) -> Self {
        Self::new(table, format!("'{field}' is not a writable field of '{table}'"))
    }
}

#[derive(Debug, Clone)]
pub struct NotFoundError {
    pub table: &'static str,
    pub pk: Vec<Value>,
}

#[derive(Debug)]
pub struct PersistenceError {
    pub kind: PersistenceErrorKind,
    pub table: String,
    pub message: String,
    /// Whether the backend rolled the whole flush back.
    pub rolled_back: bool,
    pub source: Option<Box<Error>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistenceErrorKind {
    /// INSERT of a new row failed
    Insert,
    /// UPDATE of dirty columns failed
    Update,
    /// DELETE of a removed row failed
    Delete,
    /// Writing a many-to-many link row failed
    Link,
    /// Removing a many-to-many link row failed
    Unlink,
    /// Opening or committing the flush transaction failed
    Commit,
}

impl PersistenceErrorKind {
    /// Lowercase name used in messages.
    pub const fn as_str(&self) -> &'static str {
        match self {
            PersistenceErrorKind::Insert => "insert",
            PersistenceErrorKind::Update => "update",
            PersistenceErrorKind::Delete => "delete",
            PersistenceErrorKind::Link => "link",
            PersistenceErrorKind::Unlink => "unlink",
            PersistenceErrorKind::Commit => "commit",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConsistencyError {
    pub table: &'static str,
    pub message: String,
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub table: Option<String>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Constraint violation (not null, unique, foreign key)
    Constraint,
    /// Table or column not found
    NotFound,
    /// Value does not match the declared column type
    TypeMismatch,
    /// Other storage error
    Storage,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
    pub rust_type: Option<&'static str>,
}

#[derive(Debug)]
pub struct TransactionError {
    pub kind: TransactionErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionErrorKind {
    /// BEGIN while a transaction is already open
    AlreadyActive,
    /// COMMIT/ROLLBACK without an open transaction
    NotActive,
    /// Backend has no transaction support
    Unsupported,
}

#[derive(Debug)]
pub struct SchemaError {
    pub kind: SchemaErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaErrorKind {
    /// Table already exists
    TableExists,
    /// Table not found
    TableNotFound,
    /// Relationship name not declared on the model
    UnknownRelationship,
    /// Relationship exists but cannot be used for this operation
    UnsupportedRelationship,
    /// Invalid schema definition
    Invalid,
}

impl Error {
    /// Can the failed operation be retried as-is?
    ///
    /// A failed flush keeps every unwritten change tracked, so calling
    /// `flush()` again resumes where it stopped.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Persistence(_))
    }

    /// Was a row missing?
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// Was the operation invalid for the instance's state?
    pub fn is_invalid_state(&self) -> bool {
        matches!(self, Error::InvalidState(_))
    }

    /// Did a load change an instance it should not touch?
    pub fn is_consistency(&self) -> bool {
        matches!(self, Error::Consistency(_))
    }

    /// The persistence details, if this is a flush failure.
    pub fn as_persistence(&self) -> Option<&PersistenceError> {
        match self {
            Error::Persistence(p) => Some(p),
            _ => None,
        }
    }

    /// Build a constraint violation raised by a storage backend.
    pub fn constraint(table: &str, message: impl Into<String>) -> Self {
        Error::Query(QueryError {
            kind: QueryErrorKind::Constraint,
            table: Some(table.to_string()),
            message: message.into(),
            source: None,
        })
    }

    /// Build an error for a table the backend does not know.
    pub fn table_not_found(table: &str) -> Self {
        Error::Schema(SchemaError {
            kind: SchemaErrorKind::TableNotFound,
            message: format!("table '{table}' does not exist"),
        })
    }
}

impl PersistenceError {
    /// Wrap a storage error raised while applying a flush write.
    pub fn wrap(kind: PersistenceErrorKind, table: &str, source: Error) -> Self {
        Self {
            kind,
            table: table.to_string(),
            message: source.to_string(),
            rolled_back: false,
            source: Some(Box::new(source)),
        }
    }

    /// The write matched no row: another scope changed or removed it.
    pub fn is_stale(&self) -> bool {
        matches!(self.source.as_deref(), Some(Error::NotFound(_)))
    }
}

impl QueryError {
    /// Is this a constraint violation?
    pub fn is_constraint_violation(&self) -> bool {
        self.kind == QueryErrorKind::Constraint
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidState(e) => write!(f, "Invalid state: {}", e),
            Error::NotFound(e) => write!(f, "Not found: {}", e),
            Error::Persistence(e) => write!(f, "Persistence error: {}", e),
            Error::Consistency(e) => write!(f, "Consistency error: {}", e),
            Error::Query(e) => write!(f, "Query error: {}", e),
            Error::Type(e) => {
                if let Some(col) = &e.column {
                    write!(
                        f,
                        "Type error in column '{}': expected {}, found {}",
                        col, e.expected, e.actual
                    )
                } else {
                    write!(f, "Type error: expected {}, found {}", e.expected, e.actual)
                }
            }
            Error::Transaction(e) => write!(f, "Transaction error: {}", e.message),
            Error::Schema(e) => write!(f, "Schema error: {}", e.message),
            Error::Serde(msg) => write!(f, "Serialization error: {}", msg),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Persistence(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Query(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for InvalidStateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for NotFoundError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pk: Vec<String> = self.pk.iter().map(ToString::to_string).collect();
        write!(f, "no '{}' row with primary key ({})", self.table, pk.join(", "))
    }
}

impl fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} on '{}' failed: {}",
            self.kind.as_str(),
            self.table,
            self.message
        )?;
        if self.rolled_back {
            write!(f, " (rolled back)")?;
        }
        Ok(())
    }
}

impl fmt::Display for ConsistencyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.table, self.message)
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(table) = &self.table {
            write!(f, "{} (table '{}')", self.message, table)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(col) = &self.column {
            write!(
                f,
                "expected {} for column '{}', found {}",
                self.expected, col, self.actual
            )
        } else {
            write!(f, "expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl fmt::Display for TransactionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for SchemaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<InvalidStateError> for Error {
    fn from(err: InvalidStateError) -> Self {
        Error::InvalidState(err)
    }
}

impl From<NotFoundError> for Error {
    fn from(err: NotFoundError) -> Self {
        Error::NotFound(err)
    }
}

impl From<PersistenceError> for Error {
    fn from(err: PersistenceError) -> Self {
        Error::Persistence(err)
    }
}

impl From<ConsistencyError> for Error {
    fn from(err: ConsistencyError) -> Self {
        Error::Consistency(err)
    }
}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<TransactionError> for Error {
    fn from(err: TransactionError) -> Self {
        Error::Transaction(err)
    }
}

impl From<SchemaError> for Error {
    fn from(err: SchemaError) -> Self {
        Error::Schema(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serde(err.to_string())
    }
}

/// Result type alias for entmap operations.
pub type Result<T> = std::result::Result<T, Error>;
