//! Model trait for mapping structs to storage tables.

use crate::Result;
use crate::error::{Error, InvalidStateError};
use crate::field::FieldInfo;
use crate::relationship::RelationshipInfo;
use crate::row::Row;
use crate::value::Value;

/// Trait for types that can be mapped to storage tables.
///
/// Implementations describe their columns through `fields()` and their
/// relationships through `RELATIONSHIPS`, and convert themselves to and from
/// `Row`s. Only scalar columns take part in `to_row`; relationship
/// collections live outside the row and are never written by `from_row`.
///
/// # Example
///
/// ```ignore
/// impl Model for Risk {
///     const TABLE_NAME: &'static str = "risk";
///     const PRIMARY_KEY: &'static [&'static str] = &["id"];
///     const RELATIONSHIPS: &'static [RelationshipInfo] = &RISK_RELATIONSHIPS;
///
///     fn fields() -> &'static [FieldInfo] { &RISK_FIELDS }
///     // ...
/// }
/// ```
pub trait Model: Sized + Send + Sync + 'static {
    /// The name of the storage table.
    const TABLE_NAME: &'static str;

    /// The primary key column name(s).
    const PRIMARY_KEY: &'static [&'static str];

    /// Relationship metadata for this model.
    const RELATIONSHIPS: &'static [RelationshipInfo] = &[];

    /// Field metadata for all scalar columns.
    fn fields() -> &'static [FieldInfo];

    /// Convert this instance to a row of scalar values.
    fn to_row(&self) -> Vec<(&'static str, Value)>;

    /// Construct an instance from a stored row.
    ///
    /// Collections start out unloaded.
    #[allow(clippy::result_large_err)]
    fn from_row(row: &Row) -> Result<Self>;

    /// The value of the primary key field(s).
    fn primary_key_value(&self) -> Vec<Value>;

    /// Has this instance never been assigned a primary key?
    fn is_new(&self) -> bool;

    /// Write one scalar field by column name.
    ///
    /// The default rejects every field; models that support
    /// `Session::mark_dirty` override it.
    #[allow(clippy::result_large_err)]
    fn set_field(&mut self, field: &str, value: Value) -> Result<()> {
        let _ = value;
        Err(Error::InvalidState(InvalidStateError::unknown_field(
            Self::TABLE_NAME,
            field,
        )))
    }
}

/// Models whose primary key is assigned by storage on insert.
pub trait AutoIncrement: Model {
    /// Set the generated id after insert, or clear it again when the insert
    /// is rolled back.
    fn set_id(&mut self, id: Option<i64>);
}
