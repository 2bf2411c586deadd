//! Column type definitions.

use crate::value::Value;

/// Column types a table definition can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlType {
    Integer,
    BigInt,
    Double,
    Boolean,
    Text,
    Blob,
    Json,
}

impl SqlType {
    /// The SQL type name for this type.
    pub const fn sql_name(&self) -> &'static str {
        match self {
            SqlType::Integer => "INTEGER",
            SqlType::BigInt => "BIGINT",
            SqlType::Double => "DOUBLE PRECISION",
            SqlType::Boolean => "BOOLEAN",
            SqlType::Text => "TEXT",
            SqlType::Blob => "BLOB",
            SqlType::Json => "JSON",
        }
    }

    /// Integer or floating-point type?
    pub const fn is_numeric(&self) -> bool {
        matches!(self, SqlType::Integer | SqlType::BigInt | SqlType::Double)
    }

    /// Can a column of this type hold `value`?
    ///
    /// NULL is accepted by every type; nullability is checked separately.
    /// Integer columns accept either integer width.
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null) => true,
            (SqlType::Integer | SqlType::BigInt, Value::Int(_) | Value::BigInt(_)) => true,
            (SqlType::Double, Value::Double(_) | Value::Int(_) | Value::BigInt(_)) => true,
            (SqlType::Boolean, Value::Bool(_)) => true,
            (SqlType::Text, Value::Text(_)) => true,
            (SqlType::Blob, Value::Bytes(_)) => true,
            (SqlType::Json, Value::Json(_) | Value::Text(_)) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_columns_accept_both_widths() {
        assert!(SqlType::BigInt.accepts(&Value::Int(1)));
        assert!(SqlType::Integer.accepts(&Value::BigInt(1)));
        assert!(!SqlType::BigInt.accepts(&Value::Text("1".into())));
    }

    #[test]
    fn null_is_accepted_everywhere() {
        for ty in [SqlType::Text, SqlType::BigInt, SqlType::Boolean, SqlType::Json] {
            assert!(ty.accepts(&Value::Null), "{}", ty.sql_name());
        }
    }
}
