//! Field metadata.

use crate::types::SqlType;

/// Static description of one model field and the column it maps to.
///
/// Built with `const` builder methods so models can declare their fields in
/// a `static` slice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldInfo {
    /// Rust field name
    pub name: &'static str,
    /// Storage column name
    pub column_name: &'static str,
    pub sql_type: SqlType,
    pub nullable: bool,
    pub primary_key: bool,
    /// Storage assigns the value on insert
    pub auto_increment: bool,
    /// Foreign key reference as `"table.column"`
    pub foreign_key: Option<&'static str>,
}

impl FieldInfo {
    /// Describe a column.
    pub const fn new(name: &'static str, column_name: &'static str, sql_type: SqlType) -> Self {
        Self {
            name,
            column_name,
            sql_type,
            nullable: false,
            primary_key: false,
            auto_increment: false,
            foreign_key: None,
        }
    }

    /// Set whether the column accepts NULL.
    pub const fn nullable(mut self, value: bool) -> Self {
        self.nullable = value;
        self
    }

    /// Set whether the column is part of the primary key.
    pub const fn primary_key(mut self, value: bool) -> Self {
        self.primary_key = value;
        self
    }

    /// Set whether storage assigns the column's value.
    pub const fn auto_increment(mut self, value: bool) -> Self {
        self.auto_increment = value;
        self
    }

    /// Reference another table's column, e.g. `"risk.id"`.
    pub const fn foreign_key(mut self, reference: &'static str) -> Self {
        self.foreign_key = Some(reference);
        self
    }

    /// Split the foreign key reference into `(table, column)`.
    pub fn referenced(&self) -> Option<(&'static str, &'static str)> {
        self.foreign_key
            .and_then(|reference| reference.split_once('.'))
    }

    /// The table this field's foreign key points at.
    pub fn referenced_table(&self) -> Option<&'static str> {
        self.referenced().map(|(table, _)| table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn foreign_key_reference_splits() {
        let field = FieldInfo::new("risk_id", "risk_id", SqlType::BigInt).foreign_key("risk.id");
        assert_eq!(field.referenced(), Some(("risk", "id")));
        assert_eq!(field.referenced_table(), Some("risk"));
        assert!(!field.nullable);
    }

    #[test]
    fn builder_sets_flags() {
        const ID: FieldInfo = FieldInfo::new("id", "id", SqlType::BigInt)
            .primary_key(true)
            .auto_increment(true)
            .nullable(true);
        assert!(ID.primary_key && ID.auto_increment && ID.nullable);
        assert_eq!(ID.referenced(), None);
    }
}
