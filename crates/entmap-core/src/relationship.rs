//! Relationship metadata.
//!
//! Relationships are declared as static metadata on each `Model`. The schema
//! registry validates them once, and the session's loader and flush planner
//! use them to build storage filters without runtime reflection.

use crate::Model;

/// The type of relationship between two models.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RelationshipKind {
    /// Many-to-one: many `Risk`s belong to one `Project`.
    #[default]
    ManyToOne,
    /// One-to-many: one `Risk` has many `Cause`s.
    OneToMany,
    /// Many-to-many: `Measure`s have many `Risk`s via a link table.
    ManyToMany,
}

/// When a collection is loaded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LazyLoadStrategy {
    /// Load only through an explicit `load` call (default).
    #[default]
    Select,
    /// Load together with the owner whenever the owner is materialized.
    Selectin,
}

/// Information about a link table for many-to-many relationships.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkTableInfo {
    /// The link table name (e.g., `"measure_risks"`).
    pub table_name: &'static str,

    /// Column in the link table pointing to the local model (e.g., `"measure_id"`).
    pub local_column: &'static str,

    /// Column in the link table pointing to the remote model (e.g., `"risk_id"`).
    pub remote_column: &'static str,
}

impl LinkTableInfo {
    #[must_use]
    pub const fn new(
        table_name: &'static str,
        local_column: &'static str,
        remote_column: &'static str,
    ) -> Self {
        Self {
            table_name,
            local_column,
            remote_column,
        }
    }

    /// The same link table seen from the other side.
    #[must_use]
    pub const fn reversed(&self) -> Self {
        Self::new(self.table_name, self.remote_column, self.local_column)
    }
}

/// Metadata about a relationship between models.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelationshipInfo {
    /// Name of the relationship field.
    pub name: &'static str,

    /// The related model's table name.
    pub related_table: &'static str,

    pub kind: RelationshipKind,

    /// Local foreign key column (ManyToOne), e.g. `"project_id"` on `Risk`.
    pub local_key: Option<&'static str>,

    /// Remote foreign key column (OneToMany), e.g. `"risk_id"` on `Cause`
    /// when accessed from `Risk`.
    pub remote_key: Option<&'static str>,

    /// Link table for ManyToMany relationships.
    pub link_table: Option<LinkTableInfo>,

    /// The field on the related model that points back.
    pub back_populates: Option<&'static str>,

    /// For ManyToMany: this side writes the link rows.
    pub owner: bool,

    pub lazy_strategy: LazyLoadStrategy,
}

impl RelationshipInfo {
    #[must_use]
    pub const fn new(
        name: &'static str,
        related_table: &'static str,
        kind: RelationshipKind,
    ) -> Self {
        Self {
            name,
            related_table,
            kind,
            local_key: None,
            remote_key: None,
            link_table: None,
            back_populates: None,
            owner: false,
            lazy_strategy: LazyLoadStrategy::Select,
        }
    }

    #[must_use]
    pub const fn local_key(mut self, key: &'static str) -> Self {
        self.local_key = Some(key);
        self
    }

    #[must_use]
    pub const fn remote_key(mut self, key: &'static str) -> Self {
        self.remote_key = Some(key);
        self
    }

    #[must_use]
    pub const fn link_table(mut self, info: LinkTableInfo) -> Self {
        self.link_table = Some(info);
        self
    }

    #[must_use]
    pub const fn back_populates(mut self, field: &'static str) -> Self {
        self.back_populates = Some(field);
        self
    }

    /// Mark this side as the one that writes link rows.
    #[must_use]
    pub const fn owner(mut self, value: bool) -> Self {
        self.owner = value;
        self
    }

    #[must_use]
    pub const fn lazy_strategy(mut self, strategy: LazyLoadStrategy) -> Self {
        self.lazy_strategy = strategy;
        self
    }

    /// Does this relationship hold a collection (one-to-many or many-to-many)?
    pub const fn is_collection(&self) -> bool {
        matches!(
            self.kind,
            RelationshipKind::OneToMany | RelationshipKind::ManyToMany
        )
    }

    /// Is the collection loaded together with its owner?
    pub fn is_eager(&self) -> bool {
        self.is_collection() && self.lazy_strategy == LazyLoadStrategy::Selectin
    }

    /// Does this side write the many-to-many link rows?
    pub const fn is_owning_side(&self) -> bool {
        matches!(self.kind, RelationshipKind::ManyToMany) && self.owner
    }
}

/// Find a relationship by field name in a model's RELATIONSHIPS.
pub fn find_relationship<M: Model>(field_name: &str) -> Option<&'static RelationshipInfo> {
    M::RELATIONSHIPS.iter().find(|r| r.name == field_name)
}

/// Find the back-relationship from a target model back to the source.
///
/// Given `Measure::risks` with `back_populates = "measures"`, this finds
/// `Risk::measures` in `target_relationships`.
pub fn find_back_relationship(
    source_rel: &RelationshipInfo,
    target_relationships: &'static [RelationshipInfo],
) -> Option<&'static RelationshipInfo> {
    let back_field = source_rel.back_populates?;
    target_relationships.iter().find(|r| r.name == back_field)
}
