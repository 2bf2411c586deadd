//! Declarative entity registry.

use entmap_core::{
    Error, FieldInfo, LinkTableInfo, Model, RelationshipInfo, RelationshipKind, Result,
    SchemaError, SchemaErrorKind,
};
use std::any::TypeId;
use std::collections::{BTreeMap, HashMap};

/// Static description of one entity type.
#[derive(Debug, Clone)]
pub struct EntityDescriptor {
    pub table: &'static str,
    pub type_name: &'static str,
    pub type_id: TypeId,
    pub primary_key: &'static [&'static str],
    pub fields: &'static [FieldInfo],
    pub relationships: &'static [RelationshipInfo],
}

impl EntityDescriptor {
    /// Descriptor of model `M`.
    pub fn of<M: Model>() -> Self {
        Self {
            table: M::TABLE_NAME,
            type_name: std::any::type_name::<M>(),
            type_id: TypeId::of::<M>(),
            primary_key: M::PRIMARY_KEY,
            fields: M::fields(),
            relationships: M::RELATIONSHIPS,
        }
    }

    /// Field stored in `column`.
    pub fn field(&self, column: &str) -> Option<&'static FieldInfo> {
        self.fields.iter().find(|f| f.column_name == column)
    }

    /// Relationship called `name`.
    pub fn relationship(&self, name: &str) -> Option<&'static RelationshipInfo> {
        self.relationships.iter().find(|r| r.name == name)
    }

    /// Tables this entity references through foreign keys, excluding itself.
    pub fn dependencies(&self) -> Vec<&'static str> {
        let mut deps: Vec<&'static str> = self
            .fields
            .iter()
            .filter_map(FieldInfo::referenced_table)
            .filter(|t| *t != self.table)
            .collect();
        deps.sort_unstable();
        deps.dedup();
        deps
    }
}

/// A many-to-many link table together with the tables it joins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkTableDescriptor {
    /// Link table as seen from the owning side.
    pub info: LinkTableInfo,
    pub owner_table: &'static str,
    pub target_table: &'static str,
}

/// The validated set of entities a session works with.
///
/// Built once with [`SchemaBuilder`] and shared immutably, typically as
/// `Arc<Schema>`.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    entities: BTreeMap<&'static str, EntityDescriptor>,
    by_type: HashMap<TypeId, &'static str>,
    links: BTreeMap<&'static str, LinkTableDescriptor>,
}

impl Schema {
    /// Start building a schema.
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::new()
    }

    /// Descriptor of `table`.
    pub fn entity(&self, table: &str) -> Option<&EntityDescriptor> {
        self.entities.get(table)
    }

    /// Descriptor for model type `M`, if registered.
    pub fn entity_of<M: Model>(&self) -> Option<&EntityDescriptor> {
        self.by_type
            .get(&TypeId::of::<M>())
            .and_then(|table| self.entities.get(table))
    }

    /// Is `table` registered?
    pub fn contains_table(&self, table: &str) -> bool {
        self.entities.contains_key(table)
    }

    /// Every registered entity.
    pub fn entities(&self) -> impl Iterator<Item = &EntityDescriptor> {
        self.entities.values()
    }

    /// Every link table.
    pub fn link_tables(&self) -> impl Iterator<Item = &LinkTableDescriptor> {
        self.links.values()
    }

    /// FK dependencies of `table` on other registered entities.
    pub fn dependencies(&self, table: &str) -> Vec<&'static str> {
        self.entity(table)
            .map(EntityDescriptor::dependencies)
            .unwrap_or_default()
    }

    /// Look up relationship `name` on `table`.
    #[allow(clippy::result_large_err)]
    pub fn relationship(&self, table: &str, name: &str) -> Result<&'static RelationshipInfo> {
        let entity = self.entity(table).ok_or_else(|| {
            schema_error(
                SchemaErrorKind::TableNotFound,
                format!("table '{}' is not registered", table),
            )
        })?;
        entity.relationship(name).ok_or_else(|| {
            schema_error(
                SchemaErrorKind::UnknownRelationship,
                format!("'{}' has no relationship named '{}'", table, name),
            )
        })
    }

    /// Entity tables ordered so every table follows the tables it references.
    pub fn tables_in_dependency_order(&self) -> Vec<&'static str> {
        let mut ordered: Vec<&'static str> = Vec::with_capacity(self.entities.len());
        let mut remaining: Vec<&'static str> = self.entities.keys().copied().collect();
        while !remaining.is_empty() {
            let before = remaining.len();
            remaining.retain(|table| {
                let ready = self
                    .dependencies(table)
                    .iter()
                    .all(|dep| ordered.contains(dep) || !self.contains_table(dep));
                if ready {
                    ordered.push(*table);
                }
                !ready
            });
            if remaining.len() == before {
                // FK cycle: emit the rest in name order.
                ordered.append(&mut remaining);
            }
        }
        ordered
    }
}

fn schema_error(kind: SchemaErrorKind, message: String) -> Error {
    Error::Schema(SchemaError { kind, message })
}

fn invalid(message: String) -> Error {
    schema_error(SchemaErrorKind::Invalid, message)
}

/// Collects entity types and validates their relationship declarations.
///
/// # Example
///
/// ```ignore
/// let schema = SchemaBuilder::new()
///     .entity::<Project>()
///     .entity::<Risk>()
///     .build()?;
/// ```
#[derive(Debug, Default)]
pub struct SchemaBuilder {
    entities: Vec<EntityDescriptor>,
}

impl SchemaBuilder {
    /// Empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register model type `M`.
    pub fn entity<M: Model>(mut self) -> Self {
        self.entities.push(EntityDescriptor::of::<M>());
        self
    }

    /// Validate every declaration and produce the schema.
    ///
    /// Checks that tables are unique, that every relationship targets a
    /// registered table with matching key columns, that `back_populates`
    /// pairs point at each other, and that each many-to-many pair agrees on
    /// its link table and has exactly one owning side.
    #[allow(clippy::result_large_err)]
    pub fn build(self) -> Result<Schema> {
        let mut schema = Schema::default();
        for entity in self.entities {
            if entity.primary_key.is_empty() {
                return Err(invalid(format!("'{}' declares no primary key", entity.table)));
            }
            if schema.entities.contains_key(entity.table) {
                return Err(schema_error(
                    SchemaErrorKind::TableExists,
                    format!("table '{}' registered twice", entity.table),
                ));
            }
            schema.by_type.insert(entity.type_id, entity.table);
            schema.entities.insert(entity.table, entity);
        }

        for entity in schema.entities.values() {
            for rel in entity.relationships {
                validate_relationship(&schema, entity, rel)?;
            }
        }

        let mut links = BTreeMap::new();
        for entity in schema.entities.values() {
            for rel in entity.relationships.iter().filter(|r| r.is_owning_side()) {
                if let Some(info) = rel.link_table {
                    let descriptor = LinkTableDescriptor {
                        info,
                        owner_table: entity.table,
                        target_table: rel.related_table,
                    };
                    if let Some(existing) = links.insert(info.table_name, descriptor) {
                        if existing != descriptor {
                            return Err(invalid(format!(
                                "link table '{}' is owned by more than one relationship",
                                info.table_name
                            )));
                        }
                    }
                }
            }
        }
        schema.links = links;

        tracing::debug!(
            entities = schema.entities.len(),
            link_tables = schema.links.len(),
            "Schema built"
        );
        Ok(schema)
    }
}

#[allow(clippy::result_large_err)]
fn validate_relationship(
    schema: &Schema,
    entity: &EntityDescriptor,
    rel: &RelationshipInfo,
) -> Result<()> {
    let here = format!("{}.{}", entity.table, rel.name);
    let target = schema.entity(rel.related_table).ok_or_else(|| {
        invalid(format!(
            "{} targets unregistered table '{}'",
            here, rel.related_table
        ))
    })?;

    match rel.kind {
        RelationshipKind::ManyToOne => {
            let key = rel
                .local_key
                .ok_or_else(|| invalid(format!("{} needs a local key", here)))?;
            let field = entity
                .field(key)
                .ok_or_else(|| invalid(format!("{} local key '{}' is not a field", here, key)))?;
            if field.referenced_table() != Some(target.table) {
                return Err(invalid(format!(
                    "{} local key '{}' must reference '{}'",
                    here, key, target.table
                )));
            }
        }
        RelationshipKind::OneToMany => {
            let key = rel
                .remote_key
                .ok_or_else(|| invalid(format!("{} needs a remote key", here)))?;
            let field = target.field(key).ok_or_else(|| {
                invalid(format!(
                    "{} remote key '{}' is not a field of '{}'",
                    here, key, target.table
                ))
            })?;
            if field.referenced_table() != Some(entity.table) {
                return Err(invalid(format!(
                    "{} remote key '{}.{}' must reference '{}'",
                    here, target.table, key, entity.table
                )));
            }
        }
        RelationshipKind::ManyToMany => {
            let link = rel
                .link_table
                .ok_or_else(|| invalid(format!("{} needs a link table", here)))?;
            match rel.back_populates.and_then(|name| target.relationship(name)) {
                Some(back) => {
                    if back.link_table != Some(link.reversed()) {
                        return Err(invalid(format!(
                            "{} and {}.{} disagree on link table '{}'",
                            here, target.table, back.name, link.table_name
                        )));
                    }
                    if back.owner == rel.owner {
                        return Err(invalid(format!(
                            "exactly one of {} and {}.{} must own the link rows",
                            here, target.table, back.name
                        )));
                    }
                }
                None if !rel.owner => {
                    return Err(invalid(format!(
                        "{} is an inverse side without a back relationship",
                        here
                    )));
                }
                None => {}
            }
        }
    }

    if let Some(back_name) = rel.back_populates {
        let back = target.relationship(back_name).ok_or_else(|| {
            invalid(format!(
                "{} has back_populates='{}' but {}.{} does not exist",
                here, back_name, target.table, back_name
            ))
        })?;
        if back.back_populates != Some(rel.name) || back.related_table != entity.table {
            return Err(invalid(format!(
                "{} has back_populates='{}' but {}.{} does not point back",
                here, back_name, target.table, back_name
            )));
        }
    }
    Ok(())
}
