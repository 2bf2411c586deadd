//! Declarative schema registry for entmap.
//!
//! This crate provides:
//! - `SchemaBuilder` / `Schema`: the validated, immutable set of entity types
//! - `EntityDescriptor`: per-table field and relationship metadata
//! - Table definitions for entities and many-to-many link tables
//! - `create_all` to bootstrap a storage backend from a schema

pub mod create;
pub mod registry;

pub use create::{create_all, link_table_def, table_def_for, table_defs};
pub use registry::{EntityDescriptor, LinkTableDescriptor, Schema, SchemaBuilder};

#[cfg(test)]
mod tests {
    use super::*;
    use entmap_core::{
        Error, FieldInfo, Filter, LinkTableInfo, Model, RelationshipInfo, RelationshipKind,
        Result, Row, SchemaErrorKind, SqlType, Storage, Value,
    };
    use entmap_memory::MemoryStorage;

    macro_rules! test_model {
        ($ty:ident, $table:literal, $fields:expr, $rels:expr) => {
            struct $ty;

            impl Model for $ty {
                const TABLE_NAME: &'static str = $table;
                const PRIMARY_KEY: &'static [&'static str] = &["id"];
                const RELATIONSHIPS: &'static [RelationshipInfo] = $rels;

                fn fields() -> &'static [FieldInfo] {
                    const FIELDS: &[FieldInfo] = $fields;
                    FIELDS
                }

                fn to_row(&self) -> Vec<(&'static str, Value)> {
                    Vec::new()
                }

                fn from_row(_row: &Row) -> Result<Self> {
                    Ok($ty)
                }

                fn primary_key_value(&self) -> Vec<Value> {
                    vec![Value::Null]
                }

                fn is_new(&self) -> bool {
                    true
                }
            }
        };
    }

    const ID: FieldInfo = FieldInfo::new("id", "id", SqlType::BigInt)
        .primary_key(true)
        .auto_increment(true)
        .nullable(true);
    const MEASURE_RISKS: LinkTableInfo = LinkTableInfo::new("measure_risks", "measure_id", "risk_id");

    test_model!(
        Project,
        "project",
        &[ID],
        &[
            RelationshipInfo::new("risks", "risk", RelationshipKind::OneToMany)
                .remote_key("project_id")
                .back_populates("project")
        ]
    );

    test_model!(
        Risk,
        "risk",
        &[
            ID,
            FieldInfo::new("project_id", "project_id", SqlType::BigInt).foreign_key("project.id"),
        ],
        &[
            RelationshipInfo::new("project", "project", RelationshipKind::ManyToOne)
                .local_key("project_id")
                .back_populates("risks"),
            RelationshipInfo::new("measures", "measure", RelationshipKind::ManyToMany)
                .link_table(MEASURE_RISKS.reversed())
                .back_populates("risks"),
        ]
    );

    test_model!(
        Measure,
        "measure",
        &[ID],
        &[
            RelationshipInfo::new("risks", "risk", RelationshipKind::ManyToMany)
                .link_table(MEASURE_RISKS)
                .back_populates("measures")
                .owner(true)
        ]
    );

    // Both sides claim the link rows.
    test_model!(
        GreedyMeasure,
        "measure",
        &[ID],
        &[
            RelationshipInfo::new("risks", "risk", RelationshipKind::ManyToMany)
                .link_table(MEASURE_RISKS.reversed())
                .back_populates("measures")
                .owner(true)
        ]
    );

    // Points back at a relationship that does not exist.
    test_model!(
        OrphanProject,
        "project",
        &[ID],
        &[
            RelationshipInfo::new("risks", "risk", RelationshipKind::OneToMany)
                .remote_key("project_id")
                .back_populates("owner")
        ]
    );

    fn schema() -> Schema {
        SchemaBuilder::new()
            .entity::<Measure>()
            .entity::<Risk>()
            .entity::<Project>()
            .build()
            .unwrap()
    }

    fn expect_invalid(result: Result<Schema>) -> String {
        match result {
            Err(Error::Schema(e)) => {
                assert!(matches!(
                    e.kind,
                    SchemaErrorKind::Invalid | SchemaErrorKind::TableExists
                ));
                e.message
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("schema should have been rejected"),
        }
    }

    #[test]
    fn test_schema_lookup() {
        let schema = schema();
        assert!(schema.contains_table("risk"));
        assert_eq!(schema.entity_of::<Risk>().unwrap().table, "risk");
        assert_eq!(schema.dependencies("risk"), vec!["project"]);
        assert!(schema.dependencies("project").is_empty());

        let rel = schema.relationship("measure", "risks").unwrap();
        assert!(rel.is_owning_side());
        assert!(matches!(
            schema.relationship("measure", "nope"),
            Err(Error::Schema(ref e)) if e.kind == SchemaErrorKind::UnknownRelationship
        ));
    }

    #[test]
    fn test_dependency_order_puts_parents_first() {
        let order = schema().tables_in_dependency_order();
        let pos = |t| order.iter().position(|x| *x == t).unwrap();
        assert!(pos("project") < pos("risk"));
        assert_eq!(order.len(), 3);
    }

    #[test]
    fn test_link_tables_come_from_owning_side() {
        let schema = schema();
        let links: Vec<_> = schema.link_tables().collect();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].owner_table, "measure");
        assert_eq!(links[0].target_table, "risk");

        let def = link_table_def(&schema, links[0]);
        assert_eq!(def.primary_key, vec!["measure_id", "risk_id"]);
        assert_eq!(def.foreign_keys[0].ref_table, "measure");
        assert_eq!(def.foreign_keys[1].ref_table, "risk");
        assert!(def.auto_increment.is_none());
    }

    #[test]
    fn test_entity_table_def() {
        let schema = schema();
        let def = table_def_for(schema.entity("risk").unwrap());
        assert_eq!(def.auto_increment, Some("id"));
        assert_eq!(def.foreign_keys.len(), 1);
        assert_eq!(def.foreign_keys[0].ref_table, "project");
        assert!(!def.column("project_id").unwrap().nullable);
    }

    #[test]
    fn test_rejects_duplicate_tables() {
        let msg = expect_invalid(
            SchemaBuilder::new()
                .entity::<Project>()
                .entity::<OrphanProject>()
                .build(),
        );
        assert!(msg.contains("twice"));
    }

    #[test]
    fn test_rejects_unregistered_target() {
        let msg = expect_invalid(SchemaBuilder::new().entity::<Project>().build());
        assert!(msg.contains("unregistered"));
    }

    #[test]
    fn test_rejects_two_owners() {
        let msg = expect_invalid(
            SchemaBuilder::new()
                .entity::<GreedyMeasure>()
                .entity::<Risk>()
                .entity::<Project>()
                .build(),
        );
        assert!(msg.contains("link"));
    }

    #[test]
    fn test_rejects_asymmetric_back_populates() {
        let msg = expect_invalid(
            SchemaBuilder::new()
                .entity::<OrphanProject>()
                .entity::<Risk>()
                .entity::<Measure>()
                .build(),
        );
        assert!(msg.contains("back_populates"));
    }

    #[tokio::test]
    async fn test_create_all_bootstraps_storage() {
        let schema = schema();
        let storage = MemoryStorage::new();
        create_all(&storage, &schema).await.unwrap();

        let project = storage.insert("project", &[]).await.unwrap();
        let risk = storage
            .insert("risk", &[("project_id", project.clone())])
            .await
            .unwrap();
        let measure = storage.insert("measure", &[]).await.unwrap();
        storage
            .insert(
                "measure_risks",
                &[("measure_id", measure.clone()), ("risk_id", risk.clone())],
            )
            .await
            .unwrap();

        assert!(
            storage
                .insert("measure_risks", &[("measure_id", measure), ("risk_id", risk)])
                .await
                .is_err(),
            "a pair can be linked only once"
        );
        let rows = storage
            .query("measure_risks", &Filter::all())
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);

        assert!(create_all(&storage, &schema).await.is_err());
    }
}
