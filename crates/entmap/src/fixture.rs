//! The risk-register entity graph.
//!
//! Six entities:
//!
//! ```text
//! Project ─┬─< MeasureFilter ─< MeasureFilterValue >─┐
//!          └─< Risk ─< Cause                          │
//!               │        │                            │
//!               └──>─< Measure >─< ───────────────────┘
//!                  (measure_risks, cause_measures,
//!                   measure_measure_filter_values)
//! ```
//!
//! `Risk.measures` and `Measure.risks` are eager, so materializing either
//! side walks the Risk → Measure → Risk cycle. Many-to-one relationships are
//! plain foreign key fields.

use entmap_core::{
    AutoIncrement, Error, FieldInfo, FromValue, InvalidStateError, LazyLoadStrategy,
    LinkTableInfo, Model, RelationshipInfo, RelationshipKind, Result, Row, SqlType, Storage,
    Value,
};
use entmap_schema::{Schema, create_all};
use entmap_session::{Collection, CollectionSlot, Entity, Session};
use std::sync::{Arc, PoisonError, RwLock, RwLockWriteGuard};

const MEASURE_RISKS: LinkTableInfo = LinkTableInfo::new("measure_risks", "measure_id", "risk_id");
const CAUSE_MEASURES: LinkTableInfo =
    LinkTableInfo::new("cause_measures", "cause_id", "measure_id");
const MEASURE_FILTER_VALUES: LinkTableInfo = LinkTableInfo::new(
    "measure_measure_filter_values",
    "measure_id",
    "measure_filter_value_id",
);

const fn id_field() -> FieldInfo {
    FieldInfo::new("id", "id", SqlType::BigInt)
        .primary_key(true)
        .auto_increment(true)
        .nullable(true)
}

const fn fk_field(column: &'static str, reference: &'static str) -> FieldInfo {
    FieldInfo::new(column, column, SqlType::BigInt).foreign_key(reference)
}

#[allow(clippy::result_large_err)]
fn assign_fk(table: &'static str, field: &str, slot: &mut Option<i64>, value: &Value) -> Result<()> {
    *slot = Option::<i64>::from_value(value).map_err(|_| {
        Error::InvalidState(InvalidStateError::new(
            table,
            format!("'{}' takes an integer id, got {}", field, value.type_name()),
        ))
    })?;
    Ok(())
}

fn unknown_field(table: &'static str, field: &str) -> Error {
    Error::InvalidState(InvalidStateError::unknown_field(table, field))
}

// ============================================================================
// Project
// ============================================================================

#[derive(Debug, Default)]
pub struct Project {
    pub id: Option<i64>,
    pub measure_filters: Collection<MeasureFilter>,
    pub risks: Collection<Risk>,
}

static PROJECT_FIELDS: [FieldInfo; 1] = [id_field()];

static PROJECT_RELATIONSHIPS: [RelationshipInfo; 2] = [
    RelationshipInfo::new("measure_filters", "measure_filter", RelationshipKind::OneToMany)
        .remote_key("project_id")
        .back_populates("project"),
    RelationshipInfo::new("risks", "risk", RelationshipKind::OneToMany)
        .remote_key("project_id")
        .back_populates("project"),
];

impl Model for Project {
    const TABLE_NAME: &'static str = "project";
    const PRIMARY_KEY: &'static [&'static str] = &["id"];
    const RELATIONSHIPS: &'static [RelationshipInfo] = &PROJECT_RELATIONSHIPS;

    fn fields() -> &'static [FieldInfo] {
        &PROJECT_FIELDS
    }

    fn to_row(&self) -> Vec<(&'static str, Value)> {
        vec![("id", self.id.into())]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.get_named("id")?,
            ..Self::default()
        })
    }

    fn primary_key_value(&self) -> Vec<Value> {
        vec![self.id.into()]
    }

    fn is_new(&self) -> bool {
        self.id.is_none()
    }
}

impl AutoIncrement for Project {
    fn set_id(&mut self, id: Option<i64>) {
        self.id = id;
    }
}

impl Entity for Project {
    fn collection(&self, name: &str) -> Option<&dyn CollectionSlot> {
        match name {
            "measure_filters" => Some(&self.measure_filters as &dyn CollectionSlot),
            "risks" => Some(&self.risks as &dyn CollectionSlot),
            _ => None,
        }
    }

    fn collection_mut(&mut self, name: &str) -> Option<&mut dyn CollectionSlot> {
        match name {
            "measure_filters" => Some(&mut self.measure_filters as &mut dyn CollectionSlot),
            "risks" => Some(&mut self.risks as &mut dyn CollectionSlot),
            _ => None,
        }
    }
}

// ============================================================================
// Risk
// ============================================================================

/// The entity whose `name` must survive relationship loads.
#[derive(Debug, Default)]
pub struct Risk {
    pub id: Option<i64>,
    pub name: String,
    pub project_id: Option<i64>,
    pub causes: Collection<Cause>,
    /// Inverse side of `Measure.risks`; eager.
    pub measures: Collection<Measure>,
}

impl Risk {
    /// Unsaved risk.
    pub fn new(name: impl Into<String>, project_id: Option<i64>) -> Self {
        Self {
            name: name.into(),
            project_id,
            ..Self::default()
        }
    }
}

static RISK_FIELDS: [FieldInfo; 3] = [
    id_field(),
    FieldInfo::new("name", "name", SqlType::Text),
    fk_field("project_id", "project.id"),
];

static RISK_RELATIONSHIPS: [RelationshipInfo; 3] = [
    RelationshipInfo::new("project", "project", RelationshipKind::ManyToOne)
        .local_key("project_id")
        .back_populates("risks"),
    RelationshipInfo::new("causes", "cause", RelationshipKind::OneToMany)
        .remote_key("risk_id")
        .back_populates("risk"),
    RelationshipInfo::new("measures", "measure", RelationshipKind::ManyToMany)
        .link_table(MEASURE_RISKS.reversed())
        .back_populates("risks")
        .lazy_strategy(LazyLoadStrategy::Selectin),
];

impl Model for Risk {
    const TABLE_NAME: &'static str = "risk";
    const PRIMARY_KEY: &'static [&'static str] = &["id"];
    const RELATIONSHIPS: &'static [RelationshipInfo] = &RISK_RELATIONSHIPS;

    fn fields() -> &'static [FieldInfo] {
        &RISK_FIELDS
    }

    fn to_row(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("id", self.id.into()),
            ("name", Value::Text(self.name.clone())),
            ("project_id", self.project_id.into()),
        ]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.get_named("id")?,
            name: row.get_named("name")?,
            project_id: row.get_named("project_id")?,
            ..Self::default()
        })
    }

    fn primary_key_value(&self) -> Vec<Value> {
        vec![self.id.into()]
    }

    fn is_new(&self) -> bool {
        self.id.is_none()
    }

    fn set_field(&mut self, field: &str, value: Value) -> Result<()> {
        match field {
            "name" => {
                self.name = String::from_value(&value)?;
                Ok(())
            }
            "project_id" => assign_fk(Self::TABLE_NAME, field, &mut self.project_id, &value),
            _ => Err(unknown_field(Self::TABLE_NAME, field)),
        }
    }
}

impl AutoIncrement for Risk {
    fn set_id(&mut self, id: Option<i64>) {
        self.id = id;
    }
}

impl Entity for Risk {
    fn collection(&self, name: &str) -> Option<&dyn CollectionSlot> {
        match name {
            "causes" => Some(&self.causes as &dyn CollectionSlot),
            "measures" => Some(&self.measures as &dyn CollectionSlot),
            _ => None,
        }
    }

    fn collection_mut(&mut self, name: &str) -> Option<&mut dyn CollectionSlot> {
        match name {
            "causes" => Some(&mut self.causes as &mut dyn CollectionSlot),
            "measures" => Some(&mut self.measures as &mut dyn CollectionSlot),
            _ => None,
        }
    }
}

// ============================================================================
// Cause
// ============================================================================

#[derive(Debug, Default)]
pub struct Cause {
    pub id: Option<i64>,
    pub risk_id: Option<i64>,
    /// Owning side of `cause_measures`.
    pub measures: Collection<Measure>,
}

impl Cause {
    /// Unsaved cause.
    pub fn new(risk_id: Option<i64>) -> Self {
        Self {
            risk_id,
            ..Self::default()
        }
    }
}

static CAUSE_FIELDS: [FieldInfo; 2] = [id_field(), fk_field("risk_id", "risk.id")];

static CAUSE_RELATIONSHIPS: [RelationshipInfo; 2] = [
    RelationshipInfo::new("risk", "risk", RelationshipKind::ManyToOne)
        .local_key("risk_id")
        .back_populates("causes"),
    RelationshipInfo::new("measures", "measure", RelationshipKind::ManyToMany)
        .link_table(CAUSE_MEASURES)
        .back_populates("causes")
        .owner(true),
];

impl Model for Cause {
    const TABLE_NAME: &'static str = "cause";
    const PRIMARY_KEY: &'static [&'static str] = &["id"];
    const RELATIONSHIPS: &'static [RelationshipInfo] = &CAUSE_RELATIONSHIPS;

    fn fields() -> &'static [FieldInfo] {
        &CAUSE_FIELDS
    }

    fn to_row(&self) -> Vec<(&'static str, Value)> {
        vec![("id", self.id.into()), ("risk_id", self.risk_id.into())]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.get_named("id")?,
            risk_id: row.get_named("risk_id")?,
            ..Self::default()
        })
    }

    fn primary_key_value(&self) -> Vec<Value> {
        vec![self.id.into()]
    }

    fn is_new(&self) -> bool {
        self.id.is_none()
    }

    fn set_field(&mut self, field: &str, value: Value) -> Result<()> {
        match field {
            "risk_id" => assign_fk(Self::TABLE_NAME, field, &mut self.risk_id, &value),
            _ => Err(unknown_field(Self::TABLE_NAME, field)),
        }
    }
}

impl AutoIncrement for Cause {
    fn set_id(&mut self, id: Option<i64>) {
        self.id = id;
    }
}

impl Entity for Cause {
    fn collection(&self, name: &str) -> Option<&dyn CollectionSlot> {
        (name == "measures").then_some(&self.measures as &dyn CollectionSlot)
    }

    fn collection_mut(&mut self, name: &str) -> Option<&mut dyn CollectionSlot> {
        (name == "measures").then_some(&mut self.measures as &mut dyn CollectionSlot)
    }
}

// ============================================================================
// Measure
// ============================================================================

#[derive(Debug, Default)]
pub struct Measure {
    pub id: Option<i64>,
    /// Owning side of `measure_risks`; eager.
    pub risks: Collection<Risk>,
    pub causes: Collection<Cause>,
    /// Owning side of `measure_measure_filter_values`.
    pub measure_filter_values: Collection<MeasureFilterValue>,
}

static MEASURE_FIELDS: [FieldInfo; 1] = [id_field()];

static MEASURE_RELATIONSHIPS: [RelationshipInfo; 3] = [
    RelationshipInfo::new("risks", "risk", RelationshipKind::ManyToMany)
        .link_table(MEASURE_RISKS)
        .back_populates("measures")
        .owner(true)
        .lazy_strategy(LazyLoadStrategy::Selectin),
    RelationshipInfo::new("causes", "cause", RelationshipKind::ManyToMany)
        .link_table(CAUSE_MEASURES.reversed())
        .back_populates("measures"),
    RelationshipInfo::new(
        "measure_filter_values",
        "measure_filter_value",
        RelationshipKind::ManyToMany,
    )
    .link_table(MEASURE_FILTER_VALUES)
    .back_populates("measures")
    .owner(true),
];

impl Model for Measure {
    const TABLE_NAME: &'static str = "measure";
    const PRIMARY_KEY: &'static [&'static str] = &["id"];
    const RELATIONSHIPS: &'static [RelationshipInfo] = &MEASURE_RELATIONSHIPS;

    fn fields() -> &'static [FieldInfo] {
        &MEASURE_FIELDS
    }

    fn to_row(&self) -> Vec<(&'static str, Value)> {
        vec![("id", self.id.into())]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.get_named("id")?,
            ..Self::default()
        })
    }

    fn primary_key_value(&self) -> Vec<Value> {
        vec![self.id.into()]
    }

    fn is_new(&self) -> bool {
        self.id.is_none()
    }
}

impl AutoIncrement for Measure {
    fn set_id(&mut self, id: Option<i64>) {
        self.id = id;
    }
}

impl Entity for Measure {
    fn collection(&self, name: &str) -> Option<&dyn CollectionSlot> {
        match name {
            "risks" => Some(&self.risks as &dyn CollectionSlot),
            "causes" => Some(&self.causes as &dyn CollectionSlot),
            "measure_filter_values" => Some(&self.measure_filter_values as &dyn CollectionSlot),
            _ => None,
        }
    }

    fn collection_mut(&mut self, name: &str) -> Option<&mut dyn CollectionSlot> {
        match name {
            "risks" => Some(&mut self.risks as &mut dyn CollectionSlot),
            "causes" => Some(&mut self.causes as &mut dyn CollectionSlot),
            "measure_filter_values" => {
                Some(&mut self.measure_filter_values as &mut dyn CollectionSlot)
            }
            _ => None,
        }
    }
}

// ============================================================================
// MeasureFilter
// ============================================================================

#[derive(Debug, Default)]
pub struct MeasureFilter {
    pub id: Option<i64>,
    pub project_id: Option<i64>,
    pub values: Collection<MeasureFilterValue>,
}

impl MeasureFilter {
    /// Unsaved filter.
    pub fn new(project_id: Option<i64>) -> Self {
        Self {
            project_id,
            ..Self::default()
        }
    }
}

static MEASURE_FILTER_FIELDS: [FieldInfo; 2] = [id_field(), fk_field("project_id", "project.id")];

static MEASURE_FILTER_RELATIONSHIPS: [RelationshipInfo; 2] = [
    RelationshipInfo::new("project", "project", RelationshipKind::ManyToOne)
        .local_key("project_id")
        .back_populates("measure_filters"),
    RelationshipInfo::new("values", "measure_filter_value", RelationshipKind::OneToMany)
        .remote_key("measure_filter_id")
        .back_populates("measure_filter"),
];

impl Model for MeasureFilter {
    const TABLE_NAME: &'static str = "measure_filter";
    const PRIMARY_KEY: &'static [&'static str] = &["id"];
    const RELATIONSHIPS: &'static [RelationshipInfo] = &MEASURE_FILTER_RELATIONSHIPS;

    fn fields() -> &'static [FieldInfo] {
        &MEASURE_FILTER_FIELDS
    }

    fn to_row(&self) -> Vec<(&'static str, Value)> {
        vec![("id", self.id.into()), ("project_id", self.project_id.into())]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.get_named("id")?,
            project_id: row.get_named("project_id")?,
            ..Self::default()
        })
    }

    fn primary_key_value(&self) -> Vec<Value> {
        vec![self.id.into()]
    }

    fn is_new(&self) -> bool {
        self.id.is_none()
    }

    fn set_field(&mut self, field: &str, value: Value) -> Result<()> {
        match field {
            "project_id" => assign_fk(Self::TABLE_NAME, field, &mut self.project_id, &value),
            _ => Err(unknown_field(Self::TABLE_NAME, field)),
        }
    }
}

impl AutoIncrement for MeasureFilter {
    fn set_id(&mut self, id: Option<i64>) {
        self.id = id;
    }
}

impl Entity for MeasureFilter {
    fn collection(&self, name: &str) -> Option<&dyn CollectionSlot> {
        (name == "values").then_some(&self.values as &dyn CollectionSlot)
    }

    fn collection_mut(&mut self, name: &str) -> Option<&mut dyn CollectionSlot> {
        (name == "values").then_some(&mut self.values as &mut dyn CollectionSlot)
    }
}

// ============================================================================
// MeasureFilterValue
// ============================================================================

#[derive(Debug, Default)]
pub struct MeasureFilterValue {
    pub id: Option<i64>,
    pub measure_filter_id: Option<i64>,
    pub measures: Collection<Measure>,
}

impl MeasureFilterValue {
    /// Unsaved filter value.
    pub fn new(measure_filter_id: Option<i64>) -> Self {
        Self {
            measure_filter_id,
            ..Self::default()
        }
    }
}

static MEASURE_FILTER_VALUE_FIELDS: [FieldInfo; 2] = [
    id_field(),
    fk_field("measure_filter_id", "measure_filter.id"),
];

static MEASURE_FILTER_VALUE_RELATIONSHIPS: [RelationshipInfo; 2] = [
    RelationshipInfo::new("measure_filter", "measure_filter", RelationshipKind::ManyToOne)
        .local_key("measure_filter_id")
        .back_populates("values"),
    RelationshipInfo::new("measures", "measure", RelationshipKind::ManyToMany)
        .link_table(MEASURE_FILTER_VALUES.reversed())
        .back_populates("measure_filter_values"),
];

impl Model for MeasureFilterValue {
    const TABLE_NAME: &'static str = "measure_filter_value";
    const PRIMARY_KEY: &'static [&'static str] = &["id"];
    const RELATIONSHIPS: &'static [RelationshipInfo] = &MEASURE_FILTER_VALUE_RELATIONSHIPS;

    fn fields() -> &'static [FieldInfo] {
        &MEASURE_FILTER_VALUE_FIELDS
    }

    fn to_row(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("id", self.id.into()),
            ("measure_filter_id", self.measure_filter_id.into()),
        ]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.get_named("id")?,
            measure_filter_id: row.get_named("measure_filter_id")?,
            ..Self::default()
        })
    }

    fn primary_key_value(&self) -> Vec<Value> {
        vec![self.id.into()]
    }

    fn is_new(&self) -> bool {
        self.id.is_none()
    }

    fn set_field(&mut self, field: &str, value: Value) -> Result<()> {
        match field {
            "measure_filter_id" => {
                assign_fk(Self::TABLE_NAME, field, &mut self.measure_filter_id, &value)
            }
            _ => Err(unknown_field(Self::TABLE_NAME, field)),
        }
    }
}

impl AutoIncrement for MeasureFilterValue {
    fn set_id(&mut self, id: Option<i64>) {
        self.id = id;
    }
}

impl Entity for MeasureFilterValue {
    fn collection(&self, name: &str) -> Option<&dyn CollectionSlot> {
        (name == "measures").then_some(&self.measures as &dyn CollectionSlot)
    }

    fn collection_mut(&mut self, name: &str) -> Option<&mut dyn CollectionSlot> {
        (name == "measures").then_some(&mut self.measures as &mut dyn CollectionSlot)
    }
}

// ============================================================================
// Schema and seed data
// ============================================================================

/// The validated schema of all six entities.
#[allow(clippy::result_large_err)]
pub fn schema() -> Result<Arc<Schema>> {
    let schema = Schema::builder()
        .entity::<Project>()
        .entity::<Risk>()
        .entity::<Cause>()
        .entity::<Measure>()
        .entity::<MeasureFilter>()
        .entity::<MeasureFilterValue>()
        .build()?;
    Ok(Arc::new(schema))
}

/// Create every table of the schema in `storage` and return the schema.
pub async fn bootstrap<S: Storage>(storage: &S) -> Result<Arc<Schema>> {
    let schema = schema()?;
    create_all(storage, &schema).await?;
    Ok(schema)
}

/// Primary keys of the seeded graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeededGraph {
    pub project: i64,
    pub measure_filter: i64,
    pub risk: i64,
    pub cause: i64,
    pub measure: i64,
    pub measure_filter_value: i64,
}

/// Write the standard graph through `session`, then clear it.
///
/// P1 owns F1 and R1 ("TestRisk"); C1 belongs to R1; M1 is linked to R1
/// and C1 and to a new filter value under F1. Each step is its own flush,
/// so later rows can name the ids of earlier ones.
#[tracing::instrument(level = "debug", skip_all)]
pub async fn seed<S: Storage>(session: &mut Session<S>) -> Result<SeededGraph> {
    let project = session.persist(Project::default())?;
    session.flush().await?;
    let project_id = persisted_id(&project)?;

    let measure_filter = session.persist(MeasureFilter::new(Some(project_id)))?;
    session.flush().await?;
    let measure_filter_id = persisted_id(&measure_filter)?;

    let risk = session.persist(Risk::new("TestRisk", Some(project_id)))?;
    session.flush().await?;
    let risk_id = persisted_id(&risk)?;

    let cause = session.persist(Cause::new(Some(risk_id)))?;
    session.flush().await?;
    let cause_id = persisted_id(&cause)?;

    let measure = session.persist(Measure::default())?;
    let value = session.persist(MeasureFilterValue::new(Some(measure_filter_id)))?;
    {
        let mut m = write(&measure);
        m.risks.link(Arc::clone(&risk));
        m.measure_filter_values.link(Arc::clone(&value));
    }
    write(&cause).measures.link(Arc::clone(&measure));
    let result = session.flush().await?;
    tracing::debug!(linked = result.linked, "Seeded measure links");

    let graph = SeededGraph {
        project: project_id,
        measure_filter: measure_filter_id,
        risk: risk_id,
        cause: cause_id,
        measure: persisted_id(&measure)?,
        measure_filter_value: persisted_id(&value)?,
    };
    session.clear();
    tracing::info!(?graph, "Seeded fixture graph");
    Ok(graph)
}

fn write<M>(model: &RwLock<M>) -> RwLockWriteGuard<'_, M> {
    model.write().unwrap_or_else(PoisonError::into_inner)
}

#[allow(clippy::result_large_err)]
fn persisted_id<M: Model>(model: &RwLock<M>) -> Result<i64> {
    let guard = model.read().unwrap_or_else(PoisonError::into_inner);
    guard
        .primary_key_value()
        .first()
        .and_then(Value::as_i64)
        .ok_or_else(|| {
            Error::InvalidState(InvalidStateError::new(
                M::TABLE_NAME,
                "flushed instance has no primary key",
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_validates() {
        let schema = schema().unwrap();
        assert_eq!(schema.entities().count(), 6);
        assert_eq!(schema.link_tables().count(), 3);
        assert_eq!(
            schema.tables_in_dependency_order().first().copied(),
            Some("measure")
        );
    }

    #[test]
    fn test_eager_cycle_is_declared() {
        let schema = schema().unwrap();
        assert!(schema.relationship("risk", "measures").unwrap().is_eager());
        assert!(schema.relationship("measure", "risks").unwrap().is_eager());
        assert!(!schema.relationship("risk", "causes").unwrap().is_eager());
    }

    #[test]
    fn test_owning_sides() {
        let schema = schema().unwrap();
        assert!(schema.relationship("measure", "risks").unwrap().is_owning_side());
        assert!(!schema.relationship("risk", "measures").unwrap().is_owning_side());
        assert!(schema.relationship("cause", "measures").unwrap().is_owning_side());
        assert!(!schema.relationship("measure", "causes").unwrap().is_owning_side());
    }

    #[test]
    fn test_risk_set_field() {
        let mut risk = Risk::new("TestRisk", Some(1));
        risk.set_field("name", Value::from("Updated")).unwrap();
        assert_eq!(risk.name, "Updated");
        risk.set_field("project_id", Value::BigInt(2)).unwrap();
        assert_eq!(risk.project_id, Some(2));
        assert!(risk.set_field("title", Value::Null).unwrap_err().is_invalid_state());
    }
}
