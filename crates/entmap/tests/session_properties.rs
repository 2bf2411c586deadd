//! Identity, isolation and flush properties of a session over the fixture
//! graph.

use entmap::fixture::{self, Cause, Measure, MeasureFilter, MeasureFilterValue, Project, Risk};
use entmap::prelude::*;
use entmap::{SchemaErrorKind, table_defs};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

struct Fixture {
    storage: MemoryStorage,
    schema: Arc<Schema>,
    ids: fixture::SeededGraph,
}

impl Fixture {
    async fn new() -> Self {
        init_tracing();
        let storage = MemoryStorage::new();
        let schema = fixture::bootstrap(&storage).await.unwrap();
        let mut session = Session::new(storage.connect(), Arc::clone(&schema));
        let ids = fixture::seed(&mut session).await.unwrap();
        Self {
            storage,
            schema,
            ids,
        }
    }

    fn session(&self) -> Session<MemoryStorage> {
        Session::new(self.storage.connect(), Arc::clone(&self.schema))
    }

    fn session_with(&self, config: SessionConfig) -> Session<MemoryStorage> {
        Session::with_config(self.storage.connect(), Arc::clone(&self.schema), config)
    }
}

#[tokio::test]
async fn seed_writes_the_whole_graph() {
    let fx = Fixture::new().await;
    for (table, rows) in [
        ("project", 1),
        ("measure_filter", 1),
        ("risk", 1),
        ("cause", 1),
        ("measure", 1),
        ("measure_filter_value", 1),
        ("measure_risks", 1),
        ("cause_measures", 1),
        ("measure_measure_filter_values", 1),
    ] {
        assert_eq!(fx.storage.row_count(table).await.unwrap(), rows, "{table}");
    }
}

#[tokio::test]
async fn get_twice_returns_the_same_instance() {
    let fx = Fixture::new().await;
    let mut session = fx.session();

    let first = session.get::<Risk>(fx.ids.risk).await.unwrap();
    session.load::<Risk, Cause>(&first, "causes").await.unwrap();
    let second = session.get::<Risk>(fx.ids.risk).await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));

    session.mark_dirty(&first, "name", "Seen through both").unwrap();
    assert_eq!(second.read().unwrap().name, "Seen through both");
}

#[tokio::test]
async fn loading_a_reachable_collection_leaves_owner_changes_alone() {
    let fx = Fixture::new().await;
    let mut session = fx.session();

    let risk = session.get::<Risk>(fx.ids.risk).await.unwrap();
    session.mark_dirty(&risk, "name", "Updated").unwrap();

    let causes = session.load::<Risk, Cause>(&risk, "causes").await.unwrap();
    let measures = session
        .load::<Cause, Measure>(&causes[0], "measures")
        .await
        .unwrap();
    session
        .load::<Measure, Risk>(&measures[0], "risks")
        .await
        .unwrap();
    session
        .load::<Measure, MeasureFilterValue>(&measures[0], "measure_filter_values")
        .await
        .unwrap();

    assert_eq!(risk.read().unwrap().name, "Updated");
    assert_eq!(
        session.pending_changes(&risk).unwrap().into_iter().collect::<Vec<_>>(),
        vec!["name"]
    );
    assert!(!session.is_modified(&causes[0]));
    assert!(!session.is_modified(&measures[0]));
}

#[tokio::test]
async fn changes_on_one_instance_never_touch_another() {
    let fx = Fixture::new().await;
    let mut session = fx.session();

    let risk = session.get::<Risk>(fx.ids.risk).await.unwrap();
    let causes = session.load::<Risk, Cause>(&risk, "causes").await.unwrap();
    let cause = &causes[0];

    session.mark_dirty(&risk, "name", "Updated").unwrap();
    session.mark_dirty(cause, "risk_id", Some(fx.ids.risk)).unwrap();
    session.expunge(cause);

    assert!(session.pending_changes(&risk).unwrap().contains("name"));
    assert_eq!(session.state_of(cause), ObjectState::Detached);
}

#[tokio::test]
async fn loading_twice_yields_the_same_instances() {
    let fx = Fixture::new().await;
    let mut session = fx.session();

    let project = session.get::<Project>(fx.ids.project).await.unwrap();
    let first = session
        .load::<Project, MeasureFilter>(&project, "measure_filters")
        .await
        .unwrap();
    let second = session
        .load::<Project, MeasureFilter>(&project, "measure_filters")
        .await
        .unwrap();

    assert_eq!(first.len(), 1);
    assert_eq!(first.len(), second.len());
    assert!(first.iter().zip(&second).all(|(a, b)| Arc::ptr_eq(a, b)));

    let values = session
        .load::<MeasureFilter, MeasureFilterValue>(&first[0], "values")
        .await
        .unwrap();
    assert_eq!(values[0].read().unwrap().id, Some(fx.ids.measure_filter_value));
}

#[tokio::test]
async fn unloaded_collections_are_not_empty() {
    let fx = Fixture::new().await;
    let mut session = fx.session();

    let risk = session.get::<Risk>(fx.ids.risk).await.unwrap();
    let guard = risk.read().unwrap();
    assert_eq!(guard.causes.state(), CollectionState::Unloaded);
    assert!(guard.causes.items().is_none());
}

#[tokio::test]
async fn flushed_changes_are_visible_in_a_new_scope() {
    let fx = Fixture::new().await;
    let mut session = fx.session();

    let risk = session.get::<Risk>(fx.ids.risk).await.unwrap();
    session.mark_dirty(&risk, "name", "Renamed").unwrap();

    let project = session.persist(Project::default()).unwrap();
    session.flush().await.unwrap();
    let new_project = project.read().unwrap().id.unwrap();
    session
        .mark_dirty(&risk, "project_id", Some(new_project))
        .unwrap();
    let result = session.flush().await.unwrap();
    assert_eq!(result.updated, 1);
    assert_eq!(session.pending_count().total(), 0);

    let mut fresh = fx.session();
    let reread = fresh.get::<Risk>(fx.ids.risk).await.unwrap();
    let guard = reread.read().unwrap();
    assert_eq!(guard.name, "Renamed");
    assert_eq!(guard.project_id, Some(new_project));
}

#[tokio::test]
async fn owning_side_links_are_written_and_unlinks_removed() {
    let fx = Fixture::new().await;
    let mut session = fx.session();

    let risk = session.get::<Risk>(fx.ids.risk).await.unwrap();
    let second = session.persist(Measure::default()).unwrap();
    second.write().unwrap().risks.link(Arc::clone(&risk));
    assert_eq!(session.pending_count().links, 1);

    let result = session.flush().await.unwrap();
    assert_eq!(result.inserted, 1);
    assert_eq!(result.linked, 1);
    assert_eq!(fx.storage.row_count("measure_risks").await.unwrap(), 2);

    second.write().unwrap().risks.unlink(&risk);
    let result = session.flush().await.unwrap();
    assert_eq!(result.unlinked, 1);
    assert_eq!(fx.storage.row_count("measure_risks").await.unwrap(), 1);
}

#[tokio::test]
async fn inverse_side_links_are_dropped() {
    let fx = Fixture::new().await;
    let mut session = fx.session();

    let risk = session.get::<Risk>(fx.ids.risk).await.unwrap();
    let measure = session.persist(Measure::default()).unwrap();
    session.flush().await.unwrap();

    risk.write().unwrap().measures.link(Arc::clone(&measure));
    let result = session.flush().await.unwrap();
    assert_eq!(result.linked, 0);
    assert!(!risk.read().unwrap().measures.has_pending());
    assert_eq!(fx.storage.row_count("measure_risks").await.unwrap(), 1);
}

#[tokio::test]
async fn deleting_an_owner_purges_its_link_rows() {
    let fx = Fixture::new().await;
    let mut session = fx.session();

    let measure = session.get::<Measure>(fx.ids.measure).await.unwrap();
    session.remove(&measure).unwrap();
    let result = session.flush().await.unwrap();
    assert_eq!(result.deleted, 1);

    assert_eq!(fx.storage.row_count("measure").await.unwrap(), 0);
    assert_eq!(fx.storage.row_count("measure_risks").await.unwrap(), 0);
    assert_eq!(fx.storage.row_count("cause_measures").await.unwrap(), 0);
    assert_eq!(
        fx.storage
            .row_count("measure_measure_filter_values")
            .await
            .unwrap(),
        0
    );
}

#[tokio::test]
async fn without_eager_loading_collections_stay_unloaded() {
    let fx = Fixture::new().await;
    let mut session = fx.session_with(SessionConfig {
        eager_loading: false,
        ..SessionConfig::default()
    });

    let risk = session.get::<Risk>(fx.ids.risk).await.unwrap();
    assert_eq!(risk.read().unwrap().measures.state(), CollectionState::Unloaded);

    let measures = session.load::<Risk, Measure>(&risk, "measures").await.unwrap();
    assert_eq!(measures.len(), 1);
    assert_eq!(
        measures[0].read().unwrap().risks.state(),
        CollectionState::Unloaded
    );
}

#[tokio::test]
async fn missing_tables_surface_as_schema_errors() {
    init_tracing();
    let storage = MemoryStorage::new();
    let schema = fixture::schema().unwrap();
    let mut session = Session::new(storage.connect(), schema);

    // Tables were never created.
    let err = session.get::<Risk>(1_i64).await.unwrap_err();
    assert!(matches!(err, Error::Schema(_)));
}

#[tokio::test]
async fn clear_data_resets_between_scenarios() {
    let fx = Fixture::new().await;
    fx.storage.clear_data().await;
    assert_eq!(fx.storage.row_count("risk").await.unwrap(), 0);

    let mut session = fx.session();
    let ids = fixture::seed(&mut session).await.unwrap();
    assert_eq!(ids.project, 1);
    assert_eq!(ids.risk, 1);
}

#[tokio::test]
async fn dropping_the_session_frees_eager_cycles() {
    let fx = Fixture::new().await;
    let (risk, measure) = {
        let mut session = fx.session();
        let risk = session.get::<Risk>(fx.ids.risk).await.unwrap();
        // risk.measures holds the measure, whose risks hold the risk again.
        let measure = Arc::clone(&risk.read().unwrap().measures.items().unwrap()[0]);
        assert_eq!(measure.read().unwrap().risks.state(), CollectionState::Loaded);
        (Arc::downgrade(&risk), Arc::downgrade(&measure))
    };
    assert!(risk.upgrade().is_none());
    assert!(measure.upgrade().is_none());
}

#[tokio::test]
async fn clear_frees_eager_cycles() {
    let fx = Fixture::new().await;
    let mut session = fx.session();

    let risk = session.get::<Risk>(fx.ids.risk).await.unwrap();
    let weak = Arc::downgrade(&risk);
    drop(risk);
    assert!(weak.upgrade().is_some());

    session.clear();
    assert!(weak.upgrade().is_none());
}

#[tokio::test]
async fn failed_load_leaves_owner_untouched() {
    init_tracing();
    let storage = MemoryStorage::new();
    let schema = fixture::schema().unwrap();
    for def in table_defs(&schema) {
        if def.name != "cause" && def.name != "cause_measures" {
            storage.create_table(&def).await.unwrap();
        }
    }

    let mut setup = Session::new(storage.connect(), Arc::clone(&schema));
    let project = setup.persist(Project::default()).unwrap();
    setup.flush().await.unwrap();
    let project_id = project.read().unwrap().id;
    let risk = setup.persist(Risk::new("TestRisk", project_id)).unwrap();
    setup.flush().await.unwrap();
    let risk_id = risk.read().unwrap().id.unwrap();

    let mut session = Session::new(storage.connect(), schema);
    let risk = session.get::<Risk>(risk_id).await.unwrap();
    session.mark_dirty(&risk, "name", "Updated").unwrap();

    let err = session
        .load::<Risk, Cause>(&risk, "causes")
        .await
        .unwrap_err();
    assert!(matches!(&err, Error::Schema(e) if e.kind == SchemaErrorKind::TableNotFound));

    assert_eq!(risk.read().unwrap().causes.state(), CollectionState::Unloaded);
    assert_eq!(risk.read().unwrap().name, "Updated");
    assert!(session.pending_changes(&risk).unwrap().contains("name"));

    let result = session.flush().await.unwrap();
    assert_eq!(result.updated, 1);
}
