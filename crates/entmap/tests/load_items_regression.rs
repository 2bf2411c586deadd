//! Loading a collection must not overwrite unflushed changes on its owner.

use entmap::fixture::{self, Cause, Measure, Risk, SeededGraph};
use entmap::prelude::*;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn seeded() -> (MemoryStorage, Arc<Schema>, SeededGraph) {
    init_tracing();
    let storage = MemoryStorage::new();
    let schema = fixture::bootstrap(&storage).await.unwrap();
    let mut session = Session::new(storage.connect(), Arc::clone(&schema));
    let ids = fixture::seed(&mut session).await.unwrap();
    (storage, schema, ids)
}

#[tokio::test]
async fn load_items_keeps_unflushed_name() {
    let (storage, schema, ids) = seeded().await;
    let mut session = Session::new(storage.connect(), Arc::clone(&schema));

    let risk = session.get::<Risk>(ids.risk).await.unwrap();
    assert_eq!(risk.read().unwrap().name, "TestRisk");

    session.mark_dirty(&risk, "name", "Updated").unwrap();
    assert_eq!(risk.read().unwrap().name, "Updated");

    let causes = session.load::<Risk, Cause>(&risk, "causes").await.unwrap();
    assert_eq!(causes.len(), 1);
    assert_eq!(causes[0].read().unwrap().id, Some(ids.cause));
    assert_eq!(risk.read().unwrap().name, "Updated");

    let result = session.flush().await.unwrap();
    assert_eq!(result.updated, 1);
    assert_eq!(risk.read().unwrap().name, "Updated");

    let mut fresh = Session::new(storage.connect(), schema);
    let reread = fresh.get::<Risk>(ids.risk).await.unwrap();
    assert_eq!(reread.read().unwrap().name, "Updated");
}

#[tokio::test]
async fn direct_assignment_survives_load_and_flush() {
    let (storage, schema, ids) = seeded().await;
    let mut session = Session::new(storage.connect(), Arc::clone(&schema));

    let risk = session.get::<Risk>(ids.risk).await.unwrap();
    risk.write().unwrap().name = "Updated".to_string();

    session.load::<Risk, Cause>(&risk, "causes").await.unwrap();
    assert_eq!(risk.read().unwrap().name, "Updated");
    assert!(session.pending_changes(&risk).unwrap().contains("name"));

    session.flush().await.unwrap();

    let mut fresh = Session::new(storage.connect(), schema);
    let reread = fresh.get::<Risk>(ids.risk).await.unwrap();
    assert_eq!(reread.read().unwrap().name, "Updated");
}

#[tokio::test]
async fn eager_cycle_reuses_the_managed_risk() {
    let (storage, schema, ids) = seeded().await;
    let mut session = Session::new(storage.connect(), schema);

    let risk = session.get::<Risk>(ids.risk).await.unwrap();

    // Risk.measures and Measure.risks were loaded eagerly on materialize.
    let measure = {
        let guard = risk.read().unwrap();
        assert_eq!(guard.measures.state(), CollectionState::Loaded);
        let measures = guard.measures.items().unwrap();
        assert_eq!(measures.len(), 1);
        Arc::clone(&measures[0])
    };
    let back = {
        let guard = measure.read().unwrap();
        assert_eq!(guard.id, Some(ids.measure));
        Arc::clone(&guard.risks.items().unwrap()[0])
    };
    assert!(Arc::ptr_eq(&risk, &back));

    session.mark_dirty(&risk, "name", "Updated").unwrap();
    let risks = session.load::<Measure, Risk>(&measure, "risks").await.unwrap();
    assert!(Arc::ptr_eq(&risks[0], &risk));
    assert_eq!(risk.read().unwrap().name, "Updated");
    assert!(session.is_modified(&risk));
}
