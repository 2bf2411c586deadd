//! A failed flush leaves the session retryable.

use entmap::fixture::{self, Measure, Risk};
use entmap::prelude::*;
use entmap::{PersistenceErrorKind, WriteKind};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn seeded(storage: MemoryStorage) -> (MemoryStorage, Arc<Schema>, fixture::SeededGraph) {
    init_tracing();
    let schema = fixture::bootstrap(&storage).await.unwrap();
    let mut session = Session::new(storage.connect(), Arc::clone(&schema));
    let ids = fixture::seed(&mut session).await.unwrap();
    (storage, schema, ids)
}

#[tokio::test]
async fn rolled_back_insert_restores_ids_and_retries() {
    let (storage, schema, ids) = seeded(MemoryStorage::new()).await;
    let mut session = Session::new(storage.connect(), schema);

    let measure = session.persist(Measure::default()).unwrap();
    let risk = session
        .persist(Risk::new("Second", Some(ids.project)))
        .unwrap();
    measure.write().unwrap().risks.link(Arc::clone(&risk));
    let before = session.pending_count();
    assert_eq!(before.new, 2);
    assert_eq!(before.links, 1);

    storage.fail_next("risk", WriteKind::Insert);
    let err = session.flush().await.unwrap_err();
    assert!(err.is_retryable());
    let failure = err.as_persistence().unwrap();
    assert_eq!(failure.kind, PersistenceErrorKind::Insert);
    assert_eq!(failure.table, "risk");
    assert!(failure.rolled_back);

    assert_eq!(measure.read().unwrap().id, None);
    assert_eq!(risk.read().unwrap().id, None);
    assert_eq!(session.pending_count(), before);
    assert!(!storage.in_transaction());
    assert_eq!(storage.row_count("measure").await.unwrap(), 1);

    let result = session.flush().await.unwrap();
    assert_eq!(result.inserted, 2);
    assert_eq!(result.linked, 1);
    assert_eq!(storage.row_count("measure_risks").await.unwrap(), 2);
    assert_eq!(session.state_of(&risk), ObjectState::Persistent);
}

#[tokio::test]
async fn rolled_back_update_keeps_the_change_pending() {
    let (storage, schema, ids) = seeded(MemoryStorage::new()).await;
    let mut session = Session::new(storage.connect(), Arc::clone(&schema));

    let risk = session.get::<Risk>(ids.risk).await.unwrap();
    session.mark_dirty(&risk, "name", "Updated").unwrap();

    storage.fail_next("risk", WriteKind::Update);
    let err = session.flush().await.unwrap_err();
    assert_eq!(err.as_persistence().unwrap().kind, PersistenceErrorKind::Update);
    assert!(session.pending_changes(&risk).unwrap().contains("name"));
    assert_eq!(risk.read().unwrap().name, "Updated");

    session.flush().await.unwrap();
    let mut fresh = Session::new(storage.connect(), schema);
    let reread = fresh.get::<Risk>(ids.risk).await.unwrap();
    assert_eq!(reread.read().unwrap().name, "Updated");
}

#[tokio::test]
async fn failed_link_rolls_back_the_inserted_owner() {
    let (storage, schema, ids) = seeded(MemoryStorage::new()).await;
    let mut session = Session::new(storage.connect(), schema);

    let risk = session.get::<Risk>(ids.risk).await.unwrap();
    let measure = session.persist(Measure::default()).unwrap();
    measure.write().unwrap().risks.link(Arc::clone(&risk));

    storage.fail_next("measure_risks", WriteKind::Insert);
    let err = session.flush().await.unwrap_err();
    let failure = err.as_persistence().unwrap();
    assert_eq!(failure.kind, PersistenceErrorKind::Link);
    assert!(failure.rolled_back);
    assert_eq!(storage.row_count("measure").await.unwrap(), 1);
    assert!(measure.read().unwrap().risks.has_pending());

    let result = session.flush().await.unwrap();
    assert_eq!(result.linked, 1);
    assert!(!measure.read().unwrap().risks.has_pending());
}

#[tokio::test]
async fn partial_flush_keeps_written_rows() {
    let (storage, schema, ids) = seeded(MemoryStorage::new().non_transactional()).await;
    let mut session = Session::new(storage.connect(), schema);

    let measure = session.persist(Measure::default()).unwrap();
    let risk = session
        .persist(Risk::new("Second", Some(ids.project)))
        .unwrap();

    storage.fail_next("risk", WriteKind::Insert);
    let err = session.flush().await.unwrap_err();
    let failure = err.as_persistence().unwrap();
    assert!(!failure.rolled_back);

    // The measure reached storage before the failure.
    assert_eq!(storage.row_count("measure").await.unwrap(), 2);
    assert!(measure.read().unwrap().id.is_some());
    assert_eq!(session.state_of(&measure), ObjectState::Persistent);
    assert_eq!(risk.read().unwrap().id, None);
    assert_eq!(session.pending_count().new, 1);

    let result = session.flush().await.unwrap();
    assert_eq!(result.inserted, 1);
    assert_eq!(storage.row_count("risk").await.unwrap(), 2);
    assert_eq!(session.pending_count().total(), 0);
}

#[tokio::test]
async fn after_rollback_fires_only_for_transactional_failures() {
    let (storage, schema, ids) = seeded(MemoryStorage::new()).await;
    let mut session = Session::new(storage.connect(), schema);
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fired);
    session.on_after_rollback(move || {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    let risk = session.get::<Risk>(ids.risk).await.unwrap();
    session.mark_dirty(&risk, "name", "Updated").unwrap();
    storage.fail_next("risk", WriteKind::Update);
    assert!(session.flush().await.is_err());
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    session.flush().await.unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn explicit_primary_key_is_inserted() {
    let (storage, schema, ids) = seeded(MemoryStorage::new()).await;
    let mut session = Session::new(storage.connect(), Arc::clone(&schema));

    let risk = session
        .persist(Risk {
            id: Some(42),
            ..Risk::new("Keyed", Some(ids.project))
        })
        .unwrap();
    assert_eq!(session.state_of(&risk), ObjectState::New);
    assert_eq!(session.pending_count().new, 1);

    let result = session.flush().await.unwrap();
    assert_eq!(result.inserted, 1);
    assert_eq!(result.updated, 0);
    assert_eq!(storage.row_count("risk").await.unwrap(), 2);
    assert_eq!(session.state_of(&risk), ObjectState::Persistent);
    assert!(Arc::ptr_eq(&session.get::<Risk>(42_i64).await.unwrap(), &risk));

    let mut fresh = Session::new(storage.connect(), schema);
    let reread = fresh.get::<Risk>(42_i64).await.unwrap();
    assert_eq!(reread.read().unwrap().name, "Keyed");
}

#[tokio::test]
async fn rollback_keeps_explicit_primary_keys() {
    let (storage, schema, ids) = seeded(MemoryStorage::new()).await;
    let mut session = Session::new(storage.connect(), schema);

    let measure = session.persist(Measure::default()).unwrap();
    let risk = session
        .persist(Risk {
            id: Some(42),
            ..Risk::new("Keyed", Some(ids.project))
        })
        .unwrap();

    storage.fail_next("risk", WriteKind::Insert);
    let err = session.flush().await.unwrap_err();
    assert!(err.as_persistence().unwrap().rolled_back);
    assert_eq!(measure.read().unwrap().id, None);
    assert_eq!(risk.read().unwrap().id, Some(42));
    assert_eq!(session.pending_count().new, 2);

    let result = session.flush().await.unwrap();
    assert_eq!(result.inserted, 2);
    assert_eq!(risk.read().unwrap().id, Some(42));
    assert_eq!(storage.row_count("risk").await.unwrap(), 2);
}

#[tokio::test]
async fn update_of_a_vanished_row_stays_pending() {
    let (storage, schema, ids) = seeded(MemoryStorage::new()).await;
    let mut session = Session::new(storage.connect(), schema);

    let risk = session
        .persist(Risk::new("Lonely", Some(ids.project)))
        .unwrap();
    session.flush().await.unwrap();
    let id = risk.read().unwrap().id.unwrap();

    // Removed behind the session's back.
    assert_eq!(storage.delete("risk", &Filter::eq("id", id)).await.unwrap(), 1);

    session.mark_dirty(&risk, "name", "Renamed").unwrap();
    let err = session.flush().await.unwrap_err();
    let failure = err.as_persistence().unwrap();
    assert_eq!(failure.kind, PersistenceErrorKind::Update);
    assert_eq!(failure.table, "risk");
    assert!(failure.is_stale());
    assert!(failure.rolled_back);

    assert!(session.pending_changes(&risk).unwrap().contains("name"));
    assert_eq!(session.state_of(&risk), ObjectState::Persistent);
    assert_eq!(session.pending_count().dirty, 1);
}

#[tokio::test]
async fn delete_of_a_vanished_row_stays_pending() {
    let (storage, schema, ids) = seeded(MemoryStorage::new()).await;
    let mut session = Session::new(storage.connect(), schema);

    let risk = session
        .persist(Risk::new("Lonely", Some(ids.project)))
        .unwrap();
    session.flush().await.unwrap();
    let id = risk.read().unwrap().id.unwrap();
    storage.delete("risk", &Filter::eq("id", id)).await.unwrap();

    session.remove(&risk).unwrap();
    let err = session.flush().await.unwrap_err();
    let failure = err.as_persistence().unwrap();
    assert_eq!(failure.kind, PersistenceErrorKind::Delete);
    assert!(failure.is_stale());
    assert_eq!(session.state_of(&risk), ObjectState::Deleted);
    assert_eq!(session.pending_count().deleted, 1);
}
