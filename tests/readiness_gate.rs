//! Readiness gate over the in-memory history store

use chrono::Utc;
use schemagate::migration::{
    HistoryStore, MemoryHistoryStore, MigrationScript, Migrator, ScriptRepository, Target,
};
use schemagate::readiness::{NotReadyReason, Readiness, ReadinessGate};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn write_script(dir: &Path, version: i64, predecessor: Option<i64>) {
    ScriptRepository::new(dir)
        .write(&MigrationScript::new(
            version,
            "step",
            predecessor,
            "SELECT 1;".to_string(),
            None,
            Utc::now(),
        ))
        .expect("write script");
}

#[test]
fn test_empty_repository_is_ready() {
    let dir = tempfile::tempdir().expect("tempdir");
    let gate = ReadinessGate::new(dir.path().join("missing"), MemoryHistoryStore::new());
    assert_eq!(gate.check_ready(), Readiness::Ready);
}

#[test]
fn test_pending_then_ready_after_apply() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_script(dir.path(), 20240101000001, None);
    write_script(dir.path(), 20240101000002, Some(20240101000001));

    let store = Arc::new(MemoryHistoryStore::new());
    let gate = ReadinessGate::new(dir.path(), Arc::clone(&store));

    assert_eq!(
        gate.check_ready(),
        Readiness::NotReady(NotReadyReason::PendingMigrations(2))
    );

    Migrator::new(dir.path())
        .apply(store.as_ref(), &Target::Version(20240101000001))
        .expect("apply first");
    assert_eq!(
        gate.check_ready(),
        Readiness::NotReady(NotReadyReason::PendingMigrations(1))
    );

    Migrator::new(dir.path())
        .apply(store.as_ref(), &Target::Head)
        .expect("apply rest");
    assert!(gate.check_ready().is_ready());
}

#[test]
fn test_gate_never_writes() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_script(dir.path(), 20240101000001, None);
    let store = Arc::new(MemoryHistoryStore::new());
    let gate = ReadinessGate::new(dir.path(), Arc::clone(&store));

    for _ in 0..3 {
        assert!(!gate.check_ready().is_ready());
    }
    assert!(!store.is_initialized());
    assert!(store.lock_owner().is_none());
    assert!(store.history().expect("history").is_empty());
}

#[test]
fn test_unreachable_store_and_unknown_head() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_script(dir.path(), 20240101000001, None);

    let store = MemoryHistoryStore::new();
    store.set_unreachable(true);
    let gate = ReadinessGate::new(dir.path(), store);
    assert!(matches!(
        gate.check_ready(),
        Readiness::NotReady(NotReadyReason::HistoryStoreUnreachable(_))
    ));

    let gate = ReadinessGate::new(
        dir.path(),
        MemoryHistoryStore::with_head(Some(20300101000000)),
    );
    assert_eq!(
        gate.check_ready(),
        Readiness::NotReady(NotReadyReason::UnknownHead(20300101000000))
    );
}

#[test]
fn test_wait_until_ready_observes_concurrent_apply() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_script(dir.path(), 20240101000001, None);

    let store = Arc::new(MemoryHistoryStore::new());
    let gate = ReadinessGate::new(dir.path(), Arc::clone(&store));

    let applier = {
        let store = Arc::clone(&store);
        let dir = dir.path().to_path_buf();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            Migrator::new(dir).apply(store.as_ref(), &Target::Head)
        })
    };

    let readiness = gate.wait_until_ready(Duration::from_millis(20), Duration::from_secs(5));
    assert!(readiness.is_ready());
    applier
        .join()
        .expect("applier thread")
        .expect("apply succeeds");
}

#[test]
fn test_wait_until_ready_gives_up() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_script(dir.path(), 20240101000001, None);
    let gate = ReadinessGate::new(dir.path(), MemoryHistoryStore::new());

    let start = Instant::now();
    let readiness = gate.wait_until_ready(Duration::from_millis(20), Duration::from_millis(100));
    assert_eq!(
        readiness,
        Readiness::NotReady(NotReadyReason::PendingMigrations(1))
    );
    assert!(start.elapsed() >= Duration::from_millis(100));
    assert!(start.elapsed() < Duration::from_secs(2));
}
