//! Data source behavior tests against the mock database.
//!
//! These tests cover key resolution, sub-pool creation, handle lifecycle,
//! exhaustion, password changes and maintenance.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use cpds_datasource::{
    DataSource, HandleState, MaxWait, PoolError, PoolKey, PoolRegistry, PoolSettings, SubPool,
    UserOverrides,
};
use cpds_driver::{DriverError, InMemoryNamingContext, IsolationLevel, NamingContext};
use cpds_testing::{MockConnectionSource, MockDatabase, init_tracing, wait_until};

fn data_source(db: &Arc<MockDatabase>, settings: PoolSettings) -> DataSource {
    init_tracing();
    DataSource::builder("ds")
        .connection_source(MockConnectionSource::new(db))
        .defaults(settings)
        .build()
        .unwrap()
}

// =============================================================================
// Key resolution and sub-pools
// =============================================================================

#[tokio::test]
async fn test_unconfigured_users_share_default_sub_pool() {
    let db = MockDatabase::new();
    let ds = data_source(&db, PoolSettings::new());

    let a = ds.get_connection_as("alice", "pw").await.unwrap();
    let b = ds.get_connection_as("bob", "pw").await.unwrap();
    let c = ds.get_connection().await.unwrap();

    assert_eq!(ds.metrics().sub_pools, 1);
    let default_pool = ds.sub_pool(&PoolKey::new("ds", None)).unwrap();
    assert_eq!(default_pool.pool().num_active(), 3);
    assert_eq!(ds.num_active_for(Some("alice")), 1);
    assert_eq!(ds.num_active_for(Some("bob")), 1);
    assert_eq!(ds.num_active_for(None), 1);

    // Connections are still kept apart per user.
    assert_eq!(db.connection(a.physical_id()).unwrap().username(), Some("alice"));
    assert_eq!(db.connection(b.physical_id()).unwrap().username(), Some("bob"));

    for conn in [a, b, c] {
        conn.close().await.unwrap();
    }
}

#[tokio::test]
async fn test_configured_user_gets_own_sub_pool() {
    let db = MockDatabase::new();
    let ds = data_source(&db, PoolSettings::new().max_total(8));
    ds.set_user_overrides("reporting", UserOverrides::new().max_total(2))
        .unwrap();

    let shared = ds.get_connection_as("alice", "pw").await.unwrap();
    let own = ds.get_connection_as("reporting", "pw").await.unwrap();

    assert_eq!(ds.metrics().sub_pools, 2);
    let reporting = ds.sub_pool(&PoolKey::new("ds", Some("reporting"))).unwrap();
    assert_eq!(reporting.settings().max_total, 2);
    assert_eq!(reporting.pool().num_active(), 1);
    assert_eq!(ds.status().max, 10);

    shared.close().await.unwrap();
    own.close().await.unwrap();
}

#[tokio::test]
async fn test_sub_pool_settings_frozen_at_creation() {
    let db = MockDatabase::new();
    let ds = data_source(&db, PoolSettings::new().max_total(3));
    ds.get_connection().await.unwrap().close().await.unwrap();

    ds.set_defaults(PoolSettings::new().max_total(5)).unwrap();
    let pool = ds.sub_pool(&PoolKey::new("ds", None)).unwrap();
    assert_eq!(pool.settings().max_total, 3);
    assert_eq!(ds.status_for(None).max, 3);

    // A sub-pool created later picks up the new defaults.
    ds.set_user_overrides("late", UserOverrides::new()).unwrap();
    ds.get_connection_as("late", "pw").await.unwrap().close().await.unwrap();
    assert_eq!(ds.status_for(Some("late")).max, 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_first_requests_create_one_sub_pool() {
    let db = MockDatabase::new();
    db.set_open_delay(Some(Duration::from_millis(20)));
    let ds = data_source(&db, PoolSettings::new().max_total(16));

    let tasks = (0..16).map(|_| {
        let ds = ds.clone();
        tokio::spawn(async move { ds.get_connection().await.unwrap() })
    });
    let conns: Vec<_> = futures_util::future::join_all(tasks)
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect();

    assert_eq!(ds.metrics().sub_pools, 1);
    assert_eq!(ds.num_active(), 16);
    for conn in conns {
        conn.close().await.unwrap();
    }
    assert_eq!(ds.num_idle(), 8);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_registry_creates_exactly_once_under_contention() {
    let db = MockDatabase::new();
    let registry = Arc::new(PoolRegistry::new());
    let created = Arc::new(AtomicUsize::new(0));
    let key = PoolKey::new("ds", Some("alice"));

    let mut tasks = Vec::new();
    for _ in 0..32 {
        let registry = Arc::clone(&registry);
        let created = Arc::clone(&created);
        let db = Arc::clone(&db);
        let key = key.clone();
        tasks.push(tokio::spawn(async move {
            registry
                .get_or_create(&key, || async {
                    created.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    SubPool::new(key.clone(), MockConnectionSource::new(&db), PoolSettings::new())
                })
                .await
                .unwrap()
        }));
    }

    let pools: Vec<_> = futures_util::future::join_all(tasks)
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect();
    assert_eq!(created.load(Ordering::SeqCst), 1);
    assert!(pools.iter().all(|p| Arc::ptr_eq(p, &pools[0])));
    assert_eq!(registry.len(), 1);
}

// =============================================================================
// Handle lifecycle
// =============================================================================

#[tokio::test]
async fn test_close_is_idempotent() {
    let db = MockDatabase::new();
    let ds = data_source(&db, PoolSettings::new());

    let a = ds.get_connection().await.unwrap();
    let b = ds.get_connection().await.unwrap();
    assert_eq!(ds.num_active(), 2);

    a.close().await.unwrap();
    a.close().await.unwrap();
    assert_eq!(ds.num_active(), 1);
    assert_eq!(ds.num_idle(), 1);
    assert_eq!(a.state(), HandleState::Returned);
    assert!(b.query("SELECT 1").await.is_ok());

    b.close().await.unwrap();
    assert_eq!(ds.num_active(), 0);
}

#[tokio::test]
async fn test_closed_handle_rejects_calls() {
    let db = MockDatabase::new();
    let ds = data_source(&db, PoolSettings::new());
    let conn = ds.get_connection().await.unwrap();
    conn.close().await.unwrap();

    assert!(conn.is_closed());
    assert!(matches!(conn.query("SELECT 1").await, Err(PoolError::ConnectionClosed)));
    assert!(matches!(conn.execute("DELETE FROM t").await, Err(PoolError::ConnectionClosed)));
    assert!(matches!(conn.commit().await, Err(PoolError::ConnectionClosed)));
    assert!(matches!(conn.auto_commit().await, Err(PoolError::ConnectionClosed)));
    assert_eq!(
        PoolError::ConnectionClosed.to_string(),
        "connection is closed"
    );
}

#[tokio::test]
async fn test_dropped_handle_returns_connection() {
    let db = MockDatabase::new();
    let ds = data_source(&db, PoolSettings::new());
    let conn = ds.get_connection().await.unwrap();
    let id = conn.physical_id();
    drop(conn);

    wait_until(|| ds.num_active() == 0).await;
    assert_eq!(ds.num_idle(), 1);
    let again = ds.get_connection().await.unwrap();
    assert_eq!(again.physical_id(), id);
    again.close().await.unwrap();
}

#[tokio::test]
async fn test_last_used_tracks_genuine_use_only() {
    let db = MockDatabase::new();
    let ds = data_source(&db, PoolSettings::new());
    let conn = ds.get_connection().await.unwrap();

    let issued = conn.last_used();
    tokio::time::sleep(Duration::from_millis(5)).await;
    conn.is_read_only().await.unwrap();
    conn.transaction_isolation().await.unwrap();
    let _ = conn.state();
    assert_eq!(conn.last_used(), issued);

    conn.query("SELECT 1").await.unwrap();
    assert!(conn.last_used() > issued);
    conn.close().await.unwrap();
}

#[tokio::test]
async fn test_handles_compare_by_physical_connection() {
    let db = MockDatabase::new();
    let ds = data_source(&db, PoolSettings::new());
    let a = ds.get_connection().await.unwrap();
    let b = ds.get_connection().await.unwrap();
    assert_ne!(a, b);
    assert_ne!(a.handle_id(), b.handle_id());
    a.close().await.unwrap();
    b.close().await.unwrap();
}

#[tokio::test]
async fn test_auto_commit_restored_on_close() {
    let db = MockDatabase::new();
    let ds = data_source(&db, PoolSettings::new());
    let conn = ds.get_connection().await.unwrap();
    let id = conn.physical_id();

    conn.set_auto_commit(false).await.unwrap();
    conn.execute("UPDATE t SET x = 1").await.unwrap();
    conn.close().await.unwrap();

    let state = db.connection(id).unwrap();
    assert!(state.auto_commit());
    assert_eq!(state.rollbacks(), 1);
    assert_eq!(ds.num_idle(), 1);
}

#[tokio::test]
async fn test_session_state_restored_on_close() {
    let db = MockDatabase::new();
    let ds = data_source(&db, PoolSettings::new());
    let conn = ds.get_connection().await.unwrap();
    let id = conn.physical_id();

    conn.set_read_only(true).await.unwrap();
    conn.set_transaction_isolation(IsolationLevel::Serializable)
        .await
        .unwrap();
    conn.close().await.unwrap();

    let state = db.connection(id).unwrap();
    assert!(!state.read_only());
    assert_eq!(state.isolation(), IsolationLevel::ReadCommitted);

    let next = ds.get_connection().await.unwrap();
    assert_eq!(next.physical_id(), id);
    assert!(!next.is_read_only().await.unwrap());
    assert_eq!(
        next.transaction_isolation().await.unwrap(),
        IsolationLevel::ReadCommitted
    );
    next.close().await.unwrap();
}

#[tokio::test]
async fn test_fatal_error_during_call_invalidates_handle() {
    let db = MockDatabase::new();
    let ds = data_source(&db, PoolSettings::new());
    let conn = ds.get_connection().await.unwrap();
    let id = conn.physical_id();

    db.break_connection(id);
    let err = conn.query("SELECT 1").await.unwrap_err();
    assert!(matches!(err, PoolError::Driver(DriverError::Broken(_))));
    assert_eq!(conn.state(), HandleState::Invalid);
    assert_eq!(ds.num_active(), 0);
    assert_eq!(ds.num_idle(), 0);
    assert!(db.connection(id).unwrap().is_closed());

    conn.close().await.unwrap();
    assert_eq!(ds.num_active(), 0);
}

#[tokio::test]
async fn test_fatal_error_event_reclaims_once() {
    let db = MockDatabase::new();
    let ds = data_source(&db, PoolSettings::new());
    let conn = ds.get_connection().await.unwrap();
    let other = ds.get_connection().await.unwrap();
    let id = conn.physical_id();

    db.fire_error(id);
    db.fire_error(id);
    wait_until(|| ds.num_active() == 1).await;

    assert_eq!(conn.state(), HandleState::Invalid);
    assert!(matches!(conn.query("SELECT 1").await, Err(PoolError::ConnectionClosed)));
    wait_until(|| db.connection(id).unwrap().is_closed()).await;
    assert_eq!(db.connection(id).unwrap().listener_count(), 0);

    conn.close().await.unwrap();
    assert_eq!(ds.num_active(), 1);
    other.close().await.unwrap();
    assert_eq!(ds.num_active(), 0);
}

#[tokio::test]
async fn test_test_on_return_discards_invalid_connection() {
    let db = MockDatabase::new();
    let ds = data_source(
        &db,
        PoolSettings::new()
            .test_on_return(true)
            .validation_query("SELECT 1"),
    );
    let conn = ds.get_connection().await.unwrap();

    db.set_empty_results(true);
    conn.close().await.unwrap();
    assert_eq!(conn.state(), HandleState::Invalid);
    assert_eq!(ds.num_idle(), 0);
    assert_eq!(db.open_connections(), 0);
}

// =============================================================================
// Exhaustion
// =============================================================================

#[tokio::test]
async fn test_exhaustion_scenario() {
    let db = MockDatabase::new();
    let ds = data_source(
        &db,
        PoolSettings::new().max_total(2).max_wait(MaxWait::FAIL_FAST),
    );

    let first = ds.get_connection().await.unwrap();
    let second = ds.get_connection().await.unwrap();
    assert_eq!((ds.num_active(), ds.num_idle()), (2, 0));

    let err = ds.get_connection().await.unwrap_err();
    assert!(err.is_exhausted());
    assert!(err.is_acquisition_failure());

    let reused = first.physical_id();
    first.close().await.unwrap();
    assert_eq!((ds.num_active(), ds.num_idle()), (1, 1));

    let third = ds.get_connection().await.unwrap();
    assert_eq!(third.physical_id(), reused);
    assert_eq!((ds.num_active(), ds.num_idle()), (2, 0));
    assert_eq!(db.opened(), 2);

    second.close().await.unwrap();
    third.close().await.unwrap();
}

#[tokio::test]
async fn test_bounded_wait_times_out() {
    let db = MockDatabase::new();
    let ds = data_source(
        &db,
        PoolSettings::new()
            .max_total(1)
            .max_wait(MaxWait::Bounded(Duration::from_millis(100))),
    );
    let held = ds.get_connection().await.unwrap();

    let started = Instant::now();
    let err = ds.get_connection().await.unwrap_err();
    let waited = started.elapsed();
    assert!(matches!(err, PoolError::PoolExhausted { .. }));
    assert!(waited >= Duration::from_millis(100));
    assert!(waited < Duration::from_secs(2));

    held.close().await.unwrap();
}

#[tokio::test]
async fn test_waiter_gets_returned_connection() {
    let db = MockDatabase::new();
    let ds = data_source(
        &db,
        PoolSettings::new()
            .max_total(1)
            .max_wait(MaxWait::Bounded(Duration::from_secs(5))),
    );
    let held = ds.get_connection().await.unwrap();
    let id = held.physical_id();

    let waiter = {
        let ds = ds.clone();
        tokio::spawn(async move { ds.get_connection().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    held.close().await.unwrap();

    let conn = waiter.await.unwrap().unwrap();
    assert_eq!(conn.physical_id(), id);
    conn.close().await.unwrap();
}

#[tokio::test]
async fn test_creation_failure_surfaces() {
    let db = MockDatabase::new();
    db.set_refuse_connections(true);
    let ds = data_source(&db, PoolSettings::new());

    let err = ds.get_connection().await.unwrap_err();
    assert!(matches!(
        err,
        PoolError::ConnectionCreation(DriverError::ConnectionRefused(_))
    ));
    assert_eq!(ds.num_active(), 0);

    db.set_refuse_connections(false);
    ds.get_connection().await.unwrap().close().await.unwrap();
}

// =============================================================================
// Passwords
// =============================================================================

#[tokio::test]
async fn test_password_change_invalidates_idle_connections() {
    let db = MockDatabase::new();
    db.add_user("alice", Some("old"));
    let ds = data_source(&db, PoolSettings::new());

    let conn = ds.get_connection_as("alice", "old").await.unwrap();
    let old_id = conn.physical_id();
    conn.close().await.unwrap();
    assert_eq!(ds.num_idle_for(Some("alice")), 1);

    db.set_password("alice", Some("new"));
    let fresh = ds.get_connection_as("alice", "new").await.unwrap();
    assert_ne!(fresh.physical_id(), old_id);
    assert!(db.connection(old_id).unwrap().is_closed());
    assert_eq!(ds.num_idle_for(Some("alice")), 0);

    let err = ds.get_connection_as("alice", "old").await.unwrap_err();
    assert!(matches!(err, PoolError::AuthenticationMismatch { .. }));
    assert!(err.is_acquisition_failure());
    // The connection borrowed for the comparison went back to the pool.
    assert_eq!(ds.num_active_for(Some("alice")), 1);
    assert_eq!(ds.num_idle_for(Some("alice")), 1);

    fresh.close().await.unwrap();
}

#[tokio::test]
async fn test_wrong_first_password_does_not_lock_out_user() {
    let db = MockDatabase::new();
    db.add_user("alice", Some("secret"));
    let ds = data_source(&db, PoolSettings::new());

    let err = ds.get_connection_as("alice", "wrong").await.unwrap_err();
    assert!(matches!(
        err,
        PoolError::ConnectionCreation(DriverError::AuthenticationFailed { .. })
    ));

    let conn = ds.get_connection_as("alice", "secret").await.unwrap();
    assert_eq!(ds.num_active_for(Some("alice")), 1);
    conn.close().await.unwrap();
}

// =============================================================================
// Maintenance and shutdown
// =============================================================================

#[tokio::test]
async fn test_maintenance_refills_min_idle() {
    let db = MockDatabase::new();
    let ds = data_source(&db, PoolSettings::new().min_idle(2));
    ds.get_connection().await.unwrap().close().await.unwrap();
    assert_eq!(ds.num_idle(), 1);

    assert_eq!(ds.run_maintenance().await, 0);
    assert_eq!(ds.num_idle(), 2);
}

#[tokio::test]
async fn test_maintenance_task_evicts_idle_connections() {
    let db = MockDatabase::new();
    let ds = data_source(
        &db,
        PoolSettings::new()
            .time_between_eviction_runs(Some(Duration::from_millis(20)))
            .min_evictable_idle_time(Duration::ZERO),
    );
    let a = ds.get_connection().await.unwrap();
    let b = ds.get_connection().await.unwrap();
    a.close().await.unwrap();
    b.close().await.unwrap();

    wait_until(|| ds.num_idle() == 0).await;
    assert_eq!(db.open_connections(), 0);
    assert!(ds.metrics().pools.evictions >= 2);
    ds.close().await;
}

#[tokio::test]
async fn test_close_destroys_idle_and_later_returns() {
    let db = MockDatabase::new();
    let ds = data_source(&db, PoolSettings::new());
    let idle = ds.get_connection().await.unwrap();
    let active = ds.get_connection().await.unwrap();
    idle.close().await.unwrap();

    ds.close().await;
    assert_eq!(db.open_connections(), 1);
    assert!(matches!(
        ds.get_connection().await.unwrap_err(),
        PoolError::Configuration(_)
    ));

    active.close().await.unwrap();
    assert_eq!(db.open_connections(), 0);
}

// =============================================================================
// Named connection sources
// =============================================================================

#[tokio::test]
async fn test_named_source_lookup() {
    let db = MockDatabase::new();
    let naming = Arc::new(InMemoryNamingContext::new());
    let ds = DataSource::builder("ds")
        .connection_source_name("jdbc/orders", naming.clone() as Arc<dyn NamingContext>)
        .build()
        .unwrap();

    let err = ds.get_connection().await.unwrap_err();
    assert!(matches!(err, PoolError::Naming(_)));
    assert!(err.is_acquisition_failure());
    assert!(ds.metrics().sub_pools == 0);

    naming.bind("jdbc/orders", MockConnectionSource::new(&db));
    let conn = ds.get_connection().await.unwrap();
    assert_eq!(db.opened(), 1);
    conn.close().await.unwrap();
}
