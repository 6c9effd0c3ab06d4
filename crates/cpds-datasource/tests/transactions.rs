//! Transaction-aware sharing tests.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::Arc;

use cpds_datasource::{DataSource, HandleState, PoolError, PoolSettings};
use cpds_driver::TransactionError;
use cpds_testing::{
    EnlistmentMode, MockConnectionSource, MockDatabase, MockTransactionManager, init_tracing,
    wait_until,
};

fn setup() -> (Arc<MockDatabase>, Arc<MockTransactionManager>, DataSource) {
    init_tracing();
    let db = MockDatabase::new();
    let tm = MockTransactionManager::new();
    let ds = DataSource::builder("ds")
        .connection_source(MockConnectionSource::new(&db))
        .transaction_manager(tm.clone())
        .defaults(PoolSettings::new().max_total(4))
        .build()
        .unwrap();
    (db, tm, ds)
}

// =============================================================================
// Sharing
// =============================================================================

#[tokio::test]
async fn test_connections_in_transaction_share_physical_connection() {
    let (db, tm, ds) = setup();
    let tx = tm.begin();

    let first = ds.get_connection().await.unwrap();
    let second = ds.get_connection().await.unwrap();
    assert_eq!(first.physical_id(), second.physical_id());
    assert_ne!(first.handle_id(), second.handle_id());
    assert_eq!(first.transaction(), Some(&tx));
    assert_eq!(ds.num_active(), 1);
    assert_eq!(tm.enlisted(&tx), 1);
    assert_eq!(db.opened(), 1);

    // Closing a shared handle is logical only.
    first.close().await.unwrap();
    assert!(first.is_closed());
    assert_eq!(ds.num_active(), 1);
    second.execute("INSERT INTO t VALUES (1)").await.unwrap();

    // Transaction control belongs to the manager.
    assert!(matches!(
        second.commit().await,
        Err(PoolError::EnlistedOperation(_))
    ));
    assert!(matches!(
        second.set_auto_commit(true).await,
        Err(PoolError::EnlistedOperation(_))
    ));

    let physical = db.connection(second.physical_id()).unwrap();
    assert!(!physical.auto_commit());

    tm.commit(&tx).await.unwrap();
    wait_until(|| ds.num_active() == 0).await;
    assert_eq!(physical.commits(), 1);
    assert!(physical.auto_commit());
    assert_eq!(ds.num_idle(), 1);
    assert_eq!(ds.metrics().active_transactions, 0);

    // Handles still open at completion behave as closed.
    assert!(second.is_closed());
    assert!(matches!(
        second.query("SELECT 1").await,
        Err(PoolError::ConnectionClosed)
    ));
}

#[tokio::test]
async fn test_shared_connection_checks_password() {
    let (db, tm, ds) = setup();
    db.add_user("alice", Some("secret"));
    let tx = tm.begin();

    let first = ds.get_connection_as("alice", "secret").await.unwrap();

    // Sharing the transaction's connection still requires the right password.
    let err = ds.get_connection_as("alice", "wrong").await.unwrap_err();
    assert!(matches!(err, PoolError::AuthenticationMismatch { .. }));
    assert!(err.is_acquisition_failure());
    assert_eq!(ds.num_active(), 1);
    first.query("SELECT 1").await.unwrap();

    let second = ds.get_connection_as("alice", "secret").await.unwrap();
    assert_eq!(first.physical_id(), second.physical_id());

    // A password changed on the server mid-transaction is accepted once verified.
    db.set_password("alice", Some("rotated"));
    let third = ds.get_connection_as("alice", "rotated").await.unwrap();
    assert_eq!(first.physical_id(), third.physical_id());
    assert!(matches!(
        ds.get_connection_as("alice", "secret").await,
        Err(PoolError::AuthenticationMismatch { .. })
    ));
    assert_eq!(tm.enlisted(&tx), 1);

    tm.commit(&tx).await.unwrap();
    wait_until(|| ds.num_active() == 0).await;
}

#[tokio::test]
async fn test_completion_after_close_destroys_connection() {
    let (db, tm, ds) = setup();
    let tx = tm.begin();
    let conn = ds.get_connection().await.unwrap();
    let physical = db.connection(conn.physical_id()).unwrap();

    ds.close().await;
    assert_eq!(db.open_connections(), 1);

    tm.commit(&tx).await.unwrap();
    wait_until(|| db.open_connections() == 0).await;
    assert_eq!(physical.commits(), 1);
    assert!(physical.is_closed());
    assert!(conn.is_closed());
}

#[tokio::test]
async fn test_new_borrow_after_completion_is_not_associated() {
    let (_db, tm, ds) = setup();
    let tx = tm.begin();
    let inside = ds.get_connection().await.unwrap();
    let inside_id = inside.physical_id();
    tm.rollback(&tx).await.unwrap();
    wait_until(|| ds.num_active() == 0).await;

    let outside = ds.get_connection().await.unwrap();
    assert_eq!(outside.transaction(), None);
    assert_eq!(outside.physical_id(), inside_id);
    outside.commit().await.unwrap();
    outside.close().await.unwrap();

    let next = tm.begin();
    let again = ds.get_connection().await.unwrap();
    assert_eq!(again.transaction(), Some(&next));
    tm.commit(&next).await.unwrap();
    wait_until(|| ds.num_active() == 0).await;
}

#[tokio::test]
async fn test_separate_transactions_get_separate_connections() {
    let (_db, tm, ds) = setup();
    let tx1 = tm.begin();
    let a = ds.get_connection().await.unwrap();
    let tx2 = tm.begin();
    let b = ds.get_connection().await.unwrap();

    assert_ne!(a.physical_id(), b.physical_id());
    assert_eq!(ds.metrics().active_transactions, 2);

    tm.commit(&tx1).await.unwrap();
    tm.commit(&tx2).await.unwrap();
    wait_until(|| ds.num_active() == 0).await;
}

#[tokio::test]
async fn test_users_in_one_transaction_do_not_share() {
    let (_db, tm, ds) = setup();
    let tx = tm.begin();
    let alice = ds.get_connection_as("alice", "pw").await.unwrap();
    let bob = ds.get_connection_as("bob", "pw").await.unwrap();
    assert_ne!(alice.physical_id(), bob.physical_id());
    assert_eq!(tm.enlisted(&tx), 2);

    tm.commit(&tx).await.unwrap();
    wait_until(|| ds.num_active() == 0).await;
}

#[tokio::test]
async fn test_driver_xa_resource_is_enlisted() {
    let (db, tm, ds) = setup();
    db.set_xa_capable(true);
    let tx = tm.begin();

    let conn = ds.get_connection().await.unwrap();
    let physical = db.connection(conn.physical_id()).unwrap();
    tm.commit(&tx).await.unwrap();
    wait_until(|| ds.num_active() == 0).await;

    let calls: Vec<String> = physical.xa().calls().into_iter().map(|(op, _)| op).collect();
    assert_eq!(calls, vec!["start", "commit"]);
    // The local-transaction adapter was not used.
    assert_eq!(physical.commits(), 0);
}

#[tokio::test]
async fn test_sharing_disabled_ignores_transactions() {
    init_tracing();
    let db = MockDatabase::new();
    let tm = MockTransactionManager::new();
    let ds = DataSource::builder("ds")
        .connection_source(MockConnectionSource::new(&db))
        .transaction_manager(tm.clone())
        .transaction_sharing(false)
        .build()
        .unwrap();
    let tx = tm.begin();

    let a = ds.get_connection().await.unwrap();
    let b = ds.get_connection().await.unwrap();
    assert_ne!(a.physical_id(), b.physical_id());
    assert_eq!(a.transaction(), None);
    assert_eq!(tm.enlisted(&tx), 0);
    a.close().await.unwrap();
    b.close().await.unwrap();
}

// =============================================================================
// Failures
// =============================================================================

#[tokio::test]
async fn test_declined_enlistment_returns_connection() {
    let (_db, tm, ds) = setup();
    tm.set_enlistment_mode(EnlistmentMode::Decline);
    tm.begin();

    let err = ds.get_connection().await.unwrap_err();
    assert!(matches!(
        err,
        PoolError::Enlistment(TransactionError::Rejected(_))
    ));
    assert!(err.is_acquisition_failure());
    assert_eq!(ds.num_active(), 0);
    assert_eq!(ds.num_idle(), 1);
}

#[tokio::test]
async fn test_failed_enlistment_returns_connection() {
    let (_db, tm, ds) = setup();
    tm.set_enlistment_mode(EnlistmentMode::Fail);
    let tx = tm.begin();

    assert!(matches!(
        ds.get_connection().await.unwrap_err(),
        PoolError::Enlistment(_)
    ));
    assert_eq!(ds.num_active(), 0);

    // Enlistment failure leaves no association behind; a retry can succeed.
    tm.set_enlistment_mode(EnlistmentMode::Accept);
    let conn = ds.get_connection().await.unwrap();
    assert_eq!(conn.transaction(), Some(&tx));
    tm.commit(&tx).await.unwrap();
    wait_until(|| ds.num_active() == 0).await;
}

#[tokio::test]
async fn test_fatal_error_in_transaction_fails_later_requests() {
    let (db, tm, ds) = setup();
    let tx = tm.begin();
    let conn = ds.get_connection().await.unwrap();
    let id = conn.physical_id();

    db.break_connection(id);
    assert!(conn.execute("UPDATE t SET x = 1").await.is_err());
    assert_eq!(conn.state(), HandleState::Invalid);
    assert_eq!(ds.num_active(), 0);

    let err = ds.get_connection().await.unwrap_err();
    match err {
        PoolError::ConnectionAcquisition(msg) => {
            assert!(msg.contains("shared connection for transaction"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(db.opened(), 1);

    let _ = tm.rollback(&tx).await;
    assert_eq!(ds.metrics().active_transactions, 0);
}
