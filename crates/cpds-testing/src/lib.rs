//! # cpds-testing
//!
//! Test infrastructure for cpds data source development.
//!
//! ## Features
//!
//! - [`MockDatabase`]: in-memory server with users, passwords and
//!   per-connection fault injection
//! - [`MockConnectionSource`]: a `ConnectionSource` over a mock database
//! - [`MockTransactionManager`]: explicit begin/commit/rollback with
//!   configurable enlistment answers
//! - [`wait_until`]: poll for effects of background tasks
//!
//! ## Example
//!
//! ```rust,ignore
//! use cpds_testing::{MockConnectionSource, MockDatabase};
//!
//! let db = MockDatabase::new();
//! db.add_user("alice", Some("secret"));
//! let source = MockConnectionSource::new(&db);
//!
//! let ds = DataSource::builder("orders").connection_source(source).build()?;
//! let conn = ds.get_connection_as("alice", "secret").await?;
//! assert_eq!(db.open_connections(), 1);
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod database;
pub mod transaction;

pub use database::{ConnectionState, MockConnection, MockConnectionSource, MockDatabase, MockXaResource};
pub use transaction::{EnlistmentMode, MockTransactionManager};

use std::time::Duration;

/// Install a `tracing` subscriber honouring `RUST_LOG`, once per process.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Poll `condition` until it holds, panicking after about two seconds.
///
/// Connections dropped without `close` are returned by a spawned task; tests
/// use this to wait for that task instead of sleeping a fixed time.
#[allow(clippy::panic)]
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}
