//! Physical connection and connection source contracts.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::credentials::Credentials;
use crate::error::DriverError;
use crate::isolation::IsolationLevel;
use crate::transaction::XaResource;

/// Identifier of a physical connection, unique within its source.
pub type ConnectionId = u64;

/// Rows produced by a query.
///
/// Statement semantics are out of scope for the pool, so values are kept as
/// plain text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryResult {
    /// Result rows, one vector of column values per row.
    pub rows: Vec<Vec<String>>,
}

impl QueryResult {
    /// A result with no rows.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Number of rows returned.
    #[must_use]
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Whether the result has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// A prepared statement handle issued by a physical connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    /// Driver-assigned statement id.
    pub id: u64,
    /// SQL text the statement was prepared from.
    pub sql: String,
}

/// Receives asynchronous notifications from a physical connection.
///
/// Drivers call this when they detect a fatal error on a connection outside
/// of (or in addition to) returning an error from the failing call. The
/// same event may be delivered more than once or concurrently with calls on
/// the connection; listeners must tolerate both.
pub trait ConnectionEventListener: Send + Sync {
    /// The connection identified by `connection_id` suffered a fatal error.
    fn connection_error_occurred(&self, connection_id: ConnectionId, error: &DriverError);
}

/// Opens physical connections.
#[async_trait]
pub trait ConnectionSource: Send + Sync + 'static {
    /// Open a new physical connection with the given credentials.
    async fn open(&self, credentials: &Credentials)
    -> Result<Box<dyn PhysicalConnection>, DriverError>;

    /// Human readable description of the source, used in logs.
    fn description(&self) -> String {
        "connection source".to_string()
    }
}

/// One open driver-level connection.
#[async_trait]
pub trait PhysicalConnection: Send + 'static {
    /// Identifier of this connection.
    fn id(&self) -> ConnectionId;

    /// Run a query and return its rows.
    async fn query(&mut self, sql: &str) -> Result<QueryResult, DriverError>;

    /// Run a statement and return the number of affected rows.
    async fn execute(&mut self, sql: &str) -> Result<u64, DriverError>;

    /// Prepare a statement.
    async fn prepare(&mut self, sql: &str) -> Result<Statement, DriverError>;

    /// Driver-level liveness check.
    async fn is_valid(&mut self, timeout: Duration) -> Result<bool, DriverError>;

    /// Current auto-commit mode.
    fn auto_commit(&self) -> bool;

    /// Change auto-commit mode.
    async fn set_auto_commit(&mut self, enabled: bool) -> Result<(), DriverError>;

    /// Current read-only flag.
    fn is_read_only(&self) -> bool;

    /// Change the read-only flag.
    async fn set_read_only(&mut self, read_only: bool) -> Result<(), DriverError>;

    /// Current transaction isolation level.
    fn transaction_isolation(&self) -> IsolationLevel;

    /// Change the transaction isolation level.
    async fn set_transaction_isolation(&mut self, level: IsolationLevel)
    -> Result<(), DriverError>;

    /// Commit the current local transaction.
    async fn commit(&mut self) -> Result<(), DriverError>;

    /// Roll back the current local transaction.
    async fn rollback(&mut self) -> Result<(), DriverError>;

    /// Close the connection. Closing twice must not fail.
    async fn close(&mut self) -> Result<(), DriverError>;

    /// Register a listener for error events on this connection.
    fn add_event_listener(&mut self, listener: Arc<dyn ConnectionEventListener>);

    /// Remove a listener previously registered with
    /// [`add_event_listener`](Self::add_event_listener).
    fn remove_event_listener(&mut self, listener: &Arc<dyn ConnectionEventListener>);

    /// The driver's own XA resource, if it supports distributed transactions.
    ///
    /// Connections without one are enlisted through a local-transaction
    /// adapter that drives `commit`/`rollback` directly.
    fn xa_resource(&self) -> Option<Arc<dyn XaResource>> {
        None
    }
}
