//! In-memory mock database and driver.
//!
//! [`MockDatabase`] plays the role of the server: it knows which users exist,
//! counts opened and closed connections and lets a test break individual
//! connections or fire driver error events at the pool.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use cpds_driver::{
    ConnectionEventListener, ConnectionId, ConnectionSource, Credentials, DriverError,
    IsolationLevel, PhysicalConnection, QueryResult, Statement, TransactionError, TransactionKey,
    XaResource,
};
use parking_lot::Mutex;

/// Shared state of one mock server.
#[derive(Default)]
pub struct MockDatabase {
    users: Mutex<HashMap<String, Option<String>>>,
    connections: Mutex<HashMap<ConnectionId, Arc<ConnectionState>>>,
    next_id: AtomicU64,
    opened: AtomicU64,
    closed: AtomicU64,
    refuse: AtomicBool,
    empty_results: AtomicBool,
    xa_capable: AtomicBool,
    open_delay: Mutex<Option<Duration>>,
}

/// Observable state of one mock physical connection.
pub struct ConnectionState {
    id: ConnectionId,
    username: Option<String>,
    broken: AtomicBool,
    closed: AtomicBool,
    settings: Mutex<Settings>,
    statements: Mutex<Vec<String>>,
    commits: AtomicU64,
    rollbacks: AtomicU64,
    listeners: Mutex<Vec<Arc<dyn ConnectionEventListener>>>,
    xa: Arc<MockXaResource>,
}

#[derive(Debug, Clone, Copy)]
struct Settings {
    auto_commit: bool,
    read_only: bool,
    isolation: IsolationLevel,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            auto_commit: true,
            read_only: false,
            isolation: IsolationLevel::ReadCommitted,
        }
    }
}

impl MockDatabase {
    /// Create a database that accepts any credentials for unknown users.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register `username` with `password`. Registered users must present the
    /// matching password.
    pub fn add_user(&self, username: &str, password: Option<&str>) {
        self.users
            .lock()
            .insert(username.to_string(), password.map(str::to_string));
    }

    /// Change the password of a registered user, as an administrator would on
    /// the server.
    pub fn set_password(&self, username: &str, password: Option<&str>) {
        self.add_user(username, password);
    }

    /// Make every subsequent `open` fail with a refused connection.
    pub fn set_refuse_connections(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Make queries return no rows, so validation queries fail.
    pub fn set_empty_results(&self, empty: bool) {
        self.empty_results.store(empty, Ordering::SeqCst);
    }

    /// Make new connections expose an XA resource.
    pub fn set_xa_capable(&self, capable: bool) {
        self.xa_capable.store(capable, Ordering::SeqCst);
    }

    /// Delay every `open` by `delay`.
    pub fn set_open_delay(&self, delay: Option<Duration>) {
        *self.open_delay.lock() = delay;
    }

    /// Number of connections opened so far.
    #[must_use]
    pub fn opened(&self) -> u64 {
        self.opened.load(Ordering::SeqCst)
    }

    /// Number of connections closed so far.
    #[must_use]
    pub fn closed(&self) -> u64 {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of connections currently open.
    #[must_use]
    pub fn open_connections(&self) -> u64 {
        self.opened().saturating_sub(self.closed())
    }

    /// State of the connection with `id`.
    #[must_use]
    pub fn connection(&self, id: ConnectionId) -> Option<Arc<ConnectionState>> {
        self.connections.lock().get(&id).cloned()
    }

    /// Mark the connection broken; every later call on it fails.
    pub fn break_connection(&self, id: ConnectionId) {
        if let Some(state) = self.connection(id) {
            state.broken.store(true, Ordering::SeqCst);
        }
    }

    /// Break the connection and deliver a fatal error event to its listeners.
    pub fn fire_error(&self, id: ConnectionId) {
        let Some(state) = self.connection(id) else {
            return;
        };
        state.broken.store(true, Ordering::SeqCst);
        let listeners = state.listeners.lock().clone();
        let error = DriverError::Broken(format!("connection {id} reset by peer"));
        for listener in listeners {
            listener.connection_error_occurred(id, &error);
        }
    }

    fn authenticate(&self, credentials: &Credentials) -> Result<(), DriverError> {
        let Some(username) = credentials.username() else {
            return Ok(());
        };
        match self.users.lock().get(username) {
            Some(expected) if expected.as_deref() != credentials.password() => {
                Err(DriverError::AuthenticationFailed {
                    username: Some(username.to_string()),
                })
            }
            _ => Ok(()),
        }
    }

    async fn open(self: &Arc<Self>, credentials: &Credentials) -> Result<MockConnection, DriverError> {
        let delay = *self.open_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.refuse.load(Ordering::SeqCst) {
            return Err(DriverError::ConnectionRefused("mock database is down".into()));
        }
        self.authenticate(credentials)?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let state = Arc::new(ConnectionState {
            id,
            username: credentials.username().map(str::to_string),
            broken: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            settings: Mutex::new(Settings::default()),
            statements: Mutex::new(Vec::new()),
            commits: AtomicU64::new(0),
            rollbacks: AtomicU64::new(0),
            listeners: Mutex::new(Vec::new()),
            xa: Arc::new(MockXaResource::default()),
        });
        self.connections.lock().insert(id, Arc::clone(&state));
        self.opened.fetch_add(1, Ordering::SeqCst);
        tracing::trace!(connection_id = id, "mock connection opened");

        Ok(MockConnection {
            state,
            db: Arc::clone(self),
            xa_capable: self.xa_capable.load(Ordering::SeqCst),
        })
    }
}

impl std::fmt::Debug for MockDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockDatabase")
            .field("opened", &self.opened())
            .field("closed", &self.closed())
            .finish_non_exhaustive()
    }
}

impl ConnectionState {
    /// Connection id.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// User the connection was opened for.
    #[must_use]
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    /// Whether the connection was closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Whether the connection was broken.
    #[must_use]
    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::SeqCst)
    }

    /// Current auto-commit mode.
    #[must_use]
    pub fn auto_commit(&self) -> bool {
        self.settings.lock().auto_commit
    }

    /// Current read-only flag.
    #[must_use]
    pub fn read_only(&self) -> bool {
        self.settings.lock().read_only
    }

    /// Current isolation level.
    #[must_use]
    pub fn isolation(&self) -> IsolationLevel {
        self.settings.lock().isolation
    }

    /// Every query, statement and prepare issued on the connection.
    #[must_use]
    pub fn statements(&self) -> Vec<String> {
        self.statements.lock().clone()
    }

    /// Number of local commits.
    #[must_use]
    pub fn commits(&self) -> u64 {
        self.commits.load(Ordering::SeqCst)
    }

    /// Number of local rollbacks.
    #[must_use]
    pub fn rollbacks(&self) -> u64 {
        self.rollbacks.load(Ordering::SeqCst)
    }

    /// Number of registered event listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    /// The connection's XA resource, whether or not it is exposed.
    #[must_use]
    pub fn xa(&self) -> &Arc<MockXaResource> {
        &self.xa
    }
}

/// Connection source backed by a [`MockDatabase`].
#[derive(Debug, Clone)]
pub struct MockConnectionSource {
    db: Arc<MockDatabase>,
}

impl MockConnectionSource {
    /// Create a source for `db`.
    #[must_use]
    pub fn new(db: &Arc<MockDatabase>) -> Arc<Self> {
        Arc::new(Self {
            db: Arc::clone(db),
        })
    }
}

#[async_trait]
impl ConnectionSource for MockConnectionSource {
    async fn open(
        &self,
        credentials: &Credentials,
    ) -> Result<Box<dyn PhysicalConnection>, DriverError> {
        let conn = self.db.open(credentials).await?;
        Ok(Box::new(conn))
    }

    fn description(&self) -> String {
        "mock database".to_string()
    }
}

/// A physical connection to a [`MockDatabase`].
pub struct MockConnection {
    state: Arc<ConnectionState>,
    db: Arc<MockDatabase>,
    xa_capable: bool,
}

impl MockConnection {
    fn check(&self) -> Result<(), DriverError> {
        if self.state.is_closed() {
            return Err(DriverError::Closed);
        }
        if self.state.is_broken() {
            return Err(DriverError::Broken(format!(
                "connection {} is broken",
                self.state.id
            )));
        }
        Ok(())
    }

    fn record(&self, sql: &str) -> Result<(), DriverError> {
        self.check()?;
        self.state.statements.lock().push(sql.to_string());
        Ok(())
    }
}

#[async_trait]
impl PhysicalConnection for MockConnection {
    fn id(&self) -> ConnectionId {
        self.state.id
    }

    async fn query(&mut self, sql: &str) -> Result<QueryResult, DriverError> {
        self.record(sql)?;
        if self.db.empty_results.load(Ordering::SeqCst) {
            return Ok(QueryResult::empty());
        }
        Ok(QueryResult {
            rows: vec![vec!["1".to_string()]],
        })
    }

    async fn execute(&mut self, sql: &str) -> Result<u64, DriverError> {
        self.record(sql)?;
        Ok(1)
    }

    async fn prepare(&mut self, sql: &str) -> Result<Statement, DriverError> {
        self.record(sql)?;
        Ok(Statement {
            id: self.state.statements.lock().len() as u64,
            sql: sql.to_string(),
        })
    }

    async fn is_valid(&mut self, _timeout: Duration) -> Result<bool, DriverError> {
        Ok(self.check().is_ok())
    }

    fn auto_commit(&self) -> bool {
        self.state.auto_commit()
    }

    async fn set_auto_commit(&mut self, enabled: bool) -> Result<(), DriverError> {
        self.check()?;
        self.state.settings.lock().auto_commit = enabled;
        Ok(())
    }

    fn is_read_only(&self) -> bool {
        self.state.read_only()
    }

    async fn set_read_only(&mut self, read_only: bool) -> Result<(), DriverError> {
        self.check()?;
        self.state.settings.lock().read_only = read_only;
        Ok(())
    }

    fn transaction_isolation(&self) -> IsolationLevel {
        self.state.isolation()
    }

    async fn set_transaction_isolation(&mut self, level: IsolationLevel) -> Result<(), DriverError> {
        self.check()?;
        self.state.settings.lock().isolation = level;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), DriverError> {
        self.check()?;
        self.state.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), DriverError> {
        self.check()?;
        self.state.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), DriverError> {
        if !self.state.closed.swap(true, Ordering::SeqCst) {
            self.db.closed.fetch_add(1, Ordering::SeqCst);
            tracing::trace!(connection_id = self.state.id, "mock connection closed");
        }
        Ok(())
    }

    fn add_event_listener(&mut self, listener: Arc<dyn ConnectionEventListener>) {
        self.state.listeners.lock().push(listener);
    }

    fn remove_event_listener(&mut self, listener: &Arc<dyn ConnectionEventListener>) {
        self.state
            .listeners
            .lock()
            .retain(|registered| !Arc::ptr_eq(registered, listener));
    }

    fn xa_resource(&self) -> Option<Arc<dyn XaResource>> {
        if self.xa_capable {
            let xa: Arc<dyn XaResource> = self.state.xa.clone();
            Some(xa)
        } else {
            None
        }
    }
}

/// XA resource that records the calls it receives.
#[derive(Debug, Default)]
pub struct MockXaResource {
    calls: Mutex<Vec<(String, TransactionKey)>>,
}

impl MockXaResource {
    /// Calls received so far, as `(operation, transaction)` pairs.
    #[must_use]
    pub fn calls(&self) -> Vec<(String, TransactionKey)> {
        self.calls.lock().clone()
    }

    fn record(&self, op: &str, tx: &TransactionKey) {
        self.calls.lock().push((op.to_string(), tx.clone()));
    }
}

#[async_trait]
impl XaResource for MockXaResource {
    async fn start(&self, tx: &TransactionKey) -> Result<(), TransactionError> {
        self.record("start", tx);
        Ok(())
    }

    async fn commit(&self, tx: &TransactionKey) -> Result<(), TransactionError> {
        self.record("commit", tx);
        Ok(())
    }

    async fn rollback(&self, tx: &TransactionKey) -> Result<(), TransactionError> {
        self.record("rollback", tx);
        Ok(())
    }
}
