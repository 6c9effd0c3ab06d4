//! Physical connection factory.
//!
//! One [`ConnectionFactory`] backs each sub-pool. It opens connections with
//! the last known good password of the requesting user, checks them on
//! behalf of the pool and listens for fatal error events from the driver.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use cpds_driver::{
    ConnectionEventListener, ConnectionId, ConnectionSource, Credentials, DriverError,
    IsolationLevel, PhysicalConnection,
};
use cpds_pool::PooledObjectFactory;
use parking_lot::{Mutex, RwLock};

use crate::config::PoolSettings;
use crate::connection::Lease;
use crate::key::{PoolKey, UserKey};

/// A physical connection as held by a sub-pool.
pub struct PooledObject {
    connection: Box<dyn PhysicalConnection>,
    credentials: Credentials,
    health: Arc<ConnectionHealth>,
    /// Session state right after the connection was opened.
    initial_read_only: bool,
    initial_isolation: IsolationLevel,
}

impl PooledObject {
    /// Id of the physical connection.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.connection.id()
    }

    /// The physical connection.
    #[must_use]
    pub fn connection(&self) -> &dyn PhysicalConnection {
        self.connection.as_ref()
    }

    /// The physical connection, mutably.
    pub fn connection_mut(&mut self) -> &mut dyn PhysicalConnection {
        self.connection.as_mut()
    }

    /// Credentials the connection was opened with.
    #[must_use]
    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Whether the driver reported a fatal error on the connection.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        self.health.fatal.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_fatal(&self) {
        self.health.fatal.store(true, Ordering::SeqCst);
    }

    /// Put back the read-only flag and isolation level the connection was
    /// opened with, undoing whatever the last borrower changed.
    pub(crate) async fn restore_session(&mut self) -> Result<(), DriverError> {
        let conn = self.connection.as_mut();
        if conn.is_read_only() != self.initial_read_only {
            conn.set_read_only(self.initial_read_only).await?;
        }
        if conn.transaction_isolation() != self.initial_isolation {
            conn.set_transaction_isolation(self.initial_isolation).await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for PooledObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledObject")
            .field("id", &self.id())
            .field("credentials", &self.credentials)
            .field("fatal", &self.is_fatal())
            .finish()
    }
}

#[derive(Debug, Default)]
struct ConnectionHealth {
    fatal: AtomicBool,
}

/// Creates, validates and destroys the physical connections of one sub-pool.
pub struct ConnectionFactory {
    pool_key: PoolKey,
    source: Arc<dyn ConnectionSource>,
    validation_query: Option<String>,
    validation_query_timeout: Option<Duration>,
    rollback_after_validation: bool,
    /// Last known good password per user.
    passwords: RwLock<HashMap<UserKey, Option<String>>>,
    events: Arc<FactoryEvents>,
    listener: Arc<dyn ConnectionEventListener>,
}

impl ConnectionFactory {
    /// Create a factory opening connections from `source`.
    #[must_use]
    pub fn new(pool_key: PoolKey, source: Arc<dyn ConnectionSource>, settings: &PoolSettings) -> Self {
        let events = Arc::new(FactoryEvents {
            pool_key: pool_key.clone(),
            registrations: Mutex::new(HashMap::new()),
        });
        let listener: Arc<dyn ConnectionEventListener> = events.clone();
        Self {
            pool_key,
            source,
            validation_query: settings.validation_query.clone(),
            validation_query_timeout: settings.validation_query_timeout,
            rollback_after_validation: settings.rollback_after_validation,
            passwords: RwLock::new(HashMap::new()),
            events,
            listener,
        }
    }

    /// Key of the sub-pool this factory serves.
    #[must_use]
    pub fn pool_key(&self) -> &PoolKey {
        &self.pool_key
    }

    /// Record `password` for `user` unless a password is already known.
    pub fn register_user(&self, user: &UserKey, password: Option<&str>) {
        if self.passwords.read().contains_key(user) {
            return;
        }
        self.passwords
            .write()
            .entry(user.clone())
            .or_insert_with(|| password.map(str::to_string));
    }

    /// Replace the known password of `user`.
    ///
    /// Idle connections opened with the previous password are discarded the
    /// next time they are borrowed or validated.
    pub fn set_password(&self, user: &UserKey, password: Option<&str>) {
        tracing::debug!(pool = %self.pool_key, user = %user, "password updated");
        self.passwords
            .write()
            .insert(user.clone(), password.map(str::to_string));
    }

    /// The known password of `user`, `None` if the user was never seen.
    #[must_use]
    pub fn known_password(&self, user: &UserKey) -> Option<Option<String>> {
        self.passwords.read().get(user).cloned()
    }

    /// Whether `object` was opened with a password other than the known one.
    fn is_stale(&self, user: &UserKey, object: &PooledObject) -> bool {
        match self.passwords.read().get(user) {
            Some(known) => !object.credentials.password_matches(known.as_deref()),
            None => false,
        }
    }

    /// Open and immediately close a connection with `credentials`.
    pub async fn test_open(&self, credentials: &Credentials) -> Result<(), DriverError> {
        let mut conn = self.source.open(credentials).await?;
        if let Err(e) = conn.close().await {
            tracing::debug!(pool = %self.pool_key, error = %e, "failed to close test connection");
        }
        Ok(())
    }

    /// Associate a handed-out connection with its lease so fatal error events
    /// can reclaim it.
    pub(crate) fn bind(&self, connection_id: ConnectionId, lease: &Arc<Lease>) {
        if let Some(registration) = self.events.registrations.lock().get_mut(&connection_id) {
            registration.lease = Arc::downgrade(lease);
        }
    }

    async fn run_validation_query(&self, object: &mut PooledObject, query: &str) -> bool {
        let conn = object.connection.as_mut();
        let result = match self.validation_query_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, conn.query(query)).await {
                Ok(result) => result,
                Err(_) => Err(DriverError::Timeout(timeout)),
            },
            None => conn.query(query).await,
        };

        match result {
            Ok(rows) if !rows.is_empty() => {
                if !self.rollback_after_validation {
                    return true;
                }
                match object.connection.rollback().await {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::debug!(pool = %self.pool_key, error = %e, "rollback after validation failed");
                        false
                    }
                }
            }
            Ok(_) => {
                tracing::debug!(pool = %self.pool_key, connection_id = object.id(), "validation query returned no rows");
                false
            }
            Err(e) => {
                if e.is_fatal() {
                    object.mark_fatal();
                }
                tracing::debug!(pool = %self.pool_key, connection_id = object.id(), error = %e, "validation query failed");
                false
            }
        }
    }
}

impl std::fmt::Debug for ConnectionFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionFactory")
            .field("pool_key", &self.pool_key)
            .field("source", &self.source.description())
            .field("validation_query", &self.validation_query)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl PooledObjectFactory<UserKey, PooledObject> for ConnectionFactory {
    type Error = DriverError;

    async fn make(&self, user: &UserKey) -> Result<PooledObject, DriverError> {
        let password = self.known_password(user).flatten();
        let credentials = Credentials::new(user.username(), password.as_deref());

        let mut connection = self.source.open(&credentials).await?;
        let health = Arc::new(ConnectionHealth::default());
        connection.add_event_listener(Arc::clone(&self.listener));
        self.events.registrations.lock().insert(
            connection.id(),
            Registration {
                health: Arc::clone(&health),
                lease: Weak::new(),
            },
        );

        tracing::debug!(pool = %self.pool_key, user = %user, connection_id = connection.id(), "opened physical connection");
        Ok(PooledObject {
            initial_read_only: connection.is_read_only(),
            initial_isolation: connection.transaction_isolation(),
            connection,
            credentials,
            health,
        })
    }

    async fn validate(&self, user: &UserKey, object: &mut PooledObject) -> bool {
        if object.is_fatal() {
            return false;
        }
        if self.is_stale(user, object) {
            tracing::debug!(pool = %self.pool_key, user = %user, connection_id = object.id(), "connection opened with outdated password");
            return false;
        }
        match self.validation_query.as_deref() {
            Some(query) => self.run_validation_query(object, query).await,
            None => true,
        }
    }

    async fn activate(&self, user: &UserKey, object: &mut PooledObject) -> Result<(), DriverError> {
        if object.is_fatal() {
            return Err(DriverError::Broken(format!(
                "connection {} reported a fatal error",
                object.id()
            )));
        }
        if self.is_stale(user, object) {
            return Err(DriverError::AuthenticationFailed {
                username: user.username().map(str::to_string),
            });
        }
        Ok(())
    }

    async fn destroy(&self, _user: &UserKey, mut object: PooledObject) {
        let id = object.id();
        self.events.registrations.lock().remove(&id);
        object.connection.remove_event_listener(&self.listener);
        if let Err(e) = object.connection.close().await {
            tracing::warn!(pool = %self.pool_key, connection_id = id, error = %e, "error closing physical connection");
        } else {
            tracing::debug!(pool = %self.pool_key, connection_id = id, "closed physical connection");
        }
    }
}

struct Registration {
    health: Arc<ConnectionHealth>,
    lease: Weak<Lease>,
}

/// Receives driver error events for every connection of one factory.
///
/// The listener stays attached to a connection until `destroy` detaches it,
/// since the connection itself is owned by the pool when an event arrives.
/// Only the first event per connection acts on it.
struct FactoryEvents {
    pool_key: PoolKey,
    registrations: Mutex<HashMap<ConnectionId, Registration>>,
}

impl ConnectionEventListener for FactoryEvents {
    fn connection_error_occurred(&self, connection_id: ConnectionId, error: &DriverError) {
        // Later events find no registration and are ignored until destroy
        // detaches the listener.
        let Some(registration) = self.registrations.lock().remove(&connection_id) else {
            return;
        };
        registration.health.fatal.store(true, Ordering::SeqCst);
        tracing::warn!(pool = %self.pool_key, connection_id, error = %error, "driver reported fatal connection error");

        if let Some(lease) = registration.lease.upgrade() {
            lease.reclaim_after_error();
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use cpds_testing::{MockConnectionSource, MockDatabase};

    fn factory(db: &Arc<MockDatabase>, settings: &PoolSettings) -> ConnectionFactory {
        ConnectionFactory::new(
            PoolKey::new("test", None),
            MockConnectionSource::new(db),
            settings,
        )
    }

    #[tokio::test]
    async fn test_make_uses_known_password() {
        let db = MockDatabase::new();
        db.add_user("alice", Some("secret"));
        let factory = factory(&db, &PoolSettings::default());
        let alice = UserKey::new(Some("alice"));

        factory.register_user(&alice, Some("secret"));
        factory.register_user(&alice, Some("ignored"));
        let object = factory.make(&alice).await.unwrap();
        assert_eq!(object.credentials().password(), Some("secret"));
        assert_eq!(db.connection(object.id()).unwrap().listener_count(), 1);

        factory.destroy(&alice, object).await;
        assert_eq!(db.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_validate_with_query() {
        let db = MockDatabase::new();
        let settings = PoolSettings::new()
            .validation_query("SELECT 1")
            .rollback_after_validation(true);
        let factory = factory(&db, &settings);
        let user = UserKey::default();

        let mut object = factory.make(&user).await.unwrap();
        assert!(factory.validate(&user, &mut object).await);
        let state = db.connection(object.id()).unwrap();
        assert_eq!(state.statements(), vec!["SELECT 1".to_string()]);
        assert_eq!(state.rollbacks(), 1);

        db.set_empty_results(true);
        assert!(!factory.validate(&user, &mut object).await);

        db.break_connection(object.id());
        db.set_empty_results(false);
        assert!(!factory.validate(&user, &mut object).await);
        assert!(object.is_fatal());
    }

    #[tokio::test]
    async fn test_stale_password_fails_validation_and_activation() {
        let db = MockDatabase::new();
        let factory = factory(&db, &PoolSettings::default());
        let alice = UserKey::new(Some("alice"));

        factory.register_user(&alice, Some("old"));
        let mut object = factory.make(&alice).await.unwrap();
        assert!(factory.validate(&alice, &mut object).await);

        factory.set_password(&alice, Some("new"));
        assert!(!factory.validate(&alice, &mut object).await);
        assert!(factory.activate(&alice, &mut object).await.is_err());
    }

    #[tokio::test]
    async fn test_error_event_marks_fatal_once() {
        let db = MockDatabase::new();
        let factory = factory(&db, &PoolSettings::default());
        let user = UserKey::default();

        let mut object = factory.make(&user).await.unwrap();
        let state = db.connection(object.id()).unwrap();
        db.fire_error(object.id());
        db.fire_error(object.id());
        assert!(object.is_fatal());
        assert!(!factory.validate(&user, &mut object).await);
        assert!(factory.events.registrations.lock().is_empty());
        assert_eq!(state.listener_count(), 1);

        factory.destroy(&user, object).await;
        assert_eq!(state.listener_count(), 0);
        assert_eq!(db.open_connections(), 0);
    }
}
