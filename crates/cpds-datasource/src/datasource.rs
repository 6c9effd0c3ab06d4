//! The data source facade.
//!
//! A [`DataSource`] hands out [`PooledConnection`]s. Each request is routed to
//! a sub-pool chosen by [`resolve_key`]; sub-pools are created lazily with the
//! settings in effect at that moment.
//!
//! Identity settings (connection source, abandoned tracking, transaction
//! sharing) are fixed by the first connection request. Pool settings may be
//! replaced at any time and apply to sub-pools created afterwards.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use cpds_driver::{
    ConnectionSource, DriverError, NamingContext, PhysicalConnection, TransactionManager,
};
use cpds_pool::{Checkout, ObjectPoolError, PoolMetrics, PoolStatus};
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::abandoned::AbandonedTracker;
use crate::config::{AbandonedConfig, LayeredConfig, PoolSettings, UserOverrides};
use crate::connection::{Lease, PooledConnection};
use crate::error::{PoolError, Result};
use crate::factory::PooledObject;
use crate::key::{PoolKey, UserKey, resolve_key};
use crate::managed::TransactionRegistry;
use crate::registry::{PoolRegistry, SubPool};

/// Borrow attempts made while the backend password is changing.
const MAX_PASSWORD_RETRIES: usize = 10;

/// Where physical connections come from.
#[derive(Clone)]
pub(crate) enum SourceBinding {
    /// A source attached directly.
    Attached(Arc<dyn ConnectionSource>),
    /// A source looked up by name when a sub-pool is created.
    Named {
        name: String,
        naming: Arc<dyn NamingContext>,
    },
}

impl SourceBinding {
    async fn resolve(&self) -> Result<Arc<dyn ConnectionSource>> {
        match self {
            Self::Attached(source) => Ok(Arc::clone(source)),
            Self::Named { name, naming } => {
                let source = naming.lookup(name).await?;
                tracing::debug!(name = %name, "resolved connection source");
                Ok(source)
            }
        }
    }
}

impl std::fmt::Debug for SourceBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Attached(source) => f.debug_tuple("Attached").field(&source.description()).finish(),
            Self::Named { name, .. } => f.debug_struct("Named").field("name", name).finish_non_exhaustive(),
        }
    }
}

/// Settings that can only change before the first connection request.
#[derive(Clone, Default)]
pub(crate) struct Identity {
    pub(crate) source: Option<SourceBinding>,
    pub(crate) abandoned: Option<AbandonedConfig>,
    pub(crate) transaction_manager: Option<Arc<dyn TransactionManager>>,
    pub(crate) transaction_sharing: bool,
}

/// What the first connection request builds from the identity settings.
struct Runtime {
    source: SourceBinding,
    abandoned: Option<AbandonedConfig>,
    tracker: Option<Arc<AbandonedTracker>>,
    transactions: Option<Arc<TransactionRegistry>>,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

enum IdentityState {
    Configuring(Identity),
    Frozen(Arc<Runtime>),
}

/// Aggregated counters of a data source.
#[derive(Debug, Clone, Default)]
pub struct DataSourceMetrics {
    /// Counters summed over every sub-pool.
    pub pools: PoolMetrics,
    /// Connections reclaimed by abandoned sweeps.
    pub abandoned_reclaimed: u64,
    /// Number of sub-pools.
    pub sub_pools: usize,
    /// Transactions currently holding shared connections.
    pub active_transactions: usize,
}

/// A pooling data source with per-user sub-pools.
///
/// Cloning is cheap; clones share the same pools.
///
/// # Example
///
/// ```rust,ignore
/// use cpds_datasource::{DataSource, PoolSettings};
///
/// let ds = DataSource::builder("orders")
///     .connection_source(source)
///     .defaults(PoolSettings::new().max_total(20))
///     .build()?;
///
/// let conn = ds.get_connection().await?;
/// conn.query("SELECT 1").await?;
/// conn.close().await?;
/// ```
#[derive(Clone)]
pub struct DataSource {
    inner: Arc<DataSourceInner>,
}

struct DataSourceInner {
    name: String,
    description: RwLock<Option<String>>,
    identity: Mutex<IdentityState>,
    config: RwLock<Arc<LayeredConfig>>,
    registry: PoolRegistry,
    closed: AtomicBool,
}

impl DataSource {
    /// Create a data source with default settings and no connection source.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self::from_parts(name.into(), None, Identity::default(), LayeredConfig::default())
    }

    /// Create a builder.
    #[must_use]
    pub fn builder(name: impl Into<String>) -> DataSourceBuilder {
        DataSourceBuilder::new(name)
    }

    pub(crate) fn from_parts(
        name: String,
        description: Option<String>,
        identity: Identity,
        config: LayeredConfig,
    ) -> Self {
        Self {
            inner: Arc::new(DataSourceInner {
                name,
                description: RwLock::new(description),
                identity: Mutex::new(IdentityState::Configuring(identity)),
                config: RwLock::new(Arc::new(config)),
                registry: PoolRegistry::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Name identifying this data source; part of every pool key.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Free-form description.
    #[must_use]
    pub fn description(&self) -> Option<String> {
        self.inner.description.read().clone()
    }

    /// Change the description.
    pub fn set_description(&self, description: Option<String>) {
        *self.inner.description.write() = description;
    }

    /// Get a connection for the default user.
    pub async fn get_connection(&self) -> Result<PooledConnection> {
        self.inner.acquire(None, None).await
    }

    /// Get a connection for `username`.
    ///
    /// Fails with [`PoolError::AuthenticationMismatch`] if `password` does not
    /// match the one pooled connections were opened with and the server
    /// rejects it too.
    pub async fn get_connection_as(&self, username: &str, password: &str) -> Result<PooledConnection> {
        self.inner.acquire(Some(username), Some(password)).await
    }

    // ---------------------------------------------------------------------
    // Identity settings
    // ---------------------------------------------------------------------

    /// Open connections from `source`.
    pub fn set_connection_source(&self, source: Arc<dyn ConnectionSource>) -> Result<()> {
        self.inner
            .configure("connection source", |id| id.source = Some(SourceBinding::Attached(source)))
    }

    /// Look the connection source up under `name` when sub-pools are created.
    pub fn set_connection_source_name(
        &self,
        name: impl Into<String>,
        naming: Arc<dyn NamingContext>,
    ) -> Result<()> {
        let name = name.into();
        self.inner.configure("connection source name", |id| {
            id.source = Some(SourceBinding::Named { name, naming });
        })
    }

    /// Enable or disable abandoned connection tracking.
    pub fn set_abandoned(&self, abandoned: Option<AbandonedConfig>) -> Result<()> {
        if let Some(config) = &abandoned {
            config.validate()?;
        }
        self.inner.configure("abandoned tracking", |id| id.abandoned = abandoned)
    }

    /// Use `manager` for transaction-aware sharing and enable sharing.
    pub fn set_transaction_manager(&self, manager: Arc<dyn TransactionManager>) -> Result<()> {
        self.inner.configure("transaction manager", |id| {
            id.transaction_manager = Some(manager);
            id.transaction_sharing = true;
        })
    }

    /// Enable or disable transaction-aware sharing.
    pub fn set_transaction_sharing(&self, enabled: bool) -> Result<()> {
        self.inner
            .configure("transaction sharing", |id| id.transaction_sharing = enabled)
    }

    pub(crate) fn identity(&self) -> Identity {
        match &*self.inner.identity.lock() {
            IdentityState::Configuring(identity) => identity.clone(),
            IdentityState::Frozen(runtime) => Identity {
                source: Some(runtime.source.clone()),
                abandoned: runtime.abandoned.clone(),
                transaction_manager: None,
                transaction_sharing: runtime.transactions.is_some(),
            },
        }
    }

    // ---------------------------------------------------------------------
    // Pool settings
    // ---------------------------------------------------------------------

    /// Current configuration snapshot.
    #[must_use]
    pub fn config(&self) -> Arc<LayeredConfig> {
        Arc::clone(&self.inner.config.read())
    }

    /// Replace the default settings. Existing sub-pools keep their settings.
    pub fn set_defaults(&self, defaults: PoolSettings) -> Result<()> {
        let mut config = self.inner.config.write();
        let next = config.with_defaults(defaults);
        next.validate()?;
        *config = Arc::new(next);
        Ok(())
    }

    /// Install per-user overrides for `username`.
    ///
    /// From then on `username` gets a sub-pool of its own.
    pub fn set_user_overrides(&self, username: &str, overrides: UserOverrides) -> Result<()> {
        let mut config = self.inner.config.write();
        let next = config.with_user(username, overrides);
        next.validate()?;
        *config = Arc::new(next);
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Status
    // ---------------------------------------------------------------------

    /// Connections currently handed out, over all sub-pools.
    #[must_use]
    pub fn num_active(&self) -> u32 {
        self.inner.registry.sub_pools().iter().map(|p| p.pool().num_active()).sum()
    }

    /// Idle connections, over all sub-pools.
    #[must_use]
    pub fn num_idle(&self) -> u32 {
        self.inner.registry.sub_pools().iter().map(|p| p.pool().num_idle()).sum()
    }

    /// Connections currently handed out to `username`.
    #[must_use]
    pub fn num_active_for(&self, username: Option<&str>) -> u32 {
        self.inner
            .sub_pool_for(username)
            .map_or(0, |p| p.pool().num_active_for(&UserKey::new(username)))
    }

    /// Idle connections opened for `username`.
    #[must_use]
    pub fn num_idle_for(&self, username: Option<&str>) -> u32 {
        self.inner
            .sub_pool_for(username)
            .map_or(0, |p| p.pool().num_idle_for(&UserKey::new(username)))
    }

    /// Combined status of every sub-pool.
    #[must_use]
    pub fn status(&self) -> PoolStatus {
        self.inner.registry.status()
    }

    /// Status of the sub-pool serving `username`.
    #[must_use]
    pub fn status_for(&self, username: Option<&str>) -> PoolStatus {
        self.inner
            .sub_pool_for(username)
            .map(|p| p.status())
            .unwrap_or_default()
    }

    /// Aggregated counters.
    #[must_use]
    pub fn metrics(&self) -> DataSourceMetrics {
        let runtime = self.inner.runtime_if_frozen();
        DataSourceMetrics {
            pools: self.inner.registry.metrics(),
            abandoned_reclaimed: runtime
                .as_ref()
                .and_then(|rt| rt.tracker.as_ref())
                .map_or(0, |t| t.reclaimed()),
            sub_pools: self.inner.registry.len(),
            active_transactions: runtime
                .as_ref()
                .and_then(|rt| rt.transactions.as_ref())
                .map_or(0, |t| t.active_transactions()),
        }
    }

    /// The sub-pool registered under `key`.
    #[must_use]
    pub fn sub_pool(&self, key: &PoolKey) -> Option<Arc<SubPool>> {
        self.inner.registry.get(key)
    }

    // ---------------------------------------------------------------------
    // Maintenance and shutdown
    // ---------------------------------------------------------------------

    /// Run one maintenance pass now: evict idle connections, refill to
    /// `min_idle` and, if configured, sweep abandoned connections.
    ///
    /// Returns the number of connections evicted.
    pub async fn run_maintenance(&self) -> usize {
        self.inner.run_maintenance().await
    }

    /// Reclaim abandoned connections now. Returns the number reclaimed.
    pub async fn sweep_abandoned(&self) -> usize {
        match self.inner.runtime_if_frozen().and_then(|rt| rt.tracker.clone()) {
            Some(tracker) => tracker.sweep().await,
            None => 0,
        }
    }

    /// Whether [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Close every sub-pool and stop the maintenance task.
    ///
    /// Idle connections are destroyed; connections still handed out are
    /// destroyed when they are closed. Closing twice is a no-op.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(runtime) = self.inner.runtime_if_frozen() {
            runtime.stop_maintenance();
        }
        self.inner.registry.close_all().await;
        tracing::info!(data_source = %self.inner.name, "data source closed");
    }
}

impl std::fmt::Debug for DataSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataSource")
            .field("name", &self.inner.name)
            .field("sub_pools", &self.inner.registry.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl DataSourceInner {
    fn configure(&self, setting: &str, apply: impl FnOnce(&mut Identity)) -> Result<()> {
        match &mut *self.identity.lock() {
            IdentityState::Configuring(identity) => {
                apply(identity);
                Ok(())
            }
            IdentityState::Frozen(_) => Err(PoolError::Configuration(format!(
                "{setting} cannot be changed after the first connection request"
            ))),
        }
    }

    fn runtime_if_frozen(&self) -> Option<Arc<Runtime>> {
        match &*self.identity.lock() {
            IdentityState::Frozen(runtime) => Some(Arc::clone(runtime)),
            IdentityState::Configuring(_) => None,
        }
    }

    /// Freeze the identity settings on first use.
    fn runtime(self: &Arc<Self>) -> Result<Arc<Runtime>> {
        let mut state = self.identity.lock();
        let identity = match &*state {
            IdentityState::Frozen(runtime) => return Ok(Arc::clone(runtime)),
            IdentityState::Configuring(identity) => identity,
        };

        let source = identity.source.clone().ok_or_else(|| {
            PoolError::Configuration(format!(
                "data source {} has no connection source or source name",
                self.name
            ))
        })?;
        let transactions = match (identity.transaction_sharing, &identity.transaction_manager) {
            (false, _) => None,
            (true, Some(manager)) => Some(TransactionRegistry::new(Arc::clone(manager))),
            (true, None) => {
                return Err(PoolError::Configuration(
                    "transaction sharing requires a transaction manager".into(),
                ));
            }
        };
        let abandoned = identity.abandoned.clone();
        let tracker = abandoned
            .clone()
            .map(|config| Arc::new(AbandonedTracker::new(config)));

        let runtime = Arc::new(Runtime {
            source,
            abandoned,
            tracker,
            transactions,
            maintenance: Mutex::new(None),
        });
        *state = IdentityState::Frozen(Arc::clone(&runtime));
        drop(state);

        self.start_maintenance(&runtime);
        Ok(runtime)
    }

    fn start_maintenance(self: &Arc<Self>, runtime: &Runtime) {
        let Some(period) = self.config.read().defaults().time_between_eviction_runs else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(data_source = %self.name, "no runtime available, maintenance task not started");
            return;
        };

        let weak: Weak<Self> = Arc::downgrade(self);
        let task = handle.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if inner.closed.load(Ordering::Acquire) {
                    break;
                }
                inner.run_maintenance().await;
            }
        });
        *runtime.maintenance.lock() = Some(task);
        tracing::debug!(data_source = %self.name, period_ms = period.as_millis() as u64, "maintenance task started");
    }

    async fn run_maintenance(&self) -> usize {
        let mut evicted = 0;
        for sub_pool in self.registry.sub_pools() {
            evicted += sub_pool.pool().evict().await;
            for user in sub_pool.pool().keys() {
                sub_pool.pool().ensure_min_idle(&user).await;
            }
        }

        if let Some(tracker) = self.runtime_if_frozen().and_then(|rt| rt.tracker.clone()) {
            if tracker.config().remove_on_maintenance {
                tracker.sweep().await;
            }
        }
        if evicted > 0 {
            tracing::debug!(data_source = %self.name, evicted, "maintenance run finished");
        }
        evicted
    }

    fn pool_key(&self, username: Option<&str>) -> PoolKey {
        let per_user = self.config.read().has_user(username);
        resolve_key(&self.name, username, per_user)
    }

    fn sub_pool_for(&self, username: Option<&str>) -> Option<Arc<SubPool>> {
        self.registry.get(&self.pool_key(username))
    }

    async fn acquire(
        self: &Arc<Self>,
        username: Option<&str>,
        password: Option<&str>,
    ) -> Result<PooledConnection> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PoolError::Configuration(format!(
                "data source {} is closed",
                self.name
            )));
        }
        let runtime = self.runtime()?;

        let config = Arc::clone(&self.config.read());
        let key = resolve_key(&self.name, username, config.has_user(username));
        let sub_pool = self
            .registry
            .get_or_create(&key, || async {
                let source = runtime.source.resolve().await?;
                SubPool::new(key.clone(), source, config.resolve(key.username()))
            })
            .await?;

        let user = UserKey::new(username);
        sub_pool.factory().register_user(&user, password);

        if let Some(registry) = &runtime.transactions {
            if let Some(tx) = registry.current_transaction() {
                let shared = registry
                    .shared_lease(&tx, &key, &user, || {
                        self.lease(&runtime, &sub_pool, &user, password, false)
                    })
                    .await?;
                if shared.reused {
                    verify_shared_password(&sub_pool, &user, &shared.lease, password).await?;
                }
                tracing::trace!(tx = %tx, connection_id = shared.lease.physical_id(), "handing out shared connection");
                return Ok(PooledConnection::shared(shared.lease, shared.context));
            }
        }

        let lease = self.lease(&runtime, &sub_pool, &user, password, true).await?;
        tracing::trace!(pool = %key, connection_id = lease.physical_id(), "handing out connection");
        Ok(PooledConnection::new(lease))
    }

    async fn lease(
        &self,
        runtime: &Runtime,
        sub_pool: &Arc<SubPool>,
        user: &UserKey,
        password: Option<&str>,
        track: bool,
    ) -> Result<Arc<Lease>> {
        if let Some(tracker) = &runtime.tracker {
            if tracker.config().remove_on_borrow && sub_pool.near_exhaustion() {
                let reclaimed = tracker.sweep().await;
                tracing::debug!(pool = %sub_pool.key(), reclaimed, "swept abandoned connections before borrow");
            }
        }

        let mut checkout = self.checkout(sub_pool, user, password).await?;

        let settings = self.config.read().resolve(user.username());
        if let Err(e) = apply_defaults(checkout.object_mut().connection_mut(), &settings).await {
            tracing::debug!(pool = %sub_pool.key(), error = %e, "failed to apply connection defaults");
            sub_pool.pool().invalidate(user, checkout).await;
            return Err(PoolError::Driver(e));
        }

        let tracker = runtime.tracker.as_ref().filter(|_| track);
        let connection_id = checkout.object().id();
        let lease = Lease::new(checkout, user.clone(), sub_pool, tracker);
        sub_pool.factory().bind(connection_id, &lease);
        if let Some(tracker) = tracker {
            tracker.track(&lease);
        }
        Ok(lease)
    }

    /// Borrow a connection opened with `password`, following a password
    /// change on the server if needed.
    async fn checkout(
        &self,
        sub_pool: &SubPool,
        user: &UserKey,
        password: Option<&str>,
    ) -> Result<Checkout<PooledObject>> {
        let factory = sub_pool.factory();
        for _ in 0..MAX_PASSWORD_RETRIES {
            let checkout = match sub_pool.pool().borrow(user).await {
                Ok(checkout) => checkout,
                Err(ObjectPoolError::Create(DriverError::AuthenticationFailed { .. }))
                    if factory.known_password(user).flatten().as_deref() != password =>
                {
                    // The known password was rejected; the requester's may be the new one.
                    factory.set_password(user, password);
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            if checkout.object().credentials().password_matches(password) {
                return Ok(checkout);
            }

            let credentials = checkout.object().credentials().with_password(password);
            match factory.test_open(&credentials).await {
                Ok(()) => {
                    tracing::info!(pool = %sub_pool.key(), user = %user, "password changed, discarding connection");
                    sub_pool.pool().invalidate(user, checkout).await;
                    factory.set_password(user, password);
                }
                Err(source) => {
                    sub_pool.pool().return_object(user, checkout).await;
                    return Err(PoolError::AuthenticationMismatch {
                        username: user.username().map(str::to_string),
                        source,
                    });
                }
            }
        }

        Err(PoolError::ConnectionAcquisition(format!(
            "could not obtain a connection for user {user} after {MAX_PASSWORD_RETRIES} password change attempts"
        )))
    }
}

impl Drop for DataSourceInner {
    fn drop(&mut self) {
        if let IdentityState::Frozen(runtime) = &*self.identity.lock() {
            runtime.stop_maintenance();
        }
    }
}

impl Runtime {
    fn stop_maintenance(&self) {
        if let Some(task) = self.maintenance.lock().take() {
            task.abort();
        }
    }
}

/// Check `password` against a connection already shared by a transaction.
///
/// The shared connection cannot be swapped for one opened with the new
/// password, so a differing password is checked against the server instead.
async fn verify_shared_password(
    sub_pool: &SubPool,
    user: &UserKey,
    lease: &Lease,
    password: Option<&str>,
) -> Result<()> {
    let factory = sub_pool.factory();
    let matches = match factory.known_password(user) {
        Some(known) => known.as_deref() == password,
        None => lease.credentials().password_matches(password),
    };
    if matches {
        return Ok(());
    }
    match factory.test_open(&lease.credentials().with_password(password)).await {
        Ok(()) => {
            tracing::info!(pool = %sub_pool.key(), user = %user, "password changed during transaction");
            factory.set_password(user, password);
            Ok(())
        }
        Err(source) => Err(PoolError::AuthenticationMismatch {
            username: user.username().map(str::to_string),
            source,
        }),
    }
}

async fn apply_defaults(
    conn: &mut dyn PhysicalConnection,
    settings: &PoolSettings,
) -> std::result::Result<(), DriverError> {
    if let Some(auto_commit) = settings.default_auto_commit {
        if conn.auto_commit() != auto_commit {
            conn.set_auto_commit(auto_commit).await?;
        }
    }
    if let Some(read_only) = settings.default_read_only {
        if conn.is_read_only() != read_only {
            conn.set_read_only(read_only).await?;
        }
    }
    if let Some(level) = settings.default_transaction_isolation {
        if conn.transaction_isolation() != level {
            conn.set_transaction_isolation(level).await?;
        }
    }
    Ok(())
}

/// Builder for [`DataSource`].
pub struct DataSourceBuilder {
    name: String,
    description: Option<String>,
    identity: Identity,
    config: LayeredConfig,
}

impl DataSourceBuilder {
    /// Create a builder for a data source called `name`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            identity: Identity::default(),
            config: LayeredConfig::default(),
        }
    }

    /// Open connections from `source`.
    #[must_use]
    pub fn connection_source(mut self, source: Arc<dyn ConnectionSource>) -> Self {
        self.identity.source = Some(SourceBinding::Attached(source));
        self
    }

    /// Look the connection source up by name.
    #[must_use]
    pub fn connection_source_name(
        mut self,
        name: impl Into<String>,
        naming: Arc<dyn NamingContext>,
    ) -> Self {
        self.identity.source = Some(SourceBinding::Named {
            name: name.into(),
            naming,
        });
        self
    }

    /// Set the description.
    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Enable abandoned connection tracking.
    #[must_use]
    pub fn abandoned(mut self, config: AbandonedConfig) -> Self {
        self.identity.abandoned = Some(config);
        self
    }

    /// Share connections within transactions of `manager`.
    #[must_use]
    pub fn transaction_manager(mut self, manager: Arc<dyn TransactionManager>) -> Self {
        self.identity.transaction_manager = Some(manager);
        self.identity.transaction_sharing = true;
        self
    }

    /// Enable or disable transaction-aware sharing.
    #[must_use]
    pub fn transaction_sharing(mut self, enabled: bool) -> Self {
        self.identity.transaction_sharing = enabled;
        self
    }

    /// Set the default pool settings.
    #[must_use]
    pub fn defaults(mut self, settings: PoolSettings) -> Self {
        self.config = self.config.with_defaults(settings);
        self
    }

    /// Give `username` its own sub-pool with `overrides`.
    #[must_use]
    pub fn per_user(mut self, username: &str, overrides: UserOverrides) -> Self {
        self.config = self.config.with_user(username, overrides);
        self
    }

    /// Build the data source.
    pub fn build(self) -> Result<DataSource> {
        if self.name.trim().is_empty() {
            return Err(PoolError::Configuration(
                "data source name must not be empty".into(),
            ));
        }
        self.config.validate()?;
        if let Some(abandoned) = &self.identity.abandoned {
            abandoned.validate()?;
        }
        Ok(DataSource::from_parts(
            self.name,
            self.description,
            self.identity,
            self.config,
        ))
    }
}

impl std::fmt::Debug for DataSourceBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataSourceBuilder")
            .field("name", &self.name)
            .field("source", &self.identity.source)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use cpds_pool::MaxWait;
    use cpds_testing::{MockConnectionSource, MockDatabase};

    fn data_source(db: &Arc<MockDatabase>) -> DataSource {
        DataSource::builder("test")
            .connection_source(MockConnectionSource::new(db))
            .defaults(PoolSettings::new().max_total(2).max_wait(MaxWait::FAIL_FAST))
            .build()
            .unwrap()
    }

    #[test]
    fn test_builder_rejects_invalid_settings() {
        let err = DataSource::builder("test")
            .defaults(PoolSettings::new().max_total(0))
            .build()
            .unwrap_err();
        assert!(matches!(err, PoolError::Configuration(_)));

        let err = DataSource::builder("  ").build().unwrap_err();
        assert!(matches!(err, PoolError::Configuration(_)));

        // Settings must survive a reference round trip, which counts in milliseconds.
        let err = DataSource::builder("test")
            .defaults(PoolSettings::new().min_evictable_idle_time(Duration::from_micros(1500)))
            .build()
            .unwrap_err();
        assert!(matches!(err, PoolError::Configuration(_)));
        let err = DataSource::builder("test")
            .abandoned(AbandonedConfig::new().timeout(Duration::from_micros(1500)))
            .build()
            .unwrap_err();
        assert!(matches!(err, PoolError::Configuration(_)));
        assert!(
            DataSource::new("test")
                .set_abandoned(Some(AbandonedConfig::new().timeout(Duration::from_micros(1))))
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_requires_connection_source() {
        let ds = DataSource::new("bare");
        let err = ds.get_connection().await.unwrap_err();
        assert!(matches!(err, PoolError::Configuration(_)));

        // Identity is not frozen by a failed request.
        let db = MockDatabase::new();
        ds.set_connection_source(MockConnectionSource::new(&db)).unwrap();
        ds.get_connection().await.unwrap().close().await.unwrap();
    }

    #[tokio::test]
    async fn test_sharing_requires_manager() {
        let db = MockDatabase::new();
        let ds = data_source(&db);
        ds.set_transaction_sharing(true).unwrap();
        let err = ds.get_connection().await.unwrap_err();
        assert!(matches!(err, PoolError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_identity_frozen_after_first_use() {
        let db = MockDatabase::new();
        let ds = data_source(&db);
        ds.get_connection().await.unwrap().close().await.unwrap();

        let err = ds
            .set_connection_source(MockConnectionSource::new(&db))
            .unwrap_err();
        assert!(matches!(err, PoolError::Configuration(_)));
        assert!(ds.set_abandoned(Some(AbandonedConfig::new())).is_err());

        // Pool settings stay adjustable.
        ds.set_defaults(PoolSettings::new().max_total(4)).unwrap();
        assert_eq!(ds.config().defaults().max_total, 4);
    }

    #[tokio::test]
    async fn test_invalid_overrides_rejected() {
        let db = MockDatabase::new();
        let ds = data_source(&db);
        let err = ds
            .set_user_overrides("alice", UserOverrides::new().max_total(0))
            .unwrap_err();
        assert!(matches!(err, PoolError::Configuration(_)));
        assert!(!ds.config().has_user(Some("alice")));
    }

    #[tokio::test]
    async fn test_defaults_applied_on_borrow() {
        let db = MockDatabase::new();
        let ds = data_source(&db);
        ds.set_defaults(
            PoolSettings::new()
                .max_total(2)
                .default_read_only(Some(true))
                .default_auto_commit(Some(false)),
        )
        .unwrap();

        let conn = ds.get_connection().await.unwrap();
        assert!(conn.is_read_only().await.unwrap());
        assert!(!conn.auto_commit().await.unwrap());
        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_data_source_rejects_requests() {
        let db = MockDatabase::new();
        let ds = data_source(&db);
        ds.get_connection().await.unwrap().close().await.unwrap();

        ds.close().await;
        ds.close().await;
        assert!(ds.is_closed());
        assert_eq!(db.open_connections(), 0);
        assert!(matches!(
            ds.get_connection().await.unwrap_err(),
            PoolError::Configuration(_)
        ));
    }
}
