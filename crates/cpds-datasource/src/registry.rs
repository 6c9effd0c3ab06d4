//! Sub-pool registry.
//!
//! A data source keeps one sub-pool per [`PoolKey`]. Sub-pools are created
//! lazily on the first request for their key; concurrent first requests for
//! the same key create exactly one sub-pool.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use cpds_driver::ConnectionSource;
use cpds_pool::{KeyedObjectPool, PoolMetrics, PoolStatus};
use parking_lot::RwLock;

use crate::config::PoolSettings;
use crate::error::{PoolError, Result};
use crate::factory::{ConnectionFactory, PooledObject};
use crate::key::{PoolKey, UserKey};

const CREATION_STRIPES: usize = 16;

/// The object pool type backing a sub-pool.
pub type ConnectionPool = KeyedObjectPool<UserKey, PooledObject, ConnectionFactory>;

/// One pool of physical connections together with its factory.
///
/// Settings are fixed when the sub-pool is created.
pub struct SubPool {
    key: PoolKey,
    settings: PoolSettings,
    factory: Arc<ConnectionFactory>,
    pool: ConnectionPool,
}

impl SubPool {
    /// Create a sub-pool opening connections from `source`.
    pub fn new(key: PoolKey, source: Arc<dyn ConnectionSource>, settings: PoolSettings) -> Result<Self> {
        settings.validate()?;
        let factory = Arc::new(ConnectionFactory::new(key.clone(), source, &settings));
        let pool = KeyedObjectPool::new(settings.to_pool_config(), Arc::clone(&factory))
            .map_err(|e| PoolError::Configuration(e.to_string()))?;

        tracing::info!(
            pool = %key,
            max_total = settings.max_total,
            max_idle = settings.max_idle,
            min_idle = settings.min_idle,
            "sub-pool created"
        );
        Ok(Self {
            key,
            settings,
            factory,
            pool,
        })
    }

    /// Key of this sub-pool.
    #[must_use]
    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    /// Settings the sub-pool was created with.
    #[must_use]
    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// The connection factory.
    #[must_use]
    pub fn factory(&self) -> &Arc<ConnectionFactory> {
        &self.factory
    }

    /// The underlying object pool.
    #[must_use]
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> PoolStatus {
        self.pool.status()
    }

    /// Whether the pool is close enough to its limit that abandoned
    /// connections should be reclaimed before borrowing.
    #[must_use]
    pub fn near_exhaustion(&self) -> bool {
        let idle = i64::from(self.pool.num_idle());
        let active = i64::from(self.pool.num_active());
        idle < 2 && active > i64::from(self.settings.max_total) - 3
    }
}

impl std::fmt::Debug for SubPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubPool")
            .field("key", &self.key)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

/// All sub-pools of one data source.
pub struct PoolRegistry {
    pools: RwLock<HashMap<PoolKey, Arc<SubPool>>>,
    stripes: Vec<tokio::sync::Mutex<()>>,
}

impl Default for PoolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PoolRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            pools: RwLock::new(HashMap::new()),
            stripes: (0..CREATION_STRIPES)
                .map(|_| tokio::sync::Mutex::new(()))
                .collect(),
        }
    }

    /// The sub-pool registered under `key`.
    #[must_use]
    pub fn get(&self, key: &PoolKey) -> Option<Arc<SubPool>> {
        self.pools.read().get(key).cloned()
    }

    /// The sub-pool registered under `key`, creating it with `create` if it
    /// does not exist yet.
    ///
    /// Creation is serialized per key stripe so `create` runs at most once
    /// per key even under concurrent first requests. A failed creation
    /// registers nothing.
    pub async fn get_or_create<F, Fut>(&self, key: &PoolKey, create: F) -> Result<Arc<SubPool>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<SubPool>>,
    {
        if let Some(pool) = self.get(key) {
            return Ok(pool);
        }

        let _guard = self.stripe(key).lock().await;
        if let Some(pool) = self.get(key) {
            return Ok(pool);
        }

        let pool = Arc::new(create().await?);
        self.pools.write().insert(key.clone(), Arc::clone(&pool));
        Ok(pool)
    }

    fn stripe(&self, key: &PoolKey) -> &tokio::sync::Mutex<()> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.stripes[(hasher.finish() as usize) % self.stripes.len()]
    }

    /// Snapshot of all sub-pools.
    #[must_use]
    pub fn sub_pools(&self) -> Vec<Arc<SubPool>> {
        self.pools.read().values().cloned().collect()
    }

    /// Number of sub-pools.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pools.read().len()
    }

    /// Whether no sub-pool has been created yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pools.read().is_empty()
    }

    /// Combined status of every sub-pool.
    #[must_use]
    pub fn status(&self) -> PoolStatus {
        self.sub_pools()
            .iter()
            .fold(PoolStatus::default(), |mut total, pool| {
                total.merge(&pool.status());
                total
            })
    }

    /// Combined metrics of every sub-pool.
    #[must_use]
    pub fn metrics(&self) -> PoolMetrics {
        self.sub_pools()
            .iter()
            .fold(PoolMetrics::default(), |mut total, pool| {
                total.merge(&pool.pool().metrics());
                total
            })
    }

    /// Close every sub-pool. Idle connections are destroyed; borrowed ones
    /// are destroyed when they come back.
    pub async fn close_all(&self) {
        let pools: Vec<Arc<SubPool>> = self.pools.write().drain().map(|(_, p)| p).collect();
        for pool in pools {
            pool.pool().close().await;
            tracing::debug!(pool = %pool.key(), "sub-pool closed");
        }
    }
}

impl std::fmt::Debug for PoolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolRegistry")
            .field("sub_pools", &self.len())
            .finish()
    }
}
