//! Keyed object pool implementation.
//!
//! Idle objects are kept per key in a deque; newly returned objects go to the
//! back and the front always holds the longest-idle object. All counters live
//! under one lock together with the idle sets, so an object is never counted
//! twice or lost between the idle and active columns.

use std::collections::{HashMap, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::config::{MaxWait, PoolConfig};
use crate::error::{ConfigError, ObjectPoolError};
use crate::lifecycle::{Checkout, EvictionOutcome, ObjectMetadata, PooledObjectFactory};

/// A pool of objects grouped by key.
///
/// # Example
///
/// ```rust,ignore
/// let pool = KeyedObjectPool::new(PoolConfig::new().max_total(4), Arc::new(factory))?;
///
/// let checkout = pool.borrow(&key).await?;
/// pool.return_object(&key, checkout).await;
/// assert_eq!(pool.num_idle_for(&key), 1);
/// ```
pub struct KeyedObjectPool<K, T, F> {
    config: PoolConfig,
    factory: Arc<F>,
    state: Mutex<PoolState<K, T>>,
    /// Signalled whenever capacity or an idle object may have become available.
    available: Notify,
    next_object_id: AtomicU64,
    created_at: Instant,
    metrics: Mutex<PoolMetricsInner>,
}

struct IdleObject<T> {
    object: T,
    metadata: ObjectMetadata,
    idle_since: Instant,
}

struct KeyState<T> {
    idle: VecDeque<IdleObject<T>>,
    active: u32,
    /// Slots reserved for objects being created or examined by the evictor.
    pending: u32,
}

impl<T> Default for KeyState<T> {
    fn default() -> Self {
        Self {
            idle: VecDeque::new(),
            active: 0,
            pending: 0,
        }
    }
}

impl<T> KeyState<T> {
    fn is_unused(&self) -> bool {
        self.idle.is_empty() && self.active == 0 && self.pending == 0
    }
}

struct PoolState<K, T> {
    keys: HashMap<K, KeyState<T>>,
    /// Idle + active + pending across all keys.
    total: u32,
    closed: bool,
}

#[derive(Debug, Clone, Copy)]
enum Slot {
    Pending,
    Active,
}

impl<K: Eq + Hash + Clone, T> PoolState<K, T> {
    fn release(&mut self, key: &K, slot: Slot) {
        if let Some(entry) = self.keys.get_mut(key) {
            match slot {
                Slot::Pending => {
                    debug_assert!(entry.pending > 0);
                    entry.pending = entry.pending.saturating_sub(1);
                }
                Slot::Active => {
                    debug_assert!(entry.active > 0);
                    entry.active = entry.active.saturating_sub(1);
                }
            }
        }
        self.total = self.total.saturating_sub(1);
        self.prune(key);
    }

    fn prune(&mut self, key: &K) {
        if self.keys.get(key).is_some_and(KeyState::is_unused) {
            self.keys.remove(key);
        }
    }

    /// Remove the longest-idle object belonging to any key other than `key`.
    fn take_oldest_idle_except(&mut self, key: &K) -> Option<(K, IdleObject<T>)> {
        let victim_key = self
            .keys
            .iter()
            .filter(|(k, _)| *k != key)
            .filter_map(|(k, entry)| entry.idle.front().map(|idle| (k, idle.idle_since)))
            .min_by_key(|(_, since)| *since)
            .map(|(k, _)| k.clone())?;

        let victim = self.keys.get_mut(&victim_key)?.idle.pop_front()?;
        self.total = self.total.saturating_sub(1);
        self.prune(&victim_key);
        Some((victim_key, victim))
    }
}

enum Acquire<K, T> {
    Idle(IdleObject<T>),
    Create,
    CreateAfterEvicting(K, IdleObject<T>),
    Wait,
}

/// Releases a reserved slot if a borrow is abandoned half way, e.g. when the
/// borrowing future is dropped while the factory is still working.
struct SlotGuard<'a, K: Eq + Hash + Clone, T> {
    state: &'a Mutex<PoolState<K, T>>,
    available: &'a Notify,
    key: &'a K,
    slot: Slot,
    armed: bool,
}

impl<K: Eq + Hash + Clone, T> SlotGuard<'_, K, T> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl<K: Eq + Hash + Clone, T> Drop for SlotGuard<'_, K, T> {
    fn drop(&mut self) {
        if self.armed {
            self.state.lock().release(self.key, self.slot);
            self.available.notify_waiters();
        }
    }
}

/// Internal metrics tracking.
#[derive(Debug, Default)]
struct PoolMetricsInner {
    objects_created: u64,
    objects_destroyed: u64,
    borrows_successful: u64,
    borrows_failed: u64,
    validations_performed: u64,
    validations_failed: u64,
    evictions: u64,
}

impl<K, T, F> KeyedObjectPool<K, T, F>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
    T: Send + 'static,
    F: PooledObjectFactory<K, T>,
{
    /// Create a new pool with the given configuration and factory.
    pub fn new(config: PoolConfig, factory: Arc<F>) -> Result<Self, ConfigError> {
        config.validate()?;

        tracing::debug!(
            max_total = config.max_total,
            max_idle_per_key = config.max_idle_per_key,
            max_wait = %config.max_wait,
            "object pool created"
        );

        Ok(Self {
            config,
            factory,
            state: Mutex::new(PoolState {
                keys: HashMap::new(),
                total: 0,
                closed: false,
            }),
            available: Notify::new(),
            next_object_id: AtomicU64::new(1),
            created_at: Instant::now(),
            metrics: Mutex::new(PoolMetricsInner::default()),
        })
    }

    /// Borrow an object for `key`.
    ///
    /// Returns an idle object if one is available, otherwise creates a new one
    /// if the pool has capacity. When the pool is full, waits according to
    /// [`PoolConfig::max_wait`] and fails with
    /// [`ObjectPoolError::Exhausted`] once the wait elapses.
    pub async fn borrow(&self, key: &K) -> Result<Checkout<T>, ObjectPoolError<F::Error>> {
        let deadline = match self.config.max_wait {
            MaxWait::Indefinite => None,
            MaxWait::Bounded(wait) => Some(tokio::time::Instant::now() + wait),
        };

        let result = self.borrow_until(key, deadline).await;

        let mut metrics = self.metrics.lock();
        match &result {
            Ok(_) => metrics.borrows_successful += 1,
            Err(_) => metrics.borrows_failed += 1,
        }
        result
    }

    async fn borrow_until(
        &self,
        key: &K,
        deadline: Option<tokio::time::Instant>,
    ) -> Result<Checkout<T>, ObjectPoolError<F::Error>> {
        loop {
            // Register interest before inspecting state so a release between
            // the check and the wait is not missed.
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_acquire(key)? {
                Acquire::Idle(idle) => {
                    if let Some(checkout) = self.activate_idle(key, idle).await {
                        return Ok(checkout);
                    }
                }
                Acquire::Create => return self.create(key).await,
                Acquire::CreateAfterEvicting(victim_key, victim) => {
                    tracing::debug!(
                        key = ?victim_key,
                        object_id = victim.metadata.id,
                        "destroying idle object to make room for another key"
                    );
                    self.destroy_object(&victim_key, victim.object).await;
                    return self.create(key).await;
                }
                Acquire::Wait => {
                    tracing::trace!(key = ?key, "pool at capacity, waiting");
                    match deadline {
                        None => notified.await,
                        Some(deadline) => {
                            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                                return Err(ObjectPoolError::Exhausted {
                                    max_wait: self.config.max_wait,
                                });
                            }
                        }
                    }
                }
            }
        }
    }

    fn try_acquire(&self, key: &K) -> Result<Acquire<K, T>, ObjectPoolError<F::Error>> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.closed {
            return Err(ObjectPoolError::Closed);
        }

        let entry = state.keys.entry(key.clone()).or_default();
        let idle = if self.config.lifo {
            entry.idle.pop_back()
        } else {
            entry.idle.pop_front()
        };
        if let Some(idle) = idle {
            entry.active += 1;
            return Ok(Acquire::Idle(idle));
        }

        if state.total < self.config.max_total {
            entry.pending += 1;
            state.total += 1;
            return Ok(Acquire::Create);
        }

        if let Some((victim_key, victim)) = state.take_oldest_idle_except(key) {
            state.keys.entry(key.clone()).or_default().pending += 1;
            state.total += 1;
            return Ok(Acquire::CreateAfterEvicting(victim_key, victim));
        }

        state.prune(key);
        Ok(Acquire::Wait)
    }

    /// Prepare an idle object for hand-out. Returns `None` if the object had
    /// to be destroyed; its slot has been released in that case.
    async fn activate_idle(&self, key: &K, idle: IdleObject<T>) -> Option<Checkout<T>> {
        let guard = self.slot_guard(key, Slot::Active);
        let IdleObject {
            mut object,
            mut metadata,
            ..
        } = idle;

        let usable = if metadata.is_expired(self.config.max_lifetime) {
            tracing::debug!(key = ?key, object_id = metadata.id, "idle object exceeded max lifetime");
            false
        } else if let Err(e) = self.factory.activate(key, &mut object).await {
            tracing::debug!(key = ?key, object_id = metadata.id, error = %e, "failed to activate idle object");
            false
        } else if self.config.test_on_borrow {
            self.validate_object(key, &mut object).await
        } else {
            true
        };

        if !usable {
            drop(guard);
            self.destroy_object(key, object).await;
            return None;
        }

        guard.disarm();
        metadata.last_borrowed_at = Instant::now();
        metadata.borrow_count += 1;
        Some(Checkout::new(object, metadata))
    }

    async fn create(&self, key: &K) -> Result<Checkout<T>, ObjectPoolError<F::Error>> {
        let guard = self.slot_guard(key, Slot::Pending);

        let mut object = match self.factory.make(key).await {
            Ok(object) => object,
            Err(e) => {
                tracing::debug!(key = ?key, error = %e, "failed to create pooled object");
                return Err(ObjectPoolError::Create(e));
            }
        };

        if self.config.test_on_create && !self.validate_object(key, &mut object).await {
            drop(guard);
            self.destroy_object(key, object).await;
            return Err(ObjectPoolError::Validation);
        }

        if let Err(e) = self.factory.activate(key, &mut object).await {
            drop(guard);
            self.destroy_object(key, object).await;
            return Err(ObjectPoolError::Create(e));
        }

        let id = self.next_object_id.fetch_add(1, Ordering::Relaxed);
        let mut metadata = ObjectMetadata::new(id);
        metadata.borrow_count = 1;

        guard.disarm();
        {
            let mut state = self.state.lock();
            let entry = state.keys.entry(key.clone()).or_default();
            entry.pending = entry.pending.saturating_sub(1);
            entry.active += 1;
        }
        self.metrics.lock().objects_created += 1;

        tracing::trace!(key = ?key, object_id = id, "created pooled object");
        Ok(Checkout::new(object, metadata))
    }

    /// Put a borrowed object back into the idle set of `key`.
    ///
    /// The object is destroyed instead if passivation fails, it has outlived
    /// its maximum lifetime, the idle set is full or the pool is closed.
    pub async fn return_object(&self, key: &K, checkout: Checkout<T>) {
        let (mut object, metadata) = checkout.into_parts();

        let keep = if metadata.is_expired(self.config.max_lifetime) {
            false
        } else {
            match self.factory.passivate(key, &mut object).await {
                Ok(()) => true,
                Err(e) => {
                    tracing::debug!(key = ?key, object_id = metadata.id, error = %e, "failed to passivate object");
                    false
                }
            }
        };

        let rejected = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let closed = state.closed;
            let max_idle = self.config.max_idle_per_key as usize;
            let entry = state.keys.entry(key.clone()).or_default();
            debug_assert!(entry.active > 0);
            entry.active = entry.active.saturating_sub(1);

            if keep && !closed && entry.idle.len() < max_idle {
                entry.idle.push_back(IdleObject {
                    object,
                    metadata,
                    idle_since: Instant::now(),
                });
                None
            } else {
                state.total = state.total.saturating_sub(1);
                state.prune(key);
                Some(object)
            }
        };
        self.available.notify_waiters();

        if let Some(object) = rejected {
            self.destroy_object(key, object).await;
        }
    }

    /// Destroy a borrowed object instead of returning it.
    pub async fn invalidate(&self, key: &K, checkout: Checkout<T>) {
        let (object, metadata) = checkout.into_parts();
        tracing::trace!(key = ?key, object_id = metadata.id, "invalidating pooled object");
        self.state.lock().release(key, Slot::Active);
        self.available.notify_waiters();
        self.destroy_object(key, object).await;
    }

    /// Remove a borrowed object from the pool's accounting without running the
    /// factory's destroy hook, handing ownership back to the caller.
    ///
    /// Used where the object cannot be destroyed asynchronously, for example
    /// during a synchronous drop without a runtime.
    pub fn detach(&self, key: &K, checkout: Checkout<T>) -> T {
        let (object, _) = checkout.into_parts();
        self.state.lock().release(key, Slot::Active);
        self.available.notify_waiters();
        self.metrics.lock().objects_destroyed += 1;
        object
    }

    /// Run the factory's validation on `object`, recording the outcome.
    pub async fn validate_object(&self, key: &K, object: &mut T) -> bool {
        let valid = self.factory.validate(key, object).await;
        let mut metrics = self.metrics.lock();
        metrics.validations_performed += 1;
        if !valid {
            metrics.validations_failed += 1;
        }
        valid
    }

    async fn destroy_object(&self, key: &K, object: T) {
        self.factory.destroy(key, object).await;
        self.metrics.lock().objects_destroyed += 1;
    }

    fn slot_guard<'a>(&'a self, key: &'a K, slot: Slot) -> SlotGuard<'a, K, T> {
        SlotGuard {
            state: &self.state,
            available: &self.available,
            key,
            slot,
            armed: true,
        }
    }

    /// Run one eviction pass over every key.
    ///
    /// At most [`PoolConfig::num_tests_per_eviction_run`] of the longest-idle
    /// objects are examined per key. Returns the number of objects evicted.
    pub async fn evict(&self) -> usize {
        let mut evicted = 0;
        for key in self.keys() {
            evicted += self.evict_key(&key).await;
        }
        if evicted > 0 {
            self.metrics.lock().evictions += evicted as u64;
            tracing::debug!(evicted, "eviction run finished");
        }
        evicted
    }

    async fn evict_key(&self, key: &K) -> usize {
        let candidates: Vec<IdleObject<T>> = {
            let mut state = self.state.lock();
            let Some(entry) = state.keys.get_mut(key) else {
                return 0;
            };
            let count = entry
                .idle
                .len()
                .min(self.config.num_tests_per_eviction_run as usize);
            let taken: Vec<_> = entry.idle.drain(..count).collect();
            entry.pending += taken.len() as u32;
            taken
        };

        let mut kept = Vec::new();
        let mut evicted = 0;
        for mut idle in candidates {
            let outcome = self.examine_idle(key, &mut idle).await;
            if outcome.is_evicted() {
                tracing::trace!(key = ?key, object_id = idle.metadata.id, outcome = ?outcome, "evicting idle object");
                self.state.lock().release(key, Slot::Pending);
                self.available.notify_waiters();
                self.destroy_object(key, idle.object).await;
                evicted += 1;
            } else {
                kept.push(idle);
            }
        }

        if !kept.is_empty() {
            let rejected: Vec<T> = {
                let mut guard = self.state.lock();
                let state = &mut *guard;
                let closed = state.closed;
                let entry = state.keys.entry(key.clone()).or_default();
                entry.pending = entry.pending.saturating_sub(kept.len() as u32);
                if closed {
                    state.total = state.total.saturating_sub(kept.len() as u32);
                    state.prune(key);
                    kept.into_iter().map(|idle| idle.object).collect()
                } else {
                    // Restore the original age order at the front of the deque.
                    for idle in kept.into_iter().rev() {
                        entry.idle.push_front(idle);
                    }
                    Vec::new()
                }
            };
            self.available.notify_waiters();
            for object in rejected {
                self.destroy_object(key, object).await;
            }
        }

        evicted
    }

    async fn examine_idle(&self, key: &K, idle: &mut IdleObject<T>) -> EvictionOutcome {
        if idle.metadata.is_expired(self.config.max_lifetime) {
            return EvictionOutcome::Expired;
        }
        if idle.idle_since.elapsed() >= self.config.min_evictable_idle_time {
            return EvictionOutcome::IdleTooLong;
        }
        if !self.config.test_while_idle {
            return EvictionOutcome::Kept;
        }

        if self.factory.activate(key, &mut idle.object).await.is_err() {
            return EvictionOutcome::Invalid;
        }
        if !self.validate_object(key, &mut idle.object).await {
            return EvictionOutcome::Invalid;
        }
        if self.factory.passivate(key, &mut idle.object).await.is_err() {
            return EvictionOutcome::Invalid;
        }
        EvictionOutcome::Kept
    }

    /// Create idle objects for `key` until [`PoolConfig::min_idle_per_key`] is
    /// reached or the pool is full. Returns the number of objects created.
    pub async fn ensure_min_idle(&self, key: &K) -> usize {
        let mut created = 0;
        loop {
            let reserve = {
                let mut guard = self.state.lock();
                let state = &mut *guard;
                if state.closed || state.total >= self.config.max_total {
                    false
                } else {
                    let entry = state.keys.entry(key.clone()).or_default();
                    if entry.idle.len() + (entry.pending as usize)
                        < self.config.min_idle_per_key as usize
                    {
                        entry.pending += 1;
                        state.total += 1;
                        true
                    } else {
                        state.prune(key);
                        false
                    }
                }
            };
            if !reserve {
                break;
            }

            let guard = self.slot_guard(key, Slot::Pending);
            match self.factory.make(key).await {
                Ok(object) => {
                    guard.disarm();
                    let id = self.next_object_id.fetch_add(1, Ordering::Relaxed);
                    {
                        let mut state = self.state.lock();
                        let entry = state.keys.entry(key.clone()).or_default();
                        entry.pending = entry.pending.saturating_sub(1);
                        entry.idle.push_back(IdleObject {
                            object,
                            metadata: ObjectMetadata::new(id),
                            idle_since: Instant::now(),
                        });
                    }
                    self.metrics.lock().objects_created += 1;
                    self.available.notify_waiters();
                    created += 1;
                }
                Err(e) => {
                    tracing::warn!(key = ?key, error = %e, "failed to create idle object");
                    break;
                }
            }
        }
        created
    }

    /// Destroy every idle object. Borrowed objects are unaffected.
    pub async fn clear(&self) -> usize {
        let drained: Vec<(K, T)> = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let mut drained = Vec::new();
            for (key, entry) in state.keys.iter_mut() {
                drained.extend(entry.idle.drain(..).map(|idle| (key.clone(), idle.object)));
            }
            state.total = state.total.saturating_sub(drained.len() as u32);
            state.keys.retain(|_, entry| !entry.is_unused());
            drained
        };
        self.available.notify_waiters();

        let count = drained.len();
        for (key, object) in drained {
            self.destroy_object(&key, object).await;
        }
        count
    }

    /// Close the pool.
    ///
    /// Idle objects are destroyed immediately; borrowed objects are destroyed
    /// when they come back. Waiting and future borrows fail with
    /// [`ObjectPoolError::Closed`]. Closing twice is a no-op.
    pub async fn close(&self) {
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
        }
        self.available.notify_waiters();
        let destroyed = self.clear().await;
        tracing::debug!(destroyed, "object pool closed");
    }

    /// Check if the pool is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Number of borrowed objects across all keys.
    #[must_use]
    pub fn num_active(&self) -> u32 {
        self.state.lock().keys.values().map(|entry| entry.active).sum()
    }

    /// Number of idle objects across all keys.
    #[must_use]
    pub fn num_idle(&self) -> u32 {
        self.state
            .lock()
            .keys
            .values()
            .map(|entry| entry.idle.len() as u32)
            .sum()
    }

    /// Number of borrowed objects for `key`.
    #[must_use]
    pub fn num_active_for(&self, key: &K) -> u32 {
        self.state
            .lock()
            .keys
            .get(key)
            .map_or(0, |entry| entry.active)
    }

    /// Number of idle objects for `key`.
    #[must_use]
    pub fn num_idle_for(&self, key: &K) -> u32 {
        self.state
            .lock()
            .keys
            .get(key)
            .map_or(0, |entry| entry.idle.len() as u32)
    }

    /// Keys that currently have idle, borrowed or pending objects.
    #[must_use]
    pub fn keys(&self) -> Vec<K> {
        self.state.lock().keys.keys().cloned().collect()
    }

    /// Get the current pool status.
    #[must_use]
    pub fn status(&self) -> PoolStatus {
        let state = self.state.lock();
        let (idle, active) = state.keys.values().fold((0, 0), |(idle, active), entry| {
            (idle + entry.idle.len() as u32, active + entry.active)
        });
        PoolStatus {
            idle,
            active,
            total: state.total,
            max: self.config.max_total,
        }
    }

    /// Get pool metrics.
    #[must_use]
    pub fn metrics(&self) -> PoolMetrics {
        let inner = self.metrics.lock();
        PoolMetrics {
            objects_created: inner.objects_created,
            objects_destroyed: inner.objects_destroyed,
            borrows_successful: inner.borrows_successful,
            borrows_failed: inner.borrows_failed,
            validations_performed: inner.validations_performed,
            validations_failed: inner.validations_failed,
            evictions: inner.evictions,
            uptime: self.created_at.elapsed(),
        }
    }

    /// Get the pool configuration.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// The factory backing this pool.
    #[must_use]
    pub fn factory(&self) -> &Arc<F> {
        &self.factory
    }
}

impl<K, T, F> std::fmt::Debug for KeyedObjectPool<K, T, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("KeyedObjectPool")
            .field("max_total", &self.config.max_total)
            .field("total", &state.total)
            .field("keys", &state.keys.len())
            .field("closed", &state.closed)
            .finish()
    }
}

/// Status information about the pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStatus {
    /// Number of idle objects available.
    pub idle: u32,
    /// Number of objects currently borrowed.
    pub active: u32,
    /// Total number of objects, including ones being created.
    pub total: u32,
    /// Maximum allowed objects.
    pub max: u32,
}

impl PoolStatus {
    /// Calculate the utilization percentage.
    #[must_use]
    pub fn utilization(&self) -> f64 {
        if self.max == 0 {
            return 0.0;
        }
        (self.active as f64 / self.max as f64) * 100.0
    }

    /// Check if the pool is at capacity.
    #[must_use]
    pub fn is_at_capacity(&self) -> bool {
        self.total >= self.max
    }

    /// Add another status to this one, for aggregating several pools.
    pub fn merge(&mut self, other: &PoolStatus) {
        self.idle += other.idle;
        self.active += other.active;
        self.total += other.total;
        self.max += other.max;
    }
}

/// Metrics collected from the pool.
#[derive(Debug, Clone, Default)]
pub struct PoolMetrics {
    /// Total objects created since pool start.
    pub objects_created: u64,
    /// Total objects destroyed since pool start.
    pub objects_destroyed: u64,
    /// Successful borrows.
    pub borrows_successful: u64,
    /// Failed borrows (timeouts, creation failures, pool closed).
    pub borrows_failed: u64,
    /// Validations performed.
    pub validations_performed: u64,
    /// Validations that failed.
    pub validations_failed: u64,
    /// Idle objects removed by eviction runs.
    pub evictions: u64,
    /// Time since pool creation.
    pub uptime: Duration,
}

impl PoolMetrics {
    /// Calculate borrow success rate (0.0 to 1.0).
    #[must_use]
    pub fn borrow_success_rate(&self) -> f64 {
        let total = self.borrows_successful + self.borrows_failed;
        if total == 0 {
            return 1.0;
        }
        self.borrows_successful as f64 / total as f64
    }

    /// Calculate validation success rate (0.0 to 1.0).
    #[must_use]
    pub fn validation_success_rate(&self) -> f64 {
        if self.validations_performed == 0 {
            return 1.0;
        }
        let successful = self.validations_performed - self.validations_failed;
        successful as f64 / self.validations_performed as f64
    }

    /// Add another pool's counters to these. Uptime keeps the larger value.
    pub fn merge(&mut self, other: &PoolMetrics) {
        self.objects_created += other.objects_created;
        self.objects_destroyed += other.objects_destroyed;
        self.borrows_successful += other.borrows_successful;
        self.borrows_failed += other.borrows_failed;
        self.validations_performed += other.validations_performed;
        self.validations_failed += other.validations_failed;
        self.evictions += other.evictions;
        self.uptime = self.uptime.max(other.uptime);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_status_utilization() {
        let status = PoolStatus {
            idle: 5,
            active: 5,
            total: 10,
            max: 20,
        };
        assert!((status.utilization() - 25.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_pool_status_at_capacity() {
        let status = PoolStatus {
            idle: 0,
            active: 10,
            total: 10,
            max: 10,
        };
        assert!(status.is_at_capacity());

        let status2 = PoolStatus {
            idle: 5,
            active: 5,
            total: 10,
            max: 20,
        };
        assert!(!status2.is_at_capacity());
    }

    #[test]
    fn test_pool_status_merge() {
        let mut status = PoolStatus {
            idle: 1,
            active: 2,
            total: 3,
            max: 4,
        };
        status.merge(&PoolStatus {
            idle: 1,
            active: 1,
            total: 2,
            max: 4,
        });
        assert_eq!(
            status,
            PoolStatus {
                idle: 2,
                active: 3,
                total: 5,
                max: 8,
            }
        );
    }

    #[test]
    fn test_pool_metrics_success_rates() {
        let metrics = PoolMetrics {
            objects_created: 10,
            objects_destroyed: 2,
            borrows_successful: 90,
            borrows_failed: 10,
            validations_performed: 100,
            validations_failed: 5,
            evictions: 0,
            uptime: Duration::from_secs(3600),
        };

        assert!((metrics.borrow_success_rate() - 0.9).abs() < f64::EPSILON);
        assert!((metrics.validation_success_rate() - 0.95).abs() < f64::EPSILON);
    }

    #[test]
    fn test_pool_metrics_defaults_to_full_success() {
        let metrics = PoolMetrics::default();
        assert!((metrics.borrow_success_rate() - 1.0).abs() < f64::EPSILON);
        assert!((metrics.validation_success_rate() - 1.0).abs() < f64::EPSILON);
    }
}
