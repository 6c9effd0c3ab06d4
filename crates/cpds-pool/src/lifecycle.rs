//! Object lifecycle management.
//!
//! A pool creates, checks and destroys its objects through a
//! [`PooledObjectFactory`]. Objects handed out by the pool travel inside a
//! [`Checkout`], which carries the bookkeeping the pool needs when the
//! object comes back.

use std::time::{Duration, Instant};

use async_trait::async_trait;

/// Creates, validates and destroys the objects held by a pool.
///
/// Every hook is invoked without any pool lock held, so implementations are
/// free to perform I/O.
#[async_trait]
pub trait PooledObjectFactory<K, T>: Send + Sync + 'static
where
    K: Send + Sync,
    T: Send,
{
    /// Error returned when creating or activating an object fails.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Create a new object for `key`.
    async fn make(&self, key: &K) -> Result<T, Self::Error>;

    /// Check whether `object` is still usable. Must not panic or propagate
    /// errors; failures are reported as `false`.
    async fn validate(&self, key: &K, object: &mut T) -> bool;

    /// Prepare an idle object for being handed out. An error causes the
    /// object to be destroyed.
    async fn activate(&self, _key: &K, _object: &mut T) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Prepare an object for being put back into the idle set. An error
    /// causes the object to be destroyed.
    async fn passivate(&self, _key: &K, _object: &mut T) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Release all resources held by `object`.
    async fn destroy(&self, key: &K, object: T);
}

/// Bookkeeping carried with every pooled object.
#[derive(Debug, Clone, Copy)]
pub struct ObjectMetadata {
    /// Unique id assigned by the pool.
    pub id: u64,
    /// When the object was created.
    pub created_at: Instant,
    /// When the object was last handed out.
    pub last_borrowed_at: Instant,
    /// How many times the object has been handed out.
    pub borrow_count: u64,
}

impl ObjectMetadata {
    pub(crate) fn new(id: u64) -> Self {
        let now = Instant::now();
        Self {
            id,
            created_at: now,
            last_borrowed_at: now,
            borrow_count: 0,
        }
    }

    /// Age of the object.
    #[must_use]
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Whether the object has outlived `max_lifetime`.
    #[must_use]
    pub fn is_expired(&self, max_lifetime: Option<Duration>) -> bool {
        max_lifetime.is_some_and(|max| self.age() > max)
    }
}

/// An object checked out of a pool.
///
/// A checkout is moved back into the pool by
/// [`KeyedObjectPool::return_object`](crate::KeyedObjectPool::return_object)
/// or [`KeyedObjectPool::invalidate`](crate::KeyedObjectPool::invalidate).
/// Because both take it by value, the pool's active count for a checkout is
/// released exactly once.
#[derive(Debug)]
pub struct Checkout<T> {
    object: T,
    metadata: ObjectMetadata,
}

impl<T> Checkout<T> {
    pub(crate) fn new(object: T, metadata: ObjectMetadata) -> Self {
        Self { object, metadata }
    }

    /// The pooled object.
    #[must_use]
    pub fn object(&self) -> &T {
        &self.object
    }

    /// The pooled object, mutably.
    pub fn object_mut(&mut self) -> &mut T {
        &mut self.object
    }

    /// The object's bookkeeping.
    #[must_use]
    pub fn metadata(&self) -> &ObjectMetadata {
        &self.metadata
    }

    /// Take the object out of the checkout.
    ///
    /// Only meaningful once the owning pool is gone; while it exists, hand
    /// the checkout back through `return_object`, `invalidate` or `detach`.
    #[must_use]
    pub fn into_object(self) -> T {
        self.object
    }

    pub(crate) fn into_parts(self) -> (T, ObjectMetadata) {
        (self.object, self.metadata)
    }
}

/// Result of checking one idle object during an eviction run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionOutcome {
    /// The object stays in the idle set.
    Kept,
    /// The object sat idle longer than the minimum evictable idle time.
    IdleTooLong,
    /// The object outlived its maximum lifetime.
    Expired,
    /// The object failed validation.
    Invalid,
}

impl EvictionOutcome {
    /// Whether the object was removed from the pool.
    #[must_use]
    pub fn is_evicted(&self) -> bool {
        !matches!(self, Self::Kept)
    }
}
