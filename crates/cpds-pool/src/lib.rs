//! # cpds-pool
//!
//! Keyed object pool used as the backing store of every cpds sub-pool.
//!
//! Objects are grouped by key; the pool bounds the total number of objects
//! across all keys and the number of idle objects per key. Object creation,
//! validation and destruction are delegated to a [`PooledObjectFactory`].
//!
//! ## Features
//!
//! - Borrow with a configurable wait: fail fast, bounded or indefinite
//! - LIFO or FIFO reuse of idle objects
//! - Validation on create, on borrow and while idle
//! - Idle eviction and maximum object lifetime
//! - Capacity reuse across keys when the pool is full
//! - Counters for observability
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use cpds_pool::{KeyedObjectPool, MaxWait, PoolConfig};
//!
//! let config = PoolConfig::new()
//!     .max_total(20)
//!     .max_idle_per_key(5)
//!     .max_wait(MaxWait::Bounded(Duration::from_secs(5)));
//!
//! let pool = KeyedObjectPool::new(config, Arc::new(factory))?;
//!
//! let checkout = pool.borrow(&"reporting".to_string()).await?;
//! // Use checkout.object()...
//! pool.return_object(&"reporting".to_string(), checkout).await;
//!
//! let status = pool.status();
//! println!("Pool utilization: {:.1}%", status.utilization());
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod pool;

// Configuration
pub use config::{MaxWait, PoolConfig};

// Error types
pub use error::{ConfigError, ObjectPoolError};

// Pool types
pub use pool::{KeyedObjectPool, PoolMetrics, PoolStatus};

// Lifecycle management
pub use lifecycle::{Checkout, EvictionOutcome, ObjectMetadata, PooledObjectFactory};
