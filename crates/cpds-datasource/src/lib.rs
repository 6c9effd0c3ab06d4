//! # cpds-datasource
//!
//! Pooling data sources with per-user sub-pools.
//!
//! A [`DataSource`] hands out logical connections backed by bounded pools of
//! physical connections. Users with their own configuration get a sub-pool of
//! their own; everybody else shares the default sub-pool, with connections
//! still kept apart per user inside it.
//!
//! ## Features
//!
//! - Lazily created sub-pools keyed by data source and user
//! - Validation on create, borrow, return and while idle
//! - Idle eviction and `min_idle` refill from a background task
//! - Password changes detected on borrow
//! - Abandoned connection tracking and reclamation
//! - Sharing of one physical connection within an external transaction
//! - Versioned, serializable configuration references
//!
//! ## Example
//!
//! ```rust,ignore
//! use cpds_datasource::{DataSource, PoolSettings, UserOverrides};
//! use cpds_pool::MaxWait;
//! use std::time::Duration;
//!
//! let ds = DataSource::builder("orders")
//!     .connection_source(source)
//!     .defaults(
//!         PoolSettings::new()
//!             .max_total(20)
//!             .max_wait(MaxWait::Bounded(Duration::from_secs(5)))
//!             .validation_query("SELECT 1"),
//!     )
//!     .per_user("reporting", UserOverrides::new().max_total(4))
//!     .build()?;
//!
//! let conn = ds.get_connection_as("reporting", "secret").await?;
//! let rows = conn.query("SELECT * FROM orders").await?;
//! conn.close().await?;
//!
//! let status = ds.status();
//! println!("Pool utilization: {:.1}%", status.utilization());
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod abandoned;
pub mod config;
pub mod connection;
pub mod datasource;
pub mod error;
pub mod factory;
pub mod key;
pub mod managed;
pub mod reference;
pub mod registry;

// Configuration
pub use config::{AbandonedConfig, LayeredConfig, PoolSettings, UserOverrides};

// Error types
pub use error::{PoolError, Result};

// Keys
pub use key::{PoolKey, UserKey, resolve_key};

// Facade
pub use datasource::{DataSource, DataSourceBuilder, DataSourceMetrics};
pub use reference::Reference;

// Connections and pools
pub use abandoned::AbandonedTracker;
pub use connection::{HandleState, PooledConnection};
pub use factory::{ConnectionFactory, PooledObject};
pub use managed::TransactionContext;
pub use registry::{ConnectionPool, PoolRegistry, SubPool};

pub use cpds_pool::{MaxWait, PoolMetrics, PoolStatus};
