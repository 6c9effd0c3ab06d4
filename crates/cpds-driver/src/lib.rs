//! # cpds-driver
//!
//! Contracts for the collaborators a pooling data source talks to.
//!
//! The pool never speaks a wire protocol itself. Everything it needs from
//! the outside world is expressed here as a trait:
//!
//! - [`ConnectionSource`] opens physical connections with a set of
//!   [`Credentials`].
//! - [`PhysicalConnection`] is one open driver-level connection, including the
//!   event hook through which the driver reports fatal errors.
//! - [`NamingContext`] resolves a connection source by name at sub-pool
//!   creation time.
//! - [`TransactionManager`], [`XaResource`] and [`Synchronization`] describe
//!   the external transaction manager used for enlistment.
//!
//! ## Example
//!
//! ```rust,ignore
//! use cpds_driver::{Credentials, InMemoryNamingContext, NamingContext};
//!
//! let naming = InMemoryNamingContext::new();
//! naming.bind("jdbc/orders", source);
//!
//! let source = naming.lookup("jdbc/orders").await?;
//! let conn = source.open(&Credentials::new(Some("app"), Some("secret"))).await?;
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod connection;
pub mod credentials;
pub mod error;
pub mod isolation;
pub mod naming;
pub mod transaction;

pub use connection::{
    ConnectionEventListener, ConnectionId, ConnectionSource, PhysicalConnection, QueryResult,
    Statement,
};
pub use credentials::Credentials;
pub use error::{DriverError, NamingError, TransactionError};
pub use isolation::IsolationLevel;
pub use naming::{InMemoryNamingContext, NamingContext};
pub use transaction::{
    Synchronization, TransactionKey, TransactionManager, TransactionStatus, XaResource,
};
