//! External transaction manager contract.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::TransactionError;

/// Opaque identity of an external transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionKey(String);

impl TransactionKey {
    /// Create a key from the transaction manager's identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identifier as a string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransactionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Outcome of a completed transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// The transaction committed.
    Committed,
    /// The transaction rolled back (explicitly or on timeout).
    RolledBack,
    /// The outcome is unknown (heuristic or failed completion).
    Unknown,
}

/// A transactional resource that can take part in an external transaction.
#[async_trait]
pub trait XaResource: Send + Sync {
    /// Associate the resource with `tx`.
    async fn start(&self, tx: &TransactionKey) -> Result<(), TransactionError>;

    /// Commit the work done on behalf of `tx`.
    async fn commit(&self, tx: &TransactionKey) -> Result<(), TransactionError>;

    /// Roll back the work done on behalf of `tx`.
    async fn rollback(&self, tx: &TransactionKey) -> Result<(), TransactionError>;
}

/// Callback invoked when a transaction completes.
pub trait Synchronization: Send + Sync {
    /// Called after commit or rollback has finished.
    fn after_completion(&self, tx: &TransactionKey, status: TransactionStatus);
}

/// The transaction manager the pool enlists connections with.
#[async_trait]
pub trait TransactionManager: Send + Sync {
    /// The transaction associated with the caller, if any.
    fn current_transaction(&self) -> Option<TransactionKey>;

    /// Enlist `resource` in `tx`.
    ///
    /// Returns `Ok(false)` when the manager declines the resource without an
    /// error.
    async fn enlist_resource(
        &self,
        tx: &TransactionKey,
        resource: Arc<dyn XaResource>,
    ) -> Result<bool, TransactionError>;

    /// Register a completion callback for `tx`.
    fn register_synchronization(
        &self,
        tx: &TransactionKey,
        synchronization: Arc<dyn Synchronization>,
    ) -> Result<(), TransactionError>;
}
