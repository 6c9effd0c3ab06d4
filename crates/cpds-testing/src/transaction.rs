//! Mock transaction manager.
//!
//! Transactions are begun and completed explicitly by the test. The manager
//! tracks one "current" transaction, standing in for the thread association
//! a real transaction manager would maintain.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use async_trait::async_trait;
use cpds_driver::{
    Synchronization, TransactionError, TransactionKey, TransactionManager, TransactionStatus,
    XaResource,
};
use parking_lot::Mutex;

/// How the manager answers enlistment requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnlistmentMode {
    /// Accept every resource.
    Accept,
    /// Decline with `Ok(false)`.
    Decline,
    /// Fail with an error.
    Fail,
}

#[derive(Default)]
struct TransactionState {
    resources: Vec<Arc<dyn XaResource>>,
    synchronizations: Vec<Arc<dyn Synchronization>>,
}

/// In-memory transaction manager for tests.
pub struct MockTransactionManager {
    current: Mutex<Option<TransactionKey>>,
    transactions: Mutex<HashMap<TransactionKey, TransactionState>>,
    mode: AtomicU8,
}

impl Default for MockTransactionManager {
    fn default() -> Self {
        Self {
            current: Mutex::new(None),
            transactions: Mutex::new(HashMap::new()),
            mode: AtomicU8::new(EnlistmentMode::Accept as u8),
        }
    }
}

impl MockTransactionManager {
    /// Create a manager with no active transaction.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Begin a transaction and make it current.
    pub fn begin(&self) -> TransactionKey {
        let tx = TransactionKey::new(uuid::Uuid::new_v4().to_string());
        self.transactions
            .lock()
            .insert(tx.clone(), TransactionState::default());
        *self.current.lock() = Some(tx.clone());
        tracing::trace!(tx = %tx, "mock transaction started");
        tx
    }

    /// Make `tx` (or no transaction) current.
    pub fn set_current(&self, tx: Option<TransactionKey>) {
        *self.current.lock() = tx;
    }

    /// Choose how enlistment requests are answered.
    pub fn set_enlistment_mode(&self, mode: EnlistmentMode) {
        self.mode.store(mode as u8, Ordering::SeqCst);
    }

    /// Number of resources enlisted in `tx`.
    #[must_use]
    pub fn enlisted(&self, tx: &TransactionKey) -> usize {
        self.transactions
            .lock()
            .get(tx)
            .map_or(0, |state| state.resources.len())
    }

    /// Commit `tx`: commit every enlisted resource, then run the completion
    /// callbacks.
    pub async fn commit(&self, tx: &TransactionKey) -> Result<(), TransactionError> {
        self.complete(tx, true).await
    }

    /// Roll back `tx`.
    pub async fn rollback(&self, tx: &TransactionKey) -> Result<(), TransactionError> {
        self.complete(tx, false).await
    }

    async fn complete(&self, tx: &TransactionKey, commit: bool) -> Result<(), TransactionError> {
        let state = self
            .transactions
            .lock()
            .remove(tx)
            .ok_or_else(|| TransactionError::NotActive(tx.to_string()))?;
        {
            let mut current = self.current.lock();
            if current.as_ref() == Some(tx) {
                *current = None;
            }
        }

        let mut status = if commit {
            TransactionStatus::Committed
        } else {
            TransactionStatus::RolledBack
        };
        for resource in &state.resources {
            let result = if commit {
                resource.commit(tx).await
            } else {
                resource.rollback(tx).await
            };
            if let Err(e) = result {
                tracing::debug!(tx = %tx, error = %e, "resource failed to complete");
                status = TransactionStatus::Unknown;
            }
        }

        for sync in &state.synchronizations {
            sync.after_completion(tx, status);
        }
        Ok(())
    }

    fn mode(&self) -> EnlistmentMode {
        match self.mode.load(Ordering::SeqCst) {
            1 => EnlistmentMode::Decline,
            2 => EnlistmentMode::Fail,
            _ => EnlistmentMode::Accept,
        }
    }
}

#[async_trait]
impl TransactionManager for MockTransactionManager {
    fn current_transaction(&self) -> Option<TransactionKey> {
        self.current.lock().clone()
    }

    async fn enlist_resource(
        &self,
        tx: &TransactionKey,
        resource: Arc<dyn XaResource>,
    ) -> Result<bool, TransactionError> {
        match self.mode() {
            EnlistmentMode::Decline => return Ok(false),
            EnlistmentMode::Fail => {
                return Err(TransactionError::Rejected("enlistment disabled".into()));
            }
            EnlistmentMode::Accept => {}
        }
        if !self.transactions.lock().contains_key(tx) {
            return Err(TransactionError::NotActive(tx.to_string()));
        }

        resource.start(tx).await?;
        match self.transactions.lock().get_mut(tx) {
            Some(state) => {
                state.resources.push(resource);
                Ok(true)
            }
            None => Err(TransactionError::NotActive(tx.to_string())),
        }
    }

    fn register_synchronization(
        &self,
        tx: &TransactionKey,
        synchronization: Arc<dyn Synchronization>,
    ) -> Result<(), TransactionError> {
        let mut transactions = self.transactions.lock();
        let state = transactions
            .get_mut(tx)
            .ok_or_else(|| TransactionError::NotActive(tx.to_string()))?;
        state.synchronizations.push(synchronization);
        Ok(())
    }
}

impl std::fmt::Debug for MockTransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTransactionManager")
            .field("current", &*self.current.lock())
            .field("active", &self.transactions.lock().len())
            .finish()
    }
}
