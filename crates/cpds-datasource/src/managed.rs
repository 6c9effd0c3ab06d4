//! Transaction-aware connection sharing.
//!
//! Inside an external transaction every logical connection obtained from the
//! same sub-pool for the same user shares one physical connection and one
//! enlisted resource. The association lives in a [`TransactionContext`]
//! created on the first request and torn down by a completion callback.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use cpds_driver::{
    Synchronization, TransactionError, TransactionKey, TransactionManager, TransactionStatus,
    XaResource,
};
use parking_lot::Mutex;

use crate::connection::{Lease, LocalTransactionOp};
use crate::error::{PoolError, Result};
use crate::key::{PoolKey, UserKey};

/// The connections associated with one external transaction.
pub struct TransactionContext {
    tx: TransactionKey,
    leases: tokio::sync::Mutex<HashMap<(PoolKey, UserKey), Arc<Lease>>>,
    completed: AtomicBool,
}

impl TransactionContext {
    fn new(tx: TransactionKey) -> Self {
        Self {
            tx,
            leases: tokio::sync::Mutex::new(HashMap::new()),
            completed: AtomicBool::new(false),
        }
    }

    /// The transaction this context belongs to.
    #[must_use]
    pub fn key(&self) -> &TransactionKey {
        &self.tx
    }

    /// Whether the transaction has completed.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }

    async fn release_all(&self) {
        let leases: Vec<Arc<Lease>> = self.leases.lock().await.drain().map(|(_, l)| l).collect();
        for lease in leases {
            lease.release().await;
        }
    }

    fn detach_all(&self) {
        let Ok(mut leases) = self.leases.try_lock() else {
            return;
        };
        for (_, lease) in leases.drain() {
            lease.detach_now();
        }
    }
}

impl std::fmt::Debug for TransactionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionContext")
            .field("tx", &self.tx)
            .field("completed", &self.is_completed())
            .finish()
    }
}

/// A lease obtained for a transaction.
pub(crate) struct SharedLease {
    pub(crate) lease: Arc<Lease>,
    pub(crate) context: Arc<TransactionContext>,
    /// Whether the lease was already associated with the transaction, so the
    /// current request did not go through a pool checkout.
    pub(crate) reused: bool,
}

/// Maps active external transactions to their shared connections.
pub(crate) struct TransactionRegistry {
    manager: Arc<dyn TransactionManager>,
    contexts: Mutex<HashMap<TransactionKey, Arc<TransactionContext>>>,
}

impl TransactionRegistry {
    pub(crate) fn new(manager: Arc<dyn TransactionManager>) -> Arc<Self> {
        Arc::new(Self {
            manager,
            contexts: Mutex::new(HashMap::new()),
        })
    }

    pub(crate) fn current_transaction(&self) -> Option<TransactionKey> {
        self.manager.current_transaction()
    }

    /// Number of transactions that currently hold shared connections.
    pub(crate) fn active_transactions(&self) -> usize {
        self.contexts.lock().len()
    }

    fn context(self: &Arc<Self>, tx: &TransactionKey) -> Result<Arc<TransactionContext>> {
        let (ctx, created) = {
            let mut contexts = self.contexts.lock();
            match contexts.get(tx) {
                Some(ctx) => (Arc::clone(ctx), false),
                None => {
                    let ctx = Arc::new(TransactionContext::new(tx.clone()));
                    contexts.insert(tx.clone(), Arc::clone(&ctx));
                    (ctx, true)
                }
            }
        };

        if created {
            let sync = Arc::new(ContextSync {
                registry: Arc::downgrade(self),
            });
            if let Err(e) = self.manager.register_synchronization(tx, sync) {
                self.contexts.lock().remove(tx);
                return Err(PoolError::Enlistment(e));
            }
            tracing::debug!(tx = %tx, "transaction context created");
        }
        Ok(ctx)
    }

    /// Get the lease shared by `tx` for this sub-pool and user, borrowing and
    /// enlisting a new connection on first use.
    pub(crate) async fn shared_lease<F, Fut>(
        self: &Arc<Self>,
        tx: &TransactionKey,
        pool_key: &PoolKey,
        user_key: &UserKey,
        borrow: F,
    ) -> Result<SharedLease>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<Lease>>>,
    {
        let ctx = self.context(tx)?;
        let mut leases = ctx.leases.lock().await;
        if ctx.is_completed() {
            return Err(PoolError::ConnectionAcquisition(format!(
                "transaction {tx} has already completed"
            )));
        }

        let sharing_key = (pool_key.clone(), user_key.clone());
        if let Some(lease) = leases.get(&sharing_key) {
            if !lease.is_active() {
                return Err(PoolError::ConnectionAcquisition(format!(
                    "shared connection for transaction {tx} failed"
                )));
            }
            tracing::trace!(tx = %tx, connection_id = lease.physical_id(), "reusing shared connection");
            let lease = Arc::clone(lease);
            drop(leases);
            return Ok(SharedLease {
                lease,
                context: ctx,
                reused: true,
            });
        }

        let lease = borrow().await?;
        let resource: Arc<dyn XaResource> = match lease.xa_resource().await {
            Some(resource) => resource,
            None => Arc::new(LocalTransactionResource {
                lease: Arc::downgrade(&lease),
            }),
        };

        let error = match self.manager.enlist_resource(tx, resource).await {
            Ok(true) => None,
            Ok(false) => Some(TransactionError::Rejected("resource declined".into())),
            Err(e) => Some(e),
        };
        if let Some(e) = error {
            tracing::debug!(tx = %tx, connection_id = lease.physical_id(), error = %e, "enlistment failed, returning connection");
            lease.release().await;
            return Err(PoolError::Enlistment(e));
        }

        tracing::debug!(tx = %tx, pool = %pool_key, connection_id = lease.physical_id(), "connection enlisted");
        leases.insert(sharing_key, Arc::clone(&lease));
        drop(leases);
        Ok(SharedLease {
            lease,
            context: ctx,
            reused: false,
        })
    }

    fn complete(&self, tx: &TransactionKey, status: TransactionStatus) {
        let Some(ctx) = self.contexts.lock().remove(tx) else {
            return;
        };
        ctx.completed.store(true, Ordering::SeqCst);
        tracing::debug!(tx = %tx, ?status, "transaction completed, releasing shared connections");

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { ctx.release_all().await });
            }
            Err(_) => ctx.detach_all(),
        }
    }
}

impl std::fmt::Debug for TransactionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionRegistry")
            .field("active_transactions", &self.active_transactions())
            .finish()
    }
}

struct ContextSync {
    registry: Weak<TransactionRegistry>,
}

impl Synchronization for ContextSync {
    fn after_completion(&self, tx: &TransactionKey, status: TransactionStatus) {
        if let Some(registry) = self.registry.upgrade() {
            registry.complete(tx, status);
        }
    }
}

/// Drives a local transaction on a connection whose driver has no
/// transactional resource of its own.
struct LocalTransactionResource {
    lease: Weak<Lease>,
}

impl LocalTransactionResource {
    async fn run(&self, tx: &TransactionKey, op: LocalTransactionOp) -> std::result::Result<(), TransactionError> {
        let lease = self
            .lease
            .upgrade()
            .ok_or_else(|| TransactionError::NotActive(tx.to_string()))?;
        lease.local_transaction(op).await?;
        Ok(())
    }
}

#[async_trait]
impl XaResource for LocalTransactionResource {
    async fn start(&self, tx: &TransactionKey) -> std::result::Result<(), TransactionError> {
        self.run(tx, LocalTransactionOp::Begin).await
    }

    async fn commit(&self, tx: &TransactionKey) -> std::result::Result<(), TransactionError> {
        self.run(tx, LocalTransactionOp::Commit).await
    }

    async fn rollback(&self, tx: &TransactionKey) -> std::result::Result<(), TransactionError> {
        self.run(tx, LocalTransactionOp::Rollback).await
    }
}
