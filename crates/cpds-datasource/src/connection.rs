//! Logical connection handles.
//!
//! A [`PooledConnection`] is what callers get from a data source. It delegates
//! to a physical connection held in a [`Lease`]; the lease owns the pool
//! checkout, so whoever takes the checkout out of the lease (a close, an
//! abandoned sweep, a fatal error) is the only party that can give it back to
//! the pool.
//!
//! Handles move from `Active` to either `Returned` or `Invalid` and never back.

use std::backtrace::Backtrace;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use cpds_driver::{
    ConnectionId, Credentials, DriverError, IsolationLevel, PhysicalConnection, QueryResult,
    Statement, TransactionKey, XaResource,
};
use cpds_pool::{Checkout, PooledObjectFactory};
use parking_lot::Mutex;
use tokio::sync::MutexGuard;

use crate::abandoned::AbandonedTracker;
use crate::error::{PoolError, Result};
use crate::factory::{ConnectionFactory, PooledObject};
use crate::key::UserKey;
use crate::managed::TransactionContext;
use crate::registry::SubPool;

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_LEASE_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle state of a logical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    /// The handle may be used.
    Active,
    /// The handle was closed and its connection went back to the pool.
    Returned,
    /// The connection was destroyed after a fatal error or reclamation.
    Invalid,
}

const ACTIVE: u8 = 0;
const RETURNED: u8 = 1;
const INVALID: u8 = 2;

type Slot = Option<Checkout<PooledObject>>;

/// Operations the local-transaction adapter drives on a shared connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LocalTransactionOp {
    Begin,
    Commit,
    Rollback,
}

/// One checkout of a physical connection from a sub-pool.
pub(crate) struct Lease {
    id: u64,
    physical_id: ConnectionId,
    user_key: UserKey,
    credentials: Credentials,
    slot: tokio::sync::Mutex<Slot>,
    sub_pool: Weak<SubPool>,
    /// Destroys the connection if the sub-pool is gone by the time it comes back.
    factory: Arc<ConnectionFactory>,
    tracker: Weak<AbandonedTracker>,
    last_used: Mutex<Instant>,
    state: AtomicU8,
    borrow_site: Option<Backtrace>,
}

impl Lease {
    pub(crate) fn new(
        checkout: Checkout<PooledObject>,
        user_key: UserKey,
        sub_pool: &Arc<SubPool>,
        tracker: Option<&Arc<AbandonedTracker>>,
    ) -> Arc<Self> {
        let borrow_site = tracker
            .filter(|t| t.config().log_abandoned)
            .map(|_| Backtrace::force_capture());
        Arc::new(Self {
            id: NEXT_LEASE_ID.fetch_add(1, Ordering::Relaxed),
            physical_id: checkout.object().id(),
            user_key,
            credentials: checkout.object().credentials().clone(),
            slot: tokio::sync::Mutex::new(Some(checkout)),
            sub_pool: Arc::downgrade(sub_pool),
            factory: Arc::clone(sub_pool.factory()),
            tracker: tracker.map_or_else(Weak::new, Arc::downgrade),
            last_used: Mutex::new(Instant::now()),
            state: AtomicU8::new(ACTIVE),
            borrow_site,
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn physical_id(&self) -> ConnectionId {
        self.physical_id
    }

    pub(crate) fn user_key(&self) -> &UserKey {
        &self.user_key
    }

    /// Credentials the physical connection was opened with.
    pub(crate) fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub(crate) fn state(&self) -> HandleState {
        match self.state.load(Ordering::SeqCst) {
            ACTIVE => HandleState::Active,
            RETURNED => HandleState::Returned,
            _ => HandleState::Invalid,
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        self.state.load(Ordering::SeqCst) == ACTIVE
    }

    fn transition(&self, to: u8) {
        let _ = self
            .state
            .compare_exchange(ACTIVE, to, Ordering::SeqCst, Ordering::SeqCst);
    }

    pub(crate) fn touch(&self) {
        *self.last_used.lock() = Instant::now();
    }

    pub(crate) fn last_used(&self) -> Instant {
        *self.last_used.lock()
    }

    pub(crate) fn idle_time(&self) -> Duration {
        self.last_used().elapsed()
    }

    pub(crate) fn borrow_site(&self) -> Option<&Backtrace> {
        self.borrow_site.as_ref()
    }

    /// Take the checkout if nobody else holds or has taken it.
    pub(crate) fn try_claim(&self) -> Option<Checkout<PooledObject>> {
        self.slot.try_lock().ok()?.take()
    }

    fn untrack(&self) {
        if let Some(tracker) = self.tracker.upgrade() {
            tracker.untrack(self.id);
        }
    }

    /// Return the connection to its sub-pool, or destroy it if it cannot be
    /// reused. A no-op if the checkout was already taken.
    pub(crate) async fn release(&self) {
        let Some(mut checkout) = self.slot.lock().await.take() else {
            return;
        };
        self.untrack();

        let Some(sub_pool) = self.sub_pool.upgrade() else {
            self.transition(RETURNED);
            self.destroy_orphan(checkout).await;
            return;
        };

        if self.prepare_for_reuse(&sub_pool, &mut checkout).await {
            self.transition(RETURNED);
            sub_pool.pool().return_object(&self.user_key, checkout).await;
        } else {
            self.transition(INVALID);
            sub_pool.pool().invalidate(&self.user_key, checkout).await;
        }
    }

    async fn prepare_for_reuse(&self, sub_pool: &SubPool, checkout: &mut Checkout<PooledObject>) -> bool {
        let object = checkout.object_mut();
        if object.is_fatal() {
            return false;
        }

        let conn = object.connection_mut();
        if !conn.auto_commit() {
            if let Err(e) = reset_auto_commit(conn).await {
                tracing::debug!(pool = %sub_pool.key(), connection_id = self.physical_id, error = %e, "failed to restore auto-commit");
                return false;
            }
        }

        if let Err(e) = object.restore_session().await {
            tracing::debug!(pool = %sub_pool.key(), connection_id = self.physical_id, error = %e, "failed to restore session state");
            return false;
        }

        if sub_pool.settings().test_on_return
            && !sub_pool.pool().validate_object(&self.user_key, object).await
        {
            tracing::debug!(pool = %sub_pool.key(), connection_id = self.physical_id, "connection failed validation on return");
            return false;
        }
        true
    }

    /// Destroy a claimed checkout.
    pub(crate) async fn discard(&self, checkout: Checkout<PooledObject>) {
        self.transition(INVALID);
        self.untrack();
        match self.sub_pool.upgrade() {
            Some(sub_pool) => sub_pool.pool().invalidate(&self.user_key, checkout).await,
            None => self.destroy_orphan(checkout).await,
        }
    }

    /// Close a connection whose sub-pool was closed while it was handed out.
    async fn destroy_orphan(&self, checkout: Checkout<PooledObject>) {
        tracing::debug!(pool = %self.factory.pool_key(), connection_id = self.physical_id, "sub-pool gone, destroying connection");
        self.factory
            .destroy(&self.user_key, checkout.into_object())
            .await;
    }

    /// Release the checkout without the runtime: pool accounting is updated
    /// and the physical connection is dropped unclosed.
    pub(crate) fn detach_now(&self) {
        let Some(checkout) = self.try_claim() else {
            return;
        };
        self.transition(RETURNED);
        self.untrack();
        if let Some(sub_pool) = self.sub_pool.upgrade() {
            drop(sub_pool.pool().detach(&self.user_key, checkout));
        }
        tracing::debug!(connection_id = self.physical_id, "connection detached outside of a runtime");
    }

    /// Reclaim the connection after the driver reported a fatal error.
    ///
    /// If a call is in flight the slot is busy; that call observes the fatal
    /// flag when it completes and discards the connection itself.
    pub(crate) fn reclaim_after_error(self: &Arc<Self>) {
        let Some(checkout) = self.try_claim() else {
            return;
        };
        self.transition(INVALID);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let lease = Arc::clone(self);
                handle.spawn(async move { lease.discard(checkout).await });
            }
            Err(_) => {
                self.untrack();
                if let Some(sub_pool) = self.sub_pool.upgrade() {
                    drop(sub_pool.pool().detach(&self.user_key, checkout));
                }
            }
        }
    }

    pub(crate) async fn xa_resource(&self) -> Option<Arc<dyn XaResource>> {
        self.slot
            .lock()
            .await
            .as_ref()
            .and_then(|checkout| checkout.object().connection().xa_resource())
    }

    pub(crate) async fn local_transaction(&self, op: LocalTransactionOp) -> std::result::Result<(), DriverError> {
        let mut slot = self.slot.lock().await;
        let Some(checkout) = slot.as_mut() else {
            return Err(DriverError::Closed);
        };
        let object = checkout.object_mut();
        let conn = object.connection_mut();
        let result = match op {
            LocalTransactionOp::Begin => {
                if conn.auto_commit() {
                    conn.set_auto_commit(false).await
                } else {
                    Ok(())
                }
            }
            LocalTransactionOp::Commit => match conn.commit().await {
                Ok(()) => conn.set_auto_commit(true).await,
                Err(e) => Err(e),
            },
            LocalTransactionOp::Rollback => reset_auto_commit(conn).await,
        };
        if let Err(e) = &result {
            if e.is_fatal() {
                object.mark_fatal();
            }
        }
        result
    }
}

async fn reset_auto_commit(conn: &mut dyn PhysicalConnection) -> std::result::Result<(), DriverError> {
    conn.rollback().await?;
    conn.set_auto_commit(true).await
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("id", &self.id)
            .field("physical_id", &self.physical_id)
            .field("user", &self.user_key)
            .field("state", &self.state())
            .finish()
    }
}

fn physical(slot: &mut Slot) -> Result<&mut dyn PhysicalConnection> {
    slot.as_mut()
        .map(|checkout| checkout.object_mut().connection_mut())
        .ok_or(PoolError::ConnectionClosed)
}

/// A logical connection handed out by a data source.
///
/// Dropping an open handle closes it in the background.
pub struct PooledConnection {
    handle_id: u64,
    lease: Arc<Lease>,
    closed: AtomicBool,
    transaction: Option<Arc<TransactionContext>>,
}

impl PooledConnection {
    pub(crate) fn new(lease: Arc<Lease>) -> Self {
        Self::with_transaction(lease, None)
    }

    pub(crate) fn shared(lease: Arc<Lease>, transaction: Arc<TransactionContext>) -> Self {
        Self::with_transaction(lease, Some(transaction))
    }

    fn with_transaction(lease: Arc<Lease>, transaction: Option<Arc<TransactionContext>>) -> Self {
        Self {
            handle_id: NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed),
            lease,
            closed: AtomicBool::new(false),
            transaction,
        }
    }

    /// Identifier of this logical handle.
    #[must_use]
    pub fn handle_id(&self) -> u64 {
        self.handle_id
    }

    /// Identifier of the underlying physical connection.
    #[must_use]
    pub fn physical_id(&self) -> ConnectionId {
        self.lease.physical_id()
    }

    /// The external transaction this handle is enlisted in.
    #[must_use]
    pub fn transaction(&self) -> Option<&TransactionKey> {
        self.transaction.as_ref().map(|ctx| ctx.key())
    }

    /// When the handle was last used for real work.
    #[must_use]
    pub fn last_used(&self) -> Instant {
        self.lease.last_used()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> HandleState {
        match self.lease.state() {
            HandleState::Active if self.logically_closed() => HandleState::Returned,
            state => state,
        }
    }

    /// Whether the handle can no longer be used.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state() != HandleState::Active
    }

    fn logically_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
            || self
                .transaction
                .as_ref()
                .is_some_and(|ctx| ctx.is_completed())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(PoolError::ConnectionClosed);
        }
        Ok(())
    }

    fn ensure_not_enlisted(&self, operation: &'static str) -> Result<()> {
        if self.transaction.is_some() {
            return Err(PoolError::EnlistedOperation(operation));
        }
        Ok(())
    }

    async fn acquire(&self, genuine_use: bool) -> Result<MutexGuard<'_, Slot>> {
        self.ensure_open()?;
        if genuine_use {
            self.lease.touch();
        }
        let slot = self.lease.slot.lock().await;
        if slot.is_none() || self.is_closed() {
            return Err(PoolError::ConnectionClosed);
        }
        Ok(slot)
    }

    /// Finish a delegated call, discarding the connection if it turned out
    /// to be broken.
    async fn complete<R>(
        &self,
        mut slot: MutexGuard<'_, Slot>,
        result: std::result::Result<R, DriverError>,
    ) -> Result<R> {
        let fatal = matches!(&result, Err(e) if e.is_fatal())
            || slot.as_ref().is_some_and(|c| c.object().is_fatal());
        if fatal {
            if let Some(checkout) = slot.take() {
                drop(slot);
                checkout.object().mark_fatal();
                tracing::warn!(handle_id = self.handle_id, connection_id = self.physical_id(), "discarding connection after fatal error");
                self.lease.discard(checkout).await;
            }
        }
        result.map_err(PoolError::Driver)
    }

    /// Run a query.
    pub async fn query(&self, sql: &str) -> Result<QueryResult> {
        let mut slot = self.acquire(true).await?;
        let result = physical(&mut slot)?.query(sql).await;
        self.complete(slot, result).await
    }

    /// Run a statement and return the number of affected rows.
    pub async fn execute(&self, sql: &str) -> Result<u64> {
        let mut slot = self.acquire(true).await?;
        let result = physical(&mut slot)?.execute(sql).await;
        self.complete(slot, result).await
    }

    /// Prepare a statement.
    pub async fn prepare(&self, sql: &str) -> Result<Statement> {
        let mut slot = self.acquire(true).await?;
        let result = physical(&mut slot)?.prepare(sql).await;
        self.complete(slot, result).await
    }

    /// Commit the current local transaction.
    pub async fn commit(&self) -> Result<()> {
        self.ensure_open()?;
        self.ensure_not_enlisted("commit")?;
        let mut slot = self.acquire(true).await?;
        let result = physical(&mut slot)?.commit().await;
        self.complete(slot, result).await
    }

    /// Roll back the current local transaction.
    pub async fn rollback(&self) -> Result<()> {
        self.ensure_open()?;
        self.ensure_not_enlisted("rollback")?;
        let mut slot = self.acquire(true).await?;
        let result = physical(&mut slot)?.rollback().await;
        self.complete(slot, result).await
    }

    /// Driver-level liveness check.
    pub async fn is_valid(&self, timeout: Duration) -> Result<bool> {
        let mut slot = self.acquire(false).await?;
        let result = physical(&mut slot)?.is_valid(timeout).await;
        self.complete(slot, result).await
    }

    /// Current auto-commit mode.
    pub async fn auto_commit(&self) -> Result<bool> {
        let mut slot = self.acquire(false).await?;
        Ok(physical(&mut slot)?.auto_commit())
    }

    /// Change auto-commit mode.
    pub async fn set_auto_commit(&self, enabled: bool) -> Result<()> {
        self.ensure_open()?;
        self.ensure_not_enlisted("changing auto-commit")?;
        let mut slot = self.acquire(false).await?;
        let result = physical(&mut slot)?.set_auto_commit(enabled).await;
        self.complete(slot, result).await
    }

    /// Current read-only flag.
    pub async fn is_read_only(&self) -> Result<bool> {
        let mut slot = self.acquire(false).await?;
        Ok(physical(&mut slot)?.is_read_only())
    }

    /// Change the read-only flag.
    pub async fn set_read_only(&self, read_only: bool) -> Result<()> {
        let mut slot = self.acquire(false).await?;
        let result = physical(&mut slot)?.set_read_only(read_only).await;
        self.complete(slot, result).await
    }

    /// Current transaction isolation level.
    pub async fn transaction_isolation(&self) -> Result<IsolationLevel> {
        let mut slot = self.acquire(false).await?;
        Ok(physical(&mut slot)?.transaction_isolation())
    }

    /// Change the transaction isolation level.
    pub async fn set_transaction_isolation(&self, level: IsolationLevel) -> Result<()> {
        let mut slot = self.acquire(false).await?;
        let result = physical(&mut slot)?.set_transaction_isolation(level).await;
        self.complete(slot, result).await
    }

    /// Close the handle and give the connection back to the pool.
    ///
    /// Closing twice is a no-op. Closing a handle enlisted in a transaction
    /// only closes the handle; the connection stays with the transaction
    /// until it completes.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if self.transaction.is_some() {
            tracing::trace!(handle_id = self.handle_id, "closed handle on shared connection");
            return Ok(());
        }
        tracing::trace!(handle_id = self.handle_id, connection_id = self.physical_id(), "closing connection");
        self.lease.release().await;
        Ok(())
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if self.transaction.is_some() || self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let lease = Arc::clone(&self.lease);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { lease.release().await });
            }
            Err(_) => lease.detach_now(),
        }
    }
}

impl PartialEq for PooledConnection {
    fn eq(&self, other: &Self) -> bool {
        self.physical_id() == other.physical_id()
    }
}

impl Eq for PooledConnection {}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("handle_id", &self.handle_id)
            .field("physical_id", &self.physical_id())
            .field("state", &self.state())
            .field("transaction", &self.transaction())
            .finish()
    }
}
