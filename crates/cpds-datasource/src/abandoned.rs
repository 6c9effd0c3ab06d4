//! Abandoned connection tracking.
//!
//! Every handed-out connection is traced until it is closed. A sweep reclaims
//! connections that have not been used for longer than the configured timeout.
//! Reclaiming a connection means claiming its lease slot; only one party can
//! ever succeed, so concurrent sweeps never release the same connection twice.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::config::AbandonedConfig;
use crate::connection::Lease;

/// Tracks handed-out connections of one data source.
pub struct AbandonedTracker {
    config: AbandonedConfig,
    traces: Mutex<HashMap<u64, Arc<Lease>>>,
    reclaimed: AtomicU64,
}

impl AbandonedTracker {
    /// Create a tracker.
    #[must_use]
    pub fn new(config: AbandonedConfig) -> Self {
        Self {
            config,
            traces: Mutex::new(HashMap::new()),
            reclaimed: AtomicU64::new(0),
        }
    }

    /// The tracker configuration.
    #[must_use]
    pub fn config(&self) -> &AbandonedConfig {
        &self.config
    }

    /// Number of connections currently traced.
    #[must_use]
    pub fn traced(&self) -> usize {
        self.traces.lock().len()
    }

    /// Total number of connections reclaimed so far.
    #[must_use]
    pub fn reclaimed(&self) -> u64 {
        self.reclaimed.load(Ordering::Relaxed)
    }

    pub(crate) fn track(&self, lease: &Arc<Lease>) {
        self.traces.lock().insert(lease.id(), Arc::clone(lease));
    }

    pub(crate) fn untrack(&self, lease_id: u64) {
        self.traces.lock().remove(&lease_id);
    }

    /// Reclaim every traced connection idle for longer than the timeout.
    ///
    /// Returns the number of connections this sweep reclaimed.
    pub async fn sweep(&self) -> usize {
        let snapshot: Vec<Arc<Lease>> = self.traces.lock().values().cloned().collect();

        let mut reclaimed = 0;
        for lease in snapshot {
            if lease.idle_time() <= self.config.timeout {
                continue;
            }
            let Some(checkout) = lease.try_claim() else {
                continue;
            };

            self.untrack(lease.id());
            self.log_reclaimed(&lease);
            lease.discard(checkout).await;
            reclaimed += 1;
        }

        if reclaimed > 0 {
            self.reclaimed.fetch_add(reclaimed as u64, Ordering::Relaxed);
        }
        reclaimed
    }

    fn log_reclaimed(&self, lease: &Lease) {
        let idle_ms = lease.idle_time().as_millis() as u64;
        match lease.borrow_site().filter(|_| self.config.log_abandoned) {
            Some(site) => tracing::warn!(
                connection_id = lease.physical_id(),
                user = %lease.user_key(),
                idle_ms,
                borrow_site = %site,
                "reclaiming abandoned connection"
            ),
            None => tracing::warn!(
                connection_id = lease.physical_id(),
                user = %lease.user_key(),
                idle_ms,
                "reclaiming abandoned connection"
            ),
        }
    }
}

impl std::fmt::Debug for AbandonedTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AbandonedTracker")
            .field("config", &self.config)
            .field("traced", &self.traced())
            .field("reclaimed", &self.reclaimed())
            .finish()
    }
}
