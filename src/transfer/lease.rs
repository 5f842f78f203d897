//! Worker Lease
//!
//! At most one process may run a `TransferWorker` against a record store.
//! The right to do so is a row in `worker_lease` with an expiry; the holder
//! renews it on a heartbeat and any other process may take it over once it
//! has lapsed. Processes that fail to acquire it create records and queue
//! commands, and leave execution to the holder.

use std::time::Duration;

use tracing::{debug, info, warn};

use super::db::TransferDb;
use super::error::TransferError;

/// Lease row shared by every worker of one record store
pub const LEASE_NAME: &str = "transfer-worker";

pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(15);

const MIN_HEARTBEAT: Duration = Duration::from_millis(10);

/// Exclusive right to execute transfers of one record store
pub struct WorkerLease {
    db: TransferDb,
    holder: String,
    ttl: Duration,
}

impl WorkerLease {
    /// Try to become the store's worker; `None` while another process holds it
    pub async fn acquire(db: TransferDb, ttl: Duration) -> Result<Option<Self>, TransferError> {
        let holder = format!("{}-{}", std::process::id(), uuid::Uuid::new_v4());
        if !db.try_acquire_lease(LEASE_NAME, &holder, ttl).await? {
            debug!(holder = %holder, "Worker lease held elsewhere");
            return Ok(None);
        }

        info!(holder = %holder, ttl_ms = ttl.as_millis() as u64, "Worker lease acquired");
        Ok(Some(Self { db, holder, ttl }))
    }

    /// Holder of the live lease, if any
    pub async fn current_holder(db: &TransferDb) -> Result<Option<String>, TransferError> {
        db.lease_holder(LEASE_NAME).await
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Renewal period: three heartbeats per ttl
    pub fn heartbeat_interval(&self) -> Duration {
        (self.ttl / 3).max(MIN_HEARTBEAT)
    }

    /// Extend the lease; `false` once another process has taken it over
    pub async fn renew(&self) -> Result<bool, TransferError> {
        let renewed = self.db.renew_lease(LEASE_NAME, &self.holder, self.ttl).await?;
        if !renewed {
            warn!(holder = %self.holder, "Worker lease lost");
        }
        Ok(renewed)
    }

    /// Give the lease up so another process can take over at once
    pub async fn release(self) {
        match self.db.release_lease(LEASE_NAME, &self.holder).await {
            Ok(true) => info!(holder = %self.holder, "Worker lease released"),
            Ok(false) => debug!(holder = %self.holder, "Worker lease already gone"),
            Err(e) => warn!(holder = %self.holder, error = %e, "Failed to release worker lease"),
        }
    }
}
