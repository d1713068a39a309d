//! Lease-based mutual exclusion for the autoscaling pass.
//!
//! A lock is a row in the `locks` table holding the current holder and an
//! expiry time. Claiming happens inside a redb write transaction, and redb
//! serialises writers, so the check-and-set is atomic for everything that
//! shares the database. Leases expire so a crashed holder cannot wedge the
//! cluster forever.
//!
//! Acquisition is bounded: [`DistributedLock::acquire`] polls until the
//! timeout elapses and then returns `None`. A busy lock is not an error.
//!
//! While a [`LockGuard`] lives, a background task renews its lease every
//! third of the TTL, so a pass that outlasts the TTL keeps the lock.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use redb::ReadableTable;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::{StateError, StateResult};
use crate::store::{StateStore, map_err};
use crate::tables::LOCKS;

/// Storage seam for lock leases.
///
/// `StateStore` implements this directly. A replicated store can provide the
/// same semantics to make the lock span machines.
pub trait LockBackend: Send + Sync {
    /// Claim `path` for `holder` if it is free or its lease expired.
    /// Returns whether the claim succeeded.
    fn try_claim(&self, path: &str, holder: &str, ttl: Duration) -> StateResult<bool>;

    /// Extend the lease on `path` to `ttl` from now if `holder` still owns it.
    /// Returns false when the lease is gone or belongs to someone else.
    fn renew(&self, path: &str, holder: &str, ttl: Duration) -> StateResult<bool>;

    /// Drop the lease on `path` if `holder` still owns it.
    fn release(&self, path: &str, holder: &str) -> StateResult<bool>;
}

/// A persisted lease.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct Lease {
    holder: String,
    acquired_at_ms: u64,
    expires_at_ms: u64,
}

impl LockBackend for StateStore {
    fn try_claim(&self, path: &str, holder: &str, ttl: Duration) -> StateResult<bool> {
        let now = epoch_millis();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let claimed;
        {
            let mut table = txn.open_table(LOCKS).map_err(map_err!(Table))?;
            let existing = table
                .get(path)
                .map_err(map_err!(Read))?
                .map(|guard| guard.value().to_vec());

            let free = match existing {
                None => true,
                Some(bytes) => match serde_json::from_slice::<Lease>(&bytes) {
                    Ok(lease) => lease.expires_at_ms <= now,
                    Err(e) => {
                        warn!(%path, error = %e, "discarding unreadable lock lease");
                        true
                    }
                },
            };

            if free {
                let lease = Lease {
                    holder: holder.to_string(),
                    acquired_at_ms: now,
                    expires_at_ms: now.saturating_add(ttl.as_millis() as u64),
                };
                let value = serde_json::to_vec(&lease).map_err(map_err!(Serialize))?;
                table
                    .insert(path, value.as_slice())
                    .map_err(map_err!(Write))?;
            }
            claimed = free;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(claimed)
    }

    fn renew(&self, path: &str, holder: &str, ttl: Duration) -> StateResult<bool> {
        let now = epoch_millis();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let renewed;
        {
            let mut table = txn.open_table(LOCKS).map_err(map_err!(Table))?;
            let owned = table
                .get(path)
                .map_err(map_err!(Read))?
                .and_then(|guard| serde_json::from_slice::<Lease>(guard.value()).ok())
                .filter(|lease| lease.holder == holder);

            if let Some(mut lease) = owned {
                lease.expires_at_ms = now.saturating_add(ttl.as_millis() as u64);
                let value = serde_json::to_vec(&lease).map_err(map_err!(Serialize))?;
                table
                    .insert(path, value.as_slice())
                    .map_err(map_err!(Write))?;
                renewed = true;
            } else {
                renewed = false;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(renewed)
    }

    fn release(&self, path: &str, holder: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let released;
        {
            let mut table = txn.open_table(LOCKS).map_err(map_err!(Table))?;
            let owned = table
                .get(path)
                .map_err(map_err!(Read))?
                .and_then(|guard| serde_json::from_slice::<Lease>(guard.value()).ok())
                .is_some_and(|lease| lease.holder == holder);

            if owned {
                table.remove(path).map_err(map_err!(Write))?;
            }
            released = owned;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(released)
    }
}

/// Bounded-timeout lock over a [`LockBackend`].
#[derive(Clone)]
pub struct DistributedLock {
    backend: Arc<dyn LockBackend>,
    ttl: Duration,
    poll_interval: Duration,
}

impl DistributedLock {
    /// Create a lock whose leases expire after `ttl`.
    pub fn new(backend: Arc<dyn LockBackend>, ttl: Duration) -> Self {
        Self {
            backend,
            ttl,
            poll_interval: Duration::from_millis(50),
        }
    }

    /// Override how often a busy lock is re-checked.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Try to acquire `path` within `timeout`.
    ///
    /// Returns `Ok(None)` when another holder kept the lock for the whole
    /// timeout. The returned guard releases the lease when dropped.
    pub async fn acquire(&self, path: &str, timeout: Duration) -> StateResult<Option<LockGuard>> {
        let holder = next_holder_id();
        let deadline = Instant::now() + timeout;

        loop {
            if self.backend.try_claim(path, &holder, self.ttl)? {
                debug!(%path, %holder, "lock acquired");
                let held = Arc::new(AtomicBool::new(true));
                let renewal = tokio::spawn(renew_lease(
                    Arc::clone(&self.backend),
                    path.to_string(),
                    holder.clone(),
                    self.ttl,
                    Arc::clone(&held),
                ));
                return Ok(Some(LockGuard {
                    backend: Arc::clone(&self.backend),
                    path: path.to_string(),
                    holder,
                    held,
                    renewal,
                    released: false,
                }));
            }

            let now = Instant::now();
            if now >= deadline {
                debug!(%path, timeout_ms = timeout.as_millis() as u64, "lock busy, giving up");
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }
}

/// Keep `holder`'s lease alive until the task is aborted or the lease is lost.
async fn renew_lease(
    backend: Arc<dyn LockBackend>,
    path: String,
    holder: String,
    ttl: Duration,
    held: Arc<AtomicBool>,
) {
    let period = (ttl / 3).max(Duration::from_millis(10));
    loop {
        tokio::time::sleep(period).await;
        match backend.renew(&path, &holder, ttl) {
            Ok(true) => trace!(%path, %holder, "lock lease renewed"),
            Ok(false) => {
                warn!(%path, %holder, "lock lease lost");
                held.store(false, Ordering::Release);
                return;
            }
            // Retried next period; the lease may still be valid.
            Err(e) => warn!(%path, error = %e, "failed to renew lock lease"),
        }
    }
}

/// Scoped ownership of a lock. Dropping it stops renewal and releases the
/// lease.
pub struct LockGuard {
    backend: Arc<dyn LockBackend>,
    path: String,
    holder: String,
    held: Arc<AtomicBool>,
    renewal: JoinHandle<()>,
    released: bool,
}

impl LockGuard {
    /// The lock path this guard holds.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The holder identity written into the lease.
    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// False once a renewal found the lease taken over or removed. Work
    /// under the lock should stop at the next safe point.
    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }

    /// Release explicitly, surfacing any store error.
    pub fn release(mut self) -> StateResult<()> {
        self.renewal.abort();
        self.released = true;
        self.backend.release(&self.path, &self.holder)?;
        debug!(path = %self.path, "lock released");
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.renewal.abort();
        if self.released {
            return;
        }
        match self.backend.release(&self.path, &self.holder) {
            Ok(_) => debug!(path = %self.path, "lock released"),
            Err(e) => warn!(path = %self.path, error = %e, "failed to release lock"),
        }
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("path", &self.path)
            .field("holder", &self.holder)
            .field("held", &self.is_held())
            .finish()
    }
}

/// Holder ids are unique per process and per acquisition attempt.
fn next_holder_id() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("pid-{}-{seq}", std::process::id())
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
