//! Pool of named locks in the KV store.
//!
//! A pool is the set of keys `<prefix>0 … <prefix>N-1`. Holding any one slot
//! counts as holding the pool, so N bounds how many holders run at once: 1 for
//! strict exclusion, more to cap concurrent sessions against a device.
//!
//! A slot is taken with a create-only transaction that attaches the key to a
//! fresh lease, so a crashed holder's slot frees itself once the lease lapses.
//! Holders that run longer than the TTL must call [`LockHandle::refresh`].

use rand::Rng;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info_span, warn, Instrument};

use crate::error::BatchError;
use crate::keys::lock_slot_key;
use crate::kv::{Compare, CompareOp, KvStore, LeaseId, TxnOp};
use crate::settings::WaitPolicy;

#[derive(Debug, Clone)]
pub struct LockPoolConfig {
    /// Slot keys are `<prefix><index>`
    pub prefix: String,
    pub size: u32,
    pub ttl_secs: i64,
    pub acquire_timeout: Duration,
    pub wait_policy: WaitPolicy,
}

/// Result of trying to take a slot.
#[derive(Debug)]
pub enum LockOutcome {
    /// A slot is held; release it with [`LockHandle::release`].
    Locked(LockHandle),
    /// Every slot was taken on this sweep.
    Busy,
    /// The caller reported the lock is no longer needed.
    Drained,
    /// The acquire timeout passed with every slot still taken.
    TimedOut,
}

#[derive(Clone)]
enum Held {
    Noop,
    Slot {
        store: Arc<dyn KvStore>,
        key: String,
        lease: LeaseId,
        holder: String,
    },
}

/// Ownership of one pool slot.
#[derive(Clone)]
pub struct LockHandle {
    held: Held,
}

impl std::fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.held {
            Held::Noop => write!(f, "LockHandle(noop)"),
            Held::Slot { key, lease, .. } => write!(f, "LockHandle({key}, lease {lease})"),
        }
    }
}

impl LockHandle {
    fn noop() -> Self {
        Self { held: Held::Noop }
    }

    /// Key of the held slot; empty for the no-op lock.
    pub fn key(&self) -> &str {
        match &self.held {
            Held::Noop => "",
            Held::Slot { key, .. } => key,
        }
    }

    /// Extend the slot's lease. Returns false if the lease already expired,
    /// in which case the slot may belong to someone else.
    pub async fn refresh(&self) -> Result<bool, BatchError> {
        match &self.held {
            Held::Noop => Ok(true),
            Held::Slot { store, lease, .. } => Ok(store.lease_keep_alive(*lease).await? > 0),
        }
    }

    /// Check that the slot key still exists and is still ours.
    pub async fn is_acquired(&self) -> Result<bool, BatchError> {
        match &self.held {
            Held::Noop => Ok(true),
            Held::Slot {
                store,
                key,
                lease,
                holder,
            } => Ok(store
                .get(key)
                .await?
                .is_some_and(|kv| kv.lease == *lease && kv.value == holder.as_bytes())),
        }
    }

    /// Give the slot back. Revoking the lease deletes the key only if it is
    /// still attached to our lease.
    pub async fn release(self) -> Result<(), BatchError> {
        match self.held {
            Held::Noop => Ok(()),
            Held::Slot {
                store, key, lease, ..
            } => {
                store.lease_revoke(lease).await?;
                debug!(lock_key = %key, "lock: released");
                Ok(())
            }
        }
    }
}

/// A pool of locks over `size` slots. With no store configured every acquire
/// succeeds immediately with a no-op handle.
pub struct PoolLock {
    store: Option<Arc<dyn KvStore>>,
    config: LockPoolConfig,
    next_slot: AtomicU32,
}

impl PoolLock {
    pub fn new(store: Option<Arc<dyn KvStore>>, config: LockPoolConfig) -> Self {
        Self {
            store,
            config,
            next_slot: AtomicU32::new(0),
        }
    }

    pub fn config(&self) -> &LockPoolConfig {
        &self.config
    }

    /// Make one non-blocking pass over every slot, starting from a rotating
    /// offset. Returns `Locked` or `Busy`.
    ///
    /// One lease backs the whole pass; it is revoked again when no slot
    /// could be taken.
    pub async fn try_acquire(&self) -> Result<LockOutcome, BatchError> {
        let Some(store) = &self.store else {
            return Ok(LockOutcome::Locked(LockHandle::noop()));
        };
        let size = self.config.size.max(1);
        let start = self.next_slot.fetch_add(1, Ordering::Relaxed) % size;
        let lease = store.lease_grant(self.config.ttl_secs).await?;
        let holder = uuid::Uuid::new_v4().to_string();
        for i in 0..size {
            let key = lock_slot_key(&self.config.prefix, (start + i) % size);
            let outcome = store
                .txn(
                    vec![Compare::create_revision(key.as_str(), CompareOp::Equal, 0)],
                    vec![TxnOp::put(key.as_str(), holder.as_bytes(), Some(lease))],
                    vec![],
                )
                .await;
            match outcome {
                Ok(o) if o.succeeded => {
                    debug!(lock_key = %key, lease, "lock: acquired");
                    return Ok(LockOutcome::Locked(LockHandle {
                        held: Held::Slot {
                            store: Arc::clone(store),
                            key,
                            lease,
                            holder,
                        },
                    }));
                }
                Ok(_) => {}
                Err(e) => {
                    if let Err(revoke_err) = store.lease_revoke(lease).await {
                        warn!(lock_key = %key, error = %revoke_err, "lock: failed to revoke unused lease");
                    }
                    return Err(e.into());
                }
            }
        }
        store.lease_revoke(lease).await?;
        Ok(LockOutcome::Busy)
    }

    /// Retry [`try_acquire`](Self::try_acquire) with jittered backoff until a
    /// slot is taken or the acquire timeout passes. Before every retry
    /// `still_needed` is consulted; once it returns false the wait ends with
    /// `Drained`.
    pub async fn acquire_while<F, Fut>(&self, mut still_needed: F) -> Result<LockOutcome, BatchError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool, BatchError>>,
    {
        let span = info_span!("lock.acquire", prefix = %self.config.prefix, size = self.config.size);
        self.acquire_loop(&mut still_needed).instrument(span).await
    }

    async fn acquire_loop<F, Fut>(&self, still_needed: &mut F) -> Result<LockOutcome, BatchError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool, BatchError>>,
    {
        let deadline = Instant::now() + self.config.acquire_timeout;
        let mut attempt: u32 = 0;
        loop {
            if let LockOutcome::Locked(handle) = self.try_acquire().await? {
                if attempt > 0 {
                    debug!(attempts = attempt, "lock: acquired after retries");
                }
                return Ok(LockOutcome::Locked(handle));
            }
            attempt = attempt.wrapping_add(1);
            let now = Instant::now();
            if now >= deadline {
                debug!(attempts = attempt, "lock: acquire timed out");
                return Ok(LockOutcome::TimedOut);
            }
            tokio::time::sleep(self.backoff().min(deadline - now)).await;
            if attempt % 8 == 0 {
                debug!(attempt, "lock: acquire retry");
            }
            if !still_needed().await? {
                debug!(attempts = attempt, "lock: no longer needed");
                return Ok(LockOutcome::Drained);
            }
        }
    }

    /// Wait for a slot with no early exit.
    pub async fn acquire(&self) -> Result<LockOutcome, BatchError> {
        self.acquire_while(|| async { Ok::<bool, BatchError>(true) })
            .await
    }

    /// Run `f` while holding a slot, releasing it afterwards whether `f`
    /// succeeded or not.
    pub async fn with_lock<F, Fut, T>(&self, f: F) -> Result<T, BatchError>
    where
        F: FnOnce(LockHandle) -> Fut,
        Fut: Future<Output = Result<T, BatchError>>,
    {
        let handle = match self.acquire().await? {
            LockOutcome::Locked(handle) => handle,
            _ => {
                return Err(BatchError::Timeout(format!(
                    "no free slot in lock pool {} after {:?}",
                    self.config.prefix, self.config.acquire_timeout
                )))
            }
        };
        let result = f(handle.clone()).await;
        if let Err(e) = handle.release().await {
            warn!(prefix = %self.config.prefix, error = %e, "lock: release failed; slot frees when its lease expires");
        }
        result
    }

    fn backoff(&self) -> Duration {
        let policy = self.config.wait_policy;
        let min = policy.min_backoff.as_millis() as u64;
        let max = (policy.max_backoff.as_millis() as u64).max(min);
        Duration::from_millis(rand::rng().random_range(min..=max))
    }
}
