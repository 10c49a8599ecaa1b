//! Per-switch work queue in the KV store.
//!
//! # Key layout
//!
//! - `<switch>/input/<uuid>`: a pending batch, leased so abandoned work expires
//! - `<switch>/output/<uuid>`: a finished batch carrying `result` or `error`
//! - `<switch>/execute_lock<i>`: slots of the switch's execution lock pool
//!
//! # Invariants
//!
//! - Queue order is input-key create revision, which the store assigns in
//!   arrival order.
//! - A batch is pending (input key only) or completed (output key only). One
//!   transaction writes the output and deletes the input, so no reader sees
//!   both or neither.
//! - A completed batch is never overwritten: recording is conditional on the
//!   output key not existing yet.
//!
//! # Early exit while waiting for the lock
//!
//! [`SwitchQueue::acquire_execution_lock`] gives up without error as soon as
//! every batch up to its bound has been completed by someone else. The check
//! and the lock attempt are not atomic, so a batch enqueued between them can
//! be left for later. That is accepted: every new batch gets a later revision
//! and triggers a worker of its own, which covers it.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::batch::{Batch, QueueItem};
use crate::error::BatchError;
use crate::keys::{execute_lock_prefix, input_key, input_prefix, lock_slot_key, output_key};
use crate::kv::{Compare, CompareOp, KvStore, RangeOptions, TxnOp};
use crate::lock::{LockHandle, LockOutcome, LockPoolConfig, PoolLock};
use crate::settings::{BatchConfig, WaitPolicy};

/// The queue of one switch.
pub struct SwitchQueue {
    switch: String,
    store: Arc<dyn KvStore>,
    batch_ttl_secs: i64,
    result_ttl_secs: i64,
    lock_pool_size: u32,
}

impl SwitchQueue {
    pub fn new(switch: impl Into<String>, store: Arc<dyn KvStore>, cfg: &BatchConfig) -> Self {
        Self {
            switch: switch.into(),
            store,
            batch_ttl_secs: cfg.batch_ttl_secs,
            result_ttl_secs: cfg.result_ttl_secs,
            lock_pool_size: cfg.lock_pool_size,
        }
    }

    pub fn switch(&self) -> &str {
        &self.switch
    }

    /// Add a batch to the queue. The input key is created under a fresh lease
    /// and must not already exist; the transaction's revision becomes the
    /// batch's position in the queue.
    pub async fn enqueue(&self, cmds: Vec<String>) -> Result<QueueItem, BatchError> {
        let batch = Batch::new(&self.switch, cmds);
        let payload = batch.encode()?;
        let lease = self.store.lease_grant(self.batch_ttl_secs).await?;
        let outcome = self
            .store
            .txn(
                vec![Compare::create_revision(
                    batch.input_key.as_str(),
                    CompareOp::Equal,
                    0,
                )],
                vec![TxnOp::put(batch.input_key.as_str(), payload, Some(lease))],
                vec![],
            )
            .await?;
        if !outcome.succeeded {
            if let Err(e) = self.store.lease_revoke(lease).await {
                warn!(switch = %self.switch, error = %e, "enqueue: failed to revoke unused lease");
            }
            return Err(BatchError::Submission(format!(
                "input key {} already exists",
                batch.input_key
            )));
        }
        debug!(switch = %self.switch, uuid = %batch.uuid, revision = outcome.revision, cmds = batch.cmds.len(), "enqueued batch");
        Ok(QueueItem {
            uuid: batch.uuid,
            create_revision: outcome.revision,
        })
    }

    /// Take a batch back out of the queue before any worker ran it. The
    /// delete only happens while the input key is still the one `item`
    /// created. Returns false if the batch was already taken or expired.
    pub async fn withdraw(&self, item: &QueueItem) -> Result<bool, BatchError> {
        let key = input_key(&self.switch, &item.uuid);
        let outcome = self
            .store
            .txn(
                vec![Compare::create_revision(
                    key.as_str(),
                    CompareOp::Equal,
                    item.create_revision,
                )],
                vec![TxnOp::delete(key.as_str())],
                vec![],
            )
            .await?;
        if outcome.succeeded {
            debug!(switch = %self.switch, uuid = %item.uuid, "withdrew batch");
        }
        Ok(outcome.succeeded)
    }

    /// Block until the batch's result is written or `timeout` passes.
    pub async fn wait_for_result(
        &self,
        item: &QueueItem,
        timeout: Duration,
    ) -> Result<String, BatchError> {
        let key = output_key(&self.switch, &item.uuid);
        let Some(event) = self
            .store
            .watch_once(&key, item.create_revision, timeout)
            .await?
        else {
            return Err(BatchError::Timeout(format!(
                "no result for batch {} on {} within {:?}",
                item.uuid, self.switch, timeout
            )));
        };
        if event.kv.version == 0 {
            return Err(BatchError::Coordination(format!(
                "result key {key} was deleted before it was read; its lease probably expired"
            )));
        }
        let batch = Batch::decode(&event.kv.value)?;
        match (batch.result, batch.error) {
            (Some(result), _) => Ok(result),
            (None, Some(error)) => Err(BatchError::Device(error)),
            (None, None) => Err(BatchError::Coordination(format!(
                "result for batch {} carries neither result nor error",
                item.uuid
            ))),
        }
    }

    /// Pending batches, oldest first. With a bound, only batches enqueued at or
    /// before it are returned, so a worker never has to wait on work that
    /// arrived after it was triggered.
    pub async fn list_pending(&self, bound: Option<&QueueItem>) -> Result<Vec<Batch>, BatchError> {
        let mut opts = RangeOptions::oldest_first();
        if let Some(bound) = bound {
            opts = opts.with_max_create_revision(bound.create_revision);
        }
        let kvs = self.store.range(&input_prefix(&self.switch), opts).await?;
        let mut batches = Vec::with_capacity(kvs.len());
        for kv in kvs {
            match Batch::decode(&kv.value) {
                Ok(batch) => batches.push(batch),
                Err(e) => {
                    // Left for its lease to reclaim.
                    warn!(switch = %self.switch, key = %kv.key, error = %e, "skipping malformed pending batch");
                }
            }
        }
        Ok(batches)
    }

    /// Complete a batch: write its output and delete its input in one
    /// transaction. Failures are logged rather than returned since the device
    /// work is already done and must not be repeated. Returns whether the
    /// result was written.
    pub async fn record_result(&self, batch: &Batch) -> bool {
        let payload = match batch.encode() {
            Ok(p) => p,
            Err(e) => {
                error!(switch = %self.switch, uuid = %batch.uuid, error = %e, "failed to encode batch result");
                return false;
            }
        };
        let result: Result<bool, BatchError> = async {
            let lease = self.store.lease_grant(self.result_ttl_secs).await?;
            let outcome = self
                .store
                .txn(
                    vec![Compare::create_revision(
                        batch.result_key.as_str(),
                        CompareOp::Equal,
                        0,
                    )],
                    vec![
                        TxnOp::put(batch.result_key.as_str(), payload, Some(lease)),
                        TxnOp::delete(batch.input_key.as_str()),
                    ],
                    vec![],
                )
                .await;
            match outcome {
                Ok(o) if o.succeeded => Ok(true),
                other => {
                    self.store.lease_revoke(lease).await?;
                    other.map(|_| false).map_err(BatchError::from)
                }
            }
        }
        .await;

        match result {
            Ok(true) => {
                debug!(switch = %self.switch, uuid = %batch.uuid, failed = batch.error.is_some(), "recorded batch result");
                true
            }
            Ok(false) => {
                warn!(switch = %self.switch, uuid = %batch.uuid, "batch result already recorded; keeping the first");
                false
            }
            Err(e) => {
                error!(switch = %self.switch, uuid = %batch.uuid, error = %e, "failed to record batch result");
                false
            }
        }
    }

    /// Take one slot of the switch's execution lock pool.
    ///
    /// Returns `Ok(None)` when, between attempts, every batch up to `bound` has
    /// been completed by another worker. Returns a timeout error if the
    /// backlog is still non-empty when `acquire_timeout` passes.
    pub async fn acquire_execution_lock(
        &self,
        bound: &QueueItem,
        acquire_timeout: Duration,
        lock_ttl_secs: i64,
        wait_policy: WaitPolicy,
    ) -> Result<Option<LockHandle>, BatchError> {
        let pool = PoolLock::new(
            Some(Arc::clone(&self.store)),
            LockPoolConfig {
                prefix: execute_lock_prefix(&self.switch),
                size: self.lock_pool_size,
                ttl_secs: lock_ttl_secs,
                acquire_timeout,
                wait_policy,
            },
        );
        let outcome = pool
            .acquire_while(|| async {
                let pending = self.list_pending(Some(bound)).await?;
                Ok::<bool, BatchError>(!pending.is_empty())
            })
            .await?;
        match outcome {
            LockOutcome::Locked(handle) => Ok(Some(handle)),
            LockOutcome::Drained => {
                debug!(switch = %self.switch, bound = bound.create_revision, "backlog drained by another worker");
                Ok(None)
            }
            LockOutcome::Busy | LockOutcome::TimedOut => Err(BatchError::Timeout(format!(
                "execution lock for {} still held after {:?}",
                self.switch, acquire_timeout
            ))),
        }
    }

    /// Delete every execution lock slot, for operator recovery when a holder
    /// is known to be dead. Returns the number of slots deleted.
    pub async fn clear_execution_locks(&self) -> Result<i64, BatchError> {
        let prefix = execute_lock_prefix(&self.switch);
        let mut deleted = 0;
        for index in 0..self.lock_pool_size.max(1) {
            deleted += self.store.delete(&lock_slot_key(&prefix, index)).await?;
        }
        Ok(deleted)
    }
}
