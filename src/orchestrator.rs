//! Client-facing batching API.
//!
//! [`BatchOrchestrator::submit`] enqueues a command list, makes sure a worker
//! will drain the switch's queue, and waits for the result. Submissions that
//! land close together share one worker, and that worker runs everything
//! pending in a single device session while holding the switch's execution
//! lock. The orchestrator is cheap to clone; clones share the worker pool.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::batch::{Batch, QueueItem};
use crate::device::Device;
use crate::error::BatchError;
use crate::keys::execute_lock_prefix;
use crate::kv::KvStore;
use crate::lock::{LockHandle, LockPoolConfig, PoolLock};
use crate::queue::SwitchQueue;
use crate::settings::BatchConfig;
use crate::worker_pool::WorkerPool;

#[derive(Clone)]
pub struct BatchOrchestrator {
    store: Option<Arc<dyn KvStore>>,
    config: BatchConfig,
    pool: Arc<WorkerPool>,
    /// Switch name -> bound of the worker scheduled but not yet started
    scheduled: Arc<Mutex<HashMap<String, QueueItem>>>,
}

impl BatchOrchestrator {
    /// Create an orchestrator with its own worker pool. Without a store,
    /// batching is off and [`submit`](Self::submit) runs every command list
    /// directly.
    pub fn new(store: Option<Arc<dyn KvStore>>, config: BatchConfig) -> Self {
        let pool = WorkerPool::new(config.max_workers);
        Self::with_pool(store, config, pool)
    }

    /// Create an orchestrator that schedules workers on a shared pool.
    pub fn with_pool(
        store: Option<Arc<dyn KvStore>>,
        config: BatchConfig,
        pool: Arc<WorkerPool>,
    ) -> Self {
        Self {
            store,
            config,
            pool,
            scheduled: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// The queue for `switch`. Fails when no coordinator is configured.
    pub fn queue(&self, switch: &str) -> Result<SwitchQueue, BatchError> {
        let store = self.store.as_ref().ok_or_else(|| {
            BatchError::Coordination("batching needs a coordination store".to_string())
        })?;
        Ok(SwitchQueue::new(switch, Arc::clone(store), &self.config))
    }

    fn scheduled(&self) -> MutexGuard<'_, HashMap<String, QueueItem>> {
        self.scheduled.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run `cmds` on `device` and return its output.
    ///
    /// Concurrent calls for the same switch, from this process or any other
    /// sharing the store, are coalesced into as few device sessions as
    /// possible.
    pub async fn submit(
        &self,
        device: Arc<dyn Device>,
        cmds: Vec<String>,
        timeout: Duration,
    ) -> Result<String, BatchError> {
        if self.store.is_none() {
            return self.execute_direct(device.as_ref(), cmds).await;
        }
        if self.pool.is_closed() {
            return Err(BatchError::ShuttingDown);
        }
        let queue = self.queue(device.switch_name())?;
        let item = queue.enqueue(cmds).await?;
        // Let callers that raced with us enqueue before a worker is scheduled.
        tokio::task::yield_now().await;
        if let Err(e) = self.trigger(device, item.clone()) {
            // The caller sees a failure, so the commands must not run later.
            match queue.withdraw(&item).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(uuid = %item.uuid, "rejected batch was already taken by a worker")
                }
                Err(err) => {
                    error!(uuid = %item.uuid, error = %err, "failed to withdraw rejected batch; it stays queued until its lease expires")
                }
            }
            return Err(e);
        }
        queue.wait_for_result(&item, timeout).await
    }

    /// Make sure a worker covering `item` will run. If one is already
    /// scheduled for the switch and has not started yet, its bound is
    /// extended instead of spawning another.
    fn trigger(&self, device: Arc<dyn Device>, item: QueueItem) -> Result<(), BatchError> {
        let switch = device.switch_name().to_string();
        {
            let mut scheduled = self.scheduled();
            if let Some(bound) = scheduled.get_mut(&switch) {
                if item.create_revision > bound.create_revision {
                    *bound = item;
                }
                debug!(switch = %switch, "worker already scheduled; extending its bound");
                return Ok(());
            }
            scheduled.insert(switch.clone(), item);
        }

        let me = self.clone();
        let span = info_span!("batch.worker", switch = %switch);
        let worker_switch = switch.clone();
        let spawned = self.pool.spawn(
            async move {
                tokio::time::sleep(me.config.trigger_delay()).await;
                let Some(bound) = me.scheduled().remove(&worker_switch) else {
                    return;
                };
                if let Err(e) = me.drain_pending(device.as_ref(), &bound).await {
                    warn!(error = %e, bound = bound.create_revision, "worker failed");
                }
            }
            .instrument(span),
        );
        if let Err(e) = spawned {
            self.scheduled().remove(&switch);
            return Err(e);
        }
        Ok(())
    }

    /// Execute the switch's backlog if any batch up to `item` is still
    /// pending. Once the execution lock is held, everything pending is run,
    /// including batches that arrived after `item`.
    pub async fn drain_pending(&self, device: &dyn Device, item: &QueueItem) -> Result<(), BatchError> {
        let queue = self.queue(device.switch_name())?;
        if queue.list_pending(Some(item)).await?.is_empty() {
            debug!(bound = item.create_revision, "nothing pending; already handled");
            return Ok(());
        }

        let lock = queue
            .acquire_execution_lock(
                item,
                self.config.acquire_timeout(),
                self.config.lock_ttl_secs,
                self.config.wait_policy(),
            )
            .await?;
        let Some(lock) = lock else {
            return Ok(());
        };

        let result = match queue.list_pending(None).await {
            Ok(batches) => self
                .execute_session(device, batches, &lock)
                .await
                .map(|_| ()),
            Err(e) => Err(e),
        };
        let lock_key = lock.key().to_string();
        if let Err(e) = lock.release().await {
            warn!(lock_key = %lock_key, error = %e, "failed to release execution lock; it frees when its lease expires");
        }
        result
    }

    /// Run `batches` in order inside one device session and record each
    /// outcome. Returns how many batches were recorded.
    ///
    /// A failing batch only fails itself. After every batch the lock's lease
    /// is refreshed and ownership re-checked before the result is written;
    /// losing the lock stops the session and leaves the remaining batches
    /// pending for a later worker.
    ///
    /// The configuration is saved once, after the last batch. A session that
    /// loses its lock returns before saving, so batches already recorded as
    /// successful are applied to the running configuration but not saved.
    pub async fn execute_session(
        &self,
        device: &dyn Device,
        batches: Vec<Batch>,
        lock: &LockHandle,
    ) -> Result<usize, BatchError> {
        if batches.is_empty() {
            return Ok(0);
        }
        let queue = self.queue(device.switch_name())?;
        let total = batches.len();
        let mut session = device.open_session().await?;
        info!(switch = %queue.switch(), batches = total, "executing batches in one session");

        for (done, mut batch) in batches.into_iter().enumerate() {
            match session.execute(&batch.cmds).await {
                Ok(output) => batch.succeed(output),
                Err(e) => {
                    warn!(uuid = %batch.uuid, error = %e, "batch failed on device");
                    batch.fail(e.to_string());
                }
            }

            if !lock.refresh().await? || !lock.is_acquired().await? {
                error!(lock_key = %lock.key(), executed = done + 1, total, "execution lock lost mid-session");
                return Err(BatchError::LockLost(format!(
                    "{} after executing {} of {} batches",
                    lock.key(),
                    done + 1,
                    total
                )));
            }
            queue.record_result(&batch).await;
        }

        if let Err(e) = session.save_configuration().await {
            // Results are already recorded and stay as they are.
            error!(switch = %queue.switch(), error = %e, "failed to save configuration");
        }
        Ok(total)
    }

    /// Run one command list in its own session, outside the queue, while
    /// holding a slot of the switch's lock pool. Without a store the lock is a
    /// no-op.
    pub async fn execute_direct(
        &self,
        device: &dyn Device,
        cmds: Vec<String>,
    ) -> Result<String, BatchError> {
        let pool = PoolLock::new(
            self.store.clone(),
            LockPoolConfig {
                prefix: execute_lock_prefix(device.switch_name()),
                size: self.config.lock_pool_size,
                ttl_secs: self.config.lock_ttl_secs,
                acquire_timeout: self.config.acquire_timeout(),
                wait_policy: self.config.wait_policy(),
            },
        );
        pool.with_lock(|_lock| async move {
            let mut session = device.open_session().await?;
            let output = session.execute(&cmds).await?;
            if let Err(e) = session.save_configuration().await {
                error!(switch = %device.switch_name(), error = %e, "failed to save configuration");
            }
            Ok::<String, BatchError>(output)
        })
        .await
    }

    /// Stop scheduling workers and wait up to `grace` for running ones.
    /// Returns the number of workers abandoned.
    pub async fn drain(&self, grace: Duration) -> usize {
        self.pool.drain(grace).await
    }
}
