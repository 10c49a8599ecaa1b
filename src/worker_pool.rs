use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::error::BatchError;

/// Bounded pool for background workers, shared by every switch in a process.
///
/// At most `max_workers` tasks run at once; the rest wait for a permit. The
/// host calls [`drain`](Self::drain) once at shutdown.
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    tasks: Mutex<JoinSet<()>>,
    closed: AtomicBool,
}

impl WorkerPool {
    pub fn new(max_workers: usize) -> Arc<Self> {
        Arc::new(Self {
            permits: Arc::new(Semaphore::new(max_workers.max(1))),
            tasks: Mutex::new(JoinSet::new()),
            closed: AtomicBool::new(false),
        })
    }

    fn tasks(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue a task. Fails once the pool has started draining.
    pub fn spawn<F>(&self, task: F) -> Result<(), BatchError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_closed() {
            return Err(BatchError::ShuttingDown);
        }
        let permits = Arc::clone(&self.permits);
        let mut tasks = self.tasks();
        // Reap finished tasks so the set only tracks live ones.
        while let Some(res) = tasks.try_join_next() {
            log_join_error(res);
        }
        tasks.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            task.await;
        });
        Ok(())
    }

    /// Whether [`drain`](Self::drain) has started.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Tasks queued or running.
    pub fn active(&self) -> usize {
        self.tasks().len()
    }

    /// Stop accepting work and wait up to `grace` for outstanding tasks. Tasks
    /// still running afterwards are aborted; any lock they hold is freed when
    /// its lease expires. Returns the number of aborted tasks.
    pub async fn drain(&self, grace: Duration) -> usize {
        self.closed.store(true, Ordering::SeqCst);
        let mut tasks = std::mem::take(&mut *self.tasks());
        debug!(outstanding = tasks.len(), grace = ?grace, "draining worker pool");

        let finished = tokio::time::timeout(grace, async {
            while let Some(res) = tasks.join_next().await {
                log_join_error(res);
            }
        })
        .await;
        if finished.is_ok() {
            return 0;
        }

        let abandoned = tasks.len();
        warn!(abandoned, "worker pool drain timed out; abandoning remaining work");
        tasks.shutdown().await;
        abandoned
    }
}

fn log_join_error(res: Result<(), tokio::task::JoinError>) {
    if let Err(e) = res {
        if e.is_panic() {
            warn!(error = %e, "worker task panicked");
        }
    }
}
