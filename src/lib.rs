//! Coalesces concurrent configuration requests for a network switch into single
//! device sessions, with every process coordinating through a shared KV store.
//!
//! Callers hand command lists to [`BatchOrchestrator::submit`]. Each lands in
//! the switch's FIFO queue in the store; a background worker takes the switch's
//! execution lock, runs the whole backlog in one session and writes each
//! caller's result back, which wakes the caller's watch.

pub mod batch;
pub mod device;
pub mod error;
pub mod keys;
pub mod kv;
pub mod lock;
pub mod orchestrator;
pub mod queue;
pub mod settings;
pub mod trace;
pub mod worker_pool;

pub use batch::{Batch, QueueItem};
pub use device::{Device, DeviceError, DeviceSession, DryRunDevice};
pub use error::BatchError;
pub use lock::{LockHandle, LockOutcome, LockPoolConfig, PoolLock};
pub use orchestrator::BatchOrchestrator;
pub use queue::SwitchQueue;
pub use worker_pool::WorkerPool;

pub use swbatch_macros::test;
