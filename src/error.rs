use crate::device::DeviceError;
use crate::kv::KvError;

/// Errors surfaced by the queue, the lock pool and the orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    /// The enqueue transaction's create-only condition failed.
    #[error("failed to submit batch: {0}")]
    Submission(String),
    /// Waiting for a result, or for the execution lock, ran past its deadline.
    #[error("timed out: {0}")]
    Timeout(String),
    /// The worker's execution lock expired or was taken mid-session.
    #[error("lost execution lock {0}")]
    LockLost(String),
    /// The device rejected this batch's commands.
    #[error("device reported error: {0}")]
    Device(String),
    /// Bookkeeping in the KV store did not behave as expected.
    #[error("coordination failure: {0}")]
    Coordination(String),
    #[error(transparent)]
    Store(#[from] KvError),
    #[error("malformed batch payload: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("worker pool is shutting down")]
    ShuttingDown,
}

impl From<DeviceError> for BatchError {
    fn from(e: DeviceError) -> Self {
        BatchError::Device(e.to_string())
    }
}
