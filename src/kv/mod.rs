//! KV store backends for queue and lock state.
//!
//! Everything the queue needs from a store is captured by [`KvStore`]: ranged
//! reads ordered by create revision, conditional transactions, TTL leases and
//! one-shot watches. Available backends:
//!
//! - `etcd`: the production store, shared by every process
//! - `memory`: an in-process store for tests and single-process development

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::settings::{CoordinationBackend, CoordinationConfig};

pub mod etcd;
pub mod memory;

pub use etcd::EtcdStore;
pub use memory::MemoryStore;

pub type LeaseId = i64;

/// A stored entry together with the metadata the store keeps for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    /// Revision at which the key was created; 0 if it does not exist
    pub create_revision: i64,
    pub mod_revision: i64,
    /// Number of writes since creation; 0 for a deleted key
    pub version: i64,
    /// Attached lease, 0 when there is none
    pub lease: LeaseId,
}

impl KeyValue {
    pub fn value_str(&self) -> Result<&str, KvError> {
        std::str::from_utf8(&self.value).map_err(|_| KvError::InvalidUtf8(self.key.clone()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Ascend,
    Descend,
}

/// Options for a prefix range read.
#[derive(Debug, Clone, Copy, Default)]
pub struct RangeOptions {
    /// Sort results by create revision
    pub sort_by_create: Option<SortOrder>,
    /// Only return keys created at or before this revision
    pub max_create_revision: Option<i64>,
}

impl RangeOptions {
    pub fn oldest_first() -> Self {
        Self {
            sort_by_create: Some(SortOrder::Ascend),
            max_create_revision: None,
        }
    }

    pub fn with_max_create_revision(mut self, revision: i64) -> Self {
        self.max_create_revision = Some(revision);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Equal,
    NotEqual,
    Greater,
    Less,
}

impl CompareOp {
    fn holds<T: Ord>(self, actual: T, expected: T) -> bool {
        match self {
            CompareOp::Equal => actual == expected,
            CompareOp::NotEqual => actual != expected,
            CompareOp::Greater => actual > expected,
            CompareOp::Less => actual < expected,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompareTarget {
    CreateRevision(i64),
    Version(i64),
    Value(Vec<u8>),
    Lease(LeaseId),
}

/// One guard clause of a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compare {
    pub key: String,
    pub op: CompareOp,
    pub target: CompareTarget,
}

impl Compare {
    pub fn create_revision(key: impl Into<String>, op: CompareOp, revision: i64) -> Self {
        Self {
            key: key.into(),
            op,
            target: CompareTarget::CreateRevision(revision),
        }
    }

    pub fn version(key: impl Into<String>, op: CompareOp, version: i64) -> Self {
        Self {
            key: key.into(),
            op,
            target: CompareTarget::Version(version),
        }
    }

    pub fn value(key: impl Into<String>, op: CompareOp, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            op,
            target: CompareTarget::Value(value.into()),
        }
    }

    pub fn lease(key: impl Into<String>, op: CompareOp, lease: LeaseId) -> Self {
        Self {
            key: key.into(),
            op,
            target: CompareTarget::Lease(lease),
        }
    }

    /// Evaluate against the current entry, `None` meaning the key is absent.
    pub(crate) fn matches(&self, current: Option<&KeyValue>) -> bool {
        match (&self.target, current) {
            (CompareTarget::CreateRevision(rev), kv) => {
                self.op.holds(kv.map_or(0, |kv| kv.create_revision), *rev)
            }
            (CompareTarget::Version(v), kv) => self.op.holds(kv.map_or(0, |kv| kv.version), *v),
            (CompareTarget::Lease(lease), kv) => self.op.holds(kv.map_or(0, |kv| kv.lease), *lease),
            (CompareTarget::Value(value), Some(kv)) => {
                self.op.holds(kv.value.as_slice(), value.as_slice())
            }
            // etcd fails value comparisons against missing keys
            (CompareTarget::Value(_), None) => false,
        }
    }
}

/// A write performed by a transaction branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnOp {
    Put {
        key: String,
        value: Vec<u8>,
        lease: Option<LeaseId>,
    },
    Delete {
        key: String,
    },
}

impl TxnOp {
    pub fn put(key: impl Into<String>, value: impl Into<Vec<u8>>, lease: Option<LeaseId>) -> Self {
        TxnOp::Put {
            key: key.into(),
            value: value.into(),
            lease,
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        TxnOp::Delete { key: key.into() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxnOutcome {
    /// Whether the compare clauses held and the success branch ran
    pub succeeded: bool,
    /// Store revision after the transaction
    pub revision: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    Put,
    Delete,
}

/// A change to a watched key. For deletes, `kv.version` is 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    pub kv: KeyValue,
}

#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("backend error: {0}")]
    BackendError(String),
    #[error("requested lease not found: {0}")]
    LeaseNotFound(LeaseId),
    #[error("revision {requested} has been compacted (compacted through {compacted})")]
    Compacted { requested: i64, compacted: i64 },
    #[error("value of key {0} is not valid utf-8")]
    InvalidUtf8(String),
}

impl From<etcd_client::Error> for KvError {
    fn from(e: etcd_client::Error) -> Self {
        KvError::BackendError(e.to_string())
    }
}

/// The store operations the queue and lock pool are built on.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Read every key starting with `prefix`.
    async fn range(&self, prefix: &str, opts: RangeOptions) -> Result<Vec<KeyValue>, KvError>;

    async fn get(&self, key: &str) -> Result<Option<KeyValue>, KvError>;

    /// Write a key, returning the store revision of the write.
    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>)
        -> Result<i64, KvError>;

    /// Delete a key, returning how many keys were removed.
    async fn delete(&self, key: &str) -> Result<i64, KvError>;

    /// Atomically run `success` if every compare holds, else `failure`.
    async fn txn(
        &self,
        compares: Vec<Compare>,
        success: Vec<TxnOp>,
        failure: Vec<TxnOp>,
    ) -> Result<TxnOutcome, KvError>;

    async fn lease_grant(&self, ttl_secs: i64) -> Result<LeaseId, KvError>;

    /// Refresh a lease. Returns the new TTL in seconds, or 0 if the lease has
    /// already expired.
    async fn lease_keep_alive(&self, lease: LeaseId) -> Result<i64, KvError>;

    /// Revoke a lease and delete every key attached to it.
    async fn lease_revoke(&self, lease: LeaseId) -> Result<(), KvError>;

    /// Wait for the first change to `key` at or after `start_revision`.
    /// Returns `None` if nothing happens within `timeout`.
    async fn watch_once(
        &self,
        key: &str,
        start_revision: i64,
        timeout: Duration,
    ) -> Result<Option<WatchEvent>, KvError>;
}

/// Open the configured store. `None` means no coordinator is configured.
pub async fn open(cfg: &CoordinationConfig) -> Result<Option<Arc<dyn KvStore>>, KvError> {
    match cfg.backend {
        CoordinationBackend::Etcd => {
            let store: Arc<dyn KvStore> =
                Arc::new(EtcdStore::connect(&cfg.etcd_endpoints, &cfg.key_prefix).await?);
            Ok(Some(store))
        }
        CoordinationBackend::Memory => {
            let store: Arc<dyn KvStore> = MemoryStore::new_arc();
            Ok(Some(store))
        }
        CoordinationBackend::None => Ok(None),
    }
}
