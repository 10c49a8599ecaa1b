use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub coordination: CoordinationConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Which KV store the queue and lock pool live in.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CoordinationBackend {
    #[default]
    Etcd,
    /// In-process store; only coordinates tasks within one process.
    Memory,
    /// No coordinator. Batching is unavailable and locks are no-ops.
    None,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CoordinationConfig {
    #[serde(default)]
    pub backend: CoordinationBackend,
    #[serde(default = "default_etcd_endpoints")]
    pub etcd_endpoints: Vec<String>,
    /// Prepended to every key so several deployments can share one etcd cluster.
    #[serde(default)]
    pub key_prefix: String,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            backend: CoordinationBackend::default(),
            etcd_endpoints: default_etcd_endpoints(),
            key_prefix: String::new(),
        }
    }
}

fn default_etcd_endpoints() -> Vec<String> {
    vec!["http://127.0.0.1:2379".to_string()]
}

/// Tunables for batching, locking and the worker pool.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BatchConfig {
    /// Number of execution lock slots per switch. 1 means strict exclusion.
    pub lock_pool_size: u32,
    pub lock_ttl_secs: i64,
    pub acquire_timeout_secs: u64,
    pub result_timeout_secs: u64,
    /// Lease on pending input keys; unexecuted work is reclaimed after this.
    pub batch_ttl_secs: i64,
    /// Lease on result keys, so outputs nobody collected get cleaned up.
    pub result_ttl_secs: i64,
    pub max_workers: usize,
    pub drain_grace_secs: u64,
    /// Delay between enqueue and starting a worker, so bursts coalesce.
    pub trigger_delay_ms: u64,
    pub retry_min_ms: u64,
    pub retry_max_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            lock_pool_size: 1,
            lock_ttl_secs: 30,
            acquire_timeout_secs: 120,
            result_timeout_secs: 300,
            batch_ttl_secs: 600,
            result_ttl_secs: 600,
            max_workers: 10,
            drain_grace_secs: 30,
            trigger_delay_ms: 10,
            retry_min_ms: 50,
            retry_max_ms: 500,
        }
    }
}

impl BatchConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    pub fn result_timeout(&self) -> Duration {
        Duration::from_secs(self.result_timeout_secs)
    }

    pub fn drain_grace(&self) -> Duration {
        Duration::from_secs(self.drain_grace_secs)
    }

    pub fn trigger_delay(&self) -> Duration {
        Duration::from_millis(self.trigger_delay_ms)
    }

    pub fn wait_policy(&self) -> WaitPolicy {
        WaitPolicy {
            min_backoff: Duration::from_millis(self.retry_min_ms),
            max_backoff: Duration::from_millis(self.retry_max_ms.max(self.retry_min_ms)),
        }
    }
}

/// Backoff bounds between lock acquisition sweeps. Each sleep is drawn
/// uniformly from `[min_backoff, max_backoff]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    pub min_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        BatchConfig::default().wait_policy()
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl AppConfig {
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(p) => {
                let data = fs::read_to_string(p)?;
                let cfg: Self = toml::from_str(&data)?;
                Ok(cfg)
            }
            None => Ok(Self::default()),
        }
    }
}
