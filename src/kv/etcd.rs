//! etcd-backed store.
//!
//! Every process pointed at the same cluster and key prefix shares one queue
//! and lock pool per switch.

use async_trait::async_trait;
use etcd_client::{
    Client, Compare as EtcdCompare, CompareOp as EtcdCompareOp, ConnectOptions, EventType,
    GetOptions, PutOptions, SortOrder as EtcdSortOrder, SortTarget, Txn, TxnOp as EtcdTxnOp,
    WatchOptions,
};
use std::time::Duration;
use tracing::{debug, warn};

use super::{
    Compare, CompareOp, CompareTarget, KeyValue, KvError, KvStore, LeaseId, RangeOptions,
    SortOrder, TxnOp, TxnOutcome, WatchEvent, WatchEventKind,
};

/// KV store backed by an etcd cluster.
#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
    /// Prepended to every key on the way in, stripped on the way out.
    namespace: String,
}

impl EtcdStore {
    /// Connect to etcd. An empty endpoint list means the local default.
    #[tracing::instrument(level = "info", skip(endpoints))]
    pub async fn connect(endpoints: &[String], namespace: &str) -> Result<Self, KvError> {
        let endpoints = if endpoints.is_empty() {
            vec!["http://127.0.0.1:2379".to_string()]
        } else {
            endpoints.to_vec()
        };

        let opts = ConnectOptions::default();
        let client = Client::connect(endpoints, Some(opts))
            .await
            .map_err(|e| KvError::ConnectionFailed(e.to_string()))?;
        Ok(Self::from_client(client, namespace))
    }

    pub fn from_client(client: Client, namespace: &str) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
        }
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.namespace, key)
    }

    fn convert_kv(&self, kv: &etcd_client::KeyValue) -> Result<KeyValue, KvError> {
        let raw = std::str::from_utf8(kv.key())
            .map_err(|_| KvError::InvalidUtf8(String::from_utf8_lossy(kv.key()).into_owned()))?;
        let key = raw.strip_prefix(&self.namespace).unwrap_or(raw).to_string();
        Ok(KeyValue {
            key,
            value: kv.value().to_vec(),
            create_revision: kv.create_revision(),
            mod_revision: kv.mod_revision(),
            version: kv.version(),
            lease: kv.lease(),
        })
    }

    fn convert_compare(&self, cmp: Compare) -> EtcdCompare {
        let key = self.full_key(&cmp.key);
        let op = match cmp.op {
            CompareOp::Equal => EtcdCompareOp::Equal,
            CompareOp::NotEqual => EtcdCompareOp::NotEqual,
            CompareOp::Greater => EtcdCompareOp::Greater,
            CompareOp::Less => EtcdCompareOp::Less,
        };
        match cmp.target {
            CompareTarget::CreateRevision(rev) => EtcdCompare::create_revision(key, op, rev),
            CompareTarget::Version(v) => EtcdCompare::version(key, op, v),
            CompareTarget::Value(value) => EtcdCompare::value(key, op, value),
            CompareTarget::Lease(lease) => EtcdCompare::lease(key, op, lease),
        }
    }

    fn convert_op(&self, op: TxnOp) -> EtcdTxnOp {
        match op {
            TxnOp::Put { key, value, lease } => EtcdTxnOp::put(
                self.full_key(&key),
                value,
                lease.map(|id| PutOptions::new().with_lease(id)),
            ),
            TxnOp::Delete { key } => EtcdTxnOp::delete(self.full_key(&key), None),
        }
    }
}

#[async_trait]
impl KvStore for EtcdStore {
    async fn range(&self, prefix: &str, opts: RangeOptions) -> Result<Vec<KeyValue>, KvError> {
        let mut get_opts = GetOptions::new().with_prefix();
        if let Some(order) = opts.sort_by_create {
            let order = match order {
                SortOrder::Ascend => EtcdSortOrder::Ascend,
                SortOrder::Descend => EtcdSortOrder::Descend,
            };
            get_opts = get_opts.with_sort(SortTarget::Create, order);
        }
        if let Some(rev) = opts.max_create_revision {
            get_opts = get_opts.with_max_create_revision(rev);
        }
        let resp = self
            .client
            .kv_client()
            .get(self.full_key(prefix), Some(get_opts))
            .await?;
        resp.kvs().iter().map(|kv| self.convert_kv(kv)).collect()
    }

    async fn get(&self, key: &str) -> Result<Option<KeyValue>, KvError> {
        let resp = self.client.kv_client().get(self.full_key(key), None).await?;
        resp.kvs().first().map(|kv| self.convert_kv(kv)).transpose()
    }

    async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        lease: Option<LeaseId>,
    ) -> Result<i64, KvError> {
        let resp = self
            .client
            .kv_client()
            .put(
                self.full_key(key),
                value,
                lease.map(|id| PutOptions::new().with_lease(id)),
            )
            .await?;
        Ok(resp.header().map(|h| h.revision()).unwrap_or_default())
    }

    async fn delete(&self, key: &str) -> Result<i64, KvError> {
        let resp = self
            .client
            .kv_client()
            .delete(self.full_key(key), None)
            .await?;
        Ok(resp.deleted())
    }

    async fn txn(
        &self,
        compares: Vec<Compare>,
        success: Vec<TxnOp>,
        failure: Vec<TxnOp>,
    ) -> Result<TxnOutcome, KvError> {
        let txn = Txn::new()
            .when(
                compares
                    .into_iter()
                    .map(|c| self.convert_compare(c))
                    .collect::<Vec<_>>(),
            )
            .and_then(
                success
                    .into_iter()
                    .map(|op| self.convert_op(op))
                    .collect::<Vec<_>>(),
            )
            .or_else(
                failure
                    .into_iter()
                    .map(|op| self.convert_op(op))
                    .collect::<Vec<_>>(),
            );
        let resp = self.client.kv_client().txn(txn).await?;
        Ok(TxnOutcome {
            succeeded: resp.succeeded(),
            revision: resp.header().map(|h| h.revision()).unwrap_or_default(),
        })
    }

    async fn lease_grant(&self, ttl_secs: i64) -> Result<LeaseId, KvError> {
        let resp = self.client.lease_client().grant(ttl_secs, None).await?;
        Ok(resp.id())
    }

    async fn lease_keep_alive(&self, lease: LeaseId) -> Result<i64, KvError> {
        let (mut keeper, mut stream) = match self.client.lease_client().keep_alive(lease).await {
            Ok(pair) => pair,
            // The client rejects leases whose first keepalive reports no TTL left.
            Err(etcd_client::Error::LeaseKeepAliveError(_)) => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        keeper.keep_alive().await?;
        match stream.message().await? {
            Some(resp) => Ok(resp.ttl().max(0)),
            None => Err(KvError::BackendError(
                "lease keepalive stream closed".to_string(),
            )),
        }
    }

    async fn lease_revoke(&self, lease: LeaseId) -> Result<(), KvError> {
        match self.client.lease_client().revoke(lease).await {
            Ok(_) => Ok(()),
            // Already expired leases are reported as not found; the keys are gone either way.
            Err(e) if e.to_string().contains("lease not found") => {
                debug!(lease, "revoke: lease already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn watch_once(
        &self,
        key: &str,
        start_revision: i64,
        timeout: Duration,
    ) -> Result<Option<WatchEvent>, KvError> {
        let (mut watcher, mut stream) = self
            .client
            .watch_client()
            .watch(
                self.full_key(key),
                Some(WatchOptions::new().with_start_revision(start_revision)),
            )
            .await?;

        let wait = async {
            loop {
                let Some(resp) = stream.message().await? else {
                    return Err(KvError::BackendError("watch stream closed".to_string()));
                };
                if resp.canceled() {
                    if resp.compact_revision() > 0 {
                        return Err(KvError::Compacted {
                            requested: start_revision,
                            compacted: resp.compact_revision(),
                        });
                    }
                    return Err(KvError::BackendError(format!(
                        "watch canceled: {}",
                        resp.cancel_reason()
                    )));
                }
                // The creation acknowledgement carries no events.
                if let Some(event) = resp.events().first() {
                    let Some(kv) = event.kv() else {
                        continue;
                    };
                    let kind = match event.event_type() {
                        EventType::Put => WatchEventKind::Put,
                        EventType::Delete => WatchEventKind::Delete,
                    };
                    return Ok::<WatchEvent, KvError>(WatchEvent {
                        kind,
                        kv: self.convert_kv(kv)?,
                    });
                }
            }
        };

        let result = match tokio::time::timeout(timeout, wait).await {
            Ok(Ok(event)) => Ok(Some(event)),
            Ok(Err(e)) => Err(e),
            Err(_) => Ok(None),
        };
        if let Err(e) = watcher.cancel().await {
            warn!(error = %e, "failed to cancel watch");
        }
        result
    }
}
