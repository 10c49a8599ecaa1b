//! In-process KV store with etcd semantics.
//!
//! Keeps a single global revision counter, TTL leases, and a bounded history of
//! changes so watches can start from a past revision. Leases are reclaimed
//! lazily whenever the store is touched and by any watcher whose wait spans a
//! lease deadline. Only tasks within one process can coordinate through it.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

use super::{
    Compare, KeyValue, KvError, KvStore, LeaseId, RangeOptions, SortOrder, TxnOp, TxnOutcome,
    WatchEvent, WatchEventKind,
};

/// Oldest history entries are dropped past this many events.
const HISTORY_LIMIT: usize = 4096;

struct Lease {
    ttl_secs: i64,
    deadline: Instant,
    keys: BTreeSet<String>,
}

/// A watch waiting for its first event. Events are matched as they are
/// recorded, so a waiter never depends on history it has not read yet.
struct PendingWatch {
    key: String,
    start: i64,
    event: Option<WatchEvent>,
}

struct State {
    revision: i64,
    data: BTreeMap<String, KeyValue>,
    leases: HashMap<LeaseId, Lease>,
    next_lease: LeaseId,
    history: VecDeque<WatchEvent>,
    /// Highest revision dropped from history
    compacted: i64,
    failing_txns: u32,
    watches: HashMap<u64, PendingWatch>,
    next_watch: u64,
}

impl State {
    fn new() -> Self {
        Self {
            revision: 1,
            data: BTreeMap::new(),
            leases: HashMap::new(),
            next_lease: 1,
            history: VecDeque::new(),
            compacted: 0,
            failing_txns: 0,
            watches: HashMap::new(),
            next_watch: 0,
        }
    }

    fn record(&mut self, event: WatchEvent) {
        for w in self.watches.values_mut() {
            if w.event.is_none() && w.key == event.kv.key && event.kv.mod_revision >= w.start {
                w.event = Some(event.clone());
            }
        }
        self.history.push_back(event);
        while self.history.len() > HISTORY_LIMIT {
            if let Some(dropped) = self.history.pop_front() {
                self.compacted = dropped.kv.mod_revision;
            }
        }
    }

    fn check_lease(&self, lease: Option<LeaseId>) -> Result<(), KvError> {
        match lease {
            Some(id) if id != 0 && !self.leases.contains_key(&id) => {
                Err(KvError::LeaseNotFound(id))
            }
            _ => Ok(()),
        }
    }

    fn write_key(&mut self, key: &str, value: Vec<u8>, lease: Option<LeaseId>, rev: i64) {
        let lease_id = lease.unwrap_or(0);
        let prev = self.data.get(key).cloned();
        if let Some(prev) = &prev {
            if prev.lease != 0 && prev.lease != lease_id {
                if let Some(old) = self.leases.get_mut(&prev.lease) {
                    old.keys.remove(key);
                }
            }
        }
        if let Some(l) = self.leases.get_mut(&lease_id) {
            l.keys.insert(key.to_string());
        }
        let kv = KeyValue {
            key: key.to_string(),
            value,
            create_revision: prev.as_ref().map_or(rev, |p| p.create_revision),
            mod_revision: rev,
            version: prev.as_ref().map_or(1, |p| p.version + 1),
            lease: lease_id,
        };
        self.data.insert(key.to_string(), kv.clone());
        self.record(WatchEvent {
            kind: WatchEventKind::Put,
            kv,
        });
    }

    fn remove_key(&mut self, key: &str, rev: i64) -> bool {
        let Some(old) = self.data.remove(key) else {
            return false;
        };
        if old.lease != 0 {
            if let Some(l) = self.leases.get_mut(&old.lease) {
                l.keys.remove(key);
            }
        }
        self.record(WatchEvent {
            kind: WatchEventKind::Delete,
            kv: KeyValue {
                key: key.to_string(),
                value: Vec::new(),
                create_revision: 0,
                mod_revision: rev,
                version: 0,
                lease: 0,
            },
        });
        true
    }

    /// Drop a lease and its keys. Returns true if any key was deleted.
    fn revoke(&mut self, id: LeaseId) -> bool {
        let Some(lease) = self.leases.remove(&id) else {
            return false;
        };
        if lease.keys.is_empty() {
            return false;
        }
        let rev = self.revision + 1;
        let mut changed = false;
        for key in &lease.keys {
            changed |= self.remove_key(key, rev);
        }
        if changed {
            self.revision = rev;
        }
        changed
    }

    fn expire_leases(&mut self, now: Instant) -> bool {
        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, l)| l.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        let mut changed = false;
        for id in expired {
            debug!(lease = id, "memory store: lease expired");
            changed |= self.revoke(id);
        }
        changed
    }

    fn next_lease_deadline(&self) -> Option<Instant> {
        self.leases.values().map(|l| l.deadline).min()
    }

    fn apply(&mut self, ops: Vec<TxnOp>) -> bool {
        let rev = self.revision + 1;
        let mut changed = false;
        for op in ops {
            match op {
                TxnOp::Put { key, value, lease } => {
                    self.write_key(&key, value, lease, rev);
                    changed = true;
                }
                TxnOp::Delete { key } => {
                    changed |= self.remove_key(&key, rev);
                }
            }
        }
        if changed {
            self.revision = rev;
        }
        changed
    }
}

/// In-memory [`KvStore`], useful for tests and single-process deployments.
pub struct MemoryStore {
    state: Mutex<State>,
    revision_tx: watch::Sender<i64>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (revision_tx, _) = watch::channel(1);
        Self {
            state: Mutex::new(State::new()),
            revision_tx,
        }
    }

    /// Create a new store wrapped in Arc
    pub fn new_arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Make the next `n` transactions fail with a backend error without
    /// touching any key.
    pub fn fail_next_txns(&self, n: u32) {
        self.state().failing_txns = n;
    }

    /// Current store revision.
    pub fn revision(&self) -> i64 {
        self.state().revision
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Lock the state after reclaiming expired leases.
    fn live_state(&self) -> MutexGuard<'_, State> {
        let mut st = self.state();
        if st.expire_leases(Instant::now()) {
            self.revision_tx.send_replace(st.revision);
        }
        st
    }

    fn notify(&self, revision: i64) {
        self.revision_tx.send_replace(revision);
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn range(&self, prefix: &str, opts: RangeOptions) -> Result<Vec<KeyValue>, KvError> {
        let st = self.live_state();
        let mut kvs: Vec<KeyValue> = st
            .data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .filter(|(_, kv)| {
                opts.max_create_revision
                    .is_none_or(|max| kv.create_revision <= max)
            })
            .map(|(_, kv)| kv.clone())
            .collect();
        match opts.sort_by_create {
            Some(SortOrder::Ascend) => kvs.sort_by_key(|kv| kv.create_revision),
            Some(SortOrder::Descend) => kvs.sort_by_key(|kv| std::cmp::Reverse(kv.create_revision)),
            None => {}
        }
        Ok(kvs)
    }

    async fn get(&self, key: &str) -> Result<Option<KeyValue>, KvError> {
        Ok(self.live_state().data.get(key).cloned())
    }

    async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        lease: Option<LeaseId>,
    ) -> Result<i64, KvError> {
        let mut st = self.live_state();
        st.check_lease(lease)?;
        st.apply(vec![TxnOp::put(key, value, lease)]);
        let rev = st.revision;
        drop(st);
        self.notify(rev);
        Ok(rev)
    }

    async fn delete(&self, key: &str) -> Result<i64, KvError> {
        let mut st = self.live_state();
        let deleted = st.apply(vec![TxnOp::delete(key)]);
        let rev = st.revision;
        drop(st);
        if deleted {
            self.notify(rev);
        }
        Ok(i64::from(deleted))
    }

    async fn txn(
        &self,
        compares: Vec<Compare>,
        success: Vec<TxnOp>,
        failure: Vec<TxnOp>,
    ) -> Result<TxnOutcome, KvError> {
        let mut st = self.live_state();
        if st.failing_txns > 0 {
            st.failing_txns -= 1;
            return Err(KvError::BackendError("injected txn failure".to_string()));
        }
        let succeeded = compares.iter().all(|c| c.matches(st.data.get(&c.key)));
        let ops = if succeeded { success } else { failure };
        for op in &ops {
            if let TxnOp::Put { lease, .. } = op {
                st.check_lease(*lease)?;
            }
        }
        let changed = st.apply(ops);
        let revision = st.revision;
        drop(st);
        if changed {
            self.notify(revision);
        }
        Ok(TxnOutcome {
            succeeded,
            revision,
        })
    }

    async fn lease_grant(&self, ttl_secs: i64) -> Result<LeaseId, KvError> {
        if ttl_secs <= 0 {
            return Err(KvError::BackendError(format!(
                "lease ttl must be positive, got {ttl_secs}"
            )));
        }
        let mut st = self.live_state();
        let id = st.next_lease;
        st.next_lease += 1;
        st.leases.insert(
            id,
            Lease {
                ttl_secs,
                deadline: Instant::now() + Duration::from_secs(ttl_secs as u64),
                keys: BTreeSet::new(),
            },
        );
        Ok(id)
    }

    async fn lease_keep_alive(&self, lease: LeaseId) -> Result<i64, KvError> {
        let mut st = self.live_state();
        match st.leases.get_mut(&lease) {
            Some(l) => {
                l.deadline = Instant::now() + Duration::from_secs(l.ttl_secs as u64);
                Ok(l.ttl_secs)
            }
            None => Ok(0),
        }
    }

    async fn lease_revoke(&self, lease: LeaseId) -> Result<(), KvError> {
        let mut st = self.live_state();
        let changed = st.revoke(lease);
        let rev = st.revision;
        drop(st);
        if changed {
            self.notify(rev);
        }
        Ok(())
    }

    async fn watch_once(
        &self,
        key: &str,
        start_revision: i64,
        timeout: Duration,
    ) -> Result<Option<WatchEvent>, KvError> {
        // Subscribe before scanning history so no change slips in between.
        let mut rx = self.revision_tx.subscribe();
        let deadline = Instant::now() + timeout;
        let registration = {
            let mut st = self.live_state();
            let start = if start_revision <= 0 {
                st.revision + 1
            } else {
                start_revision
            };
            if start <= st.compacted {
                return Err(KvError::Compacted {
                    requested: start,
                    compacted: st.compacted,
                });
            }
            if let Some(event) = st
                .history
                .iter()
                .find(|e| e.kv.key == key && e.kv.mod_revision >= start)
            {
                return Ok(Some(event.clone()));
            }
            let id = st.next_watch;
            st.next_watch += 1;
            st.watches.insert(
                id,
                PendingWatch {
                    key: key.to_string(),
                    start,
                    event: None,
                },
            );
            WatchRegistration { store: self, id }
        };

        loop {
            let next_expiry = {
                let mut st = self.live_state();
                let delivered = st
                    .watches
                    .get_mut(&registration.id)
                    .and_then(|w| w.event.take());
                if let Some(event) = delivered {
                    return Ok(Some(event));
                }
                st.next_lease_deadline()
            };

            let wake = next_expiry.map_or(deadline, |d| d.min(deadline));
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(KvError::BackendError("store closed".to_string()));
                    }
                }
                _ = tokio::time::sleep_until(wake) => {
                    if Instant::now() >= deadline {
                        return Ok(None);
                    }
                }
            }
        }
    }
}

/// Removes a pending watch when its waiter returns or is dropped.
struct WatchRegistration<'a> {
    store: &'a MemoryStore,
    id: u64,
}

impl Drop for WatchRegistration<'_> {
    fn drop(&mut self) {
        self.store.state().watches.remove(&self.id);
    }
}
