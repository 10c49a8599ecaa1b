//! Runs against a real etcd on 127.0.0.1:2379: `cargo test -- --ignored`.


use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use swbatch::kv::{Compare, CompareOp, EtcdStore, KvStore, RangeOptions, TxnOp, WatchEventKind};
use swbatch::{BatchOrchestrator, Device, SwitchQueue};
use test_helpers::{cmds, fast_config, RecordingDevice};

fn unique_prefix() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    format!("swbatch-test-{}/", nanos)
}

async fn connect() -> Arc<dyn KvStore> {
    let store = EtcdStore::connect(&["http://127.0.0.1:2379".to_string()], &unique_prefix())
        .await
        .expect("etcd reachable");
    Arc::new(store)
}

#[swbatch::test]
#[ignore = "needs etcd"]
async fn etcd_txn_is_create_only() {
    let store = connect().await;
    let create = || {
        (
            vec![Compare::create_revision("k", CompareOp::Equal, 0)],
            vec![TxnOp::put("k", "v1", None)],
        )
    };

    let (cmp, ops) = create();
    assert!(store.txn(cmp, ops, vec![]).await.unwrap().succeeded);
    let (cmp, ops) = create();
    assert!(!store.txn(cmp, ops, vec![]).await.unwrap().succeeded);

    let kv = store.get("k").await.unwrap().unwrap();
    assert_eq!(kv.key, "k");
    assert_eq!(kv.value, b"v1");
    assert_eq!(kv.version, 1);
}

#[swbatch::test]
#[ignore = "needs etcd"]
async fn etcd_range_is_namespaced_and_ordered() {
    let store = connect().await;
    store.put("q/b", b"2".to_vec(), None).await.unwrap();
    store.put("q/a", b"1".to_vec(), None).await.unwrap();
    store.put("other", b"x".to_vec(), None).await.unwrap();

    let kvs = store.range("q/", RangeOptions::oldest_first()).await.unwrap();
    let keys: Vec<&str> = kvs.iter().map(|kv| kv.key.as_str()).collect();
    assert_eq!(keys, vec!["q/b", "q/a"]);
}

#[swbatch::test]
#[ignore = "needs etcd"]
async fn etcd_revoke_deletes_leased_keys_and_watch_sees_it() {
    let store = connect().await;
    let lease = store.lease_grant(30).await.unwrap();
    let rev = store.put("leased", b"v".to_vec(), Some(lease)).await.unwrap();
    assert!(store.lease_keep_alive(lease).await.unwrap() > 0);

    store.lease_revoke(lease).await.unwrap();
    assert!(store.get("leased").await.unwrap().is_none());

    let event = store
        .watch_once("leased", rev + 1, Duration::from_secs(5))
        .await
        .unwrap()
        .expect("delete event");
    assert_eq!(event.kind, WatchEventKind::Delete);
    assert_eq!(event.kv.version, 0);
    assert_eq!(store.lease_keep_alive(lease).await.unwrap(), 0);
}

#[swbatch::test]
#[ignore = "needs etcd"]
async fn etcd_end_to_end_submit() {
    let store = connect().await;
    let orchestrator = BatchOrchestrator::new(Some(Arc::clone(&store)), fast_config());
    let device = RecordingDevice::new("sw1");

    let mut callers = Vec::new();
    for cmd in ["cmd-A", "cmd-B", "cmd-C"] {
        let orchestrator = orchestrator.clone();
        let device: Arc<dyn Device> = Arc::new(device.clone());
        callers.push(tokio::spawn(async move {
            orchestrator
                .submit(device, cmds(&[cmd]), Duration::from_secs(10))
                .await
        }));
    }
    for (c, cmd) in callers.into_iter().zip(["cmd-A", "cmd-B", "cmd-C"]) {
        assert_eq!(c.await.unwrap().unwrap(), format!("ok: {cmd}"));
    }
    assert_eq!(device.executed(), 3);

    let queue = SwitchQueue::new("sw1", store, &fast_config());
    assert!(queue.list_pending(None).await.unwrap().is_empty());
}
