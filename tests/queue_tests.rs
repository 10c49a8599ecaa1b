
use std::sync::Arc;
use std::time::Duration;

use swbatch::keys::{input_key, input_prefix, output_key};
use swbatch::kv::{KvStore, RangeOptions};
use swbatch::lock::{LockOutcome, LockPoolConfig, PoolLock};
use swbatch::settings::WaitPolicy;
use swbatch::{BatchError, QueueItem, SwitchQueue};
use test_helpers::{cmds, fast_config, memory_store};

fn lock_holder(store: &Arc<dyn KvStore>, switch: &str) -> PoolLock {
    PoolLock::new(
        Some(Arc::clone(store)),
        LockPoolConfig {
            prefix: swbatch::keys::execute_lock_prefix(switch),
            size: 1,
            ttl_secs: 30,
            acquire_timeout: Duration::from_secs(1),
            wait_policy: WaitPolicy::default(),
        },
    )
}

fn fixed_wait(ms: u64) -> WaitPolicy {
    WaitPolicy {
        min_backoff: Duration::from_millis(ms),
        max_backoff: Duration::from_millis(ms),
    }
}

#[swbatch::test]
async fn enqueue_orders_batches_by_arrival() {
    let (_mem, store) = memory_store();
    let queue = SwitchQueue::new("sw1", Arc::clone(&store), &fast_config());

    let a = queue.enqueue(cmds(&["cmd-A"])).await.unwrap();
    let b = queue.enqueue(cmds(&["cmd-B1", "cmd-B2"])).await.unwrap();
    let c = queue.enqueue(cmds(&["cmd-C"])).await.unwrap();
    assert!(a.create_revision < b.create_revision);
    assert!(b.create_revision < c.create_revision);

    let pending = queue.list_pending(None).await.unwrap();
    let uuids: Vec<&str> = pending.iter().map(|p| p.uuid.as_str()).collect();
    assert_eq!(uuids, vec![a.uuid.as_str(), b.uuid.as_str(), c.uuid.as_str()]);
    assert_eq!(pending[1].cmds, cmds(&["cmd-B1", "cmd-B2"]));
    assert_eq!(pending[0].input_key, input_key("sw1", &a.uuid));
    assert_eq!(pending[0].result_key, output_key("sw1", &a.uuid));
    assert!(pending.iter().all(|p| !p.is_completed()));
}

#[swbatch::test]
async fn enqueued_input_key_is_leased_at_its_queue_position() {
    let (_mem, store) = memory_store();
    let queue = SwitchQueue::new("sw1", Arc::clone(&store), &fast_config());

    let item = queue.enqueue(cmds(&["show version"])).await.unwrap();
    let kv = store
        .get(&input_key("sw1", &item.uuid))
        .await
        .unwrap()
        .expect("input key written");
    assert_eq!(kv.create_revision, item.create_revision);
    assert_ne!(kv.lease, 0);
}

#[swbatch::test]
async fn list_pending_stops_at_bound() {
    let (_mem, store) = memory_store();
    let queue = SwitchQueue::new("sw1", store, &fast_config());

    let mut items = Vec::new();
    for i in 0..5 {
        items.push(queue.enqueue(cmds(&[&format!("cmd-{i}")])).await.unwrap());
    }

    let bounded = queue.list_pending(Some(&items[2])).await.unwrap();
    let uuids: Vec<&str> = bounded.iter().map(|p| p.uuid.as_str()).collect();
    let expected: Vec<&str> = items[..3].iter().map(|i| i.uuid.as_str()).collect();
    assert_eq!(uuids, expected);

    assert_eq!(queue.list_pending(None).await.unwrap().len(), 5);
}

#[swbatch::test]
async fn queues_are_scoped_per_switch() {
    let (_mem, store) = memory_store();
    let sw1 = SwitchQueue::new("sw1", Arc::clone(&store), &fast_config());
    let sw10 = SwitchQueue::new("sw10", Arc::clone(&store), &fast_config());

    sw1.enqueue(cmds(&["a"])).await.unwrap();
    sw10.enqueue(cmds(&["b"])).await.unwrap();
    sw10.enqueue(cmds(&["c"])).await.unwrap();

    assert_eq!(sw1.list_pending(None).await.unwrap().len(), 1);
    assert_eq!(sw10.list_pending(None).await.unwrap().len(), 2);
}

#[swbatch::test]
async fn malformed_pending_entries_are_skipped() {
    let (_mem, store) = memory_store();
    let queue = SwitchQueue::new("sw1", Arc::clone(&store), &fast_config());

    store
        .put(&input_key("sw1", "garbage"), b"not json".to_vec(), None)
        .await
        .unwrap();
    let item = queue.enqueue(cmds(&["a"])).await.unwrap();

    let pending = queue.list_pending(None).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].uuid, item.uuid);
}

#[swbatch::test]
async fn record_result_moves_batch_from_input_to_output() {
    let (_mem, store) = memory_store();
    let queue = SwitchQueue::new("sw1", Arc::clone(&store), &fast_config());

    let item = queue.enqueue(cmds(&["vlan 10"])).await.unwrap();
    let mut batch = queue.list_pending(None).await.unwrap().remove(0);
    batch.succeed("vlan created".to_string());
    assert!(queue.record_result(&batch).await);

    assert!(store.get(&batch.input_key).await.unwrap().is_none());
    let out = store.get(&batch.result_key).await.unwrap().expect("result written");
    assert_ne!(out.lease, 0);
    assert!(queue.list_pending(None).await.unwrap().is_empty());

    let result = queue
        .wait_for_result(&item, Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(result, "vlan created");
}

#[swbatch::test]
async fn failed_record_result_leaves_batch_pending() {
    let (mem, store) = memory_store();
    let queue = SwitchQueue::new("sw1", Arc::clone(&store), &fast_config());

    queue.enqueue(cmds(&["vlan 10"])).await.unwrap();
    let mut batch = queue.list_pending(None).await.unwrap().remove(0);
    batch.succeed("done".to_string());

    mem.fail_next_txns(1);
    assert!(!queue.record_result(&batch).await);
    assert!(store.get(&batch.result_key).await.unwrap().is_none());
    assert!(store.get(&batch.input_key).await.unwrap().is_some());
    assert_eq!(queue.list_pending(None).await.unwrap().len(), 1);

    // The next attempt goes through.
    assert!(queue.record_result(&batch).await);
    assert!(store.get(&batch.input_key).await.unwrap().is_none());
}

#[swbatch::test]
async fn recorded_result_is_never_overwritten() {
    let (_mem, store) = memory_store();
    let queue = SwitchQueue::new("sw1", store, &fast_config());

    let item = queue.enqueue(cmds(&["a"])).await.unwrap();
    let pending = queue.list_pending(None).await.unwrap().remove(0);
    let mut first = pending.clone();
    first.succeed("first".to_string());
    let mut second = pending;
    second.fail("second".to_string());

    assert!(queue.record_result(&first).await);
    assert!(!queue.record_result(&second).await);

    let result = queue
        .wait_for_result(&item, Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(result, "first");
}

#[swbatch::test]
async fn withdraw_removes_only_an_untouched_batch() {
    let (_mem, store) = memory_store();
    let queue = SwitchQueue::new("sw1", Arc::clone(&store), &fast_config());

    let kept = queue.enqueue(cmds(&["keep"])).await.unwrap();
    let dropped = queue.enqueue(cmds(&["drop"])).await.unwrap();
    assert!(queue.withdraw(&dropped).await.unwrap());
    assert!(!queue.withdraw(&dropped).await.unwrap());

    let pending = queue.list_pending(None).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].uuid, kept.uuid);

    // Once a worker has recorded it, the batch is no longer ours to take back.
    let mut batch = pending.into_iter().next().unwrap();
    batch.succeed("applied".to_string());
    assert!(queue.record_result(&batch).await);
    assert!(!queue.withdraw(&kept).await.unwrap());
    assert!(store.get(&batch.result_key).await.unwrap().is_some());
}

#[swbatch::test]
async fn waiter_gets_its_result_after_heavy_unrelated_traffic() {
    let (_mem, store) = memory_store();
    let queue = Arc::new(SwitchQueue::new("sw1", Arc::clone(&store), &fast_config()));

    let item = queue.enqueue(cmds(&["a"])).await.unwrap();
    let waiter = {
        let queue = Arc::clone(&queue);
        let item = item.clone();
        tokio::spawn(async move { queue.wait_for_result(&item, Duration::from_secs(5)).await })
    };
    tokio::task::yield_now().await;

    for i in 0..5000 {
        store
            .put(&format!("other/{i}"), b"noise".to_vec(), None)
            .await
            .unwrap();
    }
    let mut batch = queue.list_pending(None).await.unwrap().remove(0);
    batch.succeed("done".to_string());
    assert!(queue.record_result(&batch).await);

    assert_eq!(waiter.await.unwrap().unwrap(), "done");
}

#[swbatch::test]
async fn wait_for_result_times_out_without_a_worker() {
    let (_mem, store) = memory_store();
    let queue = SwitchQueue::new("sw1", store, &fast_config());

    let item = queue.enqueue(cmds(&["a"])).await.unwrap();
    let err = queue
        .wait_for_result(&item, Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, BatchError::Timeout(_)), "got {err:?}");
}

#[swbatch::test]
async fn wait_for_result_surfaces_device_error() {
    let (_mem, store) = memory_store();
    let queue = SwitchQueue::new("sw1", store, &fast_config());

    let item = queue.enqueue(cmds(&["bogus"])).await.unwrap();
    let mut batch = queue.list_pending(None).await.unwrap().remove(0);
    batch.fail("invalid input detected".to_string());
    assert!(queue.record_result(&batch).await);

    let err = queue
        .wait_for_result(&item, Duration::from_secs(1))
        .await
        .unwrap_err();
    match err {
        BatchError::Device(msg) => assert_eq!(msg, "invalid input detected"),
        other => panic!("expected device error, got {other:?}"),
    }
}

#[swbatch::test]
async fn wait_for_result_reports_a_deleted_result() {
    let (mem, store) = memory_store();
    let queue = SwitchQueue::new("sw1", Arc::clone(&store), &fast_config());

    let item = queue.enqueue(cmds(&["a"])).await.unwrap();
    let mut batch = queue.list_pending(None).await.unwrap().remove(0);
    batch.succeed("gone soon".to_string());
    assert!(queue.record_result(&batch).await);

    // Watch from after the write, so the first event seen is the deletion.
    let late = QueueItem {
        uuid: item.uuid.clone(),
        create_revision: mem.revision() + 1,
    };
    store.delete(&batch.result_key).await.unwrap();

    let err = queue
        .wait_for_result(&late, Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(matches!(err, BatchError::Coordination(_)), "got {err:?}");
}

#[swbatch::test(start_paused = true)]
async fn pending_batches_expire_with_their_lease() {
    let (_mem, store) = memory_store();
    let cfg = swbatch::settings::BatchConfig {
        batch_ttl_secs: 60,
        ..fast_config()
    };
    let queue = SwitchQueue::new("sw1", Arc::clone(&store), &cfg);

    queue.enqueue(cmds(&["a"])).await.unwrap();
    tokio::time::sleep(Duration::from_secs(61)).await;

    assert!(queue.list_pending(None).await.unwrap().is_empty());
    let left = store
        .range(&input_prefix("sw1"), RangeOptions::default())
        .await
        .unwrap();
    assert!(left.is_empty());
}

#[swbatch::test]
async fn acquire_execution_lock_takes_free_slot() {
    let (_mem, store) = memory_store();
    let queue = SwitchQueue::new("sw1", Arc::clone(&store), &fast_config());

    let item = queue.enqueue(cmds(&["a"])).await.unwrap();
    let lock = queue
        .acquire_execution_lock(&item, Duration::from_secs(1), 30, fixed_wait(10))
        .await
        .unwrap()
        .expect("slot was free");
    assert_eq!(lock.key(), "sw1/execute_lock0");
    assert!(lock.is_acquired().await.unwrap());
    lock.release().await.unwrap();
    assert!(store.get("sw1/execute_lock0").await.unwrap().is_none());
}

#[swbatch::test(start_paused = true)]
async fn acquire_execution_lock_gives_up_once_backlog_drains() {
    let (_mem, store) = memory_store();
    let queue = SwitchQueue::new("sw1", Arc::clone(&store), &fast_config());
    let item = queue.enqueue(cmds(&["a"])).await.unwrap();

    let holder = lock_holder(&store, "sw1");
    let LockOutcome::Locked(held) = holder.try_acquire().await.unwrap() else {
        panic!("slot should be free");
    };

    // Another worker finishes the batch while we are backing off.
    let other = SwitchQueue::new("sw1", Arc::clone(&store), &fast_config());
    let mut batch = queue.list_pending(None).await.unwrap().remove(0);
    let finisher = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(250)).await;
        batch.succeed("done elsewhere".to_string());
        assert!(other.record_result(&batch).await);
    });

    let started = tokio::time::Instant::now();
    let lock = queue
        .acquire_execution_lock(&item, Duration::from_secs(10), 30, fixed_wait(100))
        .await
        .unwrap();
    assert!(lock.is_none());
    assert!(started.elapsed() < Duration::from_secs(1));

    finisher.await.unwrap();
    assert!(held.is_acquired().await.unwrap());
}

#[swbatch::test(start_paused = true)]
async fn acquire_execution_lock_times_out_while_work_remains() {
    let (_mem, store) = memory_store();
    let queue = SwitchQueue::new("sw1", Arc::clone(&store), &fast_config());
    let item = queue.enqueue(cmds(&["a"])).await.unwrap();

    let holder = lock_holder(&store, "sw1");
    let LockOutcome::Locked(_held) = holder.try_acquire().await.unwrap() else {
        panic!("slot should be free");
    };

    let err = queue
        .acquire_execution_lock(&item, Duration::from_secs(2), 30, fixed_wait(100))
        .await
        .unwrap_err();
    assert!(matches!(err, BatchError::Timeout(_)), "got {err:?}");
}

#[swbatch::test]
async fn clear_execution_locks_frees_stuck_slots() {
    let (_mem, store) = memory_store();
    let queue = SwitchQueue::new("sw1", Arc::clone(&store), &fast_config());
    let item = queue.enqueue(cmds(&["a"])).await.unwrap();

    let holder = lock_holder(&store, "sw1");
    let LockOutcome::Locked(_stuck) = holder.try_acquire().await.unwrap() else {
        panic!("slot should be free");
    };

    assert_eq!(queue.clear_execution_locks().await.unwrap(), 1);
    let lock = queue
        .acquire_execution_lock(&item, Duration::from_secs(1), 30, fixed_wait(10))
        .await
        .unwrap();
    assert!(lock.is_some());
}
