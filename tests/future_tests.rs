mod test_helpers;

use hopper::task::PARAM_TYPE;
use hopper::{CompletionKey, Task};
use test_helpers::*;

#[tokio::test]
async fn fresh_future_is_unset_until_set() {
    let (db, bucket, futures) = open_bucket();

    let tr = db.transaction();
    let future = futures.future(&tr);
    assert!(!future.is_set(&tr).await.expect("is_set"));
    tr.commit().await.expect("commit");

    let tr = db.transaction();
    let handle = futures.unpack(&future.key);
    assert!(!handle.is_set(&tr).await.expect("is_set"));
    handle.set(&tr, &bucket).await.expect("set");
    assert!(handle.is_set(&tr).await.expect("is_set"));
    tr.commit().await.expect("commit");

    let tr = db.transaction();
    assert!(futures.unpack(&future.key).is_set(&tr).await.expect("is_set"));
}

#[tokio::test]
async fn set_twice_is_idempotent() {
    let (db, bucket, futures) = open_bucket();

    let tr = db.transaction();
    let future = futures.future(&tr);
    let mut enqueue_me = Task::new(b"idle", 1, b"", 0);
    future
        .on_set_add_task(&tr, &bucket, &mut enqueue_me)
        .await
        .expect("on_set_add_task");
    tr.commit().await.expect("commit");

    let tr = db.transaction();
    let handle = futures.unpack(&future.key);
    handle.set(&tr, &bucket).await.expect("set");
    tr.commit().await.expect("commit");
    assert_eq!(task_count(&db, &bucket).await, 1);

    // Second set: no blocks to clear, no callbacks left to run.
    let tr = db.transaction();
    let handle = futures.unpack(&future.key);
    handle.set(&tr, &bucket).await.expect("set");
    tr.commit().await.expect("commit");
    assert_eq!(task_count(&db, &bucket).await, 1, "callbacks run exactly once");
}

#[tokio::test]
async fn and_join_fires_only_after_every_input() {
    let (db, bucket, futures) = open_bucket();

    let tr = db.transaction();
    let parent = futures.future(&tr);
    let f1 = futures.future(&tr);
    let f2 = futures.future(&tr);
    parent
        .join(&tr, &bucket, &[f1.clone(), f2.clone()])
        .await
        .expect("join");
    let mut on_done = Task::new(b"idle", 1, b"", 0);
    parent
        .on_set_add_task(&tr, &bucket, &mut on_done)
        .await
        .expect("on_set_add_task");
    tr.commit().await.expect("commit setup");

    // First input set: parent still blocked, nothing enqueued.
    let tr = db.transaction();
    futures
        .unpack(&f1.key)
        .set(&tr, &bucket)
        .await
        .expect("set f1");
    tr.commit().await.expect("commit f1");

    let tr = db.transaction();
    assert!(!futures.unpack(&parent.key).is_set(&tr).await.expect("is_set"));
    assert_eq!(task_count(&db, &bucket).await, 0);

    // Second input set: the last block clears, callbacks run, exactly one
    // task lands in the bucket.
    let tr = db.transaction();
    futures
        .unpack(&f2.key)
        .set(&tr, &bucket)
        .await
        .expect("set f2");
    tr.commit().await.expect("commit f2");

    let tr = db.transaction();
    assert!(futures.unpack(&parent.key).is_set(&tr).await.expect("is_set"));
    assert_eq!(task_count(&db, &bucket).await, 1);

    let enqueued = bucket
        .claim_one(&db)
        .await
        .expect("claim")
        .expect("task enqueued");
    assert_eq!(
        enqueued.params.get(PARAM_TYPE),
        Some(&b"idle".to_vec()),
        "the callback re-enqueues under the original type"
    );
}

#[tokio::test]
async fn join_clears_initial_anchor_block() {
    let (db, bucket, futures) = open_bucket();

    // A future joined on one input must set as soon as that input sets; if
    // the empty-string anchor block leaked, it never would.
    let tr = db.transaction();
    let parent = futures.future(&tr);
    let input = futures.future(&tr);
    parent
        .join(&tr, &bucket, std::slice::from_ref(&input))
        .await
        .expect("join");
    tr.commit().await.expect("commit");

    let tr = db.transaction();
    futures
        .unpack(&input.key)
        .set(&tr, &bucket)
        .await
        .expect("set input");
    tr.commit().await.expect("commit");

    let tr = db.transaction();
    assert!(futures.unpack(&parent.key).is_set(&tr).await.expect("is_set"));
}

#[tokio::test]
async fn on_set_after_set_runs_immediately() {
    let (db, bucket, futures) = open_bucket();

    let tr = db.transaction();
    let future = futures.future(&tr);
    future.set(&tr, &bucket).await.expect("set");
    let mut task = Task::new(b"idle", 1, b"", 0);
    future
        .on_set_add_task(&tr, &bucket, &mut task)
        .await
        .expect("on_set_add_task");
    tr.commit().await.expect("commit");

    assert_eq!(task_count(&db, &bucket).await, 1);
}

#[tokio::test]
async fn joined_future_gates_its_parent() {
    let (db, bucket, futures) = open_bucket();

    let tr = db.transaction();
    let parent = futures.future(&tr);
    let child = parent.joined_future(&tr, &bucket).await.expect("joined");
    assert!(!child.is_set(&tr).await.expect("is_set"));
    assert!(!parent.is_set(&tr).await.expect("is_set"));
    tr.commit().await.expect("commit");

    // A subtask signals completion by setting the child; its registered
    // callback clears the parent's block in the same transaction.
    let tr = db.transaction();
    futures
        .unpack(&child.key)
        .set(&tr, &bucket)
        .await
        .expect("set child");
    tr.commit().await.expect("commit");

    let tr = db.transaction();
    assert!(futures.unpack(&parent.key).is_set(&tr).await.expect("is_set"));
}

#[tokio::test]
async fn completion_key_memoizes_its_future() {
    let (db, bucket, futures) = open_bucket();

    let tr = db.transaction();
    let parent = futures.future(&tr);
    let mut completion = CompletionKey::join_with(parent.clone());
    let key_one = completion.get(&tr, &bucket).await.expect("get");
    let key_two = completion.get(&tr, &bucket).await.expect("get");
    assert_eq!(key_one, key_two);
    assert_ne!(key_one, parent.key, "completion key is a fresh joined future");
    tr.commit().await.expect("commit");

    // Completing against the key sets the joined future, which in turn
    // unblocks the parent.
    let tr = db.transaction();
    futures
        .unpack(&key_one)
        .set(&tr, &bucket)
        .await
        .expect("set completion");
    tr.commit().await.expect("commit");

    let tr = db.transaction();
    assert!(futures.unpack(&parent.key).is_set(&tr).await.expect("is_set"));

    let mut signal = CompletionKey::signal(&key_one);
    assert_eq!(signal.get(&tr, &bucket).await.expect("get"), key_one);
}

#[tokio::test]
async fn future_bucket_emptiness_probe() {
    let (db, bucket, futures) = open_bucket();

    let tr = db.transaction();
    assert!(futures.is_empty(&tr).await.expect("is_empty"));
    let future = futures.future(&tr);
    assert!(!futures.is_empty(&tr).await.expect("is_empty"));
    tr.commit().await.expect("commit");

    let tr = db.transaction();
    futures
        .unpack(&future.key)
        .set(&tr, &bucket)
        .await
        .expect("set");
    futures.clear(&tr);
    assert!(futures.is_empty(&tr).await.expect("is_empty"));
    tr.commit().await.expect("commit");
}
