mod test_helpers;

use hopper::task::{PARAM_PRIORITY, PARAM_TYPE};
use hopper::{BucketSettings, Element, Task, TaskError};
use test_helpers::*;

#[tokio::test]
async fn single_task_lifecycle() {
    let (db, bucket, futures) = open_bucket();

    // Enqueue: exactly one row, avp/0/<uid>/type = "idle", counter at 1.
    let tr = db.transaction();
    let task = Task::new(b"idle", 1, b"", 0);
    let uid = bucket.add_task(&tr, &task);
    tr.commit().await.expect("commit enqueue");

    let avp0 = available_space(0);
    let rows = rows_in(&db, &avp0).await;
    let type_row: Vec<_> = rows
        .iter()
        .filter(|(key, _)| {
            avp0.unpack(key).unwrap()
                == vec![
                    Element::Bytes(uid.clone()),
                    Element::Bytes(PARAM_TYPE.to_vec()),
                ]
        })
        .collect();
    assert_eq!(type_row.len(), 1);
    assert_eq!(type_row[0].1, b"idle".to_vec());
    assert_eq!(task_count(&db, &bucket).await, 1);

    // Claim: rows move to timeouts, marker changes, counter unchanged.
    let marker_before = read_key(&db, &active_marker_key()).await;
    let tr = db.transaction();
    let claimed = bucket
        .get_one(&tr)
        .await
        .expect("claim")
        .expect("task available");
    tr.commit().await.expect("commit claim");

    assert_eq!(claimed.uid, uid);
    assert_eq!(count_rows(&db, &avp0).await, 0);
    assert!(count_rows(&db, &timeouts_space()).await > 0);
    let marker_after = read_key(&db, &active_marker_key()).await;
    assert_ne!(marker_before, marker_after, "claim rewrites the active marker");
    assert_eq!(task_count(&db, &bucket).await, 1);

    // Finalize through the idle handler: everything drains.
    let finished = bucket
        .do_task(&db, &futures, claimed)
        .await
        .expect("do_task");
    assert!(finished);
    assert_eq!(count_rows(&db, &timeouts_space()).await, 0);
    assert_eq!(task_count(&db, &bucket).await, 0);

    let tr = db.transaction();
    assert!(bucket.is_empty(&tr).await.expect("is_empty"));
}

#[tokio::test]
async fn higher_priority_claims_first() {
    let (db, bucket, _futures) = open_bucket();

    let tr = db.transaction();
    bucket.add_task(&tr, &Task::new(b"idle", 1, b"", 2));
    bucket.add_task(&tr, &Task::new(b"idle", 1, b"", 0));
    tr.commit().await.expect("commit");

    let first = bucket
        .claim_one(&db)
        .await
        .expect("claim")
        .expect("task available");
    assert_eq!(
        first.priority(),
        2,
        "priority 2 task claims before priority 0"
    );
    assert_eq!(
        first.params.get(PARAM_PRIORITY),
        Some(&2i64.to_le_bytes().to_vec())
    );

    let second = bucket
        .claim_one(&db)
        .await
        .expect("claim")
        .expect("task available");
    assert_eq!(second.priority(), 0);

    let third = bucket.claim_one(&db).await.expect("claim");
    assert!(third.is_none());
}

#[tokio::test]
async fn expired_lease_requeues_with_same_params() {
    let (db, bucket, _futures) = open_bucket();

    let tr = db.transaction();
    let mut task = Task::new(b"idle", 1, b"", 0);
    task.params.insert(b"payload".to_vec(), b"important".to_vec());
    bucket.add_task(&tr, &task);
    tr.commit().await.expect("commit");

    let claimed = bucket
        .claim_one(&db)
        .await
        .expect("claim")
        .expect("task available");

    // Nothing else is claimable while the lease is live.
    assert!(bucket.claim_one(&db).await.expect("claim").is_none());

    // Expire the lease: skew the clock well past the jittered deadline.
    db.advance_version(bucket_lease_upper_bound());

    let reclaimed = bucket
        .claim_one(&db)
        .await
        .expect("claim")
        .expect("expired task comes back");
    assert_eq!(reclaimed.uid, claimed.uid);
    assert_eq!(reclaimed.params, claimed.params);
    assert_eq!(task_count(&db, &bucket).await, 1);
}

fn bucket_lease_upper_bound() -> i64 {
    // Default lease is 60s of versions, jittered up to 1.1x.
    2 * hopper::settings::DEFAULT_TIMEOUT_VERSIONS
}

#[tokio::test]
async fn requeue_never_splits_a_task_across_scan_windows() {
    let (db, bucket, _futures) = open_bucket();

    // Enough rows that one requeue scan (MAX_TASK_KEYS) truncates mid-task.
    let total_tasks = 400;
    let tr = db.transaction();
    for i in 0..total_tasks {
        let mut task = Task::new(b"idle", 1, b"", 0);
        task.params
            .insert(b"a".to_vec(), format!("{i}").into_bytes());
        task.params
            .insert(b"b".to_vec(), format!("{i}").into_bytes());
        bucket.add_task(&tr, &task);
    }
    tr.commit().await.expect("commit enqueue");

    let mut claimed = 0;
    while bucket.claim_one(&db).await.expect("claim").is_some() {
        claimed += 1;
    }
    assert_eq!(claimed, total_tasks);

    db.advance_version(bucket_lease_upper_bound());

    // One truncated sweep: some tasks move back, none may be half-moved.
    let tr = db.transaction();
    let moved = bucket.requeue_timed_out(&tr).await.expect("requeue");
    tr.commit().await.expect("commit requeue");
    assert!(moved);

    let avp_rows = rows_in(&db, &available_space(0)).await;
    let to_rows = rows_in(&db, &timeouts_space()).await;
    let avp_uids = uids_at(&available_space(0), &avp_rows, 0);
    let to_uids = uids_at(&timeouts_space(), &to_rows, 1);
    assert!(
        avp_uids.is_disjoint(&to_uids),
        "a task's rows must live in exactly one keyspace"
    );
    assert_eq!(avp_rows.len() + to_rows.len(), total_tasks * 4);
    assert_eq!(avp_uids.len() + to_uids.len(), total_tasks);

    // Further sweeps drain the rest.
    loop {
        let tr = db.transaction();
        let moved = bucket.requeue_timed_out(&tr).await.expect("requeue");
        tr.commit().await.expect("commit requeue");
        if !moved {
            break;
        }
    }
    assert_eq!(count_rows(&db, &timeouts_space()).await, 0);
    let avp_rows = rows_in(&db, &available_space(0)).await;
    assert_eq!(uids_at(&available_space(0), &avp_rows, 0).len(), total_tasks);
    assert_eq!(task_count(&db, &bucket).await, total_tasks as i64);
}

#[tokio::test]
async fn save_and_extend_moves_the_lease_forward() {
    let (db, bucket, _futures) = open_bucket();

    let tr = db.transaction();
    bucket.add_task(&tr, &Task::new(b"idle", 1, b"", 0));
    tr.commit().await.expect("commit");

    let mut task = bucket
        .claim_one(&db)
        .await
        .expect("claim")
        .expect("task available");
    let old_deadline = task.timeout_version;
    let rows_before = count_rows(&db, &timeouts_space()).await;

    // Push the clock far enough that the re-anchored lease lands past any
    // jittered original deadline.
    db.advance_version(10_000_000);
    let tr = db.transaction();
    let extended = bucket
        .save_and_extend(&tr, &mut task)
        .await
        .expect("save_and_extend");
    tr.commit().await.expect("commit extend");

    assert!(extended);
    assert!(task.timeout_version > old_deadline);
    // Same rows, exactly one lease-deadline subspace.
    assert_eq!(count_rows(&db, &timeouts_space()).await, rows_before);
    let tr = db.transaction();
    assert!(!bucket.is_finished(&tr, &task).await.expect("is_finished"));

    // A handle still pointing at the old deadline reads as finished, so a
    // stale worker knows to stop.
    let mut stale = task.clone();
    stale.timeout_version = old_deadline;
    let tr = db.transaction();
    assert!(bucket.is_finished(&tr, &stale).await.expect("is_finished"));
    let extended = bucket
        .save_and_extend(&tr, &mut stale)
        .await
        .expect("save_and_extend");
    assert!(!extended, "extension refuses a task that lost its rows");
}

#[tokio::test]
async fn busy_and_empty_probes() {
    let (db, bucket, futures) = open_bucket();

    let tr = db.transaction();
    assert!(!bucket.is_busy(&tr).await.expect("is_busy"));
    assert!(bucket.is_empty(&tr).await.expect("is_empty"));

    let tr = db.transaction();
    bucket.add_task(&tr, &Task::new(b"idle", 1, b"", 1));
    tr.commit().await.expect("commit");

    let tr = db.transaction();
    assert!(bucket.is_busy(&tr).await.expect("is_busy"));
    assert!(!bucket.is_empty(&tr).await.expect("is_empty"));

    let claimed = bucket
        .claim_one(&db)
        .await
        .expect("claim")
        .expect("task available");
    // Claimed but unfinished: not busy, still not empty.
    let tr = db.transaction();
    assert!(!bucket.is_busy(&tr).await.expect("is_busy"));
    assert!(!bucket.is_empty(&tr).await.expect("is_empty"));

    assert!(bucket.do_task(&db, &futures, claimed).await.expect("do_task"));
    let tr = db.transaction();
    assert!(bucket.is_empty(&tr).await.expect("is_empty"));
}

#[tokio::test]
async fn validation_key_must_exist_at_enqueue() {
    let (db, bucket, _futures) = open_bucket();

    let tr = db.transaction();
    let mut task = Task::new(b"idle", 1, b"", 0);
    let err = bucket
        .add_task_validated(&tr, &mut task, b"missing-witness")
        .await
        .expect_err("enqueue must fail");
    assert!(matches!(err, TaskError::InvalidValidationKey { .. }));
    assert_eq!(task_count(&db, &bucket).await, 0);
}

#[tokio::test]
async fn watch_task_count_fires_on_enqueue() {
    let (db, bucket, _futures) = open_bucket();

    let tr = db.transaction();
    let watch = bucket.watch_task_count(&tr);
    tr.set(b"seed", b"");
    tr.commit().await.expect("commit watch");

    let tr = db.transaction();
    bucket.add_task(&tr, &Task::new(b"idle", 1, b"", 0));
    tr.commit().await.expect("commit enqueue");

    with_timeout!(1_000, {
        watch.await.expect("counter watch fires");
    });
}

#[tokio::test]
async fn check_active_sees_worker_progress() {
    let (db, bucket, futures) = open_bucket();

    // No workers: the seeded idle task sits unclaimed and the marker never
    // changes.
    let active = with_timeout!(5_000, {
        bucket.check_active(&db).await.expect("check_active")
    });
    assert!(!active);

    // A worker claiming anything rewrites the marker.
    let worker = {
        let (db, bucket, futures) = (db.clone(), bucket.clone(), futures.clone());
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            bucket.do_one(&db, &futures).await.expect("do_one")
        })
    };
    let active = with_timeout!(5_000, {
        bucket.check_active(&db).await.expect("check_active")
    });
    assert!(active);
    assert!(worker.await.expect("worker join"), "worker found the idle task");
}

#[tokio::test]
async fn clear_wipes_the_bucket() {
    let (db, bucket, _futures) = open_bucket();

    let tr = db.transaction();
    for _ in 0..3 {
        bucket.add_task(&tr, &Task::new(b"idle", 1, b"", 1));
    }
    tr.commit().await.expect("commit");
    let _ = bucket.claim_one(&db).await.expect("claim");

    let tr = db.transaction();
    bucket.clear(&tr);
    tr.commit().await.expect("commit clear");

    assert_eq!(count_rows(&db, &available_space(1)).await, 0);
    assert_eq!(count_rows(&db, &timeouts_space()).await, 0);
    assert_eq!(task_count(&db, &bucket).await, 0);
    let tr = db.transaction();
    assert!(bucket.is_empty(&tr).await.expect("is_empty"));
}

#[tokio::test]
async fn add_task_get_one_finish_round_trip() {
    let (db, bucket, futures) = open_bucket();

    let count_before = task_count(&db, &bucket).await;
    let avp_before = count_rows(&db, &available_space(0)).await;

    let tr = db.transaction();
    bucket.add_task(&tr, &Task::new(b"idle", 1, b"", 0));
    tr.commit().await.expect("commit");

    let claimed = bucket
        .claim_one(&db)
        .await
        .expect("claim")
        .expect("task available");
    assert!(bucket.do_task(&db, &futures, claimed).await.expect("do_task"));

    assert_eq!(task_count(&db, &bucket).await, count_before);
    assert_eq!(count_rows(&db, &available_space(0)).await, avp_before);
    assert_eq!(count_rows(&db, &timeouts_space()).await, 0);
}

#[tokio::test]
async fn settings_deserialize_with_defaults() {
    let settings: BucketSettings = toml::from_str("max_priority = 3").expect("parse");
    assert_eq!(settings.max_priority, 3);
    assert_eq!(
        settings.timeout_versions,
        hopper::settings::DEFAULT_TIMEOUT_VERSIONS
    );
    assert!(!settings.priority_batch);
}
