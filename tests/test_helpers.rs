#![allow(dead_code)]

use hopper::{BucketSettings, Database, Element, FutureBucket, Subspace, TaskBucket};

// Helper: enforce a tight timeout for async tests likely to hang
#[macro_export]
macro_rules! with_timeout {
    ($ms:expr, $body:block) => {{
        tokio::time::timeout(std::time::Duration::from_millis($ms), async { $body })
            .await
            .expect("test timed out")
    }};
}

pub const BUCKET_PREFIX: &[u8] = b"tb";
pub const FUTURE_PREFIX: &[u8] = b"fb";

pub fn open_bucket() -> (Database, TaskBucket, FutureBucket) {
    open_bucket_with(&BucketSettings::default())
}

pub fn open_bucket_with(settings: &BucketSettings) -> (Database, TaskBucket, FutureBucket) {
    hopper::trace::init();
    let db = Database::new();
    let bucket = TaskBucket::new(Subspace::from_bytes(BUCKET_PREFIX), settings);
    let futures = FutureBucket::new(Subspace::from_bytes(FUTURE_PREFIX));
    (db, bucket, futures)
}

/// The available subspace for one priority, reconstructed from the persisted
/// layout so tests can assert on raw rows.
pub fn available_space(priority: i64) -> Subspace {
    Subspace::from_bytes(BUCKET_PREFIX)
        .get(Element::Bytes(b"avp".to_vec()))
        .get(Element::Int(priority))
}

/// The timeouts subspace, reconstructed from the persisted layout.
pub fn timeouts_space() -> Subspace {
    Subspace::from_bytes(BUCKET_PREFIX).get(Element::Bytes(b"to".to_vec()))
}

/// The active-marker key.
pub fn active_marker_key() -> Vec<u8> {
    Subspace::from_bytes(BUCKET_PREFIX)
        .get(Element::Bytes(b"ac".to_vec()))
        .key()
        .to_vec()
}

pub async fn rows_in(db: &Database, subspace: &Subspace) -> Vec<(Vec<u8>, Vec<u8>)> {
    let tr = db.transaction();
    let (begin, end) = subspace.range();
    tr.get_range(&begin, &end, 1_000_000)
        .await
        .expect("range read")
        .rows
}

pub async fn count_rows(db: &Database, subspace: &Subspace) -> usize {
    rows_in(db, subspace).await.len()
}

pub async fn task_count(db: &Database, bucket: &TaskBucket) -> i64 {
    let tr = db.transaction();
    bucket.get_task_count(&tr).await.expect("task count")
}

pub async fn read_key(db: &Database, key: &[u8]) -> Option<Vec<u8>> {
    let tr = db.transaction();
    tr.get_snapshot(key).await.expect("read")
}

/// Distinct task uids with at least one row in `subspace`, assuming the
/// layout `<subspace>/<uid or deadline>/...` used by the bucket keyspaces.
pub fn uids_at(subspace: &Subspace, rows: &[(Vec<u8>, Vec<u8>)], uid_index: usize) -> std::collections::BTreeSet<Vec<u8>> {
    rows.iter()
        .filter_map(|(key, _)| {
            let decoded = subspace.unpack(key).ok()?;
            decoded
                .get(uid_index)
                .and_then(Element::as_bytes)
                .map(<[u8]>::to_vec)
        })
        .collect()
}
