//! Transactions: snapshot reads with a read-your-writes overlay, optimistic
//! conflict tracking, and key-selector resolution over the merged view.

use std::collections::BTreeMap;
use std::future::Future;
use std::ops::Bound;
use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use super::{decode_le64, key_after, value_at, Database, State, StoreError};

/// A buffered write, replayed in order at commit.
pub(crate) enum Mutation {
    Set(Vec<u8>, Vec<u8>),
    Clear(Vec<u8>),
    ClearRange(Vec<u8>, Vec<u8>),
    Add(Vec<u8>, i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SelectorKind {
    LastLessOrEqual,
    LastLessThan,
    FirstGreaterOrEqual,
    FirstGreaterThan,
}

/// Resolves to a key relative to an anchor, against the transaction's view.
#[derive(Debug, Clone)]
pub struct KeySelector {
    key: Vec<u8>,
    kind: SelectorKind,
}

impl KeySelector {
    pub fn last_less_or_equal(key: &[u8]) -> Self {
        Self { key: key.to_vec(), kind: SelectorKind::LastLessOrEqual }
    }

    pub fn last_less_than(key: &[u8]) -> Self {
        Self { key: key.to_vec(), kind: SelectorKind::LastLessThan }
    }

    pub fn first_greater_or_equal(key: &[u8]) -> Self {
        Self { key: key.to_vec(), kind: SelectorKind::FirstGreaterOrEqual }
    }

    pub fn first_greater_than(key: &[u8]) -> Self {
        Self { key: key.to_vec(), kind: SelectorKind::FirstGreaterThan }
    }
}

/// Rows returned by a range read, plus whether the range had more rows past
/// the limit.
#[derive(Debug, Default)]
pub struct RangeResult {
    pub rows: Vec<(Vec<u8>, Vec<u8>)>,
    pub more: bool,
}

/// Completes after a later commit writes or clears the watched key.
/// Registered only if the owning transaction commits.
pub struct Watch {
    rx: oneshot::Receiver<()>,
}

impl Future for Watch {
    type Output = Result<(), StoreError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.map_err(|_| StoreError::WatchLost))
    }
}

struct TxState {
    read_version: Option<i64>,
    /// Read-your-writes view of every key this transaction wrote.
    overlay: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    /// Ranges cleared by this transaction, masking the snapshot.
    cleared: Vec<(Vec<u8>, Vec<u8>)>,
    read_conflicts: Vec<(Vec<u8>, Vec<u8>)>,
    write_conflicts: Vec<(Vec<u8>, Vec<u8>)>,
    mutations: Vec<Mutation>,
    watches: Vec<(Vec<u8>, oneshot::Sender<()>)>,
    batch_priority: bool,
}

impl TxState {
    fn in_cleared(&self, key: &[u8]) -> bool {
        self.cleared
            .iter()
            .any(|(b, e)| b.as_slice() <= key && key < e.as_slice())
    }
}

fn ensure_read_version(tx: &mut TxState, db: &State) -> i64 {
    *tx.read_version.get_or_insert_with(|| db.current_version())
}

fn merged_get(db: &State, tx: &TxState, read_version: i64, key: &[u8]) -> Option<Vec<u8>> {
    if let Some(written) = tx.overlay.get(key) {
        return written.clone();
    }
    if tx.in_cleared(key) {
        return None;
    }
    db.entries
        .get(key)
        .and_then(|revs| value_at(revs, read_version))
        .map(<[u8]>::to_vec)
}

fn merged_range(
    db: &State,
    tx: &TxState,
    read_version: i64,
    begin: &[u8],
    end: &[u8],
) -> Vec<(Vec<u8>, Vec<u8>)> {
    let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
    for (key, revs) in db
        .entries
        .range::<[u8], _>((Bound::Included(begin), Bound::Excluded(end)))
    {
        if tx.in_cleared(key) || tx.overlay.contains_key(key) {
            continue;
        }
        if let Some(value) = value_at(revs, read_version) {
            merged.insert(key.clone(), value.to_vec());
        }
    }
    for (key, written) in tx
        .overlay
        .range::<[u8], _>((Bound::Included(begin), Bound::Excluded(end)))
    {
        if let Some(value) = written {
            merged.insert(key.clone(), value.clone());
        }
    }
    merged.into_iter().collect()
}

fn merged_prev(
    db: &State,
    tx: &TxState,
    read_version: i64,
    bound: &[u8],
    inclusive: bool,
) -> Option<Vec<u8>> {
    let upper = if inclusive {
        Bound::Included(bound)
    } else {
        Bound::Excluded(bound)
    };
    let db_candidate = db
        .entries
        .range::<[u8], _>((Bound::Unbounded, upper))
        .rev()
        .find(|(key, revs)| {
            value_at(revs, read_version).is_some()
                && !tx.in_cleared(key)
                && !matches!(tx.overlay.get(key.as_slice()), Some(None))
        })
        .map(|(key, _)| key.clone());
    let overlay_candidate = tx
        .overlay
        .range::<[u8], _>((Bound::Unbounded, upper))
        .rev()
        .find(|(_, written)| written.is_some())
        .map(|(key, _)| key.clone());
    db_candidate.max(overlay_candidate)
}

fn merged_next(
    db: &State,
    tx: &TxState,
    read_version: i64,
    bound: &[u8],
    inclusive: bool,
) -> Option<Vec<u8>> {
    let lower = if inclusive {
        Bound::Included(bound)
    } else {
        Bound::Excluded(bound)
    };
    let db_candidate = db
        .entries
        .range::<[u8], _>((lower, Bound::Unbounded))
        .find(|(key, revs)| {
            value_at(revs, read_version).is_some()
                && !tx.in_cleared(key)
                && !matches!(tx.overlay.get(key.as_slice()), Some(None))
        })
        .map(|(key, _)| key.clone());
    let overlay_candidate = tx
        .overlay
        .range::<[u8], _>((lower, Bound::Unbounded))
        .find(|(_, written)| written.is_some())
        .map(|(key, _)| key.clone());
    match (db_candidate, overlay_candidate) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

/// A single serializable transaction. Reads see a consistent snapshot at the
/// transaction's read version merged with its own writes; `commit` validates
/// reads against later commits and applies the write set atomically.
pub struct Transaction {
    db: Database,
    tx: Mutex<TxState>,
}

impl Transaction {
    pub(crate) fn new(db: Database) -> Self {
        Self {
            db,
            tx: Mutex::new(TxState {
                read_version: None,
                overlay: BTreeMap::new(),
                cleared: Vec::new(),
                read_conflicts: Vec::new(),
                write_conflicts: Vec::new(),
                mutations: Vec::new(),
                watches: Vec::new(),
                batch_priority: false,
            }),
        }
    }

    /// Read one key. Adds a read conflict on the key.
    pub async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.get_inner(key, false)
    }

    /// Read one key without conflict tracking.
    pub async fn get_snapshot(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.get_inner(key, true)
    }

    fn get_inner(&self, key: &[u8], snapshot: bool) -> Result<Option<Vec<u8>>, StoreError> {
        let mut tx = self.tx.lock().expect("transaction lock poisoned");
        let db = self.db.state.lock().expect("store lock poisoned");
        let rv = ensure_read_version(&mut tx, &db);
        let value = merged_get(&db, &tx, rv, key);
        if !snapshot {
            tx.read_conflicts.push((key.to_vec(), key_after(key)));
        }
        Ok(value)
    }

    /// Read a key range in ascending order, up to `limit` rows.
    pub async fn get_range(
        &self,
        begin: &[u8],
        end: &[u8],
        limit: usize,
    ) -> Result<RangeResult, StoreError> {
        let mut tx = self.tx.lock().expect("transaction lock poisoned");
        let db = self.db.state.lock().expect("store lock poisoned");
        let rv = ensure_read_version(&mut tx, &db);
        let mut rows = merged_range(&db, &tx, rv, begin, end);
        let more = rows.len() > limit;
        rows.truncate(limit);
        let conflict_end = if more {
            rows.last()
                .map(|(key, _)| key_after(key))
                .unwrap_or_else(|| end.to_vec())
        } else {
            end.to_vec()
        };
        tx.read_conflicts.push((begin.to_vec(), conflict_end));
        Ok(RangeResult { rows, more })
    }

    /// Resolve a key selector. Returns `None` when resolution runs off the
    /// corresponding end of the keyspace.
    pub async fn get_key(
        &self,
        selector: KeySelector,
        snapshot: bool,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        let mut tx = self.tx.lock().expect("transaction lock poisoned");
        let db = self.db.state.lock().expect("store lock poisoned");
        let rv = ensure_read_version(&mut tx, &db);
        let resolved = match selector.kind {
            SelectorKind::LastLessOrEqual => merged_prev(&db, &tx, rv, &selector.key, true),
            SelectorKind::LastLessThan => merged_prev(&db, &tx, rv, &selector.key, false),
            SelectorKind::FirstGreaterOrEqual => merged_next(&db, &tx, rv, &selector.key, true),
            SelectorKind::FirstGreaterThan => merged_next(&db, &tx, rv, &selector.key, false),
        };
        if !snapshot {
            // Conflict with the span the resolution depended on: everything
            // between the resolved key and the anchor.
            let (begin, end) = match selector.kind {
                SelectorKind::LastLessOrEqual => (
                    resolved.clone().unwrap_or_default(),
                    key_after(&selector.key),
                ),
                SelectorKind::LastLessThan => {
                    (resolved.clone().unwrap_or_default(), selector.key.clone())
                }
                SelectorKind::FirstGreaterOrEqual => (
                    selector.key.clone(),
                    resolved.as_deref().map(key_after).unwrap_or(vec![0xFF]),
                ),
                SelectorKind::FirstGreaterThan => (
                    key_after(&selector.key),
                    resolved.as_deref().map(key_after).unwrap_or(vec![0xFF]),
                ),
            };
            if begin < end {
                tx.read_conflicts.push((begin, end));
            }
        }
        Ok(resolved)
    }

    /// The transaction's read version, fixing it on first use.
    pub async fn read_version(&self) -> Result<i64, StoreError> {
        let mut tx = self.tx.lock().expect("transaction lock poisoned");
        let db = self.db.state.lock().expect("store lock poisoned");
        Ok(ensure_read_version(&mut tx, &db))
    }

    pub fn set(&self, key: &[u8], value: &[u8]) {
        let mut tx = self.tx.lock().expect("transaction lock poisoned");
        tx.overlay.insert(key.to_vec(), Some(value.to_vec()));
        tx.mutations.push(Mutation::Set(key.to_vec(), value.to_vec()));
        tx.write_conflicts.push((key.to_vec(), key_after(key)));
    }

    pub fn clear(&self, key: &[u8]) {
        let mut tx = self.tx.lock().expect("transaction lock poisoned");
        tx.overlay.insert(key.to_vec(), None);
        tx.mutations.push(Mutation::Clear(key.to_vec()));
        tx.write_conflicts.push((key.to_vec(), key_after(key)));
    }

    pub fn clear_range(&self, begin: &[u8], end: &[u8]) {
        let mut tx = self.tx.lock().expect("transaction lock poisoned");
        let masked: Vec<Vec<u8>> = tx
            .overlay
            .range::<[u8], _>((Bound::Included(begin), Bound::Excluded(end)))
            .map(|(key, _)| key.clone())
            .collect();
        for key in masked {
            tx.overlay.remove(&key);
        }
        tx.cleared.push((begin.to_vec(), end.to_vec()));
        tx.mutations
            .push(Mutation::ClearRange(begin.to_vec(), end.to_vec()));
        tx.write_conflicts.push((begin.to_vec(), end.to_vec()));
    }

    /// Little-endian 64-bit atomic add. Reads nothing conflict-wise; two
    /// concurrent adds to the same key both commit.
    pub fn atomic_add(&self, key: &[u8], delta: i64) {
        let mut tx = self.tx.lock().expect("transaction lock poisoned");
        let db = self.db.state.lock().expect("store lock poisoned");
        let rv = ensure_read_version(&mut tx, &db);
        let current = decode_le64(merged_get(&db, &tx, rv, key).as_deref());
        tx.overlay.insert(
            key.to_vec(),
            Some(current.wrapping_add(delta).to_le_bytes().to_vec()),
        );
        tx.mutations.push(Mutation::Add(key.to_vec(), delta));
        tx.write_conflicts.push((key.to_vec(), key_after(key)));
    }

    /// Watch a key for changes. The watch is armed only if this transaction
    /// commits; it completes when a later commit writes or clears the key.
    pub fn watch(&self, key: &[u8]) -> Watch {
        let (tx_side, rx) = oneshot::channel();
        let mut tx = self.tx.lock().expect("transaction lock poisoned");
        tx.watches.push((key.to_vec(), tx_side));
        Watch { rx }
    }

    /// Mark this transaction as batch priority: it defers to interactive
    /// work when scheduling its commit and backs off longer on conflicts.
    pub fn set_batch_priority(&self) {
        let mut tx = self.tx.lock().expect("transaction lock poisoned");
        tx.batch_priority = true;
    }

    pub fn is_batch_priority(&self) -> bool {
        self.tx.lock().expect("transaction lock poisoned").batch_priority
    }

    /// Commit the write set. Retryable failures (`Conflict`, `PastVersion`)
    /// mean the caller should rebuild the transaction and re-run its body.
    pub async fn commit(self) -> Result<i64, StoreError> {
        let tx = self.tx.into_inner().expect("transaction lock poisoned");
        if tx.batch_priority {
            tokio::task::yield_now().await;
        }
        if tx.mutations.is_empty() && tx.watches.is_empty() {
            // Read-only transactions validate trivially under snapshot reads.
            return Ok(tx.read_version.unwrap_or(0));
        }
        self.db.commit_inner(
            tx.read_version,
            &tx.read_conflicts,
            tx.write_conflicts,
            tx.mutations,
            tx.watches,
        )
    }
}
