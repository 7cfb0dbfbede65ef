//! Embedded ordered key-value store with serializable snapshot transactions.
//!
//! This is the store contract the queue layer is written against: ordered
//! byte-string keys, multi-key transactions with optimistic conflict
//! detection, read versions on a logical clock, little-endian atomic adds,
//! key-selector resolution, and key watches. The whole database lives in
//! memory behind a cheap-to-clone handle, which also makes it the simulation
//! substrate for tests: `advance_version` skews the logical clock forward to
//! expire leases deterministically.

mod transaction;

pub use transaction::{KeySelector, RangeResult, Transaction, Watch};

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::oneshot;

use crate::settings::CORE_VERSIONS_PER_SECOND;

/// How many committed transactions are retained for conflict checking. A
/// transaction older than the retained window fails with `PastVersion`.
const COMMIT_WINDOW: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("transaction conflict; a later commit wrote a key this transaction read")]
    Conflict,
    #[error("transaction read version has fallen out of the retained commit window")]
    PastVersion,
    #[error("watch dropped before the key changed")]
    WatchLost,
}

impl StoreError {
    /// Retryable errors are consumed by transaction retry loops; everything
    /// else propagates to the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Conflict | StoreError::PastVersion)
    }
}

/// One historical value of a key. `None` records a clear.
pub(crate) struct Revision {
    pub(crate) version: i64,
    pub(crate) value: Option<Vec<u8>>,
}

pub(crate) struct CommitRecord {
    pub(crate) version: i64,
    /// Half-open key ranges written by this commit; points are `[k, k+0x00)`.
    pub(crate) writes: Vec<(Vec<u8>, Vec<u8>)>,
}

pub(crate) struct State {
    pub(crate) entries: BTreeMap<Vec<u8>, Vec<Revision>>,
    pub(crate) commit_version: i64,
    epoch: Instant,
    skew: i64,
    pub(crate) commits: VecDeque<CommitRecord>,
    pub(crate) pruned_through: i64,
    pub(crate) watches: HashMap<Vec<u8>, Vec<oneshot::Sender<()>>>,
}

impl State {
    /// Read version right now: the logical clock advances with wall-clock
    /// time and never runs behind the last commit.
    pub(crate) fn current_version(&self) -> i64 {
        let elapsed = self.epoch.elapsed().as_micros() as i128;
        let ticked = (elapsed * CORE_VERSIONS_PER_SECOND as i128 / 1_000_000) as i64;
        (ticked + self.skew).max(self.commit_version)
    }
}

/// Latest value of `key` visible at `read_version`.
pub(crate) fn value_at<'a>(revisions: &'a [Revision], read_version: i64) -> Option<&'a [u8]> {
    revisions
        .iter()
        .rev()
        .find(|r| r.version <= read_version)
        .and_then(|r| r.value.as_deref())
}

/// The smallest key strictly greater than `key`.
pub(crate) fn key_after(key: &[u8]) -> Vec<u8> {
    let mut out = key.to_vec();
    out.push(0x00);
    out
}

fn ranges_intersect(reads: &[(Vec<u8>, Vec<u8>)], writes: &[(Vec<u8>, Vec<u8>)]) -> bool {
    reads.iter().any(|(rb, re)| {
        writes
            .iter()
            .any(|(wb, we)| rb.as_slice() < we.as_slice() && wb.as_slice() < re.as_slice())
    })
}

fn key_in_ranges(key: &[u8], ranges: &[(Vec<u8>, Vec<u8>)]) -> bool {
    ranges
        .iter()
        .any(|(b, e)| b.as_slice() <= key && key < e.as_slice())
}

/// Decode a counter value: little-endian, up to eight bytes, missing reads as 0.
pub(crate) fn decode_le64(raw: Option<&[u8]>) -> i64 {
    let mut buf = [0u8; 8];
    if let Some(raw) = raw {
        let n = raw.len().min(8);
        buf[..n].copy_from_slice(&raw[..n]);
    }
    i64::from_le_bytes(buf)
}

/// Handle to a shared in-memory database. Clones share state.
#[derive(Clone)]
pub struct Database {
    pub(crate) state: Arc<Mutex<State>>,
}

impl Default for Database {
    fn default() -> Self {
        Self::new()
    }
}

impl Database {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                entries: BTreeMap::new(),
                commit_version: 0,
                epoch: Instant::now(),
                skew: 0,
                commits: VecDeque::new(),
                pruned_through: 0,
                watches: HashMap::new(),
            })),
        }
    }

    pub fn transaction(&self) -> Transaction {
        Transaction::new(self.clone())
    }

    /// The current read version, without opening a transaction.
    pub async fn read_version(&self) -> i64 {
        self.state.lock().expect("store lock poisoned").current_version()
    }

    /// Simulation hook: push the logical clock forward by `delta` versions.
    /// Leases anchored to versions before the skew become reclaimable.
    pub fn advance_version(&self, delta: i64) {
        let mut st = self.state.lock().expect("store lock poisoned");
        st.skew += delta.max(0);
    }

    pub(crate) fn commit_inner(
        &self,
        read_version: Option<i64>,
        read_conflicts: &[(Vec<u8>, Vec<u8>)],
        write_conflicts: Vec<(Vec<u8>, Vec<u8>)>,
        mutations: Vec<transaction::Mutation>,
        watches: Vec<(Vec<u8>, oneshot::Sender<()>)>,
    ) -> Result<i64, StoreError> {
        let mut st = self.state.lock().expect("store lock poisoned");

        if !read_conflicts.is_empty() {
            let rv = read_version.unwrap_or(0);
            if rv < st.pruned_through {
                return Err(StoreError::PastVersion);
            }
            for commit in st.commits.iter().rev() {
                if commit.version <= rv {
                    break;
                }
                if ranges_intersect(read_conflicts, &commit.writes) {
                    return Err(StoreError::Conflict);
                }
            }
        }

        let version = st.current_version() + 1;
        st.commit_version = version;

        for mutation in mutations {
            match mutation {
                transaction::Mutation::Set(key, value) => {
                    st.entries
                        .entry(key)
                        .or_default()
                        .push(Revision { version, value: Some(value) });
                }
                transaction::Mutation::Clear(key) => {
                    if let Some(revs) = st.entries.get_mut(&key) {
                        revs.push(Revision { version, value: None });
                    }
                }
                transaction::Mutation::ClearRange(begin, end) => {
                    let live: Vec<Vec<u8>> = st
                        .entries
                        .range::<[u8], _>((
                            std::ops::Bound::Included(begin.as_slice()),
                            std::ops::Bound::Excluded(end.as_slice()),
                        ))
                        .filter(|(_, revs)| revs.last().is_some_and(|r| r.value.is_some()))
                        .map(|(k, _)| k.clone())
                        .collect();
                    for key in live {
                        if let Some(revs) = st.entries.get_mut(&key) {
                            revs.push(Revision { version, value: None });
                        }
                    }
                }
                transaction::Mutation::Add(key, delta) => {
                    let revs = st.entries.entry(key).or_default();
                    let current = decode_le64(revs.last().and_then(|r| r.value.as_deref()));
                    revs.push(Revision {
                        version,
                        value: Some(current.wrapping_add(delta).to_le_bytes().to_vec()),
                    });
                }
            }
        }

        st.commits.push_back(CommitRecord {
            version,
            writes: write_conflicts.clone(),
        });
        while st.commits.len() > COMMIT_WINDOW {
            if let Some(dropped) = st.commits.pop_front() {
                st.pruned_through = dropped.version;
            }
        }

        // Fire watches whose key was touched by this commit, keep the rest.
        let mut fired = Vec::new();
        st.watches.retain(|key, senders| {
            if key_in_ranges(key, &write_conflicts) {
                fired.append(senders);
                false
            } else {
                true
            }
        });
        for sender in fired {
            let _ = sender.send(());
        }

        for (key, sender) in watches {
            st.watches.entry(key).or_default().push(sender);
        }

        Ok(version)
    }
}

/// Jittered exponential backoff for transaction retry loops. Batch-priority
/// transactions back off further so interactive work wins contended keys.
pub struct RetryBackoff {
    attempt: u32,
    batch: bool,
}

impl RetryBackoff {
    pub fn new(batch: bool) -> Self {
        Self { attempt: 0, batch }
    }

    pub async fn pause(&mut self) {
        let cap_ms: u64 = if self.batch { 5_000 } else { 1_000 };
        let base_ms = 10u64.saturating_mul(1 << self.attempt.min(10));
        let ms = base_ms.min(cap_ms);
        let jittered = ms / 2 + (rand::random::<f64>() * (ms as f64) / 2.0) as u64;
        tokio::time::sleep(Duration::from_millis(jittered)).await;
        self.attempt = self.attempt.saturating_add(1);
    }
}
