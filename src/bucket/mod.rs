//! TaskBucket - the durable priority task queue.
//!
//! A bucket owns a keyspace prefix partitioned into:
//!
//! - `avp/<priority>/<uid>/<param>` - available tasks, by priority
//! - `to/<deadline>/<uid>/<param>` - claimed tasks, by lease deadline version
//! - `ac` - the active marker, rewritten on every successful claim
//! - `task_count` - a little-endian counter maintained with atomic adds
//!
//! Implementation is split across submodules:
//!
//! - `claim`: the `get_one` claim algorithm and timed-out task requeueing
//! - `exec`: the execute/finalize cycle for one claimed task
//! - `run`: the bounded-concurrency worker driver

mod claim;
mod exec;
mod run;

use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use crate::future::FutureBucket;
use crate::settings::{
    BucketSettings, CHECK_ACTIVE_AMOUNT, CHECK_ACTIVE_DELAY_MS,
};
use crate::store::{Database, RetryBackoff, StoreError, Transaction, Watch};
use crate::subspace::Subspace;
use crate::task::{random_uid, Task};
use crate::tuple::{Element, TupleError};

#[derive(Debug, Error)]
pub enum TaskError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Tuple(#[from] TupleError),
    #[error("unexpected key shape in the {0} subspace")]
    Layout(&'static str),
    #[error("validation key {key:?} was not present at enqueue")]
    InvalidValidationKey { key: Vec<u8> },
    #[error("task type {name:?} is not registered")]
    UnknownTaskType { name: Vec<u8> },
}

impl TaskError {
    /// True for errors a transaction retry loop should absorb.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TaskError::Store(e) if e.is_retryable())
    }
}

/// The queue structure. Cheap to clone; clones address the same keyspace.
#[derive(Debug, Clone)]
pub struct TaskBucket {
    pub(crate) prefix: Subspace,
    pub(crate) active: Subspace,
    pub(crate) available_prioritized: Subspace,
    pub(crate) timeouts: Subspace,
    pub(crate) timeout_versions: i64,
    pub(crate) max_priority: i64,
    pub(crate) check_timeout_chance: f64,
    pub(crate) priority_batch: bool,
    pub(crate) fault_injection: bool,
}

impl TaskBucket {
    pub fn new(prefix: Subspace, settings: &BucketSettings) -> Self {
        Self {
            active: prefix.get(Element::Bytes(b"ac".to_vec())),
            available_prioritized: prefix.get(Element::Bytes(b"avp".to_vec())),
            timeouts: prefix.get(Element::Bytes(b"to".to_vec())),
            prefix,
            timeout_versions: settings.timeout_versions,
            max_priority: settings.max_priority,
            check_timeout_chance: settings.check_timeout_chance,
            priority_batch: settings.priority_batch,
            fault_injection: settings.timeout_fault_injection,
        }
    }

    /// The available subspace for one priority level.
    pub(crate) fn available_space(&self, priority: i64) -> Subspace {
        self.available_prioritized.get(Element::Int(priority))
    }

    pub(crate) fn counter_key(&self) -> Vec<u8> {
        self.prefix.pack(&[Element::Bytes(b"task_count".to_vec())])
    }

    /// Write `task`'s params under a fresh uid in its priority's available
    /// subspace and bump the task counter. Returns the generated uid.
    pub fn add_task(&self, tr: &Transaction, task: &Task) -> Vec<u8> {
        let uid = random_uid();
        let space = self
            .available_space(task.priority())
            .get(Element::Bytes(uid.clone()));
        for (name, value) in &task.params {
            tr.set(&space.pack(&[Element::Bytes(name.clone())]), value);
        }
        tr.atomic_add(&self.counter_key(), 1);
        debug!(priority = task.priority(), "enqueued task");
        uid
    }

    /// Enqueue bound to a transaction witness: reads `validation_key` now and
    /// stamps its value into the task, so the task silently invalidates the
    /// moment any other committer overwrites that key. Fails if the key is
    /// absent at enqueue time.
    pub async fn add_task_validated(
        &self,
        tr: &Transaction,
        task: &mut Task,
        validation_key: &[u8],
    ) -> Result<Vec<u8>, TaskError> {
        let Some(value) = tr.get(validation_key).await? else {
            tracing::error!(key = ?validation_key, "validation key missing at enqueue");
            return Err(TaskError::InvalidValidationKey {
                key: validation_key.to_vec(),
            });
        };
        task.set_validation(validation_key, &value);
        Ok(self.add_task(tr, task))
    }

    /// Enqueue with a caller-supplied witness value; no read is performed.
    pub fn add_task_with_validation(
        &self,
        tr: &Transaction,
        task: &mut Task,
        validation_key: &[u8],
        validation_value: &[u8],
    ) -> Vec<u8> {
        task.set_validation(validation_key, validation_value);
        self.add_task(tr, task)
    }

    /// Clear the claimed task's timeout rows and decrement the counter. Must
    /// only run once per task instance; callers go through the finalize path
    /// which guards with [`TaskBucket::is_finished`].
    pub fn finish(&self, tr: &Transaction, task: &Task) {
        tr.atomic_add(&self.counter_key(), -1);
        let (begin, end) = self.timeouts.range_of(&[
            Element::Int(task.timeout_version),
            Element::Bytes(task.uid.clone()),
        ]);
        tr.clear_range(&begin, &end);
    }

    /// True iff the task's timeout rows are gone, i.e. some finalize already
    /// claimed completion.
    pub async fn is_finished(&self, tr: &Transaction, task: &Task) -> Result<bool, TaskError> {
        let (begin, end) = self.timeouts.range_of(&[
            Element::Int(task.timeout_version),
            Element::Bytes(task.uid.clone()),
        ]);
        let rows = tr.get_range(&begin, &end, 1).await?;
        Ok(rows.rows.is_empty())
    }

    /// Re-anchor the task's lease at the current read version: clears the old
    /// timeout rows and rewrites params under the new deadline. Returns false
    /// if the task was already finalized (or reclaimed), in which case the
    /// caller must stop treating the task as its own.
    pub async fn save_and_extend(
        &self,
        tr: &Transaction,
        task: &mut Task,
    ) -> Result<bool, TaskError> {
        if self.is_finished(tr, task).await? {
            return Ok(false);
        }
        let (begin, end) = self.timeouts.range_of(&[
            Element::Int(task.timeout_version),
            Element::Bytes(task.uid.clone()),
        ]);
        tr.clear_range(&begin, &end);

        let version = tr.read_version().await?;
        task.timeout_version = version + self.timeout_versions;
        let space = self
            .timeouts
            .get(Element::Int(task.timeout_version))
            .get(Element::Bytes(task.uid.clone()));
        for (name, value) in &task.params {
            tr.set(&space.pack(&[Element::Bytes(name.clone())]), value);
        }
        Ok(true)
    }

    /// Busy iff any priority level has available tasks.
    pub async fn is_busy(&self, tr: &Transaction) -> Result<bool, TaskError> {
        let spaces: Vec<(Vec<u8>, Vec<u8>)> = (0..=self.max_priority)
            .map(|priority| self.available_space(priority).range())
            .collect();
        let reads = futures::future::join_all(
            spaces
                .iter()
                .map(|(begin, end)| tr.get_range(begin, end, 1)),
        )
        .await;
        for read in reads {
            if !read?.rows.is_empty() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Empty iff no available tasks at any priority and no claimed tasks.
    pub async fn is_empty(&self, tr: &Transaction) -> Result<bool, TaskError> {
        if self.is_busy(tr).await? {
            return Ok(false);
        }
        let (begin, end) = self.timeouts.range();
        let claimed = tr.get_range(&begin, &end, 1).await?;
        Ok(claimed.rows.is_empty())
    }

    /// Probe for worker liveness: seed an `idle` task if the bucket is quiet,
    /// then poll the active marker for a change. Any successful claim by any
    /// worker rewrites the marker.
    pub async fn check_active(&self, db: &Database) -> Result<bool, TaskError> {
        let mut backoff = RetryBackoff::new(false);
        let starting = loop {
            let tr = db.transaction();
            let body = async {
                if !self.is_busy(&tr).await? {
                    let task = Task::new(b"idle", 1, b"", 0);
                    self.add_task(&tr, &task);
                }
                Ok::<_, TaskError>(tr.get(self.active.key()).await?)
            }
            .await;
            match body {
                Ok(value) => match tr.commit().await {
                    Ok(_) => break value,
                    Err(e) if e.is_retryable() => backoff.pause().await,
                    Err(e) => return Err(e.into()),
                },
                Err(e) if e.is_retryable() => backoff.pause().await,
                Err(e) => return Err(e),
            }
        };

        for _ in 0..CHECK_ACTIVE_AMOUNT {
            tokio::time::sleep(Duration::from_millis(CHECK_ACTIVE_DELAY_MS)).await;
            let tr = db.transaction();
            let current = tr.get_snapshot(self.active.key()).await?;
            if current != starting {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Current task counter value; 0 when the key is absent.
    pub async fn get_task_count(&self, tr: &Transaction) -> Result<i64, TaskError> {
        let raw = tr.get(&self.counter_key()).await?;
        Ok(crate::store::decode_le64(raw.as_deref()))
    }

    /// Change notification on the task counter.
    pub fn watch_task_count(&self, tr: &Transaction) -> Watch {
        tr.watch(&self.counter_key())
    }

    /// Remove every key the bucket owns.
    pub fn clear(&self, tr: &Transaction) {
        let (begin, end) = self.prefix.full_range();
        tr.clear_range(&begin, &end);
    }

    /// Claim one available task, preferring higher priorities, in the
    /// caller's transaction. See `claim` module for the algorithm.
    pub async fn get_one(&self, tr: &Transaction) -> Result<Option<Task>, TaskError> {
        self.get_one_inner(tr).await
    }

    /// Claim one task in its own retried transaction.
    pub async fn claim_one(&self, db: &Database) -> Result<Option<Task>, TaskError> {
        let mut backoff = RetryBackoff::new(self.priority_batch);
        loop {
            let tr = db.transaction();
            match self.get_one(&tr).await {
                Ok(task) => match tr.commit().await {
                    Ok(_) => return Ok(task),
                    Err(e) if e.is_retryable() => backoff.pause().await,
                    Err(e) => return Err(e.into()),
                },
                Err(e) if e.is_retryable() => backoff.pause().await,
                Err(e) => return Err(e),
            }
        }
    }

    /// Claim and fully execute one task. Returns false when there was no
    /// work (or the claimed task's type is unregistered).
    pub async fn do_one(
        &self,
        db: &Database,
        futures: &FutureBucket,
    ) -> Result<bool, TaskError> {
        match self.claim_one(db).await? {
            Some(task) => self.do_task(db, futures, task).await,
            None => Ok(false),
        }
    }
}
