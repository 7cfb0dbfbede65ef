//! Claiming: pick an available task under concurrent workers without a
//! coarse lock, and return abandoned tasks to the available keyspace.

use futures::future::join_all;
use tracing::debug;

use crate::settings::{MAX_TASK_KEYS, TIMEOUT_JITTER_OFFSET, TIMEOUT_JITTER_RANGE, TOO_MANY};
use crate::store::{KeySelector, Transaction};
use crate::task::{random_uid, Task, MAX_UID_SENTINEL};
use crate::tuple::Element;

use super::{TaskBucket, TaskError};

impl TaskBucket {
    /// Probabilistic random pick inside one priority's subspace: resolve
    /// `last_less_or_equal` of a random uid, falling back to the largest uid.
    /// Two concurrent claimers almost certainly land on different keys, so
    /// their claim transactions touch disjoint rows. Snapshot reads keep the
    /// probe itself conflict-free; the row moves below carry the conflict.
    async fn get_task_key(
        &self,
        tr: &Transaction,
        priority: i64,
    ) -> Result<Option<Vec<u8>>, TaskError> {
        let space = self.available_space(priority);

        let probe = space.pack(&[Element::Bytes(random_uid())]);
        if let Some(key) = tr
            .get_key(KeySelector::last_less_or_equal(&probe), true)
            .await?
        {
            if space.contains(&key) {
                return Ok(Some(key));
            }
        }

        let probe = space.pack(&[Element::Bytes(MAX_UID_SENTINEL.to_vec())]);
        if let Some(key) = tr
            .get_key(KeySelector::last_less_or_equal(&probe), true)
            .await?
        {
            if space.contains(&key) {
                return Ok(Some(key));
            }
        }

        Ok(None)
    }

    pub(super) async fn get_one_inner(
        &self,
        tr: &Transaction,
    ) -> Result<Option<Task>, TaskError> {
        if self.priority_batch {
            tr.set_batch_priority();
        }

        // Occasionally sweep timeouts first, so expired tasks still surface
        // when a steady stream of fresh tasks would otherwise keep winning.
        if rand::random::<f64>() < self.check_timeout_chance {
            self.requeue_timed_out(tr).await?;
        }

        let mut requeued = false;
        loop {
            // Probe every priority level concurrently, then resolve highest
            // priority first; lower-priority probes are simply dropped once a
            // higher one hits.
            let mut probes = Vec::with_capacity(self.max_priority as usize + 1);
            for outcome in
                join_all((0..=self.max_priority).map(|p| self.get_task_key(tr, p))).await
            {
                probes.push(outcome?);
            }

            let mut hit: Option<(i64, Vec<u8>)> = None;
            for priority in (0..=self.max_priority).rev() {
                if let Some(key) = probes[priority as usize].take() {
                    hit = Some((priority, key));
                    break;
                }
            }

            let Some((priority, task_key)) = hit else {
                // Nothing available: move any expired tasks back and retry
                // once. Deeper recursion is deliberately not done; a larger
                // backlog drains across subsequent claims.
                if !requeued && self.requeue_timed_out(tr).await? {
                    requeued = true;
                    continue;
                }
                return Ok(None);
            };

            return Ok(Some(self.claim_key(tr, priority, &task_key).await?))
        }
    }

    /// Move the task at `task_key` from the available keyspace to the
    /// timeouts keyspace under a jittered lease deadline.
    async fn claim_key(
        &self,
        tr: &Transaction,
        priority: i64,
        task_key: &[u8],
    ) -> Result<Task, TaskError> {
        let available = self.available_space(priority);
        let decoded = available.unpack(task_key)?;
        let uid = decoded
            .first()
            .and_then(Element::as_bytes)
            .ok_or(TaskError::Layout("available"))?
            .to_vec();
        let task_space = available.get(Element::Bytes(uid.clone()));

        let (begin, end) = task_space.range();
        let rows = tr.get_range(&begin, &end, TOO_MANY).await?;
        let version = tr.read_version().await?;

        let jitter = TIMEOUT_JITTER_OFFSET + TIMEOUT_JITTER_RANGE * rand::random::<f64>();
        let timeout_version = version + (self.timeout_versions as f64 * jitter) as i64;

        let mut task = Task {
            uid: uid.clone(),
            timeout_version,
            params: Default::default(),
        };
        let timeout_space = self
            .timeouts
            .get(Element::Int(timeout_version))
            .get(Element::Bytes(uid));
        for (key, value) in rows.rows {
            let param = task_space
                .unpack(&key)?
                .first()
                .and_then(Element::as_bytes)
                .ok_or(TaskError::Layout("available"))?
                .to_vec();
            tr.set(&timeout_space.pack(&[Element::Bytes(param.clone())]), &value);
            task.params.insert(param, value);
        }

        tr.clear_range(&begin, &end);
        tr.set(self.active.key(), &random_uid());
        debug!(priority, timeout_version, "claimed task");
        Ok(task)
    }

    /// Scan the timeouts keyspace up to the current read version and move
    /// every fully-scanned task's rows back to its priority's available
    /// subspace. Returns true if any rows were affected.
    ///
    /// When the scan is truncated, only the rows of fully-accumulated tasks
    /// are cleared; a task whose rows straddle the scan boundary is left
    /// untouched so it is never half-moved.
    pub async fn requeue_timed_out(&self, tr: &Transaction) -> Result<bool, TaskError> {
        let end_version = tr.read_version().await?;
        let begin = self.timeouts.get(Element::Int(0)).range().0;
        let end = self.timeouts.get(Element::Int(end_version)).range().1;

        let scanned = tr.get_range(&begin, &end, MAX_TASK_KEYS).await?;

        let mut task = Task::default();
        let mut group_start: Vec<u8> = Vec::new();
        for (key, value) in &scanned.rows {
            let decoded = self.timeouts.unpack(key)?;
            let uid = decoded
                .get(1)
                .and_then(Element::as_bytes)
                .ok_or(TaskError::Layout("timeouts"))?;
            let param = decoded
                .get(2)
                .and_then(Element::as_bytes)
                .ok_or(TaskError::Layout("timeouts"))?;

            if uid != task.uid.as_slice() {
                self.flush_requeued(tr, &task);
                task.params.clear();
                task.uid = uid.to_vec();
                group_start = key.clone();
            }
            task.params.insert(param.to_vec(), value.clone());
        }

        if !scanned.more {
            self.flush_requeued(tr, &task);
            if !scanned.rows.is_empty() {
                tr.clear_range(&begin, &end);
                debug!(rows = scanned.rows.len(), "requeued timed-out tasks");
                return Ok(true);
            }
            return Ok(false);
        }

        // Truncated scan: the final group may be incomplete, so clear only up
        // to its first row and leave it for the next sweep.
        tr.clear_range(&begin, &group_start);
        debug!(rows = scanned.rows.len(), "requeued timed-out tasks (truncated scan)");
        Ok(true)
    }

    fn flush_requeued(&self, tr: &Transaction, task: &Task) {
        if task.uid.is_empty() {
            return;
        }
        let space = self
            .available_space(task.priority())
            .get(Element::Bytes(task.uid.clone()));
        for (name, value) in &task.params {
            tr.set(&space.pack(&[Element::Bytes(name.clone())]), value);
        }
    }
}
