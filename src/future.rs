//! Durable futures: fan-in/fan-out orchestration between tasks.
//!
//! A future is a subspace holding a block set (`bl`) and a callback set
//! (`cb`). The ground truth for "set" is block-set emptiness. Callbacks are
//! parameter rows rather than live closures, so registered continuations
//! survive worker crashes: setting a future replays the rows through the
//! task-function registry in the same transaction.

use tracing::debug;

use crate::bucket::{TaskBucket, TaskError};
use crate::funcs;
use crate::settings::TOO_MANY;
use crate::store::{KeySelector, Transaction};
use crate::subspace::Subspace;
use crate::task::{
    random_uid, Task, MAX_UID_SENTINEL, PARAM_ADD_TASK, PARAM_BLOCK_ID, PARAM_FUTURE, PARAM_TYPE,
};
use crate::tuple::Element;

/// Owns the keyspace futures live under.
#[derive(Debug, Clone)]
pub struct FutureBucket {
    pub(crate) prefix: Subspace,
}

impl FutureBucket {
    pub fn new(prefix: Subspace) -> Self {
        Self { prefix }
    }

    /// Allocate a new, unset future. The future starts with a single block
    /// row under the empty block id, which `join` later swaps for one block
    /// per dependency; without it a fresh future would read as already set.
    pub fn future(&self, tr: &Transaction) -> TaskFuture {
        let future = TaskFuture::attach(self.clone(), Vec::new());
        future.add_block(tr, b"");
        future
    }

    /// Re-hydrate a handle to an existing future from its uid.
    pub fn unpack(&self, key: &[u8]) -> TaskFuture {
        TaskFuture::attach(self.clone(), key.to_vec())
    }

    /// True iff no future state exists under this bucket's prefix.
    pub async fn is_empty(&self, tr: &Transaction) -> Result<bool, TaskError> {
        let probe = self.prefix.pack(&[Element::Bytes(MAX_UID_SENTINEL.to_vec())]);
        let last = tr
            .get_key(KeySelector::last_less_or_equal(&probe), false)
            .await?;
        Ok(!matches!(last, Some(key) if self.prefix.contains(&key)))
    }

    /// Remove every future under this bucket.
    pub fn clear(&self, tr: &Transaction) {
        let (begin, end) = self.prefix.full_range();
        tr.clear_range(&begin, &end);
    }
}

/// Handle to one durable future.
#[derive(Debug, Clone)]
pub struct TaskFuture {
    pub(crate) bucket: FutureBucket,
    /// The future's uid; the wire token other processes use to reference it.
    pub key: Vec<u8>,
    blocks: Subspace,
    callbacks: Subspace,
}

impl TaskFuture {
    fn attach(bucket: FutureBucket, key: Vec<u8>) -> Self {
        let key = if key.is_empty() { random_uid() } else { key };
        let prefix = bucket.prefix.get(Element::Bytes(key.clone()));
        Self {
            blocks: prefix.get(Element::Bytes(b"bl".to_vec())),
            callbacks: prefix.get(Element::Bytes(b"cb".to_vec())),
            bucket,
            key,
        }
    }

    /// A future is set iff its block set is empty.
    pub async fn is_set(&self, tr: &Transaction) -> Result<bool, TaskError> {
        let (begin, end) = self.blocks.range();
        let blocks = tr.get_range(&begin, &end, 1).await?;
        Ok(blocks.rows.is_empty())
    }

    pub(crate) fn add_block(&self, tr: &Transaction, block_id: &[u8]) {
        tr.set(&self.blocks.pack(&[Element::Bytes(block_id.to_vec())]), b"");
    }

    pub(crate) fn clear_block(&self, tr: &Transaction, block_id: &[u8]) {
        tr.clear(&self.blocks.pack(&[Element::Bytes(block_id.to_vec())]));
    }

    /// Block this future on every future in `others`: one block row per
    /// dependency, each cleared by an `UnblockFuture` callback registered on
    /// that dependency. The initial empty-string anchor block must be cleared
    /// first, otherwise the future could never become set. Already-set
    /// futures are left untouched.
    pub async fn join(
        &self,
        tr: &Transaction,
        bucket: &TaskBucket,
        others: &[TaskFuture],
    ) -> Result<(), TaskError> {
        if self.is_set(tr).await? {
            return Ok(());
        }
        self.clear_block(tr, b"");

        for other in others {
            let block_id = random_uid();
            self.add_block(tr, &block_id);

            let mut unblock = Task::default();
            unblock
                .params
                .insert(PARAM_TYPE.to_vec(), b"UnblockFuture".to_vec());
            unblock
                .params
                .insert(PARAM_FUTURE.to_vec(), self.key.clone());
            unblock.params.insert(PARAM_BLOCK_ID.to_vec(), block_id);
            other.on_set(tr, bucket, &mut unblock).await?;
        }
        Ok(())
    }

    /// Run `task`'s finish now if the future is already set; otherwise
    /// persist its params as a durable callback record to replay at set time.
    pub async fn on_set(
        &self,
        tr: &Transaction,
        bucket: &TaskBucket,
        task: &mut Task,
    ) -> Result<(), TaskError> {
        if self.is_set(tr).await? {
            self.perform_action(tr, bucket, task).await
        } else {
            let callback_space = self.callbacks.get(Element::Bytes(random_uid()));
            for (name, value) in &task.params {
                tr.set(&callback_space.pack(&[Element::Bytes(name.clone())]), value);
            }
            debug!("registered callback on unset future");
            Ok(())
        }
    }

    /// Set the future: clear all blocks and run the registered callbacks in
    /// this transaction. Idempotent; a second set clears nothing and finds no
    /// callbacks.
    pub async fn set(&self, tr: &Transaction, bucket: &TaskBucket) -> Result<(), TaskError> {
        let (begin, end) = self.blocks.range();
        tr.clear_range(&begin, &end);
        self.perform_all_actions(tr, bucket).await
    }

    async fn perform_action(
        &self,
        tr: &Transaction,
        bucket: &TaskBucket,
        task: &mut Task,
    ) -> Result<(), TaskError> {
        let Some(task_type) = task.task_type().map(<[u8]>::to_vec) else {
            return Ok(());
        };
        if task_type.is_empty() {
            return Ok(());
        }
        let Some(func) = funcs::lookup(&task_type) else {
            return Ok(());
        };
        func.finish(tr, bucket, &self.bucket, task).await
    }

    /// Drain the callback set into one synthesized task and dispatch its
    /// finish through the registry. A future with no callbacks (or rows with
    /// no usable type) settles silently.
    pub async fn perform_all_actions(
        &self,
        tr: &Transaction,
        bucket: &TaskBucket,
    ) -> Result<(), TaskError> {
        let (begin, end) = self.callbacks.range();
        let rows = tr.get_range(&begin, &end, TOO_MANY).await?;
        tr.clear_range(&begin, &end);

        let mut task = Task::default();
        for (key, value) in rows.rows {
            let decoded = self.callbacks.unpack(&key)?;
            let param = decoded
                .get(1)
                .and_then(Element::as_bytes)
                .ok_or(TaskError::Layout("callbacks"))?;
            task.params.insert(param.to_vec(), value);
        }
        self.perform_action(tr, bucket, &mut task).await
    }

    /// "When this future fires, enqueue this task": demote the task's type
    /// under `_add_task`, retype it as `AddTask`, and register it as a
    /// callback.
    pub async fn on_set_add_task(
        &self,
        tr: &Transaction,
        bucket: &TaskBucket,
        task: &mut Task,
    ) -> Result<(), TaskError> {
        let original = task.params.get(PARAM_TYPE).cloned().unwrap_or_default();
        task.params.insert(PARAM_ADD_TASK.to_vec(), original);
        task.params.insert(PARAM_TYPE.to_vec(), b"AddTask".to_vec());
        self.on_set(tr, bucket, task).await
    }

    /// As [`TaskFuture::on_set_add_task`], binding the task to a validation
    /// witness read inside this transaction. Fails if the key is absent.
    pub async fn on_set_add_task_validated(
        &self,
        tr: &Transaction,
        bucket: &TaskBucket,
        task: &mut Task,
        validation_key: &[u8],
    ) -> Result<(), TaskError> {
        let Some(value) = tr.get(validation_key).await? else {
            tracing::error!(key = ?validation_key, "validation key missing at callback registration");
            return Err(TaskError::InvalidValidationKey {
                key: validation_key.to_vec(),
            });
        };
        task.set_validation(validation_key, &value);
        self.on_set_add_task(tr, bucket, task).await
    }

    /// As [`TaskFuture::on_set_add_task`], with a caller-supplied witness.
    pub async fn on_set_add_task_with_validation(
        &self,
        tr: &Transaction,
        bucket: &TaskBucket,
        task: &mut Task,
        validation_key: &[u8],
        validation_value: &[u8],
    ) -> Result<(), TaskError> {
        task.set_validation(validation_key, validation_value);
        self.on_set_add_task(tr, bucket, task).await
    }

    /// Allocate a fresh future and block `self` on it: `self` cannot set
    /// until the returned child is set, e.g. by a subtask signaling
    /// completion against the child's key. Lets a task hand out a completion
    /// signal that gates an existing future.
    pub async fn joined_future(
        &self,
        tr: &Transaction,
        bucket: &TaskBucket,
    ) -> Result<TaskFuture, TaskError> {
        let child = self.bucket.future(tr);
        self.join(tr, bucket, std::slice::from_ref(&child)).await?;
        Ok(child)
    }
}

/// A completion key a task author can hand to subtasks: the uid of a future
/// the subtask sets when it finishes. Either an existing future's uid, or a
/// fresh future allocated lazily on first use that gates the wrapped parent.
#[derive(Debug, Clone)]
pub enum CompletionKey {
    /// An already-known future uid.
    Signal(Vec<u8>),
    /// Allocate a joined future on first `get`.
    Pending(TaskFuture),
}

impl CompletionKey {
    pub fn signal(key: &[u8]) -> Self {
        CompletionKey::Signal(key.to_vec())
    }

    pub fn join_with(future: TaskFuture) -> Self {
        CompletionKey::Pending(future)
    }

    /// The future uid this completion key refers to, allocating (and
    /// memoizing) a joined future on first use.
    pub async fn get(
        &mut self,
        tr: &Transaction,
        bucket: &TaskBucket,
    ) -> Result<Vec<u8>, TaskError> {
        match self {
            CompletionKey::Signal(key) => Ok(key.clone()),
            CompletionKey::Pending(future) => {
                let child = future.joined_future(tr, bucket).await?;
                let key = child.key.clone();
                *self = CompletionKey::Signal(key.clone());
                Ok(key)
            }
        }
    }
}
