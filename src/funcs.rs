//! Task-function registry: the process-global map from task-type name to the
//! handler pair that executes and finalizes tasks of that type.
//!
//! Register every handler during process init; after workers start the
//! registry is effectively read-only. The built-in types (`idle`, `AddTask`,
//! `UnblockFuture`) are installed automatically.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use once_cell::sync::Lazy;

use crate::bucket::{TaskBucket, TaskError};
use crate::future::FutureBucket;
use crate::store::{Database, Transaction};
use crate::task::{Task, PARAM_ADD_TASK, PARAM_BLOCK_ID, PARAM_FUTURE, PARAM_TYPE};

/// Handler pair for one task type.
///
/// `execute` runs the work outside any transaction and may suspend
/// arbitrarily; it must be idempotent, since an expired lease hands the task
/// to another worker without cancelling the first body. `finish` persists the
/// outcome inside a single transaction and is responsible for settling the
/// task, either by calling [`TaskBucket::finish`] or by re-enqueueing.
#[async_trait]
pub trait TaskFunc: Send + Sync {
    fn name(&self) -> &'static str;

    async fn execute(
        &self,
        db: &Database,
        bucket: &TaskBucket,
        futures: &FutureBucket,
        task: &mut Task,
    ) -> Result<(), TaskError>;

    async fn finish(
        &self,
        tr: &Transaction,
        bucket: &TaskBucket,
        futures: &FutureBucket,
        task: &mut Task,
    ) -> Result<(), TaskError>;
}

static REGISTRY: Lazy<RwLock<HashMap<Vec<u8>, Arc<dyn TaskFunc>>>> = Lazy::new(|| {
    let mut map: HashMap<Vec<u8>, Arc<dyn TaskFunc>> = HashMap::new();
    for builtin in [
        Arc::new(IdleFunc) as Arc<dyn TaskFunc>,
        Arc::new(AddTaskFunc),
        Arc::new(UnblockFutureFunc),
    ] {
        map.insert(builtin.name().as_bytes().to_vec(), builtin);
    }
    RwLock::new(map)
});

/// Install a task function, keyed by its name. Later registrations replace
/// earlier ones, so tests can stub built-ins.
pub fn register(func: Arc<dyn TaskFunc>) {
    let mut registry = REGISTRY.write().expect("registry lock poisoned");
    registry.insert(func.name().as_bytes().to_vec(), func);
}

/// Look up the handler for a task-type name.
pub fn lookup(name: &[u8]) -> Option<Arc<dyn TaskFunc>> {
    let registry = REGISTRY.read().expect("registry lock poisoned");
    registry.get(name).cloned()
}

pub fn is_registered(name: &[u8]) -> bool {
    let registry = REGISTRY.read().expect("registry lock poisoned");
    registry.contains_key(name)
}

/// No-op task. Its only purpose is to make a claim happen so the active
/// marker changes; `check_active` seeds one into quiet buckets.
struct IdleFunc;

#[async_trait]
impl TaskFunc for IdleFunc {
    fn name(&self) -> &'static str {
        "idle"
    }

    async fn execute(
        &self,
        _db: &Database,
        _bucket: &TaskBucket,
        _futures: &FutureBucket,
        _task: &mut Task,
    ) -> Result<(), TaskError> {
        Ok(())
    }

    async fn finish(
        &self,
        tr: &Transaction,
        bucket: &TaskBucket,
        _futures: &FutureBucket,
        task: &mut Task,
    ) -> Result<(), TaskError> {
        bucket.finish(tr, task);
        Ok(())
    }
}

/// Re-enqueues the carried task under its original type. Used by future
/// callbacks: the callback row stores the real type under `_add_task`, and
/// this function swaps it back and enqueues at set time.
struct AddTaskFunc;

#[async_trait]
impl TaskFunc for AddTaskFunc {
    fn name(&self) -> &'static str {
        "AddTask"
    }

    async fn execute(
        &self,
        _db: &Database,
        _bucket: &TaskBucket,
        _futures: &FutureBucket,
        _task: &mut Task,
    ) -> Result<(), TaskError> {
        Ok(())
    }

    async fn finish(
        &self,
        tr: &Transaction,
        bucket: &TaskBucket,
        _futures: &FutureBucket,
        task: &mut Task,
    ) -> Result<(), TaskError> {
        if let Some(original) = task.params.get(PARAM_ADD_TASK).cloned() {
            task.params.insert(PARAM_TYPE.to_vec(), original);
            bucket.add_task(tr, task);
        }
        Ok(())
    }
}

/// Clears one block row of the referenced future; when that empties the
/// block set, runs the future's callbacks in the same transaction.
struct UnblockFutureFunc;

#[async_trait]
impl TaskFunc for UnblockFutureFunc {
    fn name(&self) -> &'static str {
        "UnblockFuture"
    }

    async fn execute(
        &self,
        _db: &Database,
        _bucket: &TaskBucket,
        _futures: &FutureBucket,
        _task: &mut Task,
    ) -> Result<(), TaskError> {
        Ok(())
    }

    async fn finish(
        &self,
        tr: &Transaction,
        bucket: &TaskBucket,
        futures: &FutureBucket,
        task: &mut Task,
    ) -> Result<(), TaskError> {
        let Some(future_key) = task.params.get(PARAM_FUTURE) else {
            tracing::warn!("UnblockFuture task has no future parameter");
            return Ok(());
        };
        let future = futures.unpack(future_key);
        if let Some(block_id) = task.params.get(PARAM_BLOCK_ID) {
            future.clear_block(tr, block_id);
        }
        if future.is_set(tr).await? {
            future.perform_all_actions(tr, bucket).await?;
        }
        Ok(())
    }
}
