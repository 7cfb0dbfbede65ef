//! Executing one claimed task: validation-witness checks, the body/lease
//! race, and the at-most-one finalize transaction.

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::funcs::{self, TaskFunc};
use crate::future::FutureBucket;
use crate::settings::CORE_VERSIONS_PER_SECOND;
use crate::store::{Database, RetryBackoff, Transaction};
use crate::task::{Task, PARAM_VALID_KEY, PARAM_VALID_VALUE};

use super::{TaskBucket, TaskError};

impl TaskBucket {
    /// Check the task's validation witness inside `tr`. A task with no
    /// complete witness, or whose witness key no longer holds the stamped
    /// value, is invalid.
    pub(crate) async fn verify_task(
        &self,
        tr: &Transaction,
        task: &Task,
    ) -> Result<bool, TaskError> {
        let Some(valid_key) = task.params.get(PARAM_VALID_KEY) else {
            warn!(task_type = ?task.task_type(), "verify: task has no validation key");
            return Ok(false);
        };
        let Some(valid_value) = task.params.get(PARAM_VALID_VALUE) else {
            warn!(task_type = ?task.task_type(), "verify: task has no validation value");
            return Ok(false);
        };
        match tr.get(valid_key).await? {
            None => {
                warn!(task_type = ?task.task_type(), "verify: validation key missing");
                Ok(false)
            }
            Some(current) if current != *valid_value => {
                warn!(task_type = ?task.task_type(), "verify: task was invalidated");
                Ok(false)
            }
            Some(_) => Ok(true),
        }
    }

    /// True iff the task's validation witness (if any) still holds.
    pub async fn is_verified(&self, tr: &Transaction, task: &Task) -> Result<bool, TaskError> {
        self.verify_task(tr, task).await
    }

    /// Finalize inside `tr`: skip if some other finalize already won, verify
    /// the witness when present, then either settle silently or run the task
    /// function's `finish`.
    async fn finish_task_run(
        &self,
        tr: &Transaction,
        futures: &FutureBucket,
        func: &Arc<dyn TaskFunc>,
        task: &mut Task,
        verify: bool,
    ) -> Result<(), TaskError> {
        if self.is_finished(tr, task).await? {
            return Ok(());
        }
        let valid = if verify {
            self.verify_task(tr, task).await?
        } else {
            true
        };
        if valid {
            func.finish(tr, self, futures, task).await?;
        } else {
            self.finish(tr, task);
        }
        Ok(())
    }

    /// Run the full body/finalize cycle for an already-claimed task.
    ///
    /// Returns false when the task's type is missing or unregistered (the
    /// rows stay in place for inspection). Returns true whenever the task was
    /// accounted for: finalized, invalidated, or abandoned to the requeue
    /// path after its lease expired.
    pub async fn do_task(
        &self,
        db: &Database,
        futures: &FutureBucket,
        mut task: Task,
    ) -> Result<bool, TaskError> {
        let Some(task_type) = task.task_type().map(<[u8]>::to_vec) else {
            return Ok(false);
        };
        if task_type.is_empty() {
            return Ok(false);
        }
        let Some(func) = funcs::lookup(&task_type) else {
            warn!(task_type = ?String::from_utf8_lossy(&task_type), "unknown task type");
            return Ok(false);
        };

        let verify = task.has_validation();

        // Anchor the lease race to a recent read version. For validated
        // tasks, also bail out now if the witness is already stale.
        let mut backoff = RetryBackoff::new(false);
        let version_now = if verify {
            loop {
                let tr = db.transaction();
                let body = async {
                    if !self.verify_task(&tr, &task).await? {
                        if !self.is_finished(&tr, &task).await? {
                            self.finish(&tr, &task);
                        }
                        Ok::<_, TaskError>(None)
                    } else {
                        Ok(Some(tr.read_version().await?))
                    }
                }
                .await;
                match body {
                    Ok(None) => match tr.commit().await {
                        Ok(_) => return Ok(true),
                        Err(e) if e.is_retryable() => backoff.pause().await,
                        Err(e) => return Err(e.into()),
                    },
                    Ok(Some(version)) => break version,
                    Err(e) if e.is_retryable() => backoff.pause().await,
                    Err(e) => return Err(e),
                }
            }
        } else {
            db.transaction().read_version().await?
        };

        // Race the body against the lease. On each timer expiry re-read the
        // store version: only a version at or past the deadline abandons the
        // body; an early wakeup re-arms.
        let timeout_version = task.timeout_version;
        {
            let mut body = func.execute(db, self, futures, &mut task);
            loop {
                let lease = self.lease_delay(timeout_version, version_now);
                tokio::select! {
                    outcome = &mut body => {
                        outcome?;
                        break;
                    }
                    _ = tokio::time::sleep(lease) => {
                        let tr = db.transaction();
                        let version = tr.read_version().await?;
                        if version >= timeout_version {
                            warn!(
                                task_type = ?String::from_utf8_lossy(&task_type),
                                "task execution timed out; lease expired"
                            );
                            return Ok(true);
                        }
                    }
                }
            }
        }

        let mut backoff = RetryBackoff::new(false);
        loop {
            let tr = db.transaction();
            match self
                .finish_task_run(&tr, futures, &func, &mut task, verify)
                .await
            {
                Ok(()) => match tr.commit().await {
                    Ok(_) => break,
                    Err(e) if e.is_retryable() => backoff.pause().await,
                    Err(e) => return Err(e.into()),
                },
                Err(e) if e.is_retryable() => backoff.pause().await,
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    /// Wall-clock delay until the lease deadline, anchored at `version_now`.
    /// Fault-injection mode perturbs the delay by a random factor in [0, 2).
    fn lease_delay(&self, timeout_version: i64, version_now: i64) -> Duration {
        let factor = if self.fault_injection {
            2.0 * rand::random::<f64>()
        } else {
            1.0
        };
        let versions = (timeout_version - version_now).max(0) as f64;
        Duration::from_secs_f64(factor * versions / CORE_VERSIONS_PER_SECOND as f64)
    }
}
