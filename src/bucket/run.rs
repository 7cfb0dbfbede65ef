//! Worker driver: bounded concurrency with adaptive claim batching.

use std::time::Duration;

use futures::future::join_all;
use tokio::task::JoinSet;
use tracing::warn;

use crate::future::FutureBucket;
use crate::store::Database;

use super::TaskBucket;

impl TaskBucket {
    /// Long-running worker loop. Keeps up to `max_concurrent` tasks in
    /// flight, claiming in adaptively sized batches: the batch doubles while
    /// every claim finds work and resets to one the moment any claim comes
    /// back empty. Runs until the surrounding task is cancelled.
    ///
    /// Claim failures are logged and treated as an idle round; task-body
    /// failures are logged per slot. The jittered poll delay bounds how long
    /// an idle driver sleeps before probing for new work.
    pub async fn run(
        &self,
        db: &Database,
        futures: &FutureBucket,
        poll_delay: Duration,
        max_concurrent: usize,
    ) {
        let max_concurrent = max_concurrent.max(1);
        let mut slots: JoinSet<()> = JoinSet::new();
        let mut batch: usize = 1;

        loop {
            // Fill available slots while claims keep succeeding.
            while slots.len() < max_concurrent {
                let want = batch.min(max_concurrent - slots.len());
                let claims = join_all((0..want).map(|_| self.claim_one(db))).await;

                let mut starved = false;
                for claim in claims {
                    match claim {
                        Ok(Some(task)) => {
                            let bucket = self.clone();
                            let db = db.clone();
                            let futures = futures.clone();
                            slots.spawn(async move {
                                if let Err(error) = bucket.do_task(&db, &futures, task).await {
                                    warn!(%error, "task execution failed");
                                }
                            });
                        }
                        Ok(None) => starved = true,
                        Err(error) => {
                            warn!(%error, "task claim failed");
                            starved = true;
                        }
                    }
                }

                if starved {
                    batch = 1;
                    break;
                }
                batch = (batch * 2).min(max_concurrent);
            }

            // Wait for a slot to finish; when slots are free, also wake on a
            // jittered poll delay so new work gets claimed promptly.
            let jittered = poll_delay.mul_f64(0.9 + rand::random::<f64>() * 0.2);
            if slots.is_empty() {
                tokio::time::sleep(jittered).await;
            } else if slots.len() < max_concurrent {
                tokio::select! {
                    _ = slots.join_next() => {}
                    _ = tokio::time::sleep(jittered) => {}
                }
            } else {
                let _ = slots.join_next().await;
            }
        }
    }
}
