use std::{panic::AssertUnwindSafe, sync::Arc};

use futures::FutureExt;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};

use crate::analysis::AnalyzeError;

use super::{datastore::Item, in_flight::WorkUnit, JobContext};

pub type SharedQueue = Arc<Mutex<mpsc::Receiver<WorkUnit>>>;

/// What happened to one item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Completed,
    /// Already filled (or deleted) by the time the worker looked again.
    Skipped,
    Failed(String),
    /// Job was stopped while waiting out a rate limit.
    Abandoned,
}

pub struct Worker {
    worker_id: usize,
    ctx: JobContext,
}

impl Worker {
    pub fn new(worker_id: usize, ctx: JobContext) -> Self {
        Self { worker_id, ctx }
    }

    /// Drains the shared queue until it is closed and empty or the job is cancelled.
    pub async fn run(self, queue: SharedQueue) {
        let job = self.ctx.job.clone();
        let cancel = job.cancel_token();

        loop {
            let next = {
                let mut queue = queue.lock().await;
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    unit = queue.recv() => unit,
                }
            };

            let Some(unit) = next else {
                break;
            };

            let item_id = unit.item.id;
            let outcome = AssertUnwindSafe(self.process(&unit.item))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    let msg = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "Unknown panic".to_string());
                    tracing::error!(
                        job_id = %job.id,
                        "Backfill worker {} panicked on item {}, recovering: {}",
                        self.worker_id,
                        item_id,
                        msg
                    );
                    ItemOutcome::Failed(format!("Worker panicked: {}", msg))
                });

            match outcome {
                ItemOutcome::Completed => job.record_success(),
                ItemOutcome::Skipped => {
                    job.record_skipped();
                    // No service call was made, nothing to pace
                    drop(unit);
                    continue;
                }
                ItemOutcome::Failed(message) => {
                    tracing::warn!(
                        job_id = %job.id,
                        language = %job.language,
                        "Item {} failed: {}",
                        item_id,
                        message
                    );
                    job.record_failure(item_id, message);
                }
                ItemOutcome::Abandoned => {
                    tracing::debug!(job_id = %job.id, "Item {} abandoned on stop", item_id);
                }
            }

            // Releases the in-flight claim
            drop(unit);

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(job.delay) => {}
            }
        }

        tracing::debug!(job_id = %job.id, "Backfill worker {} exiting", self.worker_id);
    }

    async fn process(&self, item: &Item) -> ItemOutcome {
        let current = match self.ctx.datastore.refetch_one(item.id).await {
            Ok(Some(current)) => current,
            Ok(None) => return ItemOutcome::Skipped,
            Err(e) => return ItemOutcome::Failed(format!("Re-reading item failed: {}", e)),
        };

        // Another path may have filled it since the producer's poll
        if !current.is_unfilled() {
            return ItemOutcome::Skipped;
        }

        let payload = match self.analyze_with_retries(&current).await {
            Ok(payload) => payload,
            Err(None) => return ItemOutcome::Abandoned,
            Err(Some(e)) => return ItemOutcome::Failed(e.to_string()),
        };

        match self.ctx.datastore.persist_analysis(current.id, payload).await {
            Ok(()) => ItemOutcome::Completed,
            Err(e) => ItemOutcome::Failed(format!("Persisting analysis failed: {}", e)),
        }
    }

    /// Calls the service, retrying rate-limited attempts after a fixed backoff.
    /// `Err(None)` means the job was cancelled during a backoff.
    async fn analyze_with_retries(&self, item: &Item) -> Result<Value, Option<AnalyzeError>> {
        let settings = &self.ctx.settings;
        let cancel = self.ctx.job.cancel_token();
        let mut retries = 0;

        loop {
            match self
                .ctx
                .analyzer
                .analyze(&item.term, &item.language)
                .await
            {
                Ok(payload) => return Ok(payload),
                Err(e) if e.is_rate_limited() && retries < settings.max_retries => {
                    retries += 1;
                    tracing::info!(
                        job_id = %self.ctx.job.id,
                        "Item {} rate limited, retry {}/{} in {}s",
                        item.id,
                        retries,
                        settings.max_retries,
                        settings.rate_limit_backoff_secs
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(None),
                        _ = tokio::time::sleep(settings.rate_limit_backoff()) => {}
                    }
                }
                Err(e) if e.is_rate_limited() => {
                    return Err(Some(AnalyzeError::RateLimited(format!(
                        "gave up after {} retries: {}",
                        retries,
                        e
                    ))))
                }
                Err(e) => return Err(Some(e)),
            }
        }
    }
}
