//! Backlog producer
//!
//! Polls the datastore for unfilled items, drops the ones still in flight and
//! feeds the rest to the job's bounded work queue.

use tokio::sync::mpsc;

use super::{in_flight::WorkUnit, JobContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerExit {
    /// A poll came back empty.
    Exhausted,
    Cancelled,
    /// Every worker is gone.
    QueueClosed,
    DatastoreError,
}

pub struct Producer {
    ctx: JobContext,
}

impl Producer {
    pub fn new(ctx: JobContext) -> Self {
        Self { ctx }
    }

    /// Runs until the backlog is exhausted, the job is cancelled or a poll fails.
    /// Dropping `queue` on return is what lets workers drain and exit.
    pub async fn run(self, queue: mpsc::Sender<WorkUnit>) -> ProducerExit {
        let job = &self.ctx.job;
        let cancel = job.cancel_token();
        let batch_size = (self.ctx.settings.fetch_multiplier * job.workers).max(1) as u64;

        tracing::debug!(job_id = %job.id, language = %job.language, "Producer started");

        let exit = loop {
            if cancel.is_cancelled() {
                break ProducerExit::Cancelled;
            }

            let exclusion = job.exclusion();
            let fetch = self.ctx.datastore.fetch_unfilled(
                &job.language,
                batch_size,
                exclusion.after,
                &exclusion.ids,
            );
            let fetched = tokio::select! {
                biased;
                _ = cancel.cancelled() => break ProducerExit::Cancelled,
                result = fetch => result,
            };

            let items = match fetched {
                Ok(items) => items,
                Err(e) => {
                    tracing::error!(
                        job_id = %job.id,
                        language = %job.language,
                        "Producer could not fetch unfilled items: {:?}", e
                    );
                    job.record_producer_failure(format!("Fetching unfilled items failed: {}", e));
                    break ProducerExit::DatastoreError;
                }
            };

            if items.is_empty() {
                break ProducerExit::Exhausted;
            }

            let fetched_count = items.len();
            let claimed = self.ctx.in_flight.claim(items);
            let dispatched = claimed.len();

            for unit in claimed {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return self.exit(ProducerExit::Cancelled),
                    sent = queue.send(unit) => {
                        if sent.is_err() {
                            return self.exit(ProducerExit::QueueClosed);
                        }
                    }
                }
            }

            tracing::trace!(
                job_id = %job.id,
                "Dispatched {} of {} fetched items",
                dispatched,
                fetched_count
            );

            // Everything fetched is still being worked on, wait longer before asking again
            let pause = if dispatched == 0 {
                self.ctx.settings.idle_poll()
            } else {
                self.ctx.settings.busy_poll()
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break ProducerExit::Cancelled,
                _ = tokio::time::sleep(pause) => {}
            }
        };

        self.exit(exit)
    }

    fn exit(&self, exit: ProducerExit) -> ProducerExit {
        let job = &self.ctx.job;
        match exit {
            ProducerExit::Exhausted => {
                tracing::info!(job_id = %job.id, language = %job.language, "Backlog exhausted, producer done")
            }
            ProducerExit::Cancelled => {
                tracing::info!(job_id = %job.id, language = %job.language, "Producer cancelled")
            }
            ProducerExit::QueueClosed => {
                tracing::warn!(job_id = %job.id, language = %job.language, "Work queue closed under producer")
            }
            ProducerExit::DatastoreError => {}
        }
        exit
    }
}
