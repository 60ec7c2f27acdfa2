use std::{
    collections::BTreeSet,
    sync::{
        atomic::{AtomicU64, Ordering::Relaxed},
        Mutex,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Completed,
    Stopped,
    /// The producer hit a datastore error and the job ended short of its total.
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Running)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemError {
    /// `None` for errors that are not tied to an item, e.g. a failed poll.
    pub item_id: Option<i64>,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// What the producer leaves out of its next poll: every id at or below
/// `after`, plus `ids`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Exclusion {
    pub after: Option<i64>,
    pub ids: Vec<i64>,
}

/// Items this job failed on. Polls are ascending by id, so every unfilled id
/// at or below the highest given-up id has already been handed out once. When
/// the list outgrows its cap it collapses into that floor.
#[derive(Debug, Default)]
struct GivenUp {
    floor: Option<i64>,
    ids: BTreeSet<i64>,
}

impl GivenUp {
    fn insert(&mut self, item_id: i64, cap: usize) {
        if self.floor.is_some_and(|floor| item_id <= floor) {
            return;
        }
        self.ids.insert(item_id);
        if self.ids.len() > cap {
            self.floor = self.ids.last().copied();
            self.ids.clear();
        }
    }
}

#[derive(Debug)]
struct Lifecycle {
    status: JobStatus,
    finished_at: Option<DateTime<Utc>>,
}

/// One backfill run for a language. Counters are only touched by the job's own
/// producer and workers; status also changes through the registry's stop calls.
#[derive(Debug)]
pub struct Job {
    pub id: Uuid,
    pub language: String,
    pub workers: usize,
    pub delay: Duration,
    pub total: u64,
    pub started_at: DateTime<Utc>,
    completed: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
    errors: Mutex<Vec<ItemError>>,
    max_errors: usize,
    /// Why the producer gave up, kept apart from the capped error list.
    failure_reason: Mutex<Option<String>>,
    given_up: Mutex<GivenUp>,
    max_excluded: usize,
    lifecycle: Mutex<Lifecycle>,
    cancel: CancellationToken,
    drained: CancellationToken,
}

impl Job {
    pub fn new(
        language: String,
        workers: usize,
        delay: Duration,
        total: u64,
        max_errors: usize,
        max_excluded: usize,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            language,
            workers,
            delay,
            total,
            started_at: Utc::now(),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            errors: Mutex::new(Vec::new()),
            max_errors,
            failure_reason: Mutex::new(None),
            given_up: Mutex::new(GivenUp::default()),
            max_excluded,
            lifecycle: Mutex::new(Lifecycle {
                status: JobStatus::Running,
                finished_at: None,
            }),
            cancel: CancellationToken::new(),
            drained: CancellationToken::new(),
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn record_success(&self) {
        self.completed.fetch_add(1, Relaxed);
    }

    pub fn record_skipped(&self) {
        self.skipped.fetch_add(1, Relaxed);
    }

    /// Counts the item as failed and keeps the producer from handing it out again.
    pub fn record_failure(&self, item_id: i64, message: impl Into<String>) {
        self.failed.fetch_add(1, Relaxed);
        self.given_up
            .lock()
            .unwrap()
            .insert(item_id, self.max_excluded);
        self.push_error(Some(item_id), message.into());
    }

    pub fn record_producer_failure(&self, message: impl Into<String>) {
        let message = message.into();
        self.failure_reason
            .lock()
            .unwrap()
            .get_or_insert_with(|| message.clone());
        self.push_error(None, message);
    }

    fn push_error(&self, item_id: Option<i64>, message: String) {
        let mut errors = self.errors.lock().unwrap();
        if errors.len() < self.max_errors {
            errors.push(ItemError {
                item_id,
                message,
                at: Utc::now(),
            });
        }
    }

    /// Ids the next poll must skip. `ids` is ascending and never longer than
    /// the configured cap.
    pub fn exclusion(&self) -> Exclusion {
        let given_up = self.given_up.lock().unwrap();
        Exclusion {
            after: given_up.floor,
            ids: given_up.ids.iter().copied().collect(),
        }
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Relaxed)
    }

    pub fn skipped(&self) -> u64 {
        self.skipped.load(Relaxed)
    }

    pub fn remaining(&self) -> u64 {
        self.total
            .saturating_sub(self.completed() + self.failed() + self.skipped())
    }

    pub fn failure_reason(&self) -> Option<String> {
        self.failure_reason.lock().unwrap().clone()
    }

    pub fn status(&self) -> JobStatus {
        self.lifecycle.lock().unwrap().status
    }

    /// Moves a running job to `to`. Terminal states never change again, so a
    /// stop racing with natural completion keeps whichever landed first.
    fn transition(lifecycle: &mut Lifecycle, to: JobStatus) -> bool {
        if lifecycle.status.is_terminal() {
            return false;
        }
        lifecycle.status = to;
        lifecycle.finished_at = Some(Utc::now());
        true
    }

    /// Signals the producer and workers to wind down and marks the job stopped.
    pub fn stop(&self) -> bool {
        let stopped = Self::transition(&mut self.lifecycle.lock().unwrap(), JobStatus::Stopped);
        if stopped {
            self.cancel.cancel();
        }
        stopped
    }

    /// Called once the producer has exited and every worker has joined.
    pub fn finish(&self) -> JobStatus {
        let outcome = if self.failure_reason.lock().unwrap().is_some() {
            JobStatus::Failed
        } else {
            JobStatus::Completed
        };

        let status = {
            let mut lifecycle = self.lifecycle.lock().unwrap();
            if outcome == JobStatus::Completed && !lifecycle.status.is_terminal() {
                // Unfilled when counted, filled elsewhere before any poll reached them
                self.skipped.fetch_add(self.remaining(), Relaxed);
            }
            Self::transition(&mut lifecycle, outcome);
            lifecycle.status
        };

        // Nothing is listening any more; release anything still parked on it.
        self.cancel.cancel();
        self.drained.cancel();
        status
    }

    /// Resolves once the producer and every worker of this job have exited.
    pub async fn wait_drained(&self) {
        self.drained.cancelled().await
    }

    pub fn snapshot(&self) -> JobSnapshot {
        let (status, finished_at) = {
            let lifecycle = self.lifecycle.lock().unwrap();
            (lifecycle.status, lifecycle.finished_at)
        };
        let end = finished_at.unwrap_or_else(Utc::now);

        JobSnapshot {
            id: self.id,
            language: self.language.clone(),
            status,
            workers: self.workers,
            delay_ms: self.delay.as_millis() as u64,
            total: self.total,
            completed: self.completed(),
            failed: self.failed(),
            skipped: self.skipped(),
            remaining: self.remaining(),
            failure_reason: self.failure_reason(),
            errors: self.errors.lock().unwrap().clone(),
            started_at: self.started_at,
            finished_at,
            elapsed_secs: (end - self.started_at).num_seconds().max(0) as u64,
        }
    }
}

/// Point-in-time view of a job returned to callers.
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub id: Uuid,
    pub language: String,
    pub status: JobStatus,
    pub workers: usize,
    pub delay_ms: u64,
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
    pub skipped: u64,
    pub remaining: u64,
    pub failure_reason: Option<String>,
    pub errors: Vec<ItemError>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub elapsed_secs: u64,
}
