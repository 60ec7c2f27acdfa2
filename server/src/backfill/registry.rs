use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::{
    sync::{mpsc, Mutex},
    task::JoinSet,
};
use uuid::Uuid;

use crate::{
    analysis::AnalysisService,
    error::{AppError, AppResult},
    server_config::BackfillSettings,
};

use super::{
    datastore::Datastore,
    in_flight::InFlightSet,
    job::{Job, JobSnapshot, JobStatus},
    producer::Producer,
    worker::{SharedQueue, Worker},
    JobContext,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started(Uuid),
    /// Nothing was unfilled, no job was created.
    NothingToDo,
}

type JobMap = HashMap<Uuid, Arc<Job>>;

/// Every backfill job started by this process. At most one job per language
/// is running at a time.
#[derive(Clone)]
pub struct BackfillRegistry {
    datastore: Arc<dyn Datastore>,
    analyzer: Arc<dyn AnalysisService>,
    settings: BackfillSettings,
    jobs: Arc<Mutex<JobMap>>,
}

impl BackfillRegistry {
    pub fn new(
        datastore: Arc<dyn Datastore>,
        analyzer: Arc<dyn AnalysisService>,
        settings: BackfillSettings,
    ) -> Self {
        Self {
            datastore,
            analyzer,
            settings,
            jobs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn settings(&self) -> &BackfillSettings {
        &self.settings
    }

    /// Starts a job for `language` and returns as soon as its tasks are spawned.
    /// Omitted `workers`/`delay_ms` fall back to the configured defaults.
    pub async fn start(
        &self,
        language: &str,
        workers: Option<usize>,
        delay_ms: Option<u64>,
    ) -> AppResult<StartOutcome> {
        let language = language.trim();
        if language.is_empty() {
            return Err(AppError::BadRequest("language is required".to_string()));
        }

        let workers = workers.unwrap_or(self.settings.default_workers);
        if workers == 0 || workers > self.settings.max_workers {
            return Err(AppError::BadRequest(format!(
                "workers must be between 1 and {}",
                self.settings.max_workers
            )));
        }
        let delay = Duration::from_millis(delay_ms.unwrap_or(self.settings.default_delay_ms));

        // Cheap early refusal; the count below runs without the map locked
        Self::ensure_idle(&*self.jobs.lock().await, language)?;

        let total = self.datastore.count_unfilled(language).await?;
        if total == 0 {
            tracing::info!(language = %language, "No unfilled items, nothing to backfill");
            return Ok(StartOutcome::NothingToDo);
        }

        let job = Arc::new(Job::new(
            language.to_string(),
            workers,
            delay,
            total,
            self.settings.max_recent_errors,
            self.settings.max_excluded_ids,
        ));
        {
            let mut jobs = self.jobs.lock().await;
            // Another start may have won while counting
            Self::ensure_idle(&jobs, language)?;
            jobs.insert(job.id, job.clone());
        }

        tracing::info!(
            job_id = %job.id,
            language = %job.language,
            "Starting backfill of {} items with {} workers, {}ms apart",
            total,
            workers,
            delay.as_millis()
        );

        self.spawn_pipeline(job.clone());

        Ok(StartOutcome::Started(job.id))
    }

    fn ensure_idle(jobs: &JobMap, language: &str) -> AppResult<()> {
        let Some(running) = jobs
            .values()
            .find(|job| job.language == language && job.status() == JobStatus::Running)
        else {
            return Ok(());
        };

        tracing::info!(
            job_id = %running.id,
            language = %language,
            "Refusing to start a second backfill job"
        );
        Err(AppError::Conflict(format!(
            "Backfill job {} is already running for '{}'",
            running.id, language
        )))
    }

    fn spawn_pipeline(&self, job: Arc<Job>) {
        let ctx = JobContext {
            job: job.clone(),
            datastore: self.datastore.clone(),
            analyzer: self.analyzer.clone(),
            in_flight: InFlightSet::new(),
            settings: self.settings.clone(),
        };

        let (tx, rx) = mpsc::channel(job.workers);
        let queue: SharedQueue = Arc::new(Mutex::new(rx));

        let mut tasks = JoinSet::new();
        let producer = Producer::new(ctx.clone());
        tasks.spawn(async move {
            producer.run(tx).await;
        });
        for worker_id in 0..job.workers {
            tasks.spawn(Worker::new(worker_id, ctx.clone()).run(queue.clone()));
        }

        tokio::spawn(async move {
            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = joined {
                    tracing::error!(job_id = %job.id, "Backfill task ended abnormally: {:?}", e);
                }
            }

            let status = job.finish();
            tracing::info!(
                job_id = %job.id,
                language = %job.language,
                completed = job.completed(),
                failed = job.failed(),
                skipped = job.skipped(),
                "Backfill job finished: {}",
                status
            );
        });
    }

    async fn get(&self, id: Uuid) -> AppResult<Arc<Job>> {
        self.jobs
            .lock()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("Backfill job {} not found", id)))
    }

    pub async fn status(&self, id: Uuid) -> AppResult<JobSnapshot> {
        Ok(self.get(id).await?.snapshot())
    }

    /// Stops one job. Stopping a job that already ended is a no-op.
    pub async fn stop(&self, id: Uuid) -> AppResult<JobSnapshot> {
        let job = self.get(id).await?;
        if job.stop() {
            tracing::info!(job_id = %job.id, language = %job.language, "Backfill job stopped");
        }
        Ok(job.snapshot())
    }

    /// Signals every running job to stop and returns how many were signalled.
    pub async fn stop_all(&self) -> usize {
        let jobs = self.jobs.lock().await;
        let mut stopped = 0;
        for job in jobs.values() {
            if job.stop() {
                tracing::info!(job_id = %job.id, language = %job.language, "Backfill job stopped");
                stopped += 1;
            }
        }
        stopped
    }

    pub async fn list(&self) -> Vec<JobSnapshot> {
        let mut snapshots: Vec<JobSnapshot> = self
            .jobs
            .lock()
            .await
            .values()
            .map(|job| job.snapshot())
            .collect();
        snapshots.sort_by_key(|snap| snap.started_at);
        snapshots
    }

    pub async fn running_jobs(&self) -> Vec<Arc<Job>> {
        let mut running: Vec<Arc<Job>> = self
            .jobs
            .lock()
            .await
            .values()
            .filter(|job| job.status() == JobStatus::Running)
            .cloned()
            .collect();
        running.sort_by_key(|job| job.started_at);
        running
    }

    /// Waits for a job's tasks to exit and returns its final snapshot.
    pub async fn wait(&self, id: Uuid) -> AppResult<JobSnapshot> {
        let job = self.get(id).await?;
        job.wait_drained().await;
        Ok(job.snapshot())
    }

    /// Waits up to `timeout` for every job's tasks to exit. Returns false on timeout.
    pub async fn wait_all(&self, timeout: Duration) -> bool {
        let jobs: Vec<Arc<Job>> = self.jobs.lock().await.values().cloned().collect();
        let drained = futures::future::join_all(jobs.iter().map(|job| job.wait_drained()));
        tokio::time::timeout(timeout, drained).await.is_ok()
    }
}
