//! Analysis backfill pipeline.
//!
//! A job fills in the missing analysis of every item of one language. The
//! registry starts one producer and a fixed pool of workers per job, wired
//! together by a bounded queue and a per-job cancellation token. The producer
//! polls the datastore for unfilled items and claims them in the job's
//! in-flight set before queueing; workers re-check each item, call the
//! analysis service with bounded rate-limit retries, persist the result and
//! release the claim.

pub mod datastore;
pub mod in_flight;
pub mod job;
pub mod producer;
pub mod registry;
pub mod worker;

use std::sync::Arc;

pub use datastore::{is_empty_analysis, Datastore, Item};
pub use in_flight::InFlightSet;
pub use job::{Job, JobSnapshot, JobStatus};
pub use registry::{BackfillRegistry, StartOutcome};

use crate::{analysis::AnalysisService, server_config::BackfillSettings};

/// Everything a job's producer and workers share.
#[derive(Clone)]
pub struct JobContext {
    pub job: Arc<Job>,
    pub datastore: Arc<dyn Datastore>,
    pub analyzer: Arc<dyn AnalysisService>,
    pub in_flight: InFlightSet,
    pub settings: BackfillSettings,
}
