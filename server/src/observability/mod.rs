//! Observability Module
//!
//! Periodic progress reporting for running backfill jobs with a rolling
//! items/sec rate per job.

mod job_tracker;

pub use job_tracker::spawn_progress_watcher;
