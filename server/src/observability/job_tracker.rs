//! Job Tracker Module
//!
//! Samples the counters of running backfill jobs and logs them as a table.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::{task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    backfill::{BackfillRegistry, Job, JobStatus},
    rate_limiters::RateLimiters,
};

// ============================================================================
// Table Formatting Utilities
// ============================================================================

/// Format a table with headers and rows
fn format_table(headers: &[&str], rows: &[Vec<String>]) -> String {
    if rows.is_empty() {
        return String::new();
    }

    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            if i < widths.len() {
                widths[i] = widths[i].max(cell.chars().count());
            }
        }
    }

    let pad = |cell: &str, width: usize| {
        let len = cell.chars().count();
        format!("{}{}", cell, " ".repeat(width.saturating_sub(len)))
    };

    let mut output = String::new();

    let header_line: Vec<String> = headers
        .iter()
        .enumerate()
        .map(|(i, h)| pad(h, widths[i]))
        .collect();
    output.push_str(&format!("| {} |\n", header_line.join(" | ")));

    let separator: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
    output.push_str(&format!("|-{}-|\n", separator.join("-|-")));

    for row in rows {
        let cells: Vec<String> = row
            .iter()
            .enumerate()
            .map(|(i, cell)| pad(cell, widths.get(i).copied().unwrap_or(0)))
            .collect();
        output.push_str(&format!("| {} |\n", cells.join(" | ")));
    }

    output
}

// ============================================================================
// Rolling Window Rate
// ============================================================================

/// Rolling window size for items/sec calculation (in seconds)
const ROLLING_WINDOW_SECS: u64 = 10;

#[derive(Debug, Clone)]
struct TimestampedCount {
    timestamp: Instant,
    count: u64,
}

#[derive(Debug, Clone)]
struct JobStats {
    language: String,
    status: JobStatus,
    total: u64,
    completed: u64,
    failed: u64,
    /// Cumulative finished items (completed + failed + skipped) over time
    count_history: VecDeque<TimestampedCount>,
}

impl JobStats {
    fn new(job: &Job) -> Self {
        Self {
            language: job.language.clone(),
            status: job.status(),
            total: job.total,
            completed: 0,
            failed: 0,
            count_history: VecDeque::new(),
        }
    }

    fn record(&mut self, job: &Job) {
        let now = Instant::now();
        self.status = job.status();
        self.completed = job.completed();
        self.failed = job.failed();

        self.count_history.push_back(TimestampedCount {
            timestamp: now,
            count: self.completed + self.failed + job.skipped(),
        });

        let cutoff = now
            .checked_sub(Duration::from_secs(ROLLING_WINDOW_SECS))
            .unwrap_or(now);
        while let Some(front) = self.count_history.front() {
            if front.timestamp < cutoff {
                self.count_history.pop_front();
            } else {
                break;
            }
        }
    }

    fn items_per_sec(&self) -> f64 {
        let (Some(oldest), Some(newest)) = (self.count_history.front(), self.count_history.back())
        else {
            return 0.0;
        };

        let count_diff = newest.count.saturating_sub(oldest.count);
        let time_diff = newest.timestamp.duration_since(oldest.timestamp);

        if time_diff.as_secs_f64() < 0.1 {
            return 0.0;
        }

        count_diff as f64 / time_diff.as_secs_f64()
    }
}

/// Per-job progress samples
#[derive(Clone, Default)]
pub struct JobTracker {
    stats: Arc<RwLock<HashMap<Uuid, JobStats>>>,
}

impl JobTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the current counters of a job
    pub fn update(&self, job: &Job) {
        let mut stats = self.stats.write().unwrap();
        stats
            .entry(job.id)
            .or_insert_with(|| JobStats::new(job))
            .record(job);
    }

    /// Drop every job not in `ids`
    pub fn retain(&self, ids: &HashSet<Uuid>) {
        self.stats.write().unwrap().retain(|id, _| ids.contains(id));
    }

    pub fn items_per_sec(&self, id: &Uuid) -> Option<f64> {
        self.stats.read().unwrap().get(id).map(|s| s.items_per_sec())
    }

    pub fn get_table(&self) -> Option<String> {
        let stats = self.stats.read().unwrap();
        if stats.is_empty() {
            return None;
        }

        let total_rate: f64 = stats.values().map(|s| s.items_per_sec()).sum();
        let rate_header = format!("Items/sec ({:.1})", total_rate);
        let headers = ["Job", "Language", "Status", "Done/Total", "Failed", &rate_header];

        let mut rows: Vec<Vec<String>> = stats
            .iter()
            .map(|(id, s)| {
                vec![
                    id.to_string(),
                    s.language.clone(),
                    s.status.to_string(),
                    format!("{}/{}", s.completed, s.total),
                    s.failed.to_string(),
                    format!("{:.1}", s.items_per_sec()),
                ]
            })
            .collect();

        rows.sort_by(|a, b| a[1].cmp(&b[1]));

        Some(format!(
            "Backfill Jobs ({}):\n{}",
            stats.len(),
            format_table(&headers, &rows)
        ))
    }
}

/// Logs a progress table for running jobs every `every` until `shutdown` fires.
pub fn spawn_progress_watcher(
    registry: BackfillRegistry,
    rate_limiters: RateLimiters,
    every: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    let tracker = JobTracker::new();

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            let running = registry.running_jobs().await;
            for job in &running {
                tracker.update(job);
            }
            tracker.retain(&running.iter().map(|job| job.id).collect());

            if let Some(table) = tracker.get_table() {
                tracing::info!("{}\n{}", rate_limiters.get_status(), table);
            }
        }
        tracing::debug!("Progress watcher stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(language: &str, total: u64) -> Job {
        Job::new(
            language.to_string(),
            2,
            Duration::from_millis(100),
            total,
            10,
            1000,
        )
    }

    #[test]
    fn test_format_table_pads_columns() {
        let rows = vec![
            vec!["ko".to_string(), "1".to_string()],
            vec!["zh-Hant".to_string(), "12".to_string()],
        ];
        let table = format_table(&["Language", "N"], &rows);
        let lines: Vec<&str> = table.lines().collect();

        assert_eq!(lines[0], "| Language | N  |");
        assert_eq!(lines[1], "|----------|----|");
        assert_eq!(lines[2], "| ko       | 1  |");
        assert_eq!(lines[3], "| zh-Hant  | 12 |");
        assert!(format_table(&["A"], &[]).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_over_rolling_window() {
        let tracker = JobTracker::new();
        let job = job("ko", 100);

        tracker.update(&job);
        for _ in 0..10 {
            job.record_success();
        }
        tokio::time::advance(Duration::from_secs(5)).await;
        tracker.update(&job);

        let rate = tracker.items_per_sec(&job.id).unwrap();
        assert!((rate - 2.0).abs() < 0.01, "{}", rate);

        // Old samples fall out of the window
        tokio::time::advance(Duration::from_secs(20)).await;
        tracker.update(&job);
        assert_eq!(tracker.items_per_sec(&job.id), Some(0.0));
    }

    #[test]
    fn test_table_lists_tracked_jobs() {
        let tracker = JobTracker::new();
        assert!(tracker.get_table().is_none());

        let ko = job("ko", 10);
        ko.record_success();
        ko.record_failure(4, "boom");
        let ja = job("ja", 3);
        tracker.update(&ko);
        tracker.update(&ja);

        let table = tracker.get_table().unwrap();
        assert!(table.starts_with("Backfill Jobs (2):"));
        assert!(table.contains("1/10"));
        assert!(table.contains("0/3"));

        tracker.retain(&HashSet::from([ja.id]));
        let table = tracker.get_table().unwrap();
        assert!(!table.contains("1/10"));
    }
}
