//! Metrics snapshot shared between the worker side and the HTTP endpoint.
//!
//! The snapshot is rebuilt periodically from the queue's job records, the
//! encoder limiter and the host, and served as JSON.

use crate::jobs::{current_timestamp_ms, Job, JobStatus};
use crate::limiter::ConcurrencyLimiter;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Per-job view of a queue record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobMetrics {
    pub id: String,
    pub input_path: String,
    pub status: JobStatus,
    pub progress: u8,
    pub attempts: u32,
    /// Rendition labels such as `720p@1000k`, ascending.
    pub renditions: Vec<String>,
    pub manifest_path: Option<String>,
    /// Failure descriptor of the latest failed attempt.
    pub error: Option<String>,
}

impl From<&Job> for JobMetrics {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id.clone(),
            input_path: job.input_path.display().to_string(),
            status: job.status,
            progress: job.progress,
            attempts: job.attempts,
            renditions: job.renditions.iter().map(|r| r.to_string()).collect(),
            manifest_path: job
                .result
                .as_ref()
                .map(|r| r.manifest_path.display().to_string()),
            error: job.error.clone(),
        }
    }
}

/// System-level metrics for resource monitoring
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SystemMetrics {
    pub cpu_usage_percent: f32,
    pub mem_usage_percent: f32,
    pub load_avg_1: f32,
    pub load_avg_5: f32,
    pub load_avg_15: f32,
}

/// Complete metrics snapshot including jobs, system, and aggregate stats
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MetricsSnapshot {
    pub timestamp_unix_ms: i64,
    pub jobs: Vec<JobMetrics>,
    pub system: SystemMetrics,
    pub queued_jobs: usize,
    pub running_jobs: usize,
    pub succeeded_jobs: usize,
    pub failed_jobs: usize,
    /// Capacity of the encoder process limiter.
    pub encoder_slots: usize,
    pub encoder_slots_in_use: usize,
}

impl MetricsSnapshot {
    /// Replace the job list and recount jobs per status.
    pub fn refresh_jobs(&mut self, jobs: &[Job]) {
        self.jobs = jobs.iter().map(JobMetrics::from).collect();
        let count = |status: JobStatus| jobs.iter().filter(|j| j.status == status).count();
        self.queued_jobs = count(JobStatus::Queued);
        self.running_jobs = count(JobStatus::Running);
        self.succeeded_jobs = count(JobStatus::Succeeded);
        self.failed_jobs = count(JobStatus::Failed);
        self.timestamp_unix_ms = current_timestamp_ms();
    }

    pub fn refresh_limiter(&mut self, limiter: &ConcurrencyLimiter) {
        self.encoder_slots = limiter.capacity();
        self.encoder_slots_in_use = limiter.in_use();
    }

    pub fn job(&self, id: &str) -> Option<&JobMetrics> {
        self.jobs.iter().find(|j| j.id == id)
    }
}

/// Shared metrics state for concurrent access across daemon components
pub type SharedMetrics = Arc<RwLock<MetricsSnapshot>>;

/// Creates a new SharedMetrics instance with default values
pub fn new_shared_metrics() -> SharedMetrics {
    Arc::new(RwLock::new(MetricsSnapshot::default()))
}

/// Collects current system metrics using sysinfo
pub fn collect_system_metrics() -> SystemMetrics {
    use sysinfo::System;

    let mut sys = System::new();
    sys.refresh_cpu_usage();
    sys.refresh_memory();

    let total_memory = sys.total_memory();
    let mem_usage = if total_memory > 0 {
        (sys.used_memory() as f64 / total_memory as f64 * 100.0) as f32
    } else {
        0.0
    };
    let load_avg = System::load_average();

    SystemMetrics {
        cpu_usage_percent: sys.global_cpu_usage(),
        mem_usage_percent: mem_usage,
        load_avg_1: load_avg.one as f32,
        load_avg_5: load_avg.five as f32,
        load_avg_15: load_avg.fifteen as f32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{JobDescriptor, JobResult};
    use crate::rendition::default_catalog;
    use proptest::prelude::*;
    use std::path::PathBuf;

    fn job(id: &str, status: JobStatus) -> Job {
        let mut job = Job::from_descriptor(
            JobDescriptor::new(format!("{}.mp4", id)).with_id(id),
            &default_catalog(),
        )
        .unwrap();
        job.status = status;
        job
    }

    #[test]
    fn test_refresh_counts_jobs_per_status() {
        let mut failed = job("d", JobStatus::Failed);
        failed.error = Some("encoder exited with code 1".to_string());
        let mut done = job("c", JobStatus::Succeeded);
        done.result = Some(JobResult {
            output_dir: PathBuf::from("output/c"),
            manifest_path: PathBuf::from("output/c/master.m3u8"),
            renditions: Vec::new(),
        });
        let jobs = vec![
            job("a", JobStatus::Queued),
            job("b", JobStatus::Running),
            done,
            failed,
        ];

        let mut snapshot = MetricsSnapshot::default();
        snapshot.refresh_jobs(&jobs);

        assert_eq!(snapshot.queued_jobs, 1);
        assert_eq!(snapshot.running_jobs, 1);
        assert_eq!(snapshot.succeeded_jobs, 1);
        assert_eq!(snapshot.failed_jobs, 1);
        assert!(snapshot.timestamp_unix_ms > 0);

        let c = snapshot.job("c").unwrap();
        assert_eq!(c.manifest_path.as_deref(), Some("output/c/master.m3u8"));
        assert_eq!(
            c.renditions,
            vec!["144p@300k", "360p@500k", "720p@1000k", "1080p@3000k"]
        );
        let d = snapshot.job("d").unwrap();
        assert_eq!(d.error.as_deref(), Some("encoder exited with code 1"));
        assert!(snapshot.job("zzz").is_none());
    }

    #[test]
    fn test_refresh_limiter() {
        let limiter = ConcurrencyLimiter::new(3);
        let _slot = limiter.try_acquire().unwrap();

        let mut snapshot = MetricsSnapshot::default();
        snapshot.refresh_limiter(&limiter);

        assert_eq!(snapshot.encoder_slots, 3);
        assert_eq!(snapshot.encoder_slots_in_use, 1);
    }

    #[test]
    fn test_status_serializes_in_snake_case() {
        let metrics = JobMetrics::from(&job("a", JobStatus::Succeeded));
        let json = serde_json::to_value(&metrics).unwrap();
        assert_eq!(json["status"], "succeeded");
        assert_eq!(json["progress"], 0);
    }

    // Property: status counters always add up to the number of jobs.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]
        #[test]
        fn prop_status_counts_sum_to_job_count(statuses in proptest::collection::vec(0u8..4, 0..30)) {
            let jobs: Vec<Job> = statuses
                .iter()
                .enumerate()
                .map(|(i, s)| {
                    let status = match s {
                        0 => JobStatus::Queued,
                        1 => JobStatus::Running,
                        2 => JobStatus::Succeeded,
                        _ => JobStatus::Failed,
                    };
                    job(&format!("job-{}", i), status)
                })
                .collect();

            let mut snapshot = MetricsSnapshot::default();
            snapshot.refresh_jobs(&jobs);

            prop_assert_eq!(
                snapshot.queued_jobs + snapshot.running_jobs + snapshot.succeeded_jobs + snapshot.failed_jobs,
                jobs.len()
            );
            prop_assert_eq!(snapshot.jobs.len(), jobs.len());
        }
    }
}
