//! Durable job queue with leases.
//!
//! Delivery is at-least-once: a leased job stays invisible to other workers
//! until it is acknowledged or its lease expires, after which it is delivered
//! again. Every progress report and acknowledgement carries the [`Lease`] it
//! was issued under; once a lease has expired its token is rejected, so an
//! aborted attempt can never overwrite the state of a newer one.

pub mod file;

pub use file::{submit_to_inbox, FileQueue, QueueSettings};

use crate::jobs::{Job, JobDescriptor, JobError, JobResult, JobStatus};
use async_trait::async_trait;
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue storage error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Job(#[from] JobError),

    #[error("job {0} already exists")]
    Duplicate(String),

    #[error("job {0} not found")]
    NotFound(String),

    #[error("lease on job {0} is no longer held")]
    LeaseLost(String),
}

/// Proof of ownership of one delivery of a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub job_id: String,
    pub token: String,
    /// Delivery number this lease belongs to, starting at 1.
    pub attempt: u32,
    /// When the queue will consider this delivery abandoned unless renewed.
    pub deadline: Instant,
}

/// A job handed to a worker together with its lease.
#[derive(Debug, Clone)]
pub struct LeasedJob {
    pub job: Job,
    pub lease: Lease,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Add a job; returns its id.
    async fn enqueue(&self, descriptor: JobDescriptor) -> Result<String, QueueError>;

    /// Wait until a job is available and lease it.
    ///
    /// Cancel-safe: dropping the future never loses a job.
    async fn lease(&self) -> Result<LeasedJob, QueueError>;

    /// Renew a lease for another full lease timeout; returns the new deadline.
    async fn extend_lease(&self, lease: &Lease) -> Result<Instant, QueueError>;

    async fn report_progress(&self, lease: &Lease, percent: u8) -> Result<(), QueueError>;

    async fn ack_success(&self, lease: &Lease, result: JobResult) -> Result<(), QueueError>;

    /// Record a failed attempt. With `retry` the job is redelivered unless
    /// its attempts are used up; returns the status the job ended in.
    async fn ack_failure(
        &self,
        lease: &Lease,
        error: &str,
        retry: bool,
    ) -> Result<JobStatus, QueueError>;

    async fn get(&self, job_id: &str) -> Result<Option<Job>, QueueError>;

    /// All known jobs, oldest first.
    async fn list(&self) -> Result<Vec<Job>, QueueError>;

    fn lease_timeout(&self) -> Duration;
}
