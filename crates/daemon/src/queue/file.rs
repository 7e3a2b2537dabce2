//! File-backed job queue.
//!
//! Layout under the state directory:
//!
//! ```text
//! <state_dir>/jobs/<job_id>.json    one record per job, rewritten on every transition
//! <state_dir>/inbox/<job_id>.json   descriptors dropped by external producers
//! ```
//!
//! Lease deadlines live in memory only. A queue reopened after a crash treats
//! every job it finds in `running` as an abandoned delivery.

use super::{JobQueue, Lease, LeasedJob, QueueError};
use crate::config::Config;
use crate::jobs::{load_jobs, save_job, Job, JobDescriptor, JobResult, JobStatus};
use crate::rendition::{default_catalog, RenditionSpec};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

const JOBS_DIR: &str = "jobs";
const INBOX_DIR: &str = "inbox";

/// Settings for a [`FileQueue`]
#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub state_dir: PathBuf,
    pub lease_timeout: Duration,
    /// Deliveries allowed per job before it fails permanently.
    pub max_attempts: u32,
    /// How often a waiting `lease` rescans the inbox and expired leases.
    pub poll_interval: Duration,
    /// Used for descriptors that request no renditions.
    pub default_renditions: Vec<RenditionSpec>,
}

impl QueueSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            state_dir: config.queue.state_dir.clone(),
            lease_timeout: Duration::from_secs(config.queue.lease_timeout_secs.max(1)),
            max_attempts: config.queue.max_attempts.max(1),
            poll_interval: Duration::from_millis(config.queue.poll_interval_ms.max(10)),
            default_renditions: config
                .renditions
                .iter()
                .cloned()
                .map(RenditionSpec::from)
                .collect(),
        }
    }
}

struct ActiveLease {
    token: String,
    attempt: u32,
    deadline: Instant,
}

#[derive(Default)]
struct QueueState {
    jobs: HashMap<String, Job>,
    ready: VecDeque<String>,
    leases: HashMap<String, ActiveLease>,
}

/// Durable queue storing one JSON record per job.
pub struct FileQueue {
    settings: QueueSettings,
    jobs_dir: PathBuf,
    inbox_dir: PathBuf,
    state: Mutex<QueueState>,
    available: Notify,
}

impl FileQueue {
    /// Open (or create) the queue under `settings.state_dir`.
    ///
    /// Jobs found `running` belonged to a process that died mid-delivery: they
    /// are queued again, or failed when their attempts are exhausted.
    pub fn open(settings: QueueSettings) -> Result<Self, QueueError> {
        let jobs_dir = settings.state_dir.join(JOBS_DIR);
        let inbox_dir = settings.state_dir.join(INBOX_DIR);
        fs::create_dir_all(&jobs_dir)?;
        fs::create_dir_all(&inbox_dir)?;

        let mut state = QueueState::default();
        let mut recovered = 0usize;

        for mut job in load_jobs(&jobs_dir)? {
            if job.status == JobStatus::Running {
                if job.attempts >= settings.max_attempts {
                    job.fail(&format!(
                        "interrupted by restart after {} attempts",
                        job.attempts
                    ));
                } else {
                    job.requeue("interrupted by restart");
                }
                save_job(&job, &jobs_dir)?;
                recovered += 1;
            }
            if job.status == JobStatus::Queued {
                state.ready.push_back(job.id.clone());
            }
            state.jobs.insert(job.id.clone(), job);
        }

        info!(
            state_dir = %settings.state_dir.display(),
            jobs = state.jobs.len(),
            queued = state.ready.len(),
            recovered,
            "job queue opened"
        );

        let queue = Self {
            settings,
            jobs_dir,
            inbox_dir,
            state: Mutex::new(state),
            available: Notify::new(),
        };
        Ok(queue)
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    fn insert_new(&self, state: &mut QueueState, job: Job) -> Result<String, QueueError> {
        if state.jobs.contains_key(&job.id) {
            return Err(QueueError::Duplicate(job.id));
        }
        save_job(&job, &self.jobs_dir)?;
        let id = job.id.clone();
        info!(job_id = %id, input = %job.input_path.display(), renditions = job.renditions.len(), "job enqueued");
        state.ready.push_back(id.clone());
        state.jobs.insert(id.clone(), job);
        self.available.notify_one();
        Ok(id)
    }

    /// Move descriptors from the inbox into the queue.
    ///
    /// Inbox files are named after their job id. A file matching the job
    /// already stored under its id was ingested before and is removed; one
    /// that reuses the id for different work is set aside as `.rejected`.
    fn ingest_inbox(&self, state: &mut QueueState) -> Result<(), QueueError> {
        let mut paths: Vec<PathBuf> = fs::read_dir(&self.inbox_dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("json"))
            .collect();
        paths.sort();

        for path in paths {
            let parsed = fs::read_to_string(&path)
                .map_err(|e| e.to_string())
                .and_then(|content| {
                    serde_json::from_str::<JobDescriptor>(&content).map_err(|e| e.to_string())
                })
                .and_then(|desc| {
                    Job::from_descriptor(desc, &self.settings.default_renditions)
                        .map_err(|e| e.to_string())
                });

            let rejection = match parsed {
                Ok(job) => match state.jobs.get(&job.id) {
                    Some(existing)
                        if existing.input_path == job.input_path
                            && existing.renditions == job.renditions =>
                    {
                        debug!(job_id = %job.id, "inbox descriptor already ingested");
                        None
                    }
                    Some(_) => Some(format!("job id {} is already in use", job.id)),
                    None => {
                        self.insert_new(state, job)?;
                        None
                    }
                },
                Err(reason) => Some(reason),
            };

            match rejection {
                Some(reason) => {
                    warn!(path = %path.display(), error = %reason, "rejecting inbox descriptor");
                    fs::rename(&path, path.with_extension("rejected"))?;
                }
                None => fs::remove_file(&path)?,
            }
        }
        Ok(())
    }

    /// Return jobs whose lease deadline passed to the queue, or fail them.
    fn reap_expired(&self, state: &mut QueueState, now: Instant) -> Result<(), QueueError> {
        let expired: Vec<String> = state
            .leases
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();

        for id in expired {
            state.leases.remove(&id);
            let Some(job) = state.jobs.get_mut(&id) else {
                continue;
            };
            if job.attempts >= self.settings.max_attempts {
                job.fail(&format!("lease expired after {} attempts", job.attempts));
                warn!(job_id = %id, attempt = job.attempts, "lease expired, attempts exhausted");
            } else {
                job.requeue("lease expired");
                state.ready.push_back(id.clone());
                warn!(job_id = %id, attempt = job.attempts, "lease expired, job will be redelivered");
            }
            save_job(job, &self.jobs_dir)?;
        }
        Ok(())
    }

    fn try_lease(&self, state: &mut QueueState) -> Result<Option<LeasedJob>, QueueError> {
        self.reap_expired(state, Instant::now())?;
        self.ingest_inbox(state)?;

        while let Some(id) = state.ready.pop_front() {
            let Some(job) = state.jobs.get_mut(&id) else {
                continue;
            };
            if job.status != JobStatus::Queued {
                continue;
            }

            job.begin_attempt();
            if let Err(e) = save_job(job, &self.jobs_dir) {
                job.attempts -= 1;
                job.set_status(JobStatus::Queued);
                state.ready.push_front(id);
                return Err(e.into());
            }

            let lease = Lease {
                job_id: id.clone(),
                token: Uuid::new_v4().to_string(),
                attempt: job.attempts,
                deadline: Instant::now() + self.settings.lease_timeout,
            };
            state.leases.insert(
                id.clone(),
                ActiveLease {
                    token: lease.token.clone(),
                    attempt: lease.attempt,
                    deadline: lease.deadline,
                },
            );
            info!(job_id = %id, attempt = lease.attempt, "job leased");
            return Ok(Some(LeasedJob {
                job: job.clone(),
                lease,
            }));
        }
        Ok(None)
    }

    /// Reap expired leases, then check that `lease` is still the current one.
    fn check_lease(&self, state: &mut QueueState, lease: &Lease) -> Result<(), QueueError> {
        self.reap_expired(state, Instant::now())?;
        match state.leases.get(&lease.job_id) {
            Some(active) if active.token == lease.token && active.attempt == lease.attempt => {
                Ok(())
            }
            _ => Err(QueueError::LeaseLost(lease.job_id.clone())),
        }
    }

    fn job_mut<'a>(state: &'a mut QueueState, job_id: &str) -> Result<&'a mut Job, QueueError> {
        state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| QueueError::NotFound(job_id.to_string()))
    }
}

#[async_trait]
impl JobQueue for FileQueue {
    async fn enqueue(&self, descriptor: JobDescriptor) -> Result<String, QueueError> {
        let job = Job::from_descriptor(descriptor, &self.settings.default_renditions)?;
        let mut state = self.state.lock().await;
        self.insert_new(&mut state, job)
    }

    async fn lease(&self) -> Result<LeasedJob, QueueError> {
        loop {
            // Register interest before looking, so an enqueue in between is not missed
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.state.lock().await;
                if let Some(leased) = self.try_lease(&mut state)? {
                    return Ok(leased);
                }
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
            }
        }
    }

    async fn extend_lease(&self, lease: &Lease) -> Result<Instant, QueueError> {
        let mut state = self.state.lock().await;
        self.check_lease(&mut state, lease)?;
        let deadline = Instant::now() + self.settings.lease_timeout;
        if let Some(active) = state.leases.get_mut(&lease.job_id) {
            active.deadline = deadline;
        }
        debug!(job_id = %lease.job_id, attempt = lease.attempt, "lease extended");
        Ok(deadline)
    }

    async fn report_progress(&self, lease: &Lease, percent: u8) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        self.check_lease(&mut state, lease)?;
        let job = Self::job_mut(&mut state, &lease.job_id)?;
        if job.record_progress(percent) {
            save_job(job, &self.jobs_dir)?;
            debug!(job_id = %lease.job_id, percent = job.progress, "progress");
        }
        Ok(())
    }

    async fn ack_success(&self, lease: &Lease, result: JobResult) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        self.check_lease(&mut state, lease)?;
        let job = Self::job_mut(&mut state, &lease.job_id)?;
        job.succeed(result);
        save_job(job, &self.jobs_dir)?;
        state.leases.remove(&lease.job_id);
        info!(job_id = %lease.job_id, attempt = lease.attempt, "job succeeded");
        Ok(())
    }

    async fn ack_failure(
        &self,
        lease: &Lease,
        error: &str,
        retry: bool,
    ) -> Result<JobStatus, QueueError> {
        let mut state = self.state.lock().await;
        self.check_lease(&mut state, lease)?;
        let max_attempts = self.settings.max_attempts;
        let job = Self::job_mut(&mut state, &lease.job_id)?;

        let requeue = retry && job.attempts < max_attempts;
        if requeue {
            job.requeue(error);
        } else {
            job.fail(error);
        }
        save_job(job, &self.jobs_dir)?;
        let status = job.status;

        state.leases.remove(&lease.job_id);
        if requeue {
            state.ready.push_back(lease.job_id.clone());
            self.available.notify_one();
            warn!(job_id = %lease.job_id, attempt = lease.attempt, error, "attempt failed, job requeued");
        } else {
            warn!(job_id = %lease.job_id, attempt = lease.attempt, error, "job failed permanently");
        }
        Ok(status)
    }

    async fn get(&self, job_id: &str) -> Result<Option<Job>, QueueError> {
        let mut state = self.state.lock().await;
        self.reap_expired(&mut state, Instant::now())?;
        Ok(state.jobs.get(job_id).cloned())
    }

    async fn list(&self) -> Result<Vec<Job>, QueueError> {
        let mut state = self.state.lock().await;
        self.reap_expired(&mut state, Instant::now())?;
        let mut jobs: Vec<Job> = state.jobs.values().cloned().collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(jobs)
    }

    fn lease_timeout(&self) -> Duration {
        self.settings.lease_timeout
    }
}

/// Drop a descriptor into the inbox of the queue at `state_dir`.
///
/// The descriptor is validated first and given an id when it has none, so the
/// caller learns the id the job will be known by. Ids that already name a job
/// record are refused.
pub fn submit_to_inbox(state_dir: &Path, descriptor: JobDescriptor) -> Result<String, QueueError> {
    let mut descriptor = descriptor;
    let id = descriptor
        .job_id
        .get_or_insert_with(|| Uuid::new_v4().to_string())
        .clone();
    Job::from_descriptor(descriptor.clone(), &default_catalog())?;

    if state_dir.join(JOBS_DIR).join(format!("{}.json", id)).exists() {
        return Err(QueueError::Duplicate(id));
    }

    let inbox = state_dir.join(INBOX_DIR);
    fs::create_dir_all(&inbox)?;
    let tmp_path = inbox.join(format!(".{}.json.tmp", id));
    let final_path = inbox.join(format!("{}.json", id));
    let json = serde_json::to_string_pretty(&descriptor)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    fs::write(&tmp_path, json)?;
    fs::rename(&tmp_path, &final_path)?;

    Ok(id)
}
