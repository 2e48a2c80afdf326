//! Creates jobs and answers status queries about the ones still running.
//!
//! Status lives in a [`DashMap`] keyed by job name. Notifications from any
//! harvest thread update their job's entry in place through `get_mut`, so a
//! read-modify-write of one [`JobStatus`] holds that entry's shard lock and
//! never loses a concurrent update. The entry is removed when the job
//! reports `STOPPED`. The job's [`JobOutcome`] is then kept for
//! [`wait`](JobManager::wait) until claimed or until the retention period
//! passes.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use oaiharvest_agent::{AgentConfig, RecordSink, RunSummary, SinkError};
use oaiharvest_core::Transport;
use oaiharvest_harvester::{HarvestNotification, HarvestParameters};

use crate::error::JobCreationError;
use crate::job::{
    HarvestJob, JobHarvestSpec, JobNotification, JobNotificationType, JobObserver, HARVEST_NAME,
    JOB_NAME, REPOSITORY_INSTITUTION, REPOSITORY_NAME,
};
use crate::repository::{JobInfo, JobRepository};
use crate::status::JobStatus;

/// Opens the sink a new job writes to, given the job name.
pub type SinkFactory =
    Box<dyn Fn(&str) -> Result<Box<dyn RecordSink>, SinkError> + Send + Sync>;

/// Called for every `ENDED` notification that carries a failure cause.
pub type FailureListener = Box<dyn Fn(&HarvestNotification) + Send + Sync>;

const WAIT_POLL: Duration = Duration::from_millis(20);

/// How long an unclaimed outcome stays available to `wait`.
pub const DEFAULT_OUTCOME_RETENTION: Duration = Duration::from_secs(300);

/// How a finished job went.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub job_name: String,
    /// `None` when the agent could not run
    pub summary: Option<RunSummary>,
    pub error: Option<String>,
    /// `ENDED` notifications of harvests that failed
    pub failed_harvests: Vec<HarvestNotification>,
}

struct ManagerState {
    repository: Arc<dyn JobRepository>,
    failure_listener: Option<FailureListener>,
    observers: Vec<Arc<dyn JobObserver>>,
    status: DashMap<String, JobStatus>,
    jobs: DashMap<String, Arc<HarvestJob>>,
    failures: DashMap<String, Vec<HarvestNotification>>,
    finished: DashMap<String, (Instant, JobOutcome)>,
    outcome_retention: Duration,
}

impl ManagerState {
    fn prune_outcomes(&self) {
        let retention = self.outcome_retention;
        self.finished.retain(|name, (at, _)| {
            let keep = at.elapsed() < retention;
            if !keep {
                log::debug!("[job {name}] unclaimed outcome dropped");
            }
            keep
        });
    }
}

/// Feeds one job's notifications into the shared status map.
struct StatusObserver {
    job_name: String,
    state: Arc<ManagerState>,
}

impl JobObserver for StatusObserver {
    fn on_harvest_notification(&self, harvest_id: u64, notification: &HarvestNotification) {
        if notification.is_ended() {
            if let Some(cause) = &notification.cause {
                let errors = cause.protocol_errors();
                if !errors.is_empty() {
                    let recorded = self
                        .state
                        .repository
                        .record_protocol_errors(harvest_id, errors);
                    if let Err(e) = recorded {
                        log::error!("[job {}] recording protocol errors: {e}", self.job_name);
                    }
                }
                if let Some(listener) = &self.state.failure_listener {
                    listener(notification);
                }
                self.state
                    .failures
                    .entry(self.job_name.clone())
                    .or_default()
                    .push(notification.clone());
            }
        }
        if let Some(mut status) = self.state.status.get_mut(&self.job_name) {
            status.harvest_update(harvest_id, notification);
        }
    }

    fn on_job_notification(&self, notification: &JobNotification) {
        if notification.kind == JobNotificationType::Stopped {
            self.state.status.remove(&self.job_name);
            log::debug!("[job {}] status removed", self.job_name);
        } else if let Some(mut status) = self.state.status.get_mut(&self.job_name) {
            status.job_update(notification);
        }
    }
}

/// Safe to share between threads.
pub struct JobManager {
    transport: Arc<dyn Transport>,
    sink_factory: SinkFactory,
    agent_config: AgentConfig,
    state: Arc<ManagerState>,
}

impl std::fmt::Debug for JobManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobManager")
            .field("agent_config", &self.agent_config)
            .field("running_jobs", &self.state.status.len())
            .finish_non_exhaustive()
    }
}

fn build_specs(
    job_name: &str,
    info: &JobInfo,
    params: Vec<HarvestParameters>,
) -> Vec<JobHarvestSpec> {
    params
        .into_iter()
        .zip(&info.harvests)
        .map(|(params, harvest)| JobHarvestSpec {
            params,
            harvest_id: harvest.id,
            tags: BTreeMap::from([
                (HARVEST_NAME.to_string(), harvest.name.clone()),
                (
                    REPOSITORY_NAME.to_string(),
                    harvest.repository_name.clone(),
                ),
                (
                    REPOSITORY_INSTITUTION.to_string(),
                    harvest.repository_institution.clone(),
                ),
                (JOB_NAME.to_string(), job_name.to_string()),
            ]),
        })
        .collect()
}

impl JobManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        repository: Arc<dyn JobRepository>,
        sink_factory: SinkFactory,
    ) -> Self {
        Self {
            transport,
            sink_factory,
            agent_config: AgentConfig::default(),
            state: Arc::new(ManagerState {
                repository,
                failure_listener: None,
                observers: Vec::new(),
                status: DashMap::new(),
                jobs: DashMap::new(),
                failures: DashMap::new(),
                finished: DashMap::new(),
                outcome_retention: DEFAULT_OUTCOME_RETENTION,
            }),
        }
    }

    pub fn with_agent_config(mut self, config: AgentConfig) -> Self {
        self.agent_config = config;
        self
    }

    /// Must be set before the first job is created.
    pub fn with_failure_listener(mut self, listener: FailureListener) -> Self {
        match Arc::get_mut(&mut self.state) {
            Some(state) => state.failure_listener = Some(listener),
            None => log::warn!("Failure listener ignored: jobs already created"),
        }
        self
    }

    /// How long a finished job's outcome waits to be claimed through
    /// [`wait`](Self::wait). Must be set before the first job is created.
    pub fn with_outcome_retention(mut self, retention: Duration) -> Self {
        match Arc::get_mut(&mut self.state) {
            Some(state) => state.outcome_retention = retention,
            None => log::warn!("Outcome retention ignored: jobs already created"),
        }
        self
    }

    /// Attach an observer to every job created from now on.
    pub fn with_observer(mut self, observer: Arc<dyn JobObserver>) -> Self {
        match Arc::get_mut(&mut self.state) {
            Some(state) => state.observers.push(observer),
            None => log::warn!("Job observer ignored: jobs already created"),
        }
        self
    }

    pub fn repository(&self) -> &Arc<dyn JobRepository> {
        &self.state.repository
    }

    /// Create a job and start it on its own thread. Returns the job name.
    ///
    /// Fails without starting anything when any base URI is not a known
    /// repository; the error lists every such URI.
    pub fn new_job(&self, params: Vec<HarvestParameters>) -> Result<String, JobCreationError> {
        if params.is_empty() {
            return Err(JobCreationError::NoHarvests);
        }
        for p in &params {
            p.validate()?;
        }

        let info = self.state.repository.create_job(&params)?;
        if !info.invalid_base_uris.is_empty() {
            return Err(JobCreationError::InvalidBaseUris(info.invalid_base_uris));
        }

        let job_name = info.id.to_string();
        let specs = build_specs(&job_name, &info, params);
        let mut sink = (self.sink_factory)(&job_name)?;

        let mut observers: Vec<Arc<dyn JobObserver>> = vec![Arc::new(StatusObserver {
            job_name: job_name.clone(),
            state: self.state.clone(),
        })];
        observers.extend(self.state.observers.iter().cloned());
        let job = Arc::new(HarvestJob::new(
            job_name.clone(),
            self.transport.clone(),
            self.agent_config.clone(),
            specs,
            observers,
        )?);

        self.state
            .status
            .insert(job_name.clone(), JobStatus::new(&job_name, job.specs()));
        self.state.jobs.insert(job_name.clone(), job.clone());

        let state = self.state.clone();
        let name = job_name.clone();
        let spawned = thread::Builder::new()
            .name(format!("job-{job_name}"))
            .spawn(move || {
                let result = job.start(sink.as_mut());
                let outcome = JobOutcome {
                    job_name: name.clone(),
                    summary: result.as_ref().ok().copied(),
                    error: result.err().map(|e| e.to_string()),
                    failed_harvests: state
                        .failures
                        .remove(&name)
                        .map(|(_, f)| f)
                        .unwrap_or_default(),
                };
                state.jobs.remove(&name);
                state.prune_outcomes();
                state.finished.insert(name, (Instant::now(), outcome));
            });
        if let Err(e) = spawned {
            self.state.status.remove(&job_name);
            self.state.jobs.remove(&job_name);
            return Err(JobCreationError::Spawn(e));
        }

        log::info!("[job {job_name}] created");
        Ok(job_name)
    }

    /// A job that has not finished yet.
    pub fn job(&self, job_name: &str) -> Option<Arc<HarvestJob>> {
        self.state.jobs.get(job_name).map(|j| j.value().clone())
    }

    /// Copy of a status entry with the job's live queue peak folded in.
    fn snapshot(&self, job_name: &str, status: &JobStatus) -> JobStatus {
        let mut status = status.clone();
        if let Some(job) = self.state.jobs.get(job_name) {
            status.max_queue_size = status.max_queue_size.max(job.max_queue_len());
        }
        status
    }

    /// Status of every running job, sorted by name.
    pub fn running_status(&self) -> BTreeMap<String, JobStatus> {
        let entries: Vec<(String, JobStatus)> = self
            .state
            .status
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        entries
            .into_iter()
            .map(|(name, status)| {
                let status = self.snapshot(&name, &status);
                (name, status)
            })
            .collect()
    }

    /// `None` once the job has stopped.
    pub fn status(&self, job_name: &str) -> Option<JobStatus> {
        let status = self.state.status.get(job_name)?.value().clone();
        Some(self.snapshot(job_name, &status))
    }

    /// Deepest record queue seen across running jobs.
    pub fn max_queue_size(&self) -> usize {
        self.running_status()
            .values()
            .map(|s| s.max_queue_size)
            .max()
            .unwrap_or(0)
    }

    pub fn stop_job(&self, job_name: &str) -> bool {
        match self.job(job_name) {
            Some(job) => {
                job.stop();
                true
            }
            None => false,
        }
    }

    pub fn stop_all(&self) {
        let jobs: Vec<Arc<HarvestJob>> = self.state.jobs.iter().map(|j| j.value().clone()).collect();
        for job in jobs {
            job.stop();
        }
    }

    /// Block until the job finishes or `timeout` passes. A finished job's
    /// outcome is handed out once, and only within the retention period.
    pub fn wait(&self, job_name: &str, timeout: Duration) -> Option<JobOutcome> {
        let deadline = Instant::now() + timeout;
        loop {
            self.state.prune_outcomes();
            if let Some((_, (_, outcome))) = self.state.finished.remove(job_name) {
                return Some(outcome);
            }
            if Instant::now() >= deadline {
                return None;
            }
            thread::sleep(WAIT_POLL);
        }
    }

    /// Finished jobs whose outcome has not been claimed or expired yet.
    pub fn retained_outcomes(&self) -> usize {
        self.state.prune_outcomes();
        self.state.finished.len()
    }
}
