//! A named group of harvests run through one agent.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use oaiharvest_agent::{
    AgentConfig, AgentError, AgentListener, BatchReport, HarvestAgent, RecordSink, RunSummary,
};
use oaiharvest_core::Transport;
use oaiharvest_harvester::{HarvestNotification, HarvestObserver, HarvestParameters};
use serde::Serialize;

pub const HARVEST_NAME: &str = "harvestName";
pub const REPOSITORY_NAME: &str = "repositoryName";
pub const REPOSITORY_INSTITUTION: &str = "repositoryInstitution";
pub const JOB_NAME: &str = "jobName";

/// One harvest of a job with its repository-assigned identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHarvestSpec {
    pub params: HarvestParameters,
    pub harvest_id: u64,
    pub tags: BTreeMap<String, String>,
}

impl JobHarvestSpec {
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobNotificationType {
    Started,
    BatchWritten,
    /// Every harvest of the job has ended.
    Stopped,
}

impl fmt::Display for JobNotificationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Started => "STARTED",
            Self::BatchWritten => "BATCH_WRITTEN",
            Self::Stopped => "STOPPED",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobNotification {
    pub kind: JobNotificationType,
    pub job_name: String,
    pub queue_size: usize,
    /// Deepest the queue has been since the job started
    pub max_queue_size: usize,
    pub running_harvests: usize,
    pub records_written: usize,
    pub records_rejected: usize,
}

/// Receives both harvest and job notifications of one job, on the thread
/// that emitted them.
pub trait JobObserver: Send + Sync {
    fn on_harvest_notification(&self, _harvest_id: u64, _notification: &HarvestNotification) {}

    fn on_job_notification(&self, _notification: &JobNotification) {}
}

/// Turns agent batch events into `BATCH_WRITTEN` job notifications.
struct BatchRelay {
    job_name: String,
    observers: Vec<Arc<dyn JobObserver>>,
    written: AtomicUsize,
    rejected: AtomicUsize,
}

impl BatchRelay {
    fn notify(
        &self,
        kind: JobNotificationType,
        queue_size: usize,
        max_queue_size: usize,
        running_harvests: usize,
    ) {
        let notification = JobNotification {
            kind,
            job_name: self.job_name.clone(),
            queue_size,
            max_queue_size,
            running_harvests,
            records_written: self.written.load(Ordering::Relaxed),
            records_rejected: self.rejected.load(Ordering::Relaxed),
        };
        for observer in &self.observers {
            observer.on_job_notification(&notification);
        }
    }
}

impl AgentListener for BatchRelay {
    fn on_batch_written(&self, report: &BatchReport) {
        self.written.fetch_add(report.written, Ordering::Relaxed);
        self.rejected.fetch_add(report.rejected, Ordering::Relaxed);
        self.notify(
            JobNotificationType::BatchWritten,
            report.queue_len,
            report.max_queue_len,
            report.running,
        );
    }
}

pub struct HarvestJob {
    name: String,
    specs: Vec<JobHarvestSpec>,
    agent: HarvestAgent,
    relay: Arc<BatchRelay>,
}

impl fmt::Debug for HarvestJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HarvestJob")
            .field("name", &self.name)
            .field("harvests", &self.specs.len())
            .finish_non_exhaustive()
    }
}

impl HarvestJob {
    pub fn new(
        name: impl Into<String>,
        transport: Arc<dyn Transport>,
        config: AgentConfig,
        specs: Vec<JobHarvestSpec>,
        observers: Vec<Arc<dyn JobObserver>>,
    ) -> Result<Self, AgentError> {
        let name = name.into();
        let relay = Arc::new(BatchRelay {
            job_name: name.clone(),
            observers,
            written: AtomicUsize::new(0),
            rejected: AtomicUsize::new(0),
        });
        let agent = HarvestAgent::builder(transport)
            .config(config)
            .listener(relay.clone())
            .build()?;

        for spec in &specs {
            let harvest_id = spec.harvest_id;
            let relay = relay.clone();
            let observer: Arc<dyn HarvestObserver> =
                Arc::new(move |n: &HarvestNotification| {
                    for observer in &relay.observers {
                        observer.on_harvest_notification(harvest_id, n);
                    }
                });
            agent.add_harvest(spec.params.clone(), vec![observer])?;
        }

        Ok(Self {
            name,
            specs,
            agent,
            relay,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn specs(&self) -> &[JobHarvestSpec] {
        &self.specs
    }

    pub fn queue_len(&self) -> usize {
        self.agent.queue_len()
    }

    /// Deepest the record queue has been so far.
    pub fn max_queue_len(&self) -> usize {
        self.agent.max_queue_len()
    }

    pub fn running_harvests(&self) -> usize {
        self.agent.running_harvests()
    }

    /// Run every harvest to its end on the calling thread.
    ///
    /// `STOPPED` is emitted once all harvests have ended, also when the
    /// agent could not run.
    pub fn start(&self, sink: &mut dyn RecordSink) -> Result<RunSummary, AgentError> {
        log::info!("[job {}] starting {} harvests", self.name, self.specs.len());
        self.relay
            .notify(JobNotificationType::Started, 0, 0, self.specs.len());

        let result = self.agent.start(sink);
        match &result {
            Ok(summary) => log::info!(
                "[job {}] stopped: {} records written, {} rejected",
                self.name,
                summary.records_written,
                summary.records_rejected
            ),
            Err(e) => log::error!("[job {}] failed: {e}", self.name),
        }
        self.relay.notify(
            JobNotificationType::Stopped,
            self.agent.queue_len(),
            self.agent.max_queue_len(),
            self.agent.running_harvests(),
        );
        result
    }

    pub fn stop(&self) {
        log::warn!("[job {}] stop requested", self.name);
        self.agent.stop();
    }

    pub fn is_stopped(&self) -> bool {
        self.agent.is_stopped()
    }
}
