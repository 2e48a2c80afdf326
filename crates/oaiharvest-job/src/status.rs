//! Per-job status aggregated from notifications.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use oaiharvest_harvester::{HarvestNotification, HarvestStats, NotificationType};
use serde::Serialize;

use crate::job::{JobHarvestSpec, JobNotification, JobNotificationType, HARVEST_NAME};

/// Last known state of one harvest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HarvestStatus {
    pub name: String,
    pub base_uri: String,
    /// `None` until the harvest has started
    pub last_notification: Option<NotificationType>,
    pub running: bool,
    pub explicitly_stopped: bool,
    pub interrupted: bool,
    pub cause: Option<String>,
    pub resumption_token: Option<String>,
    pub last_response: Option<DateTime<Utc>>,
    pub stats: HarvestStats,
}

impl HarvestStatus {
    fn pending(name: String, base_uri: String) -> Self {
        Self {
            name,
            base_uri,
            last_notification: None,
            running: false,
            explicitly_stopped: false,
            interrupted: false,
            cause: None,
            resumption_token: None,
            last_response: None,
            stats: HarvestStats::default(),
        }
    }

    pub fn is_ended(&self) -> bool {
        self.last_notification == Some(NotificationType::Ended)
    }
}

/// Snapshot-able status of a job: its harvests by id plus writer-side
/// counters. Mutated only through [`harvest_update`](Self::harvest_update)
/// and [`job_update`](Self::job_update).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobStatus {
    pub job_name: String,
    pub state: Option<JobNotificationType>,
    pub harvests: BTreeMap<u64, HarvestStatus>,
    pub queue_size: usize,
    pub max_queue_size: usize,
    pub records_written: usize,
    pub records_rejected: usize,
    pub updated: DateTime<Utc>,
}

impl JobStatus {
    pub fn new(job_name: impl Into<String>, specs: &[JobHarvestSpec]) -> Self {
        let harvests = specs
            .iter()
            .map(|spec| {
                let name = spec
                    .tag(HARVEST_NAME)
                    .map(str::to_string)
                    .unwrap_or_else(|| spec.harvest_id.to_string());
                (
                    spec.harvest_id,
                    HarvestStatus::pending(name, spec.params.base_uri().to_string()),
                )
            })
            .collect();
        Self {
            job_name: job_name.into(),
            state: None,
            harvests,
            queue_size: 0,
            max_queue_size: 0,
            records_written: 0,
            records_rejected: 0,
            updated: Utc::now(),
        }
    }

    pub fn harvest_update(&mut self, harvest_id: u64, notification: &HarvestNotification) {
        let status = self.harvests.entry(harvest_id).or_insert_with(|| {
            let base_uri = notification.params.base_uri().to_string();
            HarvestStatus::pending(harvest_id.to_string(), base_uri)
        });
        status.last_notification = Some(notification.kind);
        status.running = notification.running;
        status.explicitly_stopped = notification.explicitly_stopped;
        status.interrupted = notification.interrupted;
        status.cause = notification.cause.as_ref().map(|c| c.to_string());
        status.resumption_token = notification.resumption_token.clone();
        status.last_response = notification.last_response;
        status.stats = notification.stats;
        self.updated = Utc::now();
    }

    pub fn job_update(&mut self, notification: &JobNotification) {
        self.state = Some(notification.kind);
        self.queue_size = notification.queue_size;
        self.max_queue_size = self
            .max_queue_size
            .max(notification.max_queue_size)
            .max(notification.queue_size);
        self.records_written = notification.records_written;
        self.records_rejected = notification.records_rejected;
        self.updated = Utc::now();
    }

    pub fn running_harvests(&self) -> usize {
        self.harvests.values().filter(|h| h.running).count()
    }

    pub fn ended_harvests(&self) -> usize {
        self.harvests.values().filter(|h| h.is_ended()).count()
    }

    pub fn failed_harvests(&self) -> usize {
        self.harvests.values().filter(|h| h.cause.is_some()).count()
    }

    pub fn records_harvested(&self) -> u64 {
        self.harvests.values().map(|h| h.stats.records).sum()
    }
}
