//! Job and harvest bookkeeping.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use oaiharvest_harvester::{HarvestParameters, ProtocolError};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::RepositoryError;

/// A known OAI-PMH repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    pub base_uri: String,
    pub name: String,
    #[serde(default)]
    pub institution: String,
}

/// Identifiers assigned to one harvest of a new job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HarvestInfo {
    pub id: u64,
    pub name: String,
    pub repository_name: String,
    pub repository_institution: String,
}

/// Result of creating a job.
///
/// `harvests` lines up with the accepted parameter sets; base URIs that
/// did not resolve to a repository are listed in `invalid_base_uris`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobInfo {
    pub id: u64,
    pub harvests: Vec<HarvestInfo>,
    pub invalid_base_uris: Vec<String>,
}

/// Stores jobs, harvests and the protocol errors they report.
pub trait JobRepository: Send + Sync {
    fn create_job(&self, harvests: &[HarvestParameters]) -> Result<JobInfo, RepositoryError>;

    fn record_protocol_errors(
        &self,
        harvest_id: u64,
        errors: &[ProtocolError],
    ) -> Result<(), RepositoryError>;

    fn protocol_errors(&self, harvest_id: u64) -> Result<Vec<ProtocolError>, RepositoryError>;
}

/// Process-local repository.
///
/// With no known repositories, any http(s) base URI is accepted and named
/// after its host.
#[derive(Debug, Default)]
pub struct InMemoryRepository {
    repositories: Vec<(String, Repository)>,
    next_job: AtomicU64,
    next_harvest: AtomicU64,
    jobs: DashMap<u64, Vec<HarvestInfo>>,
    errors: DashMap<u64, Vec<ProtocolError>>,
}

fn normalize(uri: &str) -> Option<String> {
    Url::parse(uri).ok().map(|u| u.to_string())
}

impl InMemoryRepository {
    pub fn new(repositories: Vec<Repository>) -> Self {
        let repositories = repositories
            .into_iter()
            .filter_map(|r| match normalize(&r.base_uri) {
                Some(key) => Some((key, r)),
                None => {
                    log::warn!("Ignoring repository with invalid base URI: {}", r.base_uri);
                    None
                }
            })
            .collect();
        Self {
            repositories,
            ..Self::default()
        }
    }

    fn resolve(&self, base_uri: &Url) -> Option<Repository> {
        if !matches!(base_uri.scheme(), "http" | "https") {
            return None;
        }
        if self.repositories.is_empty() {
            return Some(Repository {
                base_uri: base_uri.to_string(),
                name: base_uri.host_str().unwrap_or_default().to_string(),
                institution: String::new(),
            });
        }
        self.repositories
            .iter()
            .find(|(key, _)| key == base_uri.as_str())
            .map(|(_, r)| r.clone())
    }

    pub fn job_harvests(&self, job_id: u64) -> Option<Vec<HarvestInfo>> {
        self.jobs.get(&job_id).map(|h| h.clone())
    }
}

impl JobRepository for InMemoryRepository {
    fn create_job(&self, harvests: &[HarvestParameters]) -> Result<JobInfo, RepositoryError> {
        let mut info = JobInfo {
            id: self.next_job.fetch_add(1, Ordering::SeqCst) + 1,
            ..JobInfo::default()
        };
        for params in harvests {
            let Some(repository) = self.resolve(params.base_uri()) else {
                info.invalid_base_uris.push(params.base_uri().to_string());
                continue;
            };
            let id = self.next_harvest.fetch_add(1, Ordering::SeqCst) + 1;
            info.harvests.push(HarvestInfo {
                id,
                name: format!("{}-{id}", info.id),
                repository_name: repository.name,
                repository_institution: repository.institution,
            });
        }
        if info.invalid_base_uris.is_empty() {
            self.jobs.insert(info.id, info.harvests.clone());
        }
        Ok(info)
    }

    fn record_protocol_errors(
        &self,
        harvest_id: u64,
        errors: &[ProtocolError],
    ) -> Result<(), RepositoryError> {
        self.errors
            .entry(harvest_id)
            .or_default()
            .extend_from_slice(errors);
        Ok(())
    }

    fn protocol_errors(&self, harvest_id: u64) -> Result<Vec<ProtocolError>, RepositoryError> {
        Ok(self
            .errors
            .get(&harvest_id)
            .map(|e| e.clone())
            .unwrap_or_default())
    }
}
