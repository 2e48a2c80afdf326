//! Harvest jobs: named groups of harvests, their status and lifecycle.

pub mod error;
pub mod job;
pub mod manager;
pub mod repository;
pub mod status;

pub use error::{JobCreationError, RepositoryError};
pub use job::{
    HarvestJob, JobHarvestSpec, JobNotification, JobNotificationType, JobObserver, HARVEST_NAME,
    JOB_NAME, REPOSITORY_INSTITUTION, REPOSITORY_NAME,
};
pub use manager::{
    DEFAULT_OUTCOME_RETENTION, FailureListener, JobManager, JobOutcome, SinkFactory,
};
pub use repository::{HarvestInfo, InMemoryRepository, JobInfo, JobRepository, Repository};
pub use status::{HarvestStatus, JobStatus};
