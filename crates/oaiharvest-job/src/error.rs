use std::io;

use oaiharvest_agent::{AgentError, SinkError};
use oaiharvest_harvester::HarvestError;

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("job repository error: {0}")]
    Store(String),
}

/// Why a job could not be created. No harvest of the job has started.
#[derive(Debug, thiserror::Error)]
pub enum JobCreationError {
    #[error("job has no harvests")]
    NoHarvests,

    #[error("invalid repository base URIs: {}", .0.join(", "))]
    InvalidBaseUris(Vec<String>),

    #[error(transparent)]
    InvalidParameters(#[from] HarvestError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error("failed to open job sink: {0}")]
    Sink(#[from] SinkError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error("failed to spawn job thread: {0}")]
    Spawn(#[from] io::Error),
}
