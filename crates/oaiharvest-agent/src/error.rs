use std::io;

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("harvest agent was already started")]
    AlreadyStarted,

    #[error("harvest rejected: {0}")]
    InvalidHarvest(#[from] oaiharvest_harvester::HarvestError),

    #[error("invalid agent configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to create harvest thread pool: {0}")]
    ThreadPool(String),
}

/// Total failure of a batch write. Per-record rejections are
/// [`FailedRecord`](crate::FailedRecord)s instead.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("sink I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("sink store error: {0}")]
    Store(String),
}

impl From<arrow::error::ArrowError> for SinkError {
    fn from(e: arrow::error::ArrowError) -> Self {
        Self::Store(e.to_string())
    }
}

impl From<parquet::errors::ParquetError> for SinkError {
    fn from(e: parquet::errors::ParquetError) -> Self {
        Self::Store(e.to_string())
    }
}
