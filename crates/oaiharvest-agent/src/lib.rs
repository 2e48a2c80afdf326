//! Harvest pipeline: concurrent harvests, a bounded record queue and
//! batched writes to a [`RecordSink`].

pub mod agent;
pub mod config;
pub mod error;
pub mod parquet_sink;
pub mod schema;
pub mod sink;

pub use agent::{AgentListener, BatchReport, HarvestAgent, HarvestAgentBuilder, RunSummary};
pub use config::AgentConfig;
pub use error::{AgentError, SinkError};
pub use parquet_sink::ParquetRecordSink;
pub use sink::{FailedRecord, MemorySink, RecordSink, WritePolicy};
