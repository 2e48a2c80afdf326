//! Harvest agent configuration

use std::time::Duration;

use crate::error::AgentError;
use crate::sink::WritePolicy;

/// Pipeline tuning for one agent run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    /// Records buffered between harvest workers and the sink
    pub queue_capacity: usize,
    /// Records per sink write
    pub batch_size: usize,
    /// How long a worker waits for queue space before giving up on its harvest
    pub offer_timeout: Duration,
    /// How long the writer waits for a record before re-checking for shutdown
    pub poll_timeout: Duration,
    /// Harvest worker threads
    pub workers: usize,
    pub write_policy: WritePolicy,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 10_000,
            batch_size: 20,
            offer_timeout: Duration::from_millis(100),
            poll_timeout: Duration::from_millis(100),
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
                .max(2),
            write_policy: WritePolicy::default(),
        }
    }
}

impl AgentConfig {
    pub fn validate(&self) -> Result<(), AgentError> {
        if self.queue_capacity == 0 {
            return Err(AgentError::InvalidConfig(
                "queue_capacity must be positive".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(AgentError::InvalidConfig(
                "batch_size must be positive".to_string(),
            ));
        }
        if self.workers == 0 {
            return Err(AgentError::InvalidConfig(
                "workers must be positive".to_string(),
            ));
        }
        if self.offer_timeout.is_zero() || self.poll_timeout.is_zero() {
            return Err(AgentError::InvalidConfig(
                "offer/poll timeouts must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
