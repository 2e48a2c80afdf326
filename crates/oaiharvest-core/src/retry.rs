//! Backoff schedule for resubmitting failed harvests

use std::time::Duration;

/// Errors that may succeed when the same work is attempted again.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for crate::StreamError {
    fn is_retryable(&self) -> bool {
        crate::StreamError::is_retryable(self)
    }
}

/// Exponential backoff: 2^attempt seconds (2s, 4s, 8s, ...), capped at 5 minutes
pub fn backoff_duration(attempt: u32) -> Duration {
    Duration::from_secs(2u64.saturating_pow(attempt).min(300))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_exponential() {
        assert_eq!(backoff_duration(1), Duration::from_secs(2));
        assert_eq!(backoff_duration(2), Duration::from_secs(4));
        assert_eq!(backoff_duration(3), Duration::from_secs(8));
    }

    #[test]
    fn backoff_capped() {
        assert_eq!(backoff_duration(12), Duration::from_secs(300));
        assert_eq!(backoff_duration(u32::MAX), Duration::from_secs(300));
    }
}
