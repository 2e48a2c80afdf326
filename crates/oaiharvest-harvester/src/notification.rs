//! Harvest lifecycle notifications and observers.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::HarvestError;
use crate::params::HarvestParameters;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationType {
    Started,
    ResponseReceived,
    ResponseProcessed,
    Ended,
}

impl fmt::Display for NotificationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Started => "STARTED",
            Self::ResponseReceived => "RESPONSE_RECEIVED",
            Self::ResponseProcessed => "RESPONSE_PROCESSED",
            Self::Ended => "ENDED",
        })
    }
}

/// Counters captured when a notification is emitted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HarvestStats {
    pub requests: u64,
    pub responses: u64,
    pub records: u64,
}

/// Immutable snapshot of a harvest's state.
#[derive(Debug, Clone)]
pub struct HarvestNotification {
    pub kind: NotificationType,
    pub running: bool,
    pub explicitly_stopped: bool,
    pub interrupted: bool,
    pub cause: Option<Arc<HarvestError>>,
    /// Token for the next page, while pagination continues.
    pub resumption_token: Option<String>,
    pub last_response: Option<DateTime<Utc>>,
    pub params: Arc<HarvestParameters>,
    pub stats: HarvestStats,
}

impl HarvestNotification {
    pub fn has_error(&self) -> bool {
        self.cause.is_some()
    }

    pub fn is_ended(&self) -> bool {
        self.kind == NotificationType::Ended
    }
}

impl fmt::Display for HarvestNotification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} (requests={}, responses={}, records={}",
            self.kind,
            self.params.base_uri(),
            self.stats.requests,
            self.stats.responses,
            self.stats.records
        )?;
        if self.explicitly_stopped {
            f.write_str(", stopped")?;
        }
        if self.interrupted {
            f.write_str(", interrupted")?;
        }
        if let Some(cause) = &self.cause {
            write!(f, ", error: {cause}")?;
        }
        f.write_str(")")
    }
}

/// Receives every notification of the harvests it is attached to,
/// synchronously on the harvesting thread.
pub trait HarvestObserver: Send + Sync {
    fn on_harvest_notification(&self, notification: &HarvestNotification);
}

impl<F> HarvestObserver for F
where
    F: Fn(&HarvestNotification) + Send + Sync,
{
    fn on_harvest_notification(&self, notification: &HarvestNotification) {
        self(notification)
    }
}
