//! Harvest error taxonomy.

use std::io;
use std::time::Duration;

use oaiharvest_core::{Retryable, StreamError};

use crate::protocol::{ProtocolError, Verb};

/// Why a harvest could not start, or why it ended early.
#[derive(Debug, thiserror::Error)]
pub enum HarvestError {
    #[error("invalid {verb} parameters: {reason}")]
    InvalidParameters { verb: Verb, reason: String },

    #[error("harvester is already running")]
    AlreadyRunning,

    /// Connection-level failure, including a stalled body read.
    #[error("transport failure: {0}")]
    Transport(#[from] StreamError),

    #[error("unexpected HTTP status {0}")]
    HttpStatus(u16),

    /// The body is not well-formed XML.
    #[error("malformed XML: {0}")]
    Parse(#[source] quick_xml::Error),

    /// XML that is not a complete OAI-PMH response.
    #[error("invalid OAI-PMH response: {0}")]
    Malformed(String),

    #[error("record extraction failed: {0}")]
    Extraction(#[from] ExtractError),

    #[error("repository reported {}", join_errors(.0))]
    Protocol(Vec<ProtocolError>),

    /// A record could not be queued within the offer timeout.
    #[error("record queue stayed full for {}ms", .timeout.as_millis())]
    Capacity { timeout: Duration },
}

/// Failure while finalizing one record.
#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("replaying payload events: {0}")]
    Replay(String),

    #[error("compressing payload: {0}")]
    Compress(#[source] io::Error),

    #[error("{0}")]
    Hook(String),
}

fn join_errors(errors: &[ProtocolError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl HarvestError {
    /// Map a reader error, keeping body I/O failures apart from bad markup.
    pub fn from_xml(e: quick_xml::Error) -> Self {
        match e {
            quick_xml::Error::Io(io) => {
                Self::Transport(StreamError::Io(io::Error::new(io.kind(), io.to_string())))
            }
            other => Self::Parse(other),
        }
    }

    /// Protocol errors carried by this failure, if any.
    pub fn protocol_errors(&self) -> &[ProtocolError] {
        match self {
            Self::Protocol(errors) => errors,
            _ => &[],
        }
    }
}

impl Retryable for HarvestError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_retryable(),
            Self::HttpStatus(status) => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}
