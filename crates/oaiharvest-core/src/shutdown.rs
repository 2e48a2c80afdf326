//! Cooperative cancellation.
//!
//! A process-wide flag set by the SIGTERM/SIGINT handler, plus a per-harvest
//! [`CancelToken`] that records *why* a harvest was asked to stop.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

/// Process-wide shutdown flag, set by the SIGTERM/SIGINT handler
pub fn shutdown_flag() -> &'static AtomicBool {
    static FLAG: AtomicBool = AtomicBool::new(false);
    &FLAG
}

/// Check if shutdown was requested
pub fn is_shutdown_requested() -> bool {
    shutdown_flag().load(Ordering::Relaxed)
}

const STOPPED: u8 = 0b01;
const INTERRUPTED: u8 = 0b10;

/// Shared stop signal checked between pages.
///
/// `stop` is a caller's explicit request; `interrupt` is raised by the worker
/// side (queue overload, pool shutdown). Both end the harvest the same way but
/// stay distinguishable for diagnostics. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    state: Arc<AtomicU8>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.state.fetch_or(STOPPED, Ordering::SeqCst);
    }

    pub fn interrupt(&self) {
        self.state.fetch_or(INTERRUPTED, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::SeqCst) != 0
    }

    pub fn is_stopped(&self) -> bool {
        self.state.load(Ordering::SeqCst) & STOPPED != 0
    }

    pub fn is_interrupted(&self) -> bool {
        self.state.load(Ordering::SeqCst) & INTERRUPTED != 0
    }

    /// Clear both flags for a new run. Clones see the reset too.
    pub fn reset(&self) {
        self.state.store(0, Ordering::SeqCst);
    }
}
