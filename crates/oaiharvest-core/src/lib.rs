//! oaiharvest core - shared infrastructure for OAI-PMH harvesting
//!
//! Blocking HTTP transport, cancellation, the bounded record queue, and the
//! logging/progress plumbing used by the binaries.

pub mod logging;
pub mod progress;
pub mod queue;
pub mod retry;
pub mod shutdown;
pub mod stream;

// Re-exports for convenience
pub use logging::{IndicatifLogger, init_logging};
pub use progress::{ProgressContext, SharedProgress, fmt_num, job_message};
pub use queue::BoundedQueue;
pub use retry::{Retryable, backoff_duration};
pub use shutdown::{CancelToken, is_shutdown_requested, shutdown_flag};
pub use stream::{
    HttpConfig, HttpResponse, HttpTransport, ResponseBody, SHARED_RUNTIME, StreamError,
    Transport,
};
