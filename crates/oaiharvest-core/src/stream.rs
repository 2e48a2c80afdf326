//! Blocking HTTP transport with read-stall detection.
//!
//! Uses async reqwest internally with tokio::time::timeout for stall detection,
//! but presents a sync interface so harvest workers can stream a response body
//! straight into the XML reader.

use std::fmt;
use std::io::{self, BufRead, BufReader, Read};
use std::pin::Pin;
use std::sync::LazyLock;
use std::task::Context;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tokio::io::{AsyncRead, ReadBuf};
use url::Url;

/// Contact header sent with every request unless configured otherwise.
pub const DEFAULT_FROM_HEADER: (&str, &str) = ("from", "dev@unizin.org");

/// Buffer size for response body reader (64KB)
const BODY_BUF_SIZE: usize = 64 * 1024;

/// Error types for transport operations
#[derive(Debug)]
pub enum StreamError {
    /// HTTP error with optional status code
    Http {
        status: Option<u16>,
        message: String,
    },
    /// I/O error
    Io(std::io::Error),
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http {
                status: Some(s),
                message,
            } => write!(f, "HTTP {s}: {message}"),
            Self::Http {
                status: None,
                message,
            } => write!(f, "HTTP error: {message}"),
            Self::Io(e) => write!(f, "IO error: {e}"),
        }
    }
}

impl std::error::Error for StreamError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Http { .. } => None,
        }
    }
}

impl StreamError {
    /// Create HTTP error from reqwest error
    pub fn from_reqwest(e: &reqwest::Error) -> Self {
        Self::Http {
            status: e.status().map(|s| s.as_u16()),
            message: e.to_string(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http { status, .. } => match status {
                None => true,
                Some(s) => *s == 429 || *s >= 500,
            },
            Self::Io(e) => e.kind() != io::ErrorKind::StorageFull,
        }
    }
}

impl From<std::io::Error> for StreamError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// HTTP settings shared by every harvest of a run.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub connect_timeout: Duration,
    /// No data for this long while reading a body = stall
    pub read_timeout: Duration,
    /// Sent with every request, in order.
    pub headers: Vec<(String, String)>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(10),
            headers: vec![(
                DEFAULT_FROM_HEADER.0.to_string(),
                DEFAULT_FROM_HEADER.1.to_string(),
            )],
        }
    }
}

/// Response body as handed to the XML reader.
pub type ResponseBody = Box<dyn BufRead + Send>;

/// Status line plus a lazily read body.
pub struct HttpResponse {
    pub status: u16,
    pub body: ResponseBody,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

impl fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

/// Synchronous request executor.
///
/// Returns once response headers are available; non-2xx statuses are
/// returned as responses, not errors. Connection-level failures are errors.
pub trait Transport: Send + Sync {
    fn execute(&self, url: &Url) -> Result<HttpResponse, StreamError>;
}

/// Shared tokio runtime for HTTP operations.
pub static SHARED_RUNTIME: LazyLock<tokio::runtime::Runtime> = LazyLock::new(|| {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("oaiharvest-http")
        .enable_all()
        .build()
        .expect("failed to build tokio runtime")
});

/// [`Transport`] backed by a pooled reqwest client.
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    read_timeout: Duration,
}

impl HttpTransport {
    pub fn new(config: &HttpConfig) -> Result<Self, StreamError> {
        let mut headers = HeaderMap::new();
        for (name, value) in &config.headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| StreamError::Http {
                status: None,
                message: format!("invalid header name {name:?}: {e}"),
            })?;
            let value = HeaderValue::from_str(value).map_err(|e| StreamError::Http {
                status: None,
                message: format!("invalid value for header {name}: {e}"),
            })?;
            headers.append(name, value);
        }

        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .pool_max_idle_per_host(8)
            .default_headers(headers)
            .build()
            .map_err(|e| StreamError::from_reqwest(&e))?;

        Ok(Self {
            client,
            read_timeout: config.read_timeout,
        })
    }
}

impl Transport for HttpTransport {
    fn execute(&self, url: &Url) -> Result<HttpResponse, StreamError> {
        let request = self.client.get(url.as_str());

        let (status, reader) = SHARED_RUNTIME.handle().block_on(async {
            let response = request
                .send()
                .await
                .map_err(|e| StreamError::from_reqwest(&e))?;
            let status = response.status().as_u16();

            // Convert response body stream to AsyncRead
            let stream = response.bytes_stream();
            let async_reader = tokio_util::io::StreamReader::new(
                stream.map(|result| result.map_err(io::Error::other)),
            );

            Ok::<_, StreamError>((
                status,
                TimeoutReader::new(Box::pin(async_reader), self.read_timeout),
            ))
        })?;

        log::debug!("GET {url} -> {status}");
        Ok(HttpResponse {
            status,
            body: Box::new(BufReader::with_capacity(BODY_BUF_SIZE, reader)),
        })
    }
}

/// Async-to-sync bridge with read timeout.
///
/// Each read operation has a timeout: if no data arrives within the
/// configured window, returns a TimedOut error.
pub struct TimeoutReader {
    inner: Pin<Box<dyn AsyncRead + Send + Sync>>,
    timeout: Duration,
}

impl TimeoutReader {
    fn new(inner: Pin<Box<dyn AsyncRead + Send + Sync>>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }
}

impl Read for TimeoutReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let timeout = self.timeout;
        SHARED_RUNTIME.handle().block_on(async {
            let read_future = async {
                let mut read_buf = ReadBuf::new(buf);
                std::future::poll_fn(|cx: &mut Context<'_>| {
                    Pin::as_mut(&mut self.inner).poll_read(cx, &mut read_buf)
                })
                .await?;
                Ok::<_, io::Error>(read_buf.filled().len())
            };

            match tokio::time::timeout(timeout, read_future).await {
                Ok(result) => result,
                Err(_) => Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("read timeout ({}s with no data)", timeout.as_secs()),
                )),
            }
        })
    }
}
