//! Error types for the proxy-task-kit crate.

use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Category of a task failure, used by [`RetryPolicy`](crate::retry::RetryPolicy)
/// to decide whether an attempt is worth repeating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Transport-level failure (reset connection, broken body, ...).
    Network,
    /// The operation did not finish in time.
    Timeout,
    /// Could not connect to the proxy or the target.
    Connect,
    /// The server answered with a non-success status.
    HttpStatus,
    /// The scoped session for the attempt could not be opened.
    Session,
    /// The unit of work panicked.
    Panicked,
    /// Anything the unit raised that fits no other category.
    Other,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::Connect => "connect",
            Self::HttpStatus => "http status",
            Self::Session => "session",
            Self::Panicked => "panicked",
            Self::Other => "other",
        };
        f.write_str(name)
    }
}

/// Error raised by a unit of work.
#[derive(Debug, Error)]
#[error("{kind} error: {message}")]
pub struct TaskError {
    kind: ErrorKind,
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl TaskError {
    /// Create an error of the given kind.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    /// Shorthand for an [`ErrorKind::Other`] error.
    pub fn other(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Other, message)
    }

    /// Attach the underlying cause.
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unit of work panicked".to_string()
        };
        Self::new(ErrorKind::Panicked, message)
    }
}

impl From<reqwest::Error> for TaskError {
    fn from(err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            ErrorKind::Timeout
        } else if err.is_connect() {
            ErrorKind::Connect
        } else if err.is_status() {
            ErrorKind::HttpStatus
        } else {
            ErrorKind::Network
        };
        Self::new(kind, err.to_string()).with_source(err)
    }
}

impl From<reqwest_middleware::Error> for TaskError {
    fn from(err: reqwest_middleware::Error) -> Self {
        match err {
            reqwest_middleware::Error::Reqwest(e) => e.into(),
            reqwest_middleware::Error::Middleware(e) => {
                // Our own middleware wraps TaskError in anyhow; keep its kind.
                match e.downcast::<TaskError>() {
                    Ok(task_err) => task_err,
                    Err(e) => Self::other(e.to_string()),
                }
            }
        }
    }
}

/// Error returned when the proxy source directory cannot be read.
#[derive(Debug, Error)]
#[error("failed to load proxies from {path}: {source}")]
pub struct ProxyLoadError {
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}

/// Errors that abort a whole run rather than a single task.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// The worker threads or the session substrate failed to start.
    #[error("execution substrate failed to initialize: {0}")]
    SubstrateInit(String),

    /// Some submitted units never produced an outcome.
    #[error("collected {collected} outcomes for {expected} tasks")]
    Incomplete { expected: usize, collected: usize },
}
