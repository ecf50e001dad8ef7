//! Retry with exponential backoff.
//!
//! `max_retries` counts the extra attempts made after the first one fails, so a
//! policy with `max_retries = 3` runs a unit of work at most four times. The
//! delay before retry `n` (starting at 1) is
//! `base_delay * backoff_factor^(n - 1)`, capped at `max_delay` when set.

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use log::info;

use crate::error::{ErrorKind, TaskError};

/// Which error kinds a policy retries.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RetryOn {
    /// Retry every error.
    #[default]
    All,
    /// Retry only errors whose kind is in the set.
    Kinds(HashSet<ErrorKind>),
}

impl RetryOn {
    pub fn kinds(kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        Self::Kinds(kinds.into_iter().collect())
    }

    pub fn matches(&self, kind: ErrorKind) -> bool {
        match self {
            Self::All => true,
            Self::Kinds(kinds) => kinds.contains(&kind),
        }
    }
}

type RetryObserver = Arc<dyn Fn(&TaskError, u32) + Send + Sync>;

/// Stateless retry decision logic shared by the blocking and async runners.
#[derive(Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    base_delay: Duration,
    backoff_factor: f64,
    max_delay: Option<Duration>,
    retry_on: RetryOn,
    on_retry: Option<RetryObserver>,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .field("base_delay", &self.base_delay)
            .field("backoff_factor", &self.backoff_factor)
            .field("max_delay", &self.max_delay)
            .field("retry_on", &self.retry_on)
            .field("on_retry", &self.on_retry.is_some())
            .finish()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}

impl RetryPolicy {
    /// A policy with `max_retries` retries, 1s base delay and a backoff factor of 2.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
            max_delay: None,
            retry_on: RetryOn::All,
            on_retry: None,
        }
    }

    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Set the backoff multiplier. Values below 1 are raised to 1.
    pub fn backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = if factor.is_finite() { factor.max(1.0) } else { 1.0 };
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = Some(delay);
        self
    }

    pub fn retry_on(mut self, retry_on: RetryOn) -> Self {
        self.retry_on = retry_on;
        self
    }

    /// Register a callback invoked with the last error and the retry number
    /// (starting at 1) before each retry.
    pub fn on_retry(mut self, observer: impl Fn(&TaskError, u32) + Send + Sync + 'static) -> Self {
        self.on_retry = Some(Arc::new(observer));
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn is_retryable(&self, kind: ErrorKind) -> bool {
        self.retry_on.matches(kind)
    }

    /// Delay before retry number `attempt`, starting at 1.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = if attempt <= 1 || self.base_delay.is_zero() {
            self.base_delay
        } else {
            let exp = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
            let secs = self.base_delay.as_secs_f64() * self.backoff_factor.powi(exp);
            Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
        };
        match self.max_delay {
            Some(max) => delay.min(max),
            None => delay,
        }
    }

    fn should_retry(&self, err: &TaskError) -> bool {
        self.max_retries > 0 && self.is_retryable(err.kind())
    }

    fn prepare_retry(&self, name: &str, err: &TaskError, attempt: u32) -> Duration {
        if let Some(observer) = &self.on_retry {
            observer(err, attempt);
        }
        let delay = self.delay_for(attempt);
        info!(
            "Retrying {} ({}/{}) in {:.2}s after error: {}",
            name,
            attempt,
            self.max_retries,
            delay.as_secs_f64(),
            err
        );
        delay
    }

    /// Run `op`, retrying on the calling thread.
    pub fn call<T, F>(&self, name: &str, mut op: F) -> Result<T, TaskError>
    where
        F: FnMut() -> Result<T, TaskError>,
    {
        let mut last_err = match op() {
            Ok(value) => return Ok(value),
            Err(err) if self.should_retry(&err) => err,
            Err(err) => return Err(err),
        };

        for attempt in 1..=self.max_retries {
            std::thread::sleep(self.prepare_retry(name, &last_err, attempt));
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if self.is_retryable(err.kind()) => last_err = err,
                Err(err) => return Err(err),
            }
        }
        Err(last_err)
    }

    /// Async counterpart of [`call`](Self::call); waits with `tokio::time::sleep`.
    pub async fn call_async<T, F, Fut>(&self, name: &str, mut op: F) -> Result<T, TaskError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TaskError>>,
    {
        let mut last_err = match op().await {
            Ok(value) => return Ok(value),
            Err(err) if self.should_retry(&err) => err,
            Err(err) => return Err(err),
        };

        for attempt in 1..=self.max_retries {
            tokio::time::sleep(self.prepare_retry(name, &last_err, attempt)).await;
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if self.is_retryable(err.kind()) => last_err = err,
                Err(err) => return Err(err),
            }
        }
        Err(last_err)
    }

    /// Wrap `op` so every call goes through this policy.
    pub fn wrap<A, T, F>(&self, name: impl Into<String>, op: F) -> impl Fn(A) -> Result<T, TaskError>
    where
        A: Clone,
        F: Fn(A) -> Result<T, TaskError>,
    {
        let policy = self.clone();
        let name = name.into();
        move |arg: A| policy.call(&name, || op(arg.clone()))
    }
}
