//! Configuration for the proxy pool, retry policy and task runners.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ErrorKind;
use crate::proxy::ProxyScheme;
use crate::retry::{RetryOn, RetryPolicy};

/// Configuration for the proxy pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// How long a failed endpoint is excluded from selection.
    pub cooldown: Duration,
    /// Protocol used when routing requests through an endpoint.
    pub scheme: ProxyScheme,
    /// Maximum requests per second per endpoint, unlimited when `None`.
    pub max_requests_per_second: Option<f64>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(60),
            scheme: ProxyScheme::Http,
            max_requests_per_second: None,
        }
    }
}

/// Configuration for the whole toolkit.
#[derive(Debug, Clone)]
pub struct ToolkitConfig {
    /// Directory holding the `*.txt` proxy lists.
    pub proxy_dir: PathBuf,
    /// Number of units allowed in flight at once.
    pub max_concurrency: usize,
    /// Extra attempts after the first failure.
    pub retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Multiplier applied to the delay for each further retry.
    pub backoff: f64,
    /// Upper bound on a single retry delay.
    pub max_delay: Option<Duration>,
    /// Error kinds worth retrying.
    pub retryable_errors: RetryOn,
    /// Timeout for a single HTTP request.
    pub request_timeout: Duration,
    pub pool: PoolConfig,
}

impl ToolkitConfig {
    /// Create a new configuration builder.
    pub fn builder() -> ToolkitConfigBuilder {
        ToolkitConfigBuilder::new()
    }

    /// The retry policy these settings describe.
    pub fn retry_policy(&self) -> RetryPolicy {
        let mut policy = RetryPolicy::new(self.retries)
            .base_delay(self.base_delay)
            .backoff_factor(self.backoff)
            .retry_on(self.retryable_errors.clone());
        if let Some(max) = self.max_delay {
            policy = policy.max_delay(max);
        }
        policy
    }

    pub fn pool_config(&self) -> PoolConfig {
        self.pool.clone()
    }
}

impl Default for ToolkitConfig {
    fn default() -> Self {
        ToolkitConfigBuilder::new().build()
    }
}

/// Builder for `ToolkitConfig`.
pub struct ToolkitConfigBuilder {
    proxy_dir: Option<PathBuf>,
    max_concurrency: Option<usize>,
    cooldown: Option<Duration>,
    retries: Option<u32>,
    base_delay: Option<Duration>,
    backoff: Option<f64>,
    max_delay: Option<Duration>,
    retryable_errors: Option<RetryOn>,
    request_timeout: Option<Duration>,
    proxy_scheme: Option<ProxyScheme>,
    max_requests_per_second: Option<f64>,
}

impl ToolkitConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self {
            proxy_dir: None,
            max_concurrency: None,
            cooldown: None,
            retries: None,
            base_delay: None,
            backoff: None,
            max_delay: None,
            retryable_errors: None,
            request_timeout: None,
            proxy_scheme: None,
            max_requests_per_second: None,
        }
    }

    /// Set the directory the proxy lists are loaded from.
    pub fn proxy_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.proxy_dir = Some(dir.into());
        self
    }

    /// Set the number of units allowed in flight at once.
    pub fn max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = Some(n);
        self
    }

    /// Set how long a failed proxy sits out.
    pub fn cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = Some(cooldown);
        self
    }

    /// Set the number of retries after the first failed attempt.
    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    /// Set the delay before the first retry.
    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = Some(delay);
        self
    }

    /// Set the backoff multiplier. Values below 1 are raised to 1.
    pub fn backoff(mut self, factor: f64) -> Self {
        self.backoff = Some(factor);
        self
    }

    /// Cap every retry delay at `delay`.
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = Some(delay);
        self
    }

    /// Only retry errors of these kinds.
    pub fn retryable_errors(mut self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        self.retryable_errors = Some(RetryOn::kinds(kinds));
        self
    }

    /// Set the timeout for a single HTTP request.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Set the protocol used to talk to the proxies.
    pub fn proxy_scheme(mut self, scheme: ProxyScheme) -> Self {
        self.proxy_scheme = Some(scheme);
        self
    }

    /// Set the maximum requests per second per proxy.
    pub fn max_requests_per_second(mut self, rps: f64) -> Self {
        self.max_requests_per_second = Some(rps);
        self
    }

    /// Build the configuration.
    pub fn build(self) -> ToolkitConfig {
        ToolkitConfig {
            proxy_dir: self.proxy_dir.unwrap_or_else(|| PathBuf::from("proxies")),
            max_concurrency: self.max_concurrency.unwrap_or(5).max(1),
            retries: self.retries.unwrap_or(3),
            base_delay: self.base_delay.unwrap_or(Duration::from_secs(1)),
            backoff: self.backoff.unwrap_or(2.0).max(1.0),
            max_delay: self.max_delay,
            retryable_errors: self.retryable_errors.unwrap_or_default(),
            request_timeout: self.request_timeout.unwrap_or(Duration::from_secs(10)),
            pool: PoolConfig {
                cooldown: self.cooldown.unwrap_or(Duration::from_secs(60)),
                scheme: self.proxy_scheme.unwrap_or_default(),
                max_requests_per_second: self.max_requests_per_second,
            },
        }
    }
}

impl Default for ToolkitConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
