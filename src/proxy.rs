//! Proxy representation and health state.

use std::fmt;
use std::time::{Duration, Instant};

use url::Url;

/// Highest score an endpoint can reach.
pub const MAX_SCORE: i64 = 100;

/// Protocol used when rendering a proxy as a URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProxyScheme {
    #[default]
    Http,
    Socks5,
}

impl ProxyScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Socks5 => "socks5",
        }
    }
}

/// Proxy settings in the shape browser automation drivers expect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowserProxy {
    /// `scheme://address:port`, without credentials.
    pub server: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// An endpoint loaded from the proxy source. Never changes after loading.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProxyRecord {
    pub address: String,
    pub port: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl ProxyRecord {
    /// Create a record. Empty credential strings are treated as absent.
    pub fn new(
        address: impl Into<String>,
        port: impl Into<String>,
        username: Option<String>,
        password: Option<String>,
    ) -> Self {
        Self {
            address: address.into(),
            port: port.into(),
            username: username.filter(|u| !u.is_empty()),
            password: password.filter(|p| !p.is_empty()),
        }
    }

    fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => Some((u, p)),
            _ => None,
        }
    }

    /// Render as a proxy URL, embedding credentials when both are present.
    pub fn proxy_url(&self, scheme: ProxyScheme) -> Result<Url, url::ParseError> {
        let mut url = Url::parse(&format!(
            "{}://{}:{}",
            scheme.as_str(),
            self.address,
            self.port
        ))?;
        if let Some((user, pass)) = self.credentials() {
            // set_username only fails for cannot-be-a-base URLs, which these are not
            let _ = url.set_username(user);
            let _ = url.set_password(Some(pass));
        }
        Ok(url)
    }

    /// Convert to a reqwest proxy routing all traffic through this endpoint.
    pub fn to_reqwest_proxy(&self, scheme: ProxyScheme) -> Result<reqwest::Proxy, reqwest::Error> {
        let server = format!("{}://{}:{}", scheme.as_str(), self.address, self.port);
        let proxy = reqwest::Proxy::all(server)?;
        Ok(match self.credentials() {
            Some((user, pass)) => proxy.basic_auth(user, pass),
            None => proxy,
        })
    }

    pub fn browser_proxy(&self, scheme: ProxyScheme) -> BrowserProxy {
        BrowserProxy {
            server: format!("{}://{}:{}", scheme.as_str(), self.address, self.port),
            username: self.username.clone(),
            password: self.password.clone(),
        }
    }
}

impl fmt::Display for ProxyRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// Health of a single endpoint as tracked by the pool.
#[derive(Debug, Clone)]
pub struct ProxyHealth {
    pub record: ProxyRecord,
    /// Starts at [`MAX_SCORE`]; may go negative.
    pub score: i64,
    pub success_count: u64,
    pub failure_count: u64,
    /// `None` means the endpoint has never been put on cooldown.
    pub cooldown_until: Option<Instant>,
}

impl ProxyHealth {
    pub fn new(record: ProxyRecord) -> Self {
        Self {
            record,
            score: MAX_SCORE,
            success_count: 0,
            failure_count: 0,
            cooldown_until: None,
        }
    }

    /// Whether the endpoint may be handed out at `now`.
    pub fn available_at(&self, now: Instant) -> bool {
        self.score > 0 && self.cooldown_until.is_none_or(|until| now >= until)
    }

    pub fn is_available(&self) -> bool {
        self.available_at(Instant::now())
    }

    pub(crate) fn record_success(&mut self) {
        self.success_count += 1;
        self.score = (self.score + 1).min(MAX_SCORE);
    }

    pub(crate) fn record_failure(&mut self, now: Instant, cooldown: Duration) {
        self.failure_count += 1;
        self.score -= 10;
        self.cooldown_until = Some(deadline(now, cooldown));
    }

    /// Ratio of successful requests, 0.0 when the endpoint has not been used.
    pub fn success_rate(&self) -> f64 {
        let total = self.success_count + self.failure_count;
        if total == 0 {
            return 0.0;
        }
        self.success_count as f64 / total as f64
    }
}

/// `now + cooldown`, clamped to the latest instant the platform can represent.
fn deadline(now: Instant, cooldown: Duration) -> Instant {
    let mut span = cooldown;
    loop {
        if let Some(until) = now.checked_add(span) {
            return until;
        }
        span /= 2;
    }
}
