//! Middleware implementation for reqwest.

use crate::client::build_client;
use crate::pool::ProxyPool;

use async_trait::async_trait;
use log::{debug, warn};
use reqwest_middleware::{Error, Middleware, Next, Result};
use std::sync::Arc;
use std::time::Duration;

/// Middleware that sends each request through a proxy from the pool and
/// feeds the outcome back into the proxy's score.
///
/// When the pool has nothing available the request goes out directly.
#[derive(Clone)]
pub struct ProxyPoolMiddleware {
    /// The proxy pool.
    pool: Arc<ProxyPool>,
    /// Timeout for the per-proxy client.
    timeout: Duration,
}

impl ProxyPoolMiddleware {
    pub fn new(pool: Arc<ProxyPool>, timeout: Duration) -> Self {
        Self { pool, timeout }
    }
}

#[async_trait]
impl Middleware for ProxyPoolMiddleware {
    async fn handle(
        &self,
        req: reqwest::Request,
        extensions: &mut http::Extensions,
        next: Next<'_>,
    ) -> Result<reqwest::Response> {
        let Some(proxy) = self.pool.acquire() else {
            let (total, available) = self.pool.get_stats();
            debug!(
                "No proxy available ({}/{}), sending {} directly",
                available,
                total,
                req.url()
            );
            return next.run(req, extensions).await;
        };

        // Apply rate limiting
        proxy.until_ready().await;

        let client = match build_client(Some(proxy.record()), self.pool.config.scheme, self.timeout) {
            Ok(client) => client,
            Err(e) => {
                warn!("Failed to build client with proxy {}: {}", proxy.record(), e);
                self.pool.report_failure(Some(&proxy));
                return Err(Error::Reqwest(e));
            }
        };

        let url = req.url().clone();
        match client.execute(req).await.and_then(|resp| resp.error_for_status()) {
            Ok(response) => {
                self.pool.report_success(Some(&proxy));
                Ok(response)
            }
            Err(err) => {
                warn!("Request to {} through proxy {} failed: {}", url, proxy.record(), err);
                self.pool.report_failure(Some(&proxy));
                Err(Error::Reqwest(err))
            }
        }
    }
}
