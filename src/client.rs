//! HTTP plumbing on top of the proxy pool.

use crate::config::ToolkitConfig;
use crate::cooperative::SessionProvider;
use crate::error::{ErrorKind, TaskError};
use crate::middleware::ProxyPoolMiddleware;
use crate::pool::ProxyPool;
use crate::proxy::{ProxyRecord, ProxyScheme};

use async_trait::async_trait;
use reqwest::{Body, Client, Method, Response};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use std::sync::Arc;
use std::time::Duration;

/// Build a client routed through `proxy`, or a plain one when `None`.
pub(crate) fn build_client(
    proxy: Option<&ProxyRecord>,
    scheme: ProxyScheme,
    timeout: Duration,
) -> Result<Client, reqwest::Error> {
    let mut builder = Client::builder().timeout(timeout);
    if let Some(proxy) = proxy {
        builder = builder.proxy(proxy.to_reqwest_proxy(scheme)?);
    }
    builder.build()
}

/// HTTP client that routes every request through the proxy pool.
///
/// Non-success statuses are returned as [`ErrorKind::HttpStatus`] errors.
#[derive(Clone)]
pub struct HttpClient {
    client: ClientWithMiddleware,
}

impl HttpClient {
    pub fn new(pool: Arc<ProxyPool>, timeout: Duration) -> Result<Self, TaskError> {
        let base = Client::builder().timeout(timeout).build()?;
        let client = ClientBuilder::new(base)
            .with(ProxyPoolMiddleware::new(pool, timeout))
            .build();
        Ok(Self { client })
    }

    pub fn from_config(pool: Arc<ProxyPool>, config: &ToolkitConfig) -> Result<Self, TaskError> {
        Self::new(pool, config.request_timeout)
    }

    pub async fn request(&self, method: Method, url: &str) -> Result<Response, TaskError> {
        self.send(method, url, None).await
    }

    pub async fn get(&self, url: &str) -> Result<Response, TaskError> {
        self.send(Method::GET, url, None).await
    }

    pub async fn post(&self, url: &str, body: impl Into<Body>) -> Result<Response, TaskError> {
        self.send(Method::POST, url, Some(body.into())).await
    }

    pub async fn put(&self, url: &str, body: impl Into<Body>) -> Result<Response, TaskError> {
        self.send(Method::PUT, url, Some(body.into())).await
    }

    async fn send(&self, method: Method, url: &str, body: Option<Body>) -> Result<Response, TaskError> {
        let mut request = self.client.request(method, url);
        if let Some(body) = body {
            request = request.body(body);
        }
        let response = request.send().await?;
        Ok(response.error_for_status()?)
    }
}

/// Gives each attempt of an async task its own `reqwest::Client` bound to the
/// attempt's proxy.
#[derive(Debug, Clone)]
pub struct HttpSessionProvider {
    scheme: ProxyScheme,
    timeout: Duration,
}

impl HttpSessionProvider {
    pub fn new(scheme: ProxyScheme, timeout: Duration) -> Self {
        Self { scheme, timeout }
    }

    pub fn from_config(config: &ToolkitConfig) -> Self {
        Self::new(config.pool.scheme, config.request_timeout)
    }
}

#[async_trait]
impl SessionProvider for HttpSessionProvider {
    type Session = Client;

    async fn open(&self, proxy: Option<&ProxyRecord>) -> Result<Client, TaskError> {
        build_client(proxy, self.scheme, self.timeout).map_err(|e| {
            TaskError::new(ErrorKind::Session, format!("failed to build client: {e}")).with_source(e)
        })
    }
}
