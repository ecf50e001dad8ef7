//! Core proxy pool implementation.

use crate::config::PoolConfig;
use crate::error::ProxyLoadError;
use crate::proxy::{ProxyHealth, ProxyRecord};
use crate::utils;

use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use log::{debug, info, warn};
use parking_lot::Mutex;
use rand::seq::IndexedRandom;
use std::num::NonZeroU32;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

type Limiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

/// An endpoint handed out by [`ProxyPool::acquire`].
///
/// Pass it back to `report_success`/`report_failure` once the work done
/// through it has finished.
#[derive(Debug, Clone)]
pub struct ProxyHandle {
    index: usize,
    record: ProxyRecord,
    limiter: Option<Arc<Limiter>>,
}

impl ProxyHandle {
    pub fn record(&self) -> &ProxyRecord {
        &self.record
    }

    /// Wait until the endpoint's rate limit allows another request.
    pub async fn until_ready(&self) {
        if let Some(limiter) = &self.limiter {
            limiter.until_ready().await;
        }
    }
}

/// A fixed set of proxies scored by observed reliability.
pub struct ProxyPool {
    /// Health of every endpoint; the only state shared between tasks.
    entries: Mutex<Vec<ProxyHealth>>,
    /// One limiter per entry when rate limiting is enabled.
    limiters: Option<Vec<Arc<Limiter>>>,
    /// Configuration for the pool.
    pub config: PoolConfig,
}

impl ProxyPool {
    /// Create a pool from `*.txt` proxy lists in `dir`.
    pub fn from_dir(dir: impl AsRef<Path>, config: PoolConfig) -> Result<Arc<Self>, ProxyLoadError> {
        let dir = dir.as_ref();
        let records = utils::load_proxies_from_dir(dir)?;
        info!("Loaded {} proxies from {}", records.len(), dir.display());
        Ok(Self::from_records(records, config))
    }

    /// Create a pool from already parsed records.
    pub fn from_records(records: Vec<ProxyRecord>, config: PoolConfig) -> Arc<Self> {
        let limiters = config.max_requests_per_second.map(|rps| {
            let per_second = NonZeroU32::new(rps.ceil() as u32).unwrap_or(NonZeroU32::MIN);
            records
                .iter()
                .map(|_| Arc::new(RateLimiter::direct(Quota::per_second(per_second))))
                .collect::<Vec<_>>()
        });

        Arc::new(Self {
            entries: Mutex::new(records.into_iter().map(ProxyHealth::new).collect()),
            limiters,
            config,
        })
    }

    /// Pick a random endpoint among the available ones.
    ///
    /// `None` means every endpoint is cooling down or disabled; the caller
    /// should go ahead without a proxy.
    pub fn acquire(&self) -> Option<ProxyHandle> {
        let (index, record) = {
            let entries = self.entries.lock();
            let now = Instant::now();
            let candidates: Vec<usize> = entries
                .iter()
                .enumerate()
                .filter(|(_, p)| p.available_at(now))
                .map(|(i, _)| i)
                .collect();

            let &index = candidates.choose(&mut rand::rng())?;
            (index, entries[index].record.clone())
        };

        debug!("Acquired proxy {}", record);
        Some(ProxyHandle {
            index,
            record,
            limiter: self.limiters.as_ref().map(|l| Arc::clone(&l[index])),
        })
    }

    /// Report a successful request through a proxy.
    pub fn report_success(&self, proxy: Option<&ProxyHandle>) {
        let Some(proxy) = proxy else { return };
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(proxy.index) {
            entry.record_success();
        }
    }

    /// Report a failed request through a proxy and put it on cooldown.
    pub fn report_failure(&self, proxy: Option<&ProxyHandle>) {
        let Some(proxy) = proxy else { return };
        let score = {
            let mut entries = self.entries.lock();
            let Some(entry) = entries.get_mut(proxy.index) else { return };
            entry.record_failure(Instant::now(), self.config.cooldown);
            entry.score
        };

        if score <= 0 {
            warn!("Proxy {} disabled: score dropped to {}", proxy.record, score);
        } else {
            debug!(
                "Proxy {} cooling down for {}s (score {})",
                proxy.record,
                self.config.cooldown.as_secs(),
                score
            );
        }
    }

    /// Current health of the endpoint behind `proxy`.
    pub fn health(&self, proxy: &ProxyHandle) -> Option<ProxyHealth> {
        self.entries.lock().get(proxy.index).cloned()
    }

    /// Copy of every endpoint's health.
    pub fn snapshot(&self) -> Vec<ProxyHealth> {
        self.entries.lock().clone()
    }

    /// Get statistics about the proxy pool: `(total, available)`.
    pub fn get_stats(&self) -> (usize, usize) {
        let entries = self.entries.lock();
        let now = Instant::now();
        let available = entries.iter().filter(|p| p.available_at(now)).count();
        (entries.len(), available)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
