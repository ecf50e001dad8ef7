//! Bounded task runner for async units sharing one task.
//!
//! Units are driven together on the caller's task. A semaphore bounds how many
//! are past their start point at once; a unit waits for a permit, then
//! acquires a proxy, opens a session scoped to that proxy, runs, reports the
//! outcome to the pool and closes the session before giving the permit back.

use crate::error::{RunnerError, TaskError};
use crate::pool::{ProxyHandle, ProxyPool};
use crate::proxy::ProxyRecord;
use crate::retry::RetryPolicy;
use crate::task::{TaskContext, TaskOutcome};
use crate::trace::{current_trace_id, new_trace_id, scope_trace_id};

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use log::{error, info, warn};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Creates the per-attempt resource a unit of work runs against, such as a
/// browser context or an HTTP client bound to one proxy.
#[async_trait]
pub trait SessionProvider: Send + Sync + 'static {
    type Session: Send + Sync + 'static;

    /// Bring up whatever the sessions share (a browser process, ...).
    /// Called once at the start of every run.
    async fn start(&self) -> Result<(), TaskError> {
        Ok(())
    }

    /// Open a session routed through `proxy`, or directly when `None`.
    async fn open(&self, proxy: Option<&ProxyRecord>) -> Result<Self::Session, TaskError>;

    /// Release `session` once its attempt has finished.
    async fn close(&self, _session: &Self::Session) {}

    /// Tear down what `start` brought up. Called once per run, whatever the outcome.
    async fn shutdown(&self) {}
}

/// Provider for units that need nothing but their [`TaskContext`].
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSession;

#[async_trait]
impl SessionProvider for NoSession {
    type Session = ();

    async fn open(&self, _proxy: Option<&ProxyRecord>) -> Result<(), TaskError> {
        Ok(())
    }
}

struct Shared<P: SessionProvider> {
    provider: Arc<P>,
    limiter: Semaphore,
    pool: Option<Arc<ProxyPool>>,
    retry: Option<RetryPolicy>,
}

type AsyncJob<P, T> = Box<dyn FnOnce(Arc<Shared<P>>) -> BoxFuture<'static, TaskOutcome<T>> + Send>;

/// Runs submitted async units with at most `max_concurrency` in flight.
pub struct AsyncProcessor<P: SessionProvider, T> {
    max_concurrency: usize,
    provider: Arc<P>,
    pool: Option<Arc<ProxyPool>>,
    retry: Option<RetryPolicy>,
    jobs: Vec<AsyncJob<P, T>>,
}

impl<P: SessionProvider, T: Send + 'static> AsyncProcessor<P, T> {
    pub fn new(max_concurrency: usize, provider: P) -> Self {
        Self {
            max_concurrency: max_concurrency.max(1),
            provider: Arc::new(provider),
            pool: None,
            retry: None,
            jobs: Vec::new(),
        }
    }

    /// Route every attempt through a proxy from `pool`.
    pub fn with_proxy_pool(mut self, pool: Arc<ProxyPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Retry failed attempts according to `policy`.
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    /// Queue a unit of work and return its trace id. Nothing runs until [`run`](Self::run).
    pub fn submit<F, Fut>(&mut self, name: impl Into<String>, unit: F) -> String
    where
        F: Fn(TaskContext, Arc<P::Session>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, TaskError>> + Send + 'static,
    {
        let name = name.into();
        let trace_id = new_trace_id();

        let unit = Arc::new(unit);
        let id = trace_id.clone();
        self.jobs.push(Box::new(move |shared: Arc<Shared<P>>| {
            async move {
                let work = scope_trace_id(id.clone(), execute(&name, unit, shared));
                let result = AssertUnwindSafe(work)
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|payload| Err(TaskError::from_panic(payload)));
                TaskOutcome {
                    name,
                    trace_id: id,
                    result,
                }
            }
            .boxed()
        }));
        trace_id
    }

    /// Number of units waiting to run.
    pub fn pending(&self) -> usize {
        self.jobs.len()
    }

    /// Run every submitted unit and return the outcomes in completion order.
    ///
    /// Fails only when the provider cannot start; task errors are reported in
    /// the individual outcomes.
    pub async fn run(self) -> Result<Vec<TaskOutcome<T>>, RunnerError> {
        let guard = ShutdownGuard {
            provider: Some(Arc::clone(&self.provider)),
        };
        if let Err(e) = self.provider.start().await {
            error!("Session provider failed to start: {}", e);
            guard.shutdown().await;
            return Err(RunnerError::SubstrateInit(e.to_string()));
        }

        let total = self.jobs.len();
        info!(
            "Running {} tasks with at most {} in flight",
            total, self.max_concurrency
        );

        let shared = Arc::new(Shared {
            provider: Arc::clone(&self.provider),
            limiter: Semaphore::new(self.max_concurrency),
            pool: self.pool,
            retry: self.retry,
        });
        let mut in_flight: FuturesUnordered<_> = self
            .jobs
            .into_iter()
            .map(|job| job(Arc::clone(&shared)))
            .collect();

        let mut results = Vec::with_capacity(total);
        while let Some(outcome) = in_flight.next().await {
            results.push(outcome);
        }
        guard.shutdown().await;

        let failed = results.iter().filter(|r| !r.is_ok()).count();
        info!(
            "Finished {} tasks: {} succeeded, {} failed",
            results.len(),
            results.len() - failed,
            failed
        );
        Ok(results)
    }
}

/// Makes sure `shutdown` runs even when `run` is dropped before finishing.
struct ShutdownGuard<P: SessionProvider> {
    provider: Option<Arc<P>>,
}

impl<P: SessionProvider> ShutdownGuard<P> {
    async fn shutdown(mut self) {
        if let Some(provider) = self.provider.take() {
            provider.shutdown().await;
        }
    }
}

impl<P: SessionProvider> Drop for ShutdownGuard<P> {
    fn drop(&mut self) {
        let Some(provider) = self.provider.take() else { return };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { provider.shutdown().await });
            }
            Err(_) => warn!("Run dropped outside a runtime; session provider not shut down"),
        }
    }
}

async fn execute<P, T, F, Fut>(
    name: &str,
    unit: Arc<F>,
    shared: Arc<Shared<P>>,
) -> Result<T, TaskError>
where
    P: SessionProvider,
    F: Fn(TaskContext, Arc<P::Session>) -> Fut,
    Fut: Future<Output = Result<T, TaskError>>,
{
    let _permit = shared
        .limiter
        .acquire()
        .await
        .map_err(|_| TaskError::other("concurrency limiter closed"))?;
    info!("Task started: {}", name);

    let mut attempt = 0;
    let mut run_attempt = || {
        let current = attempt;
        attempt += 1;
        run_once(Arc::clone(&shared), Arc::clone(&unit), current)
    };
    let result = match &shared.retry {
        Some(policy) => policy.call_async(name, run_attempt).await,
        None => run_attempt().await,
    };

    match &result {
        Ok(_) => info!("Task completed: {}", name),
        Err(e) => error!("Task failed: {}: {}", name, e),
    }
    result
}

async fn run_once<P, T, F, Fut>(
    shared: Arc<Shared<P>>,
    unit: Arc<F>,
    attempt: u32,
) -> Result<T, TaskError>
where
    P: SessionProvider,
    F: Fn(TaskContext, Arc<P::Session>) -> Fut,
    Fut: Future<Output = Result<T, TaskError>>,
{
    let pool = shared.pool.as_deref();
    let proxy = pool.and_then(ProxyPool::acquire);
    if let Some(proxy) = &proxy {
        proxy.until_ready().await;
    }

    let session = match shared
        .provider
        .open(proxy.as_ref().map(ProxyHandle::record))
        .await
    {
        Ok(session) => Arc::new(session),
        Err(e) => {
            if let Some(pool) = pool {
                pool.report_failure(proxy.as_ref());
            }
            return Err(e);
        }
    };

    let ctx = TaskContext {
        trace_id: current_trace_id(),
        proxy: proxy.clone(),
        attempt,
    };
    let attempt_session = Arc::clone(&session);
    let result = AssertUnwindSafe(async move { (*unit)(ctx, attempt_session).await })
        .catch_unwind()
        .await
        .unwrap_or_else(|payload| Err(TaskError::from_panic(payload)));

    if let Some(pool) = pool {
        match &result {
            Ok(_) => pool.report_success(proxy.as_ref()),
            Err(_) => pool.report_failure(proxy.as_ref()),
        }
    }
    shared.provider.close(&session).await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::error::ErrorKind;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    #[derive(Default)]
    struct Counters {
        starts: AtomicUsize,
        opens: AtomicUsize,
        closes: AtomicUsize,
        shutdowns: AtomicUsize,
    }

    struct CountingProvider {
        counters: Arc<Counters>,
        fail_start: bool,
    }

    impl CountingProvider {
        fn new(fail_start: bool) -> (Self, Arc<Counters>) {
            let counters = Arc::new(Counters::default());
            let provider = Self {
                counters: Arc::clone(&counters),
                fail_start,
            };
            (provider, counters)
        }
    }

    #[async_trait]
    impl SessionProvider for CountingProvider {
        type Session = Option<String>;

        async fn start(&self) -> Result<(), TaskError> {
            self.counters.starts.fetch_add(1, Ordering::SeqCst);
            if self.fail_start {
                return Err(TaskError::new(ErrorKind::Session, "browser missing"));
            }
            Ok(())
        }

        async fn open(&self, proxy: Option<&ProxyRecord>) -> Result<Self::Session, TaskError> {
            self.counters.opens.fetch_add(1, Ordering::SeqCst);
            Ok(proxy.map(|p| p.to_string()))
        }

        async fn close(&self, _session: &Self::Session) {
            self.counters.closes.fetch_add(1, Ordering::SeqCst);
        }

        async fn shutdown(&self) {
            self.counters.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn never_exceeds_concurrency_limit() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut runner = AsyncProcessor::new(2, NoSession);

        for i in 0..5 {
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            runner.submit(format!("sleep-{i}"), move |_, _| {
                let active = Arc::clone(&active);
                let peak = Arc::clone(&peak);
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(i)
                }
            });
        }

        let results = runner.run().await.unwrap();
        let values: HashSet<i32> = results.into_iter().map(|r| r.result.unwrap()).collect();
        assert_eq!(values, (0..5).collect());
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn results_arrive_in_completion_order() {
        let mut runner = AsyncProcessor::new(2, NoSession);
        runner.submit("slow", |_, _| async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok("slow")
        });
        runner.submit("fast", |_, _| async { Ok("fast") });

        let results = runner.run().await.unwrap();
        let order: Vec<&str> = results.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(order, vec!["fast", "slow"]);
    }

    #[tokio::test]
    async fn every_session_is_closed_once() {
        let (provider, counters) = CountingProvider::new(false);
        let mut runner = AsyncProcessor::new(2, provider);
        runner.submit("ok", |_, _| async { Ok(1) });
        runner.submit("err", |_, _| async { Err(TaskError::other("bad page")) });
        runner.submit("panic", |_, _| async {
            if true {
                panic!("page crashed");
            }
            Ok(3)
        });

        let results = runner.run().await.unwrap();
        assert_eq!(results.len(), 3);
        let panicked = results.iter().find(|r| r.name == "panic").unwrap();
        assert_eq!(
            panicked.result.as_ref().unwrap_err().kind(),
            ErrorKind::Panicked
        );

        assert_eq!(counters.starts.load(Ordering::SeqCst), 1);
        assert_eq!(counters.opens.load(Ordering::SeqCst), 3);
        assert_eq!(counters.closes.load(Ordering::SeqCst), 3);
        assert_eq!(counters.shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn start_failure_aborts_the_run() {
        let (provider, counters) = CountingProvider::new(true);
        let mut runner = AsyncProcessor::new(2, provider);
        runner.submit("never", |_, _| async { Ok(()) });

        let err = runner.run().await.unwrap_err();
        assert!(matches!(err, RunnerError::SubstrateInit(_)));
        assert_eq!(counters.opens.load(Ordering::SeqCst), 0);
        assert_eq!(counters.shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dropped_run_still_shuts_down() {
        let (provider, counters) = CountingProvider::new(false);
        let mut runner = AsyncProcessor::new(1, provider);
        runner.submit("stuck", |_, _| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        });

        let timed_out = tokio::time::timeout(Duration::from_millis(20), runner.run()).await;
        assert!(timed_out.is_err());
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(counters.shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unit_sees_its_trace_id_and_proxy() {
        let pool = ProxyPool::from_records(
            vec![ProxyRecord::new("10.2.2.2", "1080", None, None)],
            PoolConfig::default(),
        );
        let (provider, _) = CountingProvider::new(false);
        let mut runner = AsyncProcessor::new(2, provider).with_proxy_pool(Arc::clone(&pool));
        runner.submit("trace", |ctx, session| async move {
            assert_eq!(session.as_deref(), Some("10.2.2.2:1080"));
            assert_eq!(ctx.trace_id, current_trace_id());
            Ok(current_trace_id())
        });

        let outcome = runner.run().await.unwrap().pop().unwrap();
        assert_eq!(outcome.result.unwrap(), outcome.trace_id);
        let health = &pool.snapshot()[0];
        assert_eq!((health.success_count, health.score), (1, 100));
    }

    #[tokio::test]
    async fn failure_is_reported_then_returned() {
        let pool = ProxyPool::from_records(
            vec![ProxyRecord::new("10.2.2.2", "1080", None, None)],
            PoolConfig::default(),
        );
        let mut runner = AsyncProcessor::new(1, NoSession).with_proxy_pool(Arc::clone(&pool));
        runner.submit("refused", |_, _| async {
            Err::<(), _>(TaskError::new(ErrorKind::Connect, "refused"))
        });

        let outcome = runner.run().await.unwrap().pop().unwrap();
        assert_eq!(outcome.result.unwrap_err().kind(), ErrorKind::Connect);
        let health = &pool.snapshot()[0];
        assert_eq!(health.failure_count, 1);
        assert_eq!(health.score, 90);
        assert!(health.cooldown_until.is_some());
    }

    #[tokio::test]
    async fn panicking_retry_observer_fails_only_its_task() {
        let (provider, counters) = CountingProvider::new(false);
        let policy = RetryPolicy::new(1)
            .base_delay(Duration::ZERO)
            .on_retry(|_, _| panic!("observer blew up"));
        let mut runner = AsyncProcessor::new(1, provider).with_retry(policy);
        runner.submit("flaky", |_, _| async { Err::<i32, _>(TaskError::other("first try")) });
        runner.submit("fine", |_, _| async { Ok(2) });

        let results = runner.run().await.unwrap();
        assert_eq!(results.len(), 2);
        for outcome in results {
            match outcome.name.as_str() {
                "flaky" => {
                    assert_eq!(outcome.result.unwrap_err().kind(), ErrorKind::Panicked)
                }
                "fine" => assert_eq!(outcome.result.unwrap(), 2),
                other => panic!("unexpected task {other}"),
            }
        }
        assert_eq!(counters.opens.load(Ordering::SeqCst), 2);
        assert_eq!(counters.closes.load(Ordering::SeqCst), 2);
        assert_eq!(counters.shutdowns.load(Ordering::SeqCst), 1);
    }

    struct Tab {
        url: String,
    }

    struct TabProvider;

    #[async_trait]
    impl SessionProvider for TabProvider {
        type Session = Tab;

        async fn open(&self, _proxy: Option<&ProxyRecord>) -> Result<Tab, TaskError> {
            Ok(Tab {
                url: "about:blank".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn sessions_need_not_be_clone() {
        let mut runner = AsyncProcessor::new(1, TabProvider);
        runner.submit("tab", |_, tab: Arc<Tab>| async move { Ok(tab.url.clone()) });

        let outcome = runner.run().await.unwrap().pop().unwrap();
        assert_eq!(outcome.result.unwrap(), "about:blank");
    }

    #[tokio::test]
    async fn rate_limited_proxy_spaces_out_attempts() {
        let pool = ProxyPool::from_records(
            vec![ProxyRecord::new("10.2.2.2", "1080", None, None)],
            PoolConfig {
                max_requests_per_second: Some(1.0),
                ..PoolConfig::default()
            },
        );
        let mut runner = AsyncProcessor::new(2, NoSession).with_proxy_pool(Arc::clone(&pool));
        for i in 0..2 {
            runner.submit(format!("hit-{i}"), |_, _| async { Ok(Instant::now()) });
        }

        let mut starts: Vec<Instant> = runner
            .run()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.result.unwrap())
            .collect();
        starts.sort();
        assert!(starts[1] - starts[0] >= Duration::from_millis(800));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_open_a_new_session_each_attempt() {
        let (provider, counters) = CountingProvider::new(false);
        let policy = RetryPolicy::new(3).base_delay(Duration::from_secs(1));
        let mut runner = AsyncProcessor::new(1, provider).with_retry(policy);
        runner.submit("flaky", |ctx, _| async move {
            if ctx.attempt < 2 {
                Err(TaskError::new(ErrorKind::Timeout, "slow"))
            } else {
                Ok(ctx.attempt)
            }
        });

        let start = tokio::time::Instant::now();
        let outcome = runner.run().await.unwrap().pop().unwrap();
        assert_eq!(outcome.result.unwrap(), 2);
        assert!(start.elapsed() >= Duration::from_secs(3));
        assert_eq!(counters.opens.load(Ordering::SeqCst), 3);
        assert_eq!(counters.closes.load(Ordering::SeqCst), 3);
    }
}
