mod common;

use proxy_task_kit::{
    AsyncProcessor, HttpSessionProvider, ParallelProcessor, PoolConfig, ProxyPool, ProxyRecord,
    ProxyScheme, RetryPolicy, TaskError,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

fn record(addr: SocketAddr) -> ProxyRecord {
    ProxyRecord::new(addr.ip().to_string(), addr.port().to_string(), None, None)
}

#[tokio::test]
async fn async_run_routes_around_a_dead_proxy() {
    let (good, seen) = common::fake_proxy("200 OK").await;
    let bad = common::closed_port().await;
    let pool = ProxyPool::from_records(vec![record(good), record(bad)], PoolConfig::default());

    let provider = HttpSessionProvider::new(ProxyScheme::Http, Duration::from_secs(5));
    let mut runner = AsyncProcessor::new(2, provider)
        .with_proxy_pool(Arc::clone(&pool))
        .with_retry(RetryPolicy::new(3).base_delay(Duration::from_millis(10)));

    for i in 0..4 {
        runner.submit(format!("page-{i}"), move |ctx, client: Arc<reqwest::Client>| async move {
            assert!(ctx.proxy.is_some());
            let response = client
                .get(format!("http://example.test/page/{i}"))
                .send()
                .await?
                .error_for_status()?;
            Ok::<_, TaskError>(response.text().await?)
        });
    }

    let results = runner.run().await.unwrap();
    assert_eq!(results.len(), 4);
    for outcome in &results {
        assert_eq!(outcome.result.as_ref().unwrap(), "proxied");
    }
    assert_eq!(seen.lock().len(), 4);

    let snapshot = pool.snapshot();
    let good_health = snapshot.iter().find(|h| h.record == record(good)).unwrap();
    let bad_health = snapshot.iter().find(|h| h.record == record(bad)).unwrap();
    assert_eq!(good_health.success_count, 4);
    assert_eq!(good_health.failure_count, 0);
    assert_eq!(bad_health.success_count, 0);
    assert!(bad_health.failure_count <= 2);
}

#[test]
fn threaded_run_reports_every_attempt() {
    let records = (1..=3)
        .map(|i| ProxyRecord::new(format!("192.0.2.{i}"), "8080", None, None))
        .collect();
    let pool = ProxyPool::from_records(
        records,
        PoolConfig {
            cooldown: Duration::ZERO,
            ..PoolConfig::default()
        },
    );

    let mut runner = ParallelProcessor::new(4).with_proxy_pool(Arc::clone(&pool));
    for i in 0..10 {
        runner.submit(format!("job-{i}"), move |ctx| {
            assert!(ctx.proxy.is_some());
            if i % 2 == 0 {
                Ok(i)
            } else {
                Err(TaskError::other(format!("job {i} failed")))
            }
        });
    }

    let results = runner.run().unwrap();
    assert_eq!(results.len(), 10);
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 5);

    let snapshot = pool.snapshot();
    let successes: u64 = snapshot.iter().map(|h| h.success_count).sum();
    let failures: u64 = snapshot.iter().map(|h| h.failure_count).sum();
    assert_eq!((successes, failures), (5, 5));
}
