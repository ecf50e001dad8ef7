//! Simple example of using proxy-task-kit.
//!
//! Expects `./proxies/*.txt` with `address:port:username:password` lines.

use proxy_task_kit::{
    logging, AsyncProcessor, HttpSessionProvider, ProxyPool, TaskError, ToolkitConfig,
};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init();

    let config = ToolkitConfig::builder()
        .proxy_dir("proxies")
        .max_concurrency(3)
        .cooldown(Duration::from_secs(30))
        .retries(2)
        .base_delay(Duration::from_millis(500))
        .request_timeout(Duration::from_secs(5))
        // rate limit for each proxy, lower performance but avoid banned
        .max_requests_per_second(3.0)
        .build();

    let pool = ProxyPool::from_dir(&config.proxy_dir, config.pool_config())?;
    let (total, available) = pool.get_stats();
    println!("Proxy pool: {available}/{total} available");

    let mut runner = AsyncProcessor::new(config.max_concurrency, HttpSessionProvider::from_config(&config))
        .with_proxy_pool(pool.clone())
        .with_retry(config.retry_policy());

    for i in 0..6 {
        runner.submit(format!("fetch-ip-{i}"), |_ctx, client: Arc<reqwest::Client>| async move {
            let response = client.get("https://httpbin.org/ip").send().await?;
            let body = response.error_for_status()?.text().await?;
            Ok::<_, TaskError>(body)
        });
    }

    for outcome in runner.run().await? {
        match outcome.result {
            Ok(body) => println!("[{}] {}: {}", outcome.trace_id, outcome.name, body.trim()),
            Err(e) => println!("[{}] {} failed: {}", outcome.trace_id, outcome.name, e),
        }
    }

    for health in pool.snapshot() {
        println!(
            "{} score={} ok={} failed={} success_rate={:.0}%",
            health.record,
            health.score,
            health.success_count,
            health.failure_count,
            health.success_rate() * 100.0
        );
    }
    Ok(())
}
