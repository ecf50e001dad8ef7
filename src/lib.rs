//! # proxy-task-kit
//!
//! Runs many independent units of work concurrently, each routed through a
//! rotating pool of proxies scored by how reliably they have served.
//!
//! A [`ProxyPool`] hands out a random endpoint among those that are neither
//! cooling down after a failure nor scored out. [`ParallelProcessor`] (worker
//! threads) and [`AsyncProcessor`] (cooperative futures) run submitted units
//! under a concurrency cap, pick a proxy once a slot is granted, report the
//! outcome back to the pool and optionally retry with exponential backoff via
//! [`RetryPolicy`]. Every log line emitted while a unit runs is tagged with
//! that unit's trace id.

pub mod client;
pub mod config;
pub mod cooperative;
pub mod error;
pub mod logging;
pub mod middleware;
pub mod parallel;
pub mod pool;
pub mod proxy;
pub mod retry;
pub mod task;
pub mod trace;
mod utils;

pub use client::{HttpClient, HttpSessionProvider};
pub use config::{PoolConfig, ToolkitConfig, ToolkitConfigBuilder};
pub use cooperative::{AsyncProcessor, NoSession, SessionProvider};
pub use error::{ErrorKind, ProxyLoadError, RunnerError, TaskError};
pub use middleware::ProxyPoolMiddleware;
pub use parallel::ParallelProcessor;
pub use pool::{ProxyHandle, ProxyPool};
pub use proxy::{BrowserProxy, ProxyHealth, ProxyRecord, ProxyScheme};
pub use retry::{RetryOn, RetryPolicy};
pub use task::{TaskContext, TaskOutcome};
pub use trace::current_trace_id;
