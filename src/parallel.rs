//! Bounded task runner backed by worker threads.

use crate::error::{RunnerError, TaskError};
use crate::pool::ProxyPool;
use crate::retry::RetryPolicy;
use crate::task::{TaskContext, TaskOutcome};
use crate::trace::{current_trace_id, new_trace_id, with_trace_id};

use crossbeam::channel;
use futures::executor::block_on;
use log::{error, info};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

struct Job<T> {
    name: String,
    trace_id: String,
    work: Box<dyn FnOnce() -> Result<T, TaskError> + Send>,
}

impl<T> Job<T> {
    /// A panic anywhere in the job becomes that job's failed outcome.
    fn run(self) -> TaskOutcome<T> {
        let Job {
            name,
            trace_id,
            work,
        } = self;
        let result = panic::catch_unwind(AssertUnwindSafe(work))
            .unwrap_or_else(|payload| Err(TaskError::from_panic(payload)));
        TaskOutcome {
            name,
            trace_id,
            result,
        }
    }
}

/// Runs submitted units on a fixed number of worker threads.
///
/// Each unit gets its own trace id and, when a pool is attached, a proxy that
/// is acquired only once a worker has picked the unit up.
pub struct ParallelProcessor<T> {
    max_workers: usize,
    pool: Option<Arc<ProxyPool>>,
    retry: Option<RetryPolicy>,
    jobs: Vec<Job<T>>,
}

impl<T: Send + 'static> ParallelProcessor<T> {
    pub fn new(max_workers: usize) -> Self {
        Self {
            max_workers: max_workers.max(1),
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
    pub fn submit<F>(&mut self, name: impl Into<String>, unit: F) -> String
    where
        F: Fn(&TaskContext) -> Result<T, TaskError> + Send + 'static,
    {
        let name = name.into();
        let trace_id = new_trace_id();
        let pool = self.pool.clone();
        let retry = self.retry.clone();

        let (id, task) = (trace_id.clone(), name.clone());
        self.jobs.push(Job {
            name,
            trace_id: trace_id.clone(),
            work: Box::new(move || {
                with_trace_id(&id, || execute(&task, &unit, pool.as_deref(), retry.as_ref()))
            }),
        });
        trace_id
    }

    /// Number of units waiting to run.
    pub fn pending(&self) -> usize {
        self.jobs.len()
    }

    /// Run every submitted unit and return the outcomes in completion order.
    pub fn run(self) -> Result<Vec<TaskOutcome<T>>, RunnerError> {
        let total = self.jobs.len();
        if total == 0 {
            return Ok(Vec::new());
        }

        let (job_tx, job_rx) = channel::unbounded::<Job<T>>();
        let (result_tx, result_rx) = channel::unbounded::<TaskOutcome<T>>();

        // Start every worker before queueing anything so a spawn failure runs nothing.
        let workers = self.max_workers.min(total);
        let mut handles = Vec::with_capacity(workers);
        for i in 0..workers {
            let job_rx = job_rx.clone();
            let result_tx = result_tx.clone();
            let spawned = thread::Builder::new()
                .name(format!("task-worker-{i}"))
                .spawn(move || {
                    for job in job_rx.iter() {
                        if result_tx.send(job.run()).is_err() {
                            break;
                        }
                    }
                });

            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    drop(job_tx);
                    for handle in handles {
                        let _ = handle.join();
                    }
                    error!("Failed to spawn worker thread {}: {}", i, e);
                    return Err(RunnerError::SubstrateInit(format!(
                        "failed to spawn worker thread: {e}"
                    )));
                }
            }
        }
        drop(job_rx);
        drop(result_tx);

        info!("Running {} tasks on {} worker threads", total, workers);
        for job in self.jobs {
            // workers hold the receiver until the sender is dropped
            if job_tx.send(job).is_err() {
                break;
            }
        }
        drop(job_tx);

        let results: Vec<TaskOutcome<T>> = result_rx.iter().collect();
        for handle in handles {
            if handle.join().is_err() {
                error!("Worker thread panicked");
            }
        }
        if results.len() != total {
            error!("Collected {} outcomes for {} tasks", results.len(), total);
            return Err(RunnerError::Incomplete {
                expected: total,
                collected: results.len(),
            });
        }

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

fn execute<T, F>(
    name: &str,
    unit: &F,
    pool: Option<&ProxyPool>,
    retry: Option<&RetryPolicy>,
) -> Result<T, TaskError>
where
    F: Fn(&TaskContext) -> Result<T, TaskError>,
{
    info!("Task started: {}", name);

    let mut attempt = 0;
    let mut run_attempt = || {
        let proxy = pool.and_then(ProxyPool::acquire);
        if let Some(proxy) = &proxy {
            block_on(proxy.until_ready());
        }
        let ctx = TaskContext {
            trace_id: current_trace_id(),
            proxy,
            attempt,
        };
        attempt += 1;

        let result = panic::catch_unwind(AssertUnwindSafe(|| unit(&ctx)))
            .unwrap_or_else(|payload| Err(TaskError::from_panic(payload)));
        if let Some(pool) = pool {
            match &result {
                Ok(_) => pool.report_success(ctx.proxy.as_ref()),
                Err(_) => pool.report_failure(ctx.proxy.as_ref()),
            }
        }
        result
    };

    let result = match retry {
        Some(policy) => policy.call(name, run_attempt),
        None => run_attempt(),
    };
    match &result {
        Ok(_) => info!("Task completed: {}", name),
        Err(e) => error!("Task failed: {}: {}", name, e),
    }
    result
}
