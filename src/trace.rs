//! Per-task correlation identifiers.
//!
//! Runners give every unit of work a fresh trace id and make it visible to all
//! log lines emitted while the unit runs: through a tokio task-local for async
//! units and a thread-local for units running on worker threads.

use std::cell::RefCell;
use std::future::Future;

use uuid::Uuid;

/// Trace id reported outside of any task.
pub const NO_TRACE_ID: &str = "N/A";

tokio::task_local! {
    static TASK_TRACE_ID: String;
}

thread_local! {
    static THREAD_TRACE_ID: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Generate a fresh trace id.
pub fn new_trace_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// The trace id of the task currently running on this thread or future.
pub fn current_trace_id() -> String {
    if let Ok(id) = TASK_TRACE_ID.try_with(|id| id.clone()) {
        return id;
    }
    THREAD_TRACE_ID
        .with(|slot| slot.borrow().clone())
        .unwrap_or_else(|| NO_TRACE_ID.to_string())
}

struct Restore(Option<String>);

impl Drop for Restore {
    fn drop(&mut self) {
        let previous = self.0.take();
        THREAD_TRACE_ID.with(|slot| *slot.borrow_mut() = previous);
    }
}

/// Run `f` with `id` as the current trace id of this thread.
///
/// The previous id is restored when `f` returns or unwinds.
pub fn with_trace_id<R>(id: &str, f: impl FnOnce() -> R) -> R {
    let previous = THREAD_TRACE_ID.with(|slot| slot.replace(Some(id.to_string())));
    let _restore = Restore(previous);
    f()
}

/// Run `fut` with `id` as its trace id.
pub async fn scope_trace_id<F: Future>(id: String, fut: F) -> F::Output {
    TASK_TRACE_ID.scope(id, fut).await
}
