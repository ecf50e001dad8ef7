//! Types shared by the task runners.

use crate::error::TaskError;
use crate::pool::ProxyHandle;
use crate::proxy::ProxyRecord;

/// What a unit of work is told about the attempt it runs in.
#[derive(Debug, Clone)]
pub struct TaskContext {
    /// Correlation id of the task, also visible through
    /// [`current_trace_id`](crate::trace::current_trace_id).
    pub trace_id: String,
    /// The proxy assigned to this attempt, if the pool had one available.
    pub proxy: Option<ProxyHandle>,
    /// 0 for the first attempt, `n` for the n-th retry.
    pub attempt: u32,
}

impl TaskContext {
    pub fn proxy_record(&self) -> Option<&ProxyRecord> {
        self.proxy.as_ref().map(ProxyHandle::record)
    }
}

/// Result of one submitted unit of work.
#[derive(Debug)]
pub struct TaskOutcome<T> {
    pub name: String,
    pub trace_id: String,
    pub result: Result<T, TaskError>,
}

impl<T> TaskOutcome<T> {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }

    pub fn into_result(self) -> Result<T, TaskError> {
        self.result
    }
}
