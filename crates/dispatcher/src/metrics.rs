//! 调度指标，通过 `metrics` 门面记录，由二进制安装的导出器采集

use archivist_domain::entities::TaskState;
use metrics::counter;

pub const DISPATCH_REQUESTS: &str = "archivist.dispatcher.requests";
pub const DISPATCH_CLAIMS: &str = "archivist.dispatcher.claims";
pub const TASK_STATE: &str = "archivist.task.state";
pub const TASK_RETRY: &str = "archivist.task.retry";
pub const TASK_ERRORS: &str = "archivist.task_errors";
pub const ANALYST_DOWN: &str = "archivist.analyst.down";

pub fn record_dispatch_request() {
    counter!(DISPATCH_REQUESTS).increment(1);
}

pub fn record_claim() {
    counter!(DISPATCH_CLAIMS).increment(1);
}

pub fn record_task_state(state: TaskState) {
    counter!(TASK_STATE, "state" => state.as_str()).increment(1);
}

pub fn record_retry() {
    counter!(TASK_RETRY).increment(1);
}

pub fn record_task_error(processor: Option<&str>) {
    let processor = processor.unwrap_or("unknown").to_string();
    counter!(TASK_ERRORS, "processor" => processor).increment(1);
}

pub fn record_analyst_down(count: u64) {
    counter!(ANALYST_DOWN).increment(count);
}
