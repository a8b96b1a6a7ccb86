//! Runner metrics.

use metrics::counter;

pub mod names {
    pub const LIVE_UPDATES_SENT_TOTAL: &str = "runq_live_updates_sent_total";
    pub const LIVE_UPDATE_FAILURES_TOTAL: &str = "runq_live_update_failures_total";
    pub const EXECUTIONS_TOTAL: &str = "runq_executions_total";
}

/// Record a delivered live update; `kind` is `add-chunk` or `remove-chunk`.
pub fn record_update_sent(kind: &'static str) {
    counter!(names::LIVE_UPDATES_SENT_TOTAL, "kind" => kind).increment(1);
}

pub fn record_update_failed(kind: &'static str) {
    counter!(names::LIVE_UPDATE_FAILURES_TOTAL, "kind" => kind).increment(1);
}

pub fn record_execution(outcome: &'static str) {
    counter!(names::EXECUTIONS_TOTAL, "outcome" => outcome).increment(1);
}
