//! Dispatcher metrics.

use metrics::counter;

use runq_models::JobType;

/// Metric names as constants for consistency.
pub mod names {
    pub const JOBS_ENQUEUED_TOTAL: &str = "runq_jobs_enqueued_total";
    pub const JOBS_CLAIMED_TOTAL: &str = "runq_jobs_claimed_total";
    pub const JOBS_COMPLETED_TOTAL: &str = "runq_jobs_completed_total";
    pub const JOBS_FAILED_TOTAL: &str = "runq_jobs_failed_total";
    pub const JOBS_STALLED_TOTAL: &str = "runq_jobs_stalled_total";
    pub const JOBS_CANCELLED_TOTAL: &str = "runq_jobs_cancelled_total";
}

pub fn record_enqueued(job_type: JobType) {
    counter!(names::JOBS_ENQUEUED_TOTAL, "type" => job_type.as_str()).increment(1);
}

pub fn record_claimed(job_type: JobType) {
    counter!(names::JOBS_CLAIMED_TOTAL, "type" => job_type.as_str()).increment(1);
}

pub fn record_completed(job_type: JobType) {
    counter!(names::JOBS_COMPLETED_TOTAL, "type" => job_type.as_str()).increment(1);
}

/// Record a job failure; `terminal` when the failure budget is exhausted.
pub fn record_failed(job_type: JobType, terminal: bool) {
    let terminal = if terminal { "true" } else { "false" };
    counter!(names::JOBS_FAILED_TOTAL, "type" => job_type.as_str(), "terminal" => terminal)
        .increment(1);
}

pub fn record_stalled(job_type: JobType) {
    counter!(names::JOBS_STALLED_TOTAL, "type" => job_type.as_str()).increment(1);
}

pub fn record_cancelled(count: usize) {
    counter!(names::JOBS_CANCELLED_TOTAL).increment(count as u64);
}
