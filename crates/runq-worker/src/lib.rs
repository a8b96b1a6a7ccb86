//! Runner side of the job system.
//!
//! This crate provides:
//! - The `JobServer` client seam and its in-process implementation
//! - Retry policies for job server calls
//! - The live RTMP to HLS transcoding executor
//! - The poll loop that claims and runs jobs

pub mod client;
pub mod config;
pub mod error;
pub mod executor;
pub mod live;
pub mod logging;
pub mod metrics;
pub mod retry;

pub use client::{JobAuth, JobServer, LocalJobServer, ServerError, ServerResult};
pub use config::RunnerConfig;
pub use error::{WorkerError, WorkerResult};
pub use executor::{JobExecutor, ACCEPTED_JOB_TYPES};
pub use live::{ExecutionOutcome, LiveSettings, LiveTranscodingExecutor};
pub use logging::JobLogger;
pub use retry::{retry_async, retry_async_unless, Backoff, FailureTracker, RetryConfig, RetryResult};
