//! Runner configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::retry::RetryConfig;

/// Runner configuration.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Name shown in the runner list
    pub name: String,
    pub description: Option<String>,
    /// Registration token secret
    pub registration_secret: String,
    /// Parent of the per-job working directories
    pub transcoding_dir: PathBuf,
    /// Maximum concurrent jobs
    pub max_concurrent_jobs: usize,
    /// Time between claim attempts
    pub poll_interval: Duration,
    /// Settle time between engine end and the final flush
    pub end_grace: Duration,
    /// Attempts per update/success/error call, first one included
    pub update_attempts: u32,
    /// Fixed delay between those attempts
    pub update_retry_delay: Duration,
    /// Output directory polling interval
    pub watch_interval: Duration,
    /// Graceful shutdown timeout
    pub shutdown_timeout: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            name: "runq-runner".to_string(),
            description: None,
            registration_secret: String::new(),
            transcoding_dir: std::env::temp_dir().join("runq"),
            max_concurrent_jobs: 2,
            poll_interval: Duration::from_millis(1000),
            end_grace: Duration::from_millis(1500),
            update_attempts: 3,
            update_retry_delay: Duration::from_millis(250),
            watch_interval: Duration::from_millis(100),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl RunnerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let millis = |name: &str, default: Duration| {
            std::env::var(name)
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(default)
        };

        Self {
            name: std::env::var("RUNNER_NAME").unwrap_or(defaults.name),
            description: std::env::var("RUNNER_DESCRIPTION").ok(),
            registration_secret: std::env::var("RUNNER_REGISTRATION_SECRET").unwrap_or_default(),
            transcoding_dir: std::env::var("RUNNER_TRANSCODING_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.transcoding_dir),
            max_concurrent_jobs: std::env::var("RUNNER_MAX_JOBS")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.max_concurrent_jobs),
            poll_interval: millis("RUNNER_POLL_INTERVAL_MS", defaults.poll_interval),
            end_grace: millis("RUNNER_END_GRACE_MS", defaults.end_grace),
            update_attempts: std::env::var("RUNNER_UPDATE_ATTEMPTS")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.update_attempts),
            update_retry_delay: millis("RUNNER_UPDATE_RETRY_DELAY_MS", defaults.update_retry_delay),
            watch_interval: millis("RUNNER_WATCH_INTERVAL_MS", defaults.watch_interval),
            shutdown_timeout: Duration::from_secs(
                std::env::var("RUNNER_SHUTDOWN_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(defaults.shutdown_timeout.as_secs()),
            ),
        }
    }

    /// Retry policy for calls to the job server.
    pub fn update_retry(&self) -> RetryConfig {
        RetryConfig::fixed(
            "job_server_call",
            self.update_attempts.saturating_sub(1),
            self.update_retry_delay,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RunnerConfig::default();
        assert_eq!(config.end_grace, Duration::from_millis(1500));

        let retry = config.update_retry();
        assert_eq!(retry.max_retries, 2);
        assert_eq!(retry.base_delay, Duration::from_millis(250));
    }
}
