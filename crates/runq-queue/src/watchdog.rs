//! Background service reclaiming jobs whose runner went silent.
//!
//! A PROCESSING job whose lease has not been renewed within the staleness
//! window of its family (live or VOD) is failed with a synthetic "stalled"
//! error: requeued while under the failure budget, errored and cascaded
//! otherwise. Runners are not notified; they find out on their next call.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use runq_models::{FailureOutcome, JobState, JobType};

use crate::dispatcher::Dispatcher;
use crate::error::DispatchResult;
use crate::store::JobFilter;

/// Watchdog configuration.
#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    pub enabled: bool,
    /// Time between scans
    pub interval: Duration,
    /// Staleness window for live jobs, `None` disables
    pub live_stale_after: Option<Duration>,
    /// Staleness window for every other job type, `None` disables
    pub vod_stale_after: Option<Duration>,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(60),
            live_stale_after: Some(Duration::from_secs(600)),
            vod_stale_after: Some(Duration::from_secs(900)),
        }
    }
}

impl WatchdogConfig {
    /// Create config from environment variables. A window of `0` disables
    /// the scan for that family.
    pub fn from_env() -> Self {
        let window = |name: &str, default: u64| {
            let secs = std::env::var(name)
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(default);
            (secs > 0).then(|| Duration::from_secs(secs))
        };

        Self {
            enabled: std::env::var("WATCHDOG_ENABLED")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(true),
            interval: Duration::from_secs(
                std::env::var("RUNQ_WATCHDOG_INTERVAL_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .filter(|n| *n > 0)
                    .unwrap_or(60),
            ),
            live_stale_after: window("RUNQ_STALE_LIVE_SECS", 600),
            vod_stale_after: window("RUNQ_STALE_VOD_SECS", 900),
        }
    }

    /// Staleness window for `job_type`.
    pub fn stale_window(&self, job_type: JobType) -> Option<Duration> {
        if job_type.is_live() {
            self.live_stale_after
        } else {
            self.vod_stale_after
        }
    }
}

/// Counts from one scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanReport {
    /// Jobs seen stale
    pub stale: u32,
    /// Stale jobs sent back to PENDING
    pub requeued: u32,
    /// Stale jobs that exhausted their failure budget
    pub errored: u32,
}

/// Stalled job watchdog.
pub struct Watchdog {
    dispatcher: Arc<Dispatcher>,
    config: WatchdogConfig,
}

impl Watchdog {
    pub fn new(dispatcher: Arc<Dispatcher>, config: WatchdogConfig) -> Self {
        Self { dispatcher, config }
    }

    /// Run scans until `shutdown` flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        if !self.config.enabled {
            info!("Stalled job watchdog is disabled");
            return;
        }

        info!("Starting stalled job watchdog (interval: {:?})", self.config.interval);

        let mut ticker = interval(self.config.interval);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Stalled job watchdog stopped");
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.check_once().await {
                        error!("Stalled job scan error: {}", e);
                    }
                }
            }
        }
    }

    /// Run a single scan now.
    pub async fn check_once(&self) -> DispatchResult<ScanReport> {
        self.scan_at(Utc::now()).await
    }

    /// Run a single scan as if the current time were `now`.
    pub async fn scan_at(&self, now: DateTime<Utc>) -> DispatchResult<ScanReport> {
        let processing = self
            .dispatcher
            .list(&JobFilter::default().with_states([JobState::Processing]))
            .await?;

        let mut report = ScanReport::default();

        for job in processing {
            let Some(window) = self.config.stale_window(job.job_type) else {
                continue;
            };
            let Some(lease) = job.lease.as_ref() else {
                continue;
            };
            if !lease.is_stale(now, window) {
                continue;
            }

            report.stale += 1;
            warn!(
                job_id = %job.id,
                runner_id = %lease.runner_id,
                job_type = %job.job_type,
                silent_for = ?lease.silence(now),
                "Detected stalled job"
            );

            match self
                .dispatcher
                .fail_stalled(&job.id, &lease.token, window, now)
                .await
            {
                Ok(Some(FailureOutcome::Requeued { .. })) => report.requeued += 1,
                Ok(Some(FailureOutcome::Errored { .. })) => report.errored += 1,
                Ok(None) => {
                    debug!(job_id = %job.id, "Stalled job moved on before recovery");
                }
                Err(e) => {
                    error!(job_id = %job.id, "Failed to recover stalled job: {}", e);
                }
            }
        }

        if report.stale > 0 {
            info!(
                "Stalled job scan complete: {} stale, {} requeued, {} errored",
                report.stale, report.requeued, report.errored
            );
        }

        Ok(report)
    }
}
