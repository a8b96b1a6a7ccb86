//! Job executor: registers the runner and polls the dispatcher for work.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn, Instrument};

use runq_media::{FfmpegLiveTranscoder, PollingWatcher};
use runq_models::{ClaimedJob, JobType, RegisterRunner, RunnerCredential, RunnerToken};

use crate::client::{JobAuth, JobServer};
use crate::config::RunnerConfig;
use crate::error::{WorkerError, WorkerResult};
use crate::live::{LiveSettings, LiveTranscodingExecutor};
use crate::logging::JobLogger;
use crate::retry::{retry_async, FailureTracker, RetryConfig};

/// Job types this runner executes.
pub const ACCEPTED_JOB_TYPES: &[JobType] = &[JobType::LiveRtmpHlsTranscoding];

/// Job executor that claims jobs and runs each in its own task.
pub struct JobExecutor {
    config: RunnerConfig,
    server: Arc<dyn JobServer>,
    live: Arc<LiveTranscodingExecutor>,
    job_semaphore: Arc<Semaphore>,
}

impl JobExecutor {
    pub fn new(
        config: RunnerConfig,
        server: Arc<dyn JobServer>,
        live: LiveTranscodingExecutor,
    ) -> Self {
        let job_semaphore = Arc::new(Semaphore::new(config.max_concurrent_jobs));

        Self {
            config,
            server,
            live: Arc::new(live),
            job_semaphore,
        }
    }

    /// Executor backed by FFmpeg and a polling directory watcher.
    pub fn with_ffmpeg(config: RunnerConfig, server: Arc<dyn JobServer>) -> Self {
        let live = LiveTranscodingExecutor::new(
            Arc::clone(&server),
            Arc::new(FfmpegLiveTranscoder::new()),
            Arc::new(PollingWatcher::new(config.watch_interval)),
            LiveSettings::from_config(&config),
        );
        Self::new(config, server, live)
    }

    /// Register, then claim and run jobs until `shutdown` flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> WorkerResult<()> {
        let credential = self.register().await?;
        info!(
            runner_id = %credential.runner_id,
            "Runner '{}' registered, running up to {} jobs",
            self.config.name, self.config.max_concurrent_jobs
        );

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let mut jobs = JoinSet::new();
        let mut claim_failures = FailureTracker::new(3);
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Shutdown signal received, stopping executor");
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.poll(&credential.runner_token, &mut jobs, &cancel_rx, &mut claim_failures).await;
                }
                Some(done) = jobs.join_next() => {
                    if let Err(e) = done {
                        if e.is_panic() {
                            error!("Job task panicked: {}", e);
                        }
                    }
                }
            }
        }

        self.shutdown(jobs, cancel_tx).await;
        info!("Job executor stopped");
        Ok(())
    }

    async fn register(&self) -> WorkerResult<RunnerCredential> {
        let mut request =
            RegisterRunner::new(self.config.registration_secret.clone(), self.config.name.clone());
        if let Some(description) = &self.config.description {
            request = request.with_description(description.clone());
        }
        request.validate().map_err(WorkerError::config_error)?;

        let retry = RetryConfig::new("register_runner").with_base_delay(Duration::from_millis(500));
        let credential = retry_async(&retry, || self.server.register(request.clone()))
            .await
            .into_result()?;
        Ok(credential)
    }

    /// Claim jobs while concurrency slots are free.
    async fn poll(
        &self,
        runner_token: &RunnerToken,
        jobs: &mut JoinSet<()>,
        cancel: &watch::Receiver<bool>,
        claim_failures: &mut FailureTracker,
    ) {
        while let Ok(permit) = Arc::clone(&self.job_semaphore).try_acquire_owned() {
            match self.server.claim(runner_token, ACCEPTED_JOB_TYPES).await {
                Ok(Some(job)) => {
                    claim_failures.record_success();
                    self.spawn_job(job, runner_token, permit, jobs, cancel.clone());
                }
                Ok(None) => {
                    claim_failures.record_success();
                    break;
                }
                Err(e) => {
                    if claim_failures.record_failure() {
                        warn!("Failed to claim job: {}", e);
                    }
                    break;
                }
            }
        }
    }

    fn spawn_job(
        &self,
        job: ClaimedJob,
        runner_token: &RunnerToken,
        permit: OwnedSemaphorePermit,
        jobs: &mut JoinSet<()>,
        cancel: watch::Receiver<bool>,
    ) {
        let auth = JobAuth::new(&job, runner_token);
        let logger = JobLogger::new(&job.id, job.job_type);
        let span = logger.create_span();
        let live = Arc::clone(&self.live);
        let server = Arc::clone(&self.server);

        jobs.spawn(
            async move {
                let _permit = permit;
                match job.job_type {
                    JobType::LiveRtmpHlsTranscoding => {
                        let outcome = live.execute(auth, job.payload, cancel).await;
                        debug!(outcome = outcome.label(), "Execution finished");
                    }
                    other => {
                        let message = format!("Unsupported job type {}", other);
                        logger.log_error(&message);
                        if let Err(e) = server.error(&auth, &message).await {
                            logger.log_warning(&format!("Failed to report error: {}", e));
                        }
                    }
                }
            }
            .instrument(span),
        );
    }

    /// Let running jobs finish, then make the rest give their job back.
    async fn shutdown(&self, mut jobs: JoinSet<()>, cancel: watch::Sender<bool>) {
        if jobs.is_empty() {
            return;
        }

        let timeout = self.config.shutdown_timeout;
        info!("Waiting up to {:?} for {} running jobs", timeout, jobs.len());
        if tokio::time::timeout(timeout, drain(&mut jobs)).await.is_ok() {
            return;
        }

        warn!("Aborting {} jobs still running after shutdown timeout", jobs.len());
        cancel.send_replace(true);
        if tokio::time::timeout(timeout, drain(&mut jobs)).await.is_err() {
            error!("{} jobs did not stop, dropping them", jobs.len());
            jobs.abort_all();
        }
    }
}

async fn drain(jobs: &mut JoinSet<()>) {
    while jobs.join_next().await.is_some() {}
}
