//! Live RTMP to HLS transcoding executor.
//!
//! One execution owns one claimed job:
//!
//! 1. STARTING: probe the input, create `<transcoding dir>/<uuid>`, watch it
//!    and start the engine.
//! 2. RUNNING: segments are reported per resolution through single-consumer
//!    queues, removals are reported as soon as they are seen.
//! 3. ENDED: after a grace period every pending segment is flushed, the
//!    queues drain and success is reported.
//! 4. ERRORED: the engine is stopped and the error reported, unless the
//!    server already gave up on the job.
//! 5. Cleanup always closes the watcher and deletes the working directory.

mod chunk_queue;
mod context;
mod playlists;
mod session;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};
use uuid::Uuid;

use runq_media::{
    hls, DirectoryWatcher, EngineExit, EngineHandle, LiveTranscodeRequest, LiveTranscoder,
    WatchFilter, WatchSubscription,
};
use runq_models::LiveRtmpHlsTranscodingPayload;

use crate::client::{JobAuth, JobServer, ServerError};
use crate::config::RunnerConfig;
use crate::error::{WorkerError, WorkerResult};
use crate::metrics;
use crate::retry::RetryConfig;

pub use chunk_queue::ChunkQueue;
pub use context::LiveJobContext;
pub use playlists::PlaylistTracker;
pub use session::LiveSession;

/// Live executor settings.
#[derive(Debug, Clone)]
pub struct LiveSettings {
    pub transcoding_dir: PathBuf,
    /// Settle time between engine end and the final flush
    pub end_grace: Duration,
    /// Policy for every job server call
    pub retry: RetryConfig,
    /// Time the engine gets to exit once stopped
    pub engine_stop_timeout: Duration,
}

impl LiveSettings {
    pub fn from_config(config: &RunnerConfig) -> Self {
        Self {
            transcoding_dir: config.transcoding_dir.clone(),
            end_grace: config.end_grace,
            retry: config.update_retry(),
            engine_stop_timeout: Duration::from_secs(15),
        }
    }
}

/// How an execution ended, from the runner's side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Completed,
    Failed(String),
    /// The server no longer considered the job ours
    Abandoned,
}

impl ExecutionOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            ExecutionOutcome::Completed => "completed",
            ExecutionOutcome::Failed(_) => "failed",
            ExecutionOutcome::Abandoned => "abandoned",
        }
    }
}

/// Resources of one execution, released by cleanup on every path.
struct LiveRun {
    session: LiveSession,
    engine: Option<EngineHandle>,
    subscription: Option<WatchSubscription>,
    failures: mpsc::UnboundedReceiver<ServerError>,
}

pub struct LiveTranscodingExecutor {
    server: Arc<dyn JobServer>,
    transcoder: Arc<dyn LiveTranscoder>,
    watcher: Arc<dyn DirectoryWatcher>,
    settings: LiveSettings,
}

impl LiveTranscodingExecutor {
    pub fn new(
        server: Arc<dyn JobServer>,
        transcoder: Arc<dyn LiveTranscoder>,
        watcher: Arc<dyn DirectoryWatcher>,
        settings: LiveSettings,
    ) -> Self {
        Self {
            server,
            transcoder,
            watcher,
            settings,
        }
    }

    /// Run one claimed live job to its end. `cancel` flipping to true makes
    /// the execution give the job back.
    pub async fn execute(
        &self,
        auth: JobAuth,
        payload: serde_json::Value,
        cancel: watch::Receiver<bool>,
    ) -> ExecutionOutcome {
        let (ctx, failures) = LiveJobContext::new(
            Arc::clone(&self.server),
            auth,
            self.settings.retry.clone(),
        );
        let work_dir = self.settings.transcoding_dir.join(Uuid::new_v4().to_string());

        let payload = serde_json::from_value::<LiveRtmpHlsTranscodingPayload>(payload)
            .map_err(|e| WorkerError::InvalidPayload(e.to_string()))
            .and_then(|p| p.validate().map(|_| p).map_err(WorkerError::InvalidPayload));
        let outputs = payload
            .as_ref()
            .map(|p| p.output.to_transcode.len())
            .unwrap_or(0);

        let mut run = LiveRun {
            session: LiveSession::new(Arc::clone(&ctx), work_dir, outputs),
            engine: None,
            subscription: None,
            failures,
        };

        let result = match payload {
            Ok(payload) => self.run(&ctx, &payload, &mut run, cancel).await,
            Err(e) => Err(e),
        };

        let outcome = match result {
            Ok(()) => self.on_ended(&ctx).await,
            Err(cause) => self.on_errored(&ctx, cause, &mut run).await,
        };

        self.cleanup(&ctx, run).await;
        metrics::record_execution(outcome.label());
        outcome
    }

    async fn run(
        &self,
        ctx: &LiveJobContext,
        payload: &LiveRtmpHlsTranscodingPayload,
        run: &mut LiveRun,
        mut cancel: watch::Receiver<bool>,
    ) -> WorkerResult<()> {
        let work_dir = run.session.work_dir().to_path_buf();
        ctx.logger().log_start(&format!(
            "{} -> {}",
            payload.input.rtmp_url,
            work_dir.display()
        ));

        // STARTING
        tokio::fs::create_dir_all(&work_dir).await?;
        let probe = self.transcoder.probe(&payload.input.rtmp_url).await?;
        debug!(job_id = %ctx.auth().job_id, ?probe, "Probed live input");

        let filter = WatchFilter::extensions([hls::PLAYLIST_EXTENSION, hls::SEGMENT_EXTENSION]);
        let subscription = run
            .subscription
            .insert(self.watcher.subscribe(&work_dir, filter).await?);

        let engine = run.engine.insert(
            self.transcoder
                .start(LiveTranscodeRequest {
                    input_url: payload.input.rtmp_url.clone(),
                    output_dir: work_dir,
                    outputs: payload.output.to_transcode.clone(),
                    segment_duration: payload.output.segment_duration,
                    segment_list_size: payload.output.segment_list_size,
                    probe,
                })
                .await?,
        );
        ctx.logger().log_progress("transcoding started");

        // RUNNING
        let session = &mut run.session;
        let failures = &mut run.failures;
        let exit = loop {
            tokio::select! {
                exit = engine.wait() => break exit,
                event = subscription.next() => match event {
                    Some(event) => session.handle_event(event).await,
                    None => return Err(WorkerError::job_failed("output watcher stopped")),
                },
                Some(failure) = failures.recv() => return Err(failure.into()),
                _ = cancelled(&mut cancel) => return Err(WorkerError::Shutdown),
            }
        };

        match exit {
            EngineExit::Ended => {}
            EngineExit::Stopped => {
                return Err(WorkerError::engine_failed("transcoding engine was stopped"))
            }
            EngineExit::Failed(message) => return Err(WorkerError::engine_failed(message)),
        }

        // ENDED: let trailing writes settle, then flush everything
        ctx.logger().log_progress("input ended, flushing remaining chunks");
        let grace = tokio::time::sleep(self.settings.end_grace);
        tokio::pin!(grace);
        loop {
            tokio::select! {
                _ = &mut grace => break,
                Some(event) = subscription.next() => session.handle_event(event).await,
                Some(failure) = failures.recv() => return Err(failure.into()),
            }
        }

        session.flush_all().await;
        session.drain().await;

        if let Ok(failure) = failures.try_recv() {
            return Err(failure.into());
        }

        Ok(())
    }

    async fn on_ended(&self, ctx: &LiveJobContext) -> ExecutionOutcome {
        if !ctx.mark_ended() {
            return ExecutionOutcome::Failed("execution already errored".to_string());
        }

        match ctx.report_success().await {
            Ok(()) => {
                ctx.logger().log_completion("live stream ended");
                ExecutionOutcome::Completed
            }
            Err(ServerError::NotProcessing) => {
                ctx.logger()
                    .log_warning("server dropped the job before it could complete");
                ExecutionOutcome::Abandoned
            }
            Err(e) => {
                ctx.logger()
                    .log_error(&format!("Failed to report success: {}", e));
                ExecutionOutcome::Failed(e.to_string())
            }
        }
    }

    async fn on_errored(
        &self,
        ctx: &LiveJobContext,
        cause: WorkerError,
        run: &mut LiveRun,
    ) -> ExecutionOutcome {
        if !ctx.mark_errored() {
            return ExecutionOutcome::Failed(cause.to_string());
        }

        self.stop_engine(ctx, run).await;
        run.session.abort();

        match cause {
            WorkerError::Shutdown => {
                ctx.logger().log_warning("runner shutting down, giving the job back");
                if let Err(e) = ctx.report_abort("runner shutting down").await {
                    ctx.logger()
                        .log_warning(&format!("Failed to give the job back: {}", e));
                }
                ExecutionOutcome::Abandoned
            }
            cause if cause.is_not_processing() => {
                // the server already moved on; success is a best-effort no-op
                ctx.logger()
                    .log_warning("job is no longer processing on the server, stopping");
                if let Err(e) = ctx.report_success().await {
                    debug!(job_id = %ctx.auth().job_id, "Best-effort success rejected: {}", e);
                }
                ExecutionOutcome::Abandoned
            }
            cause => {
                let message = cause.to_string();
                ctx.logger().log_error(&message);
                if let Err(e) = ctx.report_error(&message).await {
                    ctx.logger()
                        .log_warning(&format!("Failed to report error: {}", e));
                }
                ExecutionOutcome::Failed(message)
            }
        }
    }

    async fn stop_engine(&self, ctx: &LiveJobContext, run: &mut LiveRun) {
        let Some(engine) = run.engine.as_mut() else {
            return;
        };

        engine.stop();
        match tokio::time::timeout(self.settings.engine_stop_timeout, engine.wait()).await {
            // expected kill
            Ok(EngineExit::Stopped) => {}
            Ok(exit) => debug!(job_id = %ctx.auth().job_id, ?exit, "Engine exited on its own"),
            Err(_) => warn!(job_id = %ctx.auth().job_id, "Engine did not stop in time"),
        }
    }

    async fn cleanup(&self, ctx: &LiveJobContext, mut run: LiveRun) {
        if let Some(subscription) = run.subscription.take() {
            subscription.close();
        }
        // dropping the handle stops an engine still running
        drop(run.engine.take());
        run.session.abort();

        let work_dir = run.session.work_dir();
        match tokio::fs::remove_dir_all(work_dir).await {
            Ok(()) => debug!(job_id = %ctx.auth().job_id, dir = %work_dir.display(), "Removed working directory"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                job_id = %ctx.auth().job_id,
                dir = %work_dir.display(),
                "Failed to remove working directory: {}", e
            ),
        }
    }
}

/// Resolves once `cancel` is true; never if its sender is gone.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support;

#[cfg(test)]
mod tests;
