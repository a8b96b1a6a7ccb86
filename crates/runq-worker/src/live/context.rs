//! Per-job execution context for a live transcode.
//!
//! Everything concurrent parts of one execution share: the job credentials,
//! the retrying job server calls, and the `ended`/`errored` guards that let
//! exactly one terminal branch run.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use runq_models::{JobType, LiveUpdatePayload};

use crate::client::{JobAuth, JobServer, ServerError, ServerResult};
use crate::logging::JobLogger;
use crate::metrics;
use crate::retry::{retry_async_unless, RetryConfig};

pub struct LiveJobContext {
    server: Arc<dyn JobServer>,
    auth: JobAuth,
    retry: RetryConfig,
    logger: JobLogger,
    ended: AtomicBool,
    errored: AtomicBool,
    /// Set as soon as the server answers NotProcessing
    abandoned: AtomicBool,
    /// Terminal update failures from background senders
    failures: mpsc::UnboundedSender<ServerError>,
}

impl LiveJobContext {
    /// Create the context and the receiver its send failures arrive on.
    pub fn new(
        server: Arc<dyn JobServer>,
        auth: JobAuth,
        retry: RetryConfig,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ServerError>) {
        let (failures, failures_rx) = mpsc::unbounded_channel();
        let logger = JobLogger::new(&auth.job_id, JobType::LiveRtmpHlsTranscoding);

        let ctx = Arc::new(Self {
            server,
            auth,
            retry,
            logger,
            ended: AtomicBool::new(false),
            errored: AtomicBool::new(false),
            abandoned: AtomicBool::new(false),
            failures,
        });

        (ctx, failures_rx)
    }

    pub fn auth(&self) -> &JobAuth {
        &self.auth
    }

    pub fn logger(&self) -> &JobLogger {
        &self.logger
    }

    /// Enter the ENDED branch. False if a terminal branch was already taken.
    pub fn mark_ended(&self) -> bool {
        !self.errored.load(Ordering::SeqCst) && !self.ended.swap(true, Ordering::SeqCst)
    }

    /// Enter the ERRORED branch. False if a terminal branch was already taken.
    pub fn mark_errored(&self) -> bool {
        !self.ended.load(Ordering::SeqCst) && !self.errored.swap(true, Ordering::SeqCst)
    }

    pub fn is_errored(&self) -> bool {
        self.errored.load(Ordering::SeqCst)
    }

    /// True once the server no longer considers the job ours.
    pub fn is_abandoned(&self) -> bool {
        self.abandoned.load(Ordering::SeqCst)
    }

    /// Background senders stop once this is true.
    pub fn is_stopping(&self) -> bool {
        self.is_errored() || self.is_abandoned()
    }

    /// Hand a terminal send failure to the executor loop.
    pub fn fail(&self, error: ServerError) {
        if error.is_not_processing() {
            self.abandoned.store(true, Ordering::SeqCst);
        }
        let _ = self.failures.send(error);
    }

    /// Send one live update, retrying transient failures.
    pub async fn send_update(&self, update: &LiveUpdatePayload) -> ServerResult<()> {
        let kind = if update.is_add() { "add-chunk" } else { "remove-chunk" };
        let payload =
            serde_json::to_value(update).map_err(|e| ServerError::Request(e.to_string()))?;

        let result = self
            .call(kind, || self.server.update(&self.auth, None, Some(payload.clone())))
            .await;

        match &result {
            Ok(()) => metrics::record_update_sent(kind),
            Err(_) => metrics::record_update_failed(kind),
        }
        result
    }

    pub async fn report_success(&self) -> ServerResult<()> {
        self.call("success", || {
            self.server.success(&self.auth, serde_json::json!({}))
        })
        .await
    }

    pub async fn report_error(&self, message: &str) -> ServerResult<()> {
        self.call("error", || self.server.error(&self.auth, message))
            .await
    }

    pub async fn report_abort(&self, reason: &str) -> ServerResult<()> {
        self.call("abort", || self.server.abort(&self.auth, reason))
            .await
    }

    async fn call<F, Fut>(&self, operation: &str, f: F) -> ServerResult<()>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = ServerResult<()>>,
    {
        retry_async_unless(&self.retry.named(operation), f, ServerError::is_not_processing)
            .await
            .into_result()
    }
}
