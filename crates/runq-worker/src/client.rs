//! Runner view of the job dispatcher.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use runq_models::{
    ClaimedJob, JobId, JobType, ProcessingToken, RegisterRunner, RunnerCredential, RunnerToken,
};
use runq_queue::{DispatchError, Dispatcher};

/// Errors from job server calls.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServerError {
    /// The job is no longer PROCESSING under this runner. Never retried.
    #[error("job is no longer in the processing state")]
    NotProcessing,

    #[error("request failed: {0}")]
    Request(String),
}

impl ServerError {
    pub fn is_not_processing(&self) -> bool {
        matches!(self, ServerError::NotProcessing)
    }
}

impl From<DispatchError> for ServerError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::NotProcessing(_) => ServerError::NotProcessing,
            other => ServerError::Request(other.to_string()),
        }
    }
}

pub type ServerResult<T> = Result<T, ServerError>;

/// What a runner presents for every call about one job.
#[derive(Debug, Clone)]
pub struct JobAuth {
    pub job_id: JobId,
    pub token: ProcessingToken,
    pub runner_token: RunnerToken,
}

impl JobAuth {
    pub fn new(job: &ClaimedJob, runner_token: &RunnerToken) -> Self {
        Self {
            job_id: job.id.clone(),
            token: job.token.clone(),
            runner_token: runner_token.clone(),
        }
    }
}

/// Calls a runner makes to the job dispatcher.
#[async_trait]
pub trait JobServer: Send + Sync {
    async fn register(&self, request: RegisterRunner) -> ServerResult<RunnerCredential>;

    async fn claim(
        &self,
        runner_token: &RunnerToken,
        accepted_types: &[JobType],
    ) -> ServerResult<Option<ClaimedJob>>;

    async fn update(
        &self,
        job: &JobAuth,
        progress: Option<u8>,
        payload: Option<serde_json::Value>,
    ) -> ServerResult<()>;

    async fn success(&self, job: &JobAuth, result: serde_json::Value) -> ServerResult<()>;

    async fn error(&self, job: &JobAuth, message: &str) -> ServerResult<()>;

    /// Give the job back without counting a failure.
    async fn abort(&self, job: &JobAuth, reason: &str) -> ServerResult<()>;
}

/// [`JobServer`] backed by an in-process dispatcher.
#[derive(Clone)]
pub struct LocalJobServer {
    dispatcher: Arc<Dispatcher>,
}

impl LocalJobServer {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }
}

#[async_trait]
impl JobServer for LocalJobServer {
    async fn register(&self, request: RegisterRunner) -> ServerResult<RunnerCredential> {
        Ok(self.dispatcher.registry().register(request).await?)
    }

    async fn claim(
        &self,
        runner_token: &RunnerToken,
        accepted_types: &[JobType],
    ) -> ServerResult<Option<ClaimedJob>> {
        Ok(self.dispatcher.claim(runner_token, accepted_types).await?)
    }

    async fn update(
        &self,
        job: &JobAuth,
        progress: Option<u8>,
        payload: Option<serde_json::Value>,
    ) -> ServerResult<()> {
        self.dispatcher
            .report_progress(&job.job_id, &job.token, &job.runner_token, progress, payload)
            .await?;
        Ok(())
    }

    async fn success(&self, job: &JobAuth, result: serde_json::Value) -> ServerResult<()> {
        self.dispatcher
            .report_success(&job.job_id, &job.token, &job.runner_token, result)
            .await?;
        Ok(())
    }

    async fn error(&self, job: &JobAuth, message: &str) -> ServerResult<()> {
        self.dispatcher
            .report_error(&job.job_id, &job.token, &job.runner_token, message)
            .await?;
        Ok(())
    }

    async fn abort(&self, job: &JobAuth, reason: &str) -> ServerResult<()> {
        self.dispatcher
            .abort(&job.job_id, &job.token, &job.runner_token, reason)
            .await?;
        Ok(())
    }
}
