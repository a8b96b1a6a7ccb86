//! Runner error types.

use thiserror::Error;

use crate::client::ServerError;

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Job failed: {0}")]
    JobFailed(String),

    #[error("Invalid job payload: {0}")]
    InvalidPayload(String),

    #[error("Transcoding engine failed: {0}")]
    EngineFailed(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Runner is shutting down")]
    Shutdown,

    #[error("Job server error: {0}")]
    Server(#[from] ServerError),

    #[error("Media error: {0}")]
    Media(#[from] runq_media::MediaError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkerError {
    pub fn job_failed(msg: impl Into<String>) -> Self {
        Self::JobFailed(msg.into())
    }

    pub fn engine_failed(msg: impl Into<String>) -> Self {
        Self::EngineFailed(msg.into())
    }

    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    /// The server no longer considers the job PROCESSING.
    pub fn is_not_processing(&self) -> bool {
        matches!(self, WorkerError::Server(ServerError::NotProcessing))
    }
}
