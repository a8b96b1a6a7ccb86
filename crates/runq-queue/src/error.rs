//! Dispatch error types.

use thiserror::Error;

pub type DispatchResult<T> = Result<T, DispatchError>;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Invalid registration secret")]
    InvalidSecret,

    #[error("Unknown runner token")]
    Unauthorized,

    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Job {0} is not processing under this runner and token")]
    NotProcessing(String),

    #[error("Job {0} is not pending")]
    NotPending(String),

    #[error("Job {0} cannot be cancelled in its current state")]
    NotCancellable(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Store error: {0}")]
    Store(String),
}

impl DispatchError {
    pub fn not_found(id: impl ToString) -> Self {
        Self::NotFound(id.to_string())
    }

    pub fn not_processing(id: impl ToString) -> Self {
        Self::NotProcessing(id.to_string())
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// Whether the server has abandoned the job the caller was working on.
    ///
    /// Runners must stop instead of retrying on this error.
    pub fn is_not_processing(&self) -> bool {
        matches!(self, DispatchError::NotProcessing(_))
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            DispatchError::InvalidSecret => "INVALID_REGISTRATION_SECRET",
            DispatchError::Unauthorized => "UNKNOWN_RUNNER_TOKEN",
            DispatchError::NotFound(_) => "JOB_NOT_FOUND",
            DispatchError::NotProcessing(_) => "JOB_NOT_IN_PROCESSING_STATE",
            DispatchError::NotPending(_) => "JOB_NOT_IN_PENDING_STATE",
            DispatchError::NotCancellable(_) => "JOB_NOT_CANCELLABLE",
            DispatchError::InvalidInput(_) => "INVALID_INPUT",
            DispatchError::Store(_) => "STORE_ERROR",
        }
    }
}
