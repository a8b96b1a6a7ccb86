//! Job records and their lifecycle transitions.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

use crate::lease::{Lease, ProcessingToken};
use crate::runner::RunnerId;

/// Maximum stored error message length.
pub const ERROR_MESSAGE_MAX_LEN: usize = 5000;

/// Unique identifier for a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    /// Generate a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of work a job carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum JobType {
    VodWebVideoTranscoding,
    VodHlsTranscoding,
    VodAudioMergeTranscoding,
    LiveRtmpHlsTranscoding,
    VideoStudioTranscoding,
    VideoTranscription,
    GenerateVideoStoryboard,
}

impl JobType {
    pub const ALL: [JobType; 7] = [
        JobType::VodWebVideoTranscoding,
        JobType::VodHlsTranscoding,
        JobType::VodAudioMergeTranscoding,
        JobType::LiveRtmpHlsTranscoding,
        JobType::VideoStudioTranscoding,
        JobType::VideoTranscription,
        JobType::GenerateVideoStoryboard,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::VodWebVideoTranscoding => "vod-web-video-transcoding",
            JobType::VodHlsTranscoding => "vod-hls-transcoding",
            JobType::VodAudioMergeTranscoding => "vod-audio-merge-transcoding",
            JobType::LiveRtmpHlsTranscoding => "live-rtmp-hls-transcoding",
            JobType::VideoStudioTranscoding => "video-studio-transcoding",
            JobType::VideoTranscription => "video-transcription",
            JobType::GenerateVideoStoryboard => "generate-video-storyboard",
        }
    }

    /// Live jobs get their own staleness window.
    pub fn is_live(&self) -> bool {
        matches!(self, JobType::LiveRtmpHlsTranscoding)
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown job type name.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Unknown job type: {0}")]
pub struct ParseJobTypeError(pub String);

impl FromStr for JobType {
    type Err = ParseJobTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobType::ALL
            .into_iter()
            .find(|t| t.as_str() == s.trim())
            .ok_or_else(|| ParseJobTypeError(s.to_string()))
    }
}

/// Job state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Claimable by any runner accepting its type
    #[default]
    Pending,
    /// Parent has not completed yet
    WaitingForParentJob,
    /// Owned by a runner through a lease
    Processing,
    Completed,
    /// Failure budget exhausted
    Errored,
    Cancelled,
    ParentErrored,
    ParentCancelled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::WaitingForParentJob => "waiting_for_parent_job",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Errored => "errored",
            JobState::Cancelled => "cancelled",
            JobState::ParentErrored => "parent_errored",
            JobState::ParentCancelled => "parent_cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed
                | JobState::Errored
                | JobState::Cancelled
                | JobState::ParentErrored
                | JobState::ParentCancelled
        )
    }

    pub fn is_cancellable(&self) -> bool {
        matches!(
            self,
            JobState::Pending | JobState::WaitingForParentJob | JobState::Processing
        )
    }

    /// State a child is forced into when its parent ends in `self`, if any.
    pub fn cascade_to_child(&self) -> Option<JobState> {
        match self {
            JobState::Completed => Some(JobState::Pending),
            JobState::Errored | JobState::ParentErrored => Some(JobState::ParentErrored),
            JobState::Cancelled | JobState::ParentCancelled => Some(JobState::ParentCancelled),
            _ => None,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a recorded failure did to the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Back to PENDING for another attempt
    Requeued { failures: u32 },
    /// Failure budget exhausted, job is ERRORED
    Errored { failures: u32 },
}

/// A unit of work dispatched to runners.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Job {
    /// Unique job ID
    pub id: JobId,

    /// Job type
    pub job_type: JobType,

    /// Task-specific payload, sent to the runner
    pub payload: serde_json::Value,

    /// Server-only payload, never sent to a runner
    #[serde(default)]
    pub private_payload: serde_json::Value,

    #[serde(default)]
    pub state: JobState,

    /// Lower runs first
    #[serde(default)]
    pub priority: i32,

    /// Number of recorded failures
    #[serde(default)]
    pub failures: u32,

    /// Last error message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Progress (0-100)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,

    /// Present iff the job is PROCESSING
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease: Option<Lease>,

    /// Owner while processing, kept once the job is terminal
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runner_id: Option<RunnerId>,

    /// Parent job that must complete first
    #[serde(skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<JobId>,

    pub created_at: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,

    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Create a new PENDING job.
    pub fn new(job_type: JobType, payload: serde_json::Value) -> Self {
        let now = Utc::now();

        Self {
            id: JobId::new(),
            job_type,
            payload,
            private_payload: serde_json::Value::Null,
            state: JobState::Pending,
            priority: 0,
            failures: 0,
            error: None,
            progress: None,
            lease: None,
            runner_id: None,
            depends_on: None,
            created_at: now,
            started_at: None,
            finished_at: None,
            updated_at: now,
        }
    }

    pub fn with_private_payload(mut self, private_payload: serde_json::Value) -> Self {
        self.private_payload = private_payload;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Attach a parent; the caller decides the initial state from the parent's state.
    pub fn with_parent(mut self, parent: JobId, initial_state: JobState) -> Self {
        self.depends_on = Some(parent);
        self.state = initial_state;
        self
    }

    /// Current processing token, if the job is leased.
    pub fn processing_token(&self) -> Option<&ProcessingToken> {
        self.lease.as_ref().map(|l| &l.token)
    }

    /// Whether `token` and `runner_id` own this job right now.
    pub fn is_held_by(&self, token: &ProcessingToken, runner_id: &RunnerId) -> bool {
        self.state == JobState::Processing
            && self
                .lease
                .as_ref()
                .is_some_and(|l| l.is_held_by(token, runner_id))
    }

    /// PENDING -> PROCESSING under a fresh lease.
    pub fn begin_processing(&mut self, runner_id: RunnerId, now: DateTime<Utc>) -> &Lease {
        self.state = JobState::Processing;
        self.runner_id = Some(runner_id.clone());
        self.started_at = Some(now);
        self.updated_at = now;
        self.lease.insert(Lease::grant(runner_id, now))
    }

    /// Record a progress report from the owner.
    pub fn renew(&mut self, progress: Option<u8>, now: DateTime<Utc>) {
        if let Some(lease) = self.lease.as_mut() {
            lease.renew(now);
        }
        if progress.is_some() {
            self.progress = progress;
        }
        self.updated_at = now;
    }

    /// PROCESSING -> COMPLETED.
    pub fn complete(&mut self, now: DateTime<Utc>) {
        self.state = JobState::Completed;
        self.lease = None;
        self.progress = Some(100);
        self.finished_at = Some(now);
        self.updated_at = now;
    }

    /// Back to PENDING with every trace of the previous attempt removed.
    pub fn reset_to_pending(&mut self, now: DateTime<Utc>) {
        self.state = JobState::Pending;
        self.lease = None;
        self.runner_id = None;
        self.progress = None;
        self.started_at = None;
        self.updated_at = now;
    }

    /// Count a failure and either requeue or terminally fail the job.
    pub fn record_failure(
        &mut self,
        message: &str,
        max_failures: u32,
        now: DateTime<Utc>,
    ) -> FailureOutcome {
        self.failures += 1;
        self.error = Some(truncate_message(message));

        if self.failures < max_failures {
            self.reset_to_pending(now);
            FailureOutcome::Requeued {
                failures: self.failures,
            }
        } else {
            self.state = JobState::Errored;
            self.lease = None;
            self.finished_at = Some(now);
            self.updated_at = now;
            FailureOutcome::Errored {
                failures: self.failures,
            }
        }
    }

    /// Administrative cancellation.
    pub fn cancel(&mut self, now: DateTime<Utc>) {
        self.state = JobState::Cancelled;
        self.lease = None;
        self.finished_at = Some(now);
        self.updated_at = now;
    }

    /// Apply the consequence of the parent reaching `parent_state`.
    ///
    /// Returns false when the parent state has no effect on this job.
    pub fn follow_parent(&mut self, parent_state: JobState, now: DateTime<Utc>) -> bool {
        let Some(next) = parent_state.cascade_to_child() else {
            return false;
        };

        match next {
            JobState::Pending if self.state == JobState::WaitingForParentJob => {
                self.state = JobState::Pending;
            }
            JobState::ParentErrored | JobState::ParentCancelled if !self.state.is_terminal() => {
                self.state = next;
                self.lease = None;
                self.finished_at = Some(now);
            }
            _ => return false,
        }

        self.updated_at = now;
        true
    }

    /// Runner-visible view of the job, without the private payload.
    pub fn to_claimed(&self) -> Option<ClaimedJob> {
        let token = self.processing_token()?.clone();
        Some(ClaimedJob {
            id: self.id.clone(),
            job_type: self.job_type,
            payload: self.payload.clone(),
            priority: self.priority,
            token,
        })
    }

    /// Runner-visible listing entry for claimable jobs.
    pub fn to_available(&self) -> AvailableJob {
        AvailableJob {
            id: self.id.clone(),
            job_type: self.job_type,
            payload: self.payload.clone(),
            priority: self.priority,
            created_at: self.created_at,
        }
    }
}

fn truncate_message(message: &str) -> String {
    if message.chars().count() <= ERROR_MESSAGE_MAX_LEN {
        message.to_string()
    } else {
        message.chars().take(ERROR_MESSAGE_MAX_LEN).collect()
    }
}

/// A job handed to a runner by a successful claim.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ClaimedJob {
    pub id: JobId,
    pub job_type: JobType,
    pub payload: serde_json::Value,
    pub priority: i32,
    /// Token required on every call about this job
    pub token: ProcessingToken,
}

/// A claimable job as listed to runners.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AvailableJob {
    pub id: JobId,
    pub job_type: JobType,
    pub payload: serde_json::Value,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
}
