//! Shared data models for the runner job system.
//!
//! This crate provides Serde-serializable types for:
//! - Jobs, their states and lifecycle transitions
//! - Processing leases held by runners
//! - Runners and registration tokens
//! - Live transcoding payloads and incremental updates

pub mod job;
pub mod lease;
pub mod payload;
pub mod runner;

pub use job::{
    AvailableJob, ClaimedJob, FailureOutcome, Job, JobId, JobState, JobType, ParseJobTypeError,
    ERROR_MESSAGE_MAX_LEN,
};
pub use lease::{Lease, ProcessingToken};
pub use payload::{
    ChunkUpdate, LiveInput, LiveOutput, LiveRtmpHlsTranscodingPayload, LiveUpdatePayload,
    OutputResolution, PlaylistSnapshot,
};
pub use runner::{
    RegisterRunner, RegistrationToken, RegistrationTokenId, Runner, RunnerCredential, RunnerId,
    RunnerToken,
};
