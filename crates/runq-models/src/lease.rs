//! Processing lease held by a runner while it owns a job.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use crate::runner::RunnerId;

/// Single-use secret correlating one claim of a job.
///
/// Every update/success/error call for the claimed job must present it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct ProcessingToken(pub String);

impl ProcessingToken {
    /// Generate a fresh token.
    pub fn generate() -> Self {
        Self(format!("rjt-{}", Uuid::new_v4()))
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProcessingToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Ownership of a PROCESSING job: owner id, opaque token, and the last time
/// the owner proved it was alive.
///
/// A lease has no fixed deadline. It expires once the owner has been silent
/// for longer than the staleness window of the job's family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Lease {
    /// Runner holding the job
    pub runner_id: RunnerId,
    /// Token handed out with the claim
    pub token: ProcessingToken,
    /// When the job was claimed
    pub acquired_at: DateTime<Utc>,
    /// Last accepted call from the owner
    pub renewed_at: DateTime<Utc>,
}

impl Lease {
    /// Grant a new lease to `runner_id`.
    pub fn grant(runner_id: RunnerId, now: DateTime<Utc>) -> Self {
        Self {
            runner_id,
            token: ProcessingToken::generate(),
            acquired_at: now,
            renewed_at: now,
        }
    }

    /// Whether `token` and `runner_id` match this lease.
    pub fn is_held_by(&self, token: &ProcessingToken, runner_id: &RunnerId) -> bool {
        &self.token == token && &self.runner_id == runner_id
    }

    /// Record a sign of life from the owner.
    pub fn renew(&mut self, now: DateTime<Utc>) {
        if now > self.renewed_at {
            self.renewed_at = now;
        }
    }

    /// Time since the owner was last heard from. Zero if `now` is in the past.
    pub fn silence(&self, now: DateTime<Utc>) -> Duration {
        (now - self.renewed_at).to_std().unwrap_or(Duration::ZERO)
    }

    /// Whether the owner has been silent for longer than `window`.
    pub fn is_stale(&self, now: DateTime<Utc>, window: Duration) -> bool {
        self.silence(now) > window
    }
}
