//! Job storage with atomic, conditionally-guarded transitions.
//!
//! Every state change goes through [`JobStore::transition`], which checks a
//! [`Precondition`] and applies a mutation as one atomic step. The job's own
//! state and lease act as the lock: no caller ever reads a job, decides, and
//! writes it back in separate steps.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use runq_models::{Job, JobId, JobState, JobType, ProcessingToken, RunnerId};

use crate::error::{DispatchError, DispatchResult};

/// Mutation applied to a job once its precondition holds.
pub type Mutation = Box<dyn FnOnce(&mut Job) + Send>;

/// Condition checked atomically with a mutation.
#[derive(Debug, Clone)]
pub enum Precondition {
    /// Job is in one of these states.
    StateIn(Vec<JobState>),
    /// Job is PROCESSING under this exact lease.
    LeaseHeld {
        token: ProcessingToken,
        runner_id: RunnerId,
    },
    /// Job is PROCESSING under this token and its owner has been silent
    /// for longer than `window` at `now`.
    LeaseStale {
        token: ProcessingToken,
        window: Duration,
        now: DateTime<Utc>,
    },
}

impl Precondition {
    pub fn state(state: JobState) -> Self {
        Self::StateIn(vec![state])
    }

    pub fn holds(&self, job: &Job) -> bool {
        match self {
            Precondition::StateIn(states) => states.contains(&job.state),
            Precondition::LeaseHeld { token, runner_id } => job.is_held_by(token, runner_id),
            Precondition::LeaseStale { token, window, now } => {
                job.state == JobState::Processing
                    && job
                        .lease
                        .as_ref()
                        .is_some_and(|l| &l.token == token && l.is_stale(*now, *window))
            }
        }
    }
}

/// Result of a guarded transition.
#[derive(Debug, Clone)]
pub enum Transition {
    /// Precondition held; the job as stored after the mutation.
    Applied(Job),
    /// Precondition failed; the job as currently stored.
    Rejected(Job),
    /// No job with that id.
    Missing,
}

/// Filter for listing jobs.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub states: Option<Vec<JobState>>,
    pub job_types: Option<Vec<JobType>>,
    pub limit: Option<usize>,
}

impl JobFilter {
    pub fn with_states(mut self, states: impl IntoIterator<Item = JobState>) -> Self {
        self.states = Some(states.into_iter().collect());
        self
    }

    pub fn with_job_types(mut self, job_types: impl IntoIterator<Item = JobType>) -> Self {
        self.job_types = Some(job_types.into_iter().collect());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.states.as_ref().map_or(true, |s| s.contains(&job.state))
            && self
                .job_types
                .as_ref()
                .map_or(true, |t| t.contains(&job.job_type))
    }
}

/// Durable job records.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new job. Fails if the id already exists.
    async fn insert(&self, job: Job) -> DispatchResult<()>;

    async fn get(&self, id: &JobId) -> DispatchResult<Option<Job>>;

    /// Jobs matching `filter`, newest first.
    async fn list(&self, filter: &JobFilter) -> DispatchResult<Vec<Job>>;

    /// PENDING jobs of the given types in claim order: priority ascending,
    /// then creation time ascending.
    async fn claim_candidates(
        &self,
        job_types: &[JobType],
        limit: usize,
    ) -> DispatchResult<Vec<Job>>;

    /// Direct children of `parent`, oldest first.
    async fn children_of(&self, parent: &JobId) -> DispatchResult<Vec<Job>>;

    /// Apply `mutation` iff `precondition` holds, atomically.
    async fn transition(
        &self,
        id: &JobId,
        precondition: &Precondition,
        mutation: Mutation,
    ) -> DispatchResult<Transition>;
}

struct StoredJob {
    /// Insertion order, breaks creation time ties
    seq: u64,
    job: Job,
}

#[derive(Default)]
struct MemoryState {
    jobs: HashMap<JobId, StoredJob>,
    next_seq: u64,
}

/// In-memory job store.
#[derive(Default)]
pub struct MemoryJobStore {
    state: RwLock<MemoryState>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, job: Job) -> DispatchResult<()> {
        let mut state = self.state.write().await;

        if state.jobs.contains_key(&job.id) {
            return Err(DispatchError::store(format!("Job {} already exists", job.id)));
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        state.jobs.insert(job.id.clone(), StoredJob { seq, job });
        Ok(())
    }

    async fn get(&self, id: &JobId) -> DispatchResult<Option<Job>> {
        let state = self.state.read().await;
        Ok(state.jobs.get(id).map(|s| s.job.clone()))
    }

    async fn list(&self, filter: &JobFilter) -> DispatchResult<Vec<Job>> {
        let state = self.state.read().await;

        let mut matching: Vec<&StoredJob> = state
            .jobs
            .values()
            .filter(|s| filter.matches(&s.job))
            .collect();
        matching.sort_by(|a, b| {
            b.job
                .created_at
                .cmp(&a.job.created_at)
                .then(b.seq.cmp(&a.seq))
        });

        let limit = filter.limit.unwrap_or(usize::MAX);
        Ok(matching.into_iter().take(limit).map(|s| s.job.clone()).collect())
    }

    async fn claim_candidates(
        &self,
        job_types: &[JobType],
        limit: usize,
    ) -> DispatchResult<Vec<Job>> {
        let state = self.state.read().await;

        let mut pending: Vec<&StoredJob> = state
            .jobs
            .values()
            .filter(|s| s.job.state == JobState::Pending && job_types.contains(&s.job.job_type))
            .collect();
        pending.sort_by(|a, b| {
            a.job
                .priority
                .cmp(&b.job.priority)
                .then(a.job.created_at.cmp(&b.job.created_at))
                .then(a.seq.cmp(&b.seq))
        });

        Ok(pending.into_iter().take(limit).map(|s| s.job.clone()).collect())
    }

    async fn children_of(&self, parent: &JobId) -> DispatchResult<Vec<Job>> {
        let state = self.state.read().await;

        let mut children: Vec<&StoredJob> = state
            .jobs
            .values()
            .filter(|s| s.job.depends_on.as_ref() == Some(parent))
            .collect();
        children.sort_by_key(|s| s.seq);

        Ok(children.into_iter().map(|s| s.job.clone()).collect())
    }

    async fn transition(
        &self,
        id: &JobId,
        precondition: &Precondition,
        mutation: Mutation,
    ) -> DispatchResult<Transition> {
        let mut state = self.state.write().await;

        let Some(stored) = state.jobs.get_mut(id) else {
            return Ok(Transition::Missing);
        };

        if !precondition.holds(&stored.job) {
            return Ok(Transition::Rejected(stored.job.clone()));
        }

        mutation(&mut stored.job);
        Ok(Transition::Applied(stored.job.clone()))
    }
}
