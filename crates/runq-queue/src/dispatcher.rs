//! Job dispatcher.
//!
//! Runners pull work with [`Dispatcher::claim`] and report back with
//! progress, success, error or abort calls that must present the job's
//! processing token. All state changes are conditional transitions on the
//! [`JobStore`], so concurrent runners and the watchdog never overwrite each
//! other.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use runq_models::{
    AvailableJob, ClaimedJob, FailureOutcome, Job, JobId, JobState, JobType, ProcessingToken,
    RunnerToken,
};

use crate::error::{DispatchError, DispatchResult};
use crate::events::{DispatchEvent, EventChannel};
use crate::job::EnqueueJob;
use crate::metrics;
use crate::registry::RunnerRegistry;
use crate::store::{JobFilter, JobStore, MemoryJobStore, Mutation, Precondition, Transition};

/// Failures after which a job is terminally ERRORED.
pub const DEFAULT_MAX_FAILURES: u32 = 5;

/// Message recorded when the watchdog reclaims a job.
pub const STALLED_MESSAGE: &str = "stalled";

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Failure budget per job
    pub max_failures: u32,
    /// Candidates fetched per claim round
    pub claim_batch: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_failures: DEFAULT_MAX_FAILURES,
            claim_batch: 16,
        }
    }
}

impl DispatcherConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            max_failures: std::env::var("RUNQ_MAX_FAILURES")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(DEFAULT_MAX_FAILURES),
            claim_batch: std::env::var("RUNQ_CLAIM_BATCH")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(16),
        }
    }
}

/// Central job dispatcher.
pub struct Dispatcher {
    store: Arc<dyn JobStore>,
    registry: Arc<RunnerRegistry>,
    events: EventChannel,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: Arc<RunnerRegistry>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            store,
            registry,
            events: EventChannel::new(),
            config,
        }
    }

    /// Dispatcher backed by an in-memory store and a fresh registry.
    pub fn in_memory(config: DispatcherConfig) -> Self {
        Self::new(
            Arc::new(MemoryJobStore::new()),
            Arc::new(RunnerRegistry::new()),
            config,
        )
    }

    pub fn registry(&self) -> &Arc<RunnerRegistry> {
        &self.registry
    }

    pub fn events(&self) -> &EventChannel {
        &self.events
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Create a job.
    ///
    /// A job with a parent is only claimable once the parent completes. If
    /// the parent already reached a terminal state the child starts in the
    /// state that parent implies.
    pub async fn enqueue(&self, request: EnqueueJob) -> DispatchResult<JobId> {
        let mut job = Job::new(request.job_type, request.payload)
            .with_private_payload(request.private_payload)
            .with_priority(request.priority);

        let parent = match request.depends_on {
            Some(parent_id) => {
                let parent = self
                    .store
                    .get(&parent_id)
                    .await?
                    .ok_or_else(|| DispatchError::not_found(&parent_id))?;

                let initial = parent
                    .state
                    .cascade_to_child()
                    .unwrap_or(JobState::WaitingForParentJob);
                job = job.with_parent(parent_id, initial);
                if initial.is_terminal() {
                    job.finished_at = Some(job.created_at);
                }
                Some(parent)
            }
            None => None,
        };

        let id = job.id.clone();
        let (job_type, state) = (job.job_type, job.state);
        self.store.insert(job).await?;

        // The parent may have resolved between the read above and the insert.
        if let (Some(parent), JobState::WaitingForParentJob) = (parent, state) {
            if let Some(current) = self.store.get(&parent.id).await? {
                if current.state.cascade_to_child().is_some() {
                    self.cascade(&current).await?;
                }
            }
        }

        info!(job_id = %id, job_type = %job_type, state = %state, "Enqueued job");
        metrics::record_enqueued(job_type);
        self.events.publish(DispatchEvent::Enqueued {
            job_id: id.clone(),
            job_type,
            state,
        });

        Ok(id)
    }

    /// Claim the next PENDING job among `accepted_types`.
    ///
    /// Candidates are tried in claim order; losing a race to another runner
    /// moves on to the next candidate. Returns `None` when nothing is
    /// claimable.
    pub async fn claim(
        &self,
        runner_token: &RunnerToken,
        accepted_types: &[JobType],
    ) -> DispatchResult<Option<ClaimedJob>> {
        let runner = self.registry.authenticate(runner_token).await?;

        if accepted_types.is_empty() {
            return Ok(None);
        }

        loop {
            let candidates = self
                .store
                .claim_candidates(accepted_types, self.config.claim_batch)
                .await?;

            if candidates.is_empty() {
                return Ok(None);
            }

            for candidate in candidates {
                let runner_id = runner.id.clone();
                let result = self
                    .store
                    .transition(
                        &candidate.id,
                        &Precondition::state(JobState::Pending),
                        Box::new(move |job: &mut Job| {
                            job.begin_processing(runner_id, Utc::now());
                        }),
                    )
                    .await?;

                match result {
                    Transition::Applied(job) => {
                        self.on_claimed(&job);
                        return Ok(job.to_claimed());
                    }
                    _ => {
                        debug!(job_id = %candidate.id, "Lost claim race, trying next candidate");
                    }
                }
            }
        }
    }

    /// Claimable jobs among `accepted_types`, in claim order.
    pub async fn list_available(
        &self,
        runner_token: &RunnerToken,
        accepted_types: &[JobType],
        limit: usize,
    ) -> DispatchResult<Vec<AvailableJob>> {
        self.registry.touch(runner_token).await?;

        let jobs = self.store.claim_candidates(accepted_types, limit).await?;
        Ok(jobs.iter().map(Job::to_available).collect())
    }

    /// Claim a specific job picked from [`Dispatcher::list_available`].
    pub async fn accept(
        &self,
        runner_token: &RunnerToken,
        job_id: &JobId,
    ) -> DispatchResult<ClaimedJob> {
        let runner = self.registry.authenticate(runner_token).await?;
        let runner_id = runner.id.clone();

        let result = self
            .store
            .transition(
                job_id,
                &Precondition::state(JobState::Pending),
                Box::new(move |job: &mut Job| {
                    job.begin_processing(runner_id, Utc::now());
                }),
            )
            .await?;

        match result {
            Transition::Applied(job) => {
                self.on_claimed(&job);
                job.to_claimed()
                    .ok_or_else(|| DispatchError::store("claimed job has no lease"))
            }
            Transition::Rejected(_) => Err(DispatchError::NotPending(job_id.to_string())),
            Transition::Missing => Err(DispatchError::not_found(job_id)),
        }
    }

    fn on_claimed(&self, job: &Job) {
        if let Some(runner_id) = &job.runner_id {
            info!(job_id = %job.id, runner_id = %runner_id, job_type = %job.job_type, "Job claimed");
            self.events.publish(DispatchEvent::Claimed {
                job_id: job.id.clone(),
                runner_id: runner_id.clone(),
            });
        }
        metrics::record_claimed(job.job_type);
    }

    /// Progress report from the job owner; renews the lease.
    pub async fn report_progress(
        &self,
        job_id: &JobId,
        job_token: &ProcessingToken,
        runner_token: &RunnerToken,
        progress: Option<u8>,
        payload: Option<serde_json::Value>,
    ) -> DispatchResult<()> {
        if progress.is_some_and(|p| p > 100) {
            return Err(DispatchError::invalid_input("Progress must be between 0 and 100"));
        }

        self.owned_transition(
            job_id,
            job_token,
            runner_token,
            Box::new(move |job: &mut Job| job.renew(progress, Utc::now())),
        )
        .await?;

        debug!(job_id = %job_id, progress = ?progress, "Job updated");
        self.events.publish(DispatchEvent::Updated {
            job_id: job_id.clone(),
            progress,
            payload,
        });

        Ok(())
    }

    /// The owner finished the job.
    pub async fn report_success(
        &self,
        job_id: &JobId,
        job_token: &ProcessingToken,
        runner_token: &RunnerToken,
        result: serde_json::Value,
    ) -> DispatchResult<()> {
        let job = self
            .owned_transition(
                job_id,
                job_token,
                runner_token,
                Box::new(|job: &mut Job| job.complete(Utc::now())),
            )
            .await?;

        info!(job_id = %job_id, job_type = %job.job_type, "Job completed");
        metrics::record_completed(job.job_type);
        self.events.publish(DispatchEvent::Completed {
            job_id: job_id.clone(),
            result,
        });

        let released = self.cascade(&job).await?;
        if released > 0 {
            info!(job_id = %job_id, "Released {} dependent jobs", released);
        }

        Ok(())
    }

    /// The owner failed the job.
    ///
    /// Under the failure budget the job goes back to PENDING for any runner;
    /// at the budget it is ERRORED and its dependants are failed with it.
    pub async fn report_error(
        &self,
        job_id: &JobId,
        job_token: &ProcessingToken,
        runner_token: &RunnerToken,
        message: &str,
    ) -> DispatchResult<FailureOutcome> {
        let max_failures = self.config.max_failures;
        let owned_message = message.to_string();

        let job = self
            .owned_transition(
                job_id,
                job_token,
                runner_token,
                Box::new(move |job: &mut Job| {
                    job.record_failure(&owned_message, max_failures, Utc::now());
                }),
            )
            .await?;

        self.after_failure(&job, message).await
    }

    /// The owner gives the job back without counting a failure.
    pub async fn abort(
        &self,
        job_id: &JobId,
        job_token: &ProcessingToken,
        runner_token: &RunnerToken,
        reason: &str,
    ) -> DispatchResult<()> {
        self.owned_transition(
            job_id,
            job_token,
            runner_token,
            Box::new(|job: &mut Job| job.reset_to_pending(Utc::now())),
        )
        .await?;

        warn!(job_id = %job_id, reason = %reason, "Job aborted by runner");
        self.events.publish(DispatchEvent::Aborted {
            job_id: job_id.clone(),
            reason: reason.to_string(),
        });

        Ok(())
    }

    /// Cancel a job and its dependants. Returns the number of jobs affected.
    pub async fn cancel(&self, job_id: &JobId) -> DispatchResult<usize> {
        let result = self
            .store
            .transition(
                job_id,
                &Precondition::StateIn(cancellable_states()),
                Box::new(|job: &mut Job| job.cancel(Utc::now())),
            )
            .await?;

        match result {
            Transition::Applied(job) => self.on_cancelled(&job).await,
            Transition::Rejected(_) => Err(DispatchError::NotCancellable(job_id.to_string())),
            Transition::Missing => Err(DispatchError::not_found(job_id)),
        }
    }

    /// Cancel every cancellable job of `job_type`. Returns the number of jobs
    /// affected, dependants included.
    pub async fn cancel_all_of_type(&self, job_type: JobType) -> DispatchResult<usize> {
        let filter = JobFilter::default()
            .with_states(cancellable_states())
            .with_job_types([job_type]);

        let mut affected = 0;
        for job in self.store.list(&filter).await? {
            let result = self
                .store
                .transition(
                    &job.id,
                    &Precondition::StateIn(cancellable_states()),
                    Box::new(|job: &mut Job| job.cancel(Utc::now())),
                )
                .await?;

            // Jobs that moved on since the listing are skipped.
            if let Transition::Applied(job) = result {
                affected += self.on_cancelled(&job).await?;
            }
        }

        info!(job_type = %job_type, "Cancelled {} jobs", affected);
        Ok(affected)
    }

    async fn on_cancelled(&self, job: &Job) -> DispatchResult<usize> {
        info!(job_id = %job.id, "Job cancelled");
        self.events.publish(DispatchEvent::Cancelled {
            job_id: job.id.clone(),
        });

        let affected = 1 + self.cascade(job).await?;
        metrics::record_cancelled(affected);
        Ok(affected)
    }

    pub async fn get(&self, job_id: &JobId) -> DispatchResult<Job> {
        self.store
            .get(job_id)
            .await?
            .ok_or_else(|| DispatchError::not_found(job_id))
    }

    pub async fn list(&self, filter: &JobFilter) -> DispatchResult<Vec<Job>> {
        self.store.list(filter).await
    }

    /// Fail a job whose owner went silent, exactly as a reported error
    /// would.
    ///
    /// The transition only applies if the job is still held under `token`
    /// and still stale at `now`; returns `None` when the owner got back in
    /// touch or the job moved on.
    pub async fn fail_stalled(
        &self,
        job_id: &JobId,
        token: &ProcessingToken,
        window: Duration,
        now: DateTime<Utc>,
    ) -> DispatchResult<Option<FailureOutcome>> {
        let max_failures = self.config.max_failures;
        let precondition = Precondition::LeaseStale {
            token: token.clone(),
            window,
            now,
        };

        let result = self
            .store
            .transition(
                job_id,
                &precondition,
                Box::new(move |job: &mut Job| {
                    job.record_failure(STALLED_MESSAGE, max_failures, now);
                }),
            )
            .await?;

        match result {
            Transition::Applied(job) => {
                metrics::record_stalled(job.job_type);
                self.after_failure(&job, STALLED_MESSAGE).await.map(Some)
            }
            Transition::Rejected(_) | Transition::Missing => Ok(None),
        }
    }

    async fn after_failure(&self, job: &Job, message: &str) -> DispatchResult<FailureOutcome> {
        let terminal = job.state == JobState::Errored;
        metrics::record_failed(job.job_type, terminal);
        self.events.publish(DispatchEvent::Failed {
            job_id: job.id.clone(),
            message: message.to_string(),
            failures: job.failures,
            requeued: !terminal,
        });

        if terminal {
            warn!(
                job_id = %job.id,
                failures = job.failures,
                "Job errored after exhausting its failure budget: {}", message
            );
            let failed = self.cascade(job).await?;
            if failed > 0 {
                warn!(job_id = %job.id, "Failed {} dependent jobs", failed);
            }
            Ok(FailureOutcome::Errored {
                failures: job.failures,
            })
        } else {
            info!(
                job_id = %job.id,
                failures = job.failures,
                "Job failed, requeued: {}", message
            );
            Ok(FailureOutcome::Requeued {
                failures: job.failures,
            })
        }
    }

    async fn owned_transition(
        &self,
        job_id: &JobId,
        job_token: &ProcessingToken,
        runner_token: &RunnerToken,
        mutation: Mutation,
    ) -> DispatchResult<Job> {
        let runner = self.registry.authenticate(runner_token).await?;

        let precondition = Precondition::LeaseHeld {
            token: job_token.clone(),
            runner_id: runner.id,
        };

        match self.store.transition(job_id, &precondition, mutation).await? {
            Transition::Applied(job) => Ok(job),
            Transition::Rejected(current) => {
                debug!(job_id = %job_id, state = %current.state, "Rejected call from non-owner");
                Err(DispatchError::not_processing(job_id))
            }
            Transition::Missing => Err(DispatchError::not_found(job_id)),
        }
    }

    /// Propagate `parent`'s state to its dependants, transitively for
    /// failures. Returns the number of jobs moved.
    async fn cascade(&self, parent: &Job) -> DispatchResult<usize> {
        let mut affected = 0;
        let mut frontier = VecDeque::from([(parent.id.clone(), parent.state)]);

        while let Some((parent_id, parent_state)) = frontier.pop_front() {
            let Some(child_state) = parent_state.cascade_to_child() else {
                continue;
            };

            let eligible = if child_state == JobState::Pending {
                Precondition::state(JobState::WaitingForParentJob)
            } else {
                Precondition::StateIn(cancellable_states())
            };

            for child in self.store.children_of(&parent_id).await? {
                let now = Utc::now();
                let result = self
                    .store
                    .transition(
                        &child.id,
                        &eligible,
                        Box::new(move |job: &mut Job| {
                            job.follow_parent(parent_state, now);
                        }),
                    )
                    .await?;

                if let Transition::Applied(child) = result {
                    affected += 1;
                    debug!(job_id = %child.id, parent_id = %parent_id, state = %child.state, "Cascaded parent state");
                    self.events.publish(DispatchEvent::Cascaded {
                        job_id: child.id.clone(),
                        parent_id: parent_id.clone(),
                        state: child.state,
                    });

                    if child.state.is_terminal() {
                        frontier.push_back((child.id, child.state));
                    }
                }
            }
        }

        Ok(affected)
    }
}

fn cancellable_states() -> Vec<JobState> {
    vec![
        JobState::Pending,
        JobState::WaitingForParentJob,
        JobState::Processing,
    ]
}
