//! In-process notifications about job transitions.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use runq_models::{JobId, JobState, JobType, RunnerId};

/// Buffered events per subscriber before the slowest one starts lagging.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Something that happened to a job.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DispatchEvent {
    Enqueued {
        job_id: JobId,
        job_type: JobType,
        state: JobState,
    },
    Claimed {
        job_id: JobId,
        runner_id: RunnerId,
    },
    Updated {
        job_id: JobId,
        progress: Option<u8>,
        payload: Option<serde_json::Value>,
    },
    Completed {
        job_id: JobId,
        result: serde_json::Value,
    },
    Failed {
        job_id: JobId,
        message: String,
        failures: u32,
        requeued: bool,
    },
    Aborted {
        job_id: JobId,
        reason: String,
    },
    Cancelled {
        job_id: JobId,
    },
    /// A dependant followed its parent into `state`.
    Cascaded {
        job_id: JobId,
        parent_id: JobId,
        state: JobState,
    },
}

impl DispatchEvent {
    pub fn job_id(&self) -> &JobId {
        match self {
            DispatchEvent::Enqueued { job_id, .. }
            | DispatchEvent::Claimed { job_id, .. }
            | DispatchEvent::Updated { job_id, .. }
            | DispatchEvent::Completed { job_id, .. }
            | DispatchEvent::Failed { job_id, .. }
            | DispatchEvent::Aborted { job_id, .. }
            | DispatchEvent::Cancelled { job_id }
            | DispatchEvent::Cascaded { job_id, .. } => job_id,
        }
    }
}

/// Broadcast channel for dispatch events.
#[derive(Clone)]
pub struct EventChannel {
    tx: broadcast::Sender<DispatchEvent>,
}

impl Default for EventChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl EventChannel {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish an event. Having no subscriber is not an error.
    pub fn publish(&self, event: DispatchEvent) {
        trace!(job_id = %event.job_id(), "Publishing dispatch event");
        let _ = self.tx.send(event);
    }

    /// Subscribe to every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<DispatchEvent> {
        self.tx.subscribe()
    }
}
