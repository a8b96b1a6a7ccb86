//! Enqueue requests.

use runq_models::{JobId, JobType, LiveRtmpHlsTranscodingPayload};
use serde::{Deserialize, Serialize};

/// Request to create a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueJob {
    /// Job type
    pub job_type: JobType,
    /// Payload sent to the runner
    pub payload: serde_json::Value,
    /// Payload kept on the server
    #[serde(default)]
    pub private_payload: serde_json::Value,
    /// Lower runs first
    #[serde(default)]
    pub priority: i32,
    /// Parent that must complete first
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<JobId>,
}

impl EnqueueJob {
    pub fn new(job_type: JobType, payload: serde_json::Value) -> Self {
        Self {
            job_type,
            payload,
            private_payload: serde_json::Value::Null,
            priority: 0,
            depends_on: None,
        }
    }

    /// Create a live transcoding job.
    pub fn live(payload: &LiveRtmpHlsTranscodingPayload) -> Result<Self, String> {
        payload.validate()?;
        let payload = serde_json::to_value(payload).map_err(|e| e.to_string())?;
        Ok(Self::new(JobType::LiveRtmpHlsTranscoding, payload))
    }

    pub fn with_private_payload(mut self, private_payload: serde_json::Value) -> Self {
        self.private_payload = private_payload;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn depends_on(mut self, parent: JobId) -> Self {
        self.depends_on = Some(parent);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runq_models::OutputResolution;

    #[test]
    fn test_live_job_validates_payload() {
        let valid = LiveRtmpHlsTranscodingPayload::new(
            "rtmp://localhost:1935/live/abc",
            vec![OutputResolution { resolution: 480, fps: 30 }],
        );
        let job = tokio_test::assert_ok!(EnqueueJob::live(&valid));
        assert_eq!(job.job_type, JobType::LiveRtmpHlsTranscoding);
        assert_eq!(job.payload["input"]["rtmpUrl"], "rtmp://localhost:1935/live/abc");

        let invalid = LiveRtmpHlsTranscodingPayload::new("ftp://nope", vec![]);
        tokio_test::assert_err!(EnqueueJob::live(&invalid));
    }
}
