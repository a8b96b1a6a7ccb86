//! Per-resolution send queue.
//!
//! Add-chunk updates for one resolution go through a single consumer, so
//! update N+1 is only sent once update N has resolved. Different resolutions
//! have independent queues.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use runq_models::LiveUpdatePayload;

use super::context::LiveJobContext;

pub struct ChunkQueue {
    resolution: usize,
    tx: mpsc::UnboundedSender<LiveUpdatePayload>,
    worker: JoinHandle<()>,
}

impl ChunkQueue {
    /// Start the worker for `resolution`.
    pub fn spawn(resolution: usize, ctx: Arc<LiveJobContext>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_worker(resolution, ctx, rx));

        Self {
            resolution,
            tx,
            worker,
        }
    }

    /// Queue an update behind every update pushed before it.
    pub fn push(&self, update: LiveUpdatePayload) {
        if self.tx.send(update).is_err() {
            warn!(resolution = self.resolution, "Chunk queue worker is gone, dropping update");
        }
    }

    /// Stop accepting updates and wait until the queued ones were sent.
    pub async fn drain(self) {
        drop(self.tx);
        if let Err(e) = self.worker.await {
            if !e.is_cancelled() {
                warn!(resolution = self.resolution, "Chunk queue worker panicked: {}", e);
            }
        }
    }

    /// Drop queued updates and stop the worker now.
    pub fn abort(self) {
        self.worker.abort();
    }
}

async fn run_worker(
    resolution: usize,
    ctx: Arc<LiveJobContext>,
    mut rx: mpsc::UnboundedReceiver<LiveUpdatePayload>,
) {
    while let Some(update) = rx.recv().await {
        if ctx.is_stopping() {
            debug!(resolution, "Job is over, discarding queued chunk");
            continue;
        }

        let filename = update.chunk().video_chunk_filename.clone();
        match ctx.send_update(&update).await {
            Ok(()) => debug!(resolution, chunk = %filename, "Chunk sent"),
            Err(e) => {
                ctx.logger()
                    .log_warning(&format!("Failed to send chunk {}: {}", filename, e));
                ctx.fail(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::JobAuth;
    use crate::live::test_support::RecordingServer;
    use crate::retry::RetryConfig;
    use runq_models::{ChunkUpdate, JobId, ProcessingToken, RunnerToken};
    use std::time::Duration;

    fn add(name: &str) -> LiveUpdatePayload {
        LiveUpdatePayload::AddChunk(ChunkUpdate {
            video_chunk_filename: name.to_string(),
            video_chunk_file: None,
            playlists: None,
        })
    }

    fn context(server: Arc<RecordingServer>) -> (Arc<LiveJobContext>, mpsc::UnboundedReceiver<crate::client::ServerError>) {
        LiveJobContext::new(
            server,
            JobAuth {
                job_id: JobId::new(),
                token: ProcessingToken::generate(),
                runner_token: RunnerToken::generate(),
            },
            RetryConfig::fixed("update", 2, Duration::from_millis(1)),
        )
    }

    #[tokio::test]
    async fn test_sends_in_push_order_despite_latency() {
        let server = Arc::new(RecordingServer::default());
        server.set_latency("0-000000.ts", Duration::from_millis(40));
        server.set_latency("0-000001.ts", Duration::from_millis(20));
        let (ctx, _rx) = context(server.clone());

        let queue = ChunkQueue::spawn(0, ctx);
        for name in ["0-000000.ts", "0-000001.ts", "0-000002.ts"] {
            queue.push(add(name));
        }
        queue.drain().await;

        assert_eq!(
            server.chunk_names(),
            vec!["0-000000.ts", "0-000001.ts", "0-000002.ts"]
        );
    }

    #[tokio::test]
    async fn test_resolutions_are_independent() {
        let server = Arc::new(RecordingServer::default());
        server.set_latency("0-000000.ts", Duration::from_millis(50));
        let (ctx, _rx) = context(server.clone());

        let slow = ChunkQueue::spawn(0, ctx.clone());
        let fast = ChunkQueue::spawn(1, ctx);
        slow.push(add("0-000000.ts"));
        fast.push(add("1-000000.ts"));
        fast.drain().await;

        // resolution 1 did not wait behind resolution 0
        assert_eq!(server.chunk_names(), vec!["1-000000.ts"]);
        slow.drain().await;
        assert_eq!(server.chunk_names(), vec!["1-000000.ts", "0-000000.ts"]);
    }

    #[tokio::test]
    async fn test_terminal_failure_is_reported_and_rest_discarded() {
        let server = Arc::new(RecordingServer::default());
        server.abandon();
        let (ctx, mut failures) = context(server.clone());

        let queue = ChunkQueue::spawn(0, ctx.clone());
        queue.push(add("0-000000.ts"));

        let failure = failures.recv().await.unwrap();
        assert!(failure.is_not_processing());

        assert!(ctx.mark_errored());
        queue.push(add("0-000001.ts"));
        queue.drain().await;
        assert_eq!(server.update_attempts(), 1);
    }
}
