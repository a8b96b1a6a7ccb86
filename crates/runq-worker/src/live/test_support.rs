//! Fakes for the live executor's collaborators.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use runq_media::{
    engine_channel, DirectoryWatcher, EngineControl, EngineExit, EngineHandle, FsEvent,
    LiveTranscodeRequest, LiveTranscoder, MediaError, MediaResult, StreamProbe, WatchFilter,
    WatchSubscription,
};
use runq_models::{
    ClaimedJob, JobType, LiveUpdatePayload, RegisterRunner, RunnerCredential, RunnerId,
    RunnerToken,
};

use crate::client::{JobAuth, JobServer, ServerError, ServerResult};

#[derive(Default)]
struct RecordingState {
    updates: Vec<LiveUpdatePayload>,
    update_attempts: u32,
    fail_next: u32,
    abandoned: bool,
    latency: HashMap<String, Duration>,
    success_calls: u32,
    errors: Vec<String>,
    aborts: Vec<String>,
}

/// Job server that records what it receives, in arrival order.
#[derive(Default)]
pub struct RecordingServer {
    state: Mutex<RecordingState>,
}

impl RecordingServer {
    /// Fail the next `n` update calls with a retryable error.
    pub fn fail_next_updates(&self, n: u32) {
        self.state.lock().unwrap().fail_next = n;
    }

    /// Answer every job call with NotProcessing from now on.
    pub fn abandon(&self) {
        self.state.lock().unwrap().abandoned = true;
    }

    /// Delay the update for chunk `name`.
    pub fn set_latency(&self, name: &str, latency: Duration) {
        self.state
            .lock()
            .unwrap()
            .latency
            .insert(name.to_string(), latency);
    }

    pub fn update_attempts(&self) -> u32 {
        self.state.lock().unwrap().update_attempts
    }

    pub fn updates(&self) -> Vec<LiveUpdatePayload> {
        self.state.lock().unwrap().updates.clone()
    }

    /// Added chunk names in the order they were accepted.
    pub fn chunk_names(&self) -> Vec<String> {
        self.updates()
            .iter()
            .filter(|u| u.is_add())
            .map(|u| u.chunk().video_chunk_filename.clone())
            .collect()
    }

    pub fn removed_names(&self) -> Vec<String> {
        self.updates()
            .iter()
            .filter(|u| !u.is_add())
            .map(|u| u.chunk().video_chunk_filename.clone())
            .collect()
    }

    pub fn success_calls(&self) -> u32 {
        self.state.lock().unwrap().success_calls
    }

    pub fn errors(&self) -> Vec<String> {
        self.state.lock().unwrap().errors.clone()
    }

    pub fn aborts(&self) -> Vec<String> {
        self.state.lock().unwrap().aborts.clone()
    }

    /// Wait until `n` updates were accepted.
    pub async fn wait_for_updates(&self, n: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.updates().len() < n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("updates did not arrive in time");
    }

    fn check_abandoned(&self) -> ServerResult<()> {
        if self.state.lock().unwrap().abandoned {
            Err(ServerError::NotProcessing)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl JobServer for RecordingServer {
    async fn register(&self, _request: RegisterRunner) -> ServerResult<RunnerCredential> {
        Ok(RunnerCredential {
            runner_id: RunnerId::new(),
            runner_token: RunnerToken::generate(),
        })
    }

    async fn claim(
        &self,
        _runner_token: &RunnerToken,
        _accepted_types: &[JobType],
    ) -> ServerResult<Option<ClaimedJob>> {
        Ok(None)
    }

    async fn update(
        &self,
        _job: &JobAuth,
        _progress: Option<u8>,
        payload: Option<serde_json::Value>,
    ) -> ServerResult<()> {
        let update: LiveUpdatePayload = payload
            .ok_or_else(|| ServerError::Request("missing payload".to_string()))
            .and_then(|p| {
                serde_json::from_value(p).map_err(|e| ServerError::Request(e.to_string()))
            })?;

        let latency = {
            let mut state = self.state.lock().unwrap();
            state.update_attempts += 1;
            if state.abandoned {
                return Err(ServerError::NotProcessing);
            }
            if state.fail_next > 0 {
                state.fail_next -= 1;
                return Err(ServerError::Request("connection reset".to_string()));
            }
            state.latency.get(&update.chunk().video_chunk_filename).copied()
        };

        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        self.state.lock().unwrap().updates.push(update);
        Ok(())
    }

    async fn success(&self, _job: &JobAuth, _result: serde_json::Value) -> ServerResult<()> {
        self.state.lock().unwrap().success_calls += 1;
        self.check_abandoned()
    }

    async fn error(&self, _job: &JobAuth, message: &str) -> ServerResult<()> {
        self.state.lock().unwrap().errors.push(message.to_string());
        self.check_abandoned()
    }

    async fn abort(&self, _job: &JobAuth, reason: &str) -> ServerResult<()> {
        self.state.lock().unwrap().aborts.push(reason.to_string());
        self.check_abandoned()
    }
}

/// Engine started by [`FakeTranscoder`], driven by the test.
pub struct FakeEngine {
    pub request: LiveTranscodeRequest,
    control: EngineControl,
}

impl FakeEngine {
    pub fn finish(self, exit: EngineExit) {
        self.control.finish(exit);
    }

    /// Exit with `Stopped` once the executor asks for it.
    pub fn stop_when_asked(self) {
        let mut control = self.control;
        tokio::spawn(async move {
            control.stop_requested().await;
            control.finish(EngineExit::Stopped);
        });
    }
}

pub fn probe() -> StreamProbe {
    StreamProbe {
        has_audio: true,
        has_video: true,
        bitrate: 3_000_000,
        width: 1280,
        height: 720,
        fps: 30.0,
        ratio: 16.0 / 9.0,
    }
}

/// Transcoder whose engine writes nothing on its own.
pub struct FakeTranscoder {
    fail_probe: bool,
    started: Mutex<Option<oneshot::Sender<FakeEngine>>>,
}

impl FakeTranscoder {
    pub fn new() -> (Self, oneshot::Receiver<FakeEngine>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                fail_probe: false,
                started: Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    pub fn failing_probe() -> Self {
        Self {
            fail_probe: true,
            started: Mutex::new(None),
        }
    }
}

#[async_trait]
impl LiveTranscoder for FakeTranscoder {
    async fn probe(&self, _input_url: &str) -> MediaResult<StreamProbe> {
        if self.fail_probe {
            return Err(MediaError::invalid_stream("connection refused"));
        }
        Ok(probe())
    }

    async fn start(&self, request: LiveTranscodeRequest) -> MediaResult<EngineHandle> {
        let started = self
            .started
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| MediaError::internal("engine already started"))?;

        let (handle, control) = engine_channel();
        let _ = started.send(FakeEngine { request, control });
        Ok(handle)
    }
}

/// Watcher fed by the test through a channel.
pub struct ChannelWatcher {
    events: Mutex<Option<mpsc::Receiver<FsEvent>>>,
}

impl ChannelWatcher {
    pub fn new() -> (Self, mpsc::Sender<FsEvent>) {
        let (tx, rx) = mpsc::channel(256);
        (
            Self {
                events: Mutex::new(Some(rx)),
            },
            tx,
        )
    }
}

#[async_trait]
impl DirectoryWatcher for ChannelWatcher {
    async fn subscribe(&self, _dir: &Path, _filter: WatchFilter) -> MediaResult<WatchSubscription> {
        let events = self
            .events
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| MediaError::internal("already subscribed"))?;
        Ok(WatchSubscription::from_channel(events))
    }
}
