//! Live transcoding engine abstraction.
//!
//! An engine transcodes one live input into an HLS output directory until the
//! input ends, it fails, or it is asked to stop. The executor only sees the
//! files it writes and a single exit notification.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{oneshot, watch};

use runq_models::OutputResolution;

use crate::command::{live_hls_command, FfmpegRunner};
use crate::error::MediaResult;
use crate::probe::{probe_stream, StreamProbe};

/// Everything needed to start a live transcode.
#[derive(Debug, Clone)]
pub struct LiveTranscodeRequest {
    pub input_url: String,
    /// Directory the manifests and segments are written to
    pub output_dir: PathBuf,
    pub outputs: Vec<OutputResolution>,
    /// Segment length in seconds
    pub segment_duration: u32,
    /// Segments kept in each rolling manifest
    pub segment_list_size: u32,
    pub probe: StreamProbe,
}

/// How an engine run finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineExit {
    /// Input ended and the engine exited cleanly
    Ended,
    /// Engine exited after [`EngineHandle::stop`]
    Stopped,
    /// Engine failed on its own
    Failed(String),
}

/// Caller side of a running engine.
///
/// Dropping the handle stops the engine.
pub struct EngineHandle {
    stop: watch::Sender<bool>,
    exit: oneshot::Receiver<EngineExit>,
    finished: Option<EngineExit>,
}

/// Engine side of a running engine.
pub struct EngineControl {
    stop: watch::Receiver<bool>,
    exit: oneshot::Sender<EngineExit>,
}

/// Create a connected handle/control pair.
pub fn engine_channel() -> (EngineHandle, EngineControl) {
    let (stop_tx, stop_rx) = watch::channel(false);
    let (exit_tx, exit_rx) = oneshot::channel();

    (
        EngineHandle {
            stop: stop_tx,
            exit: exit_rx,
            finished: None,
        },
        EngineControl {
            stop: stop_rx,
            exit: exit_tx,
        },
    )
}

impl EngineHandle {
    /// Ask the engine to stop. Idempotent.
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    pub fn stop_requested(&self) -> bool {
        *self.stop.borrow()
    }

    /// Wait for the engine to exit. Cancel safe, and returns the same exit
    /// again once it is known.
    pub async fn wait(&mut self) -> EngineExit {
        if let Some(exit) = &self.finished {
            return exit.clone();
        }

        let exit = match (&mut self.exit).await {
            Ok(exit) => exit,
            Err(_) => EngineExit::Failed("transcoding engine went away".to_string()),
        };
        self.finished = Some(exit.clone());
        exit
    }
}

impl EngineControl {
    /// Resolves once a stop was requested or the handle was dropped.
    pub async fn stop_requested(&mut self) {
        loop {
            if *self.stop.borrow_and_update() {
                return;
            }
            if self.stop.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn is_stop_requested(&self) -> bool {
        *self.stop.borrow()
    }

    /// Publish the exit.
    pub fn finish(self, exit: EngineExit) {
        let _ = self.exit.send(exit);
    }
}

/// A live transcoding engine.
#[async_trait]
pub trait LiveTranscoder: Send + Sync {
    /// Inspect the input to parametrize the transcode.
    async fn probe(&self, input_url: &str) -> MediaResult<StreamProbe>;

    /// Start transcoding `request.input_url` into `request.output_dir`.
    async fn start(&self, request: LiveTranscodeRequest) -> MediaResult<EngineHandle>;
}

/// FFmpeg-backed live engine.
#[derive(Debug, Clone)]
pub struct FfmpegLiveTranscoder {
    /// Time FFmpeg gets to exit after SIGINT before it is killed
    stop_timeout: Duration,
}

impl Default for FfmpegLiveTranscoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FfmpegLiveTranscoder {
    pub fn new() -> Self {
        Self {
            stop_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_stop_timeout(mut self, stop_timeout: Duration) -> Self {
        self.stop_timeout = stop_timeout;
        self
    }
}

#[async_trait]
impl LiveTranscoder for FfmpegLiveTranscoder {
    async fn probe(&self, input_url: &str) -> MediaResult<StreamProbe> {
        probe_stream(input_url).await
    }

    async fn start(&self, request: LiveTranscodeRequest) -> MediaResult<EngineHandle> {
        let cmd = live_hls_command(&request)?;
        FfmpegRunner::new()
            .with_stop_timeout(self.stop_timeout)
            .spawn(&cmd)
    }
}
