//! Live media plumbing for runners.
//!
//! This crate provides:
//! - The live transcoding engine trait and its FFmpeg implementation
//! - FFmpeg command building with SIGINT-first shutdown
//! - FFprobe stream inspection
//! - HLS output naming and manifest trimming
//! - Output directory watching

pub mod command;
pub mod engine;
pub mod error;
pub mod hls;
pub mod probe;
pub mod watch;

pub use command::{check_ffmpeg, check_ffprobe, live_hls_command, FfmpegCommand, FfmpegRunner};
pub use engine::{
    engine_channel, EngineControl, EngineExit, EngineHandle, FfmpegLiveTranscoder,
    LiveTranscodeRequest, LiveTranscoder,
};
pub use error::{MediaError, MediaResult};
pub use probe::{parse_probe_output, probe_stream, StreamProbe};
pub use watch::{DirectoryWatcher, FsEvent, FsEventKind, PollingWatcher, WatchFilter, WatchSubscription};
