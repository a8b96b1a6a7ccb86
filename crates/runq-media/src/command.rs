//! FFmpeg command builder and live runner.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::engine::{engine_channel, EngineControl, EngineExit, EngineHandle, LiveTranscodeRequest};
use crate::error::{MediaError, MediaResult};
use crate::hls::{segment_pattern, variant_playlist_pattern, MASTER_PLAYLIST};
use crate::probe::StreamProbe;

/// Stderr lines kept to explain a failed run.
const STDERR_TAIL_LINES: usize = 20;

const AUDIO_BITRATE: &str = "128k";

/// Builder for FFmpeg commands.
#[derive(Debug, Clone)]
pub struct FfmpegCommand {
    /// Input file path or URL
    input: String,
    /// Output file path or pattern
    output: String,
    /// Input arguments (before -i)
    input_args: Vec<String>,
    /// Output arguments (after -i)
    output_args: Vec<String>,
    /// Whether to overwrite output
    overwrite: bool,
    /// Log level
    log_level: String,
}

impl FfmpegCommand {
    /// Create a new FFmpeg command.
    pub fn new(input: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
            input_args: Vec::new(),
            output_args: Vec::new(),
            overwrite: true,
            log_level: "error".to_string(),
        }
    }

    /// Add input arguments (before -i).
    pub fn input_arg(mut self, arg: impl Into<String>) -> Self {
        self.input_args.push(arg.into());
        self
    }

    /// Add output arguments (after -i).
    pub fn output_arg(mut self, arg: impl Into<String>) -> Self {
        self.output_args.push(arg.into());
        self
    }

    /// Add multiple output arguments.
    pub fn output_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.output_args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Option applied to one output stream, e.g. `-b:v:1 800000`.
    pub fn stream_option(self, option: &str, specifier: &str, value: impl Into<String>) -> Self {
        self.output_arg(format!("-{}:{}", option, specifier))
            .output_arg(value)
    }

    /// Map an input stream.
    pub fn map(self, stream: impl Into<String>) -> Self {
        self.output_arg("-map").output_arg(stream)
    }

    /// Set video codec.
    pub fn video_codec(self, codec: impl Into<String>) -> Self {
        self.output_arg("-c:v").output_arg(codec)
    }

    /// Set audio codec.
    pub fn audio_codec(self, codec: impl Into<String>) -> Self {
        self.output_arg("-c:a").output_arg(codec)
    }

    /// Set preset.
    pub fn preset(self, preset: impl Into<String>) -> Self {
        self.output_arg("-preset").output_arg(preset)
    }

    /// Set log level.
    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    /// Build the command arguments.
    pub fn build_args(&self) -> Vec<String> {
        let mut args = Vec::new();

        if self.overwrite {
            args.push("-y".to_string());
        }

        args.push("-v".to_string());
        args.push(self.log_level.clone());

        args.extend(self.input_args.clone());

        args.push("-i".to_string());
        args.push(self.input.clone());

        args.extend(self.output_args.clone());

        args.push(self.output.clone());

        args
    }
}

/// Target video bitrate for an output height, capped by the source bitrate.
pub fn video_bitrate(height: u32, fps: f64, probe: &StreamProbe) -> u64 {
    let ratio = if probe.ratio > 0.0 { probe.ratio } else { 16.0 / 9.0 };
    let width = (height as f64 * ratio).round();
    // ~0.1 bit per pixel is enough for H.264 at live presets
    let estimate = (width * height as f64 * fps * 0.1) as u64;

    if probe.bitrate > 0 {
        estimate.min(probe.bitrate)
    } else {
        estimate
    }
}

/// Multi-variant HLS command for a live transcode.
///
/// Output `i` is written as `<i>.m3u8` with segments `<i>-<seq>.ts`, and the
/// master manifest lists every output.
pub fn live_hls_command(request: &LiveTranscodeRequest) -> MediaResult<FfmpegCommand> {
    let probe = &request.probe;
    if request.outputs.is_empty() {
        return Err(MediaError::invalid_stream("No output resolution requested"));
    }

    let dir = request.output_dir.to_string_lossy();
    let mut cmd = FfmpegCommand::new(
        request.input_url.clone(),
        format!("{}/{}", dir, variant_playlist_pattern()),
    );

    let mut video_index = 0usize;
    let mut audio_index = 0usize;
    let mut stream_map = Vec::with_capacity(request.outputs.len());

    for output in &request.outputs {
        let mut entry = Vec::with_capacity(2);

        if !output.is_audio_only() {
            if !probe.has_video {
                return Err(MediaError::invalid_stream(format!(
                    "{}p output requested but input has no video",
                    output.resolution
                )));
            }

            let fps = if output.fps > 0 { output.fps as f64 } else { probe.fps };
            let bitrate = video_bitrate(output.resolution, fps, probe);
            let gop = (fps * request.segment_duration as f64).round().max(1.0) as u64;
            let v = format!("v:{}", video_index);

            cmd = cmd
                .map("0:v:0")
                .stream_option("filter", &v, format!("scale=-2:{}", output.resolution))
                .stream_option("r", &v, format!("{}", fps))
                .stream_option("b", &v, bitrate.to_string())
                .stream_option("maxrate", &v, bitrate.to_string())
                .stream_option("bufsize", &v, (bitrate * 2).to_string())
                .stream_option("g", &v, gop.to_string());

            entry.push(v);
            video_index += 1;
        }

        if probe.has_audio {
            let a = format!("a:{}", audio_index);
            cmd = cmd
                .map("0:a:0")
                .stream_option("b", &a, AUDIO_BITRATE);
            entry.push(a);
            audio_index += 1;
        } else if output.is_audio_only() {
            return Err(MediaError::invalid_stream(
                "Audio-only output requested but input has no audio",
            ));
        }

        stream_map.push(entry.join(","));
    }

    let segment_file = format!("{}/{}", dir, segment_pattern());

    let cmd = cmd
        .video_codec("libx264")
        .preset("veryfast")
        .output_args(["-tune", "zerolatency", "-sc_threshold", "0"])
        .audio_codec("aac")
        .output_args(["-f", "hls"])
        .output_args(["-hls_time", &request.segment_duration.to_string()])
        .output_args(["-hls_list_size", &request.segment_list_size.to_string()])
        .output_args(["-hls_flags", "delete_segments+independent_segments"])
        .output_args(["-hls_segment_filename", &segment_file])
        .output_args(["-master_pl_name", MASTER_PLAYLIST])
        .output_args(["-var_stream_map", &stream_map.join(" ")]);

    Ok(cmd)
}

/// Runner for long-lived FFmpeg processes.
pub struct FfmpegRunner {
    /// Time allowed between SIGINT and kill
    stop_timeout: Duration,
}

impl Default for FfmpegRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl FfmpegRunner {
    /// Create a new runner.
    pub fn new() -> Self {
        Self {
            stop_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_stop_timeout(mut self, stop_timeout: Duration) -> Self {
        self.stop_timeout = stop_timeout;
        self
    }

    /// Spawn an FFmpeg command and supervise it in the background.
    pub fn spawn(&self, cmd: &FfmpegCommand) -> MediaResult<EngineHandle> {
        let ffmpeg = check_ffmpeg()?;

        let args = cmd.build_args();
        debug!("Running FFmpeg: ffmpeg {}", args.join(" "));

        let mut child = Command::new(ffmpeg)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| MediaError::internal("FFmpeg stderr not captured"))?;
        let mut reader = BufReader::new(stderr).lines();

        let stderr_task = tokio::spawn(async move {
            let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
            while let Ok(Some(line)) = reader.next_line().await {
                debug!(target: "ffmpeg", "{}", line);
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            tail
        });

        let (handle, control) = engine_channel();
        tokio::spawn(supervise(child, control, stderr_task, self.stop_timeout));

        Ok(handle)
    }
}

async fn supervise(
    mut child: Child,
    mut control: EngineControl,
    stderr_task: tokio::task::JoinHandle<VecDeque<String>>,
    stop_timeout: Duration,
) {
    let exit = tokio::select! {
        status = child.wait() => match status {
            Ok(status) if status.success() => EngineExit::Ended,
            Ok(status) => {
                let tail = stderr_task.await.unwrap_or_default();
                let stderr = Vec::from(tail).join("\n");
                EngineExit::Failed(format!("FFmpeg exited with {}: {}", status, stderr))
            }
            Err(e) => EngineExit::Failed(format!("Failed to wait for FFmpeg: {}", e)),
        },
        _ = control.stop_requested() => {
            interrupt(&mut child, stop_timeout).await;
            EngineExit::Stopped
        }
    };

    // a stop that raced a natural exit is still the executor's doing
    let exit = if control.is_stop_requested() && exit != EngineExit::Ended {
        EngineExit::Stopped
    } else {
        exit
    };

    control.finish(exit);
}

/// SIGINT lets FFmpeg finalize its manifests; kill if it lingers.
async fn interrupt(child: &mut Child, timeout: Duration) {
    if let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) {
        info!(pid, "Stopping FFmpeg");
        if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGINT) {
            warn!(pid, "Failed to interrupt FFmpeg: {}", e);
        }
    }

    if tokio::time::timeout(timeout, child.wait()).await.is_err() {
        warn!(
            "FFmpeg still running {} seconds after SIGINT, killing process",
            timeout.as_secs()
        );
        let _ = child.kill().await;
    }
}

/// Check if FFmpeg is available.
pub fn check_ffmpeg() -> MediaResult<PathBuf> {
    which::which("ffmpeg").map_err(|_| MediaError::FfmpegNotFound)
}

/// Check if FFprobe is available.
pub fn check_ffprobe() -> MediaResult<PathBuf> {
    which::which("ffprobe").map_err(|_| MediaError::FfprobeNotFound)
}
