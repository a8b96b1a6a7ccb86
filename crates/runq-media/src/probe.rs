//! FFprobe stream information.

use serde::{Deserialize, Serialize};
use std::process::Stdio;
use tokio::process::Command;

use crate::command::check_ffprobe;
use crate::error::{MediaError, MediaResult};

/// Live input stream information.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamProbe {
    pub has_audio: bool,
    pub has_video: bool,
    /// Bitrate in bits/second, `0` when unknown
    pub bitrate: u64,
    pub width: u32,
    pub height: u32,
    /// Frame rate (fps)
    pub fps: f64,
    /// Width over height, `0.0` without video
    pub ratio: f64,
}

/// FFprobe JSON output format.
#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    format: Option<FfprobeFormat>,
    #[serde(default)]
    streams: Vec<FfprobeStream>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    bit_rate: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: String,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    avg_frame_rate: Option<String>,
    bit_rate: Option<String>,
}

/// Probe a live input (RTMP URL or file) for stream information.
pub async fn probe_stream(input: &str) -> MediaResult<StreamProbe> {
    let ffprobe = check_ffprobe()?;

    let output = Command::new(ffprobe)
        .args([
            "-v",
            "quiet",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
        ])
        .arg(input)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await?;

    if !output.status.success() {
        return Err(MediaError::FfprobeFailed {
            message: format!("FFprobe failed on {}", input),
            stderr: Some(String::from_utf8_lossy(&output.stderr).to_string()),
        });
    }

    parse_probe_output(&output.stdout)
}

/// Parse `ffprobe -print_format json` output.
pub fn parse_probe_output(json: &[u8]) -> MediaResult<StreamProbe> {
    let probe: FfprobeOutput = serde_json::from_slice(json)?;

    let video = probe.streams.iter().find(|s| s.codec_type == "video");
    let audio = probe.streams.iter().find(|s| s.codec_type == "audio");

    if video.is_none() && audio.is_none() {
        return Err(MediaError::invalid_stream("No audio or video stream found"));
    }

    let width = video.and_then(|v| v.width).unwrap_or(0);
    let height = video.and_then(|v| v.height).unwrap_or(0);

    // Container bitrate first, then the video stream's own
    let bitrate = probe
        .format
        .as_ref()
        .and_then(|f| f.bit_rate.as_ref())
        .or_else(|| video.and_then(|v| v.bit_rate.as_ref()))
        .and_then(|b| b.parse::<u64>().ok())
        .unwrap_or(0);

    let fps = video
        .and_then(|v| v.avg_frame_rate.as_deref().and_then(parse_frame_rate))
        .or_else(|| video.and_then(|v| v.r_frame_rate.as_deref().and_then(parse_frame_rate)))
        .unwrap_or(if video.is_some() { 30.0 } else { 0.0 });

    let ratio = if height > 0 {
        width as f64 / height as f64
    } else {
        0.0
    };

    Ok(StreamProbe {
        has_audio: audio.is_some(),
        has_video: video.is_some(),
        bitrate,
        width,
        height,
        fps,
        ratio,
    })
}

/// Parse frame rate string (e.g., "30/1" or "29.97").
fn parse_frame_rate(s: &str) -> Option<f64> {
    let fps = match s.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.parse().ok()?;
            let den: f64 = den.parse().ok()?;
            if den <= 0.0 {
                return None;
            }
            num / den
        }
        None => s.parse().ok()?,
    };

    (fps > 0.0).then_some(fps)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_frame_rate() {
        assert_eq!(parse_frame_rate("30/1"), Some(30.0));
        assert!((parse_frame_rate("30000/1001").unwrap() - 29.97).abs() < 0.01);
        assert_eq!(parse_frame_rate("25"), Some(25.0));
        assert_eq!(parse_frame_rate("0/0"), None);
        assert_eq!(parse_frame_rate("abc"), None);
    }

    #[test]
    fn test_parse_audio_video_stream() {
        let json = br#"{
            "streams": [
                {"codec_type": "video", "width": 1920, "height": 1080, "avg_frame_rate": "60/1"},
                {"codec_type": "audio"}
            ],
            "format": {"bit_rate": "6000000"}
        }"#;

        let probe = tokio_test::assert_ok!(parse_probe_output(json));
        assert!(probe.has_audio);
        assert!(probe.has_video);
        assert_eq!(probe.bitrate, 6_000_000);
        assert_eq!((probe.width, probe.height), (1920, 1080));
        assert_eq!(probe.fps, 60.0);
        assert!((probe.ratio - 16.0 / 9.0).abs() < 1e-9);
    }

    #[test]
    fn test_parse_audio_only_stream() {
        let json = br#"{"streams": [{"codec_type": "audio", "bit_rate": "128000"}], "format": {}}"#;

        let probe = tokio_test::assert_ok!(parse_probe_output(json));
        assert!(probe.has_audio);
        assert!(!probe.has_video);
        assert_eq!(probe.bitrate, 0);
        assert_eq!(probe.ratio, 0.0);
        assert_eq!(probe.fps, 0.0);
    }

    #[test]
    fn test_parse_rejects_empty_stream() {
        let json = br#"{"streams": [{"codec_type": "data"}]}"#;
        assert!(matches!(
            parse_probe_output(json),
            Err(MediaError::InvalidStream(_))
        ));
    }
}
