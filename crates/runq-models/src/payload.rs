//! Payloads exchanged for live RTMP to HLS transcoding jobs.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use url::Url;

/// Payload of a `live-rtmp-hls-transcoding` job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LiveRtmpHlsTranscodingPayload {
    pub input: LiveInput,
    pub output: LiveOutput,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LiveInput {
    /// Stream to pull
    pub rtmp_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LiveOutput {
    /// One entry per output rendition, in playlist index order
    pub to_transcode: Vec<OutputResolution>,
    /// Segment duration in seconds
    pub segment_duration: u32,
    /// Number of segments kept in each rolling playlist
    pub segment_list_size: u32,
}

/// One output rendition. Resolution `0` means audio only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct OutputResolution {
    pub resolution: u32,
    pub fps: u32,
}

impl OutputResolution {
    pub fn is_audio_only(&self) -> bool {
        self.resolution == 0
    }
}

impl LiveRtmpHlsTranscodingPayload {
    pub fn new(rtmp_url: impl Into<String>, to_transcode: Vec<OutputResolution>) -> Self {
        Self {
            input: LiveInput {
                rtmp_url: rtmp_url.into(),
            },
            output: LiveOutput {
                to_transcode,
                segment_duration: 2,
                segment_list_size: 15,
            },
        }
    }

    /// Validate the payload before enqueueing or running it.
    pub fn validate(&self) -> Result<(), String> {
        let url = Url::parse(&self.input.rtmp_url)
            .map_err(|e| format!("Invalid input URL: {}", e))?;

        if !matches!(url.scheme(), "rtmp" | "rtmps") {
            return Err(format!("Unsupported input scheme: {}", url.scheme()));
        }

        if self.output.to_transcode.is_empty() {
            return Err("At least one output resolution is required".to_string());
        }

        if self.output.segment_duration == 0 {
            return Err("Segment duration must be positive".to_string());
        }

        Ok(())
    }
}

/// Incremental update sent while a live job runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum LiveUpdatePayload {
    /// A segment is complete and can be published
    AddChunk(ChunkUpdate),
    /// The engine evicted a segment from its rolling window
    RemoveChunk(ChunkUpdate),
}

impl LiveUpdatePayload {
    pub fn chunk(&self) -> &ChunkUpdate {
        match self {
            LiveUpdatePayload::AddChunk(c) | LiveUpdatePayload::RemoveChunk(c) => c,
        }
    }

    pub fn is_add(&self) -> bool {
        matches!(self, LiveUpdatePayload::AddChunk(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ChunkUpdate {
    pub video_chunk_filename: String,

    /// Local path of the segment, only for additions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_chunk_file: Option<PathBuf>,

    /// Manifest snapshot, once every expected manifest exists
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub playlists: Option<PlaylistSnapshot>,
}

/// Manifest contents attached to a chunk update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistSnapshot {
    pub master_playlist_content: String,
    pub resolution_playlist_filename: String,
    /// Omitted when the manifest does not reference a complete segment yet
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution_playlist_content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolutions() -> Vec<OutputResolution> {
        vec![
            OutputResolution { resolution: 720, fps: 30 },
            OutputResolution { resolution: 0, fps: 0 },
        ]
    }

    #[test]
    fn test_payload_validation() {
        let payload = LiveRtmpHlsTranscodingPayload::new("rtmp://localhost/live/key", resolutions());
        assert!(payload.validate().is_ok());

        let http = LiveRtmpHlsTranscodingPayload::new("http://localhost/live", resolutions());
        assert!(http.validate().is_err());

        let garbage = LiveRtmpHlsTranscodingPayload::new("not a url", resolutions());
        assert!(garbage.validate().is_err());

        let empty = LiveRtmpHlsTranscodingPayload::new("rtmp://localhost/live/key", vec![]);
        assert!(empty.validate().is_err());
    }

    #[test]
    fn test_payload_wire_names() {
        let payload = LiveRtmpHlsTranscodingPayload::new("rtmp://localhost/live/key", resolutions());
        let json = serde_json::to_value(&payload).unwrap();

        assert_eq!(json["input"]["rtmpUrl"], "rtmp://localhost/live/key");
        assert_eq!(json["output"]["toTranscode"][1]["resolution"], 0);
        assert_eq!(json["output"]["segmentListSize"], 15);
    }

    #[test]
    fn test_update_payload_tagging() {
        let update = LiveUpdatePayload::AddChunk(ChunkUpdate {
            video_chunk_filename: "0-000001.ts".to_string(),
            video_chunk_file: Some(PathBuf::from("/tmp/job/0-000001.ts")),
            playlists: None,
        });

        let json = serde_json::to_value(&update).unwrap();
        assert_eq!(json["type"], "add-chunk");
        assert_eq!(json["videoChunkFilename"], "0-000001.ts");
        assert!(json.get("playlists").is_none());

        let back: LiveUpdatePayload = serde_json::from_value(json).unwrap();
        assert!(back.is_add());
        assert_eq!(back.chunk().video_chunk_filename, "0-000001.ts");
    }
}
