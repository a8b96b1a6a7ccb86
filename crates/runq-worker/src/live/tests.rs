use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use runq_media::{EngineExit, FsEvent, FsEventKind};
use runq_models::{
    JobId, LiveRtmpHlsTranscodingPayload, OutputResolution, ProcessingToken, RunnerToken,
};

use super::test_support::{ChannelWatcher, FakeEngine, FakeTranscoder, RecordingServer};
use super::*;

struct Harness {
    server: Arc<RecordingServer>,
    events: mpsc::Sender<FsEvent>,
    cancel: watch::Sender<bool>,
    started: Option<oneshot::Receiver<FakeEngine>>,
    execution: JoinHandle<ExecutionOutcome>,
    transcoding_dir: tempfile::TempDir,
}

fn payload(outputs: usize) -> serde_json::Value {
    let resolutions = [720, 480, 360];
    let payload = LiveRtmpHlsTranscodingPayload::new(
        "rtmp://localhost:1935/live/key",
        resolutions
            .iter()
            .take(outputs)
            .map(|r| OutputResolution { resolution: *r, fps: 30 })
            .collect(),
    );
    serde_json::to_value(payload).unwrap()
}

fn start_with(transcoder: FakeTranscoder, started: Option<oneshot::Receiver<FakeEngine>>, payload: serde_json::Value) -> Harness {
    let server = Arc::new(RecordingServer::default());
    let (watcher, events) = ChannelWatcher::new();
    let (cancel, cancel_rx) = watch::channel(false);
    let transcoding_dir = tempfile::tempdir().unwrap();

    let executor = LiveTranscodingExecutor::new(
        server.clone(),
        Arc::new(transcoder),
        Arc::new(watcher),
        LiveSettings {
            transcoding_dir: transcoding_dir.path().to_path_buf(),
            end_grace: Duration::from_millis(50),
            retry: RetryConfig::fixed("test", 2, Duration::from_millis(1)),
            engine_stop_timeout: Duration::from_millis(500),
        },
    );
    let auth = JobAuth {
        job_id: JobId::new(),
        token: ProcessingToken::generate(),
        runner_token: RunnerToken::generate(),
    };

    let execution = tokio::spawn(async move { executor.execute(auth, payload, cancel_rx).await });

    Harness {
        server,
        events,
        cancel,
        started,
        execution,
        transcoding_dir,
    }
}

fn start(outputs: usize) -> Harness {
    let (transcoder, started) = FakeTranscoder::new();
    start_with(transcoder, Some(started), payload(outputs))
}

impl Harness {
    async fn engine(&mut self) -> FakeEngine {
        let started = self.started.take().expect("engine already taken");
        tokio::time::timeout(Duration::from_secs(5), started)
            .await
            .unwrap()
            .unwrap()
    }

    async fn outcome(self) -> (ExecutionOutcome, Arc<RecordingServer>, tempfile::TempDir) {
        let outcome = tokio::time::timeout(Duration::from_secs(5), self.execution)
            .await
            .unwrap()
            .unwrap();
        drop(self.events);
        (outcome, self.server, self.transcoding_dir)
    }

    async fn emit(&self, kind: FsEventKind, path: impl AsRef<Path>) {
        self.events
            .send(FsEvent::new(kind, path.as_ref()))
            .await
            .unwrap();
    }
}

fn media_playlist(resolution: usize, segments: &[u32], ended: bool) -> String {
    let mut content = String::from("#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:2\n#EXT-X-MEDIA-SEQUENCE:0\n");
    for seq in segments {
        content.push_str(&format!("#EXTINF:2.000000,\n{}-{:06}.ts\n", resolution, seq));
    }
    if ended {
        content.push_str("#EXT-X-ENDLIST\n");
    }
    content
}

async fn write_master(dir: &Path) {
    tokio::fs::write(dir.join("master.m3u8"), "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=800000\n0.m3u8\n")
        .await
        .unwrap();
}

async fn write_segment(dir: &Path, resolution: usize, seq: u32) -> std::path::PathBuf {
    let path = dir.join(format!("{}-{:06}.ts", resolution, seq));
    tokio::fs::write(&path, b"segment").await.unwrap();
    path
}

fn is_empty_dir(dir: &Path) -> bool {
    std::fs::read_dir(dir).unwrap().next().is_none()
}

#[tokio::test]
async fn test_chunks_sent_in_order_with_trimmed_playlists() {
    let mut h = start(1);
    let engine = h.engine().await;
    let dir = engine.request.output_dir.clone();

    write_master(&dir).await;
    tokio::fs::write(dir.join("0.m3u8"), media_playlist(0, &[0, 1, 2], false))
        .await
        .unwrap();
    h.emit(FsEventKind::Created, dir.join("master.m3u8")).await;
    h.emit(FsEventKind::Created, dir.join("0.m3u8")).await;
    for seq in 0..3 {
        let path = write_segment(&dir, 0, seq).await;
        h.emit(FsEventKind::Created, path).await;
    }
    h.server.wait_for_updates(2).await;

    // engine finalizes the manifest and exits
    tokio::fs::write(dir.join("0.m3u8"), media_playlist(0, &[0, 1, 2], true))
        .await
        .unwrap();
    h.emit(FsEventKind::Changed, dir.join("0.m3u8")).await;
    engine.finish(EngineExit::Ended);

    let (outcome, server, transcoding_dir) = h.outcome().await;
    assert_eq!(outcome, ExecutionOutcome::Completed);
    assert_eq!(
        server.chunk_names(),
        vec!["0-000000.ts", "0-000001.ts", "0-000002.ts"]
    );

    let updates = server.updates();
    let content = |i: usize| {
        updates[i]
            .chunk()
            .playlists
            .as_ref()
            .and_then(|p| p.resolution_playlist_content.clone())
            .unwrap()
    };
    // never the tail entry before the end
    assert!(content(0).ends_with("0-000000.ts\n"));
    assert!(!content(0).contains("0-000001.ts"));
    assert!(!content(1).contains("0-000002.ts"));
    // after the end: marker and every segment
    assert!(content(2).contains("#EXT-X-ENDLIST"));
    assert!(content(2).contains("0-000002.ts"));

    let snapshot = updates[0].chunk().playlists.as_ref().unwrap();
    assert_eq!(snapshot.resolution_playlist_filename, "0.m3u8");
    assert!(snapshot.master_playlist_content.starts_with("#EXTM3U"));
    assert!(updates[0].chunk().video_chunk_file.is_some());

    assert_eq!(server.success_calls(), 1);
    assert!(server.errors().is_empty());
    assert!(is_empty_dir(transcoding_dir.path()));
}

#[tokio::test]
async fn test_chunks_before_all_playlists_carry_names_only() {
    let mut h = start(2);
    let engine = h.engine().await;
    let dir = engine.request.output_dir.clone();

    // resolution 1 manifest never shows up
    write_master(&dir).await;
    tokio::fs::write(dir.join("0.m3u8"), media_playlist(0, &[0, 1], false))
        .await
        .unwrap();
    h.emit(FsEventKind::Created, dir.join("master.m3u8")).await;
    h.emit(FsEventKind::Created, dir.join("0.m3u8")).await;
    for seq in 0..2 {
        let path = write_segment(&dir, 0, seq).await;
        h.emit(FsEventKind::Created, path).await;
    }
    engine.finish(EngineExit::Ended);

    let (outcome, server, _dir) = h.outcome().await;
    assert_eq!(outcome, ExecutionOutcome::Completed);
    assert_eq!(server.chunk_names(), vec!["0-000000.ts", "0-000001.ts"]);
    assert!(server.updates().iter().all(|u| u.chunk().playlists.is_none()));
}

#[tokio::test]
async fn test_resolutions_flush_independently() {
    let mut h = start(2);
    let engine = h.engine().await;
    let dir = engine.request.output_dir.clone();

    for (resolution, seq) in [(0, 0), (1, 0), (1, 1), (0, 1)] {
        let path = write_segment(&dir, resolution, seq).await;
        h.emit(FsEventKind::Created, path).await;
    }
    engine.finish(EngineExit::Ended);

    let (outcome, server, _dir) = h.outcome().await;
    assert_eq!(outcome, ExecutionOutcome::Completed);

    let names = server.chunk_names();
    assert_eq!(names.len(), 4);
    let order = |prefix: &str| -> Vec<String> {
        names.iter().filter(|n| n.starts_with(prefix)).cloned().collect()
    };
    assert_eq!(order("0-"), vec!["0-000000.ts", "0-000001.ts"]);
    assert_eq!(order("1-"), vec!["1-000000.ts", "1-000001.ts"]);
}

#[tokio::test]
async fn test_removed_chunk_is_reported() {
    let mut h = start(1);
    let engine = h.engine().await;
    let dir = engine.request.output_dir.clone();

    let first = write_segment(&dir, 0, 0).await;
    h.emit(FsEventKind::Created, &first).await;
    let second = write_segment(&dir, 0, 1).await;
    h.emit(FsEventKind::Created, &second).await;
    h.server.wait_for_updates(1).await;

    tokio::fs::remove_file(&first).await.unwrap();
    h.emit(FsEventKind::Removed, &first).await;
    h.server.wait_for_updates(2).await;
    engine.finish(EngineExit::Ended);

    let (outcome, server, _dir) = h.outcome().await;
    assert_eq!(outcome, ExecutionOutcome::Completed);
    assert_eq!(server.removed_names(), vec!["0-000000.ts"]);
    assert_eq!(server.chunk_names(), vec!["0-000000.ts", "0-000001.ts"]);
}

#[tokio::test]
async fn test_evicted_pending_chunk_is_not_reported_removed() {
    let mut h = start(1);
    let engine = h.engine().await;
    let dir = engine.request.output_dir.clone();

    // evicted while still pending: no add went out, so no remove either
    let first = write_segment(&dir, 0, 0).await;
    h.emit(FsEventKind::Created, &first).await;
    tokio::fs::remove_file(&first).await.unwrap();
    h.emit(FsEventKind::Removed, &first).await;

    let second = write_segment(&dir, 0, 1).await;
    h.emit(FsEventKind::Created, &second).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    engine.finish(EngineExit::Ended);

    let (outcome, server, _dir) = h.outcome().await;
    assert_eq!(outcome, ExecutionOutcome::Completed);
    assert!(server.removed_names().is_empty());
    assert_eq!(server.chunk_names(), vec!["0-000001.ts"]);
}

#[tokio::test]
async fn test_engine_failure_reports_error() {
    let mut h = start(1);
    let engine = h.engine().await;
    engine.finish(EngineExit::Failed("Connection to tcp://localhost:1935 failed".to_string()));

    let (outcome, server, transcoding_dir) = h.outcome().await;
    match outcome {
        ExecutionOutcome::Failed(message) => assert!(message.contains("1935")),
        other => panic!("expected failure, got {:?}", other),
    }
    assert_eq!(server.errors().len(), 1);
    assert_eq!(server.success_calls(), 0);
    assert!(is_empty_dir(transcoding_dir.path()));
}

#[tokio::test]
async fn test_abandoned_job_stops_engine_without_error() {
    let mut h = start(1);
    let engine = h.engine().await;
    let dir = engine.request.output_dir.clone();
    engine.stop_when_asked();

    h.server.abandon();
    for seq in 0..2 {
        let path = write_segment(&dir, 0, seq).await;
        h.emit(FsEventKind::Created, path).await;
    }

    let (outcome, server, transcoding_dir) = h.outcome().await;
    assert_eq!(outcome, ExecutionOutcome::Abandoned);
    // one attempt, never retried
    assert_eq!(server.update_attempts(), 1);
    assert!(server.errors().is_empty());
    assert_eq!(server.success_calls(), 1);
    assert!(is_empty_dir(transcoding_dir.path()));
}

#[tokio::test]
async fn test_final_flush_stops_once_job_is_abandoned() {
    let mut h = start(1);
    let engine = h.engine().await;
    let dir = engine.request.output_dir.clone();
    h.server.set_latency("0-000000.ts", Duration::from_millis(300));

    // 0-000000 goes out, 0-000001..0-000004 queue up behind it
    for seq in 0..6 {
        let path = write_segment(&dir, 0, seq).await;
        h.emit(FsEventKind::Created, path).await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    // the server drops the job while the first add is in flight
    h.server.abandon();
    engine.finish(EngineExit::Ended);

    let (outcome, server, transcoding_dir) = h.outcome().await;
    assert_eq!(outcome, ExecutionOutcome::Abandoned);
    // the in-flight add, then one rejected add, then nothing
    assert_eq!(server.update_attempts(), 2);
    assert_eq!(server.chunk_names(), vec!["0-000000.ts"]);
    assert!(server.errors().is_empty());
    assert!(is_empty_dir(transcoding_dir.path()));
}

#[tokio::test]
async fn test_exhausted_update_retries_error_the_job() {
    let mut h = start(1);
    let engine = h.engine().await;
    let dir = engine.request.output_dir.clone();
    engine.stop_when_asked();

    h.server.fail_next_updates(3);
    for seq in 0..2 {
        let path = write_segment(&dir, 0, seq).await;
        h.emit(FsEventKind::Created, path).await;
    }

    let (outcome, server, _dir) = h.outcome().await;
    assert!(matches!(outcome, ExecutionOutcome::Failed(_)));
    assert_eq!(server.update_attempts(), 3);
    assert_eq!(server.errors().len(), 1);
}

#[tokio::test]
async fn test_probe_failure_is_reported_and_cleaned_up() {
    let h = start_with(FakeTranscoder::failing_probe(), None, payload(1));

    let (outcome, server, transcoding_dir) = h.outcome().await;
    assert!(matches!(outcome, ExecutionOutcome::Failed(_)));
    assert_eq!(server.errors().len(), 1);
    assert!(server.errors()[0].contains("connection refused"));
    assert!(is_empty_dir(transcoding_dir.path()));
}

#[tokio::test]
async fn test_invalid_payload_is_reported() {
    let (transcoder, started) = FakeTranscoder::new();
    let h = start_with(transcoder, Some(started), serde_json::json!({"input": {}}));

    let (outcome, server, _dir) = h.outcome().await;
    assert!(matches!(outcome, ExecutionOutcome::Failed(_)));
    assert_eq!(server.errors().len(), 1);
}

#[tokio::test]
async fn test_cancel_gives_job_back() {
    let mut h = start(1);
    let engine = h.engine().await;
    engine.stop_when_asked();

    h.cancel.send(true).unwrap();

    let (outcome, server, transcoding_dir) = h.outcome().await;
    assert_eq!(outcome, ExecutionOutcome::Abandoned);
    assert_eq!(server.aborts().len(), 1);
    assert!(server.errors().is_empty());
    assert!(is_empty_dir(transcoding_dir.path()));
}
