//! Filesystem event handling for one live execution.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use runq_media::hls;
use runq_media::{FsEvent, FsEventKind};
use runq_models::{ChunkUpdate, LiveUpdatePayload, PlaylistSnapshot};

use super::chunk_queue::ChunkQueue;
use super::context::LiveJobContext;
use super::playlists::PlaylistTracker;

/// Segment observed but not sent yet; the engine may still be writing it.
#[derive(Debug, Clone)]
struct PendingChunk {
    filename: String,
    path: PathBuf,
}

pub struct LiveSession {
    ctx: Arc<LiveJobContext>,
    work_dir: PathBuf,
    outputs: usize,
    playlists: PlaylistTracker,
    pending: HashMap<usize, Vec<PendingChunk>>,
    /// Newest segment handed to each resolution's queue
    last_flushed: HashMap<usize, String>,
    queues: HashMap<usize, ChunkQueue>,
    removals: JoinSet<()>,
}

impl LiveSession {
    pub fn new(ctx: Arc<LiveJobContext>, work_dir: PathBuf, outputs: usize) -> Self {
        Self {
            ctx,
            work_dir,
            outputs,
            playlists: PlaylistTracker::new(outputs),
            pending: HashMap::new(),
            last_flushed: HashMap::new(),
            queues: HashMap::new(),
            removals: JoinSet::new(),
        }
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub async fn handle_event(&mut self, event: FsEvent) {
        let Some(name) = event.file_name().map(str::to_string) else {
            return;
        };

        if hls::is_playlist(&event.path) {
            if event.kind != FsEventKind::Removed {
                self.on_playlist(&name);
            }
        } else if hls::is_segment(&event.path) {
            match event.kind {
                FsEventKind::Created => self.on_segment_created(name, event.path).await,
                FsEventKind::Removed => self.on_segment_removed(name).await,
                FsEventKind::Changed => {}
            }
        }

        // reap finished removal sends
        while self.removals.try_join_next().is_some() {}
    }

    fn on_playlist(&mut self, name: &str) {
        if !self.playlists.is_expected(name) {
            warn!(job_id = %self.ctx.auth().job_id, playlist = name, "Ignoring unexpected playlist");
            return;
        }
        if self.playlists.observe(name) {
            info!(job_id = %self.ctx.auth().job_id, "All playlists created");
        }
    }

    async fn on_segment_created(&mut self, filename: String, path: PathBuf) {
        let Some(resolution) = hls::segment_resolution(&filename).filter(|r| *r < self.outputs)
        else {
            warn!(job_id = %self.ctx.auth().job_id, chunk = %filename, "Ignoring segment of unknown resolution");
            return;
        };

        let already_known = self.last_flushed.get(&resolution) == Some(&filename)
            || self
                .pending
                .get(&resolution)
                .is_some_and(|p| p.iter().any(|c| c.filename == filename));
        if already_known {
            return;
        }

        // the previous segment is complete once the next one appears
        self.flush_resolution(resolution).await;
        self.pending
            .entry(resolution)
            .or_default()
            .push(PendingChunk { filename, path });
    }

    async fn on_segment_removed(&mut self, filename: String) {
        let resolution = hls::segment_resolution(&filename);
        if let Some(pending) = resolution.and_then(|r| self.pending.get_mut(&r)) {
            let before = pending.len();
            pending.retain(|c| c.filename != filename);
            if pending.len() < before {
                // never added, so there is nothing to remove on the server
                warn!(
                    job_id = %self.ctx.auth().job_id,
                    chunk = %filename,
                    "Segment evicted before it was sent, its add is lost"
                );
                return;
            }
        }

        let reference = resolution.and_then(|r| self.last_flushed.get(&r).cloned());
        let playlists = match (resolution, reference.as_deref()) {
            (Some(r), reference) => self.snapshot(r, reference).await,
            (None, _) => None,
        };

        let update = LiveUpdatePayload::RemoveChunk(ChunkUpdate {
            video_chunk_filename: filename,
            video_chunk_file: None,
            playlists,
        });

        let ctx = Arc::clone(&self.ctx);
        self.removals.spawn(async move {
            if ctx.is_stopping() {
                return;
            }
            if let Err(e) = ctx.send_update(&update).await {
                ctx.logger().log_warning(&format!(
                    "Failed to send chunk removal {}: {}",
                    update.chunk().video_chunk_filename,
                    e
                ));
                ctx.fail(e);
            }
        });
    }

    /// Move `resolution`'s pending segments onto its send queue, oldest first.
    async fn flush_resolution(&mut self, resolution: usize) {
        let Some(chunks) = self.pending.remove(&resolution) else {
            return;
        };

        for chunk in chunks {
            let playlists = self.snapshot(resolution, Some(&chunk.filename)).await;
            let update = LiveUpdatePayload::AddChunk(ChunkUpdate {
                video_chunk_filename: chunk.filename.clone(),
                video_chunk_file: Some(chunk.path),
                playlists,
            });

            debug!(resolution, chunk = %chunk.filename, "Queueing chunk");
            self.queue(resolution).push(update);
            self.last_flushed.insert(resolution, chunk.filename);
        }
    }

    /// Flush every resolution, used once the engine has ended.
    pub async fn flush_all(&mut self) {
        let mut resolutions: Vec<usize> = self.pending.keys().copied().collect();
        resolutions.sort_unstable();

        for resolution in resolutions {
            self.flush_resolution(resolution).await;
        }
    }

    /// Wait until every queued add and in-flight removal was sent.
    pub async fn drain(&mut self) {
        let queues: Vec<ChunkQueue> = self.queues.drain().map(|(_, q)| q).collect();
        futures::future::join_all(queues.into_iter().map(ChunkQueue::drain)).await;

        while let Some(result) = self.removals.join_next().await {
            if let Err(e) = result {
                if e.is_panic() {
                    warn!("Chunk removal task panicked: {}", e);
                }
            }
        }
    }

    /// Drop everything not sent yet.
    pub fn abort(&mut self) {
        for (_, queue) in self.queues.drain() {
            queue.abort();
        }
        self.removals.abort_all();
        self.pending.clear();
    }

    fn queue(&mut self, resolution: usize) -> &ChunkQueue {
        let ctx = &self.ctx;
        self.queues
            .entry(resolution)
            .or_insert_with(|| ChunkQueue::spawn(resolution, Arc::clone(ctx)))
    }

    /// Manifest contents to attach, once every expected manifest exists.
    ///
    /// The resolution manifest is cut after `reference` and left out when it
    /// does not list it yet.
    async fn snapshot(&self, resolution: usize, reference: Option<&str>) -> Option<PlaylistSnapshot> {
        if !self.playlists.all_created() {
            return None;
        }

        let master = match tokio::fs::read_to_string(self.work_dir.join(hls::MASTER_PLAYLIST)).await {
            Ok(content) => content,
            Err(e) => {
                warn!(job_id = %self.ctx.auth().job_id, "Failed to read master playlist: {}", e);
                return None;
            }
        };

        let filename = hls::playlist_name(resolution);
        let content = match reference {
            Some(reference) => match tokio::fs::read_to_string(self.work_dir.join(&filename)).await {
                Ok(content) => hls::trim_playlist(&content, reference),
                Err(e) => {
                    warn!(job_id = %self.ctx.auth().job_id, playlist = %filename, "Failed to read playlist: {}", e);
                    None
                }
            },
            None => None,
        };

        Some(PlaylistSnapshot {
            master_playlist_content: master,
            resolution_playlist_filename: filename,
            resolution_playlist_content: content,
        })
    }
}
