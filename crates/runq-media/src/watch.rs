//! Output directory watching.
//!
//! The executor consumes a stream of [`FsEvent`]s for the files the engine
//! writes. [`PollingWatcher`] derives them from periodic directory listings.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{MediaError, MediaResult};

/// Buffered events per subscription.
const EVENT_BUFFER: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsEventKind {
    Created,
    Changed,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsEvent {
    pub kind: FsEventKind,
    pub path: PathBuf,
}

impl FsEvent {
    pub fn new(kind: FsEventKind, path: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            path: path.into(),
        }
    }

    pub fn file_name(&self) -> Option<&str> {
        self.path.file_name().and_then(|n| n.to_str())
    }
}

/// File extensions a subscription reports on.
#[derive(Debug, Clone, Default)]
pub struct WatchFilter {
    extensions: Vec<String>,
}

impl WatchFilter {
    /// Report files with any of `extensions`; empty means every file.
    pub fn extensions<I, S>(extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            extensions: extensions.into_iter().map(Into::into).collect(),
        }
    }

    pub fn matches(&self, path: &Path) -> bool {
        if self.extensions.is_empty() {
            return true;
        }
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| self.extensions.iter().any(|x| x == e))
    }
}

/// Live stream of events for one directory.
///
/// Dropping or closing the subscription stops the watcher behind it.
pub struct WatchSubscription {
    events: mpsc::Receiver<FsEvent>,
    task: Option<JoinHandle<()>>,
}

impl WatchSubscription {
    /// Subscription fed by an arbitrary event source.
    pub fn from_channel(events: mpsc::Receiver<FsEvent>) -> Self {
        Self { events, task: None }
    }

    /// Next event, `None` once the watcher is gone.
    pub async fn next(&mut self) -> Option<FsEvent> {
        self.events.recv().await
    }

    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.events.close();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for WatchSubscription {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Filesystem watcher collaborator.
#[async_trait]
pub trait DirectoryWatcher: Send + Sync {
    async fn subscribe(&self, dir: &Path, filter: WatchFilter) -> MediaResult<WatchSubscription>;
}

/// Watcher that diffs directory listings on an interval.
#[derive(Debug, Clone)]
pub struct PollingWatcher {
    interval: Duration,
}

impl Default for PollingWatcher {
    fn default() -> Self {
        Self::new(Duration::from_millis(100))
    }
}

impl PollingWatcher {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    len: u64,
    modified: Option<SystemTime>,
}

type Snapshot = HashMap<PathBuf, FileStamp>;

async fn snapshot(dir: &Path, filter: &WatchFilter) -> std::io::Result<Snapshot> {
    let mut files = Snapshot::new();
    let mut entries = tokio::fs::read_dir(dir).await?;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if !filter.matches(&path) {
            continue;
        }
        // file may vanish between listing and stat
        let Ok(meta) = entry.metadata().await else {
            continue;
        };
        if meta.is_file() {
            files.insert(
                path,
                FileStamp {
                    len: meta.len(),
                    modified: meta.modified().ok(),
                },
            );
        }
    }

    Ok(files)
}

/// Events turning `before` into `after`, in name order per kind.
fn diff(before: &Snapshot, after: &Snapshot) -> Vec<FsEvent> {
    let mut created: Vec<&PathBuf> = Vec::new();
    let mut changed: Vec<&PathBuf> = Vec::new();
    for (path, stamp) in after {
        match before.get(path) {
            None => created.push(path),
            Some(old) if old != stamp => changed.push(path),
            Some(_) => {}
        }
    }
    let mut removed: Vec<&PathBuf> = before.keys().filter(|p| !after.contains_key(*p)).collect();

    created.sort();
    changed.sort();
    removed.sort();

    created
        .into_iter()
        .map(|p| FsEvent::new(FsEventKind::Created, p.clone()))
        .chain(changed.into_iter().map(|p| FsEvent::new(FsEventKind::Changed, p.clone())))
        .chain(removed.into_iter().map(|p| FsEvent::new(FsEventKind::Removed, p.clone())))
        .collect()
}

#[async_trait]
impl DirectoryWatcher for PollingWatcher {
    async fn subscribe(&self, dir: &Path, filter: WatchFilter) -> MediaResult<WatchSubscription> {
        if !tokio::fs::metadata(dir).await.map(|m| m.is_dir()).unwrap_or(false) {
            return Err(MediaError::DirectoryNotFound(dir.to_path_buf()));
        }

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let dir = dir.to_path_buf();
        let period = self.interval;

        let task = tokio::spawn(async move {
            let mut known = Snapshot::new();
            let mut ticker = tokio::time::interval(period);

            loop {
                ticker.tick().await;

                let current = match snapshot(&dir, &filter).await {
                    Ok(current) => current,
                    Err(e) => {
                        warn!(dir = %dir.display(), "Failed to list watched directory: {}", e);
                        continue;
                    }
                };

                for event in diff(&known, &current) {
                    if tx.send(event).await.is_err() {
                        debug!(dir = %dir.display(), "Watch subscription closed");
                        return;
                    }
                }
                known = current;
            }
        });

        Ok(WatchSubscription {
            events: rx,
            task: Some(task),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stamp(len: u64) -> FileStamp {
        FileStamp {
            len,
            modified: None,
        }
    }

    #[test]
    fn test_filter() {
        let filter = WatchFilter::extensions(["m3u8", "ts"]);
        assert!(filter.matches(Path::new("a/0.m3u8")));
        assert!(filter.matches(Path::new("a/0-000001.ts")));
        assert!(!filter.matches(Path::new("a/0-000001.ts.tmp")));
        assert!(WatchFilter::default().matches(Path::new("anything")));
    }

    #[test]
    fn test_diff_orders_by_kind_then_name() {
        let before: Snapshot = [
            (PathBuf::from("0.m3u8"), stamp(10)),
            (PathBuf::from("0-000000.ts"), stamp(5)),
        ]
        .into_iter()
        .collect();
        let after: Snapshot = [
            (PathBuf::from("0.m3u8"), stamp(20)),
            (PathBuf::from("0-000002.ts"), stamp(5)),
            (PathBuf::from("0-000001.ts"), stamp(5)),
        ]
        .into_iter()
        .collect();

        let events = diff(&before, &after);
        assert_eq!(
            events,
            vec![
                FsEvent::new(FsEventKind::Created, "0-000001.ts"),
                FsEvent::new(FsEventKind::Created, "0-000002.ts"),
                FsEvent::new(FsEventKind::Changed, "0.m3u8"),
                FsEvent::new(FsEventKind::Removed, "0-000000.ts"),
            ]
        );
    }

    #[tokio::test]
    async fn test_polling_watcher_reports_files() {
        let dir = tempfile::tempdir().unwrap();
        let watcher = PollingWatcher::new(Duration::from_millis(10));
        let mut sub = watcher
            .subscribe(dir.path(), WatchFilter::extensions(["ts"]))
            .await
            .unwrap();

        let segment = dir.path().join("0-000000.ts");
        tokio::fs::write(&segment, b"data").await.unwrap();
        tokio::fs::write(dir.path().join("ignored.txt"), b"x").await.unwrap();

        let created = tokio::time::timeout(Duration::from_secs(2), sub.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(created, FsEvent::new(FsEventKind::Created, segment.clone()));

        tokio::fs::remove_file(&segment).await.unwrap();
        let removed = tokio::time::timeout(Duration::from_secs(2), sub.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(removed, FsEvent::new(FsEventKind::Removed, segment));

        sub.close();
    }

    #[tokio::test]
    async fn test_subscribe_missing_dir() {
        let watcher = PollingWatcher::default();
        let result = watcher
            .subscribe(Path::new("/nonexistent/runq/watch"), WatchFilter::default())
            .await;
        assert!(matches!(result, Err(MediaError::DirectoryNotFound(_))));
    }
}
