// Filesystem signal source
//
// The OS watcher (notify) delivers callbacks on its own thread; they are
// bridged onto the producer task through a bounded queue. When the queue
// saturates the oldest entries are dropped so a burst always leaves the
// freshest events behind. Include/ignore globs prune noise before it ever
// reaches the queue.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use globset::{Glob, GlobSet, GlobSetBuilder};
use notify::event::{ModifyKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde_json::{json, Map, Value};

use super::source::SignalSource;
use crate::config::SignalsConfig;
use crate::events::{EventDraft, EventType, SourceType};

/// Cap on events waiting to be drained by the producer task
const BRIDGE_CAPACITY: usize = 1024;

/// Bounded thread-safe queue between the watcher thread and the poll loop.
/// Saturation drops the oldest entry.
#[derive(Clone)]
struct BridgeQueue {
    inner: Arc<Mutex<VecDeque<EventDraft>>>,
    dropped: Arc<AtomicU64>,
    capacity: usize,
}

impl BridgeQueue {
    fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            dropped: Arc::new(AtomicU64::new(0)),
            capacity,
        }
    }

    fn push(&self, draft: EventDraft) {
        let mut queue = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if queue.len() >= self.capacity {
            queue.pop_front();
            let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::warn!(dropped_total = total, "filesystem bridge queue full, dropping oldest");
        }
        queue.push_back(draft);
    }

    fn pop(&self) -> Option<EventDraft> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }

    fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Include/ignore glob filter. Single-component patterns like `*.tmp`
/// match against the file name; patterns with separators match the full
/// path.
struct PathFilter {
    include: GlobSet,
    include_empty: bool,
    ignore: GlobSet,
}

impl PathFilter {
    fn new(patterns: &[String], ignore_patterns: &[String]) -> Result<Self> {
        Ok(Self {
            include: Self::build(patterns)?,
            include_empty: patterns.is_empty(),
            ignore: Self::build(ignore_patterns)?,
        })
    }

    fn build(patterns: &[String]) -> Result<GlobSet> {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            builder.add(
                Glob::new(pattern)
                    .with_context(|| format!("invalid watch pattern: {pattern}"))?,
            );
        }
        builder.build().context("failed to compile watch patterns")
    }

    fn matches_set(set: &GlobSet, path: &Path) -> bool {
        if set.is_match(path) {
            return true;
        }
        path.file_name()
            .map(|name| set.is_match(Path::new(name)))
            .unwrap_or(false)
    }

    fn should_process(&self, path: &Path) -> bool {
        if Self::matches_set(&self.ignore, path) {
            return false;
        }
        self.include_empty || Self::matches_set(&self.include, path)
    }
}

/// Map a notify event into zero or more drafts, applying the path filter.
fn convert_event(event: &notify::Event, filter: &PathFilter) -> Option<EventDraft> {
    let src = event.paths.first()?;
    if !filter.should_process(src) {
        return None;
    }

    let (event_type, dest) = match &event.kind {
        EventKind::Create(_) => (EventType::Created, None),
        EventKind::Remove(_) => (EventType::Deleted, None),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            (EventType::Moved, event.paths.get(1))
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => (EventType::Moved, None),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => (EventType::Created, None),
        EventKind::Modify(_) => (EventType::Modified, None),
        // Access and catch-all kinds carry no change worth routing
        _ => return None,
    };

    let mut data = Map::new();
    data.insert("path".to_string(), json!(src.display().to_string()));
    data.insert(
        "filename".to_string(),
        json!(src.file_name().map(|n| n.to_string_lossy().to_string())),
    );
    data.insert(
        "extension".to_string(),
        json!(src
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default()),
    );
    data.insert("is_directory".to_string(), json!(src.is_dir()));
    if let Some(dest) = dest {
        data.insert("dest_path".to_string(), json!(dest.display().to_string()));
        data.insert(
            "dest_filename".to_string(),
            json!(dest.file_name().map(|n| n.to_string_lossy().to_string())),
        );
    }

    Some(EventDraft {
        event_type,
        data,
        metadata: Map::from_iter([("event_kind".to_string(), json!(format!("{:?}", event.kind)))]),
    })
}

pub struct FilesystemSource {
    name: String,
    poll_interval: Duration,
    queue: BridgeQueue,
    // Held for its side effect: dropping it stops the watcher thread
    _watcher: RecommendedWatcher,
    watched_paths: Vec<String>,
}

impl FilesystemSource {
    pub fn new(config: &SignalsConfig) -> Result<Self> {
        let filter = PathFilter::new(&config.watch_patterns, &config.watch_ignore_patterns)?;
        let queue = BridgeQueue::new(BRIDGE_CAPACITY);

        let queue_for_watcher = queue.clone();
        let mut watcher =
            notify::recommended_watcher(move |res: notify::Result<notify::Event>| match res {
                Ok(event) => {
                    if let Some(draft) = convert_event(&event, &filter) {
                        queue_for_watcher.push(draft);
                    }
                }
                Err(err) => tracing::error!(error = %err, "filesystem watcher error"),
            })
            .context("failed to create filesystem watcher")?;

        let mode = if config.watch_recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };

        let mut watched_paths = Vec::new();
        for path in &config.watch_paths {
            let p = Path::new(path);
            if !p.exists() {
                tracing::warn!(path = %path, "watch path does not exist, skipping");
                continue;
            }
            watcher
                .watch(p, mode)
                .with_context(|| format!("failed to watch {path}"))?;
            tracing::info!(path = %path, "watching");
            watched_paths.push(path.clone());
        }

        Ok(Self {
            name: "filesystem_monitor".to_string(),
            poll_interval: Duration::from_secs_f64(config.filesystem_poll_interval),
            queue,
            _watcher: watcher,
            watched_paths,
        })
    }
}

#[async_trait]
impl SignalSource for FilesystemSource {
    fn source_type(&self) -> SourceType {
        SourceType::Filesystem
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    async fn poll(&mut self) -> Option<EventDraft> {
        self.queue.pop()
    }

    fn current_values(&self) -> Value {
        json!({
            "watched_paths": self.watched_paths,
            "pending": self.queue.len(),
            "dropped": self.queue.dropped(),
        })
    }

    fn config_schema(&self) -> Value {
        json!({
            "watch_paths": {"type": "array", "items": {"type": "string"}, "description": "Paths to watch for file events"},
            "watch_patterns": {"type": "array", "items": {"type": "string"}, "description": "File patterns to include (empty = all)"},
            "watch_ignore_patterns": {"type": "array", "items": {"type": "string"}, "description": "File patterns to ignore"},
            "watch_recursive": {"type": "boolean", "description": "Watch subdirectories recursively", "default": true},
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn filter(include: &[&str], ignore: &[&str]) -> PathFilter {
        PathFilter::new(
            &include.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
            &ignore.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
        )
        .unwrap()
    }

    fn notify_event(kind: EventKind, paths: &[&str]) -> notify::Event {
        let mut event = notify::Event::new(kind);
        event.paths = paths.iter().map(PathBuf::from).collect();
        event
    }

    #[test]
    fn test_bridge_queue_drops_oldest_on_saturation() {
        let queue = BridgeQueue::new(3);
        for n in 0..5 {
            queue.push(EventDraft::new(EventType::Created).with_data("n", json!(n)));
        }
        assert_eq!(queue.dropped(), 2);
        // The two oldest are gone; freshest three remain in order
        assert_eq!(queue.pop().unwrap().data["n"], json!(2));
        assert_eq!(queue.pop().unwrap().data["n"], json!(3));
        assert_eq!(queue.pop().unwrap().data["n"], json!(4));
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_ignore_beats_include() {
        let f = filter(&["*.txt"], &["secret*"]);
        assert!(f.should_process(Path::new("/watch/notes.txt")));
        assert!(!f.should_process(Path::new("/watch/secret.txt")));
    }

    #[test]
    fn test_empty_include_processes_everything_not_ignored() {
        let f = filter(&[], &["*.tmp"]);
        assert!(f.should_process(Path::new("/watch/anything.bin")));
        assert!(!f.should_process(Path::new("/watch/scratch.tmp")));
    }

    #[test]
    fn test_default_ignores_cover_git_internals() {
        let defaults = SignalsConfig::default();
        let f = PathFilter::new(&defaults.watch_patterns, &defaults.watch_ignore_patterns).unwrap();
        assert!(!f.should_process(Path::new("/repo/.git/objects/ab/cdef")));
        assert!(!f.should_process(Path::new("/repo/file.swp")));
        assert!(f.should_process(Path::new("/repo/src/main.rs")));
    }

    #[test]
    fn test_create_event_conversion() {
        let f = filter(&[], &[]);
        let event = notify_event(EventKind::Create(notify::event::CreateKind::File), &[
            "/watch/report.pdf",
        ]);
        let draft = convert_event(&event, &f).expect("converted");
        assert_eq!(draft.event_type, EventType::Created);
        assert_eq!(draft.data["filename"], json!("report.pdf"));
        assert_eq!(draft.data["extension"], json!(".pdf"));
    }

    #[test]
    fn test_rename_both_becomes_moved_with_dest() {
        let f = filter(&[], &[]);
        let event = notify_event(
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            &["/watch/old.txt", "/watch/new.txt"],
        );
        let draft = convert_event(&event, &f).expect("converted");
        assert_eq!(draft.event_type, EventType::Moved);
        assert_eq!(draft.data["dest_filename"], json!("new.txt"));
    }

    #[test]
    fn test_access_events_are_dropped() {
        let f = filter(&[], &[]);
        let event = notify_event(
            EventKind::Access(notify::event::AccessKind::Read),
            &["/watch/file"],
        );
        assert!(convert_event(&event, &f).is_none());
    }

    #[test]
    fn test_filtered_path_never_reaches_queue() {
        let f = filter(&["*.rs"], &[]);
        let event = notify_event(EventKind::Create(notify::event::CreateKind::File), &[
            "/watch/image.png",
        ]);
        assert!(convert_event(&event, &f).is_none());
    }

    #[test]
    fn test_invalid_pattern_fails_construction() {
        let patterns = vec!["a{".to_string()];
        assert!(PathFilter::new(&patterns, &[]).is_err());
    }
}
