//! Filesystem observer: a `notify` watcher normalises raw events into the
//! canonical created/modified/moved/deleted/renamed set and registers them.

use anyhow::{Context, Result};
use log::{info, warn};
use notify::event::{ModifyKind, RenameMode};
use notify::{EventKind, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::registry::{ActionRegistry, ActionSource, FileEventKind, FileOperation};

const COALESCE_WINDOW_MS: u64 = 50;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFileEvent {
    pub kind: FileEventKind,
    pub path: PathBuf,
    pub dest: Option<PathBuf>,
}

/// Map a raw notify event onto the canonical kinds. Rename pairs become
/// `renamed` when both parents match and `moved` otherwise; single-sided
/// rename remnants stay `renamed` with the path we have.
pub fn map_event(event: &notify::Event) -> Vec<RawFileEvent> {
    let mut out = Vec::new();
    match &event.kind {
        EventKind::Create(_) => {
            for path in &event.paths {
                out.push(RawFileEvent {
                    kind: FileEventKind::Created,
                    path: path.clone(),
                    dest: None,
                });
            }
        }
        EventKind::Remove(_) => {
            for path in &event.paths {
                out.push(RawFileEvent {
                    kind: FileEventKind::Deleted,
                    path: path.clone(),
                    dest: None,
                });
            }
        }
        EventKind::Modify(ModifyKind::Name(mode)) => match (mode, event.paths.as_slice()) {
            (RenameMode::Both, [src, dest]) => {
                let kind = if src.parent() == dest.parent() {
                    FileEventKind::Renamed
                } else {
                    FileEventKind::Moved
                };
                out.push(RawFileEvent {
                    kind,
                    path: src.clone(),
                    dest: Some(dest.clone()),
                });
            }
            (_, paths) => {
                for path in paths {
                    out.push(RawFileEvent {
                        kind: FileEventKind::Renamed,
                        path: path.clone(),
                        dest: None,
                    });
                }
            }
        },
        EventKind::Modify(_) => {
            for path in &event.paths {
                out.push(RawFileEvent {
                    kind: FileEventKind::Modified,
                    path: path.clone(),
                    dest: None,
                });
            }
        }
        EventKind::Access(_) | EventKind::Any | EventKind::Other => {}
    }
    out
}

/// Suppress duplicate (path, kind) pairs arriving inside the window.
pub struct Coalescer {
    window: tokio::time::Duration,
    seen: HashMap<(PathBuf, FileEventKind), Instant>,
}

impl Coalescer {
    pub fn new(window_ms: u64) -> Self {
        Self {
            window: tokio::time::Duration::from_millis(window_ms),
            seen: HashMap::new(),
        }
    }

    pub fn admit(&mut self, path: &Path, kind: FileEventKind, now: Instant) -> bool {
        let key = (path.to_path_buf(), kind);
        match self.seen.get(&key) {
            Some(last) if now.duration_since(*last) < self.window => false,
            _ => {
                self.seen.insert(key, now);
                if self.seen.len() > 4096 {
                    let window = self.window;
                    self.seen.retain(|_, last| now.duration_since(*last) < window);
                }
                true
            }
        }
    }
}

fn file_extension(path: &Path) -> String {
    path.extension()
        .map(|ext| format!(".{}", ext.to_string_lossy().to_ascii_lowercase()))
        .unwrap_or_default()
}

fn to_operation(event: &RawFileEvent) -> FileOperation {
    // For renames the interesting file is the destination.
    let subject = event.dest.as_deref().unwrap_or(&event.path);
    let file_size = std::fs::metadata(subject).ok().filter(|m| m.is_file()).map(|m| m.len());
    FileOperation {
        event_type: event.kind,
        src_path: event.path.to_string_lossy().into_owned(),
        dest_path: event.dest.as_ref().map(|p| p.to_string_lossy().into_owned()),
        file_extension: file_extension(subject),
        file_size,
    }
}

async fn watcher_loop(
    dirs: Vec<PathBuf>,
    registry: Arc<ActionRegistry>,
    cancel: CancellationToken,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<notify::Event>();

    let mut watcher = match notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        match res {
            Ok(event) => {
                let _ = tx.send(event);
            }
            Err(err) => warn!("file watch error: {err}"),
        }
    }) {
        Ok(watcher) => watcher,
        Err(err) => {
            warn!("failed to create file watcher: {err}");
            return;
        }
    };

    let mut watched = 0usize;
    for dir in &dirs {
        match watcher.watch(dir, RecursiveMode::NonRecursive) {
            Ok(()) => watched += 1,
            Err(err) => warn!("cannot watch {}: {err}", dir.display()),
        }
    }
    if watched == 0 {
        warn!("file watcher has no valid directories; nothing to observe");
    } else {
        info!("file watcher active on {watched} directories");
    }

    let mut coalescer = Coalescer::new(COALESCE_WINDOW_MS);
    loop {
        tokio::select! {
            maybe_event = rx.recv() => {
                let Some(event) = maybe_event else { break };
                for raw in map_event(&event) {
                    if !coalescer.admit(&raw.path, raw.kind, Instant::now()) {
                        continue;
                    }
                    let operation = to_operation(&raw);
                    registry.register(
                        raw.kind.action_type().as_str(),
                        serde_json::to_value(&operation).unwrap_or_default(),
                        ActionSource::FileWatcher,
                        None,
                    );
                }
            }
            _ = cancel.cancelled() => break,
        }
    }
    // Watcher drops here, releasing the OS handles.
    drop(watcher);
}

/// Owns the watcher task. `rebuild` swaps in a watcher for a new directory
/// set: construct new, swap, then cancel the old one.
pub struct FileWatcherController {
    registry: Arc<ActionRegistry>,
    handle: Option<JoinHandle<()>>,
    cancel: Option<CancellationToken>,
}

impl FileWatcherController {
    pub fn new(registry: Arc<ActionRegistry>) -> Self {
        Self {
            registry,
            handle: None,
            cancel: None,
        }
    }

    pub async fn rebuild(&mut self, dirs: Vec<PathBuf>) -> Result<()> {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(watcher_loop(dirs, self.registry.clone(), cancel.clone()));

        let old_cancel = self.cancel.replace(cancel);
        let old_handle = self.handle.replace(handle);

        if let Some(old) = old_cancel {
            old.cancel();
        }
        if let Some(old) = old_handle {
            old.await.context("previous file watcher task failed to join")?;
        }
        Ok(())
    }

    pub async fn stop(&mut self) -> Result<()> {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        if let Some(handle) = self.handle.take() {
            handle.await.context("file watcher task failed to join")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notify_event(kind: EventKind, paths: Vec<PathBuf>) -> notify::Event {
        let mut event = notify::Event::new(kind);
        for path in paths {
            event = event.add_path(path);
        }
        event
    }

    #[test]
    fn create_and_remove_map_directly() {
        let created = map_event(&notify_event(
            EventKind::Create(notify::event::CreateKind::File),
            vec!["/w/a.txt".into()],
        ));
        assert_eq!(created[0].kind, FileEventKind::Created);

        let removed = map_event(&notify_event(
            EventKind::Remove(notify::event::RemoveKind::File),
            vec!["/w/a.txt".into()],
        ));
        assert_eq!(removed[0].kind, FileEventKind::Deleted);
    }

    #[test]
    fn rename_within_directory_is_renamed() {
        let events = map_event(&notify_event(
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            vec!["/w/a.jpg".into(), "/w/b.jpg".into()],
        ));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, FileEventKind::Renamed);
        assert_eq!(events[0].dest.as_deref(), Some(Path::new("/w/b.jpg")));
    }

    #[test]
    fn rename_across_directories_is_moved() {
        let events = map_event(&notify_event(
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            vec!["/w/a.jpg".into(), "/w/sub/a.jpg".into()],
        ));
        assert_eq!(events[0].kind, FileEventKind::Moved);
    }

    #[test]
    fn data_modification_maps_to_modified() {
        let events = map_event(&notify_event(
            EventKind::Modify(ModifyKind::Data(notify::event::DataChange::Content)),
            vec!["/w/a.txt".into()],
        ));
        assert_eq!(events[0].kind, FileEventKind::Modified);
    }

    #[test]
    fn coalescer_suppresses_duplicates_inside_window() {
        let mut coalescer = Coalescer::new(50);
        let now = Instant::now();
        let path = Path::new("/w/a.txt");

        assert!(coalescer.admit(path, FileEventKind::Modified, now));
        assert!(!coalescer.admit(
            path,
            FileEventKind::Modified,
            now + tokio::time::Duration::from_millis(20)
        ));
        // Different kind for the same path passes.
        assert!(coalescer.admit(path, FileEventKind::Deleted, now));
        // Outside the window passes again.
        assert!(coalescer.admit(
            path,
            FileEventKind::Modified,
            now + tokio::time::Duration::from_millis(80)
        ));
    }

    #[test]
    fn extension_is_lowercased_with_dot() {
        assert_eq!(file_extension(Path::new("/w/PHOTO.JPG")), ".jpg");
        assert_eq!(file_extension(Path::new("/w/README")), "");
    }

    #[tokio::test]
    async fn watcher_registers_created_files() {
        let dir = tempfile::tempdir().unwrap();
        let state_dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(ActionRegistry::new(
            100,
            state_dir.path().join("registry.json"),
        ));

        let mut controller = FileWatcherController::new(registry.clone());
        controller
            .rebuild(vec![dir.path().to_path_buf()])
            .await
            .unwrap();
        // Give the backend a moment to install its watch.
        tokio::time::sleep(tokio::time::Duration::from_millis(200)).await;

        std::fs::write(dir.path().join("fresh.txt"), b"hello").unwrap();

        let mut seen = false;
        for _ in 0..40 {
            tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
            if registry
                .all(50)
                .iter()
                .any(|a| a.action_type == "file_created" || a.action_type == "file_modified")
            {
                seen = true;
                break;
            }
        }
        controller.stop().await.unwrap();
        assert!(seen, "no filesystem action registered within 2s");
    }
}
