use crate::error::{IndexError, Result};
use notify::event::{ModifyKind, RenameMode};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsEventKind {
    Created,
    Modified,
    Deleted,
}

/// Event emitted by the filesystem watcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Changed { path: PathBuf, kind: FsEventKind },
    /// Events may have been lost; the directory has to be reconciled
    Rescan(String),
}

impl WatchEvent {
    fn changed(path: PathBuf, kind: FsEventKind) -> Self {
        WatchEvent::Changed { path, kind }
    }
}

/// Recursive filesystem watcher for one directory
pub struct FileWatcher {
    watch_dir: PathBuf,
    watcher: Option<RecommendedWatcher>,
}

impl FileWatcher {
    pub fn new<P: AsRef<Path>>(watch_dir: P) -> Result<Self> {
        let watch_dir = watch_dir.as_ref();
        let watch_dir = watch_dir.canonicalize().map_err(|e| {
            IndexError::WatchEvent(format!("cannot resolve {}: {}", watch_dir.display(), e))
        })?;

        if !watch_dir.is_dir() {
            return Err(IndexError::WatchEvent(format!(
                "path is not a directory: {}",
                watch_dir.display()
            )));
        }

        Ok(Self {
            watch_dir,
            watcher: None,
        })
    }

    pub fn watch_dir(&self) -> &Path {
        &self.watch_dir
    }

    /// Start watching. Events arrive on the returned channel until the
    /// watcher is dropped.
    pub fn watch(&mut self) -> Result<mpsc::UnboundedReceiver<WatchEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let watch_dir = self.watch_dir.clone();
        let mut watcher = RecommendedWatcher::new(
            move |result: notify::Result<Event>| {
                for event in map_event(&watch_dir, result) {
                    if tx.send(event).is_err() {
                        return;
                    }
                }
            },
            Config::default(),
        )
        .map_err(|e| IndexError::WatchEvent(format!("failed to create filesystem watcher: {}", e)))?;

        watcher
            .watch(&self.watch_dir, RecursiveMode::Recursive)
            .map_err(|e| {
                IndexError::WatchEvent(format!("failed to watch {}: {}", self.watch_dir.display(), e))
            })?;

        tracing::info!(dir = %self.watch_dir.display(), "watching directory");
        self.watcher = Some(watcher);
        Ok(rx)
    }
}

/// Translate one raw notify callback into watch events for `watch_dir`.
pub fn map_event(watch_dir: &Path, result: notify::Result<Event>) -> Vec<WatchEvent> {
    let event = match result {
        Ok(event) => event,
        Err(e) => return vec![WatchEvent::Rescan(format!("watcher error: {}", e))],
    };
    if event.need_rescan() {
        return vec![WatchEvent::Rescan("watcher requested a rescan".to_string())];
    }

    let inside = |p: &PathBuf| p.starts_with(watch_dir);
    let mut out = Vec::new();
    match event.kind {
        EventKind::Create(_) => {
            for path in event.paths.into_iter().filter(inside) {
                out.push(created_or_rescan(path));
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            let mut paths = event.paths.into_iter();
            if let Some(from) = paths.next().filter(inside) {
                out.push(WatchEvent::changed(from, FsEventKind::Deleted));
            }
            if let Some(to) = paths.next().filter(inside) {
                out.push(created_or_rescan(to));
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            for path in event.paths.into_iter().filter(inside) {
                out.push(WatchEvent::changed(path, FsEventKind::Deleted));
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            for path in event.paths.into_iter().filter(inside) {
                out.push(created_or_rescan(path));
            }
        }
        EventKind::Modify(ModifyKind::Name(_)) => {
            // Platform could not tell which side of the rename this is
            for path in event.paths.into_iter().filter(inside) {
                if path.exists() {
                    out.push(created_or_rescan(path));
                } else {
                    out.push(WatchEvent::changed(path, FsEventKind::Deleted));
                }
            }
        }
        EventKind::Modify(_) => {
            for path in event.paths.into_iter().filter(inside) {
                if !path.is_dir() {
                    out.push(WatchEvent::changed(path, FsEventKind::Modified));
                }
            }
        }
        EventKind::Remove(_) => {
            for path in event.paths.into_iter().filter(inside) {
                out.push(WatchEvent::changed(path, FsEventKind::Deleted));
            }
        }
        EventKind::Access(_) | EventKind::Any | EventKind::Other => {}
    }
    out
}

// A directory moved in does not produce events for its contents
fn created_or_rescan(path: PathBuf) -> WatchEvent {
    if path.is_dir() {
        WatchEvent::Rescan(format!("directory appeared: {}", path.display()))
    } else {
        WatchEvent::changed(path, FsEventKind::Created)
    }
}
