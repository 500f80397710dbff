//! Live indexing: one filesystem watcher and watch driver per directory, all
//! sharing the pipeline's worker pool.

use crate::error::{IndexError, Result};
use crate::notifier::Notifier;
use crate::pipeline::IndexingPipeline;
use crate::watch::{FileWatcher, IndexTarget, WatchDriver, WatchSettings};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;

pub struct LiveIndexer {
    pipeline: Arc<IndexingPipeline>,
    notifier: Arc<dyn Notifier>,
    settings: WatchSettings,
    shutdown: watch::Sender<bool>,
    watchers: Vec<FileWatcher>,
    drivers: JoinSet<(PathBuf, Result<()>)>,
}

impl LiveIndexer {
    pub fn new(pipeline: Arc<IndexingPipeline>, notifier: Arc<dyn Notifier>, settings: WatchSettings) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            pipeline,
            notifier,
            settings,
            shutdown,
            watchers: Vec::new(),
            drivers: JoinSet::new(),
        }
    }

    /// Start watching `dirs`. Each directory is reconciled first, so changes
    /// made while nothing was watching are picked up.
    pub fn start(&mut self, dirs: &[PathBuf]) -> Result<()> {
        if dirs.is_empty() {
            return Err(IndexError::WatchEvent("no directories to watch".to_string()));
        }
        for dir in dirs {
            let mut watcher = FileWatcher::new(dir)?;
            let events = watcher.watch()?;
            let dir = watcher.watch_dir().to_path_buf();
            let target: Arc<dyn IndexTarget> = self.pipeline.clone();
            let driver = WatchDriver::new(
                dir.clone(),
                self.settings.clone(),
                target,
                self.notifier.clone(),
                self.pipeline.worker_pool(),
            );
            let shutdown = self.shutdown.subscribe();
            self.drivers.spawn(async move {
                let result = driver.run(events, shutdown).await;
                (dir, result)
            });
            self.watchers.push(watcher);
        }
        Ok(())
    }

    pub fn watched(&self) -> impl Iterator<Item = &Path> {
        self.watchers.iter().map(FileWatcher::watch_dir)
    }

    /// Resolve once every driver has exited, or early with the first
    /// index-level failure.
    pub async fn wait(&mut self) -> Result<()> {
        while let Some(joined) = self.drivers.join_next().await {
            match joined {
                Ok((dir, Ok(()))) => tracing::info!(dir = %dir.display(), "watcher finished"),
                Ok((dir, Err(e))) => {
                    tracing::error!(dir = %dir.display(), error = %e, "watcher failed");
                    return Err(e);
                }
                Err(e) => return Err(IndexError::WatchEvent(format!("watch task failed: {}", e))),
            }
        }
        Ok(())
    }

    /// Signal every driver to stop, let in-flight jobs finish, then release
    /// the filesystem watchers.
    pub async fn stop(mut self) -> Result<()> {
        let _ = self.shutdown.send(true);
        let result = self.wait().await;
        self.watchers.clear();
        tracing::info!("live indexing stopped");
        result
    }
}
