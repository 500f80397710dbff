use crate::error::Result;
use crate::models::IndexSummary;
use crate::notifier::Notifier;
use crate::pipeline::IndexingPipeline;
use crate::watch::events::WatchEvent;
use crate::watch::state::{DirectoryWatchState, Job, JobOutcome, WatchCommand, WatchSettings};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinSet;

/// What a watch driver needs from the indexing side.
#[async_trait::async_trait]
pub trait IndexTarget: Send + Sync {
    async fn index(&self, path: &Path) -> Result<()>;

    async fn remove(&self, path: &Path) -> Result<()>;

    /// Called once a path has used up its retries
    async fn abandon(&self, path: &Path) -> Result<()>;

    /// Drop images recorded below a path that no longer exists
    async fn remove_under(&self, path: &Path) -> Result<usize>;

    async fn reconcile(&self, dir: &Path) -> Result<IndexSummary>;
}

#[async_trait::async_trait]
impl IndexTarget for IndexingPipeline {
    async fn index(&self, path: &Path) -> Result<()> {
        self.index_image(path).await.map(|_| ())
    }

    async fn remove(&self, path: &Path) -> Result<()> {
        self.remove_image(path).await.map(|_| ())
    }

    async fn abandon(&self, path: &Path) -> Result<()> {
        IndexingPipeline::abandon(self, path).await
    }

    async fn remove_under(&self, path: &Path) -> Result<usize> {
        self.remove_directory(path).await
    }

    async fn reconcile(&self, dir: &Path) -> Result<IndexSummary> {
        IndexingPipeline::reconcile(self, dir).await
    }
}

enum Input {
    Quiescent { path: PathBuf, generation: u64 },
    RetryDue { path: PathBuf, generation: u64 },
    JobDone { path: PathBuf, generation: u64, result: Result<()> },
    Purged { path: PathBuf, result: Result<usize> },
    Reconciled(Result<IndexSummary>),
}

/// Runs one directory's [`DirectoryWatchState`] against real timers and the
/// shared worker pool.
pub struct WatchDriver {
    state: DirectoryWatchState,
    target: Arc<dyn IndexTarget>,
    notifier: Arc<dyn Notifier>,
    workers: Arc<Semaphore>,
    timers: JoinSet<Input>,
    jobs: JoinSet<Input>,
    reconciling: bool,
    reconcile_again: bool,
}

impl WatchDriver {
    pub fn new(
        dir: impl Into<PathBuf>,
        settings: WatchSettings,
        target: Arc<dyn IndexTarget>,
        notifier: Arc<dyn Notifier>,
        workers: Arc<Semaphore>,
    ) -> Self {
        Self {
            state: DirectoryWatchState::new(dir, settings),
            target,
            notifier,
            workers,
            timers: JoinSet::new(),
            jobs: JoinSet::new(),
            reconciling: false,
            reconcile_again: false,
        }
    }

    /// Process events until shutdown is signalled or the event stream ends.
    /// The directory is reconciled on start and again when the stream ends.
    /// Returns early only on an index-level failure.
    pub async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<WatchEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        self.execute(vec![WatchCommand::Reconcile]).await;

        let result = loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!(dir = %self.state.dir().display(), "watcher stopping");
                        break Ok(());
                    }
                }
                event = events.recv() => match event {
                    Some(WatchEvent::Changed { path, kind }) => {
                        tracing::debug!(path = %path.display(), ?kind, "filesystem event");
                        let commands = self.state.on_event(&path, kind);
                        self.execute(commands).await;
                    }
                    Some(WatchEvent::Rescan(reason)) => {
                        let commands = self.state.on_rescan(&reason);
                        self.execute(commands).await;
                    }
                    None => {
                        tracing::warn!(dir = %self.state.dir().display(), "event stream ended, reconciling");
                        break self.reconcile_at_end().await;
                    }
                },
                Some(joined) = self.timers.join_next() => {
                    if let Ok(input) = joined {
                        if let Err(e) = self.handle(input).await {
                            break Err(e);
                        }
                    }
                }
                Some(joined) = self.jobs.join_next() => match joined {
                    Ok(input) => {
                        if let Err(e) = self.handle(input).await {
                            break Err(e);
                        }
                    }
                    Err(e) => tracing::error!(error = %e, "watch job panicked"),
                },
            }
        };

        self.timers.abort_all();
        while self.jobs.join_next().await.is_some() {}
        result
    }

    async fn reconcile_at_end(&mut self) -> Result<()> {
        self.timers.abort_all();
        while self.jobs.join_next().await.is_some() {}
        let summary = self.target.reconcile(self.state.dir()).await?;
        tracing::info!(dir = %self.state.dir().display(), ?summary, "final reconciliation done");
        Ok(())
    }

    async fn handle(&mut self, input: Input) -> Result<()> {
        let commands = match input {
            Input::Quiescent { path, generation } => self.state.on_quiescent(&path, generation),
            Input::RetryDue { path, generation } => self.state.on_retry_due(&path, generation),
            Input::JobDone {
                path,
                generation,
                result,
            } => {
                let outcome = match result {
                    Ok(()) => JobOutcome::Succeeded,
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => {
                        let attempt = self.state.state(&path).map(|s| s.attempts + 1).unwrap_or(1);
                        tracing::warn!(path = %path.display(), attempt, error = %e, "watch job failed");
                        JobOutcome::Failed(e.to_string())
                    }
                };
                self.state.on_job_done(&path, generation, outcome)
            }
            Input::Purged { path, result } => {
                match result {
                    Ok(0) => {}
                    Ok(removed) => tracing::info!(path = %path.display(), removed, "dropped images below vanished path"),
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => tracing::error!(path = %path.display(), error = %e, "failed to drop vanished path"),
                }
                Vec::new()
            }
            Input::Reconciled(result) => {
                self.reconciling = false;
                match result {
                    Ok(summary) => {
                        tracing::info!(dir = %self.state.dir().display(), ?summary, "reconciled")
                    }
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => tracing::error!(dir = %self.state.dir().display(), error = %e, "reconciliation failed"),
                }
                if std::mem::take(&mut self.reconcile_again) {
                    vec![WatchCommand::Reconcile]
                } else {
                    Vec::new()
                }
            }
        };
        self.execute(commands).await;
        Ok(())
    }

    async fn execute(&mut self, commands: Vec<WatchCommand>) {
        for command in commands {
            match command {
                WatchCommand::ScheduleQuiescence {
                    path,
                    generation,
                    after,
                } => {
                    self.timers.spawn(async move {
                        tokio::time::sleep(after).await;
                        Input::Quiescent { path, generation }
                    });
                }
                WatchCommand::ScheduleRetry {
                    path,
                    generation,
                    after,
                } => {
                    tracing::debug!(path = %path.display(), ?after, "retry scheduled");
                    self.timers.spawn(async move {
                        tokio::time::sleep(after).await;
                        Input::RetryDue { path, generation }
                    });
                }
                WatchCommand::Dispatch {
                    path,
                    generation,
                    job,
                } => {
                    let target = self.target.clone();
                    let workers = self.workers.clone();
                    self.jobs.spawn(async move {
                        let _permit = workers.acquire_owned().await.ok();
                        let result = match job {
                            Job::Index if path.exists() => target.index(&path).await,
                            // Deleted before its index job ran
                            Job::Index | Job::Remove => target.remove(&path).await,
                        };
                        Input::JobDone {
                            path,
                            generation,
                            result,
                        }
                    });
                }
                WatchCommand::Abandon { path, reason } => {
                    tracing::error!(path = %path.display(), reason = %reason, "giving up on image");
                    if let Err(e) = self.target.abandon(&path).await {
                        tracing::error!(path = %path.display(), error = %e, "failed to abandon image");
                    }
                }
                WatchCommand::Notify { title, message } => {
                    self.notifier.notify(&title, &message).await;
                }
                WatchCommand::RemoveUnder { path } => {
                    let target = self.target.clone();
                    self.jobs.spawn(async move {
                        let result = target.remove_under(&path).await;
                        Input::Purged { path, result }
                    });
                }
                WatchCommand::Reconcile => {
                    if self.reconciling {
                        self.reconcile_again = true;
                        continue;
                    }
                    self.reconciling = true;
                    let target = self.target.clone();
                    let dir = self.state.dir().to_path_buf();
                    self.jobs.spawn(async move { Input::Reconciled(target.reconcile(&dir).await) });
                }
            }
        }
    }
}

impl std::fmt::Debug for WatchDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchDriver")
            .field("dir", &self.state.dir())
            .field("reconciling", &self.reconciling)
            .finish()
    }
}
