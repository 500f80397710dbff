//! Per-directory watch state machine.
//!
//! Pure: every input returns the commands the driver has to carry out, and
//! nothing here sleeps or touches the filesystem. Timer expiries and job
//! completions come back in tagged with the generation they were issued for,
//! so anything superseded by a newer event is dropped.
//!
//! Per path: Idle (not tracked) → Pending → Processing → Idle, or
//! Processing → Backoff → Processing, ending in Failed once the retry budget
//! is spent.

use crate::utils;
use crate::watch::events::FsEventKind;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchSettings {
    /// Quiet period a path must see before it is indexed
    pub debounce: Duration,
    /// Failures tolerated before a path is abandoned
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(1500),
            max_attempts: 5,
            backoff_base: Duration::from_millis(2000),
            backoff_max: Duration::from_millis(60_000),
        }
    }
}

impl WatchSettings {
    /// Delay before retry number `attempt` (1-based): `min(base * 2^(attempt-1), max)`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.backoff_base
            .checked_mul(1u32 << exponent)
            .map(|d| d.min(self.backoff_max))
            .unwrap_or(self.backoff_max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Job {
    Index,
    Remove,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchCommand {
    ScheduleQuiescence {
        path: PathBuf,
        generation: u64,
        after: Duration,
    },
    Dispatch {
        path: PathBuf,
        generation: u64,
        job: Job,
    },
    ScheduleRetry {
        path: PathBuf,
        generation: u64,
        after: Duration,
    },
    Abandon {
        path: PathBuf,
        reason: String,
    },
    Notify {
        title: String,
        message: String,
    },
    /// Drop every image recorded below a path that went away and was not
    /// itself an image, such as a directory moved out of the tree
    RemoveUnder {
        path: PathBuf,
    },
    Reconcile,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Waiting for the debounce window of the latest event to pass
    Pending,
    /// A job is running; `queued` is what the newest event asks for next
    Processing { job: Job, queued: Option<Job> },
    /// Waiting to retry `job`
    Backoff { job: Job },
    /// Retry budget exhausted; only a new filesystem event revives the path
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathState {
    /// Generation of the newest input for this path
    pub generation: u64,
    pub phase: Phase,
    /// Consecutive failures of the current content
    pub attempts: u32,
}

#[derive(Debug)]
pub struct DirectoryWatchState {
    dir: PathBuf,
    settings: WatchSettings,
    paths: HashMap<PathBuf, PathState>,
    next_generation: u64,
}

impl DirectoryWatchState {
    pub fn new(dir: impl Into<PathBuf>, settings: WatchSettings) -> Self {
        Self {
            dir: dir.into(),
            settings,
            paths: HashMap::new(),
            next_generation: 0,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn settings(&self) -> &WatchSettings {
        &self.settings
    }

    pub fn state(&self, path: &Path) -> Option<&PathState> {
        self.paths.get(path)
    }

    /// No path has pending or running work.
    pub fn is_idle(&self) -> bool {
        self.paths.values().all(|s| s.phase == Phase::Failed)
    }

    pub fn on_event(&mut self, path: &Path, kind: FsEventKind) -> Vec<WatchCommand> {
        if !utils::is_supported_image(path) {
            return match kind {
                FsEventKind::Deleted => vec![WatchCommand::RemoveUnder {
                    path: path.to_path_buf(),
                }],
                FsEventKind::Created | FsEventKind::Modified => Vec::new(),
            };
        }
        let generation = self.bump();
        let wanted = match kind {
            FsEventKind::Deleted => Job::Remove,
            FsEventKind::Created | FsEventKind::Modified => Job::Index,
        };

        if let Some(state) = self.paths.get_mut(path) {
            if let Phase::Processing { job, .. } = state.phase {
                // Same path never runs twice at once; run it after the current job
                state.generation = generation;
                state.phase = Phase::Processing {
                    job,
                    queued: Some(wanted),
                };
                state.attempts = 0;
                return Vec::new();
            }
        }

        match wanted {
            Job::Remove => {
                self.paths.insert(
                    path.to_path_buf(),
                    PathState {
                        generation,
                        phase: Phase::Processing {
                            job: Job::Remove,
                            queued: None,
                        },
                        attempts: 0,
                    },
                );
                vec![WatchCommand::Dispatch {
                    path: path.to_path_buf(),
                    generation,
                    job: Job::Remove,
                }]
            }
            Job::Index => {
                self.paths.insert(
                    path.to_path_buf(),
                    PathState {
                        generation,
                        phase: Phase::Pending,
                        attempts: 0,
                    },
                );
                vec![WatchCommand::ScheduleQuiescence {
                    path: path.to_path_buf(),
                    generation,
                    after: self.settings.debounce,
                }]
            }
        }
    }

    /// The debounce timer issued for `generation` expired.
    pub fn on_quiescent(&mut self, path: &Path, generation: u64) -> Vec<WatchCommand> {
        match self.paths.get_mut(path) {
            Some(state) if state.generation == generation && state.phase == Phase::Pending => {
                state.phase = Phase::Processing {
                    job: Job::Index,
                    queued: None,
                };
                vec![WatchCommand::Dispatch {
                    path: path.to_path_buf(),
                    generation,
                    job: Job::Index,
                }]
            }
            _ => Vec::new(),
        }
    }

    /// The backoff timer issued for `generation` expired.
    pub fn on_retry_due(&mut self, path: &Path, generation: u64) -> Vec<WatchCommand> {
        match self.paths.get_mut(path) {
            Some(state) if state.generation == generation => {
                let Phase::Backoff { job } = state.phase else {
                    return Vec::new();
                };
                state.phase = Phase::Processing { job, queued: None };
                vec![WatchCommand::Dispatch {
                    path: path.to_path_buf(),
                    generation,
                    job,
                }]
            }
            _ => Vec::new(),
        }
    }

    /// A dispatched job finished.
    pub fn on_job_done(&mut self, path: &Path, generation: u64, outcome: JobOutcome) -> Vec<WatchCommand> {
        let Some(state) = self.paths.get(path).copied() else {
            return Vec::new();
        };
        let Phase::Processing { job, queued } = state.phase else {
            return Vec::new();
        };

        if let Some(next) = queued {
            // A newer event arrived while the job ran; its outcome is moot
            return self.start_queued(path, state.generation, next);
        }
        if state.generation != generation {
            return Vec::new();
        }

        match outcome {
            JobOutcome::Succeeded => {
                self.paths.remove(path);
                Vec::new()
            }
            JobOutcome::Failed(error) => self.fail(path, state, job, error),
        }
    }

    /// The watcher lost events or failed.
    pub fn on_rescan(&mut self, reason: &str) -> Vec<WatchCommand> {
        tracing::warn!(dir = %self.dir.display(), reason, "rescan requested");
        vec![WatchCommand::Reconcile]
    }

    fn start_queued(&mut self, path: &Path, generation: u64, next: Job) -> Vec<WatchCommand> {
        let (phase, command) = match next {
            Job::Remove => (
                Phase::Processing {
                    job: Job::Remove,
                    queued: None,
                },
                WatchCommand::Dispatch {
                    path: path.to_path_buf(),
                    generation,
                    job: Job::Remove,
                },
            ),
            Job::Index => (
                Phase::Pending,
                WatchCommand::ScheduleQuiescence {
                    path: path.to_path_buf(),
                    generation,
                    after: self.settings.debounce,
                },
            ),
        };
        self.paths.insert(
            path.to_path_buf(),
            PathState {
                generation,
                phase,
                attempts: 0,
            },
        );
        vec![command]
    }

    fn fail(&mut self, path: &Path, state: PathState, job: Job, error: String) -> Vec<WatchCommand> {
        let attempts = state.attempts + 1;
        if attempts >= self.settings.max_attempts {
            self.paths.insert(
                path.to_path_buf(),
                PathState {
                    generation: state.generation,
                    phase: Phase::Failed,
                    attempts,
                },
            );
            return vec![
                WatchCommand::Abandon {
                    path: path.to_path_buf(),
                    reason: error.clone(),
                },
                WatchCommand::Notify {
                    title: "Image indexing failed".to_string(),
                    message: format!(
                        "Gave up on {} after {} attempts: {}",
                        path.display(),
                        attempts,
                        error
                    ),
                },
            ];
        }

        let generation = self.bump();
        let after = self.settings.backoff_delay(attempts);
        self.paths.insert(
            path.to_path_buf(),
            PathState {
                generation,
                phase: Phase::Backoff { job },
                attempts,
            },
        );
        vec![WatchCommand::ScheduleRetry {
            path: path.to_path_buf(),
            generation,
            after,
        }]
    }

    fn bump(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }
}
