pub mod driver;
pub mod events;
pub mod state;

pub use driver::{IndexTarget, WatchDriver};
pub use events::{FileWatcher, FsEventKind, WatchEvent};
pub use state::{DirectoryWatchState, Job, JobOutcome, Phase, WatchCommand, WatchSettings};
