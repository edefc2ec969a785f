//! Data models for txbulk.
//!
//! - [`DownloaderSettings`]: Persisted run settings loaded from `txbulk.json`
//! - [`Project`], [`ResourceEntry`], [`ConfigSnapshot`], [`DiffResult`]: discovery and
//!   `.tx/config` reconciliation values
//! - [`ProgressState`], [`Phase`]: progress of a monitored `tx pull`
//! - [`RunState`]: Runtime state of a run, wrapped by [`StateManager`](crate::state::StateManager)

pub mod progress;
pub mod project;
pub mod run_state;
pub mod settings;

pub use progress::{Phase, ProgressState, format_elapsed};
pub use project::{ConfigSnapshot, DiffResult, Project, ResourceEntry};
pub use run_state::{RunStage, RunState};
pub use settings::{DownloadMode, DownloaderSettings, ExistingConfigPolicy, OutputMode};
