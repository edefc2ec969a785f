// txbulk - Bulk downloader for Transifex organizations
//
// This is the library crate containing discovery, `.tx/config` handling and the
// tx CLI orchestration. The binary crate (main.rs) provides the terminal front end.

pub mod config;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod pipeline;
pub mod services;
pub mod state;

// Re-export commonly used types for convenience
pub use config::SettingsManager;
pub use models::{DownloaderSettings, Project, RunStage, RunState};
pub use pipeline::{BulkDownloader, RunOutcome};
pub use state::{StateChange, StateManager};

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
