//! Services module - the building blocks of a bulk download run.
//!
//! Every service is usable on its own and has no knowledge of the terminal
//! renderer. [`crate::pipeline::BulkDownloader`] wires them together.
//!
//! # Components
//!
//! - [`DiscoveryClient`] over a [`ProjectSource`]: paginated project listing from the
//!   Transifex REST API ([`TransifexApi`]) or any in-memory source
//! - [`ConfigSnapshotParser`]: streaming read of `.tx/config` into a [`ConfigSnapshot`](crate::models::ConfigSnapshot)
//! - [`QuoteSanitizer`]: repairs quote characters in `file_filter`, `source_file` and
//!   `resource_name` lines, with a backup
//! - [`Locker`]: cross-process advisory lock guarding `.tx/config` mutation
//! - [`RemoteAdder`]: runs `tx add remote` under the lock and counts new resources
//! - [`reconcile()`] and [`plan()`]: discovered projects versus configured projects
//! - [`ProgressMonitor`]: drives `tx pull` through a pty and turns its output into progress
//! - [`ReportGenerator`]: bounded walk of the output tree plus the run report file
//!
//! # tx CLI integration
//!
//! All subprocesses go through [`TxCli`]. The API token only ever travels in the
//! `TX_TOKEN` environment variable of the child, never on the command line.
//!
//! ```ignore
//! use txbulk::services::{RemoteAdder, AddRemoteOptions, TxCli};
//!
//! let cli = TxCli::new("tx", Some(token));
//! let adder = RemoteAdder::new(cli, settings.clone());
//! let outcome = adder
//!     .add_remote(&project, &work_dir, &AddRemoteOptions::from_settings(&settings))
//!     .await;
//! ```

pub mod discovery;
pub mod lock;
pub mod monitor;
pub mod output;
pub mod reconcile;
pub mod remote;
pub mod report;
pub mod sanitizer;
pub mod snapshot;
pub mod tx_cli;

pub use discovery::{DiscoveryClient, DiscoveryError, ProjectPage, ProjectSource, TransifexApi};
pub use lock::{LockError, LockHandle, Locker};
pub use monitor::{FinalOutcome, MonitorError, ProgressMonitor, ProgressTracker};
pub use reconcile::{ConfigPlan, plan, reconcile};
pub use remote::{AddRemoteOptions, AddRemoteOutcome, RemoteAdder};
pub use report::{Report, ReportGenerator, write_report};
pub use sanitizer::{QuoteFixError, QuoteSanitizer, SanitizeOutcome};
pub use snapshot::{ConfigParseError, ConfigSnapshotParser};
pub use tx_cli::{ToolError, TxCli};
