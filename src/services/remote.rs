use crate::models::{ConfigSnapshot, DownloaderSettings, Project};
use crate::services::lock::{LockError, Locker};
use crate::services::snapshot::ConfigSnapshotParser;
use crate::services::tx_cli::{self, ToolError, TxCli};
use camino::{Utf8Path, Utf8PathBuf};
use std::time::Duration;

/// Outcome of adding one project to `.tx/config`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddRemoteOutcome {
    pub success: bool,
    pub error_message: String,
    pub resources_added: usize,
}

impl AddRemoteOutcome {
    fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error_message: message.into(),
            resources_added: 0,
        }
    }
}

/// Per-call options for `tx add remote`.
#[derive(Debug, Clone)]
pub struct AddRemoteOptions {
    pub file_filter: String,
    pub minimum_perc: u32,
    pub timeout: Duration,
}

impl AddRemoteOptions {
    pub fn from_settings(settings: &DownloaderSettings) -> Self {
        Self {
            file_filter: settings.sanitized_file_filter(),
            minimum_perc: settings.minimum_perc,
            timeout: settings.add_remote_timeout(),
        }
    }
}

/// Adds projects to `.tx/config` through `tx add remote`, one at a time.
///
/// Each invocation runs inside the config lock. The number of resources a
/// project contributed is measured by re-reading the config's section headers
/// before and after the command, inside the same critical section.
pub struct RemoteAdder {
    cli: TxCli,
    parser: ConfigSnapshotParser,
    settings: DownloaderSettings,
}

impl RemoteAdder {
    pub fn new(cli: TxCli, settings: DownloaderSettings) -> Self {
        Self {
            parser: ConfigSnapshotParser::new(settings.organization_slug.clone()),
            cli,
            settings,
        }
    }

    /// Path of `.tx/config` inside `work_dir`.
    pub fn config_path(work_dir: &Utf8Path) -> Utf8PathBuf {
        work_dir.join(".tx").join("config")
    }

    /// Add a single project. Never fails: every problem is reported in the outcome.
    pub async fn add_remote(
        &self,
        project: &Project,
        work_dir: &Utf8Path,
        options: &AddRemoteOptions,
    ) -> AddRemoteOutcome {
        let config_path = Self::config_path(work_dir);
        let lock_path = Locker::lock_path_for(&config_path);

        let _lock = match Locker::acquire(&lock_path, options.timeout).await {
            Ok(handle) => handle,
            Err(e @ LockError::Timeout { .. }) => {
                tracing::warn!("Project {}: {}", project.slug, e);
                return AddRemoteOutcome::failed(e.to_string());
            }
            Err(e) => return AddRemoteOutcome::failed(e.to_string()),
        };

        let before = self.count_for(&config_path, &project.slug);

        let url = self.settings.project_url(&project.slug);
        let args = tx_cli::add_remote_args(&options.file_filter, options.minimum_perc, &url);

        let output = match self.cli.run_captured(work_dir, &args, options.timeout).await {
            Ok(output) => output,
            Err(ToolError::Timeout { timeout, .. }) => {
                return AddRemoteOutcome::failed(format!("Timeout after {}s", timeout.as_secs()));
            }
            Err(e) => return AddRemoteOutcome::failed(e.to_string()),
        };

        if !output.status.success() {
            let detail = tx_cli::failure_detail(&output);
            tracing::warn!("Project {} failed: {}", project.slug, detail);
            tracing::debug!("Command: {}", self.cli.display(&args));
            tracing::debug!("Return code: {:?}", output.status.code());
            return AddRemoteOutcome::failed(detail);
        }

        let after = self.count_for(&config_path, &project.slug);
        let resources_added = after.saturating_sub(before);
        if resources_added == 0 {
            tracing::info!("Project {} succeeded but has no resources", project.slug);
        }

        AddRemoteOutcome {
            success: true,
            error_message: String::new(),
            resources_added,
        }
    }

    fn count_for(&self, config_path: &Utf8Path, project_slug: &str) -> usize {
        let snapshot: ConfigSnapshot = self.parser.parse(config_path);
        snapshot.resources_for(project_slug)
    }
}
