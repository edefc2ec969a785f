// Download pipeline
//
// Orchestrates one run: probe the tx CLI, discover projects, reconcile them
// against `.tx/config`, add what is missing, pull, and report. The run context
// (settings, state manager, metrics) is created by the caller and passed in.

use crate::metrics::Metrics;
use crate::models::{
    ConfigSnapshot, DownloaderSettings, OutputMode, Project, RunStage, format_elapsed,
};
use crate::services::discovery::{DiscoveryClient, ProjectSource};
use crate::services::lock::Locker;
use crate::services::monitor::{MonitorError, ProgressMonitor};
use crate::services::reconcile::{self, ConfigPlan};
use crate::services::remote::{AddRemoteOptions, RemoteAdder};
use crate::services::report::{MAX_ITEMS_TO_VISIT, Report, ReportGenerator, write_report};
use crate::services::sanitizer::{QuoteSanitizer, backup_path};
use crate::services::snapshot::ConfigSnapshotParser;
use crate::services::tx_cli::{self, TxCli};
use crate::state::StateManager;
use anyhow::{Context, Result, bail};
use camino::{Utf8Path, Utf8PathBuf};
use std::collections::BTreeSet;
use std::fs;
use std::future::Future;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;

/// Characters of error detail carried into the final message.
const ERROR_DETAIL_LIMIT: usize = 500;

/// Final result of a run. A report is always attempted, whatever happened.
#[derive(Debug)]
pub struct RunOutcome {
    pub success: bool,
    pub message: String,
    pub work_dir: Utf8PathBuf,
    pub report: Report,
    pub report_path: Option<Utf8PathBuf>,
    /// Set when the run aborted on an infrastructure failure
    pub error: Option<anyhow::Error>,
}

/// One bulk download run.
pub struct BulkDownloader<S> {
    settings: DownloaderSettings,
    discovery: DiscoveryClient<S>,
    cli: TxCli,
    state: StateManager,
    metrics: Arc<Metrics>,
    work_dir: Utf8PathBuf,
}

impl<S: ProjectSource> BulkDownloader<S> {
    /// Create a run whose working directory is resolved against `base_dir`.
    pub fn new(settings: DownloaderSettings, source: S, cli: TxCli, base_dir: &Utf8Path) -> Self {
        let work_dir = settings.work_dir(base_dir);
        Self {
            settings,
            discovery: DiscoveryClient::new(source),
            cli,
            state: StateManager::new(),
            metrics: Arc::new(Metrics::new()),
            work_dir,
        }
    }

    /// Use an existing state manager, e.g. one a renderer already subscribed to.
    pub fn with_state(mut self, state: StateManager) -> Self {
        self.state = state;
        self
    }

    pub fn state(&self) -> &StateManager {
        &self.state
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn work_dir(&self) -> &Utf8Path {
        &self.work_dir
    }

    /// Run to completion.
    pub async fn run(&self) -> RunOutcome {
        self.run_with_shutdown(std::future::pending()).await
    }

    /// Run until done or until `shutdown` resolves.
    ///
    /// On shutdown the in-flight stage is dropped: live children are killed,
    /// a held config lock is released, and the report is still written.
    pub async fn run_with_shutdown<F>(&self, shutdown: F) -> RunOutcome
    where
        F: Future<Output = ()>,
    {
        let result = tokio::select! {
            result = self.execute() => result,
            _ = shutdown => {
                tracing::warn!("Shutdown requested, stopping run");
                Err(anyhow::anyhow!("Download interrupted by user"))
            }
        };

        let (success, message, error) = match result {
            Ok((success, message)) => (success, message, None),
            Err(e) => (false, format!("{:#}", e), Some(e)),
        };

        self.state.set_stage(RunStage::Reporting);
        let report = ReportGenerator::new().summarize(&self.work_dir, MAX_ITEMS_TO_VISIT);
        let report_path = match write_report(&self.work_dir, success, &message, report.file_count) {
            Ok(path) => Some(path),
            Err(e) => {
                tracing::warn!("Could not write report: {:#}", e);
                None
            }
        };
        self.state.set_stage(RunStage::Finished);
        self.metrics.log_summary();

        RunOutcome {
            success,
            message,
            work_dir: self.work_dir.clone(),
            report,
            report_path,
            error,
        }
    }

    async fn execute(&self) -> Result<(bool, String)> {
        self.state.set_stage(RunStage::Discovering);

        self.cli.probe_version().await?;

        let org = self.settings.organization_slug.as_str();
        let name = self.discovery.validate_organization(org).await?;
        self.state.notify(format!("Organization found: {}", name));

        let projects = self.discover(org).await?;
        if projects.is_empty() {
            bail!("No projects found to process");
        }

        fs::create_dir_all(&self.work_dir)
            .with_context(|| format!("Failed to create working directory: {}", self.work_dir))?;

        self.configure(&projects).await?;

        self.state.set_stage(RunStage::Downloading);
        Ok(self.pull().await)
    }

    async fn discover(&self, org: &str) -> Result<Vec<Project>> {
        let projects = match self.settings.wanted_projects() {
            Some(wanted) => {
                let wanted: BTreeSet<String> = wanted.into_iter().collect();
                let found = self
                    .discovery
                    .list_wanted_projects(org, &wanted)
                    .await
                    .context("Failed to discover projects")?;
                self.state.notify(format!(
                    "Found {} of {} requested project(s)",
                    found.len(),
                    wanted.len()
                ));
                found
            }
            None => {
                let found = self
                    .discovery
                    .list_projects(org)
                    .await
                    .context("Failed to discover projects")?;
                self.state.notify(format!("Found {} project(s) in organization", found.len()));
                found
            }
        };
        Ok(projects)
    }

    fn config_path(&self) -> Utf8PathBuf {
        RemoteAdder::config_path(&self.work_dir)
    }

    fn parser(&self) -> ConfigSnapshotParser {
        ConfigSnapshotParser::new(self.settings.organization_slug.clone())
    }

    /// Bring `.tx/config` in line with the discovered projects per the configured policy.
    async fn configure(&self, projects: &[Project]) -> Result<()> {
        let config_path = self.config_path();

        if config_path.exists() {
            self.sanitize_locked(&config_path).await;
        }

        let snapshot = self.parser().parse(&config_path);
        let diff = reconcile::reconcile(projects, &snapshot);

        if snapshot.exists {
            self.state.notify(format!(
                "Found existing Transifex configuration in {}",
                self.work_dir
            ));
            for line in snapshot.status_lines(projects.len(), &diff.missing_projects) {
                self.state.notify(line);
            }
            self.report_extra_projects(&diff.extra_projects);
        }

        let plan = reconcile::plan(projects, &snapshot, &diff, self.settings.existing_config);
        match &plan {
            ConfigPlan::Initialize { .. } => {
                self.state.notify(format!(
                    "Initializing new Transifex project in {}",
                    self.work_dir
                ));
                self.init_locked(&config_path, false).await?;
            }
            ConfigPlan::StartFresh { .. } => {
                self.state.notify("Starting fresh: backing up existing configuration");
                self.init_locked(&config_path, true).await?;
            }
            ConfigPlan::Extend { add } => {
                self.state.notify(format!("Will add {} new project(s)", add.len()));
            }
            ConfigPlan::UseAsIs => {
                self.state.notify("Using existing configuration");
                return Ok(());
            }
        }

        let to_add = plan.projects_to_add();
        let added = self.add_projects(to_add).await;
        if added == 0 {
            bail!("No projects were successfully configured");
        }

        self.sanitize_locked(&config_path).await;
        let recount: ConfigSnapshot = self.parser().parse(&config_path);
        if recount.total_resources() > 0 {
            self.state.notify(format!(
                "{} resources in configuration",
                recount.total_resources()
            ));
        } else {
            tracing::warn!("Projects were added but no resources found");
            self.state.notify(
                "WARNING: projects were added but no resources found; they may be empty \
                 or the file filter may not match",
            );
        }

        Ok(())
    }

    fn report_extra_projects(&self, extra: &BTreeSet<String>) {
        if extra.is_empty() {
            return;
        }
        self.state.notify(format!(
            "{} projects in config but not in your current selection:",
            extra.len()
        ));
        for slug in extra.iter().take(3) {
            self.state.notify(format!("  - {}", slug));
        }
        if extra.len() > 3 {
            self.state.notify(format!("  ... and {} more", extra.len() - 3));
        }
    }

    /// Quote-fix the config inside the config lock. Failures only warn.
    async fn sanitize_locked(&self, config_path: &Utf8Path) {
        let lock = match Locker::acquire(
            &Locker::lock_path_for(config_path),
            self.settings.add_remote_timeout(),
        )
        .await
        {
            Ok(lock) => lock,
            Err(e) => {
                tracing::warn!("Skipping quote fix: {}", e);
                return;
            }
        };
        if QuoteSanitizer::new().sanitize(config_path) {
            self.state.notify("Fixed quote issues in .tx/config (backup saved)");
        }
        lock.release();
    }

    /// `tx init` inside the config lock, optionally backing up and removing the old config.
    async fn init_locked(&self, config_path: &Utf8Path, start_fresh: bool) -> Result<()> {
        let _lock = Locker::acquire(
            &Locker::lock_path_for(config_path),
            self.settings.add_remote_timeout(),
        )
        .await?;

        if start_fresh && config_path.exists() {
            let backup = backup_path(config_path);
            fs::copy(config_path, &backup)
                .with_context(|| format!("Failed to back up {} to {}", config_path, backup))?;
            self.state.notify(format!("Backed up existing config to: {}", backup));
            fs::remove_file(config_path)
                .with_context(|| format!("Failed to remove {}", config_path))?;
        }

        self.cli
            .init(&self.work_dir)
            .await
            .context("Failed to initialize tx project")?;
        Ok(())
    }

    /// Add projects one at a time; failures are counted, never fatal.
    async fn add_projects(&self, projects: &[Project]) -> usize {
        let started = Instant::now();
        self.state.start_configuring(projects.len());

        let adder = RemoteAdder::new(self.cli.clone(), self.settings.clone());
        let options = AddRemoteOptions::from_settings(&self.settings);
        let mut added = 0usize;
        let mut resources = 0usize;

        for project in projects {
            let project_started = Instant::now();
            let outcome = adder.add_remote(project, &self.work_dir, &options).await;
            self.metrics.record_add_time(project_started.elapsed());

            if outcome.success {
                added += 1;
                resources += outcome.resources_added;
                self.metrics.record_project_added(outcome.resources_added);
            } else {
                self.metrics.record_project_failed();
                tracing::error!("Failed to add {}: {}", project.slug, outcome.error_message);
            }

            let changes = self.state.record_project(
                &project.slug,
                outcome.success,
                outcome.resources_added,
                outcome.error_message,
            );
            self.metrics.record_render_events(changes.len());
        }

        let elapsed = started.elapsed().as_secs_f64();
        self.state.notify(format!(
            "Configuration complete in {:.1}s: {} projects succeeded ({} resources), {} failed",
            elapsed,
            added,
            resources,
            projects.len() - added
        ));
        added
    }

    /// Run `tx pull` in the configured output mode. Never fails; the outcome is in the message.
    async fn pull(&self) -> (bool, String) {
        let mode = self.settings.output_mode();
        let args = tx_cli::pull_args(&self.settings, mode == OutputMode::Silent);
        let limit = self.settings.pull_timeout();

        self.state.notify(format!("Command: {}", self.cli.display(&args)));
        self.state.notify(format!("Working directory: {}", self.work_dir));
        self.state
            .notify(format!("Workers: {}", self.settings.effective_workers()));
        self.state.update(|state| state.reset_pull_progress());

        let started = Instant::now();
        let timed_out = || {
            (
                false,
                format!("Download timed out after {}", format_elapsed(limit.as_secs())),
            )
        };
        let finished = |code: i32, detail: &str| {
            if code == 0 {
                (
                    true,
                    format!(
                        "Download completed successfully in {:.1}s",
                        started.elapsed().as_secs_f64()
                    ),
                )
            } else if detail.trim().is_empty() {
                (false, format!("Download failed with exit code {}", code))
            } else {
                let detail: String = detail.trim().chars().take(ERROR_DETAIL_LIMIT).collect();
                (
                    false,
                    format!("Download failed with exit code {}\nError: {}", code, detail),
                )
            }
        };

        match mode {
            OutputMode::Monitored => {
                let monitor = ProgressMonitor::new(self.state.clone(), Arc::clone(&self.metrics));
                match monitor.run(&self.cli, &self.work_dir, &args, limit).await {
                    Ok(outcome) => finished(outcome.return_code, &outcome.error_lines.join("\n")),
                    Err(MonitorError::Timeout(_)) => timed_out(),
                    Err(e) => (false, format!("Download failed with error: {}", e)),
                }
            }
            OutputMode::Silent => match self.cli.run_captured(&self.work_dir, &args, limit).await {
                Ok(output) => finished(
                    output.status.code().unwrap_or(-1),
                    &tx_cli::failure_detail(&output),
                ),
                Err(tx_cli::ToolError::Timeout { .. }) => timed_out(),
                Err(e) => (false, format!("Download failed with error: {}", e)),
            },
            OutputMode::Passthrough => {
                let spawned = self
                    .cli
                    .command(&self.work_dir, &args)
                    .stdin(Stdio::inherit())
                    .stdout(Stdio::inherit())
                    .stderr(Stdio::inherit())
                    .spawn();
                let mut child = match spawned {
                    Ok(child) => child,
                    Err(e) => return (false, format!("Download failed with error: {}", e)),
                };
                match tokio::time::timeout(limit, child.wait()).await {
                    Ok(Ok(status)) => finished(status.code().unwrap_or(-1), ""),
                    Ok(Err(e)) => (false, format!("Download failed with error: {}", e)),
                    Err(_) => {
                        if let Err(e) = child.kill().await {
                            tracing::warn!("Failed to kill tx pull: {}", e);
                        }
                        timed_out()
                    }
                }
            }
        }
    }
}
