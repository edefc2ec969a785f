//! txbulk - bulk downloader for Transifex organizations
//!
//! Main entry point for the command-line tool.
//!
//! # Overview
//!
//! This binary crate wires the library together for a terminal session:
//! - Logging infrastructure (daily rotating file, console in `--debug`)
//! - Settings loading ([`SettingsManager`]) with command-line overrides
//! - Tokio async runtime for the API client and the tx subprocesses
//! - A renderer task subscribed to [`StateChange`] events, drawing `indicatif` bars
//!
//! # Execution Flow
//!
//! 1. Parse arguments, optionally write a default settings file and exit
//! 2. Initialize logging → logs/txbulk.<date>
//! 3. Load and validate `txbulk.json` (plus `TXBULK_*` overrides)
//! 4. Run [`BulkDownloader`] until done or ctrl-c
//! 5. Print the report summary, flush logs, exit 0 on success and 1 otherwise

use anyhow::{Context, Result, bail};
use camino::Utf8PathBuf;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use std::process::ExitCode;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use txbulk::config::{self, DEFAULT_SETTINGS_FILE};
use txbulk::logging::{self, LOG_PREFIX};
use txbulk::services::tx_cli::INSTALL_GUIDANCE;
use txbulk::services::{DiscoveryError, ToolError, TransifexApi, TxCli};
use txbulk::{
    APP_NAME, BulkDownloader, DownloaderSettings, RunOutcome, RunStage, SettingsManager,
    StateChange, VERSION,
};

/// Fallback environment variable for the API token.
const LEGACY_TOKEN_ENV: &str = "TRANSIFEX_API_TOKEN";

/// Download every project of a Transifex organization with the official tx CLI
#[derive(Parser, Debug)]
#[command(name = "txbulk")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Settings file (JSON)
    #[arg(long, value_name = "FILE", default_value = DEFAULT_SETTINGS_FILE)]
    settings: Utf8PathBuf,

    /// Organization slug, overrides the settings file
    #[arg(long, value_name = "SLUG")]
    org: Option<String>,

    /// Only download these projects (repeatable)
    #[arg(long = "project", value_name = "SLUG")]
    projects: Vec<String>,

    /// Output directory for the tx project
    #[arg(long, value_name = "DIR")]
    output: Option<Utf8PathBuf>,

    /// Concurrent downloads for `tx pull` (max 30)
    #[arg(long, value_name = "N")]
    workers: Option<u32>,

    /// Debug logging, also mirrored to the console
    #[arg(long)]
    debug: bool,

    /// Directory for log files
    #[arg(long, value_name = "DIR", default_value = "logs")]
    log_dir: Utf8PathBuf,

    /// Write a settings file with default values and exit
    #[arg(long)]
    write_default_settings: bool,

    /// Transifex API token
    #[arg(long, env = "TX_TOKEN", hide_env_values = true)]
    token: Option<String>,
}

impl Cli {
    fn apply_overrides(&self, settings: &mut DownloaderSettings) {
        if let Some(org) = &self.org {
            settings.organization_slug = org.clone();
        }
        if !self.projects.is_empty() {
            settings.project_slugs = Some(self.projects.clone());
        }
        if let Some(output) = &self.output {
            settings.output_directory = Some(output.clone());
        }
        if let Some(workers) = self.workers {
            settings.workers = workers;
        }
    }

    fn resolve_token(&self) -> Option<String> {
        self.token
            .clone()
            .or_else(|| std::env::var(LEGACY_TOKEN_ENV).ok())
            .map(|token| token.trim().to_string())
            .filter(|token| !token.is_empty())
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<bool> {
    let manager = SettingsManager::new(&cli.settings);

    if cli.write_default_settings {
        manager.save(&DownloaderSettings::default())?;
        println!("Default settings written to {}", manager.settings_path());
        println!("Set organization_slug and run again.");
        return Ok(true);
    }

    // Held until the end of the run; dropping it flushes the log file
    let _guard = logging::setup_logging(&cli.log_dir, LOG_PREFIX, cli.debug, cli.debug)?;
    tracing::info!("Starting {} v{}", APP_NAME, VERSION);

    let mut settings = manager.load()?;
    cli.apply_overrides(&mut settings);
    config::validate(&settings)?;

    let Some(token) = cli.resolve_token() else {
        bail!(
            "No API token found. Pass --token or set TX_TOKEN (or {}).",
            LEGACY_TOKEN_ENV
        );
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("txbulk-worker")
        .build()
        .context("Failed to create tokio runtime")?;

    let outcome = runtime.block_on(download(settings, token))?;
    runtime.shutdown_timeout(Duration::from_secs(5));

    print_outcome(&outcome);
    tracing::info!("Run finished: success={}", outcome.success);
    Ok(outcome.success)
}

async fn download(settings: DownloaderSettings, token: String) -> Result<RunOutcome> {
    let source = TransifexApi::new(settings.api_base_url.clone(), token.clone())?;
    let cli = TxCli::new(settings.tx_binary.clone(), Some(token));
    let base_dir = Utf8PathBuf::try_from(std::env::current_dir()?)
        .context("Current directory is not valid UTF-8")?;

    let downloader = BulkDownloader::new(settings, source, cli, &base_dir);
    println!("Working directory: {}", downloader.work_dir());

    let renderer = tokio::spawn(render(downloader.state().subscribe()));

    let outcome = downloader
        .run_with_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!("Could not listen for ctrl-c: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await;

    if let Err(e) = renderer.await {
        tracing::warn!("Renderer task failed: {}", e);
    }
    Ok(outcome)
}

fn print_outcome(outcome: &RunOutcome) {
    println!();
    println!("{}", "=".repeat(60));
    for line in outcome
        .report
        .summary_lines(&outcome.work_dir, outcome.success, &outcome.message)
    {
        println!("{}", line);
    }
    if let Some(path) = &outcome.report_path {
        println!("Report saved to: {}", path);
    }
    println!("{}", "=".repeat(60));

    let Some(error) = &outcome.error else {
        return;
    };
    if let Some(ToolError::Missing { .. }) = error.downcast_ref::<ToolError>() {
        eprintln!();
        eprintln!("{}", INSTALL_GUIDANCE);
    } else if error
        .downcast_ref::<DiscoveryError>()
        .is_some_and(DiscoveryError::is_auth)
    {
        eprintln!();
        eprintln!("Check that the API token is valid and can read the organization.");
    }
}

/// Draws state change events; returns once the run reaches [`RunStage::Finished`].
async fn render(mut events: broadcast::Receiver<StateChange>) {
    let mut renderer = Renderer::default();
    loop {
        match events.recv().await {
            Ok(StateChange::StageChanged {
                stage: RunStage::Finished,
            }) => break,
            Ok(change) => renderer.apply(change),
            Err(RecvError::Lagged(skipped)) => {
                tracing::debug!("Renderer skipped {} events", skipped);
            }
            Err(RecvError::Closed) => break,
        }
    }
    renderer.finish();
}

#[derive(Default)]
struct Renderer {
    bar: Option<ProgressBar>,
}

impl Renderer {
    fn apply(&mut self, change: StateChange) {
        match change {
            StateChange::StageChanged { stage } => {
                self.finish();
                tracing::debug!("Stage: {:?}", stage);
            }
            StateChange::ConfigurationProgress { processed, total } => {
                let bar = self.bar_with_length(total as u64, "Configuring projects");
                bar.set_position(processed as u64);
            }
            StateChange::ProjectProcessed {
                project,
                success,
                resources_added,
                message,
            } => {
                if success {
                    self.line(format!("  + {} ({} resources)", project, resources_added));
                } else {
                    self.line(format!("  x {}: {}", project, message));
                }
            }
            StateChange::PhaseChanged { phase } => {
                self.finish();
                self.bar_with_length(0, &phase.to_string());
            }
            StateChange::ProgressUpdated {
                phase,
                current,
                total,
            } => {
                let bar = self.bar_with_length(total, &phase.to_string());
                bar.set_position(current);
            }
            StateChange::PhaseCompleted { phase, total } => {
                if let Some(bar) = self.bar.take() {
                    bar.finish_with_message(format!("{} ({} total)", phase, total));
                }
            }
            StateChange::ErrorLine { line } => self.line(format!("  ! {}", line)),
            StateChange::Notice { message } => self.line(message),
        }
    }

    fn bar_with_length(&mut self, length: u64, message: &str) -> &ProgressBar {
        let bar = self.bar.get_or_insert_with(|| {
            let bar = ProgressBar::new(length);
            bar.set_style(
                ProgressStyle::default_bar()
                    .template("{msg:24} {bar:40.cyan/blue} {pos}/{len} [{elapsed_precise}]")
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("##-"),
            );
            bar
        });
        bar.set_length(length);
        bar.set_message(message.to_string());
        bar
    }

    fn line(&self, text: String) {
        match &self.bar {
            Some(bar) => bar.suspend(|| println!("{}", text)),
            None => println!("{}", text),
        }
    }

    fn finish(&mut self) {
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }
    }
}
