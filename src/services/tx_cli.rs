use crate::models::{DownloadMode, DownloaderSettings};
use camino::Utf8Path;
use std::io;
use std::process::{Output, Stdio};
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tokio::time::timeout;

/// Environment variable the tx CLI reads its API token from.
pub const TOKEN_ENV: &str = "TX_TOKEN";

/// Timeout for the `tx --version` availability probe.
pub const VERSION_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for `tx init`.
pub const INIT_TIMEOUT: Duration = Duration::from_secs(60);

/// Shown when the tx CLI cannot be found or does not run.
pub const INSTALL_GUIDANCE: &str = "Please install the official Transifex CLI:\n  \
     curl -o- https://raw.githubusercontent.com/transifex/cli/master/install.sh | bash\n  \
     Or download from: https://github.com/transifex/cli/releases";

/// Errors from short, captured tx invocations
#[derive(Error, Debug)]
pub enum ToolError {
    #[error("Transifex CLI '{binary}' not found or not working: {reason}")]
    Missing { binary: String, reason: String },

    #[error("{command} timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error("Failed to run {command}: {source}")]
    Io {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("{command} failed with exit code {code}: {detail}")]
    Failed {
        command: String,
        code: i32,
        detail: String,
    },
}

/// Handle on the external tx binary.
///
/// Every invocation gets the API token through [`TOKEN_ENV`], never argv, and
/// is spawned `kill_on_drop` so cancelled futures never leave a child behind.
#[derive(Debug, Clone)]
pub struct TxCli {
    binary: String,
    token: Option<String>,
}

impl TxCli {
    pub fn new(binary: impl Into<String>, token: Option<String>) -> Self {
        Self {
            binary: binary.into(),
            token,
        }
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    /// Build a command for `args` running in `work_dir`.
    pub fn command<S: AsRef<str>>(&self, work_dir: &Utf8Path, args: &[S]) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args.iter().map(AsRef::as_ref))
            .current_dir(work_dir)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(token) = &self.token {
            cmd.env(TOKEN_ENV, token);
        }
        cmd
    }

    /// Human-readable command line, without the token.
    pub fn display<S: AsRef<str>>(&self, args: &[S]) -> String {
        let mut parts = vec![self.binary.as_str()];
        parts.extend(args.iter().map(AsRef::as_ref));
        parts.join(" ")
    }

    /// Run `args` with captured output under `limit`.
    ///
    /// A non-zero exit is returned as `Ok`; callers decide what failure means.
    pub async fn run_captured<S: AsRef<str>>(
        &self,
        work_dir: &Utf8Path,
        args: &[S],
        limit: Duration,
    ) -> Result<Output, ToolError> {
        let command = self.display(args);
        tracing::info!("Executing: {}", command);

        let child = self
            .command(work_dir, args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ToolError::Io {
                command: command.clone(),
                source,
            })?;

        // Dropping the timed-out future drops the child, which kills it
        match timeout(limit, child.wait_with_output()).await {
            Ok(result) => result.map_err(|source| ToolError::Io { command, source }),
            Err(_) => {
                tracing::warn!("{} timed out after {:?}", command, limit);
                Err(ToolError::Timeout {
                    command,
                    timeout: limit,
                })
            }
        }
    }

    /// `tx --version`; any failure means the CLI is unusable.
    pub async fn probe_version(&self) -> Result<String, ToolError> {
        let cwd = std::env::current_dir().map_err(|source| ToolError::Io {
            command: self.display(&["--version"]),
            source,
        })?;
        let cwd = camino::Utf8PathBuf::try_from(cwd).unwrap_or_else(|_| ".".into());

        let missing = |reason: String| ToolError::Missing {
            binary: self.binary.clone(),
            reason,
        };

        let output = match self
            .run_captured(&cwd, &["--version"], VERSION_PROBE_TIMEOUT)
            .await
        {
            Ok(output) => output,
            Err(ToolError::Io { source, .. }) => return Err(missing(source.to_string())),
            Err(ToolError::Timeout { timeout, .. }) => {
                return Err(missing(format!("no response within {:?}", timeout)));
            }
            Err(e) => return Err(e),
        };

        if !output.status.success() {
            return Err(missing(format!(
                "--version exited with {}",
                output.status.code().unwrap_or(-1)
            )));
        }

        let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
        tracing::info!("Transifex CLI detected: {}", version);
        Ok(version)
    }

    /// `tx init` in `work_dir`, creating a fresh `.tx/config` scaffold.
    pub async fn init(&self, work_dir: &Utf8Path) -> Result<(), ToolError> {
        let output = self.run_captured(work_dir, &["init"], INIT_TIMEOUT).await?;
        if output.status.success() {
            tracing::info!("Initialized Transifex project in {}", work_dir);
            Ok(())
        } else {
            Err(ToolError::Failed {
                command: self.display(&["init"]),
                code: output.status.code().unwrap_or(-1),
                detail: failure_detail(&output),
            })
        }
    }
}

/// stderr if it has content, otherwise stdout, trimmed.
pub fn failure_detail(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.trim().is_empty() {
        return stderr.trim().to_string();
    }
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// Arguments for `tx add remote`.
pub fn add_remote_args(file_filter: &str, minimum_perc: u32, project_url: &str) -> Vec<String> {
    let mut args = vec![
        "add".to_string(),
        "remote".to_string(),
        "--file-filter".to_string(),
        file_filter.to_string(),
    ];
    if minimum_perc > 0 {
        args.push("--minimum-perc".to_string());
        args.push(minimum_perc.to_string());
    }
    args.push(project_url.to_string());
    args
}

/// Arguments for `tx pull` as configured by `settings`.
pub fn pull_args(settings: &DownloaderSettings, silent: bool) -> Vec<String> {
    let mut args = vec!["pull".to_string()];

    match settings.download_mode {
        DownloadMode::Source => args.push("--source".to_string()),
        DownloadMode::Translations => args.push("--translations".to_string()),
        DownloadMode::Both => {
            args.push("--source".to_string());
            args.push("--translations".to_string());
        }
    }

    match settings.language_codes.as_deref() {
        Some(codes) if !codes.is_empty() => {
            args.push("--languages".to_string());
            args.push(codes.join(","));
        }
        _ => args.push("--all".to_string()),
    }

    args.push("--workers".to_string());
    args.push(settings.effective_workers().to_string());

    if settings.skip_on_error {
        args.push("--skip".to_string());
    }

    if settings.force_download {
        args.push("--force".to_string());
    } else if settings.skip_existing_files {
        args.push("--disable-overwrite".to_string());
    }

    if silent {
        args.push("--silent".to_string());
    }

    args
}
