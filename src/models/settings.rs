use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Placeholders every file filter must contain so the tx CLI can lay files out.
pub const REQUIRED_FILTER_PLACEHOLDERS: [&str; 4] =
    ["<project_slug>", "<resource_slug>", "<lang>", "<ext>"];

/// Upper bound the tx CLI accepts for `--workers`.
pub const MAX_WORKERS: u32 = 30;

/// Directory used when no output directory is configured.
pub const DEFAULT_OUTPUT_DIR: &str = "transifex_downloads";

/// Which side of the translation memory `tx pull` fetches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DownloadMode {
    Source,
    Translations,
    #[default]
    Both,
}

/// What to do when a `.tx/config` already exists in the working directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExistingConfigPolicy {
    /// Add only the projects missing from the config; use it as-is if none are.
    #[default]
    AddMissing,
    /// Never touch the existing config.
    UseExisting,
    /// Back up the config, re-run `tx init` and add every discovered project.
    StartFresh,
}

/// How the output of `tx pull` is consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Progress is parsed from the child's output stream.
    Monitored,
    /// `--silent`, output captured and only the error tail kept.
    Silent,
    /// Child inherits the terminal.
    Passthrough,
}

/// Persisted settings for a download run (`txbulk.json`).
///
/// The API token is deliberately absent: it is read from the environment
/// and handed to every subprocess through `TX_TOKEN`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloaderSettings {
    pub organization_slug: String,
    pub project_slugs: Option<Vec<String>>,
    pub output_directory: Option<Utf8PathBuf>,
    pub download_mode: DownloadMode,
    pub language_codes: Option<Vec<String>>,
    pub workers: u32,
    pub skip_on_error: bool,
    pub use_silent_mode: bool,
    pub use_filtered_output: bool,
    pub file_filter: String,
    pub minimum_perc: u32,
    pub force_download: bool,
    pub skip_existing_files: bool,
    pub add_remote_timeout: u64,
    pub pull_timeout: u64,
    pub tx_binary: String,
    pub api_base_url: String,
    pub app_base_url: String,
    pub existing_config: ExistingConfigPolicy,
}

impl Default for DownloaderSettings {
    fn default() -> Self {
        Self {
            organization_slug: String::new(),
            project_slugs: None,
            output_directory: None,
            download_mode: DownloadMode::Both,
            language_codes: None,
            workers: 12,
            skip_on_error: true,
            use_silent_mode: false,
            use_filtered_output: true,
            file_filter: "<project_slug>/<resource_slug>/<resource_slug>_<lang>.<ext>".to_string(),
            minimum_perc: 0,
            force_download: false,
            skip_existing_files: true,
            add_remote_timeout: 300,
            pull_timeout: 7200,
            tx_binary: "tx".to_string(),
            api_base_url: "https://rest.api.transifex.com".to_string(),
            app_base_url: "https://app.transifex.com".to_string(),
            existing_config: ExistingConfigPolicy::AddMissing,
        }
    }
}

impl DownloaderSettings {
    /// True when the file filter carries all four required placeholders.
    pub fn validate_file_filter(&self) -> bool {
        REQUIRED_FILTER_PLACEHOLDERS
            .iter()
            .all(|placeholder| self.file_filter.contains(placeholder))
    }

    /// File filter with quote characters replaced, as passed to `tx add remote`.
    pub fn sanitized_file_filter(&self) -> String {
        self.file_filter.replace(['\'', '"'], "_")
    }

    /// Worker count clamped to what the CLI accepts.
    pub fn effective_workers(&self) -> u32 {
        self.workers.clamp(1, MAX_WORKERS)
    }

    pub fn add_remote_timeout(&self) -> Duration {
        Duration::from_secs(self.add_remote_timeout)
    }

    pub fn pull_timeout(&self) -> Duration {
        Duration::from_secs(self.pull_timeout)
    }

    pub fn output_mode(&self) -> OutputMode {
        if self.use_filtered_output {
            OutputMode::Monitored
        } else if self.use_silent_mode {
            OutputMode::Silent
        } else {
            OutputMode::Passthrough
        }
    }

    /// Requested project slugs, if the run is restricted to a subset.
    pub fn wanted_projects(&self) -> Option<Vec<String>> {
        self.project_slugs
            .as_ref()
            .filter(|slugs| !slugs.is_empty())
            .cloned()
    }

    /// Working directory for the tx project, relative to `base` when not configured.
    pub fn work_dir(&self, base: &camino::Utf8Path) -> Utf8PathBuf {
        match &self.output_directory {
            Some(dir) => dir.clone(),
            None => base.join(DEFAULT_OUTPUT_DIR),
        }
    }

    /// Project URL understood by `tx add remote`.
    pub fn project_url(&self, project_slug: &str) -> String {
        format!(
            "{}/{}/{}",
            self.app_base_url.trim_end_matches('/'),
            self.organization_slug,
            project_slug
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_defaults() {
        let settings = DownloaderSettings::default();
        assert_eq!(settings.workers, 12);
        assert_eq!(settings.add_remote_timeout, 300);
        assert_eq!(settings.pull_timeout, 7200);
        assert_eq!(settings.download_mode, DownloadMode::Both);
        assert!(settings.skip_on_error);
        assert!(settings.validate_file_filter());
    }

    #[test]
    fn test_file_filter_requires_all_placeholders() {
        let settings = DownloaderSettings {
            file_filter: "<project_slug>/<resource_slug>.<ext>".to_string(),
            ..Default::default()
        };
        assert!(!settings.validate_file_filter());
    }

    #[test]
    fn test_sanitized_file_filter() {
        let settings = DownloaderSettings {
            file_filter: "o'brien/<project_slug>/<resource_slug>_<lang>.<ext>".to_string(),
            ..Default::default()
        };
        assert_eq!(
            settings.sanitized_file_filter(),
            "o_brien/<project_slug>/<resource_slug>_<lang>.<ext>"
        );
    }

    #[test]
    fn test_worker_cap() {
        let settings = DownloaderSettings {
            workers: 64,
            ..Default::default()
        };
        assert_eq!(settings.effective_workers(), MAX_WORKERS);

        let settings = DownloaderSettings {
            workers: 0,
            ..Default::default()
        };
        assert_eq!(settings.effective_workers(), 1);
    }

    #[test]
    fn test_output_mode_selection() {
        let mut settings = DownloaderSettings::default();
        assert_eq!(settings.output_mode(), OutputMode::Monitored);

        settings.use_filtered_output = false;
        settings.use_silent_mode = true;
        assert_eq!(settings.output_mode(), OutputMode::Silent);

        settings.use_silent_mode = false;
        assert_eq!(settings.output_mode(), OutputMode::Passthrough);
    }

    #[test]
    fn test_project_url() {
        let settings = DownloaderSettings {
            organization_slug: "acme".to_string(),
            app_base_url: "https://app.transifex.com/".to_string(),
            ..Default::default()
        };
        assert_eq!(
            settings.project_url("website"),
            "https://app.transifex.com/acme/website"
        );
    }

    #[test]
    fn test_deserialize_partial_json() {
        let json = r#"{ "organization_slug": "acme", "download_mode": "translations", "existing_config": "start_fresh" }"#;
        let settings: DownloaderSettings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.organization_slug, "acme");
        assert_eq!(settings.download_mode, DownloadMode::Translations);
        assert_eq!(settings.existing_config, ExistingConfigPolicy::StartFresh);
        assert_eq!(settings.workers, 12);
    }
}
