use crate::models::DownloaderSettings;
use crate::models::settings::{MAX_WORKERS, REQUIRED_FILTER_PLACEHOLDERS};
use anyhow::{Context, Result, bail};
use camino::{Utf8Path, Utf8PathBuf};
use config::{Config, Environment, File, FileFormat};
use std::fs;

/// Default settings file name, looked up in the current directory.
pub const DEFAULT_SETTINGS_FILE: &str = "txbulk.json";

/// Environment prefix for setting overrides (`TXBULK_WORKERS=4`).
pub const ENV_PREFIX: &str = "TXBULK";

/// Loads, validates and saves [`DownloaderSettings`].
///
/// Settings are layered: built-in defaults, then the JSON settings file
/// (optional), then `TXBULK_*` environment variables.
#[derive(Debug, Clone)]
pub struct SettingsManager {
    settings_path: Utf8PathBuf,
}

impl SettingsManager {
    /// Create a manager for the given settings file path.
    pub fn new<P: AsRef<Utf8Path>>(settings_path: P) -> Self {
        Self {
            settings_path: settings_path.as_ref().to_path_buf(),
        }
    }

    /// Load settings from the file and environment.
    ///
    /// # Returns
    /// The merged settings, or defaults when neither source sets anything
    pub fn load(&self) -> Result<DownloaderSettings> {
        if !self.settings_path.exists() {
            tracing::warn!(
                "Settings file not found at {}, using defaults",
                self.settings_path
            );
        }

        let layered = Config::builder()
            .add_source(
                File::new(self.settings_path.as_str(), FileFormat::Json).required(false),
            )
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("project_slugs")
                    .with_list_parse_key("language_codes"),
            )
            .build()
            .with_context(|| format!("Failed to read settings: {}", self.settings_path))?;

        let settings: DownloaderSettings = layered
            .try_deserialize()
            .with_context(|| format!("Failed to parse settings: {}", self.settings_path))?;

        tracing::info!(
            "Loaded settings: org={}, workers={}, mode={:?}",
            settings.organization_slug,
            settings.workers,
            settings.download_mode
        );
        Ok(settings)
    }

    /// Save settings as pretty JSON with a `_comments` block describing the options.
    pub fn save(&self, settings: &DownloaderSettings) -> Result<()> {
        let mut value =
            serde_json::to_value(settings).context("Failed to serialize settings to JSON")?;

        if let Some(object) = value.as_object_mut() {
            object.insert("_comments".to_string(), option_comments());
        }

        let json = serde_json::to_string_pretty(&value).context("Failed to render settings")?;

        if let Some(parent) = self.settings_path.parent() {
            if !parent.as_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create settings directory: {}", parent))?;
            }
        }

        fs::write(&self.settings_path, json)
            .with_context(|| format!("Failed to write settings: {}", self.settings_path))?;

        tracing::info!("Saved settings to {}", self.settings_path);
        Ok(())
    }

    /// Get the settings file path.
    pub fn settings_path(&self) -> &Utf8Path {
        &self.settings_path
    }
}

/// Reject settings the pipeline cannot run with.
pub fn validate(settings: &DownloaderSettings) -> Result<()> {
    if settings.organization_slug.trim().is_empty() {
        bail!("organization_slug is not set");
    }

    if !settings.validate_file_filter() {
        bail!(
            "Invalid file_filter pattern '{}'. Must contain: {}",
            settings.file_filter,
            REQUIRED_FILTER_PLACEHOLDERS.join(", ")
        );
    }

    if settings.minimum_perc > 100 {
        bail!(
            "minimum_perc must be between 0 and 100, got {}",
            settings.minimum_perc
        );
    }

    if settings.workers > MAX_WORKERS {
        tracing::warn!(
            "workers={} exceeds the CLI maximum, using {}",
            settings.workers,
            MAX_WORKERS
        );
    }

    Ok(())
}

fn option_comments() -> serde_json::Value {
    serde_json::json!({
        "download_mode": "Options: source, translations, both",
        "language_codes": "List of language codes for translations (null = all languages)",
        "workers": "Number of concurrent downloads (max 30 for CLI)",
        "file_filter": "Pattern for file organization. Use <project_slug>, <resource_slug>, <lang>, <ext>",
        "skip_on_error": "Continue on individual resource failures",
        "use_filtered_output": "Parse tx pull output into progress updates",
        "minimum_perc": "Minimum translation completion percentage (0-100)",
        "skip_existing_files": "Skip files that already exist locally (faster incremental downloads)",
        "add_remote_timeout": "Timeout in seconds for tx add remote commands",
        "pull_timeout": "Hard ceiling in seconds for tx pull",
        "existing_config": "Options: add_missing, use_existing, start_fresh",
        "api_token": "Never stored here; set TX_TOKEN or TRANSIFEX_API_TOKEN"
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DownloadMode, ExistingConfigPolicy};
    use tempfile::TempDir;

    fn create_test_settings_manager() -> (SettingsManager, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let dir = Utf8PathBuf::try_from(temp_dir.path().to_path_buf()).unwrap();
        let manager = SettingsManager::new(dir.join(DEFAULT_SETTINGS_FILE));
        (manager, temp_dir)
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let (manager, _temp_dir) = create_test_settings_manager();
        let settings = manager.load().unwrap();
        assert_eq!(settings.workers, 12);
        assert_eq!(settings.tx_binary, "tx");
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let (manager, _temp_dir) = create_test_settings_manager();

        let settings = DownloaderSettings {
            organization_slug: "acme".to_string(),
            project_slugs: Some(vec!["alpha".to_string(), "beta".to_string()]),
            download_mode: DownloadMode::Source,
            workers: 4,
            existing_config: ExistingConfigPolicy::UseExisting,
            ..Default::default()
        };
        manager.save(&settings).unwrap();

        let raw = fs::read_to_string(manager.settings_path()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert!(value.get("_comments").is_some());
        assert!(value.get("api_token").is_none());

        let loaded = manager.load().unwrap();
        assert_eq!(loaded, settings);
    }

    #[test]
    fn test_validate_rejects_bad_filter() {
        let settings = DownloaderSettings {
            organization_slug: "acme".to_string(),
            file_filter: "translations/<lang>.po".to_string(),
            ..Default::default()
        };
        let err = validate(&settings).unwrap_err();
        assert!(err.to_string().contains("file_filter"));
    }

    #[test]
    fn test_validate_requires_organization() {
        let settings = DownloaderSettings::default();
        assert!(validate(&settings).is_err());
    }

    #[test]
    fn test_validate_minimum_perc_range() {
        let settings = DownloaderSettings {
            organization_slug: "acme".to_string(),
            minimum_perc: 101,
            ..Default::default()
        };
        assert!(validate(&settings).is_err());
    }
}
