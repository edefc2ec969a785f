use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use chrono::Local;
use std::collections::BTreeMap;
use std::fs;
use walkdir::WalkDir;

/// Directory entries visited before the walk gives up.
pub const MAX_ITEMS_TO_VISIT: usize = 100_000;

/// Relative paths kept for display.
pub const SAMPLE_SIZE: usize = 10;

/// Summary of a downloaded tree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Report {
    pub file_count: usize,
    pub size_bytes: u64,
    /// Lowercased extension including the dot (`""` when there is none) to count
    pub extension_histogram: BTreeMap<String, usize>,
    /// The first files encountered, sorted, relative to the root
    pub sample: Vec<String>,
    /// True when the walk stopped at the item limit
    pub truncated: bool,
}

impl Report {
    /// Human-readable summary for the end of a run.
    pub fn summary_lines(&self, work_dir: &Utf8Path, success: bool, message: &str) -> Vec<String> {
        let mut lines = vec![
            format!("Working directory: {}", work_dir),
            format!("Total files downloaded: {}", self.file_count),
        ];

        if self.truncated {
            lines.push("Directory scan limited for memory efficiency".to_string());
        }
        if self.size_bytes > 0 {
            lines.push(format!("Total size: {}", format_size(self.size_bytes)));
        }
        if !self.extension_histogram.is_empty() {
            lines.push("File types:".to_string());
            for (ext, count) in &self.extension_histogram {
                let label = if ext.is_empty() { "(no extension)" } else { ext.as_str() };
                lines.push(format!("  {}: {}", label, count));
            }
        }

        lines.push(format!("Status: {}", if success { "SUCCESS" } else { "FAILED" }));
        lines.push(format!("Details: {}", message));

        if !self.sample.is_empty() {
            lines.push("Directory structure (sample):".to_string());
            lines.extend(self.sample.iter().map(|path| format!("  {}", path)));
            if self.file_count > self.sample.len() {
                lines.push(format!("  ... and {} more files", self.file_count - self.sample.len()));
            }
        }

        lines
    }
}

/// Bounded walk over an output tree.
pub struct ReportGenerator {
    sample_size: usize,
}

impl ReportGenerator {
    pub fn new() -> Self {
        Self {
            sample_size: SAMPLE_SIZE,
        }
    }

    pub fn with_sample_size(mut self, sample_size: usize) -> Self {
        self.sample_size = sample_size;
        self
    }

    /// Walk `root`, visiting at most `max_items` entries and skipping hidden ones.
    pub fn summarize(&self, root: &Utf8Path, max_items: usize) -> Report {
        let mut report = Report::default();
        if !root.is_dir() {
            return report;
        }

        let mut visited = 0usize;
        let walker = WalkDir::new(root).into_iter().filter_entry(|e| {
            e.depth() == 0 || !e.file_name().to_string_lossy().starts_with('.')
        });

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!("Directory traversal error: {}", e);
                    continue;
                }
            };
            if entry.depth() == 0 {
                continue;
            }

            visited += 1;
            if visited > max_items {
                tracing::warn!("Directory scan limited to {} items", max_items);
                report.truncated = true;
                break;
            }

            if !entry.file_type().is_file() {
                continue;
            }

            report.file_count += 1;
            if let Ok(metadata) = entry.metadata() {
                report.size_bytes += metadata.len();
            }

            let ext = entry
                .path()
                .extension()
                .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()))
                .unwrap_or_default();
            *report.extension_histogram.entry(ext).or_insert(0) += 1;

            if report.sample.len() < self.sample_size {
                if let Ok(relative) = entry.path().strip_prefix(root) {
                    report
                        .sample
                        .push(relative.to_string_lossy().replace('\\', "/"));
                }
            }
        }

        report.sample.sort();
        report
    }
}

impl Default for ReportGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Format a byte count as `B`, `KB`, `MB` or `GB`.
pub fn format_size(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    let size = bytes as f64;
    if size < KB {
        format!("{} B", bytes)
    } else if size < KB * KB {
        format!("{:.1} KB", size / KB)
    } else if size < KB * KB * KB {
        format!("{:.1} MB", size / (KB * KB))
    } else {
        format!("{:.1} GB", size / (KB * KB * KB))
    }
}

/// Write `download_report_<timestamp>.txt` into `work_dir`.
pub fn write_report(
    work_dir: &Utf8Path,
    success: bool,
    message: &str,
    file_count: usize,
) -> Result<Utf8PathBuf> {
    let now = Local::now();
    fs::create_dir_all(work_dir)
        .with_context(|| format!("Failed to create report directory: {}", work_dir))?;

    let path = work_dir.join(format!("download_report_{}.txt", now.format("%Y%m%d_%H%M%S")));
    let contents = format!(
        "Transifex Download Report\n\
         Generated: {}\n\
         Status: {}\n\
         Message: {}\n\
         Total files: {}\n\
         Working directory: {}\n",
        now.format("%Y-%m-%d %H:%M:%S"),
        if success { "SUCCESS" } else { "FAILED" },
        message,
        file_count,
        work_dir
    );

    fs::write(&path, contents).with_context(|| format!("Failed to write report: {}", path))?;
    tracing::info!("Report saved to {}", path);
    Ok(path)
}
