use crate::models::{ConfigSnapshot, ResourceEntry};
use camino::Utf8Path;
use regex::Regex;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader};
use std::time::SystemTime;
use thiserror::Error;

/// Files above this size get a warning; parsing is always streamed.
pub const LARGE_CONFIG_BYTES: u64 = 50 * 1024 * 1024;

/// Lines longer than this are skipped without being buffered.
pub const MAX_LINE_LENGTH: usize = 10_000;

/// Parsing stops after this many lines.
pub const MAX_LINES: usize = 1_000_000;

/// Failure while reading `.tx/config`; always recovered into an empty snapshot.
#[derive(Debug, Error)]
pub enum ConfigParseError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

/// Streaming parser for the section headers of `.tx/config`.
///
/// Only `[o:{org}:p:{project}:r:{resource}]` headers belonging to the
/// configured organization are counted.
pub struct ConfigSnapshotParser {
    org_slug: String,
    header_pattern: Regex,
    max_line_length: usize,
    max_lines: usize,
}

impl ConfigSnapshotParser {
    pub fn new(org_slug: impl Into<String>) -> Self {
        Self {
            org_slug: org_slug.into(),
            header_pattern: Regex::new(r"\[o:([^:\]]+):p:([^:\]]+):r:([^\]]+)\]")
                .expect("Invalid section header regex"),
            max_line_length: MAX_LINE_LENGTH,
            max_lines: MAX_LINES,
        }
    }

    /// Override the per-line and line-count limits.
    pub fn with_limits(mut self, max_line_length: usize, max_lines: usize) -> Self {
        self.max_line_length = max_line_length;
        self.max_lines = max_lines;
        self
    }

    /// Build a snapshot of `path`.
    ///
    /// A missing file yields `exists == false`; an unreadable one yields an
    /// empty snapshot with `exists == true`. Never fails.
    pub fn parse(&self, path: &Utf8Path) -> ConfigSnapshot {
        if !path.exists() {
            return ConfigSnapshot::missing();
        }

        let age_hours = config_age_hours(path);

        match self.try_parse(path, age_hours) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!("Could not parse existing config: {}", e);
                ConfigSnapshot::empty_existing(age_hours)
            }
        }
    }

    fn try_parse(
        &self,
        path: &Utf8Path,
        age_hours: Option<f64>,
    ) -> Result<ConfigSnapshot, ConfigParseError> {
        let io_err = |source| ConfigParseError::Io {
            path: path.to_string(),
            source,
        };

        let size = fs::metadata(path).map_err(io_err)?.len();
        if size > LARGE_CONFIG_BYTES {
            tracing::warn!(
                "Config file is large ({} bytes), processing line by line",
                size
            );
        }

        let file = File::open(path).map_err(io_err)?;
        let mut snapshot = self.parse_reader(BufReader::new(file)).map_err(io_err)?;
        snapshot.exists = true;
        snapshot.age_hours = age_hours;
        Ok(snapshot)
    }

    /// Parse section headers from any buffered reader.
    pub fn parse_reader<R: BufRead>(&self, mut reader: R) -> io::Result<ConfigSnapshot> {
        let mut snapshot = ConfigSnapshot::missing();
        let mut buf = Vec::with_capacity(256);
        let mut line_num = 0usize;
        let mut skipped = 0usize;
        let mut duplicates = 0usize;

        while let Some(overlong) = read_bounded_line(&mut reader, &mut buf, self.max_line_length)? {
            line_num += 1;

            if overlong {
                skipped += 1;
            } else {
                let line = String::from_utf8_lossy(&buf);
                if let Some(entry) = self.match_header(&line)
                    && !snapshot.push(entry)
                {
                    duplicates += 1;
                }
            }

            if line_num >= self.max_lines {
                tracing::warn!("Config file too large, stopping at line {}", line_num);
                break;
            }
        }

        if skipped > 0 {
            tracing::debug!("Skipped {} overlong config lines", skipped);
        }
        if duplicates > 0 {
            tracing::debug!("Ignored {} repeated resource sections", duplicates);
        }

        Ok(snapshot)
    }

    fn match_header(&self, line: &str) -> Option<ResourceEntry> {
        let caps = self.header_pattern.captures(line)?;
        let org = &caps[1];
        if org != self.org_slug {
            return None;
        }

        Some(ResourceEntry {
            org_slug: org.to_string(),
            project_slug: caps[2].to_string(),
            resource_slug: caps[3].to_string(),
            raw_section_header: caps[0].to_string(),
        })
    }
}

/// Read one `\n`-terminated line into `buf`, never buffering more than `max_len` bytes.
///
/// Returns `None` at EOF, otherwise whether the line exceeded `max_len`
/// (in which case `buf` is left empty).
fn read_bounded_line<R: BufRead>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    max_len: usize,
) -> io::Result<Option<bool>> {
    buf.clear();
    let mut overlong = false;
    let mut read_any = false;

    loop {
        let available = reader.fill_buf()?;
        if available.is_empty() {
            return Ok(read_any.then_some(overlong));
        }
        read_any = true;

        let newline = available.iter().position(|&b| b == b'\n');
        let chunk_len = newline.unwrap_or(available.len());

        if !overlong {
            if buf.len() + chunk_len > max_len {
                overlong = true;
                buf.clear();
            } else {
                buf.extend_from_slice(&available[..chunk_len]);
            }
        }

        match newline {
            Some(pos) => {
                reader.consume(pos + 1);
                if buf.last() == Some(&b'\r') {
                    buf.pop();
                }
                return Ok(Some(overlong));
            }
            None => reader.consume(chunk_len),
        }
    }
}

fn config_age_hours(path: &Utf8Path) -> Option<f64> {
    let modified = fs::metadata(path).ok()?.modified().ok()?;
    let age = SystemTime::now().duration_since(modified).ok()?;
    Some(age.as_secs_f64() / 3600.0)
}
