use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;
use std::fs;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use tempfile::NamedTempFile;
use thiserror::Error;

/// Files up to this size are rewritten in memory; larger ones are streamed.
pub const IN_MEMORY_LIMIT: u64 = 10 * 1024 * 1024;

/// Characters the tx CLI's ini reader chokes on inside unquoted values.
const QUOTE_CHARS: [char; 2] = ['\'', '"'];

/// Failure while fixing quotes; recovered by [`QuoteSanitizer::sanitize`].
#[derive(Debug, Error)]
pub enum QuoteFixError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to replace {path}: {source}")]
    Replace {
        path: String,
        #[source]
        source: tempfile::PersistError,
    },
}

/// Result of a sanitize pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SanitizeOutcome {
    /// No config file to sanitize
    NotFound,
    /// Nothing needed fixing; the file was not touched
    Unchanged,
    /// Quotes were replaced; the original was copied to `backup` first
    Fixed {
        backup: Utf8PathBuf,
        lines_fixed: usize,
    },
}

/// Replaces quote characters in `resource_name`, `file_filter` and
/// `source_file` values of `.tx/config`.
pub struct QuoteSanitizer {
    key_pattern: Regex,
    in_memory_limit: u64,
}

impl QuoteSanitizer {
    pub fn new() -> Self {
        Self {
            key_pattern: Regex::new(r"^(\s*(?:resource_name|file_filter|source_file)\s*=\s*)(.*)$")
                .expect("Invalid config key regex"),
            in_memory_limit: IN_MEMORY_LIMIT,
        }
    }

    /// Override the size above which the streaming strategy is used.
    pub fn with_in_memory_limit(mut self, bytes: u64) -> Self {
        self.in_memory_limit = bytes;
        self
    }

    /// Sanitize `path`, returning true iff the file was modified.
    ///
    /// Errors are logged and reported as "not modified".
    pub fn sanitize(&self, path: &Utf8Path) -> bool {
        match self.try_sanitize(path) {
            Ok(SanitizeOutcome::Fixed {
                backup,
                lines_fixed,
            }) => {
                tracing::info!(
                    "Fixed quote issues on {} line(s) in {}, backup saved to {}",
                    lines_fixed,
                    path,
                    backup
                );
                true
            }
            Ok(_) => false,
            Err(e) => {
                tracing::warn!("Could not fix config quotes: {}", e);
                false
            }
        }
    }

    pub fn try_sanitize(&self, path: &Utf8Path) -> Result<SanitizeOutcome, QuoteFixError> {
        let metadata = match fs::metadata(path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(SanitizeOutcome::NotFound),
            Err(source) => {
                return Err(QuoteFixError::Io {
                    path: path.to_string(),
                    source,
                });
            }
        };

        if metadata.len() > self.in_memory_limit {
            tracing::debug!("Sanitizing {} in streaming mode", path);
            self.sanitize_streaming(path, &metadata)
        } else {
            self.sanitize_in_memory(path, &metadata)
        }
    }

    /// Fix one line (without its terminator); `None` when it needs no change.
    pub fn fix_line(&self, line: &str) -> Option<String> {
        let caps = self.key_pattern.captures(line)?;
        let value = caps.get(2).map_or("", |m| m.as_str());
        if !value.contains(QUOTE_CHARS) {
            return None;
        }
        Some(format!("{}{}", &caps[1], value.replace(QUOTE_CHARS, "_")))
    }

    /// Fix one raw line (terminator included). Lines that are not valid UTF-8
    /// are left alone.
    fn fix_raw_line(&self, raw: &[u8]) -> Option<String> {
        let text = std::str::from_utf8(raw).ok()?;
        let (body, ending) = split_line_ending(text);
        self.fix_line(body).map(|line| line + ending)
    }

    /// Sanitize raw config bytes, returning the new bytes and fixed line count.
    pub fn sanitize_bytes(&self, content: &[u8]) -> (Vec<u8>, usize) {
        let mut output = Vec::with_capacity(content.len());
        let mut fixed = 0;

        for raw in content.split_inclusive(|&b| b == b'\n') {
            match self.fix_raw_line(raw) {
                Some(line) => {
                    output.extend_from_slice(line.as_bytes());
                    fixed += 1;
                }
                None => output.extend_from_slice(raw),
            }
        }

        (output, fixed)
    }

    /// Sanitize a whole config text, returning the new text and fixed line count.
    pub fn sanitize_text(&self, content: &str) -> (String, usize) {
        let (output, fixed) = self.sanitize_bytes(content.as_bytes());
        (String::from_utf8_lossy(&output).into_owned(), fixed)
    }

    fn sanitize_in_memory(
        &self,
        path: &Utf8Path,
        metadata: &fs::Metadata,
    ) -> Result<SanitizeOutcome, QuoteFixError> {
        let content = fs::read(path).map_err(|source| QuoteFixError::Io {
            path: path.to_string(),
            source,
        })?;

        let (fixed_content, lines_fixed) = self.sanitize_bytes(&content);
        if lines_fixed == 0 {
            return Ok(SanitizeOutcome::Unchanged);
        }

        let mut temp = new_sibling_temp(path)?;
        temp.write_all(&fixed_content)
            .map_err(|source| QuoteFixError::Io {
                path: temp.path().display().to_string(),
                source,
            })?;

        let backup = replace_with_backup(path, temp, metadata)?;
        Ok(SanitizeOutcome::Fixed {
            backup,
            lines_fixed,
        })
    }

    fn sanitize_streaming(
        &self,
        path: &Utf8Path,
        metadata: &fs::Metadata,
    ) -> Result<SanitizeOutcome, QuoteFixError> {
        let io_err = |source| QuoteFixError::Io {
            path: path.to_string(),
            source,
        };

        let input = fs::File::open(path).map_err(io_err)?;
        let mut reader = BufReader::new(input);
        let temp = new_sibling_temp(path)?;
        let mut writer = BufWriter::new(temp);
        let mut raw = Vec::new();
        let mut lines_fixed = 0;

        loop {
            raw.clear();
            if reader.read_until(b'\n', &mut raw).map_err(io_err)? == 0 {
                break;
            }

            match self.fix_raw_line(&raw) {
                Some(line) => {
                    lines_fixed += 1;
                    writer.write_all(line.as_bytes()).map_err(io_err)?;
                }
                None => writer.write_all(&raw).map_err(io_err)?,
            }
        }

        // Dropping the temp file removes it when nothing changed
        if lines_fixed == 0 {
            return Ok(SanitizeOutcome::Unchanged);
        }

        let temp = writer
            .into_inner()
            .map_err(|e| io_err(e.into_error()))?;
        let backup = replace_with_backup(path, temp, metadata)?;
        Ok(SanitizeOutcome::Fixed {
            backup,
            lines_fixed,
        })
    }
}

impl Default for QuoteSanitizer {
    fn default() -> Self {
        Self::new()
    }
}

/// Unused timestamped backup location next to `path` (`config.backup.<unix-seconds>`,
/// then `.1`, `.2`, ... when that second is already taken).
pub fn backup_path(path: &Utf8Path) -> Utf8PathBuf {
    let base = format!("{}.backup.{}", path, chrono::Utc::now().timestamp());
    let mut candidate = Utf8PathBuf::from(&base);
    let mut n = 1;
    while candidate.exists() {
        candidate = Utf8PathBuf::from(format!("{}.{}", base, n));
        n += 1;
    }
    candidate
}

fn split_line_ending(raw: &str) -> (&str, &str) {
    if let Some(body) = raw.strip_suffix("\r\n") {
        (body, "\r\n")
    } else if let Some(body) = raw.strip_suffix('\n') {
        (body, "\n")
    } else {
        (raw, "")
    }
}

fn new_sibling_temp(path: &Utf8Path) -> Result<NamedTempFile, QuoteFixError> {
    let dir = path
        .parent()
        .filter(|p| !p.as_str().is_empty())
        .unwrap_or(Utf8Path::new("."));
    NamedTempFile::new_in(dir).map_err(|source| QuoteFixError::Io {
        path: dir.to_string(),
        source,
    })
}

/// Back up the original, then atomically move `temp` over it.
fn replace_with_backup(
    path: &Utf8Path,
    mut temp: NamedTempFile,
    metadata: &fs::Metadata,
) -> Result<Utf8PathBuf, QuoteFixError> {
    let temp_err = |source| QuoteFixError::Io {
        path: path.to_string(),
        source,
    };

    temp.flush().map_err(temp_err)?;
    fs::set_permissions(temp.path(), metadata.permissions()).map_err(temp_err)?;

    let backup = backup_path(path);
    fs::copy(path, &backup).map_err(|source| QuoteFixError::Io {
        path: backup.to_string(),
        source,
    })?;

    temp.persist(path).map_err(|source| QuoteFixError::Replace {
        path: path.to_string(),
        source,
    })?;

    Ok(backup)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::TempDir;

    const SAMPLE: &str = "[main]\nhost = https://app.transifex.com\n\n\
        [o:acme:p:web:r:faq]\n\
        file_filter = web/faq's/<lang>.po\n\
        source_file = web/faq's/en.po\n\
        resource_name = Don't Panic\n\
        type = PO\n";

    fn write_config(contents: &str) -> (TempDir, Utf8PathBuf) {
        let temp_dir = TempDir::new().unwrap();
        let dir = Utf8PathBuf::try_from(temp_dir.path().to_path_buf()).unwrap();
        let path = dir.join("config");
        fs::write(&path, contents).unwrap();
        (temp_dir, path)
    }

    fn backups_in(dir: &Utf8Path) -> usize {
        fs::read_dir(dir)
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .unwrap()
                    .file_name()
                    .to_string_lossy()
                    .starts_with("config.backup.")
            })
            .count()
    }

    #[test]
    fn test_fix_line() {
        let sanitizer = QuoteSanitizer::new();

        assert_eq!(
            sanitizer.fix_line("  resource_name = Don't Panic").as_deref(),
            Some("  resource_name = Don_t Panic")
        );
        assert_eq!(
            sanitizer.fix_line("file_filter=a\"b'c").as_deref(),
            Some("file_filter=a_b_c")
        );
        assert!(sanitizer.fix_line("resource_name = Clean").is_none());
        assert!(sanitizer.fix_line("description = It's fine here").is_none());
    }

    #[test]
    fn test_sanitize_in_memory_with_backup() {
        let (temp_dir, path) = write_config(SAMPLE);
        let sanitizer = QuoteSanitizer::new();

        assert!(sanitizer.sanitize(&path));

        let fixed = fs::read_to_string(&path).unwrap();
        assert!(fixed.contains("file_filter = web/faq_s/<lang>.po"));
        assert!(fixed.contains("source_file = web/faq_s/en.po"));
        assert!(fixed.contains("resource_name = Don_t Panic"));
        assert!(fixed.contains("[o:acme:p:web:r:faq]"));

        let dir = Utf8PathBuf::try_from(temp_dir.path().to_path_buf()).unwrap();
        assert_eq!(backups_in(&dir), 1);
    }

    #[test]
    fn test_sanitize_is_idempotent() {
        let (temp_dir, path) = write_config(SAMPLE);
        let sanitizer = QuoteSanitizer::new();

        assert!(sanitizer.sanitize(&path));
        let once = fs::read_to_string(&path).unwrap();

        assert!(!sanitizer.sanitize(&path));
        assert_eq!(fs::read_to_string(&path).unwrap(), once);

        let dir = Utf8PathBuf::try_from(temp_dir.path().to_path_buf()).unwrap();
        assert_eq!(backups_in(&dir), 1);
    }

    #[test]
    fn test_streaming_matches_in_memory() {
        let (_a, in_memory_path) = write_config(SAMPLE);
        let (_b, streaming_path) = write_config(SAMPLE);

        assert!(QuoteSanitizer::new().sanitize(&in_memory_path));
        let outcome = QuoteSanitizer::new()
            .with_in_memory_limit(0)
            .try_sanitize(&streaming_path)
            .unwrap();

        assert!(matches!(outcome, SanitizeOutcome::Fixed { lines_fixed: 3, .. }));
        assert_eq!(
            fs::read_to_string(&in_memory_path).unwrap(),
            fs::read_to_string(&streaming_path).unwrap()
        );
    }

    #[test]
    fn test_streaming_unchanged_leaves_no_temp() {
        let (temp_dir, path) = write_config("[main]\nresource_name = fine\n");
        let outcome = QuoteSanitizer::new()
            .with_in_memory_limit(0)
            .try_sanitize(&path)
            .unwrap();

        assert_eq!(outcome, SanitizeOutcome::Unchanged);
        assert_eq!(fs::read_dir(temp_dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_missing_file() {
        let sanitizer = QuoteSanitizer::new();
        let path = Utf8Path::new("/no/such/dir/config");
        assert_eq!(sanitizer.try_sanitize(path).unwrap(), SanitizeOutcome::NotFound);
        assert!(!sanitizer.sanitize(path));
    }

    #[test]
    fn test_invalid_utf8_lines_skipped_by_both_strategies() {
        let mut input = b"[o:acme:p:web:r:faq]\nresource_name = Don't Panic\n".to_vec();
        input.extend_from_slice(b"description = caf\xe9\n");
        input.extend_from_slice(b"file_filter = web/faq's/<lang>.po\n");

        let mut results = Vec::new();
        for limit in [IN_MEMORY_LIMIT, 0] {
            let temp_dir = TempDir::new().unwrap();
            let dir = Utf8PathBuf::try_from(temp_dir.path().to_path_buf()).unwrap();
            let path = dir.join("config");
            fs::write(&path, &input).unwrap();

            let outcome = QuoteSanitizer::new()
                .with_in_memory_limit(limit)
                .try_sanitize(&path)
                .unwrap();
            assert!(matches!(outcome, SanitizeOutcome::Fixed { lines_fixed: 2, .. }));

            let fixed = fs::read(&path).unwrap();
            assert!(!fixed.contains(&b'\''));
            assert!(fixed.windows(4).any(|w| w == b"caf\xe9"));
            results.push(fixed);
        }

        assert_eq!(results[0], results[1]);
    }

    #[test]
    fn test_crlf_preserved() {
        let sanitizer = QuoteSanitizer::new();
        let (text, fixed) = sanitizer.sanitize_text("resource_name = a'b\r\ntype = PO\r\n");
        assert_eq!(fixed, 1);
        assert_eq!(text, "resource_name = a_b\r\ntype = PO\r\n");
    }

    proptest! {
        #[test]
        fn prop_sanitize_text_idempotent(
            lines in prop::collection::vec(
                (
                    prop::sample::select(vec!["resource_name", "file_filter", "source_file", "type", "  resource_name"]),
                    "[a-z'\" /<>._-]{0,20}",
                ),
                0..12,
            )
        ) {
            let sanitizer = QuoteSanitizer::new();
            let input: String = lines
                .iter()
                .map(|(key, value)| format!("{} = {}\n", key, value))
                .collect();

            let (once, _) = sanitizer.sanitize_text(&input);
            let (twice, fixed_again) = sanitizer.sanitize_text(&once);

            prop_assert_eq!(&twice, &once);
            prop_assert_eq!(fixed_again, 0);

            for line in once.lines() {
                let trimmed = line.trim_start();
                if trimmed.starts_with("resource_name")
                    || trimmed.starts_with("file_filter")
                    || trimmed.starts_with("source_file")
                {
                    let value = line.split_once('=').map(|(_, v)| v).unwrap_or("");
                    prop_assert!(!value.contains('\''));
                    prop_assert!(!value.contains('"'));
                }
            }
        }
    }
}
