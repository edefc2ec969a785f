use crate::metrics::Metrics;
use crate::models::{Phase, ProgressState};
use crate::services::output::{ChildProcess, OutputStream, spawn_with_output};
use crate::services::tx_cli::TxCli;
use crate::state::StateManager;
use camino::Utf8Path;
use regex::Regex;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// Error lines kept for the final report.
pub const MAX_ERROR_LINES: usize = 20;

/// Case-insensitive substrings marking a line worth keeping.
pub const ERROR_KEYWORDS: [&str; 6] = ["error:", "failed", "timeout", "warning:", "abort", "exception"];

const SUMMARY_KEYWORDS: [&str; 2] = ["got info about resources:", "pulled files:"];

/// Wait per poll of the output stream.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Wait for a killed child to be reaped.
pub const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// Upper bound on draining buffered output after the child exited.
pub const DRAIN_LIMIT: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Process timed out after {0:?}")]
    Timeout(Duration),

    #[error("Failed to start {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("I/O error while monitoring child: {0}")]
    Io(#[from] io::Error),
}

/// Result of a monitored child run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalOutcome {
    pub return_code: i32,
    pub error_lines: Vec<String>,
}

/// Something the tracker derived from one output line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerEvent {
    PhaseChanged(Phase),
    Progress { phase: Phase, current: u64, total: u64 },
    ErrorLine(String),
    Summary(String),
}

/// Phase/progress state machine over `tx pull` output lines.
///
/// Only retained error lines outlive a call to [`process_line`](Self::process_line).
pub struct ProgressTracker {
    state: ProgressState,
    error_lines: Vec<String>,
    max_error_lines: usize,
    counter_pattern: Regex,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self {
            state: ProgressState::new(),
            error_lines: Vec::new(),
            max_error_lines: MAX_ERROR_LINES,
            counter_pattern: Regex::new(r"\(\s*(\d+)\s*/\s*(\d+)\s*\)")
                .expect("Invalid progress counter regex"),
        }
    }

    pub fn with_max_error_lines(mut self, max: usize) -> Self {
        self.max_error_lines = max;
        self
    }

    pub fn state(&self) -> &ProgressState {
        &self.state
    }

    pub fn error_lines(&self) -> &[String] {
        &self.error_lines
    }

    pub fn into_error_lines(self) -> Vec<String> {
        self.error_lines
    }

    /// Consume one line of output.
    pub fn process_line(&mut self, line: &str) -> Vec<TrackerEvent> {
        let mut events = Vec::new();
        let line = line.trim();
        if line.is_empty() {
            return events;
        }

        let marker = line.trim_start_matches('#').trim().to_lowercase();
        if marker == "getting info about resources" {
            self.state.enter(Phase::Info);
            events.push(TrackerEvent::PhaseChanged(Phase::Info));
        } else if marker == "pulling files" {
            if self.state.phase == Phase::Info
                && self.state.total > 0
                && self.state.current < self.state.total
            {
                // tx skips the last info counter when it moves on
                self.state.current = self.state.total;
                events.push(TrackerEvent::Progress {
                    phase: Phase::Info,
                    current: self.state.total,
                    total: self.state.total,
                });
            }
            self.state.enter(Phase::Downloading);
            events.push(TrackerEvent::PhaseChanged(Phase::Downloading));
        }

        if let Some(caps) = self.counter_pattern.captures(line) {
            let current = caps[1].parse::<u64>().ok();
            let total = caps[2].parse::<u64>().ok();
            if let (Some(current), Some(total)) = (current, total) {
                if (current, total) != (self.state.current, self.state.total) {
                    self.state.current = current;
                    self.state.total = total;
                    events.push(TrackerEvent::Progress {
                        phase: self.state.phase,
                        current,
                        total,
                    });
                }
            }
            return events;
        }

        let lower = line.to_lowercase();
        if ERROR_KEYWORDS.iter().any(|k| lower.contains(k)) {
            if self.error_lines.len() < self.max_error_lines {
                self.error_lines.push(line.to_string());
            }
            events.push(TrackerEvent::ErrorLine(line.to_string()));
        } else if SUMMARY_KEYWORDS.iter().any(|k| lower.contains(k)) {
            events.push(TrackerEvent::Summary(line.to_string()));
        }

        events
    }

    /// Mark the run finished.
    pub fn finish(&mut self) -> TrackerEvent {
        self.state.enter(Phase::Done);
        TrackerEvent::PhaseChanged(Phase::Done)
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Drives a [`ProgressTracker`] from a child's output under a wall-clock ceiling.
pub struct ProgressMonitor {
    state: StateManager,
    metrics: Arc<Metrics>,
    poll_interval: Duration,
}

impl ProgressMonitor {
    pub fn new(state: StateManager, metrics: Arc<Metrics>) -> Self {
        Self {
            state,
            metrics,
            poll_interval: POLL_INTERVAL,
        }
    }

    /// Spawn `tx <args>` in `work_dir` (through a pty when possible) and monitor it.
    pub async fn run<S: AsRef<str>>(
        &self,
        cli: &TxCli,
        work_dir: &Utf8Path,
        args: &[S],
        hard_timeout: Duration,
    ) -> Result<FinalOutcome, MonitorError> {
        let (child, stream) =
            spawn_with_output(cli, work_dir, args, true).map_err(|source| MonitorError::Spawn {
                command: cli.display(args),
                source,
            })?;
        self.monitor(child, stream, hard_timeout).await
    }

    /// Consume `stream` until `child` exits or `hard_timeout` elapses.
    ///
    /// The ceiling is checked against elapsed time on every poll, so a child
    /// that is alive but silent is still terminated.
    pub async fn monitor(
        &self,
        mut child: ChildProcess,
        mut stream: OutputStream,
        hard_timeout: Duration,
    ) -> Result<FinalOutcome, MonitorError> {
        let started = Instant::now();
        let mut tracker = ProgressTracker::new();
        let mut stream_open = true;

        tracing::debug!(
            "Monitoring child output (interactive: {})",
            stream.is_interactive()
        );

        let return_code = loop {
            if started.elapsed() > hard_timeout {
                tracing::error!("Child exceeded hard timeout of {:?}, terminating", hard_timeout);
                stream.close();
                child.terminate(TERMINATE_GRACE).await?;
                return Err(MonitorError::Timeout(hard_timeout));
            }

            if let Some(code) = child.try_wait()? {
                break code;
            }

            if stream_open {
                match stream.next_line(self.poll_interval).await {
                    Ok(Some(line)) => self.handle_line(&mut tracker, &line),
                    Ok(None) => {}
                    Err(_) => stream_open = false,
                }
            } else {
                tokio::time::sleep(self.poll_interval).await;
            }
        };

        if stream_open {
            self.drain(&mut tracker, &mut stream).await;
        }

        let done = tracker.finish();
        self.apply(done);

        tracing::info!(
            "Child exited with code {} after {:.1}s",
            return_code,
            started.elapsed().as_secs_f64()
        );

        Ok(FinalOutcome {
            return_code,
            error_lines: tracker.into_error_lines(),
        })
    }

    /// Read what is still buffered once the child is gone.
    async fn drain(&self, tracker: &mut ProgressTracker, stream: &mut OutputStream) {
        let deadline = Instant::now() + DRAIN_LIMIT;
        while Instant::now() < deadline {
            match stream.next_line(self.poll_interval).await {
                Ok(Some(line)) => self.handle_line(tracker, &line),
                Ok(None) | Err(_) => break,
            }
        }
        stream.close();
        while let Ok(Some(line)) = stream.try_next_line() {
            self.handle_line(tracker, &line);
        }
    }

    fn handle_line(&self, tracker: &mut ProgressTracker, line: &str) {
        self.metrics.record_output_line();
        for event in tracker.process_line(line) {
            self.apply(event);
        }
    }

    fn apply(&self, event: TrackerEvent) {
        let changes = match event {
            TrackerEvent::PhaseChanged(phase) => self.state.enter_phase(phase),
            TrackerEvent::Progress { current, total, .. } => self.state.set_progress(current, total),
            TrackerEvent::ErrorLine(line) => {
                self.metrics.record_error_line();
                tracing::warn!("tx: {}", line);
                self.state.record_error_line(&line)
            }
            TrackerEvent::Summary(line) => {
                tracing::info!("tx: {}", line);
                Vec::new()
            }
        };
        self.metrics.record_render_events(changes.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StateChange;

    #[test]
    fn test_phase_markers() {
        let mut tracker = ProgressTracker::new();
        assert_eq!(tracker.state().phase, Phase::Starting);

        let events = tracker.process_line("# Getting info about resources");
        assert_eq!(events, vec![TrackerEvent::PhaseChanged(Phase::Info)]);

        tracker.process_line("# Pulling files");
        assert_eq!(tracker.state().phase, Phase::Downloading);
    }

    #[test]
    fn test_counter_updates_only_on_change() {
        let mut tracker = ProgressTracker::new();
        tracker.process_line("# Pulling files");

        let events = tracker.process_line("(5 / 10)");
        assert_eq!(
            events,
            vec![TrackerEvent::Progress {
                phase: Phase::Downloading,
                current: 5,
                total: 10
            }]
        );
        assert_eq!((tracker.state().current, tracker.state().total), (5, 10));

        assert!(tracker.process_line("(5 / 10)").is_empty());
        assert!(!tracker.state().is_phase_complete());

        tracker.process_line("pulling fr (10/10)");
        assert!(tracker.state().is_phase_complete());
    }

    #[test]
    fn test_pulling_completes_unfinished_info_phase() {
        let mut tracker = ProgressTracker::new();
        tracker.process_line("# Getting info about resources");
        tracker.process_line("(3 / 7)");

        let events = tracker.process_line("# Pulling files");
        assert_eq!(
            events,
            vec![
                TrackerEvent::Progress {
                    phase: Phase::Info,
                    current: 7,
                    total: 7
                },
                TrackerEvent::PhaseChanged(Phase::Downloading),
            ]
        );
        assert_eq!(tracker.state().current, 0);
    }

    #[test]
    fn test_error_lines_are_bounded() {
        let mut tracker = ProgressTracker::new().with_max_error_lines(2);
        tracker.process_line("Error: resource a failed");
        tracker.process_line("WARNING: slow");
        tracker.process_line("request timeout");
        tracker.process_line("just a normal line");

        assert_eq!(tracker.error_lines(), &["Error: resource a failed", "WARNING: slow"]);
    }

    #[test]
    fn test_summary_lines() {
        let mut tracker = ProgressTracker::new();
        let events = tracker.process_line("Pulled files: 12");
        assert_eq!(events, vec![TrackerEvent::Summary("Pulled files: 12".to_string())]);
    }

    #[test]
    fn test_render_events_through_state_manager() {
        let state = StateManager::new();
        let monitor = ProgressMonitor::new(state.clone(), Arc::new(Metrics::new()));
        let mut tracker = ProgressTracker::new();
        let mut rx = state.subscribe();

        monitor.handle_line(&mut tracker, "# Pulling files");
        monitor.handle_line(&mut tracker, "(5 / 10)");
        monitor.handle_line(&mut tracker, "(5 / 10)");
        monitor.handle_line(&mut tracker, "(10 / 10)");

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }

        assert_eq!(
            events,
            vec![
                StateChange::PhaseChanged {
                    phase: Phase::Downloading
                },
                StateChange::ProgressUpdated {
                    phase: Phase::Downloading,
                    current: 5,
                    total: 10
                },
                StateChange::ProgressUpdated {
                    phase: Phase::Downloading,
                    current: 10,
                    total: 10
                },
                StateChange::PhaseCompleted {
                    phase: Phase::Downloading,
                    total: 10
                },
            ]
        );
    }

    #[cfg(unix)]
    mod process {
        use super::*;

        fn monitor() -> ProgressMonitor {
            ProgressMonitor::new(StateManager::new(), Arc::new(Metrics::new()))
        }

        #[tokio::test]
        async fn test_silent_child_is_terminated_at_ceiling() {
            let cli = TxCli::new("sleep", None);
            let (child, stream) =
                spawn_with_output(&cli, Utf8Path::new("."), &["30"], false).unwrap();

            let started = std::time::Instant::now();
            let result = monitor()
                .monitor(child, stream, Duration::from_millis(300))
                .await;

            assert!(matches!(result, Err(MonitorError::Timeout(_))));
            assert!(started.elapsed() < Duration::from_secs(10));
        }

        #[tokio::test]
        async fn test_output_is_drained_after_exit() {
            let cli = TxCli::new("sh", None);
            let script = "echo '# Pulling files'; echo '(1 / 2)'; echo 'error: boom'; echo '(2 / 2)'; exit 3";
            let (child, stream) =
                spawn_with_output(&cli, Utf8Path::new("."), &["-c", script], false).unwrap();

            let state = StateManager::new();
            let monitor = ProgressMonitor::new(state.clone(), Arc::new(Metrics::new()));
            let outcome = monitor
                .monitor(child, stream, Duration::from_secs(10))
                .await
                .unwrap();

            assert_eq!(outcome.return_code, 3);
            assert_eq!(outcome.error_lines, vec!["error: boom"]);
            assert_eq!(state.snapshot().phase, Phase::Done);
        }
    }
}
