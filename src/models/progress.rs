use std::fmt;
use std::time::Instant;

/// Phase of a `tx pull` run as inferred from its output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Starting,
    Info,
    Downloading,
    Done,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Phase::Starting => "starting",
            Phase::Info => "getting resource info",
            Phase::Downloading => "downloading files",
            Phase::Done => "done",
        };
        f.write_str(label)
    }
}

/// Progress of the current phase.
///
/// `current`/`total` only change when the child reports a different pair.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressState {
    pub phase: Phase,
    pub current: u64,
    pub total: u64,
    pub phase_start_time: Instant,
}

impl ProgressState {
    pub fn new() -> Self {
        Self {
            phase: Phase::Starting,
            current: 0,
            total: 0,
            phase_start_time: Instant::now(),
        }
    }

    pub fn enter(&mut self, phase: Phase) {
        self.phase = phase;
        self.current = 0;
        self.total = 0;
        self.phase_start_time = Instant::now();
    }

    pub fn is_phase_complete(&self) -> bool {
        self.total > 0 && self.current == self.total
    }
}

impl Default for ProgressState {
    fn default() -> Self {
        Self::new()
    }
}

/// Format elapsed seconds as `42s`, `3m 5s`, `1h 2m 3s` or `2h 0m`.
pub fn format_elapsed(elapsed_seconds: u64) -> String {
    if elapsed_seconds < 60 {
        format!("{}s", elapsed_seconds)
    } else if elapsed_seconds < 3600 {
        format!("{}m {}s", elapsed_seconds / 60, elapsed_seconds % 60)
    } else {
        let hours = elapsed_seconds / 3600;
        let minutes = (elapsed_seconds % 3600) / 60;
        let seconds = elapsed_seconds % 60;
        if seconds > 0 {
            format!("{}h {}m {}s", hours, minutes, seconds)
        } else {
            format!("{}h {}m", hours, minutes)
        }
    }
}
