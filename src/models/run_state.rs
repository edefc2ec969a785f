use super::progress::Phase;

/// Stage of the overall download run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunStage {
    #[default]
    Idle,
    Discovering,
    Configuring,
    Downloading,
    Reporting,
    Finished,
}

/// Runtime state of a single download run.
///
/// Wrapped in `Arc<RwLock<RunState>>` by [`crate::state::StateManager`];
/// mutate it only through [`update()`](crate::state::StateManager::update)
/// so change events are emitted.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RunState {
    pub stage: RunStage,

    // Configuration phase
    pub projects_to_add: usize,
    pub projects_added: usize,
    pub projects_failed: usize,
    pub resources_added: usize,
    pub current_project: Option<String>,

    // Pull phase
    pub phase: Phase,
    pub current: u64,
    pub total: u64,
    pub error_lines: usize,
}

impl RunState {
    /// Projects processed so far in the configuration phase.
    pub fn projects_processed(&self) -> usize {
        self.projects_added + self.projects_failed
    }

    pub fn is_running(&self) -> bool {
        !matches!(self.stage, RunStage::Idle | RunStage::Finished)
    }

    pub fn reset_pull_progress(&mut self) {
        self.phase = Phase::Starting;
        self.current = 0;
        self.total = 0;
        self.error_lines = 0;
    }
}
