// State management module
//
// This module provides the StateManager which wraps RunState with thread-safe access
// using Arc<RwLock<T>> and emits change events for progress rendering.

use crate::models::{Phase, RunStage, RunState};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::broadcast;

/// Change events emitted when run state is modified
///
/// Renderers subscribe to these instead of polling. Events are derived by
/// diffing the state before and after an update, so writing the same values
/// twice emits nothing.
#[derive(Clone, Debug, PartialEq)]
pub enum StateChange {
    /// The run moved to another stage
    StageChanged { stage: RunStage },

    /// Configuration progress (projects processed out of total)
    ConfigurationProgress { processed: usize, total: usize },

    /// A project has been added to `.tx/config` (or failed to be)
    ProjectProcessed {
        project: String,
        success: bool,
        resources_added: usize,
        message: String,
    },

    /// `tx pull` entered a new phase
    PhaseChanged { phase: Phase },

    /// The `(current / total)` pair of the current phase changed
    ProgressUpdated { phase: Phase, current: u64, total: u64 },

    /// The current phase reached `current == total > 0`
    PhaseCompleted { phase: Phase, total: u64 },

    /// An error-looking line was retained from the child output
    ErrorLine { line: String },

    /// Free-form status text for the user
    Notice { message: String },
}

/// Thread-safe run state manager with event emission
///
/// - Provides access to [`RunState`] via `Arc<RwLock<T>>`
/// - Detects state changes and emits [`StateChange`] events
/// - Supports subscribing to changes via tokio broadcast channels
///
/// The manager is the explicit run context handed to the pipeline stages;
/// nothing else in the crate holds shared mutable state.
pub struct StateManager {
    state: Arc<RwLock<RunState>>,

    /// Broadcast channel for emitting state change events
    state_tx: broadcast::Sender<StateChange>,
}

impl StateManager {
    /// Create a new StateManager with default state
    ///
    /// The broadcast buffer holds 256 events; slow renderers lag rather than block.
    pub fn new() -> Self {
        let (state_tx, _) = broadcast::channel(256);
        Self {
            state: Arc::new(RwLock::new(RunState::default())),
            state_tx,
        }
    }

    /// Get a cloned snapshot of the current state
    pub fn snapshot(&self) -> RunState {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Execute a function with read access to the state
    ///
    /// # Example
    /// ```ignore
    /// let added = state_manager.read(|state| state.projects_added);
    /// ```
    pub fn read<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&RunState) -> R,
    {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        f(&state)
    }

    /// Update the state and emit change events
    ///
    /// 1. Captures the old state
    /// 2. Applies the update function
    /// 3. Detects what changed
    /// 4. Emits appropriate events
    ///
    /// # Returns
    /// The StateChange events that were emitted
    pub fn update<F>(&self, update_fn: F) -> Vec<StateChange>
    where
        F: FnOnce(&mut RunState),
    {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let old_state = state.clone();

        update_fn(&mut state);

        let changes = Self::detect_changes(&old_state, &state);

        for change in &changes {
            // Ignore send errors - it's OK if no one is listening
            let _ = self.state_tx.send(change.clone());
        }

        changes
    }

    /// Subscribe to state change events
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.state_tx.subscribe()
    }

    fn emit(&self, change: StateChange) -> StateChange {
        let _ = self.state_tx.send(change.clone());
        change
    }

    /// Detect what changed between two states and generate events
    fn detect_changes(old: &RunState, new: &RunState) -> Vec<StateChange> {
        let mut changes = Vec::new();

        if old.stage != new.stage {
            changes.push(StateChange::StageChanged { stage: new.stage });
        }

        if old.projects_processed() != new.projects_processed()
            || old.projects_to_add != new.projects_to_add
        {
            changes.push(StateChange::ConfigurationProgress {
                processed: new.projects_processed(),
                total: new.projects_to_add,
            });
        }

        if old.phase != new.phase {
            changes.push(StateChange::PhaseChanged { phase: new.phase });
        }

        if (old.current, old.total) != (new.current, new.total) {
            changes.push(StateChange::ProgressUpdated {
                phase: new.phase,
                current: new.current,
                total: new.total,
            });

            let was_complete = old.phase == new.phase && old.total > 0 && old.current == old.total;
            if new.total > 0 && new.current == new.total && !was_complete {
                changes.push(StateChange::PhaseCompleted {
                    phase: new.phase,
                    total: new.total,
                });
            }
        }

        changes
    }

    // Convenience methods for common state updates

    /// Move the run to another stage
    pub fn set_stage(&self, stage: RunStage) -> Vec<StateChange> {
        self.update(|state| state.stage = stage)
    }

    /// Start the configuration stage for `total` projects
    pub fn start_configuring(&self, total: usize) -> Vec<StateChange> {
        self.update(|state| {
            state.stage = RunStage::Configuring;
            state.projects_to_add = total;
            state.projects_added = 0;
            state.projects_failed = 0;
            state.resources_added = 0;
            state.current_project = None;
        })
    }

    /// Record the outcome of adding one project
    pub fn record_project(
        &self,
        project: &str,
        success: bool,
        resources_added: usize,
        message: String,
    ) -> Vec<StateChange> {
        let mut changes = self.update(|state| {
            state.current_project = Some(project.to_string());
            if success {
                state.projects_added += 1;
                state.resources_added += resources_added;
            } else {
                state.projects_failed += 1;
            }
        });

        changes.push(self.emit(StateChange::ProjectProcessed {
            project: project.to_string(),
            success,
            resources_added,
            message,
        }));

        changes
    }

    /// Enter a new pull phase, resetting its counters
    pub fn enter_phase(&self, phase: Phase) -> Vec<StateChange> {
        self.update(|state| {
            state.phase = phase;
            state.current = 0;
            state.total = 0;
        })
    }

    /// Set the `(current, total)` pair of the current phase
    pub fn set_progress(&self, current: u64, total: u64) -> Vec<StateChange> {
        self.update(|state| {
            state.current = current;
            state.total = total;
        })
    }

    /// Record a retained error line from the child output
    pub fn record_error_line(&self, line: &str) -> Vec<StateChange> {
        self.update(|state| state.error_lines += 1);
        vec![self.emit(StateChange::ErrorLine {
            line: line.to_string(),
        })]
    }

    /// Publish a status message without touching the state
    pub fn notify(&self, message: impl Into<String>) -> StateChange {
        let message = message.into();
        tracing::info!("{}", message);
        self.emit(StateChange::Notice { message })
    }
}

impl Default for StateManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for StateManager {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            state_tx: self.state_tx.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_state_manager() {
        let manager = StateManager::new();
        let state = manager.snapshot();

        assert_eq!(state.stage, RunStage::Idle);
        assert_eq!(state.projects_added, 0);
    }

    #[test]
    fn test_stage_change_detection() {
        let manager = StateManager::new();

        let changes = manager.set_stage(RunStage::Discovering);
        assert_eq!(
            changes,
            vec![StateChange::StageChanged {
                stage: RunStage::Discovering
            }]
        );

        // Same stage again: nothing to report
        assert!(manager.set_stage(RunStage::Discovering).is_empty());
    }

    #[test]
    fn test_progress_only_emitted_on_change() {
        let manager = StateManager::new();
        manager.enter_phase(Phase::Downloading);

        let first = manager.set_progress(5, 10);
        assert_eq!(
            first,
            vec![StateChange::ProgressUpdated {
                phase: Phase::Downloading,
                current: 5,
                total: 10
            }]
        );

        let repeat = manager.set_progress(5, 10);
        assert!(repeat.is_empty());
    }

    #[test]
    fn test_phase_completed_emitted_once() {
        let manager = StateManager::new();
        manager.enter_phase(Phase::Info);

        let changes = manager.set_progress(3, 3);
        assert!(changes.contains(&StateChange::PhaseCompleted {
            phase: Phase::Info,
            total: 3
        }));

        assert!(manager.set_progress(3, 3).is_empty());
    }

    #[test]
    fn test_enter_phase_resets_progress() {
        let manager = StateManager::new();
        manager.enter_phase(Phase::Info);
        manager.set_progress(2, 4);

        let changes = manager.enter_phase(Phase::Downloading);
        assert!(changes.contains(&StateChange::PhaseChanged {
            phase: Phase::Downloading
        }));
        assert!(changes.iter().any(|c| matches!(
            c,
            StateChange::ProgressUpdated { current: 0, total: 0, .. }
        )));
    }

    #[test]
    fn test_record_project() {
        let manager = StateManager::new();
        manager.start_configuring(2);

        let changes = manager.record_project("alpha", true, 3, String::new());
        assert!(changes.contains(&StateChange::ConfigurationProgress {
            processed: 1,
            total: 2
        }));
        assert!(
            changes
                .iter()
                .any(|c| matches!(c, StateChange::ProjectProcessed { success: true, .. }))
        );

        manager.record_project("beta", false, 0, "timeout".to_string());

        let state = manager.snapshot();
        assert_eq!(state.projects_added, 1);
        assert_eq!(state.projects_failed, 1);
        assert_eq!(state.resources_added, 3);
        assert_eq!(state.current_project.as_deref(), Some("beta"));
    }

    #[test]
    fn test_subscribe_to_changes() {
        let manager = StateManager::new();
        let mut rx = manager.subscribe();

        manager.record_error_line("error: boom");

        let event = rx.try_recv();
        assert!(matches!(event, Ok(StateChange::ErrorLine { .. })));
        assert_eq!(manager.read(|s| s.error_lines), 1);
    }

    #[test]
    fn test_clone_state_manager() {
        let manager1 = StateManager::new();
        let manager2 = manager1.clone();

        manager1.set_progress(1, 2);

        let state = manager2.snapshot();
        assert_eq!((state.current, state.total), (1, 2));
    }
}
