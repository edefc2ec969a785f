//! Integration tests for StateManager with state change events
//!
//! These tests verify that the StateManager correctly:
//! - Emits configuration and pull progress events
//! - Suppresses events for unchanged progress pairs
//! - Supports multiple subscribers
//! - Handles concurrent access from multiple threads

use std::sync::Arc;
use std::thread;
use tokio::sync::broadcast;
use tokio::time::{Duration, timeout};
use txbulk::models::Phase;
use txbulk::{RunStage, StateChange, StateManager};

async fn next_event(rx: &mut broadcast::Receiver<StateChange>) -> StateChange {
    timeout(Duration::from_millis(100), rx.recv())
        .await
        .expect("Timeout waiting for event")
        .expect("Channel closed")
}

#[tokio::test]
async fn test_configuration_events() {
    let state = StateManager::new();
    let mut rx = state.subscribe();

    state.start_configuring(2);
    assert_eq!(
        next_event(&mut rx).await,
        StateChange::StageChanged {
            stage: RunStage::Configuring
        }
    );
    assert_eq!(
        next_event(&mut rx).await,
        StateChange::ConfigurationProgress {
            processed: 0,
            total: 2
        }
    );

    state.record_project("alpha", true, 3, String::new());
    assert_eq!(
        next_event(&mut rx).await,
        StateChange::ConfigurationProgress {
            processed: 1,
            total: 2
        }
    );
    assert!(matches!(
        next_event(&mut rx).await,
        StateChange::ProjectProcessed {
            success: true,
            resources_added: 3,
            ..
        }
    ));

    state.record_project("beta", false, 0, "Timeout after 300s".to_string());
    next_event(&mut rx).await;
    match next_event(&mut rx).await {
        StateChange::ProjectProcessed {
            project, message, ..
        } => {
            assert_eq!(project, "beta");
            assert_eq!(message, "Timeout after 300s");
        }
        other => panic!("Expected ProjectProcessed, got: {:?}", other),
    }

    let snapshot = state.snapshot();
    assert_eq!(snapshot.projects_added, 1);
    assert_eq!(snapshot.projects_failed, 1);
    assert_eq!(snapshot.resources_added, 3);
}

#[tokio::test]
async fn test_unchanged_progress_emits_nothing() {
    let state = StateManager::new();
    state.enter_phase(Phase::Downloading);
    let mut rx = state.subscribe();

    let first = state.set_progress(3, 10);
    assert_eq!(first.len(), 1);
    let repeated = state.set_progress(3, 10);
    assert!(repeated.is_empty());

    assert!(matches!(
        next_event(&mut rx).await,
        StateChange::ProgressUpdated {
            current: 3,
            total: 10,
            ..
        }
    ));
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_phase_completion_emitted_once() {
    let state = StateManager::new();
    state.enter_phase(Phase::Info);

    let changes = state.set_progress(4, 4);
    assert!(changes.contains(&StateChange::PhaseCompleted {
        phase: Phase::Info,
        total: 4
    }));

    let changes = state.enter_phase(Phase::Downloading);
    assert!(changes.contains(&StateChange::PhaseChanged {
        phase: Phase::Downloading
    }));
    assert!(
        !changes
            .iter()
            .any(|c| matches!(c, StateChange::PhaseCompleted { .. }))
    );
}

#[tokio::test]
async fn test_multiple_subscribers_receive_notices() {
    let state = StateManager::new();
    let mut rx1 = state.subscribe();
    let mut rx2 = state.subscribe();

    state.notify("Found 3 project(s) in organization");

    let expected = StateChange::Notice {
        message: "Found 3 project(s) in organization".to_string(),
    };
    assert_eq!(next_event(&mut rx1).await, expected);
    assert_eq!(next_event(&mut rx2).await, expected);
}

#[tokio::test]
async fn test_error_lines_counted() {
    let state = StateManager::new();
    let mut rx = state.subscribe();

    state.record_error_line("error: resource broken");

    assert_eq!(
        next_event(&mut rx).await,
        StateChange::ErrorLine {
            line: "error: resource broken".to_string()
        }
    );
    assert_eq!(state.read(|s| s.error_lines), 1);
}

#[test]
fn test_concurrent_project_records() {
    let state = Arc::new(StateManager::new());
    state.start_configuring(40);

    let handles: Vec<_> = (0..4)
        .map(|worker| {
            let state = Arc::clone(&state);
            thread::spawn(move || {
                for i in 0..10 {
                    let slug = format!("project-{}-{}", worker, i);
                    state.record_project(&slug, i % 2 == 0, 1, String::new());
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    let snapshot = state.snapshot();
    assert_eq!(snapshot.projects_processed(), 40);
    assert_eq!(snapshot.projects_added, 20);
    assert_eq!(snapshot.resources_added, 20);
}
