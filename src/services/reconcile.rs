use crate::models::{ConfigSnapshot, DiffResult, ExistingConfigPolicy, Project};
use std::collections::BTreeSet;

/// Compare discovered projects against what the config already covers.
///
/// `missing = discovered - configured`, `extra = configured - discovered`.
pub fn reconcile(discovered: &[Project], snapshot: &ConfigSnapshot) -> DiffResult {
    let discovered: BTreeSet<&str> = discovered.iter().map(|p| p.slug.as_str()).collect();
    let configured: BTreeSet<&str> = snapshot
        .configured_project_slugs
        .iter()
        .map(String::as_str)
        .collect();

    DiffResult {
        missing_projects: discovered
            .difference(&configured)
            .map(|s| s.to_string())
            .collect(),
        extra_projects: configured
            .difference(&discovered)
            .map(|s| s.to_string())
            .collect(),
    }
}

/// What the pipeline does to `.tx/config` before pulling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigPlan {
    /// Run `tx init`, then add these projects.
    Initialize { add: Vec<Project> },
    /// Keep the config and add these projects to it.
    Extend { add: Vec<Project> },
    /// Pull with the config as it is.
    UseAsIs,
    /// Back up and remove the config, `tx init`, then add these projects.
    StartFresh { add: Vec<Project> },
}

impl ConfigPlan {
    /// Projects the plan will hand to `tx add remote`.
    pub fn projects_to_add(&self) -> &[Project] {
        match self {
            ConfigPlan::Initialize { add }
            | ConfigPlan::Extend { add }
            | ConfigPlan::StartFresh { add } => add,
            ConfigPlan::UseAsIs => &[],
        }
    }
}

/// Decide what to do with the config given the diff and the configured policy.
pub fn plan(
    discovered: &[Project],
    snapshot: &ConfigSnapshot,
    diff: &DiffResult,
    policy: ExistingConfigPolicy,
) -> ConfigPlan {
    if !snapshot.exists {
        return ConfigPlan::Initialize {
            add: discovered.to_vec(),
        };
    }

    match policy {
        ExistingConfigPolicy::UseExisting => ConfigPlan::UseAsIs,
        ExistingConfigPolicy::StartFresh => ConfigPlan::StartFresh {
            add: discovered.to_vec(),
        },
        ExistingConfigPolicy::AddMissing if diff.missing_projects.is_empty() => {
            ConfigPlan::UseAsIs
        }
        ExistingConfigPolicy::AddMissing => ConfigPlan::Extend {
            add: discovered
                .iter()
                .filter(|p| diff.missing_projects.contains(&p.slug))
                .cloned()
                .collect(),
        },
    }
}
