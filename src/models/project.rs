use indexmap::IndexMap;
use std::collections::{BTreeSet, HashSet};

/// A project discovered in the remote organization.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Project {
    pub slug: String,
    pub display_name: String,
}

impl Project {
    pub fn new(slug: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            slug: slug.into(),
            display_name: display_name.into(),
        }
    }
}

/// One `[o:org:p:project:r:resource]` section of `.tx/config`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceEntry {
    pub org_slug: String,
    pub project_slug: String,
    pub resource_slug: String,
    pub raw_section_header: String,
}

/// What `.tx/config` currently configures for download.
///
/// Built fresh by a full streaming parse on every invocation.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ConfigSnapshot {
    pub exists: bool,
    pub age_hours: Option<f64>,
    pub resource_counts_by_project: IndexMap<String, usize>,
    pub all_resources: Vec<ResourceEntry>,
    pub configured_project_slugs: BTreeSet<String>,
    /// (project, resource) pairs already recorded
    seen: HashSet<(String, String)>,
}

impl ConfigSnapshot {
    /// Snapshot for a config file that does not exist.
    pub fn missing() -> Self {
        Self::default()
    }

    /// Snapshot for a file that exists but could not be read.
    pub fn empty_existing(age_hours: Option<f64>) -> Self {
        Self {
            exists: true,
            age_hours,
            ..Self::default()
        }
    }

    /// Record a resource section. Returns false for a repeated header.
    pub fn push(&mut self, entry: ResourceEntry) -> bool {
        if !self
            .seen
            .insert((entry.project_slug.clone(), entry.resource_slug.clone()))
        {
            return false;
        }
        *self
            .resource_counts_by_project
            .entry(entry.project_slug.clone())
            .or_insert(0) += 1;
        self.configured_project_slugs
            .insert(entry.project_slug.clone());
        self.all_resources.push(entry);
        true
    }

    pub fn total_resources(&self) -> usize {
        self.all_resources.len()
    }

    pub fn resources_for(&self, project_slug: &str) -> usize {
        self.resource_counts_by_project
            .get(project_slug)
            .copied()
            .unwrap_or(0)
    }

    /// Projects ordered by resource count, largest first.
    pub fn top_projects(&self, limit: usize) -> Vec<(&str, usize)> {
        let mut projects: Vec<(&str, usize)> = self
            .resource_counts_by_project
            .iter()
            .map(|(slug, count)| (slug.as_str(), *count))
            .collect();
        projects.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        projects.truncate(limit);
        projects
    }

    /// Human-readable config age (minutes, hours or days).
    pub fn age_description(&self) -> Option<String> {
        self.age_hours.map(|hours| {
            if hours < 1.0 {
                format!("{:.0} minutes", hours * 60.0)
            } else if hours < 24.0 {
                format!("{:.1} hours", hours)
            } else {
                format!("{:.1} days", hours / 24.0)
            }
        })
    }

    /// Multi-line status summary of the config compared to discovery.
    pub fn status_lines(&self, discovered: usize, missing: &BTreeSet<String>) -> Vec<String> {
        let mut lines = vec![
            "Configuration status:".to_string(),
            format!(
                "  {} resources from {} projects configured",
                self.total_resources(),
                self.resource_counts_by_project.len()
            ),
            format!("  organization has {} projects", discovered),
        ];

        if let Some(age) = self.age_description() {
            lines.push(format!("  config is {} old", age));
        }

        if !missing.is_empty() {
            lines.push(format!("  {} new/empty projects detected:", missing.len()));
            for slug in missing.iter().take(5) {
                lines.push(format!("    + {}", slug));
            }
            if missing.len() > 5 {
                lines.push(format!("    ... and {} more", missing.len() - 5));
            }
        }

        if !self.resource_counts_by_project.is_empty() {
            lines.push("  top projects by resource count:".to_string());
            for (slug, count) in self.top_projects(5) {
                lines.push(format!("    - {}: {} resources", slug, count));
            }
            if self.resource_counts_by_project.len() > 5 {
                lines.push(format!(
                    "    ... and {} more projects",
                    self.resource_counts_by_project.len() - 5
                ));
            }
        }

        lines
    }
}

/// Set difference between discovered and configured project slugs.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DiffResult {
    pub missing_projects: BTreeSet<String>,
    pub extra_projects: BTreeSet<String>,
}

impl DiffResult {
    pub fn is_in_sync(&self) -> bool {
        self.missing_projects.is_empty() && self.extra_projects.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(project: &str, resource: &str) -> ResourceEntry {
        ResourceEntry {
            org_slug: "acme".to_string(),
            project_slug: project.to_string(),
            resource_slug: resource.to_string(),
            raw_section_header: format!("o:acme:p:{}:r:{}", project, resource),
        }
    }

    #[test]
    fn test_push_keeps_counts_consistent() {
        let mut snapshot = ConfigSnapshot::missing();
        snapshot.push(entry("alpha", "a"));
        snapshot.push(entry("alpha", "b"));
        snapshot.push(entry("beta", "a"));

        let sum: usize = snapshot.resource_counts_by_project.values().sum();
        assert_eq!(sum, snapshot.all_resources.len());
        assert_eq!(snapshot.resources_for("alpha"), 2);
        assert_eq!(snapshot.resources_for("gamma"), 0);
        assert_eq!(snapshot.configured_project_slugs.len(), 2);
    }

    #[test]
    fn test_top_projects_ordering() {
        let mut snapshot = ConfigSnapshot::missing();
        snapshot.push(entry("small", "a"));
        snapshot.push(entry("big", "a"));
        snapshot.push(entry("big", "b"));

        let top = snapshot.top_projects(5);
        assert_eq!(top, vec![("big", 2), ("small", 1)]);
    }

    #[test]
    fn test_age_description() {
        let mut snapshot = ConfigSnapshot::empty_existing(Some(0.5));
        assert_eq!(snapshot.age_description().as_deref(), Some("30 minutes"));

        snapshot.age_hours = Some(5.0);
        assert_eq!(snapshot.age_description().as_deref(), Some("5.0 hours"));

        snapshot.age_hours = Some(72.0);
        assert_eq!(snapshot.age_description().as_deref(), Some("3.0 days"));

        snapshot.age_hours = None;
        assert!(snapshot.age_description().is_none());
    }

    #[test]
    fn test_status_lines_lists_missing_projects() {
        let mut snapshot = ConfigSnapshot::empty_existing(None);
        snapshot.push(entry("alpha", "a"));
        let missing: BTreeSet<String> = ["beta".to_string()].into_iter().collect();

        let lines = snapshot.status_lines(2, &missing);
        assert!(lines.iter().any(|l| l.contains("1 resources from 1 projects")));
        assert!(lines.iter().any(|l| l.contains("+ beta")));
        assert!(lines.iter().any(|l| l.contains("alpha: 1 resources")));
    }
}
