// Run metrics module
//
// Lightweight counters for a download run, logged at teardown

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Counters for one download run
///
/// Uses atomic operations so the pipeline, the output reader and the
/// renderer can record without locks.
#[derive(Debug)]
pub struct Metrics {
    /// Projects successfully added with `tx add remote`
    pub projects_added: AtomicUsize,

    /// Projects whose `tx add remote` failed or timed out
    pub projects_failed: AtomicUsize,

    /// Resources that appeared in `.tx/config` through added projects
    pub resources_added: AtomicUsize,

    /// Total time spent in `tx add remote` in milliseconds
    pub total_add_time_ms: AtomicU64,

    /// Lines read from the `tx pull` output stream
    pub output_lines: AtomicU64,

    /// State change events emitted for rendering
    pub render_events: AtomicU64,

    /// Error lines retained from the pull output
    pub error_lines: AtomicU64,

    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            projects_added: AtomicUsize::new(0),
            projects_failed: AtomicUsize::new(0),
            resources_added: AtomicUsize::new(0),
            total_add_time_ms: AtomicU64::new(0),
            output_lines: AtomicU64::new(0),
            render_events: AtomicU64::new(0),
            error_lines: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record a successful project add and the resources it brought
    pub fn record_project_added(&self, resources: usize) {
        self.projects_added.fetch_add(1, Ordering::Relaxed);
        self.resources_added.fetch_add(resources, Ordering::Relaxed);
    }

    pub fn record_project_failed(&self) {
        self.projects_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record time spent in one `tx add remote`
    pub fn record_add_time(&self, duration: Duration) {
        self.total_add_time_ms
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn record_output_line(&self) {
        self.output_lines.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_render_events(&self, count: usize) {
        self.render_events.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_error_line(&self) {
        self.error_lines.fetch_add(1, Ordering::Relaxed);
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Average `tx add remote` duration per processed project in seconds
    pub fn avg_add_time_secs(&self) -> f64 {
        let total = self.total_add_time_ms.load(Ordering::Relaxed);
        let count = self.projects_added.load(Ordering::Relaxed)
            + self.projects_failed.load(Ordering::Relaxed);
        if count > 0 {
            total as f64 / count as f64 / 1000.0
        } else {
            0.0
        }
    }

    /// Log metrics summary
    pub fn log_summary(&self) {
        tracing::info!("=== Run Metrics Summary ===");
        tracing::info!("Uptime: {:.2}s", self.uptime().as_secs_f64());
        tracing::info!(
            "Projects: {} added, {} failed, {} resources (avg {:.2}s per project)",
            self.projects_added.load(Ordering::Relaxed),
            self.projects_failed.load(Ordering::Relaxed),
            self.resources_added.load(Ordering::Relaxed),
            self.avg_add_time_secs()
        );
        tracing::info!(
            "Pull output: {} lines, {} render events, {} error lines",
            self.output_lines.load(Ordering::Relaxed),
            self.render_events.load(Ordering::Relaxed),
            self.error_lines.load(Ordering::Relaxed)
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new();
        assert_eq!(metrics.projects_added.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.output_lines.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_record_project_operations() {
        let metrics = Metrics::new();

        metrics.record_project_added(3);
        metrics.record_project_added(2);
        metrics.record_project_failed();

        assert_eq!(metrics.projects_added.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.projects_failed.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.resources_added.load(Ordering::Relaxed), 5);
    }

    #[test]
    fn test_avg_add_time() {
        let metrics = Metrics::new();
        assert_eq!(metrics.avg_add_time_secs(), 0.0);

        metrics.record_project_added(1);
        metrics.record_add_time(Duration::from_millis(1000));
        metrics.record_project_failed();
        metrics.record_add_time(Duration::from_millis(3000));

        assert_eq!(metrics.avg_add_time_secs(), 2.0);
    }

    #[test]
    fn test_output_counters() {
        let metrics = Metrics::new();

        metrics.record_output_line();
        metrics.record_output_line();
        metrics.record_render_events(3);
        metrics.record_error_line();

        assert_eq!(metrics.output_lines.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.render_events.load(Ordering::Relaxed), 3);
        assert_eq!(metrics.error_lines.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_uptime() {
        let metrics = Metrics::new();
        thread::sleep(Duration::from_millis(10));
        assert!(metrics.uptime().as_millis() >= 10);
    }
}
