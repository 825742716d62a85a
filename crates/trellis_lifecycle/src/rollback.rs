use std::time::{Duration, Instant};

use trellis_plugin::{EventKind, PluginEvent, SharedPlugin};

use crate::driver::LifecycleDriver;
use crate::events::millis;
use crate::teardown::teardown;

/// Result of rolling back one plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackOutcome {
    /// Plugin ID.
    pub plugin_id: String,
    /// Plugin name.
    pub plugin_name: String,
    /// Rendered stop failure, if any.
    pub stop_error: Option<String>,
    /// Rendered cleanup failure, if any.
    pub cleanup_error: Option<String>,
}

impl RollbackOutcome {
    /// Returns true if both stop and cleanup succeeded.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.stop_error.is_none() && self.cleanup_error.is_none()
    }
}

/// Aggregate of a startup rollback.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RollbackReport {
    /// One entry per rolled-back plugin, in rollback (reverse start) order.
    pub outcomes: Vec<RollbackOutcome>,
    /// Wall-clock time spent rolling back.
    pub duration: Duration,
    /// Number of startup failures that triggered the rollback.
    pub initial_errors: usize,
}

impl RollbackReport {
    /// Plugins rolled back.
    #[must_use]
    pub fn total(&self) -> usize {
        self.outcomes.len()
    }

    /// Plugins whose stop and cleanup both succeeded.
    #[must_use]
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.succeeded()).count()
    }

    /// Plugins with a failed stop or cleanup.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.total() - self.succeeded()
    }
}

/// Tears down `started` in reverse order. Never stops early: every plugin gets
/// its stop and cleanup attempt.
pub(crate) async fn rollback(
    driver: &LifecycleDriver,
    started: &[SharedPlugin],
    stop_timeout: Duration,
    initial_errors: usize,
) -> RollbackReport {
    let began = Instant::now();
    let mut outcomes = Vec::with_capacity(started.len());

    for plugin in started.iter().rev() {
        let result = teardown(driver, plugin, "rollback", stop_timeout, stop_timeout).await;
        if result.is_clean() {
            tracing::info!(plugin = plugin.name(), id = plugin.id(), took = ?result.took, "rolled back plugin");
        }
        outcomes.push(RollbackOutcome {
            plugin_id: plugin.id().to_owned(),
            plugin_name: plugin.name().to_owned(),
            stop_error: result.stop_error.map(|e| e.to_string()),
            cleanup_error: result.cleanup_error.map(|e| e.to_string()),
        });
    }

    let report = RollbackReport {
        outcomes,
        duration: began.elapsed(),
        initial_errors,
    };

    if report.failed() == 0 {
        tracing::info!(
            total = report.total(),
            duration = ?report.duration,
            "rollback completed"
        );
    } else {
        tracing::error!(
            total = report.total(),
            failed = report.failed(),
            duration = ?report.duration,
            "rollback completed with failures; resources may have leaked"
        );
    }

    driver.runtime().emit_event(
        PluginEvent::new(EventKind::RollbackCompleted, "")
            .with_meta("total", report.total())
            .with_meta("succeeded", report.succeeded())
            .with_meta("failed", report.failed())
            .with_meta("duration_ms", millis(report.duration))
            .with_meta("initial_errors", initial_errors),
    );

    report
}
