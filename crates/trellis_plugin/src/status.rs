use core::fmt;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::plugin::StatusSink;

/// Advisory lifecycle status of a plugin.
///
/// The orchestrator reports transitions through [`StatusSink`] when a plugin
/// exposes one. Nothing in the orchestrator reads the status back, so plugins
/// without a sink lose no behavior.
///
/// ```text
/// Uninitialized -> Initializing -> Inactive -> Active -> Stopping -> Terminated
///                       |                        |          |
///                       +--------> Failed <------+----------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginStatus {
    /// Constructed but never initialized.
    #[default]
    Uninitialized,
    /// `initialize` is in progress.
    Initializing,
    /// Initialized and not started, or stopped cleanly during rollback.
    Inactive,
    /// Running.
    Active,
    /// Paused by the plugin itself.
    Suspended,
    /// `stop` is in progress.
    Stopping,
    /// Stopped for good.
    Terminated,
    /// Absorbing failure state for the current orchestration run.
    Failed,
}

impl PluginStatus {
    /// Returns the lowercase name used in logs and event metadata.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            PluginStatus::Uninitialized => "uninitialized",
            PluginStatus::Initializing => "initializing",
            PluginStatus::Inactive => "inactive",
            PluginStatus::Active => "active",
            PluginStatus::Suspended => "suspended",
            PluginStatus::Stopping => "stopping",
            PluginStatus::Terminated => "terminated",
            PluginStatus::Failed => "failed",
        }
    }

    /// Returns true for states the orchestrator never leaves on its own.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, PluginStatus::Terminated | PluginStatus::Failed)
    }
}

impl fmt::Display for PluginStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A ready-made [`StatusSink`] that plugins can embed.
///
/// # Example
///
/// ```
/// use trellis_plugin::{PluginStatus, StatusCell, StatusSink};
///
/// let cell = StatusCell::default();
/// cell.set_status(PluginStatus::Active);
/// assert_eq!(cell.get(), PluginStatus::Active);
/// ```
#[derive(Debug, Default)]
pub struct StatusCell {
    inner: Mutex<PluginStatus>,
}

impl StatusCell {
    /// Creates a cell holding `status`.
    #[must_use]
    pub fn new(status: PluginStatus) -> Self {
        Self {
            inner: Mutex::new(status),
        }
    }

    /// Returns the current status.
    #[must_use]
    pub fn get(&self) -> PluginStatus {
        *self.inner.lock()
    }
}

impl StatusSink for StatusCell {
    fn set_status(&self, status: PluginStatus) {
        *self.inner.lock() = status;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_uninitialized() {
        assert_eq!(StatusCell::default().get(), PluginStatus::Uninitialized);
    }

    #[test]
    fn terminal_states() {
        assert!(PluginStatus::Failed.is_terminal());
        assert!(PluginStatus::Terminated.is_terminal());
        assert!(!PluginStatus::Active.is_terminal());
    }

    #[test]
    fn serializes_snake_case() {
        let json = serde_json::to_string(&PluginStatus::Initializing).unwrap();
        assert_eq!(json, "\"initializing\"");
    }
}
