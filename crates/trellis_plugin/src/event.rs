use core::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::status::PluginStatus;

// ─────────────────────────────────────────────────────────────────────────────
// EventKind
// ─────────────────────────────────────────────────────────────────────────────

/// Kind of lifecycle notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// `initialize` is about to run.
    #[serde(rename = "plugin.initializing")]
    Initializing,
    /// `initialize` returned successfully.
    #[serde(rename = "plugin.initialized")]
    Initialized,
    /// `start` is about to run.
    #[serde(rename = "plugin.starting")]
    Starting,
    /// `start` returned successfully.
    #[serde(rename = "plugin.started")]
    Started,
    /// `stop` is about to run.
    #[serde(rename = "plugin.stopping")]
    Stopping,
    /// `stop` finished.
    #[serde(rename = "plugin.stopped")]
    Stopped,
    /// A lifecycle phase failed.
    #[serde(rename = "plugin.error")]
    ErrorOccurred,
    /// A startup rollback finished.
    #[serde(rename = "rollback.completed")]
    RollbackCompleted,
    /// The manager began unloading every running plugin.
    #[serde(rename = "system.plugin_manager_shutdown")]
    ManagerShutdown,
}

impl EventKind {
    /// Returns the wire name of this kind.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Initializing => "plugin.initializing",
            EventKind::Initialized => "plugin.initialized",
            EventKind::Starting => "plugin.starting",
            EventKind::Started => "plugin.started",
            EventKind::Stopping => "plugin.stopping",
            EventKind::Stopped => "plugin.stopped",
            EventKind::ErrorOccurred => "plugin.error",
            EventKind::RollbackCompleted => "rollback.completed",
            EventKind::ManagerShutdown => "system.plugin_manager_shutdown",
        }
    }

    /// The status a plugin is in once this event has been emitted.
    #[must_use]
    pub fn implied_status(&self) -> PluginStatus {
        match self {
            EventKind::Initializing => PluginStatus::Initializing,
            EventKind::Initialized | EventKind::Starting => PluginStatus::Inactive,
            EventKind::Started => PluginStatus::Active,
            EventKind::Stopping => PluginStatus::Stopping,
            EventKind::Stopped | EventKind::RollbackCompleted | EventKind::ManagerShutdown => {
                PluginStatus::Terminated
            }
            EventKind::ErrorOccurred => PluginStatus::Failed,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// EventPriority
// ─────────────────────────────────────────────────────────────────────────────

/// Delivery hint for event bus consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventPriority {
    /// Informational.
    Low,
    /// Regular lifecycle transitions.
    #[default]
    Normal,
    /// Failures and shutdown.
    High,
}

// ─────────────────────────────────────────────────────────────────────────────
// PluginEvent
// ─────────────────────────────────────────────────────────────────────────────

/// A structured lifecycle notification.
///
/// Events are fire-and-forget: the orchestrator never waits on delivery.
///
/// # Example
///
/// ```
/// use trellis_plugin::{EventKind, PluginEvent};
///
/// let event = PluginEvent::new(EventKind::Started, "database")
///     .with_meta("plugin_name", "Database")
///     .with_meta("took_ms", 12);
///
/// assert_eq!(event.kind.as_str(), "plugin.started");
/// assert_eq!(event.metadata["took_ms"], 12);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginEvent {
    /// What happened.
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// Plugin the event is about. Empty for manager-wide events.
    pub plugin_id: String,
    /// Status implied by the event.
    pub status: PluginStatus,
    /// When the event was created.
    pub timestamp: DateTime<Utc>,
    /// Delivery hint.
    pub priority: EventPriority,
    /// Free-form structured details.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
    /// Rendered error, for failure events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PluginEvent {
    /// Creates an event of `kind` for `plugin_id`, stamped now.
    #[must_use]
    pub fn new(kind: EventKind, plugin_id: impl Into<String>) -> Self {
        let priority = match kind {
            EventKind::ErrorOccurred | EventKind::ManagerShutdown => EventPriority::High,
            _ => EventPriority::Normal,
        };
        Self {
            kind,
            plugin_id: plugin_id.into(),
            status: kind.implied_status(),
            timestamp: Utc::now(),
            priority,
            metadata: Map::new(),
            error: None,
        }
    }

    /// Adds a metadata entry.
    #[must_use]
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Overrides the implied status.
    #[must_use]
    pub fn with_status(mut self, status: PluginStatus) -> Self {
        self.status = status;
        self
    }

    /// Overrides the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: EventPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Attaches a rendered error.
    #[must_use]
    pub fn with_error(mut self, error: impl fmt::Display) -> Self {
        self.error = Some(error.to_string());
        self
    }
}
