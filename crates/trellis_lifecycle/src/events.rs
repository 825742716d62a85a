//! Status and event helpers shared by the orchestrators.

use core::fmt;
use std::time::Duration;

use chrono::Utc;
use trellis_plugin::{EventKind, Plugin, PluginEvent, PluginStatus};

use crate::driver::Phase;

/// Reports `status` if the plugin has a status sink.
pub(crate) fn set_status(plugin: &dyn Plugin, status: PluginStatus) {
    if let Some(sink) = plugin.status_sink() {
        sink.set_status(status);
    }
}

pub(crate) fn is_context_aware(plugin: &dyn Plugin) -> bool {
    plugin
        .context_lifecycle()
        .is_some_and(|lifecycle| lifecycle.is_context_aware())
}

pub(crate) fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// A plugin event tagged with the plugin's name.
pub(crate) fn plugin_event(kind: EventKind, plugin: &dyn Plugin) -> PluginEvent {
    PluginEvent::new(kind, plugin.id()).with_meta("plugin_name", plugin.name())
}

/// Event announcing that `phase` is about to run under `timeout`.
pub(crate) fn phase_event(
    kind: EventKind,
    plugin: &dyn Plugin,
    phase: Phase,
    timeout: Duration,
) -> PluginEvent {
    let deadline = Utc::now()
        .timestamp()
        .saturating_add(i64::try_from(timeout.as_secs()).unwrap_or(i64::MAX));
    plugin_event(kind, plugin)
        .with_meta("step", phase.as_str())
        .with_meta("timeout_ms", millis(timeout))
        .with_meta("ctx_aware", is_context_aware(plugin))
        .with_meta("deadline_unix", deadline)
}

/// Event announcing that `phase` completed after `took`.
pub(crate) fn completed_event(
    kind: EventKind,
    plugin: &dyn Plugin,
    phase: Phase,
    took: Duration,
) -> PluginEvent {
    plugin_event(kind, plugin)
        .with_meta("step", phase.as_str())
        .with_meta("took_ms", millis(took))
}

/// Failure event for `operation` (`initialize`, `start`, `stop`, `unload` or
/// `cleanup`).
pub(crate) fn error_event(
    plugin: &dyn Plugin,
    operation: &str,
    error: &dyn fmt::Display,
    took: Duration,
    timed_out: bool,
) -> PluginEvent {
    plugin_event(EventKind::ErrorOccurred, plugin)
        .with_meta("operation", operation)
        .with_meta("took_ms", millis(took))
        .with_meta("timeout", timed_out)
        .with_meta("ctx_aware", is_context_aware(plugin))
        .with_error(error)
}
