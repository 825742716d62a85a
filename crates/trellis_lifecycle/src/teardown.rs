//! Stop-then-cleanup for a single plugin, shared by rollback, unload and
//! targeted stops.

use std::sync::Arc;
use std::time::{Duration, Instant};

use trellis_plugin::{EventKind, PluginStatus, Runtime, SharedPlugin};

use crate::driver::{LifecycleDriver, Phase, panic_message};
use crate::error::{CleanupError, LifecycleError};
use crate::events::{completed_event, error_event, phase_event, set_status};

/// Releases `plugin_id`'s resources on the blocking pool, waiting at most
/// `timeout`.
pub(crate) async fn cleanup_with_timeout(
    runtime: &Arc<dyn Runtime>,
    plugin_id: &str,
    timeout: Duration,
) -> Result<(), CleanupError> {
    let runtime = Arc::clone(runtime);
    let id = plugin_id.to_owned();
    let task = tokio::task::spawn_blocking(move || runtime.cleanup_resources(&id));

    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(result)) => result.map_err(CleanupError::from),
        Ok(Err(join)) if join.is_panic() => {
            Err(CleanupError::Panicked(panic_message(join.into_panic().as_ref())))
        }
        Ok(Err(_)) => Err(CleanupError::Panicked("cleanup task cancelled".to_owned())),
        Err(_) => Err(CleanupError::TimedOut(timeout)),
    }
}

/// What happened while tearing a plugin down.
pub(crate) struct Teardown {
    pub(crate) stop_error: Option<LifecycleError>,
    pub(crate) cleanup_error: Option<CleanupError>,
    pub(crate) took: Duration,
}

impl Teardown {
    pub(crate) fn is_clean(&self) -> bool {
        self.stop_error.is_none() && self.cleanup_error.is_none()
    }
}

/// Stops `plugin`, then releases its resources.
///
/// Cleanup is attempted even when stop fails or times out: resources may be
/// partially held either way. `operation` labels failure events.
pub(crate) async fn teardown(
    driver: &LifecycleDriver,
    plugin: &SharedPlugin,
    operation: &'static str,
    stop_timeout: Duration,
    cleanup_timeout: Duration,
) -> Teardown {
    let runtime = driver.runtime();
    set_status(plugin.as_ref(), PluginStatus::Stopping);
    runtime.emit_event(phase_event(
        EventKind::Stopping,
        plugin.as_ref(),
        Phase::Stop,
        stop_timeout,
    ));

    let began = Instant::now();
    let stop_error = match driver.drive(plugin, Phase::Stop, stop_timeout).await {
        Ok(()) => None,
        Err(err) => {
            tracing::error!(
                plugin = plugin.name(),
                id = plugin.id(),
                operation,
                error = %err,
                "failed to stop plugin"
            );
            runtime.emit_event(error_event(
                plugin.as_ref(),
                operation,
                &err,
                began.elapsed(),
                err.is_timeout(),
            ));
            Some(err)
        }
    };

    let cleanup_began = Instant::now();
    let cleanup_error = match cleanup_with_timeout(runtime, plugin.id(), cleanup_timeout).await {
        Ok(()) => None,
        Err(err) => {
            tracing::error!(
                plugin = plugin.name(),
                id = plugin.id(),
                operation,
                error = %err,
                "failed to clean up plugin resources"
            );
            runtime.emit_event(error_event(
                plugin.as_ref(),
                "cleanup",
                &err,
                cleanup_began.elapsed(),
                matches!(err, CleanupError::TimedOut(_)),
            ));
            Some(err)
        }
    };

    let outcome = Teardown {
        stop_error,
        cleanup_error,
        took: began.elapsed(),
    };

    if outcome.is_clean() {
        set_status(plugin.as_ref(), PluginStatus::Terminated);
        runtime.emit_event(completed_event(
            EventKind::Stopped,
            plugin.as_ref(),
            Phase::Stop,
            outcome.took,
        ));
    } else {
        set_status(plugin.as_ref(), PluginStatus::Failed);
    }
    outcome
}
