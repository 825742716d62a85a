use core::fmt;
use std::time::Duration;

use trellis_graph::ResolveError;
use trellis_plugin::{PluginError, RuntimeError};

use crate::driver::Phase;
use crate::rollback::RollbackReport;

// ─────────────────────────────────────────────────────────────────────────────
// LifecycleError
// ─────────────────────────────────────────────────────────────────────────────

/// Failure of one plugin in one lifecycle phase.
///
/// [`Phase`](LifecycleError::Phase) means the plugin answered with an error;
/// [`Timeout`](LifecycleError::Timeout) means it never answered in time.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    /// The plugin's own method returned an error.
    #[error("plugin {plugin} ({id}) failed to {phase}: {source}")]
    Phase {
        /// Plugin name.
        plugin: String,
        /// Plugin ID.
        id: String,
        /// Phase that failed.
        phase: Phase,
        /// The plugin's error.
        #[source]
        source: PluginError,
    },

    /// The phase did not finish before its deadline.
    #[error("plugin {plugin} ({id}) {phase} timed out after {timeout:?}")]
    Timeout {
        /// Plugin name.
        plugin: String,
        /// Plugin ID.
        id: String,
        /// Phase that timed out.
        phase: Phase,
        /// The deadline that expired.
        timeout: Duration,
    },

    /// The phase panicked. `stack` holds the captured backtrace.
    #[error("plugin {plugin} ({id}) panicked during {phase}: {message}")]
    Panic {
        /// Plugin name.
        plugin: String,
        /// Plugin ID.
        id: String,
        /// Phase that panicked.
        phase: Phase,
        /// Panic payload rendered as text.
        message: String,
        /// Backtrace captured where the panic was caught.
        stack: String,
    },

    /// The supervised worker thread could not be created.
    #[error("failed to spawn {phase} worker for plugin {plugin} ({id}): {source}")]
    Spawn {
        /// Plugin name.
        plugin: String,
        /// Plugin ID.
        id: String,
        /// Phase that was being driven.
        phase: Phase,
        /// Spawn failure.
        #[source]
        source: std::io::Error,
    },

    /// The supervised worker went away without reporting a result.
    #[error("{phase} worker for plugin {plugin} ({id}) exited without a result")]
    WorkerLost {
        /// Plugin name.
        plugin: String,
        /// Plugin ID.
        id: String,
        /// Phase that was being driven.
        phase: Phase,
    },
}

impl LifecycleError {
    /// ID of the plugin that failed.
    #[must_use]
    pub fn plugin_id(&self) -> &str {
        match self {
            LifecycleError::Phase { id, .. }
            | LifecycleError::Timeout { id, .. }
            | LifecycleError::Panic { id, .. }
            | LifecycleError::Spawn { id, .. }
            | LifecycleError::WorkerLost { id, .. } => id,
        }
    }

    /// Phase that failed.
    #[must_use]
    pub fn phase(&self) -> Phase {
        match self {
            LifecycleError::Phase { phase, .. }
            | LifecycleError::Timeout { phase, .. }
            | LifecycleError::Panic { phase, .. }
            | LifecycleError::Spawn { phase, .. }
            | LifecycleError::WorkerLost { phase, .. } => *phase,
        }
    }

    /// Returns true if the plugin never answered in time.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, LifecycleError::Timeout { .. })
    }

    /// Returns true if the plugin panicked.
    #[must_use]
    pub fn is_panic(&self) -> bool {
        matches!(self, LifecycleError::Panic { .. })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// CleanupError
// ─────────────────────────────────────────────────────────────────────────────

/// Failure releasing a plugin's resources through the runtime.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CleanupError {
    /// The runtime reported an error.
    #[error("resource cleanup failed: {0}")]
    Failed(#[from] RuntimeError),

    /// The runtime did not finish in time.
    #[error("resource cleanup timed out after {0:?}")]
    TimedOut(Duration),

    /// The runtime panicked.
    #[error("resource cleanup panicked: {0}")]
    Panicked(String),
}

// ─────────────────────────────────────────────────────────────────────────────
// StartupError
// ─────────────────────────────────────────────────────────────────────────────

/// A batched startup failed and was rolled back.
///
/// The two variants let callers tell a clean rollback from one that may have
/// leaked resources.
#[derive(Debug)]
pub enum StartupError {
    /// Startup failed and every rollback step succeeded. Displays the first
    /// startup error verbatim.
    Failed {
        /// Every plugin failure in the failing level.
        errors: Vec<LifecycleError>,
        /// What the rollback did.
        rollback: RollbackReport,
    },
    /// Startup failed and rollback had failures of its own.
    RollbackIncomplete {
        /// Every plugin failure in the failing level.
        errors: Vec<LifecycleError>,
        /// What the rollback did.
        rollback: RollbackReport,
    },
}

impl StartupError {
    pub(crate) fn new(errors: Vec<LifecycleError>, rollback: RollbackReport) -> Self {
        if rollback.failed() == 0 {
            StartupError::Failed { errors, rollback }
        } else {
            StartupError::RollbackIncomplete { errors, rollback }
        }
    }

    /// Every plugin failure in the failing level.
    #[must_use]
    pub fn errors(&self) -> &[LifecycleError] {
        match self {
            StartupError::Failed { errors, .. } | StartupError::RollbackIncomplete { errors, .. } => {
                errors
            }
        }
    }

    /// The first plugin failure.
    #[must_use]
    pub fn first_error(&self) -> Option<&LifecycleError> {
        self.errors().first()
    }

    /// The rollback report.
    #[must_use]
    pub fn rollback(&self) -> &RollbackReport {
        match self {
            StartupError::Failed { rollback, .. }
            | StartupError::RollbackIncomplete { rollback, .. } => rollback,
        }
    }

    /// Returns true if every rollback step succeeded.
    #[must_use]
    pub fn is_rollback_clean(&self) -> bool {
        matches!(self, StartupError::Failed { .. })
    }
}

impl fmt::Display for StartupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartupError::Failed { errors, .. } => match errors.first() {
                Some(first) => write!(f, "{first}"),
                None => write!(f, "plugin startup failed"),
            },
            StartupError::RollbackIncomplete { errors, rollback } => {
                write!(
                    f,
                    "plugin startup failed with {} errors, rollback had {} failures",
                    errors.len(),
                    rollback.failed()
                )?;
                if let Some(first) = errors.first() {
                    write!(f, ": {first}")?;
                }
                Ok(())
            }
        }
    }
}

impl core::error::Error for StartupError {
    fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
        match self {
            StartupError::Failed { errors, .. } => {
                errors.first().and_then(core::error::Error::source)
            }
            StartupError::RollbackIncomplete { errors, .. } => errors
                .first()
                .map(|first| first as &(dyn core::error::Error + 'static)),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Manager errors
// ─────────────────────────────────────────────────────────────────────────────

/// Errors from [`PluginManager::load_plugins`](crate::PluginManager::load_plugins)
/// and [`PluginManager::load_plugins_by_name`](crate::PluginManager::load_plugins_by_name).
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    /// Nothing to load.
    #[error("no plugins to load")]
    NoPlugins,

    /// A requested name is not registered.
    #[error("plugin {0} not found")]
    NotFound(String),

    /// A plugin with this name is already running.
    #[error("plugin {0} is already running")]
    AlreadyRunning(String),

    /// Dependency resolution failed; nothing was executed.
    #[error("failed to resolve plugin dependencies: {0}")]
    Resolve(#[from] ResolveError),

    /// Startup failed and was rolled back.
    #[error(transparent)]
    Startup(#[from] StartupError),
}

/// Errors from [`PluginManager::stop_plugin`](crate::PluginManager::stop_plugin).
#[derive(Debug, thiserror::Error)]
pub enum StopError {
    /// No running plugin has this name.
    #[error("plugin {0} not found")]
    NotFound(String),

    /// `stop` failed. Cleanup was still attempted.
    #[error("failed to stop plugin {name}: {source}")]
    Stop {
        /// Plugin name.
        name: String,
        /// The stop failure.
        #[source]
        source: LifecycleError,
    },

    /// `stop` succeeded but releasing resources failed.
    #[error("failed to cleanup resources for plugin {name}: {source}")]
    Cleanup {
        /// Plugin name.
        name: String,
        /// The cleanup failure.
        #[source]
        source: CleanupError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rollback::RollbackOutcome;

    fn phase_error(id: &str) -> LifecycleError {
        LifecycleError::Phase {
            plugin: id.to_uppercase(),
            id: id.into(),
            phase: Phase::Start,
            source: PluginError::msg("port in use"),
        }
    }

    fn report(failed: bool) -> RollbackReport {
        RollbackReport {
            outcomes: vec![RollbackOutcome {
                plugin_id: "a".into(),
                plugin_name: "A".into(),
                stop_error: failed.then(|| "stuck".to_owned()),
                cleanup_error: None,
            }],
            duration: Duration::from_millis(3),
            initial_errors: 1,
        }
    }

    #[test]
    fn clean_rollback_returns_first_error_verbatim() {
        let err = StartupError::new(vec![phase_error("b")], report(false));
        assert!(err.is_rollback_clean());
        assert_eq!(err.to_string(), "plugin B (b) failed to start: port in use");
        assert_eq!(err.to_string(), err.first_error().unwrap().to_string());
    }

    #[test]
    fn dirty_rollback_names_both_counts() {
        let err = StartupError::new(vec![phase_error("b"), phase_error("c")], report(true));
        assert!(!err.is_rollback_clean());
        assert_eq!(
            err.to_string(),
            "plugin startup failed with 2 errors, rollback had 1 failures: \
             plugin B (b) failed to start: port in use"
        );
    }

    #[test]
    fn timeout_is_distinguishable_from_refusal() {
        let timeout = LifecycleError::Timeout {
            plugin: "A".into(),
            id: "a".into(),
            phase: Phase::Initialize,
            timeout: Duration::from_secs(1),
        };
        assert!(timeout.is_timeout());
        assert!(!phase_error("a").is_timeout());
        assert_eq!(timeout.plugin_id(), "a");
        assert_eq!(timeout.phase(), Phase::Initialize);
        assert_eq!(timeout.to_string(), "plugin A (a) initialize timed out after 1s");
    }
}
