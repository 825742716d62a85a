//! The [`Plugin`] trait and its optional capabilities.
//!
//! Every plugin implements the synchronous [`Plugin`] methods. Plugins that can
//! honour a deadline additionally expose [`ContextLifecycle`] through
//! [`Plugin::context_lifecycle`], and plugins that want to observe their own
//! status expose a [`StatusSink`] through [`Plugin::status_sink`]. The
//! orchestrator probes for these capabilities at the call site and falls back
//! to the plain methods when they are absent.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::dependency::Dependency;
use crate::error::PluginError;
use crate::runtime::Runtime;
use crate::status::PluginStatus;

/// A plugin shared between the manager, the orchestrators and worker tasks.
pub type SharedPlugin = Arc<dyn Plugin>;

// ─────────────────────────────────────────────────────────────────────────────
// Plugin Trait
// ─────────────────────────────────────────────────────────────────────────────

/// An independently lifecycle-managed extension module.
///
/// Plugins follow a strict lifecycle driven by the orchestrator:
///
/// 1. **Initialize** - `initialize()` in ascending dependency level, with a
///    runtime scoped to the plugin's ID
/// 2. **Start** - `start()` right after a successful initialize
/// 3. **Stop** - `stop()` in reverse start order, on shutdown or rollback
///
/// Each call runs under a deadline. The plain methods may block; they are
/// executed on a supervised worker thread so a slow plugin cannot stall the
/// orchestrator, but it also cannot be preempted. Plugins that can return early
/// when asked should implement [`ContextLifecycle`].
///
/// The ID must be stable for the lifetime of the object and unique within a
/// load batch.
pub trait Plugin: Send + Sync + 'static {
    /// Stable unique key, used for graph nodes and resource namespacing.
    fn id(&self) -> &str;

    /// Human-readable name. Defaults to [`id`](Plugin::id).
    fn name(&self) -> &str {
        self.id()
    }

    /// Declared dependencies on other plugins.
    fn dependencies(&self) -> Vec<Dependency> {
        Vec::new()
    }

    /// Acquires resources. `runtime` is already scoped to this plugin.
    fn initialize(&self, runtime: Arc<dyn Runtime>) -> Result<(), PluginError>;

    /// Begins serving.
    fn start(&self) -> Result<(), PluginError>;

    /// Stops serving. Resource release happens afterwards through the runtime.
    fn stop(&self) -> Result<(), PluginError>;

    /// Returns the cancellation-aware lifecycle, if this plugin has one.
    fn context_lifecycle(&self) -> Option<&dyn ContextLifecycle> {
        None
    }

    /// Returns the status setter, if this plugin wants status updates.
    fn status_sink(&self) -> Option<&dyn StatusSink> {
        None
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Capabilities
// ─────────────────────────────────────────────────────────────────────────────

/// Lifecycle methods that receive a cancellation token.
///
/// The token is cancelled when the phase deadline expires. A plugin that
/// returns promptly once the token fires should report
/// [`is_context_aware`](ContextLifecycle::is_context_aware) as `true`; the
/// orchestrator then awaits these methods directly. Otherwise they are run on
/// a spawned task that the orchestrator supervises but does not trust to stop.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use async_trait::async_trait;
/// use trellis_plugin::prelude::*;
///
/// struct Listener;
///
/// #[async_trait]
/// impl ContextLifecycle for Listener {
///     async fn initialize_with_token(
///         &self,
///         _token: CancellationToken,
///         _runtime: Arc<dyn Runtime>,
///     ) -> Result<(), PluginError> {
///         Ok(())
///     }
///
///     async fn start_with_token(&self, token: CancellationToken) -> Result<(), PluginError> {
///         tokio::select! {
///             () = token.cancelled() => Err(PluginError::Cancelled),
///             () = async {} => Ok(()),
///         }
///     }
///
///     async fn stop_with_token(&self, _token: CancellationToken) -> Result<(), PluginError> {
///         Ok(())
///     }
///
///     fn is_context_aware(&self) -> bool {
///         true
///     }
/// }
/// ```
#[async_trait]
pub trait ContextLifecycle: Send + Sync {
    /// Token-aware counterpart of [`Plugin::initialize`].
    async fn initialize_with_token(
        &self,
        token: CancellationToken,
        runtime: Arc<dyn Runtime>,
    ) -> Result<(), PluginError>;

    /// Token-aware counterpart of [`Plugin::start`].
    async fn start_with_token(&self, token: CancellationToken) -> Result<(), PluginError>;

    /// Token-aware counterpart of [`Plugin::stop`].
    async fn stop_with_token(&self, token: CancellationToken) -> Result<(), PluginError>;

    /// Whether the methods above genuinely honour cancellation.
    fn is_context_aware(&self) -> bool {
        false
    }
}

/// Receives advisory status updates from the orchestrator.
pub trait StatusSink: Send + Sync {
    /// Records the new status.
    fn set_status(&self, status: PluginStatus);
}
