use core::fmt;
use core::mem;
use std::sync::Arc;

use parking_lot::RwLock;
use trellis_graph::resolve;
use trellis_plugin::{
    EventKind, PluginEvent, ResourceInfo, ResourceStats, Runtime, SharedPlugin,
};

use crate::batch::BatchOrchestrator;
use crate::config::OrchestratorConfig;
use crate::driver::LifecycleDriver;
use crate::error::{LoadError, StopError};
use crate::failures::{UnloadFailureLog, UnloadFailureRecord};
use crate::teardown::teardown;
use crate::unload::{UnloadOrchestrator, UnloadReport};

/// Programmatic entrypoint: loads, stops and unloads plugins against one
/// runtime.
///
/// Loading is all-or-nothing. Unloading is best-effort and never fails.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use trellis_lifecycle::PluginManager;
/// use trellis_plugin::prelude::*;
///
/// struct Database;
///
/// impl Plugin for Database {
///     fn id(&self) -> &str { "database" }
///     fn initialize(&self, _: Arc<dyn Runtime>) -> Result<(), PluginError> { Ok(()) }
///     fn start(&self) -> Result<(), PluginError> { Ok(()) }
///     fn stop(&self) -> Result<(), PluginError> { Ok(()) }
/// }
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let manager = PluginManager::new(Arc::new(LocalRuntime::new()));
/// let plugins: Vec<SharedPlugin> = vec![Arc::new(Database)];
/// manager.load_plugins(plugins).await.unwrap();
/// assert!(manager.is_running("database"));
///
/// let report = manager.unload_plugins().await;
/// assert_eq!(report.unloaded, ["database"]);
/// # }
/// ```
pub struct PluginManager {
    /// Runtime plugins are initialized against and cleaned up through.
    runtime: Arc<dyn Runtime>,

    /// Clamped on construction.
    config: OrchestratorConfig,

    driver: LifecycleDriver,

    /// Plugins available to [`load_plugins_by_name`](Self::load_plugins_by_name).
    registry: RwLock<Vec<SharedPlugin>>,

    /// Running plugins, in start order.
    running: RwLock<Vec<SharedPlugin>>,

    /// Shared with every unload pass.
    failures: Arc<UnloadFailureLog>,
}

impl PluginManager {
    /// Creates a manager with the default configuration.
    #[must_use]
    pub fn new(runtime: Arc<dyn Runtime>) -> Self {
        let config = OrchestratorConfig::default();
        Self {
            driver: LifecycleDriver::new(Arc::clone(&runtime)).with_worker_grace(config.worker_grace),
            runtime,
            config,
            registry: RwLock::new(Vec::new()),
            running: RwLock::new(Vec::new()),
            failures: Arc::new(UnloadFailureLog::default()),
        }
    }

    /// Replaces the configuration. Values are [`clamped`](OrchestratorConfig::clamped).
    #[must_use]
    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config.clamped();
        self.driver = LifecycleDriver::new(Arc::clone(&self.runtime))
            .with_worker_grace(self.config.worker_grace);
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Loading
    // ─────────────────────────────────────────────────────────────────────────

    /// Makes `plugin` available to [`load_plugins_by_name`](Self::load_plugins_by_name).
    /// A registration with the same name is replaced.
    pub fn register(&self, plugin: SharedPlugin) {
        let mut registry = self.registry.write();
        if let Some(slot) = registry.iter_mut().find(|p| p.name() == plugin.name()) {
            tracing::warn!(plugin = plugin.name(), "replacing registered plugin with the same name");
            *slot = plugin;
        } else {
            registry.push(plugin);
        }
    }

    /// Resolves and starts `plugins`.
    ///
    /// Resolution happens before anything runs, so a configuration error has
    /// no side effects. On startup failure every plugin started by this call
    /// is rolled back and none of them is kept as running.
    ///
    /// # Errors
    ///
    /// - [`LoadError::NoPlugins`] for an empty input
    /// - [`LoadError::AlreadyRunning`] if a plugin with the same ID is running
    /// - [`LoadError::Resolve`] for duplicate IDs, missing dependencies or cycles
    /// - [`LoadError::Startup`] when a plugin failed and the batch was rolled back
    pub async fn load_plugins(&self, plugins: Vec<SharedPlugin>) -> Result<(), LoadError> {
        if plugins.is_empty() {
            return Err(LoadError::NoPlugins);
        }
        {
            let running = self.running.read();
            if let Some(plugin) = plugins
                .iter()
                .find(|p| running.iter().any(|r| r.id() == p.id()))
            {
                return Err(LoadError::AlreadyRunning(plugin.name().to_owned()));
            }
        }

        let resolved = resolve(&plugins)?;
        tracing::info!(plugins = resolved.len(), "loading plugins");

        let started = BatchOrchestrator::new(self.driver.clone(), self.config.clone())
            .start_all(&resolved)
            .await?;
        self.running.write().extend(started);
        Ok(())
    }

    /// Loads registered plugins by name.
    ///
    /// # Errors
    ///
    /// [`LoadError::NotFound`] for the first unknown name, otherwise as
    /// [`load_plugins`](Self::load_plugins).
    pub async fn load_plugins_by_name(&self, names: &[&str]) -> Result<(), LoadError> {
        let selected = {
            let registry = self.registry.read();
            names
                .iter()
                .map(|name| {
                    registry
                        .iter()
                        .find(|p| p.name() == *name)
                        .cloned()
                        .ok_or_else(|| LoadError::NotFound((*name).to_owned()))
                })
                .collect::<Result<Vec<_>, _>>()?
        };
        self.load_plugins(selected).await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Unloading
    // ─────────────────────────────────────────────────────────────────────────

    /// Unloads every running plugin, dependents first. Calling it again with
    /// nothing running does nothing.
    pub async fn unload_plugins(&self) -> UnloadReport {
        let plugins = mem::take(&mut *self.running.write());
        if plugins.is_empty() {
            tracing::debug!("no running plugins to unload");
            return UnloadReport::default();
        }

        self.runtime.emit_event(
            PluginEvent::new(EventKind::ManagerShutdown, "")
                .with_meta("plugin_count", plugins.len()),
        );
        self.unloader().unload_all(&plugins).await
    }

    /// Unloads the running plugins with the given names. Unknown names are
    /// logged and skipped.
    pub async fn unload_plugins_by_name(&self, names: &[&str]) -> UnloadReport {
        let selected = {
            let mut running = self.running.write();
            for name in names {
                if !running.iter().any(|p| p.name() == *name) {
                    tracing::info!(plugin = *name, "plugin not running, skipping unload");
                }
            }
            let (selected, kept): (Vec<_>, Vec<_>) = mem::take(&mut *running)
                .into_iter()
                .partition(|p| names.iter().any(|name| *name == p.name()));
            *running = kept;
            selected
        };
        if selected.is_empty() {
            return UnloadReport::default();
        }
        self.unloader().unload_all(&selected).await
    }

    /// Stops one running plugin and releases its resources, outside the
    /// batch machinery.
    ///
    /// The plugin leaves the running set before `stop` is called, so a
    /// concurrent stop or unload never tears it down a second time. On
    /// failure it is put back as running and the failure is recorded in
    /// [`unload_failures`](Self::unload_failures).
    ///
    /// # Errors
    ///
    /// - [`StopError::NotFound`] if no running plugin has this name
    /// - [`StopError::Stop`] if `stop` failed (cleanup was still attempted)
    /// - [`StopError::Cleanup`] if only cleanup failed
    pub async fn stop_plugin(&self, name: &str) -> Result<(), StopError> {
        let (position, plugin) = {
            let mut running = self.running.write();
            let position = running
                .iter()
                .position(|p| p.name() == name)
                .ok_or_else(|| StopError::NotFound(name.to_owned()))?;
            (position, running.remove(position))
        };

        let outcome = teardown(
            &self.driver,
            &plugin,
            "stop",
            self.config.stop_timeout,
            self.config.stop_timeout,
        )
        .await;

        if outcome.is_clean() {
            tracing::info!(plugin = name, took = ?outcome.took, "plugin stopped");
            return Ok(());
        }

        self.failures.record(UnloadFailureRecord::new(
            plugin.as_ref(),
            outcome.stop_error.as_ref().map(ToString::to_string),
            outcome.cleanup_error.as_ref().map(ToString::to_string),
        ));
        {
            let mut running = self.running.write();
            let position = position.min(running.len());
            running.insert(position, plugin);
        }
        match (outcome.stop_error, outcome.cleanup_error) {
            (Some(source), _) => Err(StopError::Stop {
                name: name.to_owned(),
                source,
            }),
            (None, Some(source)) => Err(StopError::Cleanup {
                name: name.to_owned(),
                source,
            }),
            (None, None) => Ok(()),
        }
    }

    fn unloader(&self) -> UnloadOrchestrator {
        UnloadOrchestrator::new(self.driver.clone(), self.config.clone())
            .with_failure_log(Arc::clone(&self.failures))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────────

    /// Recorded unload failures, oldest first.
    #[must_use]
    pub fn unload_failures(&self) -> Vec<UnloadFailureRecord> {
        self.failures.snapshot()
    }

    /// Forgets every recorded unload failure.
    pub fn clear_unload_failures(&self) {
        self.failures.clear();
    }

    /// Names of running plugins, in start order.
    #[must_use]
    pub fn plugin_names(&self) -> Vec<String> {
        self.running
            .read()
            .iter()
            .map(|p| p.name().to_owned())
            .collect()
    }

    /// The running plugin with this name.
    #[must_use]
    pub fn plugin(&self, name: &str) -> Option<SharedPlugin> {
        self.running.read().iter().find(|p| p.name() == name).cloned()
    }

    /// Returns true if a plugin with this name is running.
    #[must_use]
    pub fn is_running(&self, name: &str) -> bool {
        self.running.read().iter().any(|p| p.name() == name)
    }

    /// Every resource registered with the runtime.
    #[must_use]
    pub fn list_resources(&self) -> Vec<ResourceInfo> {
        self.runtime.list_resources()
    }

    /// Resource counts from the runtime.
    #[must_use]
    pub fn resource_stats(&self) -> ResourceStats {
        self.runtime.resource_stats()
    }

    /// The effective (clamped) configuration.
    #[must_use]
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// The runtime plugins are driven against.
    #[must_use]
    pub fn runtime(&self) -> &Arc<dyn Runtime> {
        &self.runtime
    }
}

impl fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginManager")
            .field("config", &self.config)
            .field("running", &self.plugin_names())
            .field("unload_failures", &self.failures.len())
            .finish_non_exhaustive()
    }
}
