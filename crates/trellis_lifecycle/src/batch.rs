//! Level-by-level startup with bounded parallelism and rollback.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use hashbrown::HashMap;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use trellis_graph::{PluginWithLevel, group_by_level};
use trellis_plugin::{EventKind, PluginStatus, SharedPlugin};

use crate::config::OrchestratorConfig;
use crate::driver::{LifecycleDriver, Phase};
use crate::error::{LifecycleError, StartupError};
use crate::events::{completed_event, error_event, phase_event, set_status};
use crate::rollback::rollback;
use crate::teardown::cleanup_with_timeout;

/// Starts leveled plugins: every plugin of level *n* is initialized and
/// started before any plugin of level *n + 1*.
///
/// Within a level at most
/// [`start_parallelism`](OrchestratorConfig::start_parallelism) plugins run at
/// once. After the first failure no further plugin of that level is launched;
/// in-flight ones are awaited. Every plugin started so far, across all
/// levels, is then rolled back in reverse start order.
#[derive(Debug, Clone)]
pub struct BatchOrchestrator {
    driver: LifecycleDriver,
    config: OrchestratorConfig,
}

/// Shared by the tasks of one level.
struct Level {
    driver: LifecycleDriver,
    config: OrchestratorConfig,
    started: Mutex<Vec<SharedPlugin>>,
    failed: AtomicBool,
}

impl BatchOrchestrator {
    /// Creates an orchestrator using `config` as given.
    #[must_use]
    pub fn new(driver: LifecycleDriver, config: OrchestratorConfig) -> Self {
        Self { driver, config }
    }

    /// Initializes and starts every plugin, level by level.
    ///
    /// Returns the plugins in start order. An empty input succeeds without
    /// doing anything.
    ///
    /// # Errors
    ///
    /// Returns [`StartupError`] carrying every failure of the failing level and
    /// the rollback report. No plugin is left running.
    pub async fn start_all(
        &self,
        plugins: &[PluginWithLevel],
    ) -> Result<Vec<SharedPlugin>, StartupError> {
        let began = Instant::now();
        let levels = group_by_level(plugins);
        let mut started = Vec::with_capacity(plugins.len());

        for (level, members) in levels {
            tracing::debug!(dependency_level = level, plugins = members.len(), "starting level");
            let (launched, errors) = self.start_level(members).await;
            started.extend(launched);

            if !errors.is_empty() {
                let failed: Vec<&str> = errors.iter().map(LifecycleError::plugin_id).collect();
                tracing::error!(
                    dependency_level = level,
                    failed = ?failed,
                    rolling_back = started.len(),
                    "plugin startup failed, rolling back"
                );
                let report = rollback(
                    &self.driver,
                    &started,
                    self.config.stop_timeout,
                    errors.len(),
                )
                .await;
                return Err(StartupError::new(errors, report));
            }
        }

        tracing::info!(plugins = started.len(), took = ?began.elapsed(), "all plugins started");
        Ok(started)
    }

    async fn start_level(
        &self,
        members: Vec<SharedPlugin>,
    ) -> (Vec<SharedPlugin>, Vec<LifecycleError>) {
        let shared = Arc::new(Level {
            driver: self.driver.clone(),
            config: self.config.clone(),
            started: Mutex::new(Vec::with_capacity(members.len())),
            failed: AtomicBool::new(false),
        });
        let permits = self.config.start_parallelism.clamp(1, Semaphore::MAX_PERMITS);
        let semaphore = Arc::new(Semaphore::new(permits));
        let mut tasks = JoinSet::new();
        let mut names = HashMap::new();

        for plugin in members {
            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                break;
            };
            if shared.failed.load(Ordering::SeqCst) {
                tracing::debug!(plugin = plugin.name(), "skipping plugin after failure in level");
                break;
            }
            let identity = (plugin.name().to_owned(), plugin.id().to_owned());
            let level = Arc::clone(&shared);
            let handle = tasks.spawn(async move {
                let result = level.launch(&plugin).await;
                drop(permit);
                result
            });
            names.insert(handle.id(), identity);
        }

        let mut errors = Vec::new();
        while let Some(joined) = tasks.join_next_with_id().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((_, Err(err))) => errors.push(err),
                Err(join) => {
                    let (plugin, id) = names.remove(&join.id()).unwrap_or_default();
                    tracing::error!(%plugin, %id, error = %join, "startup task lost");
                    errors.push(LifecycleError::WorkerLost {
                        plugin,
                        id,
                        phase: Phase::Start,
                    });
                }
            }
        }

        let started = core::mem::take(&mut *shared.started.lock());
        (started, errors)
    }
}

impl Level {
    async fn launch(&self, plugin: &SharedPlugin) -> Result<(), LifecycleError> {
        let runtime = self.driver.runtime();
        let began = Instant::now();

        set_status(plugin.as_ref(), PluginStatus::Initializing);
        runtime.emit_event(phase_event(
            EventKind::Initializing,
            plugin.as_ref(),
            Phase::Initialize,
            self.config.init_timeout,
        ));
        if let Err(err) = self
            .driver
            .drive(plugin, Phase::Initialize, self.config.init_timeout)
            .await
        {
            return Err(self.fail(plugin, err, began).await);
        }
        set_status(plugin.as_ref(), PluginStatus::Inactive);
        runtime.emit_event(completed_event(
            EventKind::Initialized,
            plugin.as_ref(),
            Phase::Initialize,
            began.elapsed(),
        ));

        let start_began = Instant::now();
        runtime.emit_event(phase_event(
            EventKind::Starting,
            plugin.as_ref(),
            Phase::Start,
            self.config.start_timeout,
        ));
        if let Err(err) = self
            .driver
            .drive(plugin, Phase::Start, self.config.start_timeout)
            .await
        {
            return Err(self.fail(plugin, err, start_began).await);
        }
        set_status(plugin.as_ref(), PluginStatus::Active);
        runtime.emit_event(completed_event(
            EventKind::Started,
            plugin.as_ref(),
            Phase::Start,
            start_began.elapsed(),
        ));

        tracing::info!(plugin = plugin.name(), id = plugin.id(), took = ?began.elapsed(), "plugin started");
        self.started.lock().push(Arc::clone(plugin));
        Ok(())
    }

    /// Marks the level failed and releases whatever the plugin registered
    /// before it failed. The plugin is not stopped: it never reached running.
    async fn fail(&self, plugin: &SharedPlugin, err: LifecycleError, began: Instant) -> LifecycleError {
        let operation = err.phase().as_str();
        self.failed.store(true, Ordering::SeqCst);
        set_status(plugin.as_ref(), PluginStatus::Failed);
        tracing::error!(plugin = plugin.name(), id = plugin.id(), error = %err, "failed to {operation} plugin");
        self.driver.runtime().emit_event(error_event(
            plugin.as_ref(),
            operation,
            &err,
            began.elapsed(),
            err.is_timeout(),
        ));

        if let Err(cleanup) =
            cleanup_with_timeout(self.driver.runtime(), plugin.id(), self.config.stop_timeout).await
        {
            tracing::warn!(
                plugin = plugin.name(),
                id = plugin.id(),
                error = %cleanup,
                "failed to clean up resources of failed plugin"
            );
        }
        err
    }
}
