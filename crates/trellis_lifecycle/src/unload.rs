//! Best-effort shutdown under a total deadline.
//!
//! Unload never fails. Every stop, cleanup or timeout problem becomes an
//! [`UnloadFailureRecord`] and the pass keeps going. When the total deadline
//! expires, whatever has not been claimed by a worker yet is force-cleaned
//! without a graceful stop.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use hashbrown::HashSet;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use trellis_graph::{group_by_level, resolve, unload_order};
use trellis_plugin::{PluginStatus, SharedPlugin};

use crate::config::OrchestratorConfig;
use crate::driver::LifecycleDriver;
use crate::events::set_status;
use crate::failures::{UnloadFailureLog, UnloadFailureRecord};
use crate::teardown::{cleanup_with_timeout, teardown};

const FORCED_STOP_ERROR: &str = "not stopped: unload total timeout exceeded";

/// Outcome of one unload pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnloadReport {
    /// Plugin IDs in the order they were scheduled.
    pub order: Vec<String>,
    /// Plugins stopped and cleaned up without error.
    pub unloaded: Vec<String>,
    /// Plugins force-cleaned by the timeout sweep.
    pub forced: Vec<String>,
    /// Failures recorded during this pass.
    pub failures: Vec<UnloadFailureRecord>,
    /// Whether the total deadline expired.
    pub timed_out: bool,
    /// Wall-clock time spent.
    pub duration: Duration,
}

/// Stops and cleans up plugins, dependents first.
///
/// With a successful [`resolve`] the plugins are unloaded one level at a time,
/// highest level first, with at most
/// [`unload_parallelism`](OrchestratorConfig::unload_parallelism) in flight.
/// When resolution fails, [`unload_order`] is used and plugins are unloaded
/// one by one.
///
/// A pass returns within
/// [`unload_total_timeout`](OrchestratorConfig::unload_total_timeout) plus
/// [`worker_grace`](OrchestratorConfig::worker_grace): forced cleanups run
/// concurrently after the deadline, each bounded by the grace period.
#[derive(Debug, Clone)]
pub struct UnloadOrchestrator {
    driver: LifecycleDriver,
    config: OrchestratorConfig,
    failures: Arc<UnloadFailureLog>,
}

impl UnloadOrchestrator {
    /// Creates an orchestrator with its own failure log.
    #[must_use]
    pub fn new(driver: LifecycleDriver, config: OrchestratorConfig) -> Self {
        Self {
            driver,
            config,
            failures: Arc::new(UnloadFailureLog::default()),
        }
    }

    /// Records failures into `log` instead of a private one.
    #[must_use]
    pub fn with_failure_log(mut self, log: Arc<UnloadFailureLog>) -> Self {
        self.failures = log;
        self
    }

    /// The log failures are recorded into.
    #[must_use]
    pub fn failure_log(&self) -> &Arc<UnloadFailureLog> {
        &self.failures
    }

    /// Unloads `plugins`. Returns once every plugin has been unloaded or the
    /// total deadline has expired and the sweep has finished.
    ///
    /// Workers still in flight at the deadline keep running in the
    /// background and record their own outcome into the failure log.
    pub async fn unload_all(&self, plugins: &[SharedPlugin]) -> UnloadReport {
        let began = Instant::now();
        let waves = plan(plugins);
        let order: Vec<String> = waves
            .iter()
            .flatten()
            .map(|plugin| plugin.id().to_owned())
            .collect();
        let total = self.config.unload_total_timeout;
        let run = Arc::new(Run {
            driver: self.driver.clone(),
            config: self.config.clone(),
            deadline: tokio::time::Instant::now() + total,
            claims: Mutex::new(HashSet::with_capacity(plugins.len())),
            unloaded: Mutex::new(Vec::new()),
            failures: Mutex::new(Vec::new()),
            log: Arc::clone(&self.failures),
        });

        tracing::info!(plugins = plugins.len(), timeout = ?total, "unloading plugins");

        let work = {
            let run = Arc::clone(&run);
            async move {
                for wave in waves {
                    run.unload_wave(wave).await;
                }
            }
        };
        let timed_out = tokio::time::timeout_at(run.deadline, work).await.is_err();

        let forced = if timed_out {
            tracing::error!(timeout = ?total, "plugin unload exceeded total timeout, forcing cleanup");
            run.sweep(plugins).await
        } else {
            Vec::new()
        };

        let report = UnloadReport {
            order,
            unloaded: run.unloaded.lock().clone(),
            forced,
            failures: run.failures.lock().clone(),
            timed_out,
            duration: began.elapsed(),
        };

        if report.failures.is_empty() {
            tracing::info!(unloaded = report.unloaded.len(), duration = ?report.duration, "plugins unloaded");
        } else {
            tracing::warn!(
                unloaded = report.unloaded.len(),
                failed = report.failures.len(),
                forced = report.forced.len(),
                duration = ?report.duration,
                "plugins unloaded with failures"
            );
        }
        report
    }
}

/// Groups plugins into waves that run one after another.
fn plan(plugins: &[SharedPlugin]) -> Vec<Vec<SharedPlugin>> {
    match resolve(plugins) {
        Ok(resolved) => group_by_level(&resolved).into_values().rev().collect(),
        Err(err) => {
            tracing::warn!(error = %err, "failed to resolve unload order, using reverse load order");
            let mut order = unload_order(plugins);
            if order.len() != plugins.len() {
                order = plugins.to_vec();
            }
            order.into_iter().map(|plugin| vec![plugin]).collect()
        }
    }
}

/// State of a single unload pass.
struct Run {
    driver: LifecycleDriver,
    config: OrchestratorConfig,
    deadline: tokio::time::Instant,
    /// IDs of plugins a worker or the sweep has taken. Never released.
    claims: Mutex<HashSet<String>>,
    unloaded: Mutex<Vec<String>>,
    failures: Mutex<Vec<UnloadFailureRecord>>,
    log: Arc<UnloadFailureLog>,
}

impl Run {
    fn claim(&self, id: &str) -> bool {
        self.claims.lock().insert(id.to_owned())
    }

    fn record(&self, record: UnloadFailureRecord) {
        self.log.record(record.clone());
        self.failures.lock().push(record);
    }

    async fn unload_wave(self: &Arc<Self>, wave: Vec<SharedPlugin>) {
        let permits = self.config.unload_parallelism.clamp(1, Semaphore::MAX_PERMITS);
        let semaphore = Arc::new(Semaphore::new(permits));
        let mut workers = Vec::with_capacity(wave.len());

        for plugin in wave {
            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                break;
            };
            let run = Arc::clone(self);
            workers.push(tokio::spawn(async move {
                run.unload_one(&plugin).await;
                drop(permit);
            }));
        }

        for joined in join_all(workers).await {
            if let Err(err) = joined {
                tracing::error!(error = %err, "unload worker lost");
            }
        }
    }

    async fn unload_one(&self, plugin: &SharedPlugin) {
        if !self.claim(plugin.id()) {
            tracing::debug!(plugin = plugin.name(), id = plugin.id(), "plugin already claimed, skipping");
            return;
        }

        let remaining = self
            .deadline
            .saturating_duration_since(tokio::time::Instant::now());
        let budget = self
            .config
            .stop_timeout
            .min(remaining)
            .max(Duration::from_millis(1));

        let outcome = teardown(&self.driver, plugin, "unload", budget, budget).await;
        if outcome.is_clean() {
            tracing::info!(plugin = plugin.name(), id = plugin.id(), took = ?outcome.took, "plugin unloaded");
            self.unloaded.lock().push(plugin.id().to_owned());
        } else {
            self.record(UnloadFailureRecord::new(
                plugin.as_ref(),
                outcome.stop_error.map(|e| e.to_string()),
                outcome.cleanup_error.map(|e| e.to_string()),
            ));
        }
    }

    /// Force-cleans every plugin no worker has claimed. Each cleanup gets
    /// `worker_grace`, not a full stop budget, because the total deadline has
    /// already passed.
    async fn sweep(&self, plugins: &[SharedPlugin]) -> Vec<String> {
        let pending: Vec<&SharedPlugin> = plugins
            .iter()
            .filter(|plugin| self.claim(plugin.id()))
            .collect();
        if pending.is_empty() {
            return Vec::new();
        }
        tracing::warn!(plugins = pending.len(), "force-cleaning plugins without a graceful stop");

        let runtime = self.driver.runtime();
        let budget = self.config.worker_grace.max(Duration::from_millis(1));
        let cleanups = pending.iter().map(|plugin| async move {
            let result = cleanup_with_timeout(runtime, plugin.id(), budget).await;
            (*plugin, result)
        });

        let mut forced = Vec::with_capacity(pending.len());
        for (plugin, result) in join_all(cleanups).await {
            set_status(plugin.as_ref(), PluginStatus::Failed);
            if let Err(err) = &result {
                tracing::error!(plugin = plugin.name(), id = plugin.id(), error = %err, "forced cleanup failed");
            }
            self.record(UnloadFailureRecord::new(
                plugin.as_ref(),
                Some(FORCED_STOP_ERROR.to_owned()),
                result.err().map(|e| e.to_string()),
            ));
            forced.push(plugin.id().to_owned());
        }
        forced
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use trellis_plugin::{Dependency, LocalRuntime, Plugin, PluginError, Runtime};

    use super::*;

    struct Node {
        id: &'static str,
        deps: Vec<Dependency>,
        stop_delay: Duration,
        stops: AtomicUsize,
        log: StopLog,
    }

    type StopLog = Arc<Mutex<Vec<&'static str>>>;

    impl Node {
        fn new(id: &'static str, requires: &[&'static str], log: &StopLog) -> Arc<Self> {
            Self::slow(id, requires, Duration::ZERO, log)
        }

        fn slow(
            id: &'static str,
            requires: &[&'static str],
            stop_delay: Duration,
            log: &StopLog,
        ) -> Arc<Self> {
            Arc::new(Self {
                id,
                deps: requires.iter().map(|d| Dependency::required(*d)).collect(),
                stop_delay,
                stops: AtomicUsize::new(0),
                log: Arc::clone(log),
            })
        }
    }

    impl Plugin for Node {
        fn id(&self) -> &str {
            self.id
        }

        fn dependencies(&self) -> Vec<Dependency> {
            self.deps.clone()
        }

        fn initialize(&self, _runtime: Arc<dyn Runtime>) -> Result<(), PluginError> {
            Ok(())
        }

        fn start(&self) -> Result<(), PluginError> {
            Ok(())
        }

        fn stop(&self) -> Result<(), PluginError> {
            std::thread::sleep(self.stop_delay);
            self.stops.fetch_add(1, Ordering::SeqCst);
            self.log.lock().push(self.id);
            Ok(())
        }
    }

    fn orchestrator() -> UnloadOrchestrator {
        UnloadOrchestrator::new(
            LifecycleDriver::new(Arc::new(LocalRuntime::new())),
            OrchestratorConfig::default().with_stop_timeout(Duration::from_secs(1)),
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dependents_stop_first() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let plugins: Vec<SharedPlugin> = vec![
            Node::new("db", &[], &log),
            Node::new("cache", &["db"], &log),
            Node::new("api", &["cache"], &log),
        ];

        let report = orchestrator().unload_all(&plugins).await;
        assert_eq!(*log.lock(), ["api", "cache", "db"]);
        assert_eq!(report.order, ["api", "cache", "db"]);
        assert_eq!(report.unloaded.len(), 3);
        assert!(report.failures.is_empty());
        assert!(!report.timed_out);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cyclic_set_still_unloads_everything() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let plugins: Vec<SharedPlugin> = vec![
            Node::new("a", &["b"], &log),
            Node::new("b", &["a"], &log),
        ];

        let report = orchestrator().unload_all(&plugins).await;
        assert_eq!(report.unloaded.len(), 2);
        assert_eq!(log.lock().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unbounded_parallelism_is_capped_at_the_semaphore_limit() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let plugins: Vec<SharedPlugin> = vec![Node::new("a", &[], &log)];
        let orchestrator = UnloadOrchestrator::new(
            LifecycleDriver::new(Arc::new(LocalRuntime::new())),
            OrchestratorConfig::default().with_unload_parallelism(usize::MAX),
        );

        let report = orchestrator.unload_all(&plugins).await;
        assert_eq!(report.unloaded, ["a"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn total_timeout_sweeps_unclaimed_plugins() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let slow = Node::slow("slow", &[], Duration::from_millis(400), &log);
        let waiting = Node::new("waiting", &[], &log);
        let plugins: Vec<SharedPlugin> = vec![slow, waiting.clone()];

        let orchestrator = UnloadOrchestrator::new(
            LifecycleDriver::new(Arc::new(LocalRuntime::new()))
                .with_worker_grace(Duration::from_millis(10)),
            OrchestratorConfig::default()
                .with_unload_parallelism(1)
                .with_stop_timeout(Duration::from_secs(1))
                .with_unload_total_timeout(Duration::from_millis(100)),
        );

        let report = orchestrator.unload_all(&plugins).await;
        assert!(report.timed_out);
        assert_eq!(report.forced, ["waiting"]);
        assert_eq!(waiting.stops.load(Ordering::SeqCst), 0);
        let forced = report
            .failures
            .iter()
            .find(|r| r.plugin_id == "waiting")
            .unwrap();
        assert_eq!(forced.stop_error.as_deref(), Some(FORCED_STOP_ERROR));
        assert!(forced.cleanup_error.is_none());

        // The in-flight worker records its own stop timeout once it settles.
        tokio::time::sleep(Duration::from_millis(300)).await;
        let logged = orchestrator.failure_log().snapshot();
        assert_eq!(logged.len(), 2);
        let timed_out = logged.iter().find(|r| r.plugin_id == "slow").unwrap();
        assert!(timed_out.stop_error.as_deref().unwrap().contains("timed out"));
    }
}
