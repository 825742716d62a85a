//! Single-plugin, single-phase execution under a deadline.
//!
//! [`LifecycleDriver::drive`] picks one of three paths by probing the plugin:
//!
//! | Capability | Path |
//! |------------|------|
//! | [`ContextLifecycle`] reporting `is_context_aware() == true` | awaited directly with a cancellation token |
//! | [`ContextLifecycle`] that is not context aware | spawned tokio task (supervised worker) |
//! | neither | dedicated OS thread running the blocking method (supervised worker) |
//!
//! Supervised workers report through a result channel and a separate done
//! signal. When the deadline expires the caller gets
//! [`LifecycleError::Timeout`] right away, and a detached watcher waits
//! [`worker_grace`](LifecycleDriver::with_worker_grace) for the done signal.
//! A worker that never reports done is logged as leaked: plugin code cannot
//! be preempted, so it may keep running after it was reported as failed.
//!
//! Panics are caught on every path and returned as [`LifecycleError::Panic`].

use core::any::Any;
use core::fmt;
use core::panic::AssertUnwindSafe;
use std::backtrace::Backtrace;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use trellis_plugin::{Plugin, PluginError, PluginStatus, Runtime, SharedPlugin};

use crate::config::{DEFAULT_PHASE_TIMEOUT, DEFAULT_WORKER_GRACE};
use crate::error::LifecycleError;
use crate::events::set_status;

// ─────────────────────────────────────────────────────────────────────────────
// Phase
// ─────────────────────────────────────────────────────────────────────────────

/// A lifecycle method the driver can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// `initialize`.
    Initialize,
    /// `start`.
    Start,
    /// `stop`.
    Stop,
}

impl Phase {
    /// Lowercase name used in logs, errors and event metadata.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Initialize => "initialize",
            Phase::Start => "start",
            Phase::Stop => "stop",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Worker outcome
// ─────────────────────────────────────────────────────────────────────────────

enum Failure {
    Plugin(PluginError),
    Panic { message: String, stack: String },
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Failure::Plugin(err) => write!(f, "{err}"),
            Failure::Panic { message, .. } => write!(f, "panic: {message}"),
        }
    }
}

type Outcome = Result<(), Failure>;

fn from_unwind(result: Result<Result<(), PluginError>, Box<dyn Any + Send>>) -> Outcome {
    match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(Failure::Plugin(err)),
        Err(payload) => Err(Failure::Panic {
            message: panic_message(payload.as_ref()),
            stack: Backtrace::force_capture().to_string(),
        }),
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

/// Name and ID of the plugin being driven, owned so watchers can outlive the
/// caller.
#[derive(Clone)]
struct Subject {
    name: String,
    id: String,
    phase: Phase,
}

impl Subject {
    fn of(plugin: &dyn Plugin, phase: Phase) -> Self {
        Self {
            name: plugin.name().to_owned(),
            id: plugin.id().to_owned(),
            phase,
        }
    }

    fn error(&self, failure: Failure) -> LifecycleError {
        match failure {
            Failure::Plugin(source) => LifecycleError::Phase {
                plugin: self.name.clone(),
                id: self.id.clone(),
                phase: self.phase,
                source,
            },
            Failure::Panic { message, stack } => {
                tracing::error!(
                    plugin = %self.name,
                    id = %self.id,
                    phase = %self.phase,
                    panic = %message,
                    stack = %stack,
                    "plugin panicked"
                );
                LifecycleError::Panic {
                    plugin: self.name.clone(),
                    id: self.id.clone(),
                    phase: self.phase,
                    message,
                    stack,
                }
            }
        }
    }

    fn timeout(&self, timeout: Duration) -> LifecycleError {
        LifecycleError::Timeout {
            plugin: self.name.clone(),
            id: self.id.clone(),
            phase: self.phase,
            timeout,
        }
    }

    fn lost(&self) -> LifecycleError {
        LifecycleError::WorkerLost {
            plugin: self.name.clone(),
            id: self.id.clone(),
            phase: self.phase,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Invocation
// ─────────────────────────────────────────────────────────────────────────────

enum Dispatch {
    Direct,
    Task,
    Thread,
}

fn dispatch(plugin: &dyn Plugin) -> Dispatch {
    match plugin.context_lifecycle() {
        Some(lifecycle) if lifecycle.is_context_aware() => Dispatch::Direct,
        Some(_) => Dispatch::Task,
        None => Dispatch::Thread,
    }
}

fn call_blocking(
    plugin: &dyn Plugin,
    phase: Phase,
    runtime: Arc<dyn Runtime>,
) -> Result<(), PluginError> {
    match phase {
        Phase::Initialize => plugin.initialize(runtime),
        Phase::Start => plugin.start(),
        Phase::Stop => plugin.stop(),
    }
}

async fn call_with_token(
    plugin: &dyn Plugin,
    phase: Phase,
    token: CancellationToken,
    runtime: Arc<dyn Runtime>,
) -> Result<(), PluginError> {
    let Some(lifecycle) = plugin.context_lifecycle() else {
        return call_blocking(plugin, phase, runtime);
    };
    match phase {
        Phase::Initialize => lifecycle.initialize_with_token(token, runtime).await,
        Phase::Start => lifecycle.start_with_token(token).await,
        Phase::Stop => lifecycle.stop_with_token(token).await,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// LifecycleDriver
// ─────────────────────────────────────────────────────────────────────────────

/// Runs one lifecycle phase of one plugin under a deadline.
///
/// Must be used from within a tokio runtime.
///
/// # Example
///
/// ```no_run
/// # async fn demo(plugin: trellis_plugin::SharedPlugin) {
/// use std::sync::Arc;
/// use std::time::Duration;
/// use trellis_lifecycle::{LifecycleDriver, Phase};
/// use trellis_plugin::LocalRuntime;
///
/// let driver = LifecycleDriver::new(Arc::new(LocalRuntime::new()));
/// match driver.drive(&plugin, Phase::Start, Duration::from_secs(5)).await {
///     Ok(()) => {}
///     Err(err) if err.is_timeout() => eprintln!("never answered: {err}"),
///     Err(err) => eprintln!("refused: {err}"),
/// }
/// # }
/// ```
#[derive(Clone)]
pub struct LifecycleDriver {
    runtime: Arc<dyn Runtime>,
    worker_grace: Duration,
}

impl LifecycleDriver {
    /// Creates a driver that scopes `initialize` calls through `runtime`.
    #[must_use]
    pub fn new(runtime: Arc<dyn Runtime>) -> Self {
        Self {
            runtime,
            worker_grace: DEFAULT_WORKER_GRACE,
        }
    }

    /// Sets how long a timed-out worker may take to report done before it is
    /// logged as leaked.
    #[must_use]
    pub fn with_worker_grace(mut self, grace: Duration) -> Self {
        self.worker_grace = grace;
        self
    }

    /// The runtime used for scoping, events and cleanup.
    #[must_use]
    pub fn runtime(&self) -> &Arc<dyn Runtime> {
        &self.runtime
    }

    /// Runs `phase` on `plugin`, waiting at most `timeout`. A zero timeout
    /// means the default of five seconds.
    ///
    /// On timeout or panic the plugin's status is set to
    /// [`PluginStatus::Failed`] before this returns.
    ///
    /// # Errors
    ///
    /// - [`LifecycleError::Phase`] when the plugin returns an error
    /// - [`LifecycleError::Timeout`] when the deadline expires first
    /// - [`LifecycleError::Panic`] when the plugin panics
    /// - [`LifecycleError::Spawn`] / [`LifecycleError::WorkerLost`] when the
    ///   supervised worker cannot run or vanishes
    pub async fn drive(
        &self,
        plugin: &SharedPlugin,
        phase: Phase,
        timeout: Duration,
    ) -> Result<(), LifecycleError> {
        let timeout = if timeout.is_zero() {
            DEFAULT_PHASE_TIMEOUT
        } else {
            timeout
        };
        let subject = Subject::of(plugin.as_ref(), phase);
        let runtime = self.runtime.with_plugin_context(plugin.id());
        let began = Instant::now();

        let result = match dispatch(plugin.as_ref()) {
            Dispatch::Direct => {
                tracing::debug!(plugin = %subject.name, phase = %phase, "driving context-aware plugin directly");
                self.drive_direct(plugin, &subject, runtime, timeout).await
            }
            Dispatch::Task => {
                tracing::debug!(plugin = %subject.name, phase = %phase, "driving plugin on supervised task");
                self.drive_task(plugin, &subject, runtime, timeout).await
            }
            Dispatch::Thread => {
                tracing::debug!(plugin = %subject.name, phase = %phase, "driving plugin on supervised thread");
                self.drive_thread(plugin, &subject, runtime, timeout).await
            }
        };

        let took = began.elapsed();
        match &result {
            Ok(()) if took > timeout / 2 => {
                tracing::warn!(
                    plugin = %subject.name,
                    id = %subject.id,
                    phase = %phase,
                    ?took,
                    ?timeout,
                    "plugin phase used more than half of its timeout"
                );
            }
            Err(err) if err.is_timeout() || err.is_panic() => {
                set_status(plugin.as_ref(), PluginStatus::Failed);
            }
            _ => {}
        }
        result
    }

    async fn drive_direct(
        &self,
        plugin: &SharedPlugin,
        subject: &Subject,
        runtime: Arc<dyn Runtime>,
        timeout: Duration,
    ) -> Result<(), LifecycleError> {
        let token = CancellationToken::new();
        let owned = Arc::clone(plugin);
        let phase = subject.phase;
        let call_token = token.clone();
        let mut call = Box::pin(
            AssertUnwindSafe(async move {
                call_with_token(owned.as_ref(), phase, call_token, runtime).await
            })
            .catch_unwind(),
        );

        tokio::select! {
            outcome = &mut call => from_unwind(outcome).map_err(|failure| subject.error(failure)),
            () = tokio::time::sleep(timeout) => {
                token.cancel();
                tracing::warn!(
                    plugin = %subject.name,
                    id = %subject.id,
                    phase = %phase,
                    ?timeout,
                    "context-aware plugin timed out, cancellation requested"
                );
                let watched = subject.clone();
                let grace = self.worker_grace;
                tokio::spawn(async move {
                    match tokio::time::timeout(grace, call).await {
                        Ok(outcome) => log_late(&watched, &from_unwind(outcome)),
                        Err(_) => log_leak(&watched, grace),
                    }
                });
                Err(subject.timeout(timeout))
            }
        }
    }

    async fn drive_task(
        &self,
        plugin: &SharedPlugin,
        subject: &Subject,
        runtime: Arc<dyn Runtime>,
        timeout: Duration,
    ) -> Result<(), LifecycleError> {
        let token = CancellationToken::new();
        let (result_tx, result_rx) = oneshot::channel::<Outcome>();
        let (done_tx, done_rx) = oneshot::channel::<()>();

        let owned = Arc::clone(plugin);
        let phase = subject.phase;
        let call_token = token.clone();
        tokio::spawn(async move {
            let outcome = AssertUnwindSafe(call_with_token(owned.as_ref(), phase, call_token, runtime))
                .catch_unwind()
                .await;
            // The receiver is gone once the driver has moved on.
            let _ = result_tx.send(from_unwind(outcome));
            let _ = done_tx.send(());
        });

        self.supervise(subject, token, result_rx, done_rx, timeout).await
    }

    async fn drive_thread(
        &self,
        plugin: &SharedPlugin,
        subject: &Subject,
        runtime: Arc<dyn Runtime>,
        timeout: Duration,
    ) -> Result<(), LifecycleError> {
        let token = CancellationToken::new();
        let (result_tx, result_rx) = oneshot::channel::<Outcome>();
        let (done_tx, done_rx) = oneshot::channel::<()>();

        let owned = Arc::clone(plugin);
        let phase = subject.phase;
        let spawned = std::thread::Builder::new()
            .name(format!("trellis-{}-{}", phase, subject.id))
            .spawn(move || {
                let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
                    call_blocking(owned.as_ref(), phase, runtime)
                }));
                let _ = result_tx.send(from_unwind(outcome));
                let _ = done_tx.send(());
            });

        if let Err(source) = spawned {
            return Err(LifecycleError::Spawn {
                plugin: subject.name.clone(),
                id: subject.id.clone(),
                phase,
                source,
            });
        }

        self.supervise(subject, token, result_rx, done_rx, timeout).await
    }

    async fn supervise(
        &self,
        subject: &Subject,
        token: CancellationToken,
        mut result_rx: oneshot::Receiver<Outcome>,
        done_rx: oneshot::Receiver<()>,
        timeout: Duration,
    ) -> Result<(), LifecycleError> {
        tokio::select! {
            received = &mut result_rx => match received {
                Ok(outcome) => outcome.map_err(|failure| subject.error(failure)),
                Err(_) => Err(subject.lost()),
            },
            () = tokio::time::sleep(timeout) => {
                token.cancel();
                tracing::warn!(
                    plugin = %subject.name,
                    id = %subject.id,
                    phase = %subject.phase,
                    ?timeout,
                    "plugin timed out; plugin may still be running"
                );
                let watched = subject.clone();
                let grace = self.worker_grace;
                tokio::spawn(async move {
                    match tokio::time::timeout(grace, done_rx).await {
                        Ok(_) => {
                            if let Ok(outcome) = result_rx.try_recv() {
                                log_late(&watched, &outcome);
                            }
                        }
                        Err(_) => log_leak(&watched, grace),
                    }
                });
                Err(subject.timeout(timeout))
            }
        }
    }
}

impl fmt::Debug for LifecycleDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleDriver")
            .field("worker_grace", &self.worker_grace)
            .finish_non_exhaustive()
    }
}

fn log_late(subject: &Subject, outcome: &Outcome) {
    match outcome {
        Ok(()) => tracing::warn!(
            plugin = %subject.name,
            id = %subject.id,
            phase = %subject.phase,
            "plugin completed after timeout"
        ),
        Err(failure) => tracing::warn!(
            plugin = %subject.name,
            id = %subject.id,
            phase = %subject.phase,
            error = %failure,
            "plugin completed after timeout with error"
        ),
    }
}

fn log_leak(subject: &Subject, grace: Duration) {
    tracing::warn!(
        plugin = %subject.name,
        id = %subject.id,
        phase = %subject.phase,
        ?grace,
        "plugin worker did not finish within grace period; it ignores cancellation and may leak"
    );
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use trellis_plugin::{ContextLifecycle, LocalRuntime, StatusCell, StatusSink};

    use super::*;

    #[derive(Clone, Copy)]
    enum Behavior {
        Ok,
        Fail,
        Panic,
        Sleep(Duration),
    }

    struct Scripted {
        behavior: Behavior,
        token_methods: bool,
        aware: bool,
        calls: AtomicUsize,
        finished: Arc<AtomicBool>,
        status: StatusCell,
    }

    impl Scripted {
        fn new(behavior: Behavior) -> Self {
            Self {
                behavior,
                token_methods: false,
                aware: false,
                calls: AtomicUsize::new(0),
                finished: Arc::new(AtomicBool::new(false)),
                status: StatusCell::default(),
            }
        }

        fn with_tokens(mut self, aware: bool) -> Self {
            self.token_methods = true;
            self.aware = aware;
            self
        }

        fn run(&self) -> Result<(), PluginError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let result = match self.behavior {
                Behavior::Ok => Ok(()),
                Behavior::Fail => Err(PluginError::msg("refused")),
                Behavior::Panic => panic!("kaboom"),
                Behavior::Sleep(d) => {
                    std::thread::sleep(d);
                    Ok(())
                }
            };
            self.finished.store(true, Ordering::SeqCst);
            result
        }
    }

    impl Plugin for Scripted {
        fn id(&self) -> &str {
            "scripted"
        }

        fn initialize(&self, runtime: Arc<dyn Runtime>) -> Result<(), PluginError> {
            assert_eq!(runtime.current_plugin(), Some("scripted"));
            self.run()
        }

        fn start(&self) -> Result<(), PluginError> {
            self.run()
        }

        fn stop(&self) -> Result<(), PluginError> {
            self.run()
        }

        fn context_lifecycle(&self) -> Option<&dyn ContextLifecycle> {
            self.token_methods.then_some(self as &dyn ContextLifecycle)
        }

        fn status_sink(&self) -> Option<&dyn StatusSink> {
            Some(&self.status)
        }
    }

    #[async_trait]
    impl ContextLifecycle for Scripted {
        async fn initialize_with_token(
            &self,
            token: CancellationToken,
            _runtime: Arc<dyn Runtime>,
        ) -> Result<(), PluginError> {
            self.start_with_token(token).await
        }

        async fn start_with_token(&self, token: CancellationToken) -> Result<(), PluginError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.behavior {
                Behavior::Sleep(d) => {
                    if self.aware {
                        tokio::select! {
                            () = token.cancelled() => return Err(PluginError::Cancelled),
                            () = tokio::time::sleep(d) => {}
                        }
                    } else {
                        tokio::time::sleep(d).await;
                    }
                    self.finished.store(true, Ordering::SeqCst);
                    Ok(())
                }
                Behavior::Ok => Ok(()),
                Behavior::Fail => Err(PluginError::msg("refused")),
                Behavior::Panic => panic!("kaboom"),
            }
        }

        async fn stop_with_token(&self, token: CancellationToken) -> Result<(), PluginError> {
            self.start_with_token(token).await
        }

        fn is_context_aware(&self) -> bool {
            self.aware
        }
    }

    fn driver() -> LifecycleDriver {
        LifecycleDriver::new(Arc::new(LocalRuntime::new()))
            .with_worker_grace(Duration::from_millis(50))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn legacy_success_and_refusal() {
        let ok: SharedPlugin = Arc::new(Scripted::new(Behavior::Ok));
        driver()
            .drive(&ok, Phase::Initialize, Duration::from_secs(1))
            .await
            .unwrap();

        let refusing: SharedPlugin = Arc::new(Scripted::new(Behavior::Fail));
        let err = driver()
            .drive(&refusing, Phase::Start, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::Phase { phase: Phase::Start, .. }));
        assert_eq!(err.to_string(), "plugin scripted (scripted) failed to start: refused");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn legacy_timeout_returns_at_deadline_and_worker_keeps_running() {
        let scripted = Arc::new(Scripted::new(Behavior::Sleep(Duration::from_millis(400))));
        let finished = Arc::clone(&scripted.finished);
        let plugin: SharedPlugin = scripted.clone();

        let began = Instant::now();
        let err = driver()
            .drive(&plugin, Phase::Start, Duration::from_millis(100))
            .await
            .unwrap_err();
        let elapsed = began.elapsed();

        assert!(err.is_timeout(), "{err}");
        assert!(elapsed >= Duration::from_millis(100), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(350), "{elapsed:?}");
        assert!(!finished.load(Ordering::SeqCst));
        assert_eq!(scripted.status.get(), PluginStatus::Failed);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn legacy_panic_becomes_error() {
        let scripted = Arc::new(Scripted::new(Behavior::Panic));
        let plugin: SharedPlugin = scripted.clone();
        let err = driver()
            .drive(&plugin, Phase::Stop, Duration::from_secs(1))
            .await
            .unwrap_err();
        let LifecycleError::Panic { message, stack, .. } = &err else {
            panic!("expected panic error, got {err}");
        };
        assert_eq!(message, "kaboom");
        assert!(!stack.is_empty());
        assert_eq!(scripted.status.get(), PluginStatus::Failed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn aware_plugin_observes_cancellation() {
        let scripted =
            Arc::new(Scripted::new(Behavior::Sleep(Duration::from_secs(5))).with_tokens(true));
        let plugin: SharedPlugin = scripted.clone();

        let began = Instant::now();
        let err = driver()
            .drive(&plugin, Phase::Start, Duration::from_millis(100))
            .await
            .unwrap_err();

        assert!(err.is_timeout());
        assert!(began.elapsed() < Duration::from_secs(1));
        assert!(!scripted.finished.load(Ordering::SeqCst));
        assert_eq!(scripted.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unaware_token_plugin_runs_on_task() {
        let scripted =
            Arc::new(Scripted::new(Behavior::Sleep(Duration::from_millis(300))).with_tokens(false));
        let plugin: SharedPlugin = scripted.clone();

        let err = driver()
            .drive(&plugin, Phase::Initialize, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(err.is_timeout());

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(scripted.finished.load(Ordering::SeqCst));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn token_panic_is_caught() {
        let plugin: SharedPlugin = Arc::new(Scripted::new(Behavior::Panic).with_tokens(true));
        let err = driver()
            .drive(&plugin, Phase::Start, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.is_panic());
        assert!(err.to_string().contains("kaboom"));
    }

    #[test]
    fn panic_payloads() {
        assert_eq!(panic_message(&"static"), "static");
        assert_eq!(panic_message(&String::from("owned")), "owned");
        assert_eq!(panic_message(&42_u8), "non-string panic payload");
    }
}
