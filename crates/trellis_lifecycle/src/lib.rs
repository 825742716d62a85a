//! Lifecycle orchestration for Trellis plugins.
//!
//! `trellis_lifecycle` drives resolved plugins through their lifecycle:
//!
//! - [`driver`] - One phase of one plugin under a deadline, with panic capture
//!   and supervision of plugins that cannot be cancelled
//! - [`BatchOrchestrator`] - Level-by-level startup with bounded parallelism
//!   and reverse-order rollback on failure
//! - [`UnloadOrchestrator`] - Dependents-first shutdown under a total deadline
//!   that always completes
//! - [`PluginManager`] - Programmatic entrypoints tying it together
//! - [`config`] - Parallelism limits and deadlines, loadable from TOML
//!
//! # Failure model
//!
//! | Stage | On failure |
//! |-------|------------|
//! | Resolution | [`LoadError::Resolve`], nothing executed |
//! | Startup | everything started so far rolled back, [`StartupError`] |
//! | Unload | recorded as [`UnloadFailureRecord`], never raised |

mod batch;
mod error;
mod events;
mod failures;
mod manager;
mod rollback;
mod teardown;
mod unload;

/// Orchestrator configuration.
pub mod config;

/// Single-plugin phase execution.
pub mod driver;

pub use batch::BatchOrchestrator;
pub use config::{
    ConfigError, DEFAULT_PHASE_TIMEOUT, DEFAULT_START_PARALLELISM, DEFAULT_UNLOAD_PARALLELISM,
    DEFAULT_UNLOAD_TOTAL_TIMEOUT, DEFAULT_WORKER_GRACE, MAX_START_PARALLELISM, MAX_UNLOAD_PARALLELISM,
    OrchestratorConfig,
};
pub use driver::{LifecycleDriver, Phase};
pub use error::{CleanupError, LifecycleError, LoadError, StartupError, StopError};
pub use failures::{UNLOAD_FAILURE_CAPACITY, UnloadFailureLog, UnloadFailureRecord};
pub use manager::PluginManager;
pub use rollback::{RollbackOutcome, RollbackReport};
pub use unload::{UnloadOrchestrator, UnloadReport};

/// Re-export all common types for easy access.
pub mod prelude {
    pub use crate::{
        BatchOrchestrator, CleanupError, LifecycleDriver, LifecycleError, LoadError,
        OrchestratorConfig, Phase, PluginManager, RollbackReport, StartupError, StopError,
        UnloadFailureRecord, UnloadOrchestrator, UnloadReport,
    };
}
