//! The plugin contract for Trellis.
//!
//! `trellis_plugin` defines what an orchestrated extension module looks like
//! and the narrow collaborators it talks to:
//!
//! - [`plugin`] - The [`Plugin`] trait and its optional capabilities
//! - [`dependency`] - Required/optional dependency declarations
//! - [`status`] - Advisory lifecycle status
//! - [`event`] - Lifecycle notifications
//! - [`runtime`] - Resource runtime and event bus contract, plus [`LocalRuntime`]
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use trellis_plugin::prelude::*;
//!
//! struct Cache;
//!
//! impl Plugin for Cache {
//!     fn id(&self) -> &str {
//!         "cache"
//!     }
//!
//!     fn dependencies(&self) -> Vec<Dependency> {
//!         vec![Dependency::required("database")]
//!     }
//!
//!     fn initialize(&self, runtime: Arc<dyn Runtime>) -> Result<(), PluginError> {
//!         runtime.register_private("pool-size", 16_usize)?;
//!         Ok(())
//!     }
//!
//!     fn start(&self) -> Result<(), PluginError> {
//!         Ok(())
//!     }
//!
//!     fn stop(&self) -> Result<(), PluginError> {
//!         Ok(())
//!     }
//! }
//! ```

/// Dependency declarations between plugins.
pub mod dependency;

/// Plugin and runtime error types.
pub mod error;

/// Lifecycle notifications.
pub mod event;

/// The plugin trait and its optional capabilities.
pub mod plugin;

/// Resource runtime contract and the in-memory implementation.
pub mod runtime;

/// Advisory lifecycle status.
pub mod status;

pub use dependency::{Dependency, DependencyKind};
pub use error::{PluginError, RuntimeError};
pub use event::{EventKind, EventPriority, PluginEvent};
pub use plugin::{ContextLifecycle, Plugin, SharedPlugin, StatusSink};
pub use runtime::{
    LocalRuntime, ResourceInfo, ResourceScope, ResourceStats, Runtime, RuntimeExt,
};
pub use status::{PluginStatus, StatusCell};

/// Re-exported so plugin authors do not need a direct `tokio-util` dependency.
pub use tokio_util::sync::CancellationToken;

/// Re-export all common types for easy access.
pub mod prelude {
    pub use crate::dependency::*;
    pub use crate::error::*;
    pub use crate::event::*;
    pub use crate::plugin::*;
    pub use crate::runtime::*;
    pub use crate::status::*;
    pub use tokio_util::sync::CancellationToken;
}
