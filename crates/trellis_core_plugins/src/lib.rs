//! Core infrastructure plugins for Trellis.
//!
//! - [`TracingPlugin`] - Installs the `tracing` subscriber as an ordinary
//!   lifecycle-managed plugin
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use trellis_core_plugins::{TracingFormat, TracingPlugin};
//! use trellis_lifecycle::PluginManager;
//! use trellis_plugin::{LocalRuntime, SharedPlugin};
//! use tracing::Level;
//!
//! # async fn run() -> Result<(), trellis_lifecycle::LoadError> {
//! let manager = PluginManager::new(Arc::new(LocalRuntime::new()));
//! let tracing: SharedPlugin = Arc::new(
//!     TracingPlugin::default()
//!         .with_level(Level::DEBUG)
//!         .with_format(TracingFormat::Compact),
//! );
//! manager.load_plugins(vec![tracing]).await?;
//! # Ok(())
//! # }
//! ```

mod tracing_plugin;

pub use tracing_plugin::{TRACING_CONFIG_RESOURCE, TracingConfig, TracingFormat, TracingPlugin};
