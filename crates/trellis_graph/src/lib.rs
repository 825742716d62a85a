//! Dependency resolution for Trellis plugins.
//!
//! Turns an unordered set of plugins into a start order annotated with
//! dependency levels, and computes best-effort unload orders for teardown.
//!
//! - [`resolve`] - Full resolution: duplicate and missing-dependency checks,
//!   topological order, completeness verification and level assignment
//! - [`unload_order`] - Cheap reverse-load order that never drops a plugin
//! - [`group_by_level`] - Buckets a resolution by level for batched startup
//!
//! Only [`Required`](trellis_plugin::DependencyKind::Required) edges take part.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use trellis_graph::resolve;
//! use trellis_plugin::prelude::*;
//!
//! struct Node(&'static str, Vec<Dependency>);
//!
//! impl Plugin for Node {
//!     fn id(&self) -> &str { self.0 }
//!     fn dependencies(&self) -> Vec<Dependency> { self.1.clone() }
//!     fn initialize(&self, _: Arc<dyn Runtime>) -> Result<(), PluginError> { Ok(()) }
//!     fn start(&self) -> Result<(), PluginError> { Ok(()) }
//!     fn stop(&self) -> Result<(), PluginError> { Ok(()) }
//! }
//!
//! let plugins: Vec<SharedPlugin> = vec![
//!     Arc::new(Node("api", vec![Dependency::required("db")])),
//!     Arc::new(Node("db", vec![])),
//! ];
//!
//! let resolved = resolve(&plugins).unwrap();
//! assert_eq!(resolved[0].plugin().id(), "db");
//! assert_eq!(resolved[0].level(), 0);
//! assert_eq!(resolved[1].plugin().id(), "api");
//! assert_eq!(resolved[1].level(), 1);
//! ```

mod error;
mod graph;
mod level;
mod unload;

pub use error::{MissingDependencies, ResolveError};
pub use graph::{DependencyGraph, PluginWithLevel, group_by_level, resolve};
pub use unload::unload_order;

/// Re-export all common types for easy access.
pub mod prelude {
    pub use crate::{
        DependencyGraph, MissingDependencies, PluginWithLevel, ResolveError, group_by_level,
        resolve, unload_order,
    };
}
