//! # Trellis Internal Library
//!
//! Re-exports the core Trellis crates for convenience.

/// Layer 1: plugin contract, status, events and runtime.
pub use trellis_plugin;

/// Layer 2: dependency resolution and level assignment.
pub use trellis_graph;

/// Layer 3: lifecycle driving, batched startup and bounded unload.
pub use trellis_lifecycle;

/// Infrastructure plugins.
pub use trellis_core_plugins;

/// Re-export all common types for easy access.
pub mod prelude {
    pub use trellis_core_plugins::{TracingFormat, TracingPlugin};
    pub use trellis_graph::prelude::*;
    pub use trellis_lifecycle::prelude::*;
    pub use trellis_plugin::prelude::*;
}
