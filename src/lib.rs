//! Dependency-aware plugin orchestration.
//!
//! Plugins declare what they require; Trellis starts them level by level,
//! rolls back on failure and unloads them dependents-first under a deadline.

pub use trellis_internal::*;

/// Re-export all common types for easy access.
pub mod prelude {
    pub use trellis_internal::prelude::*;
}
