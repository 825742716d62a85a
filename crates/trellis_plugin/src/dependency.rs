use core::fmt;

use serde::{Deserialize, Serialize};

/// How strongly a plugin depends on another.
///
/// Only [`Required`](DependencyKind::Required) edges take part in ordering and
/// level computation. [`Optional`](DependencyKind::Optional) edges are
/// informational.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyKind {
    /// Must be present and fully started before the dependent initializes.
    #[default]
    Required,
    /// Advisory only; never affects load order.
    Optional,
}

impl fmt::Display for DependencyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DependencyKind::Required => f.write_str("required"),
            DependencyKind::Optional => f.write_str("optional"),
        }
    }
}

/// A declared edge from a plugin to the plugin with ID `target_id`.
///
/// # Example
///
/// ```
/// use trellis_plugin::{Dependency, DependencyKind};
///
/// let dep = Dependency::required("database");
/// assert_eq!(dep.target_id, "database");
/// assert_eq!(dep.kind, DependencyKind::Required);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dependency {
    /// ID of the plugin depended upon.
    pub target_id: String,
    /// Whether the edge constrains ordering.
    #[serde(default)]
    pub kind: DependencyKind,
}

impl Dependency {
    /// Creates a dependency of the given kind.
    #[must_use]
    pub fn new(target_id: impl Into<String>, kind: DependencyKind) -> Self {
        Self {
            target_id: target_id.into(),
            kind,
        }
    }

    /// Creates a required dependency.
    #[must_use]
    pub fn required(target_id: impl Into<String>) -> Self {
        Self::new(target_id, DependencyKind::Required)
    }

    /// Creates an optional dependency.
    #[must_use]
    pub fn optional(target_id: impl Into<String>) -> Self {
        Self::new(target_id, DependencyKind::Optional)
    }

    /// Returns true if this edge participates in ordering.
    #[must_use]
    pub fn is_required(&self) -> bool {
        self.kind == DependencyKind::Required
    }
}
