use core::fmt;

/// A plugin whose required dependencies are absent from the working set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingDependencies {
    /// ID of the dependent plugin.
    pub plugin_id: String,
    /// Name of the dependent plugin.
    pub plugin_name: String,
    /// IDs that could not be found.
    pub missing: Vec<String>,
}

impl fmt::Display for MissingDependencies {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "plugin {} requires missing dependencies: [{}]",
            self.plugin_name,
            self.missing.join(", ")
        )
    }
}

/// Configuration errors found while resolving a plugin set.
///
/// All of these are detected before any plugin executes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    /// Two plugins in one batch share an ID.
    #[error("duplicate plugin ID detected: {id} (plugins: {first} and {second})")]
    DuplicateId {
        /// The shared ID.
        id: String,
        /// Name of the plugin seen first.
        first: String,
        /// Name of the plugin seen second.
        second: String,
    },

    /// Required dependencies point outside the working set.
    #[error("missing required dependencies: {}", join(.0, "; "))]
    MissingDependencies(Vec<MissingDependencies>),

    /// The required-edge graph has a cycle. `path` lists `Name(id)` labels and
    /// repeats the first node at the end.
    #[error("circular dependency detected: {}", .path.join(" -> "))]
    Cycle {
        /// The cycle, first node repeated last.
        path: Vec<String>,
    },

    /// The resolved order does not contain every input plugin exactly once.
    #[error(
        "topological sort incomplete: {resolved} plugins in result, {expected} expected; \
         missing plugins: [{}]; duplicate IDs in result: [{}]",
        .missing.join(", "),
        .duplicates.join(", ")
    )]
    Incomplete {
        /// Entries in the produced order.
        resolved: usize,
        /// Plugins in the input.
        expected: usize,
        /// IDs absent from the produced order.
        missing: Vec<String>,
        /// IDs emitted more than once.
        duplicates: Vec<String>,
    },

    /// Level assignment revisited a node still in progress.
    #[error("circular dependency detected in level calculation: {}", .path.join(" -> "))]
    LevelCycle {
        /// The revisited path, first node repeated last.
        path: Vec<String>,
    },
}

fn join(items: &[MissingDependencies], sep: &str) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(sep)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_dependencies_message_is_consolidated() {
        let err = ResolveError::MissingDependencies(vec![
            MissingDependencies {
                plugin_id: "api".into(),
                plugin_name: "API".into(),
                missing: vec!["db".into(), "cache".into()],
            },
            MissingDependencies {
                plugin_id: "jobs".into(),
                plugin_name: "Jobs".into(),
                missing: vec!["queue".into()],
            },
        ]);
        assert_eq!(
            err.to_string(),
            "missing required dependencies: plugin API requires missing dependencies: [db, cache]; \
             plugin Jobs requires missing dependencies: [queue]"
        );
    }

    #[test]
    fn cycle_message_lists_path() {
        let err = ResolveError::Cycle {
            path: vec!["A(a)".into(), "B(b)".into(), "A(a)".into()],
        };
        assert_eq!(err.to_string(), "circular dependency detected: A(a) -> B(b) -> A(a)");
    }
}
