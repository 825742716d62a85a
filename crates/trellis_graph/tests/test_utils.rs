//! Shared test utilities for `trellis_graph` integration tests.
//!
//! Import via `mod test_utils;` in test files.

#![allow(
    dead_code,
    missing_docs,
    reason = "shared test utilities, not every item is used in every test binary"
)]

use std::sync::Arc;

use trellis_plugin::prelude::*;

// ═══════════════════════════════════════════════════════════════════════════════
// STATIC PLUGIN
// ═══════════════════════════════════════════════════════════════════════════════

/// A plugin that only carries an identity and dependency list.
#[derive(Debug, Clone)]
pub struct StaticPlugin {
    pub id: String,
    pub name: String,
    pub deps: Vec<Dependency>,
}

impl Plugin for StaticPlugin {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
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
        Ok(())
    }
}

/// Builds a plugin whose name is the upper-cased ID.
pub fn plugin(id: &str, requires: &[&str]) -> SharedPlugin {
    Arc::new(StaticPlugin {
        id: id.to_owned(),
        name: id.to_uppercase(),
        deps: requires.iter().map(|d| Dependency::required(*d)).collect(),
    })
}

/// Builds a plugin from an explicit dependency list.
pub fn plugin_with(id: &str, deps: Vec<Dependency>) -> SharedPlugin {
    Arc::new(StaticPlugin {
        id: id.to_owned(),
        name: id.to_uppercase(),
        deps,
    })
}

// ═══════════════════════════════════════════════════════════════════════════════
// GENERATED GRAPHS
// ═══════════════════════════════════════════════════════════════════════════════

/// A generated plugin description. Kept separate from [`StaticPlugin`] so
/// `proptest` can print shrunk cases.
#[derive(Debug, Clone)]
pub struct NodeSpec {
    pub id: String,
    pub requires: Vec<String>,
    pub optional: Vec<String>,
}

/// Materializes generated descriptions into plugins.
pub fn materialize(specs: &[NodeSpec]) -> Vec<SharedPlugin> {
    specs
        .iter()
        .map(|spec| {
            let deps = spec
                .requires
                .iter()
                .map(Dependency::required)
                .chain(spec.optional.iter().map(Dependency::optional))
                .collect();
            plugin_with(&spec.id, deps)
        })
        .collect()
}
