use std::collections::VecDeque;
use std::sync::Arc;

use hashbrown::HashMap;
use trellis_plugin::{Dependency, SharedPlugin};

/// Best-effort unload order: dependents before their dependencies.
///
/// Builds the load-direction graph (dependency to dependent), runs Kahn's
/// algorithm for a load order, appends whatever Kahn could not release in
/// input order, then reverses the whole sequence. Never fails and never drops
/// a plugin: cycles, duplicate IDs and missing targets only weaken the order.
///
/// Use this when full resolution failed or is not worth paying for.
#[must_use]
pub fn unload_order(plugins: &[SharedPlugin]) -> Vec<SharedPlugin> {
    let n = plugins.len();
    let mut index: HashMap<&str, usize> = HashMap::with_capacity(n);
    for (i, plugin) in plugins.iter().enumerate() {
        index.entry(plugin.id()).or_insert(i);
    }

    let mut in_degree = vec![0_usize; n];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (i, plugin) in plugins.iter().enumerate() {
        for dep in plugin
            .dependencies()
            .into_iter()
            .filter(Dependency::is_required)
        {
            if let Some(&target) = index.get(dep.target_id.as_str()) {
                dependents[target].push(i);
                in_degree[i] += 1;
            }
        }
    }

    let mut queue: VecDeque<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
    let mut emitted = vec![false; n];
    let mut load = Vec::with_capacity(n);

    while let Some(idx) = queue.pop_front() {
        emitted[idx] = true;
        load.push(idx);
        for &dependent in &dependents[idx] {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                queue.push_back(dependent);
            }
        }
    }

    if load.len() < n {
        tracing::warn!(
            unordered = n - load.len(),
            "unload order has cyclic residue, appending in input order"
        );
        load.extend((0..n).filter(|&i| !emitted[i]));
    }

    load.into_iter()
        .rev()
        .map(|i| Arc::clone(&plugins[i]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_plugin::{Plugin, PluginError, Runtime};

    struct Node(&'static str, Vec<&'static str>);

    impl Plugin for Node {
        fn id(&self) -> &str {
            self.0
        }

        fn dependencies(&self) -> Vec<Dependency> {
            self.1.iter().map(|d| Dependency::required(*d)).collect()
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

    fn ids(plugins: &[SharedPlugin]) -> Vec<&str> {
        plugins.iter().map(|p| p.id()).collect()
    }

    #[test]
    fn dependents_come_first() {
        let plugins: Vec<SharedPlugin> = vec![
            Arc::new(Node("api", vec!["db", "cache"])),
            Arc::new(Node("db", vec![])),
            Arc::new(Node("cache", vec!["db"])),
        ];
        assert_eq!(ids(&unload_order(&plugins)), ["api", "cache", "db"]);
    }

    #[test]
    fn cyclic_residue_is_kept() {
        let plugins: Vec<SharedPlugin> = vec![
            Arc::new(Node("free", vec![])),
            Arc::new(Node("x", vec!["y"])),
            Arc::new(Node("y", vec!["x"])),
        ];
        assert_eq!(ids(&unload_order(&plugins)), ["y", "x", "free"]);
    }

    #[test]
    fn missing_targets_and_duplicates_do_not_drop_plugins() {
        let plugins: Vec<SharedPlugin> = vec![
            Arc::new(Node("a", vec!["ghost"])),
            Arc::new(Node("a", vec![])),
            Arc::new(Node("b", vec!["a"])),
        ];
        let order = unload_order(&plugins);
        assert_eq!(order.len(), 3);
        assert_eq!(order[0].id(), "b");
    }

    #[test]
    fn empty_input() {
        assert!(unload_order(&[]).is_empty());
    }
}
