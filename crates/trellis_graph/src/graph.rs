use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use hashbrown::HashMap;
use trellis_plugin::{Dependency, SharedPlugin};

use crate::error::{MissingDependencies, ResolveError};
use crate::level;

// ─────────────────────────────────────────────────────────────────────────────
// PluginWithLevel
// ─────────────────────────────────────────────────────────────────────────────

/// A plugin annotated with its dependency level.
///
/// Level 0 has no required dependencies; otherwise the level is one more than
/// the highest level among the plugin's required dependencies. It is computed
/// once per resolution and cannot change afterwards.
#[derive(Clone)]
pub struct PluginWithLevel {
    plugin: SharedPlugin,
    level: usize,
}

impl PluginWithLevel {
    /// Pairs a plugin with a precomputed level.
    #[must_use]
    pub fn new(plugin: SharedPlugin, level: usize) -> Self {
        Self { plugin, level }
    }

    /// The plugin.
    #[must_use]
    pub fn plugin(&self) -> &SharedPlugin {
        &self.plugin
    }

    /// The dependency level.
    #[must_use]
    pub fn level(&self) -> usize {
        self.level
    }
}

impl core::fmt::Debug for PluginWithLevel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PluginWithLevel")
            .field("id", &self.plugin.id())
            .field("level", &self.level)
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// DependencyGraph
// ─────────────────────────────────────────────────────────────────────────────

/// Plugins indexed by ID with their required edges.
///
/// Built fresh for every resolution. Construction already rejects duplicate
/// IDs and missing required dependencies, so a graph value always has a
/// complete edge set.
pub struct DependencyGraph {
    plugins: Vec<SharedPlugin>,
    index: HashMap<String, usize>,
    /// `requires[i]` holds the indices plugin `i` requires, deduplicated.
    requires: Vec<Vec<usize>>,
}

impl DependencyGraph {
    /// Indexes `plugins` and collects their required edges.
    ///
    /// # Errors
    ///
    /// - [`ResolveError::DuplicateId`] on the first repeated ID
    /// - [`ResolveError::MissingDependencies`] listing every plugin with absent
    ///   required targets
    pub fn build(plugins: &[SharedPlugin]) -> Result<Self, ResolveError> {
        let mut index: HashMap<String, usize> = HashMap::with_capacity(plugins.len());
        for (i, plugin) in plugins.iter().enumerate() {
            if let Some(&first) = index.get(plugin.id()) {
                return Err(ResolveError::DuplicateId {
                    id: plugin.id().to_owned(),
                    first: plugins[first].name().to_owned(),
                    second: plugin.name().to_owned(),
                });
            }
            index.insert(plugin.id().to_owned(), i);
        }

        let mut requires = Vec::with_capacity(plugins.len());
        let mut missing = Vec::new();
        for plugin in plugins {
            let mut edges = Vec::new();
            let mut absent = Vec::new();
            for dep in plugin
                .dependencies()
                .into_iter()
                .filter(Dependency::is_required)
            {
                match index.get(dep.target_id.as_str()) {
                    Some(&target) if !edges.contains(&target) => edges.push(target),
                    Some(_) => {}
                    None => absent.push(dep.target_id),
                }
            }
            if !absent.is_empty() {
                missing.push(MissingDependencies {
                    plugin_id: plugin.id().to_owned(),
                    plugin_name: plugin.name().to_owned(),
                    missing: absent,
                });
            }
            requires.push(edges);
        }

        if !missing.is_empty() {
            return Err(ResolveError::MissingDependencies(missing));
        }

        Ok(Self {
            plugins: plugins.to_vec(),
            index,
            requires,
        })
    }

    /// Number of plugins.
    #[must_use]
    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    /// Returns true if the graph has no plugins.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Returns true if a plugin with `id` is present.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// IDs that `id` requires, or `None` if `id` is not in the graph.
    #[must_use]
    pub fn required_by(&self, id: &str) -> Option<Vec<&str>> {
        let &i = self.index.get(id)?;
        Some(
            self.requires[i]
                .iter()
                .map(|&dep| self.plugins[dep].id())
                .collect(),
        )
    }

    /// Resolves the graph into a start order with levels.
    ///
    /// Every required dependency appears before its dependents, and has a
    /// strictly lower level.
    ///
    /// # Errors
    ///
    /// - [`ResolveError::Cycle`] with the concrete cycle path
    /// - [`ResolveError::Incomplete`] if the order lost or repeated a plugin
    /// - [`ResolveError::LevelCycle`] if level assignment finds a cycle
    pub fn resolve(&self) -> Result<Vec<PluginWithLevel>, ResolveError> {
        if self.is_empty() {
            return Ok(Vec::new());
        }

        let order = self.topological_order()?;
        self.verify_complete(&order)?;
        let levels = level::assign_levels(self, &order)?;

        tracing::debug!(
            plugins = order.len(),
            levels = levels.iter().max().map_or(0, |max| max + 1),
            "resolved plugin dependencies"
        );

        Ok(order
            .into_iter()
            .map(|i| PluginWithLevel::new(Arc::clone(&self.plugins[i]), levels[i]))
            .collect())
    }

    pub(crate) fn requires(&self, node: usize) -> &[usize] {
        &self.requires[node]
    }

    /// `Name(id)` label used in error paths.
    pub(crate) fn label(&self, node: usize) -> String {
        let plugin = &self.plugins[node];
        format!("{}({})", plugin.name(), plugin.id())
    }

    /// Kahn's algorithm over required edges, seeded in input order.
    fn topological_order(&self) -> Result<Vec<usize>, ResolveError> {
        let n = self.plugins.len();
        let mut in_degree: Vec<usize> = self.requires.iter().map(Vec::len).collect();
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (i, deps) in self.requires.iter().enumerate() {
            for &dep in deps {
                dependents[dep].push(i);
            }
        }

        let mut queue: VecDeque<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(n);

        while let Some(idx) = queue.pop_front() {
            order.push(idx);
            for &dependent in &dependents[idx] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    queue.push_back(dependent);
                }
            }
        }

        if order.len() < n {
            return Err(ResolveError::Cycle {
                path: self.cycle_path(&in_degree),
            });
        }

        Ok(order)
    }

    /// Walks required edges through the nodes Kahn could not release until a
    /// node repeats, and returns the repeated segment.
    ///
    /// Every stuck node still has an unreleased dependency, so the walk always
    /// closes a cycle.
    fn cycle_path(&self, in_degree: &[usize]) -> Vec<String> {
        let stuck = |i: usize| in_degree[i] > 0;
        let Some(start) = (0..self.plugins.len()).find(|&i| stuck(i)) else {
            return Vec::new();
        };

        let mut path = vec![start];
        let mut position: HashMap<usize, usize> = HashMap::new();
        position.insert(start, 0);
        let mut current = start;

        while let Some(&next) = self.requires[current].iter().find(|&&dep| stuck(dep)) {
            if let Some(&pos) = position.get(&next) {
                return path[pos..]
                    .iter()
                    .chain(core::iter::once(&next))
                    .map(|&i| self.label(i))
                    .collect();
            }
            position.insert(next, path.len());
            path.push(next);
            current = next;
        }

        path.iter().map(|&i| self.label(i)).collect()
    }

    fn verify_complete(&self, order: &[usize]) -> Result<(), ResolveError> {
        let mut seen = vec![0_usize; self.plugins.len()];
        for &i in order {
            seen[i] += 1;
        }

        let ids = |pred: fn(usize) -> bool| -> Vec<String> {
            seen.iter()
                .enumerate()
                .filter(|&(_, &count)| pred(count))
                .map(|(i, _)| self.plugins[i].id().to_owned())
                .collect()
        };
        let missing = ids(|count| count == 0);
        let duplicates = ids(|count| count > 1);

        if order.len() != self.plugins.len() || !missing.is_empty() || !duplicates.is_empty() {
            return Err(ResolveError::Incomplete {
                resolved: order.len(),
                expected: self.plugins.len(),
                missing,
                duplicates,
            });
        }
        Ok(())
    }
}

/// Resolves `plugins` into a start order annotated with levels.
///
/// Shorthand for [`DependencyGraph::build`] followed by
/// [`DependencyGraph::resolve`]. An empty input resolves to an empty order.
///
/// # Errors
///
/// See [`DependencyGraph::build`] and [`DependencyGraph::resolve`].
pub fn resolve(plugins: &[SharedPlugin]) -> Result<Vec<PluginWithLevel>, ResolveError> {
    DependencyGraph::build(plugins)?.resolve()
}

/// Buckets a resolution by level, ascending. Order within a level follows the
/// resolution order.
#[must_use]
pub fn group_by_level(resolved: &[PluginWithLevel]) -> BTreeMap<usize, Vec<SharedPlugin>> {
    let mut levels: BTreeMap<usize, Vec<SharedPlugin>> = BTreeMap::new();
    for entry in resolved {
        levels
            .entry(entry.level())
            .or_default()
            .push(Arc::clone(entry.plugin()));
    }
    levels
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_plugin::{Plugin, PluginError, Runtime};

    struct Node {
        id: &'static str,
        deps: Vec<Dependency>,
    }

    impl Plugin for Node {
        fn id(&self) -> &str {
            self.id
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

    fn node(id: &'static str, requires: &[&str]) -> SharedPlugin {
        Arc::new(Node {
            id,
            deps: requires.iter().map(|d| Dependency::required(*d)).collect(),
        })
    }

    fn ids(resolved: &[PluginWithLevel]) -> Vec<&str> {
        resolved.iter().map(|p| p.plugin().id()).collect()
    }

    #[test]
    fn empty_input_resolves_to_empty() {
        assert!(resolve(&[]).unwrap().is_empty());
    }

    #[test]
    fn diamond_levels() {
        let plugins = vec![
            node("d", &["b", "c"]),
            node("b", &["a"]),
            node("c", &["a"]),
            node("a", &[]),
        ];
        let resolved = resolve(&plugins).unwrap();
        assert_eq!(ids(&resolved), ["a", "b", "c", "d"]);
        let levels: Vec<usize> = resolved.iter().map(PluginWithLevel::level).collect();
        assert_eq!(levels, [0, 1, 1, 2]);
    }

    #[test]
    fn level_uses_longest_path() {
        let plugins = vec![
            node("a", &[]),
            node("b", &["a"]),
            node("c", &["b"]),
            node("d", &["a", "c"]),
        ];
        let resolved = resolve(&plugins).unwrap();
        let d = resolved.iter().find(|p| p.plugin().id() == "d").unwrap();
        assert_eq!(d.level(), 3);
    }

    #[test]
    fn optional_edges_are_ignored() {
        let plugins: Vec<SharedPlugin> = vec![
            Arc::new(Node {
                id: "a",
                deps: vec![Dependency::optional("b"), Dependency::optional("ghost")],
            }),
            node("b", &[]),
        ];
        let resolved = resolve(&plugins).unwrap();
        assert!(resolved.iter().all(|p| p.level() == 0));
        assert_eq!(ids(&resolved), ["a", "b"]);
    }

    #[test]
    fn repeated_dependency_counts_once() {
        let plugins = vec![node("a", &[]), node("b", &["a", "a"])];
        let resolved = resolve(&plugins).unwrap();
        assert_eq!(resolved[1].level(), 1);
    }

    #[test]
    fn duplicate_id_names_both_plugins() {
        let plugins = vec![node("a", &[]), node("a", &[])];
        let err = DependencyGraph::build(&plugins).err().unwrap();
        assert_eq!(
            err.to_string(),
            "duplicate plugin ID detected: a (plugins: a and a)"
        );
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let err = resolve(&[node("a", &["a"])]).unwrap_err();
        assert_eq!(
            err,
            ResolveError::Cycle {
                path: vec!["a(a)".into(), "a(a)".into()]
            }
        );
    }

    #[test]
    fn cycle_path_excludes_tail_nodes() {
        let plugins = vec![
            node("root", &[]),
            node("tail", &["x"]),
            node("x", &["y"]),
            node("y", &["z"]),
            node("z", &["x", "root"]),
        ];
        let ResolveError::Cycle { path } = resolve(&plugins).unwrap_err() else {
            panic!("expected cycle");
        };
        assert_eq!(path, ["x(x)", "y(y)", "z(z)", "x(x)"]);
    }

    #[test]
    fn required_by_lists_targets() {
        let graph = DependencyGraph::build(&[node("a", &[]), node("b", &["a"])]).unwrap();
        assert_eq!(graph.required_by("b"), Some(vec!["a"]));
        assert_eq!(graph.required_by("nope"), None);
        assert!(graph.contains("a"));
        assert_eq!(graph.len(), 2);
    }

    #[test]
    fn group_by_level_buckets_in_order() {
        let plugins = vec![node("a", &[]), node("b", &["a"]), node("c", &["a"])];
        let grouped = group_by_level(&resolve(&plugins).unwrap());
        let shape: Vec<(usize, Vec<&str>)> = grouped
            .iter()
            .map(|(level, ps)| (*level, ps.iter().map(|p| p.id()).collect()))
            .collect();
        assert_eq!(shape, [(0, vec!["a"]), (1, vec!["b", "c"])]);
    }
}
