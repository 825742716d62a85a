//! Level assignment over required edges.

use crate::error::ResolveError;
use crate::graph::DependencyGraph;

#[derive(Clone, Copy)]
enum Mark {
    Unvisited,
    InProgress,
    Done(usize),
}

/// Computes `level(p) = 0` for plugins without required dependencies, else
/// `1 + max(level(dep))`, memoized per node.
///
/// Revisiting a node that is still on the recursion path is reported as
/// [`ResolveError::LevelCycle`] even though `order` should already be acyclic.
pub(crate) fn assign_levels(
    graph: &DependencyGraph,
    order: &[usize],
) -> Result<Vec<usize>, ResolveError> {
    let mut marks = vec![Mark::Unvisited; graph.len()];
    let mut levels = vec![0; graph.len()];
    let mut path = Vec::new();

    for &node in order {
        levels[node] = level_of(graph, node, &mut marks, &mut path)?;
    }
    Ok(levels)
}

fn level_of(
    graph: &DependencyGraph,
    node: usize,
    marks: &mut [Mark],
    path: &mut Vec<usize>,
) -> Result<usize, ResolveError> {
    match marks[node] {
        Mark::Done(level) => return Ok(level),
        Mark::InProgress => {
            let start = path.iter().position(|&p| p == node).unwrap_or(0);
            let cycle = path[start..]
                .iter()
                .chain(core::iter::once(&node))
                .map(|&i| graph.label(i))
                .collect();
            return Err(ResolveError::LevelCycle { path: cycle });
        }
        Mark::Unvisited => {}
    }

    marks[node] = Mark::InProgress;
    path.push(node);

    let mut level = 0;
    for &dep in graph.requires(node) {
        level = level.max(level_of(graph, dep, marks, path)? + 1);
    }

    path.pop();
    marks[node] = Mark::Done(level);
    Ok(level)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use trellis_plugin::{Dependency, Plugin, PluginError, Runtime, SharedPlugin};

    use super::*;

    struct Node(&'static str, &'static [&'static str]);

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

    #[test]
    fn level_recursion_reports_cycle_path() {
        // Bypass Kahn by handing the cycle straight to level assignment.
        let plugins: Vec<SharedPlugin> = vec![
            Arc::new(Node("a", &["b"])),
            Arc::new(Node("b", &["c"])),
            Arc::new(Node("c", &["a"])),
        ];
        let graph = DependencyGraph::build(&plugins).unwrap();
        let err = assign_levels(&graph, &[0, 1, 2]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "circular dependency detected in level calculation: a(a) -> b(b) -> c(c) -> a(a)"
        );
    }

    #[test]
    fn levels_are_memoized_across_roots() {
        let plugins: Vec<SharedPlugin> = vec![
            Arc::new(Node("base", &[])),
            Arc::new(Node("mid", &["base"])),
            Arc::new(Node("top1", &["mid"])),
            Arc::new(Node("top2", &["mid", "base"])),
        ];
        let graph = DependencyGraph::build(&plugins).unwrap();
        let levels = assign_levels(&graph, &[0, 1, 2, 3]).unwrap();
        assert_eq!(levels, [0, 1, 2, 2]);
    }
}
