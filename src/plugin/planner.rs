//! Install ordering
//!
//! Kahn's algorithm over a [`DependencyGraph`]: a plugin becomes ready once
//! every plugin it depends on has been scheduled. Ties are broken by node
//! insertion order, so the same graph always yields the same plan.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::core::error::{HostError, Result};
use crate::plugin::types::{DependencyGraph, PluginId};

#[derive(Debug, Clone, Copy, Default)]
pub struct InstallOrderPlanner;

impl InstallOrderPlanner {
    pub fn new() -> Self {
        Self
    }

    /// Order the graph's nodes so every dependency precedes its dependents
    ///
    /// Fails with `CircularDependency` naming the unscheduled nodes when the
    /// graph has a cycle; a partial order is never returned.
    pub fn plan(&self, graph: &DependencyGraph) -> Result<Vec<PluginId>> {
        let position: HashMap<&str, usize> = graph
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.plugin_id.as_str(), i))
            .collect();

        let mut in_degree = vec![0usize; graph.nodes.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); graph.nodes.len()];
        let mut seen: HashSet<(usize, usize)> = HashSet::new();

        for edge in &graph.edges {
            // Edges to nodes outside the graph cannot be scheduled against
            let (Some(&from), Some(&to)) = (
                position.get(edge.from.as_str()),
                position.get(edge.to.as_str()),
            ) else {
                continue;
            };
            if !seen.insert((from, to)) {
                continue;
            }
            in_degree[from] += 1;
            dependents[to].push(from);
        }

        let mut ready: VecDeque<usize> = (0..graph.nodes.len())
            .filter(|&i| in_degree[i] == 0)
            .collect();
        let mut order = Vec::with_capacity(graph.nodes.len());

        while let Some(current) = ready.pop_front() {
            order.push(current);

            let mut unlocked: Vec<usize> = Vec::new();
            for &dependent in &dependents[current] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    unlocked.push(dependent);
                }
            }
            unlocked.sort_unstable();
            ready.extend(unlocked);
        }

        if order.len() < graph.nodes.len() {
            let scheduled: HashSet<usize> = order.iter().copied().collect();
            let remaining: Vec<PluginId> = graph
                .nodes
                .iter()
                .enumerate()
                .filter(|(i, _)| !scheduled.contains(i))
                .map(|(_, n)| n.plugin_id.clone())
                .collect();

            tracing::warn!(nodes = ?remaining, "Circular dependency detected");
            return Err(HostError::CircularDependency(remaining));
        }

        Ok(order
            .into_iter()
            .map(|i| graph.nodes[i].plugin_id.clone())
            .collect())
    }
}
