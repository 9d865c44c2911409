//! Dependency graph construction
//!
//! Expands requested plugins into their transitive dependency closure by
//! depth-first traversal over the catalog. Dependencies that cannot be found are
//! recorded rather than treated as errors; whether that is fatal is the
//! caller's decision.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use crate::core::error::{HostError, Result};
use crate::db::repository::PluginCatalog;
use crate::plugin::types::{
    DependencyEdge, DependencyGraph, DependencyNode, PluginId, PluginPackage,
    UnresolvedDependency,
};
use crate::plugin::version::VersionComparator;

/// A dependency graph together with the catalog entries behind its nodes
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    pub graph: DependencyGraph,
    pub packages: HashMap<PluginId, PluginPackage>,
}

impl Resolution {
    pub fn package(&self, plugin_id: &str) -> Option<&PluginPackage> {
        self.packages.get(plugin_id)
    }
}

pub struct DependencyGraphBuilder {
    catalog: Arc<dyn PluginCatalog>,
    versions: VersionComparator,
}

impl DependencyGraphBuilder {
    pub fn new(catalog: Arc<dyn PluginCatalog>, versions: VersionComparator) -> Self {
        Self { catalog, versions }
    }

    /// Build the dependency graph for the requested plugins
    pub async fn build(&self, requested: &[PluginId], game_version: &str) -> Result<DependencyGraph> {
        Ok(self.resolve(requested, game_version).await?.graph)
    }

    /// Build the graph and keep the resolved packages
    pub async fn resolve(&self, requested: &[PluginId], game_version: &str) -> Result<Resolution> {
        let mut roots = Vec::with_capacity(requested.len());
        for id in requested {
            let package = self
                .catalog
                .get_by_id(id)
                .await?
                .ok_or_else(|| HostError::PluginNotFound(id.clone()))?;
            roots.push(package);
        }

        let mut resolution = Resolution::default();
        let mut visited: HashSet<PluginId> = HashSet::new();
        let mut candidates: HashMap<(String, String), Option<PluginPackage>> = HashMap::new();

        // Explicit stack; children are pushed in reverse so nodes are
        // discovered in the same order as recursive preorder.
        let mut stack: Vec<PluginPackage> = roots.iter().rev().cloned().collect();

        while let Some(package) = stack.pop() {
            if !visited.insert(package.id.clone()) {
                continue;
            }

            resolution.graph.add_node(DependencyNode {
                plugin_id: package.id.clone(),
                name: package.name.clone(),
                version: package.version.clone(),
                required: false,
            });

            let declared = package
                .dependencies
                .iter()
                .map(|(name, constraint)| (name, constraint, false))
                .chain(
                    package
                        .optional_dependencies
                        .iter()
                        .map(|(name, constraint)| (name, constraint, true)),
                );

            let mut children = Vec::new();
            for (name, constraint, optional) in declared {
                let key = (name.clone(), constraint.clone());
                let candidate = match candidates.get(&key) {
                    Some(cached) => cached.clone(),
                    None => {
                        let found = self.best_candidate(name, constraint, game_version).await?;
                        candidates.insert(key, found.clone());
                        found
                    }
                };

                match candidate {
                    Some(dependency) => {
                        resolution.graph.add_edge(DependencyEdge {
                            from: package.id.clone(),
                            to: dependency.id.clone(),
                            constraint: constraint.clone(),
                            optional,
                        });
                        if !visited.contains(&dependency.id) {
                            children.push(dependency);
                        }
                    }
                    None => {
                        tracing::debug!(
                            plugin_id = %package.id,
                            dependency = %name,
                            constraint = %constraint,
                            optional,
                            "No catalog entry satisfies dependency, skipping"
                        );
                        resolution.graph.unresolved.push(UnresolvedDependency {
                            from: package.id.clone(),
                            name: name.clone(),
                            constraint: constraint.clone(),
                        });
                    }
                }
            }

            stack.extend(children.into_iter().rev());
            resolution.packages.insert(package.id.clone(), package);
        }

        mark_required(&mut resolution.graph, roots.iter().map(|p| p.id.as_str()));

        tracing::debug!(
            requested = ?requested,
            nodes = resolution.graph.len(),
            edges = resolution.graph.edges.len(),
            unresolved = resolution.graph.unresolved.len(),
            "Dependency graph built"
        );

        Ok(resolution)
    }

    /// Pick the catalog entry for a dependency declaration
    ///
    /// Entries satisfying the constraint that support the target game version
    /// win over those that do not; within a group the highest version wins.
    pub async fn best_candidate(
        &self,
        name: &str,
        constraint: &str,
        game_version: &str,
    ) -> Result<Option<PluginPackage>> {
        let (supported, other): (Vec<PluginPackage>, Vec<PluginPackage>) = self
            .catalog
            .find_by_name(name)
            .await?
            .into_iter()
            .filter(|p| self.versions.satisfies(&p.version, constraint))
            .partition(|p| p.supports_game_version(game_version));

        let pool = if supported.is_empty() { other } else { supported };
        Ok(pool
            .into_iter()
            .max_by(|a, b| self.versions.compare(&a.version, &b.version)))
    }
}

/// Flag nodes reachable from the roots through required edges only
fn mark_required<'a>(graph: &mut DependencyGraph, roots: impl Iterator<Item = &'a str>) {
    let mut required: HashSet<String> = HashSet::new();
    let mut queue: VecDeque<String> = roots.map(str::to_string).collect();

    while let Some(id) = queue.pop_front() {
        if !required.insert(id.clone()) {
            continue;
        }
        for edge in graph.edges.iter().filter(|e| e.from == id && !e.optional) {
            if !required.contains(&edge.to) {
                queue.push_back(edge.to.clone());
            }
        }
    }

    for node in &mut graph.nodes {
        node.required = required.contains(&node.plugin_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{package, Fixture};

    async fn builder(packages: Vec<PluginPackage>) -> DependencyGraphBuilder {
        let fixture = Fixture::new().await;
        fixture.add_packages(&packages).await;
        DependencyGraphBuilder::new(fixture.catalog.clone(), VersionComparator::default())
    }

    fn ids(graph: &DependencyGraph) -> Vec<&str> {
        graph.nodes.iter().map(|n| n.plugin_id.as_str()).collect()
    }

    #[tokio::test]
    async fn test_chain_is_expanded_in_discovery_order() {
        let builder = builder(vec![
            package("a", "1.0").with_dependency("b", "any"),
            package("b", "1.0").with_dependency("c", "any"),
            package("c", "1.0"),
        ])
        .await;

        let graph = builder.build(&["a@1.0".to_string()], "1.20.1").await.unwrap();

        assert_eq!(ids(&graph), vec!["a@1.0", "b@1.0", "c@1.0"]);
        assert_eq!(graph.edges.len(), 2);
        assert!(graph.nodes.iter().all(|n| n.required));
        assert!(graph.unresolved.is_empty());
    }

    #[tokio::test]
    async fn test_diamond_produces_single_node() {
        let builder = builder(vec![
            package("top", "1.0")
                .with_dependency("left", "any")
                .with_dependency("right", "any"),
            package("left", "1.0").with_dependency("base", "any"),
            package("right", "1.0").with_dependency("base", "any"),
            package("base", "1.0"),
        ])
        .await;

        let graph = builder.build(&["top@1.0".to_string()], "1.20.1").await.unwrap();

        assert_eq!(ids(&graph), vec!["top@1.0", "left@1.0", "base@1.0", "right@1.0"]);
        assert_eq!(graph.dependents_of("base@1.0").len(), 2);
    }

    #[tokio::test]
    async fn test_missing_dependency_is_recorded_not_fatal() {
        let builder = builder(vec![package("shop", "1.0").with_dependency("vault", ">=1.0")]).await;

        let graph = builder.build(&["shop@1.0".to_string()], "1.20.1").await.unwrap();

        assert_eq!(graph.len(), 1);
        assert_eq!(graph.unresolved.len(), 1);
        assert_eq!(graph.unresolved[0].name, "vault");
    }

    #[tokio::test]
    async fn test_unknown_requested_plugin() {
        let builder = builder(vec![]).await;
        let err = builder
            .build(&["ghost@1.0".to_string()], "1.20.1")
            .await
            .unwrap_err();
        assert_eq!(err.reason_code(), "plugin_not_found");
    }

    #[tokio::test]
    async fn test_candidate_prefers_game_version_then_highest() {
        let builder = builder(vec![
            package("app", "1.0").with_dependency("lib", ">=1.0"),
            package("lib", "1.0"),
            package("lib", "1.5"),
            // newest build does not support the server's game version
            PluginPackage::new("lib@2.0", "lib", "2.0", crate::plugin::types::PluginCategory::Utility)
                .with_game_version("1.21"),
            package("lib", "0.9"),
        ])
        .await;

        let graph = builder.build(&["app@1.0".to_string()], "1.20.1").await.unwrap();
        assert_eq!(ids(&graph), vec!["app@1.0", "lib@1.5"]);

        let graph = builder.build(&["app@1.0".to_string()], "1.21").await.unwrap();
        assert_eq!(ids(&graph), vec!["app@1.0", "lib@2.0"]);
    }

    #[tokio::test]
    async fn test_optional_only_nodes_are_not_required() {
        let builder = builder(vec![
            package("chat", "1.0")
                .with_dependency("core", "any")
                .with_optional_dependency("emoji", "any"),
            package("core", "1.0"),
            package("emoji", "1.0").with_dependency("fonts", "any"),
            package("fonts", "1.0"),
        ])
        .await;

        let graph = builder.build(&["chat@1.0".to_string()], "1.20.1").await.unwrap();

        assert!(graph.node("core@1.0").unwrap().required);
        assert!(!graph.node("emoji@1.0").unwrap().required);
        assert!(!graph.node("fonts@1.0").unwrap().required);
        assert!(graph.edges.iter().any(|e| e.to == "emoji@1.0" && e.optional));
    }

    #[tokio::test]
    async fn test_catalog_cycle_terminates() {
        let builder = builder(vec![
            package("a", "1.0").with_dependency("b", "any"),
            package("b", "1.0").with_dependency("a", "any"),
        ])
        .await;

        let resolution = builder.resolve(&["a@1.0".to_string()], "1.20.1").await.unwrap();
        assert_eq!(resolution.graph.len(), 2);
        assert_eq!(resolution.graph.edges.len(), 2);
        assert!(resolution.package("b@1.0").is_some());
    }
}
