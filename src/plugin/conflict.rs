//! Conflict detection between plugins sharing a server
//!
//! The detector walks every installed × candidate pair plus every unordered
//! pair of distinct candidates and hands each pair to the registered rules.
//! Adding a rule never changes the detector's contract.

use crate::plugin::types::{
    ConflictAnalysis, ConflictSeverity, ConflictType, PluginConflict, PluginId, PluginPackage,
    Recommendation, RemediationAction,
};
use crate::plugin::version::VersionComparator;

/// Advisory fix attached to a finding
#[derive(Debug, Clone, PartialEq)]
pub struct Remediation {
    pub action: RemediationAction,
    pub target_plugin_id: PluginId,
    pub message: String,
}

/// A conflict reported by a rule together with its remediation
#[derive(Debug, Clone, PartialEq)]
pub struct Finding {
    pub conflict: PluginConflict,
    pub remediation: Remediation,
}

/// A pairwise conflict rule
pub trait ConflictRule: Send + Sync {
    fn name(&self) -> &'static str;

    /// Inspect one pair; `a` is the installed plugin when the pair mixes
    /// installed and candidate packages
    fn check(&self, a: &PluginPackage, b: &PluginPackage) -> Vec<Finding>;
}

/// Same name, different version
pub struct DuplicateVersionRule {
    versions: VersionComparator,
}

impl DuplicateVersionRule {
    pub fn new(versions: VersionComparator) -> Self {
        Self { versions }
    }
}

impl ConflictRule for DuplicateVersionRule {
    fn name(&self) -> &'static str {
        "duplicate_version"
    }

    fn check(&self, a: &PluginPackage, b: &PluginPackage) -> Vec<Finding> {
        if a.name != b.name || a.version == b.version {
            return Vec::new();
        }

        let older = match self.versions.compare(&a.version, &b.version) {
            std::cmp::Ordering::Greater => b,
            _ => a,
        };

        vec![Finding {
            conflict: PluginConflict {
                conflict_type: ConflictType::DuplicateVersion,
                severity: ConflictSeverity::High,
                plugin_a: a.id.clone(),
                plugin_b: b.id.clone(),
                description: format!(
                    "{} is present in two versions: {} and {}",
                    a.name, a.version, b.version
                ),
            },
            remediation: Remediation {
                action: RemediationAction::RemoveOlderVersion,
                target_plugin_id: older.id.clone(),
                message: format!("Remove older version {} {}", older.name, older.version),
            },
        }]
    }
}

/// Both plugins register the same command
pub struct CommandCollisionRule;

impl ConflictRule for CommandCollisionRule {
    fn name(&self) -> &'static str {
        "command_collision"
    }

    fn check(&self, a: &PluginPackage, b: &PluginPackage) -> Vec<Finding> {
        a.commands
            .intersection(&b.commands)
            .map(|command| Finding {
                conflict: PluginConflict {
                    conflict_type: ConflictType::Resource,
                    severity: ConflictSeverity::Medium,
                    plugin_a: a.id.clone(),
                    plugin_b: b.id.clone(),
                    description: format!(
                        "{} and {} both register command '{}'",
                        a.name, b.name, command
                    ),
                },
                remediation: Remediation {
                    action: RemediationAction::ReassignCommand,
                    target_plugin_id: b.id.clone(),
                    message: format!("Reassign command '{}' in {}", command, b.name),
                },
            })
            .collect()
    }
}

/// Both plugins bind the same port
pub struct PortCollisionRule;

impl ConflictRule for PortCollisionRule {
    fn name(&self) -> &'static str {
        "port_collision"
    }

    fn check(&self, a: &PluginPackage, b: &PluginPackage) -> Vec<Finding> {
        a.ports
            .intersection(&b.ports)
            .map(|port| Finding {
                conflict: PluginConflict {
                    conflict_type: ConflictType::Resource,
                    severity: ConflictSeverity::Critical,
                    plugin_a: a.id.clone(),
                    plugin_b: b.id.clone(),
                    description: format!("{} and {} both bind port {}", a.name, b.name, port),
                },
                remediation: Remediation {
                    action: RemediationAction::ChangePort,
                    target_plugin_id: b.id.clone(),
                    message: format!("Change the port used by {} (currently {})", b.name, port),
                },
            })
            .collect()
    }
}

/// One plugin requires the other at a version it does not have
pub struct DependencyConstraintRule {
    versions: VersionComparator,
}

impl DependencyConstraintRule {
    pub fn new(versions: VersionComparator) -> Self {
        Self { versions }
    }

    fn one_way(&self, dependent: &PluginPackage, dependency: &PluginPackage) -> Option<Finding> {
        let constraint = dependent.dependencies.get(&dependency.name)?;
        if self.versions.satisfies(&dependency.version, constraint) {
            return None;
        }

        Some(Finding {
            conflict: PluginConflict {
                conflict_type: ConflictType::Dependency,
                severity: ConflictSeverity::Medium,
                plugin_a: dependent.id.clone(),
                plugin_b: dependency.id.clone(),
                description: format!(
                    "{} requires {} {} but {} is present",
                    dependent.name, dependency.name, constraint, dependency.version
                ),
            },
            remediation: Remediation {
                action: RemediationAction::InstallCompatibleVersion,
                target_plugin_id: dependency.id.clone(),
                message: format!(
                    "Install a version of {} matching {}",
                    dependency.name, constraint
                ),
            },
        })
    }
}

impl ConflictRule for DependencyConstraintRule {
    fn name(&self) -> &'static str {
        "dependency_constraint"
    }

    fn check(&self, a: &PluginPackage, b: &PluginPackage) -> Vec<Finding> {
        if a.name == b.name {
            return Vec::new();
        }
        self.one_way(a, b)
            .into_iter()
            .chain(self.one_way(b, a))
            .collect()
    }
}

/// Runs the registered rules over installed and candidate packages
pub struct ConflictDetector {
    rules: Vec<Box<dyn ConflictRule>>,
}

impl ConflictDetector {
    /// Detector with the built-in rules
    pub fn new(versions: VersionComparator) -> Self {
        Self::empty()
            .with_rule(Box::new(DuplicateVersionRule::new(versions)))
            .with_rule(Box::new(CommandCollisionRule))
            .with_rule(Box::new(PortCollisionRule))
            .with_rule(Box::new(DependencyConstraintRule::new(versions)))
    }

    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    pub fn with_rule(mut self, rule: Box<dyn ConflictRule>) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn rule_names(&self) -> Vec<&'static str> {
        self.rules.iter().map(|r| r.name()).collect()
    }

    pub fn detect(
        &self,
        installed: &[PluginPackage],
        candidates: &[PluginPackage],
    ) -> ConflictAnalysis {
        let mut analysis = ConflictAnalysis::default();

        for existing in installed {
            for candidate in candidates {
                self.check_pair(existing, candidate, &mut analysis);
            }
        }

        for (i, first) in candidates.iter().enumerate() {
            for second in &candidates[i + 1..] {
                self.check_pair(first, second, &mut analysis);
            }
        }

        analysis.has_conflicts = !analysis.conflicts.is_empty();
        analysis
    }

    fn check_pair(&self, a: &PluginPackage, b: &PluginPackage, analysis: &mut ConflictAnalysis) {
        if a.id == b.id {
            return;
        }

        for rule in &self.rules {
            for finding in rule.check(a, b) {
                tracing::debug!(
                    rule = rule.name(),
                    plugin_a = %finding.conflict.plugin_a,
                    plugin_b = %finding.conflict.plugin_b,
                    "Conflict detected"
                );
                let conflict_index = analysis.conflicts.len();
                analysis.conflicts.push(finding.conflict);
                analysis.recommendations.push(Recommendation {
                    conflict_index,
                    action: finding.remediation.action,
                    target_plugin_id: finding.remediation.target_plugin_id,
                    message: finding.remediation.message,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::types::PluginCategory;

    fn package(name: &str, version: &str) -> PluginPackage {
        PluginPackage::new(
            format!("{}@{}", name, version),
            name,
            version,
            PluginCategory::Utility,
        )
    }

    fn detector() -> ConflictDetector {
        ConflictDetector::new(VersionComparator::default())
    }

    #[test]
    fn test_duplicate_version_against_installed() {
        let installed = vec![package("x", "1.0")];
        let candidates = vec![package("x", "2.0")];

        let analysis = detector().detect(&installed, &candidates);

        assert!(analysis.has_conflicts);
        assert_eq!(analysis.conflicts.len(), 1);
        let conflict = &analysis.conflicts[0];
        assert_eq!(conflict.conflict_type, ConflictType::DuplicateVersion);
        assert_eq!(conflict.severity, ConflictSeverity::High);

        assert_eq!(analysis.recommendations.len(), 1);
        let recommendation = &analysis.recommendations[0];
        assert_eq!(recommendation.action, RemediationAction::RemoveOlderVersion);
        assert_eq!(recommendation.target_plugin_id, "x@1.0");
        assert_eq!(recommendation.conflict_index, 0);
    }

    #[test]
    fn test_same_id_is_not_a_conflict() {
        let p = package("x", "1.0").with_port(8080);
        let analysis = detector().detect(&[p.clone()], &[p]);
        assert!(!analysis.has_conflicts);
        assert!(analysis.recommendations.is_empty());
    }

    #[test]
    fn test_resource_collisions_between_candidates() {
        let a = package("warps", "1.0").with_command("spawn").with_port(8123);
        let b = package("spawnpoints", "2.0").with_command("spawn").with_port(8123);

        let analysis = detector().detect(&[], &[a, b]);

        assert_eq!(analysis.conflicts.len(), 2);
        assert!(analysis
            .conflicts
            .iter()
            .all(|c| c.conflict_type == ConflictType::Resource));
        let port = analysis
            .conflicts
            .iter()
            .position(|c| c.severity == ConflictSeverity::Critical)
            .unwrap();
        assert_eq!(
            analysis.recommendations[port].action,
            RemediationAction::ChangePort
        );
        assert!(analysis
            .recommendations
            .iter()
            .any(|r| r.action == RemediationAction::ReassignCommand));
    }

    #[test]
    fn test_dependency_constraint_violation() {
        let installed = vec![package("vault", "1.0")];
        let candidates = vec![package("shop", "3.0").with_dependency("vault", ">=2.0")];

        let analysis = detector().detect(&installed, &candidates);

        assert_eq!(analysis.conflicts.len(), 1);
        assert_eq!(analysis.conflicts[0].conflict_type, ConflictType::Dependency);
        assert_eq!(analysis.conflicts[0].plugin_a, "shop@3.0");
        assert_eq!(
            analysis.recommendations[0].action,
            RemediationAction::InstallCompatibleVersion
        );
        assert_eq!(analysis.recommendations[0].target_plugin_id, "vault@1.0");
    }

    #[test]
    fn test_custom_rule_registration() {
        struct AlwaysConflicts;

        impl ConflictRule for AlwaysConflicts {
            fn name(&self) -> &'static str {
                "always"
            }

            fn check(&self, a: &PluginPackage, b: &PluginPackage) -> Vec<Finding> {
                vec![Finding {
                    conflict: PluginConflict {
                        conflict_type: ConflictType::Resource,
                        severity: ConflictSeverity::Low,
                        plugin_a: a.id.clone(),
                        plugin_b: b.id.clone(),
                        description: "always".to_string(),
                    },
                    remediation: Remediation {
                        action: RemediationAction::ReassignCommand,
                        target_plugin_id: b.id.clone(),
                        message: "always".to_string(),
                    },
                }]
            }
        }

        let detector = ConflictDetector::empty().with_rule(Box::new(AlwaysConflicts));
        assert_eq!(detector.rule_names(), vec!["always"]);

        // 2 installed x 1 candidate, plus no candidate pairs
        let analysis = detector.detect(&[package("a", "1"), package("b", "1")], &[package("c", "1")]);
        assert_eq!(analysis.conflicts.len(), 2);
        assert_eq!(analysis.recommendations[1].conflict_index, 1);
    }
}
