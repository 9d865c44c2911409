//! Version comparison
//!
//! Constraint checking is deliberately simple: by default versions and
//! constraints are compared as plain strings. The semver scheme parses both
//! sides with the `semver` crate and falls back to the string rules when either
//! side does not parse. Nothing outside this module depends on which scheme is
//! active.

use semver::{Version, VersionReq};
use std::cmp::Ordering;
use std::str::FromStr;

use crate::core::error::HostError;

/// Constraints that accept any version
const WILDCARDS: [&str; 4] = ["", "*", "any", "latest"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VersionScheme {
    #[default]
    Lexical,
    Semver,
}

impl FromStr for VersionScheme {
    type Err = HostError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lexical" => Ok(VersionScheme::Lexical),
            "semver" => Ok(VersionScheme::Semver),
            other => Err(HostError::ConfigError(format!(
                "Unknown version scheme: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct VersionComparator {
    scheme: VersionScheme,
}

impl VersionComparator {
    pub fn new(scheme: VersionScheme) -> Self {
        Self { scheme }
    }

    pub fn scheme(&self) -> VersionScheme {
        self.scheme
    }

    /// Order two version strings
    pub fn compare(&self, a: &str, b: &str) -> Ordering {
        if self.scheme == VersionScheme::Semver {
            if let (Ok(va), Ok(vb)) = (parse_version(a), parse_version(b)) {
                return va.cmp(&vb);
            }
        }
        a.cmp(b)
    }

    /// Check whether `version` satisfies `constraint`
    ///
    /// Lexical rules: wildcards match everything; `>=`, `>`, `<=`, `<`, `=`
    /// compare as strings; a bare version (or one prefixed with `^`/`~`) means
    /// "at least".
    pub fn satisfies(&self, version: &str, constraint: &str) -> bool {
        let constraint = constraint.trim();
        if WILDCARDS.iter().any(|w| w.eq_ignore_ascii_case(constraint)) {
            return true;
        }

        if self.scheme == VersionScheme::Semver {
            if let (Ok(ver), Ok(req)) = (parse_version(version), VersionReq::parse(constraint)) {
                return req.matches(&ver);
            }
            tracing::debug!(
                version = %version,
                constraint = %constraint,
                "Falling back to lexical constraint check"
            );
        }

        lexical_satisfies(version, constraint)
    }

    /// Heuristic for breaking upgrades: the leading version component changed
    pub fn is_breaking_change(&self, from: &str, to: &str) -> bool {
        leading_component(from) != leading_component(to)
    }
}

fn parse_version(version: &str) -> Result<Version, semver::Error> {
    Version::parse(version.trim().trim_start_matches('v'))
}

fn lexical_satisfies(version: &str, constraint: &str) -> bool {
    let (op, wanted) = split_operator(constraint);
    let ordering = version.trim().cmp(wanted);
    match op {
        ">" => ordering == Ordering::Greater,
        "<" => ordering == Ordering::Less,
        "<=" => ordering != Ordering::Greater,
        "=" | "==" => ordering == Ordering::Equal,
        // ">=", "^", "~" and bare versions
        _ => ordering != Ordering::Less,
    }
}

fn split_operator(constraint: &str) -> (&str, &str) {
    for op in [">=", "<=", "==", ">", "<", "=", "^", "~"] {
        if let Some(rest) = constraint.strip_prefix(op) {
            return (op, rest.trim());
        }
    }
    ("", constraint)
}

fn leading_component(version: &str) -> &str {
    version
        .trim()
        .trim_start_matches('v')
        .split(['.', '-', '+'])
        .next()
        .unwrap_or("")
}
