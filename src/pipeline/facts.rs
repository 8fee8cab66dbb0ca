//! Observable facts feeding the phase derivation.
//!
//! Facts are gathered once per derivation from the checkout (branch name,
//! tag presence) and the external approval source, then handed to the pure
//! engine. Cached state is never consulted.

use regex::Regex;
use std::collections::BTreeMap;

/// How the observed branch is classified for lineage purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchKind {
    /// A feature lineage branch; the pipeline starts at `specify`.
    Feature,
    /// A release-pattern branch; the phase is derived from tag presence.
    Release,
    /// A persistent trunk branch (main/master/...), never released directly.
    Trunk,
}

/// Branch classification rules, taken from project configuration.
#[derive(Debug, Clone)]
pub struct BranchRules {
    release_pattern: Regex,
    trunk_branches: Vec<String>,
}

impl BranchRules {
    pub fn new(release_pattern: Regex, trunk_branches: Vec<String>) -> Self {
        Self {
            release_pattern,
            trunk_branches,
        }
    }

    /// Classify a branch name.
    pub fn classify(&self, branch: &str) -> BranchKind {
        if self.trunk_branches.iter().any(|t| t == branch) {
            BranchKind::Trunk
        } else if self.release_pattern.is_match(branch) {
            BranchKind::Release
        } else {
            BranchKind::Feature
        }
    }

    /// The branch merges land on by default.
    pub fn default_trunk(&self) -> Option<&str> {
        self.trunk_branches.first().map(String::as_str)
    }

    /// The tag names whose presence marks a release branch as cut.
    ///
    /// For `release/1.2.0` these are `1.2.0` and `v1.2.0`.
    pub fn release_tag_candidates(&self, branch: &str) -> Vec<String> {
        match branch.rsplit_once('/') {
            Some((_, version)) if !version.is_empty() => {
                vec![version.to_string(), format!("v{version}")]
            }
            _ => Vec::new(),
        }
    }
}

impl Default for BranchRules {
    fn default() -> Self {
        Self {
            release_pattern: Regex::new(r"^release/")
                .expect("static release pattern is a valid regex"),
            trunk_branches: vec!["main".into(), "master".into(), "develop".into()],
        }
    }
}

/// Everything the phase engine is allowed to observe.
///
/// Approval status is pre-queried for the refs attached to the newest gated
/// record, so the derivation itself stays pure and deterministic.
#[derive(Debug, Clone)]
pub struct Facts {
    /// Current branch shorthand.
    pub branch: String,
    /// Classification of `branch` under the project rules.
    pub branch_kind: BranchKind,
    /// Whether a release tag matching the branch already exists.
    pub release_tagged: bool,
    /// Observed approval status per review reference.
    pub approvals: BTreeMap<String, bool>,
}

impl Facts {
    /// Facts for a branch with no approvals observed yet.
    pub fn for_branch(branch: impl Into<String>, rules: &BranchRules) -> Self {
        let branch = branch.into();
        let branch_kind = rules.classify(&branch);
        Self {
            branch,
            branch_kind,
            release_tagged: false,
            approvals: BTreeMap::new(),
        }
    }

    /// Whether the given review reference has been observed as approved.
    pub fn is_approved(&self, reference: &str) -> bool {
        self.approvals.get(reference).copied().unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_trunk_release_feature() {
        let rules = BranchRules::default();
        assert_eq!(rules.classify("main"), BranchKind::Trunk);
        assert_eq!(rules.classify("master"), BranchKind::Trunk);
        assert_eq!(rules.classify("release/1.2.0"), BranchKind::Release);
        assert_eq!(rules.classify("feat/login-flow"), BranchKind::Feature);
        assert_eq!(rules.classify("bugfix/crash"), BranchKind::Feature);
    }

    #[test]
    fn test_custom_release_pattern() {
        let rules = BranchRules::new(
            Regex::new(r"^rel-").unwrap(),
            vec!["trunk".into()],
        );
        assert_eq!(rules.classify("rel-2024.1"), BranchKind::Release);
        assert_eq!(rules.classify("trunk"), BranchKind::Trunk);
        assert_eq!(rules.classify("release/1.0"), BranchKind::Feature);
    }

    #[test]
    fn test_release_tag_candidates() {
        let rules = BranchRules::default();
        assert_eq!(
            rules.release_tag_candidates("release/1.2.0"),
            vec!["1.2.0".to_string(), "v1.2.0".to_string()]
        );
        assert!(rules.release_tag_candidates("main").is_empty());
        assert!(rules.release_tag_candidates("release/").is_empty());
    }

    #[test]
    fn test_facts_for_branch_defaults() {
        let rules = BranchRules::default();
        let facts = Facts::for_branch("feat/x", &rules);
        assert_eq!(facts.branch_kind, BranchKind::Feature);
        assert!(!facts.release_tagged);
        assert!(!facts.is_approved("PR#1"));
    }

    #[test]
    fn test_is_approved_reads_observed_map() {
        let rules = BranchRules::default();
        let mut facts = Facts::for_branch("feat/x", &rules);
        facts.approvals.insert("PR#1".into(), true);
        facts.approvals.insert("PR#2".into(), false);
        assert!(facts.is_approved("PR#1"));
        assert!(!facts.is_approved("PR#2"));
        assert!(!facts.is_approved("PR#3"));
    }
}
