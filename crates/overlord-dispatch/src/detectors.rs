//! Proactive detection: turns a [`ProjectStatus`] scan into a list of
//! findings an operator (or autonomy level) might want to act on — a stale
//! branch, a branch sitting ahead of main, a broken test suite.

use std::fmt;

use overlord_governance::autonomy::AutonomyEngine;
use overlord_types::{ActionScope, ScopeImpact};

use crate::scanner::ProjectStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
        };
        write!(f, "{label}")
    }
}

#[derive(Debug, Clone)]
pub struct DetectionResult {
    pub detector: &'static str,
    pub project: String,
    pub severity: Severity,
    pub description: String,
    pub proposed_action: String,
}

trait Detector {
    fn name(&self) -> &'static str;
    fn detect(&self, status: &ProjectStatus) -> Vec<DetectionResult>;
}

/// Flags local branches with no commits in `threshold_days`.
struct StaleBranchDetector {
    threshold_days: i64,
}

impl Detector for StaleBranchDetector {
    fn name(&self) -> &'static str {
        "stale_branch"
    }

    fn detect(&self, status: &ProjectStatus) -> Vec<DetectionResult> {
        status
            .git
            .stale_branches
            .iter()
            .map(|branch| DetectionResult {
                detector: self.name(),
                project: status.name.clone(),
                severity: Severity::Low,
                description: format!("branch '{branch}' has no activity in over {} days", self.threshold_days),
                proposed_action: format!("delete stale branch '{branch}' in {}", status.name),
            })
            .collect()
    }
}

/// Flags a branch that has diverged from its remote tracking branch by a
/// meaningful number of commits without being pushed.
struct AheadOfMainDetector {
    threshold_commits: u32,
}

impl Detector for AheadOfMainDetector {
    fn name(&self) -> &'static str {
        "ahead_of_main"
    }

    fn detect(&self, status: &ProjectStatus) -> Vec<DetectionResult> {
        if status.git.ahead >= self.threshold_commits {
            vec![DetectionResult {
                detector: self.name(),
                project: status.name.clone(),
                severity: if status.git.ahead >= self.threshold_commits * 3 { Severity::Medium } else { Severity::Low },
                description: format!("'{}' is {} commit(s) ahead of its remote", status.git.branch, status.git.ahead),
                proposed_action: format!("push {} in {}", status.git.branch, status.name),
            }]
        } else {
            Vec::new()
        }
    }
}

/// Flags projects with a detectable test suite but no recent green run —
/// the scanner can only confirm a test command exists, not that it passes,
/// so this surfaces as a reminder rather than a hard failure.
struct FailingTestDetector;

impl Detector for FailingTestDetector {
    fn name(&self) -> &'static str {
        "missing_test_infra"
    }

    fn detect(&self, status: &ProjectStatus) -> Vec<DetectionResult> {
        if !status.tests.has_tests {
            vec![DetectionResult {
                detector: self.name(),
                project: status.name.clone(),
                severity: Severity::Medium,
                description: "no test command could be detected".to_string(),
                proposed_action: format!("add test tooling to {}", status.name),
            }]
        } else {
            Vec::new()
        }
    }
}

/// Runs the registered detectors over a set of scans and filters the
/// results against the configured autonomy level before they're surfaced.
pub struct DetectionEngine<'a> {
    autonomy: &'a AutonomyEngine<'a>,
    detectors: Vec<Box<dyn Detector + Send + Sync>>,
}

impl<'a> DetectionEngine<'a> {
    pub fn new(autonomy: &'a AutonomyEngine<'a>) -> Self {
        Self {
            autonomy,
            detectors: vec![
                Box::new(StaleBranchDetector { threshold_days: 30 }),
                Box::new(AheadOfMainDetector { threshold_commits: 5 }),
                Box::new(FailingTestDetector),
            ],
        }
    }

    pub fn run_all(&self, statuses: &[ProjectStatus]) -> Vec<DetectionResult> {
        statuses.iter().flat_map(|status| self.detectors.iter().flat_map(|d| d.detect(status))).collect()
    }

    /// Drops findings that the current autonomy level wouldn't even propose,
    /// so a `cautious`-level ecosystem doesn't spam findings nobody asked
    /// for while still surfacing everything a `proactive`/`scheduled` one
    /// would act on or flag.
    pub fn filter_by_autonomy(&self, results: Vec<DetectionResult>) -> Vec<DetectionResult> {
        results
            .into_iter()
            .filter(|r| {
                let scope = detection_scope(r);
                self.autonomy.should_propose(&r.proposed_action, &scope, Some(&r.project)) || r.severity == Severity::High
            })
            .collect()
    }

    pub fn format_summary(&self, results: &[DetectionResult]) -> String {
        if results.is_empty() {
            return "No findings — ecosystem looks clean.".to_string();
        }

        let mut lines = vec![format!("{} finding(s):", results.len())];
        for r in results {
            lines.push(format!("  [{}] {} — {} ({})", r.severity, r.project, r.description, r.detector));
        }
        lines.join("\n")
    }
}

fn detection_scope(result: &DetectionResult) -> ActionScope {
    let impact = match result.severity {
        Severity::Low => ScopeImpact::Low,
        Severity::Medium => ScopeImpact::Medium,
        Severity::High => ScopeImpact::High,
    };
    ActionScope {
        projects: vec![result.project.clone()],
        branches: vec![],
        destructive: false,
        reversible: true,
        affects_remote: result.detector == "ahead_of_main",
        estimated_impact: impact,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::{GitState, TestHealth};
    use overlord_config::AutonomyConfig;

    fn status(name: &str) -> ProjectStatus {
        ProjectStatus {
            name: name.to_string(),
            git: GitState { branch: "develop".to_string(), clean: true, ahead: 0, behind: 0, ..Default::default() },
            tests: TestHealth { has_tests: true, test_command: Some("make test".to_string()) },
            issues: vec![],
        }
    }

    #[test]
    fn stale_branch_detector_reports_each_branch() {
        let mut s = status("core");
        s.git.stale_branches = vec!["old-feature".to_string()];
        let autonomy_config = AutonomyConfig::default();
        let autonomy = AutonomyEngine::new(&autonomy_config);
        let engine = DetectionEngine::new(&autonomy);
        let results = engine.run_all(&[s]);
        assert!(results.iter().any(|r| r.detector == "stale_branch"));
    }

    #[test]
    fn missing_test_infra_flagged_when_no_test_command() {
        let mut s = status("core");
        s.tests = TestHealth { has_tests: false, test_command: None };
        let autonomy_config = AutonomyConfig::default();
        let autonomy = AutonomyEngine::new(&autonomy_config);
        let engine = DetectionEngine::new(&autonomy);
        let results = engine.run_all(&[s]);
        assert!(results.iter().any(|r| r.detector == "missing_test_infra"));
    }

    #[test]
    fn format_summary_reports_clean_ecosystem() {
        let autonomy_config = AutonomyConfig::default();
        let autonomy = AutonomyEngine::new(&autonomy_config);
        let engine = DetectionEngine::new(&autonomy);
        assert!(engine.format_summary(&[]).contains("No findings"));
    }
}
