//! # Stage: Verifier
//!
//! ## Responsibility
//! Technical gate for a proposal that already passed the invariant checker.
//!
//! Check pipeline (in order):
//! 1. `tests`: the card's test suite is run against its artifact by a
//!    [`TestHarness`]; any failure is a hard fail
//! 2. `dependency_scan`: the artifact and its dependency manifest are
//!    scanned for deny-listed risky capabilities (process execution and the
//!    like); a match is a hard fail regardless of test outcome
//!
//! ## Guarantees
//! - Binary: either every check passes or the first failure is returned
//! - Side-effect free on caller state
//! - Harness crashes are reported as [`VerificationKind::Harness`], distinct
//!   from a failing suite
//!
//! ## NOT Responsible For
//! - Sandboxing: harness implementations own isolation of whatever they run

use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::config::VerifierConfig;
use crate::error::{KernelError, Result};
use crate::self_modify::invariants::normalize;
use crate::self_modify::planner::DecisionCard;

// ---------------------------------------------------------------------------
// Check result types
// ---------------------------------------------------------------------------

/// The outcome of a single check.
#[derive(Debug, Clone, PartialEq)]
pub enum CheckStatus {
    Passed,
    Failed { reason: String },
}

impl CheckStatus {
    pub fn is_passed(&self) -> bool {
        matches!(self, CheckStatus::Passed)
    }
}

impl std::fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckStatus::Passed => write!(f, "PASS"),
            CheckStatus::Failed { reason } => write!(f, "FAIL: {}", reason),
        }
    }
}

/// Result of one named check.
#[derive(Debug, Clone)]
pub struct CheckResult {
    pub name: String,
    pub status: CheckStatus,
    pub duration: Duration,
    /// Extra diagnostic output (failing test names, matched markers).
    pub details: Vec<String>,
}

impl CheckResult {
    pub fn passed(name: impl Into<String>, duration: Duration) -> Self {
        Self { name: name.into(), status: CheckStatus::Passed, duration, details: vec![] }
    }

    pub fn failed(name: impl Into<String>, reason: impl Into<String>, duration: Duration) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Failed { reason: reason.into() },
            duration,
            details: vec![],
        }
    }

    pub fn with_details(mut self, details: Vec<String>) -> Self {
        self.details = details;
        self
    }
}

/// Which check a verification failure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VerificationKind {
    TestFailure,
    DependencyRisk,
    /// The harness itself broke; says nothing about the proposal.
    Harness,
}

impl VerificationKind {
    pub fn is_proposal_fault(self) -> bool {
        matches!(self, VerificationKind::TestFailure | VerificationKind::DependencyRisk)
    }
}

impl std::fmt::Display for VerificationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VerificationKind::TestFailure => write!(f, "test failure"),
            VerificationKind::DependencyRisk => write!(f, "dependency risk"),
            VerificationKind::Harness => write!(f, "harness error"),
        }
    }
}

/// Per-check audit trail for one passing verification.
#[derive(Debug, Clone)]
pub struct VerificationReport {
    pub target: String,
    pub checks: Vec<CheckResult>,
    pub total_duration: Duration,
}

impl VerificationReport {
    pub fn summary(&self) -> String {
        let checks: Vec<String> =
            self.checks.iter().map(|c| format!("{}={}", c.name, c.status)).collect();
        format!("{}: {} ({}ms)", self.target, checks.join(", "), self.total_duration.as_millis())
    }
}

// ---------------------------------------------------------------------------
// TestHarness
// ---------------------------------------------------------------------------

/// Runs a test suite against an artifact.
///
/// Return `Ok(CheckResult)` with a failed status for failing tests and `Err`
/// only when the harness itself could not run.
#[async_trait]
pub trait TestHarness: Send + Sync {
    async fn run(&self, test_suite: &str, artifact: &str, target: &str) -> Result<CheckResult>;
}

/// Treats every suite as passing. Used until a real harness is wired in.
pub struct AssumePassHarness;

#[async_trait]
impl TestHarness for AssumePassHarness {
    async fn run(&self, _test_suite: &str, _artifact: &str, _target: &str) -> Result<CheckResult> {
        Ok(CheckResult::passed("tests", Duration::ZERO))
    }
}

/// Fixed outcome for pipeline tests.
#[derive(Debug, Clone)]
pub enum ScriptedHarness {
    Pass,
    Fail(String),
    Crash(String),
    /// Never completes; exercises stage timeouts.
    Hang,
}

#[async_trait]
impl TestHarness for ScriptedHarness {
    async fn run(&self, _test_suite: &str, _artifact: &str, _target: &str) -> Result<CheckResult> {
        match self {
            ScriptedHarness::Pass => Ok(CheckResult::passed("tests", Duration::ZERO)),
            ScriptedHarness::Fail(reason) => Ok(CheckResult::failed("tests", reason.clone(), Duration::ZERO)),
            ScriptedHarness::Crash(reason) => Err(KernelError::Verification {
                kind: VerificationKind::Harness,
                reason: reason.clone(),
            }),
            ScriptedHarness::Hang => {
                std::future::pending::<()>().await;
                Ok(CheckResult::passed("tests", Duration::ZERO))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Verifier
// ---------------------------------------------------------------------------

pub struct Verifier {
    harness: Box<dyn TestHarness>,
    /// `(marker as configured, normalized marker)`.
    deny_list: Vec<(String, String)>,
}

impl Verifier {
    pub fn new(cfg: &VerifierConfig, harness: Box<dyn TestHarness>) -> Self {
        let deny_list = cfg
            .deny_list
            .iter()
            .map(|m| (m.clone(), normalize(m)))
            .filter(|(_, n)| !n.is_empty())
            .collect();
        Self { harness, deny_list }
    }

    pub async fn verify_card(&self, card: &DecisionCard) -> Result<VerificationReport> {
        self.verify(
            &card.test_suite,
            &card.generated_artifact,
            &card.dependency_manifest,
            &card.target_module,
        )
        .await
    }

    pub async fn verify(
        &self,
        test_suite: &str,
        artifact: &str,
        dependency_manifest: &str,
        target: &str,
    ) -> Result<VerificationReport> {
        let start = Instant::now();

        let tests = match self.harness.run(test_suite, artifact, target).await {
            Ok(r) => r,
            Err(KernelError::Verification { kind, reason }) => {
                return Err(KernelError::Verification { kind, reason })
            }
            Err(other) => {
                return Err(KernelError::Verification {
                    kind: VerificationKind::Harness,
                    reason: other.to_string(),
                })
            }
        };
        if let CheckStatus::Failed { reason } = &tests.status {
            return Err(KernelError::Verification {
                kind: VerificationKind::TestFailure,
                reason: format!("tests failed for {target}: {reason}"),
            });
        }

        let scan = self.dependency_scan(artifact, dependency_manifest);
        if let CheckStatus::Failed { reason } = &scan.status {
            return Err(KernelError::Verification {
                kind: VerificationKind::DependencyRisk,
                reason: reason.clone(),
            });
        }

        Ok(VerificationReport {
            target: target.to_string(),
            checks: vec![tests, scan],
            total_duration: start.elapsed(),
        })
    }

    /// Markers match case-insensitively and ignoring `_` and `-`, the same
    /// way invariant names are matched.
    fn dependency_scan(&self, artifact: &str, dependency_manifest: &str) -> CheckResult {
        let start = Instant::now();
        let hits: Vec<String> = [("generated_artifact", artifact), ("dependency_manifest", dependency_manifest)]
            .iter()
            .flat_map(|(field, text)| {
                let text = normalize(text);
                self.deny_list
                    .iter()
                    .filter(move |(_, n)| text.contains(n.as_str()))
                    .map(move |(m, _)| format!("{m} in {field}"))
            })
            .collect();
        if hits.is_empty() {
            CheckResult::passed("dependency_scan", start.elapsed())
        } else {
            CheckResult::failed(
                "dependency_scan",
                format!("dependency risk assessment failed: risky import detected ({})", hits[0]),
                start.elapsed(),
            )
            .with_details(hits)
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
