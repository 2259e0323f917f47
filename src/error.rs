//! Crate-level error taxonomy.
//!
//! Every pipeline stage reports its failure as a [`KernelError`]; the
//! orchestrator records the first one verbatim on the task and halts.

use std::time::Duration;

use thiserror::Error;

use crate::self_modify::invariants::InvariantClass;
use crate::self_modify::merge::IntegrationStep;
use crate::self_modify::verify::VerificationKind;

pub type Result<T> = std::result::Result<T, KernelError>;

#[derive(Error, Debug)]
pub enum KernelError {
    /// The proposal generator failed or returned an unusable card.
    #[error("proposal generation failed: {reason}")]
    Generation { reason: String },

    /// The invariant checker rejected the card. `reason` is the checker's own text.
    #[error("{reason}")]
    PolicyViolation { class: InvariantClass, reason: String },

    #[error("verification failed ({kind}): {reason}")]
    Verification { kind: VerificationKind, reason: String },

    #[error("integration failed at {step}: {reason}")]
    Integration { step: IntegrationStep, reason: String },

    #[error("stage '{stage}' timed out after {after:?}")]
    Timeout { stage: &'static str, after: Duration },

    #[error("REJECTED: reviewer declined proposal: {reason}")]
    ReviewDeclined { reason: String },

    #[error("review window expired before a decision was made")]
    ReviewExpired,

    #[error("pipeline aborted: {0}")]
    Aborted(String),

    // Infra
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("telemetry read failed: {0}")]
    Telemetry(String),
}

impl KernelError {
    /// Whether this failure says something about the proposal itself, and so
    /// should be consolidated into an avoidance rule for its target module.
    ///
    /// Infrastructure failures (I/O, timeouts, harness crashes) say nothing
    /// about the quality of the proposal and are not learned from.
    pub fn feeds_memory(&self) -> bool {
        match self {
            KernelError::PolicyViolation { .. } | KernelError::ReviewDeclined { .. } => true,
            KernelError::Verification { kind, .. } => kind.is_proposal_fault(),
            _ => false,
        }
    }

    /// Short stable label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            KernelError::Generation { .. } => "generation",
            KernelError::PolicyViolation { .. } => "policy_violation",
            KernelError::Verification { .. } => "verification",
            KernelError::Integration { .. } => "integration",
            KernelError::Timeout { .. } => "timeout",
            KernelError::ReviewDeclined { .. } => "review_declined",
            KernelError::ReviewExpired => "review_expired",
            KernelError::Aborted(_) => "aborted",
            KernelError::Storage(_) => "storage",
            KernelError::Io(_) => "io",
            KernelError::Json(_) => "json",
            KernelError::Config(_) => "config",
            KernelError::Http(_) => "http",
            KernelError::Telemetry(_) => "telemetry",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_violation_displays_reason_verbatim() {
        let e = KernelError::PolicyViolation {
            class: InvariantClass::Oversight,
            reason: "REJECTED: Proposal attempts to modify the human oversight mechanism.".into(),
        };
        assert_eq!(
            e.to_string(),
            "REJECTED: Proposal attempts to modify the human oversight mechanism."
        );
    }

    #[test]
    fn test_feeds_memory_for_proposal_faults() {
        let policy = KernelError::PolicyViolation {
            class: InvariantClass::Transparency,
            reason: "x".into(),
        };
        let tests = KernelError::Verification {
            kind: VerificationKind::TestFailure,
            reason: "x".into(),
        };
        let deps = KernelError::Verification {
            kind: VerificationKind::DependencyRisk,
            reason: "x".into(),
        };
        let declined = KernelError::ReviewDeclined { reason: "no".into() };
        assert!(policy.feeds_memory());
        assert!(tests.feeds_memory());
        assert!(deps.feeds_memory());
        assert!(declined.feeds_memory());
    }

    #[test]
    fn test_infra_failures_do_not_feed_memory() {
        let harness = KernelError::Verification {
            kind: VerificationKind::Harness,
            reason: "runner crashed".into(),
        };
        let merge = KernelError::Integration {
            step: IntegrationStep::Persist,
            reason: "disk full".into(),
        };
        let timeout = KernelError::Timeout { stage: "verify", after: Duration::from_secs(1) };
        assert!(!harness.feeds_memory());
        assert!(!merge.feeds_memory());
        assert!(!timeout.feeds_memory());
        assert!(!KernelError::Generation { reason: "x".into() }.feeds_memory());
        assert!(!KernelError::ReviewExpired.feeds_memory());
    }

    #[test]
    fn test_integration_error_names_step() {
        let e = KernelError::Integration {
            step: IntegrationStep::Register,
            reason: "registry offline".into(),
        };
        assert!(e.to_string().contains("entry-point registration"));
        assert_eq!(e.kind(), "integration");
    }
}
