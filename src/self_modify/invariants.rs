//! # Stage: Invariant Checker
//!
//! ## Responsibility
//! Stateless policy gate. Rejects any [`DecisionCard`] whose change payload
//! references a protected identifier of the human-oversight, transparency or
//! self-monitoring mechanisms.
//!
//! ## Guarantees
//! - Fixed order: oversight, then transparency, then self-preservation; the
//!   first match short-circuits with that class's reason
//! - Separator and case insensitive: `proposals_handler`, `proposalsHandler`
//!   and `PROPOSALS-HANDLER` are the same identifier
//! - Every change-bearing field of the card is scanned
//!
//! ## NOT Responsible For
//! - Semantic analysis. This is substring containment over normalized text and
//!   can be evaded by indirection (string building, aliasing); a symbol-level
//!   check over a structured diff should replace it before unattended use

use serde::{Deserialize, Serialize};

use crate::config::InvariantsConfig;
use crate::error::{KernelError, Result};
use crate::self_modify::planner::DecisionCard;

pub const PASS_REASON: &str = "PASSED: Proposal satisfies all invariants.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvariantClass {
    Oversight,
    Transparency,
    SelfPreservation,
}

impl InvariantClass {
    /// Evaluation order.
    pub const ORDER: [InvariantClass; 3] = [
        InvariantClass::Oversight,
        InvariantClass::Transparency,
        InvariantClass::SelfPreservation,
    ];

    pub fn rejection_reason(self) -> &'static str {
        match self {
            InvariantClass::Oversight => {
                "REJECTED: Proposal attempts to modify the human oversight mechanism."
            }
            InvariantClass::Transparency => {
                "REJECTED: Proposal attempts to modify transparency mechanisms."
            }
            InvariantClass::SelfPreservation => {
                "REJECTED: Proposal attempts to modify core cognitive functions."
            }
        }
    }
}

impl std::fmt::Display for InvariantClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InvariantClass::Oversight => write!(f, "oversight"),
            InvariantClass::Transparency => write!(f, "transparency"),
            InvariantClass::SelfPreservation => write!(f, "self-preservation"),
        }
    }
}

/// Outcome of [`InvariantChecker::check`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InvariantVerdict {
    pub accepted: bool,
    pub reason: String,
    pub violated: Option<InvariantClass>,
    /// `(identifier, field)` that triggered the rejection.
    pub matched: Option<(String, &'static str)>,
}

impl InvariantVerdict {
    fn pass() -> Self {
        Self { accepted: true, reason: PASS_REASON.to_string(), violated: None, matched: None }
    }
}

/// Lowercase and drop `_` / `-` so identifier spellings collapse together.
pub fn normalize(text: &str) -> String {
    text.chars()
        .filter(|c| *c != '_' && *c != '-')
        .flat_map(char::to_lowercase)
        .collect()
}

#[derive(Debug, Clone)]
pub struct InvariantChecker {
    /// `(class, [(original, normalized)])` in evaluation order.
    registry: Vec<(InvariantClass, Vec<(String, String)>)>,
}

impl InvariantChecker {
    pub fn new(cfg: &InvariantsConfig) -> Self {
        let entries = |ids: &[String]| -> Vec<(String, String)> {
            ids.iter()
                .map(|id| (id.clone(), normalize(id)))
                .filter(|(_, n)| !n.is_empty())
                .collect()
        };
        let registry = InvariantClass::ORDER
            .iter()
            .map(|class| {
                let ids = match class {
                    InvariantClass::Oversight => &cfg.oversight,
                    InvariantClass::Transparency => &cfg.transparency,
                    InvariantClass::SelfPreservation => &cfg.self_preservation,
                };
                (*class, entries(ids))
            })
            .collect();
        Self { registry }
    }

    pub fn protected_identifiers(&self, class: InvariantClass) -> Vec<&str> {
        self.registry
            .iter()
            .filter(|(c, _)| *c == class)
            .flat_map(|(_, ids)| ids.iter().map(|(orig, _)| orig.as_str()))
            .collect()
    }

    pub fn check(&self, card: &DecisionCard) -> InvariantVerdict {
        let fields: Vec<(&'static str, String)> = card
            .change_payloads()
            .iter()
            .map(|(name, text)| (*name, normalize(text)))
            .collect();

        for (class, ids) in &self.registry {
            for (orig, needle) in ids {
                if let Some((field, _)) = fields.iter().find(|(_, hay)| hay.contains(needle.as_str())) {
                    return InvariantVerdict {
                        accepted: false,
                        reason: class.rejection_reason().to_string(),
                        violated: Some(*class),
                        matched: Some((orig.clone(), *field)),
                    };
                }
            }
        }
        InvariantVerdict::pass()
    }

    /// [`check`](Self::check) as a pipeline stage.
    pub fn gate(&self, card: &DecisionCard) -> Result<InvariantVerdict> {
        let verdict = self.check(card);
        match verdict.violated {
            None => Ok(verdict),
            Some(class) => {
                if let Some((id, field)) = &verdict.matched {
                    tracing::info!(
                        target: "kernel::orchestrator",
                        proposal_id = %card.id,
                        class = %class,
                        identifier = %id,
                        field = *field,
                        "invariant violated"
                    );
                }
                Err(KernelError::PolicyViolation { class, reason: verdict.reason })
            }
        }
    }
}

impl Default for InvariantChecker {
    fn default() -> Self {
        Self::new(&InvariantsConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
