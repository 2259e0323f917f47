//! # Stage: Planner
//!
//! ## Responsibility
//! Turns a capability request into a scored [`DecisionCard`]. Gathers the
//! current axioms, the avoidance rules and the latest metabolism, hands them to
//! a [`ProposalGenerator`], then validates and scores what comes back.
//!
//! ## Guarantees
//! - Every returned card has a non-empty id, finite gains, `risk_score ∈ [0, 1]`
//!   and a `risk_adjusted_reward` computed by the goal engine, never trusted
//!   from the generator
//! - No lock is held while the generator runs
//!
//! ## NOT Responsible For
//! - Enforcing avoidance rules: they are advisory input to the generator

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{KernelError, Result};
use crate::self_modify::memory::{AvoidanceRule, MemoryConsolidator};
use crate::self_tune::goal_engine::{GoalEngine, PrimeAxiom};
use crate::self_tune::homeostasis::{HomeostasisMonitor, SystemMetabolism};

// ---------------------------------------------------------------------------
// DecisionCard
// ---------------------------------------------------------------------------

/// A structured candidate change. Immutable once the planner returns it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DecisionCard {
    pub id: String,
    pub target_module: String,
    pub rationale: String,
    pub action_description: String,
    pub predicted_epsilon_gain: f64,
    pub predicted_i_gain: f64,
    pub risk_score: f64,
    pub risk_adjusted_reward: f64,
    /// File name the artifact is persisted under.
    pub target_file: String,
    pub generated_artifact: String,
    /// Change applied to the host's entry-point registration on merge.
    pub integration_patch: String,
    pub test_suite: String,
    pub dependency_manifest: String,
}

impl DecisionCard {
    /// Every field that carries change content, for policy scanning.
    pub fn change_payloads(&self) -> [(&'static str, &str); 5] {
        [
            ("action_description", &self.action_description),
            ("generated_artifact", &self.generated_artifact),
            ("integration_patch", &self.integration_patch),
            ("test_suite", &self.test_suite),
            ("dependency_manifest", &self.dependency_manifest),
        ]
    }

    fn validate(&self) -> Result<()> {
        let invalid = |reason: String| Err(KernelError::Generation { reason });
        if self.target_module.trim().is_empty() {
            return invalid("card has no target module".into());
        }
        if !self.predicted_epsilon_gain.is_finite() || !self.predicted_i_gain.is_finite() {
            return invalid(format!(
                "non-finite predicted gains ({}, {})",
                self.predicted_epsilon_gain, self.predicted_i_gain
            ));
        }
        if !(0.0..=1.0).contains(&self.risk_score) {
            return invalid(format!("risk score {} outside [0, 1]", self.risk_score));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ProposalGenerator
// ---------------------------------------------------------------------------

/// Everything the generator is told about the kernel's state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub capability: String,
    pub axioms: PrimeAxiom,
    pub avoidance_rules: Vec<AvoidanceRule>,
    pub metabolism: SystemMetabolism,
}

/// External capability that drafts candidate changes. May be slow or fail.
#[async_trait]
pub trait ProposalGenerator: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(&self, request: &GenerationRequest) -> Result<DecisionCard>;
}

/// Returns a copy of a fixed card and remembers the last request it saw.
pub struct StaticGenerator {
    card: DecisionCard,
    last_request: Mutex<Option<GenerationRequest>>,
}

impl StaticGenerator {
    pub fn new(card: DecisionCard) -> Self {
        Self { card, last_request: Mutex::new(None) }
    }

    pub fn last_request(&self) -> Option<GenerationRequest> {
        self.last_request.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl ProposalGenerator for StaticGenerator {
    fn name(&self) -> &str {
        "static"
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<DecisionCard> {
        *self.last_request.lock().unwrap_or_else(PoisonError::into_inner) = Some(request.clone());
        Ok(self.card.clone())
    }
}

/// Always fails with the given reason.
pub struct FailingGenerator(pub String);

#[async_trait]
impl ProposalGenerator for FailingGenerator {
    fn name(&self) -> &str {
        "failing"
    }

    async fn generate(&self, _request: &GenerationRequest) -> Result<DecisionCard> {
        Err(KernelError::Generation { reason: self.0.clone() })
    }
}

// ---------------------------------------------------------------------------
// Planner
// ---------------------------------------------------------------------------

pub struct Planner {
    generator: Arc<dyn ProposalGenerator>,
    goal_engine: Arc<GoalEngine>,
    memory: MemoryConsolidator,
    homeostasis: Option<HomeostasisMonitor>,
}

impl Planner {
    pub fn new(
        generator: Arc<dyn ProposalGenerator>,
        goal_engine: Arc<GoalEngine>,
        memory: MemoryConsolidator,
    ) -> Self {
        Self { generator, goal_engine, memory, homeostasis: None }
    }

    /// Forward the monitor's latest snapshot to the generator on every request.
    pub fn with_homeostasis(mut self, monitor: HomeostasisMonitor) -> Self {
        self.homeostasis = Some(monitor);
        self
    }

    pub fn generator_name(&self) -> &str {
        self.generator.name()
    }

    pub async fn plan(&self, capability: &str) -> Result<DecisionCard> {
        let request = GenerationRequest {
            capability: capability.to_string(),
            axioms: self.goal_engine.metrics(),
            avoidance_rules: self.memory.rules(),
            metabolism: self.homeostasis.as_ref().map(|h| h.current()).unwrap_or_default(),
        };

        let mut card = self.generator.generate(&request).await?;
        card.validate()?;
        if card.id.trim().is_empty() {
            card.id = uuid::Uuid::new_v4().to_string();
        }
        card.risk_adjusted_reward = self.goal_engine.risk_adjusted_reward(
            card.predicted_epsilon_gain,
            card.predicted_i_gain,
            card.risk_score,
        );

        if self.memory.is_avoided(&card.target_module) {
            tracing::warn!(
                target: "kernel::orchestrator",
                proposal_id = %card.id,
                module = %card.target_module,
                "generator targeted a module with an avoidance rule"
            );
        }
        Ok(card)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub fn make_card(target: &str, artifact: &str) -> DecisionCard {
    DecisionCard {
        id: String::new(),
        target_module: target.to_string(),
        rationale: "Detected anomaly: slow path. A refactoring is proposed.".into(),
        action_description: format!("Improve {target}"),
        predicted_epsilon_gain: 0.08,
        predicted_i_gain: 0.02,
        risk_score: 0.5,
        risk_adjusted_reward: 99.0,
        target_file: format!("{}.rs", target.to_lowercase()),
        generated_artifact: artifact.to_string(),
        integration_patch: format!("register {target}"),
        test_suite: "ok".into(),
        dependency_manifest: String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GoalEngineConfig, HomeostasisConfig, MemoryConfig};
    use crate::self_tune::homeostasis::FixedProbe;
    use std::time::Duration;

    fn goal_engine() -> Arc<GoalEngine> {
        Arc::new(GoalEngine::new(&GoalEngineConfig::default()))
    }

    fn memory() -> MemoryConsolidator {
        MemoryConsolidator::spawn(&MemoryConfig { dream_delay_ms: 0 })
    }

    #[tokio::test]
    async fn test_plan_recomputes_rar() {
        let gen = Arc::new(StaticGenerator::new(make_card("Cache", "fn a() {}")));
        let planner = Planner::new(gen, goal_engine(), memory());
        let card = planner.plan("speed up cache").await.unwrap();
        assert!((card.risk_adjusted_reward - 0.05).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_plan_assigns_id_when_missing() {
        let gen = Arc::new(StaticGenerator::new(make_card("Cache", "")));
        let planner = Planner::new(gen, goal_engine(), memory());
        let a = planner.plan("x").await.unwrap();
        let b = planner.plan("x").await.unwrap();
        assert!(!a.id.is_empty());
        assert_ne!(a.id, b.id);
    }

    #[tokio::test]
    async fn test_plan_keeps_generator_id() {
        let mut card = make_card("Cache", "");
        card.id = "prop-1".into();
        let planner = Planner::new(Arc::new(StaticGenerator::new(card)), goal_engine(), memory());
        assert_eq!(planner.plan("x").await.unwrap().id, "prop-1");
    }

    #[tokio::test]
    async fn test_plan_rejects_out_of_range_risk() {
        let mut card = make_card("Cache", "");
        card.risk_score = 1.5;
        let planner = Planner::new(Arc::new(StaticGenerator::new(card)), goal_engine(), memory());
        let err = planner.plan("x").await.unwrap_err();
        assert!(matches!(err, KernelError::Generation { .. }));
    }

    #[tokio::test]
    async fn test_plan_rejects_missing_target() {
        let card = make_card("  ", "");
        let planner = Planner::new(Arc::new(StaticGenerator::new(card)), goal_engine(), memory());
        assert!(planner.plan("x").await.is_err());
    }

    #[tokio::test]
    async fn test_plan_propagates_generator_failure() {
        let planner = Planner::new(
            Arc::new(FailingGenerator("model offline".into())),
            goal_engine(),
            memory(),
        );
        let err = planner.plan("x").await.unwrap_err();
        assert_eq!(err.to_string(), "proposal generation failed: model offline");
    }

    #[tokio::test]
    async fn test_plan_forwards_rules_and_metabolism() {
        let mem = memory();
        mem.consolidate(vec![make_card("Indexer", "")]);
        mem.flush().await;

        let monitor = HomeostasisMonitor::new(HomeostasisConfig::default(), Box::new(FixedProbe(33.0)));
        monitor.record_latency(Duration::from_millis(40));
        monitor.sample_once();

        let gen = Arc::new(StaticGenerator::new(make_card("Cache", "")));
        let planner = Planner::new(gen.clone(), goal_engine(), mem).with_homeostasis(monitor);
        planner.plan("index faster").await.unwrap();

        let req = gen.last_request().unwrap();
        assert_eq!(req.capability, "index faster");
        assert_eq!(req.avoidance_rules.len(), 1);
        assert_eq!(req.avoidance_rules[0].target_module, "Indexer");
        assert_eq!(req.metabolism.memory_saturation, 33.0);
        assert!(req.axioms.is_bounded());
    }

    #[test]
    fn test_change_payloads_cover_every_change_field() {
        let card = make_card("Cache", "artifact");
        let names: Vec<_> = card.change_payloads().iter().map(|(n, _)| *n).collect();
        assert_eq!(
            names,
            ["action_description", "generated_artifact", "integration_patch", "test_suite", "dependency_manifest"]
        );
    }
}
