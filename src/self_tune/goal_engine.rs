//! # Stage: Goal Engine
//!
//! ## Responsibility
//! Owns the two intrinsic performance axioms (compression efficiency and
//! knowledge integration), scores proposals with the risk-adjusted reward, and
//! reinforces the axioms after every successful merge.
//!
//! ## Guarantees
//! - Bounded: both axioms are clamped to `[0, 1]` after every update
//! - Encapsulated: the axioms are only mutated through `metrics()`,
//!   `reinforce()` and the background estimator; callers get copies
//! - Thread-safe: `Send + Sync`, share via `Arc<GoalEngine>`
//!
//! ## NOT Responsible For
//! - Real introspection: `metrics()` models drift as a bounded random walk

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::config::GoalEngineConfig;
use crate::self_modify::merge::MergeResult;

// ---------------------------------------------------------------------------
// PrimeAxiom
// ---------------------------------------------------------------------------

/// The system's two intrinsic performance signals.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PrimeAxiom {
    /// Signal-to-noise of the internal model, in `[0, 1]`.
    pub compression_efficiency: f64,
    /// Unified understanding across facts, in `[0, 1]`.
    pub knowledge_integration: f64,
}

impl PrimeAxiom {
    /// Build an axiom pair, clamping both values into `[0, 1]`.
    pub fn new(compression_efficiency: f64, knowledge_integration: f64) -> Self {
        let mut a = Self { compression_efficiency, knowledge_integration };
        a.clamp();
        a
    }

    fn clamp(&mut self) {
        self.compression_efficiency = clamp_unit(self.compression_efficiency);
        self.knowledge_integration = clamp_unit(self.knowledge_integration);
    }

    pub fn is_bounded(&self) -> bool {
        (0.0..=1.0).contains(&self.compression_efficiency)
            && (0.0..=1.0).contains(&self.knowledge_integration)
    }
}

/// Clamp into `[0, 1]`. NaN collapses to 0 so the bound can never be escaped.
fn clamp_unit(v: f64) -> f64 {
    if v.is_nan() {
        0.0
    } else {
        v.clamp(0.0, 1.0)
    }
}

/// `(ε gain + I gain) * (1 - risk)`.
///
/// Defined for `risk_score ∈ [0, 1]`; callers own that precondition.
pub fn risk_adjusted_reward(predicted_epsilon_gain: f64, predicted_i_gain: f64, risk_score: f64) -> f64 {
    (predicted_epsilon_gain + predicted_i_gain) * (1.0 - risk_score)
}

// ---------------------------------------------------------------------------
// GoalEngine
// ---------------------------------------------------------------------------

pub struct GoalEngine {
    axiom: Mutex<PrimeAxiom>,
    walk_step: f64,
    reinforcement_factor: f64,
}

impl GoalEngine {
    pub fn new(config: &GoalEngineConfig) -> Self {
        Self {
            axiom: Mutex::new(PrimeAxiom::new(
                config.compression_efficiency,
                config.knowledge_integration,
            )),
            walk_step: config.walk_step,
            reinforcement_factor: config.reinforcement_factor,
        }
    }

    /// Current axioms without applying the walk.
    pub fn snapshot(&self) -> PrimeAxiom {
        *self.axiom.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Re-estimate the axioms and return the new values.
    pub fn metrics(&self) -> PrimeAxiom {
        self.metrics_with(&mut rand::thread_rng())
    }

    /// [`metrics`](Self::metrics) with a caller-supplied RNG (deterministic tests).
    pub fn metrics_with<R: Rng + ?Sized>(&self, rng: &mut R) -> PrimeAxiom {
        let d_eps = (rng.gen::<f64>() - 0.5) * self.walk_step;
        let d_int = (rng.gen::<f64>() - 0.5) * self.walk_step;
        let mut guard = self.axiom.lock().unwrap_or_else(PoisonError::into_inner);
        guard.compression_efficiency += d_eps;
        guard.knowledge_integration += d_int;
        guard.clamp();
        *guard
    }

    pub fn risk_adjusted_reward(
        &self,
        predicted_epsilon_gain: f64,
        predicted_i_gain: f64,
        risk_score: f64,
    ) -> f64 {
        risk_adjusted_reward(predicted_epsilon_gain, predicted_i_gain, risk_score)
    }

    /// Scale both axioms by the reinforcement factor after a successful merge.
    ///
    /// Must only be called for successful merges; a failed result is ignored.
    pub fn reinforce(&self, result: &MergeResult) -> PrimeAxiom {
        let mut guard = self.axiom.lock().unwrap_or_else(PoisonError::into_inner);
        if !result.success {
            tracing::debug!(
                target: "kernel::goal_engine",
                request = %result.original_request,
                "reinforce called with an unsuccessful merge; ignoring"
            );
            return *guard;
        }
        guard.compression_efficiency *= self.reinforcement_factor;
        guard.knowledge_integration *= self.reinforcement_factor;
        guard.clamp();
        tracing::info!(
            target: "kernel::goal_engine",
            compression_efficiency = guard.compression_efficiency,
            knowledge_integration = guard.knowledge_integration,
            "axioms reinforced"
        );
        *guard
    }

    /// Spawn the periodic re-estimation loop.
    pub fn spawn_estimator(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let a = engine.metrics();
                tracing::trace!(
                    target: "kernel::goal_engine",
                    compression_efficiency = a.compression_efficiency,
                    knowledge_integration = a.knowledge_integration,
                    "axioms re-estimated"
                );
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
