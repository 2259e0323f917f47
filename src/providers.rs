//! Concrete proposal generators.
//!
//! - [`SimulatedGenerator`]: offline stand-in that drafts a refactoring card
//!   for the first candidate module no avoidance rule names
//! - [`HttpProposalGenerator`]: posts the [`GenerationRequest`] as JSON to a
//!   generation service and expects a [`DecisionCard`] back

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use reqwest::Client;

use crate::error::{KernelError, Result};
use crate::self_modify::planner::{DecisionCard, GenerationRequest, ProposalGenerator};

// ---------------------------------------------------------------------------
// SimulatedGenerator
// ---------------------------------------------------------------------------

/// `(module, action)` pairs in preference order.
pub const CANDIDATES: &[(&str, &str)] = &[
    ("HarmonicFoldingEngine", "Refactor compression layer to use a more efficient algorithm."),
    ("MemoryCoreSystem", "Optimize data indexing for faster retrieval."),
];

pub struct SimulatedGenerator {
    rng: Mutex<StdRng>,
}

impl SimulatedGenerator {
    pub fn new() -> Self {
        Self { rng: Mutex::new(StdRng::from_entropy()) }
    }

    pub fn seeded(seed: u64) -> Self {
        Self { rng: Mutex::new(StdRng::seed_from_u64(seed)) }
    }

    /// First candidate no rule mentions; the last one if every candidate is avoided.
    fn pick_target(request: &GenerationRequest) -> (&'static str, &'static str) {
        let avoided = |module: &str| {
            request
                .avoidance_rules
                .iter()
                .any(|r| r.target_module == module || r.description.contains(module))
        };
        CANDIDATES
            .iter()
            .copied()
            .find(|(m, _)| !avoided(m))
            .unwrap_or(CANDIDATES[CANDIDATES.len() - 1])
    }
}

impl Default for SimulatedGenerator {
    fn default() -> Self {
        Self::new()
    }
}

fn snake_case(module: &str) -> String {
    let mut out = String::with_capacity(module.len() + 4);
    for (i, c) in module.chars().enumerate() {
        if c.is_uppercase() && i > 0 {
            out.push('_');
        }
        out.extend(c.to_lowercase());
    }
    out
}

#[async_trait]
impl ProposalGenerator for SimulatedGenerator {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<DecisionCard> {
        let (module, action) = Self::pick_target(request);
        let (eps, gain_i, risk) = {
            let mut rng = self.rng.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            (rng.gen_range(0.0..0.1), rng.gen_range(0.0..0.05), rng.gen_range(0.0..0.25))
        };
        let file = snake_case(module);
        Ok(DecisionCard {
            id: String::new(),
            target_module: module.to_string(),
            rationale: format!("Detected anomaly: {}. A refactoring is proposed.", request.capability),
            action_description: action.to_string(),
            predicted_epsilon_gain: eps,
            predicted_i_gain: gain_i,
            risk_score: risk,
            risk_adjusted_reward: 0.0,
            target_file: format!("{file}.rs"),
            generated_artifact: format!(
                "// {action}\n// request: {}\npub fn optimized() -> bool {{\n    true\n}}\n",
                request.capability
            ),
            integration_patch: format!("pub mod {file};"),
            test_suite: format!("assert!({file}::optimized());"),
            dependency_manifest: String::new(),
        })
    }
}

// ---------------------------------------------------------------------------
// HttpProposalGenerator
// ---------------------------------------------------------------------------

pub struct HttpProposalGenerator {
    client: Client,
    endpoint: String,
}

impl HttpProposalGenerator {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| KernelError::Http(e.to_string()))?;
        Ok(Self { client, endpoint: endpoint.into() })
    }
}

#[async_trait]
impl ProposalGenerator for HttpProposalGenerator {
    fn name(&self) -> &str {
        "http"
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<DecisionCard> {
        let failed = |reason: String| KernelError::Generation { reason };
        let response = self
            .client
            .post(&self.endpoint)
            .header("Content-Type", "application/json")
            .json(request)
            .send()
            .await
            .map_err(|e| failed(format!("request to {} failed: {e}", self.endpoint)))?;

        if !response.status().is_success() {
            return Err(failed(format!("generation service returned HTTP {}", response.status())));
        }

        response
            .json::<DecisionCard>()
            .await
            .map_err(|e| failed(format!("malformed decision card: {e}")))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
