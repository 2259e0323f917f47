//! Kernel configuration, loaded from TOML.
//!
//! Every section carries `#[serde(default)]`, so an empty file (or no file at
//! all) yields a runnable configuration. Durations are expressed in whole
//! seconds/milliseconds in the file and exposed as [`Duration`] accessors.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{KernelError, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct KernelConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub goal_engine: GoalEngineConfig,
    #[serde(default)]
    pub homeostasis: HomeostasisConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub invariants: InvariantsConfig,
    #[serde(default)]
    pub verifier: VerifierConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub generator: GeneratorConfig,
}

impl KernelConfig {
    /// Read, parse and validate a TOML config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| KernelError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        let cfg: KernelConfig =
            toml::from_str(raw).map_err(|e| KernelError::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject configurations that would break a component's contract.
    pub fn validate(&self) -> Result<()> {
        let ge = &self.goal_engine;
        for (name, v) in [
            ("goal_engine.compression_efficiency", ge.compression_efficiency),
            ("goal_engine.knowledge_integration", ge.knowledge_integration),
        ] {
            if !(0.0..=1.0).contains(&v) {
                return Err(KernelError::Config(format!("{name} must be in [0, 1], got {v}")));
            }
        }
        if !(ge.reinforcement_factor > 1.0) {
            return Err(KernelError::Config(format!(
                "goal_engine.reinforcement_factor must be > 1, got {}",
                ge.reinforcement_factor
            )));
        }
        if !(ge.walk_step > 0.0 && ge.walk_step <= 1.0) {
            return Err(KernelError::Config(format!(
                "goal_engine.walk_step must be in (0, 1], got {}",
                ge.walk_step
            )));
        }
        for (name, v) in [
            ("goal_engine.estimate_interval_secs", ge.estimate_interval_secs),
            ("homeostasis.sample_interval_secs", self.homeostasis.sample_interval_secs),
            ("pipeline.stage_timeout_secs", self.pipeline.stage_timeout_secs),
            ("pipeline.review_timeout_secs", self.pipeline.review_timeout_secs),
            ("storage.sync_interval_secs", self.storage.sync_interval_secs),
        ] {
            if v == 0 {
                return Err(KernelError::Config(format!("{name} must be non-zero")));
            }
        }
        if self.homeostasis.latency_window == 0 {
            return Err(KernelError::Config("homeostasis.latency_window must be non-zero".into()));
        }
        if self.pipeline.generation_cost_usd < 0.0 {
            return Err(KernelError::Config("pipeline.generation_cost_usd must be >= 0".into()));
        }
        if self.generator.kind == GeneratorKind::Http && self.generator.endpoint.is_none() {
            return Err(KernelError::Config(
                "generator.endpoint is required when generator.kind = \"http\"".into(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { addr: "127.0.0.1:8080".into() }
    }
}

/// Whether a verified proposal needs a human decision before it is merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ReviewPolicy {
    /// Park verified proposals until a reviewer approves or declines them.
    Required,
    /// Merge as soon as verification passes.
    AutoMerge,
}

impl std::fmt::Display for ReviewPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReviewPolicy::Required => write!(f, "required"),
            ReviewPolicy::AutoMerge => write!(f, "auto_merge"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    pub review: ReviewPolicy,
    pub stage_timeout_secs: u64,
    pub review_timeout_secs: u64,
    /// Flat cost charged to homeostasis for every generation call.
    pub generation_cost_usd: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            review: ReviewPolicy::Required,
            stage_timeout_secs: 30,
            review_timeout_secs: 86_400,
            generation_cost_usd: 0.01,
        }
    }
}

impl PipelineConfig {
    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_secs)
    }

    pub fn review_timeout(&self) -> Duration {
        Duration::from_secs(self.review_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GoalEngineConfig {
    pub compression_efficiency: f64,
    pub knowledge_integration: f64,
    /// Full width of the random walk per sampling (0.01 = ±0.5%).
    pub walk_step: f64,
    pub reinforcement_factor: f64,
    pub estimate_interval_secs: u64,
}

impl Default for GoalEngineConfig {
    fn default() -> Self {
        Self {
            compression_efficiency: 0.75,
            knowledge_integration: 0.85,
            walk_step: 0.01,
            reinforcement_factor: 1.01,
            estimate_interval_secs: 60,
        }
    }
}

impl GoalEngineConfig {
    pub fn estimate_interval(&self) -> Duration {
        Duration::from_secs(self.estimate_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HomeostasisConfig {
    pub sample_interval_secs: u64,
    /// Number of latency samples kept for the rolling mean / p95.
    pub latency_window: usize,
}

impl Default for HomeostasisConfig {
    fn default() -> Self {
        Self { sample_interval_secs: 5, latency_window: 60 }
    }
}

impl HomeostasisConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs(self.sample_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MemoryConfig {
    /// Simulated analysis time spent per consolidation cycle.
    pub dream_delay_ms: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self { dream_delay_ms: 10_000 }
    }
}

impl MemoryConfig {
    pub fn dream_delay(&self) -> Duration {
        Duration::from_millis(self.dream_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct InvariantsConfig {
    pub oversight: Vec<String>,
    pub transparency: Vec<String>,
    pub self_preservation: Vec<String>,
}

impl Default for InvariantsConfig {
    fn default() -> Self {
        Self {
            oversight: vec!["proposals_handler".into()],
            transparency: vec!["format_response".into(), "provenance".into()],
            self_preservation: vec![
                "autonomic_sensor".into(),
                "GoalEngine".into(),
                "InvariantChecker".into(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VerifierConfig {
    pub deny_list: Vec<String>,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            deny_list: vec![
                "\"os/exec\"".into(),
                "std::process".into(),
                "libc::system".into(),
                "libc::exec".into(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: PathBuf,
    pub artifact_dir: PathBuf,
    pub integration_manifest: PathBuf,
    pub sync_interval_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("memory.db"),
            artifact_dir: PathBuf::from("generated"),
            integration_manifest: PathBuf::from("generated/integrations.jsonl"),
            sync_interval_secs: 30,
        }
    }
}

impl StorageConfig {
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum GeneratorKind {
    #[default]
    Simulated,
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GeneratorConfig {
    pub kind: GeneratorKind,
    pub endpoint: Option<String>,
    pub timeout_secs: u64,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self { kind: GeneratorKind::Simulated, endpoint: None, timeout_secs: 60 }
    }
}
