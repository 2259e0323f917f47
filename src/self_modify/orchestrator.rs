//! # Change Orchestrator
//!
//! Drives one capability request through the change loop as an asynchronous
//! [`Task`]:
//!
//! ```text
//! implement(req) ─► Planner ─► ProposalRegistry ─► InvariantChecker ─► Verifier
//!                      ▲                                                 │
//!                      │                                       review gate (optional)
//!                      │                                                 │
//!              MemoryConsolidator ◄── rejected cards          Integrator ─► GoalEngine::reinforce
//! ```
//!
//! ## What It Does
//!
//! 1. Creates a `pending` task and returns its id immediately.
//! 2. Runs the stages strictly in order in a supervised background task.
//! 3. Records the first failure verbatim and halts; nothing is retried.
//! 4. Feeds proposal-quality failures back to the memory consolidator.
//! 5. Reports run latency and generation spend to the homeostasis monitor.
//!
//! A panicking run is caught by its supervisor and fails its task with
//! "pipeline aborted"; it never takes the process down.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::config::{PipelineConfig, ReviewPolicy};
use crate::error::{KernelError, Result};
use crate::self_modify::invariants::InvariantChecker;
use crate::self_modify::memory::{AvoidanceRule, MemoryConsolidator};
use crate::self_modify::merge::{Integrator, MergeResult};
use crate::self_modify::planner::{DecisionCard, Planner};
use crate::self_modify::registry::{ProposalRegistry, Task, TaskRegistry, TaskStatus};
use crate::self_modify::verify::Verifier;
use crate::self_tune::goal_engine::{GoalEngine, PrimeAxiom};
use crate::self_tune::homeostasis::{HomeostasisMonitor, SystemMetabolism};
use crate::store::KernelStore;
use crate::util::now_ms;

// ---------------------------------------------------------------------------
// OrchestratorConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub review: ReviewPolicy,
    /// Bound on generation, verification and merge, each.
    pub stage_timeout: Duration,
    pub review_timeout: Duration,
    /// Spend reported to homeostasis per generation call.
    pub generation_cost_usd: f64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::from(&PipelineConfig::default())
    }
}

impl From<&PipelineConfig> for OrchestratorConfig {
    fn from(p: &PipelineConfig) -> Self {
        Self {
            review: p.review,
            stage_timeout: p.stage_timeout(),
            review_timeout: p.review_timeout(),
            generation_cost_usd: p.generation_cost_usd,
        }
    }
}

// ---------------------------------------------------------------------------
// Client surface
// ---------------------------------------------------------------------------

/// A verified proposal waiting for a human decision.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingReview {
    pub proposal_id: String,
    pub task_id: String,
    pub target_module: String,
    pub risk_adjusted_reward: f64,
    pub queued_at_ms: u64,
}

/// Health readout for dashboards.
#[derive(Debug, Clone, Serialize)]
pub struct Vitals {
    pub axioms: PrimeAxiom,
    pub metabolism: SystemMetabolism,
    pub tasks_pending: usize,
    pub tasks_completed: usize,
    pub tasks_failed: usize,
    pub avoidance_rules: usize,
}

/// Read/write accessors exposed to the outside world. No pipeline logic lives here.
pub trait TaskClient: Send + Sync {
    /// Start a pipeline run for `request` and return the task id.
    fn create_task(&self, request: &str) -> String;
    fn task(&self, id: &str) -> Option<Task>;
    fn proposals(&self) -> Vec<DecisionCard>;
    fn avoidance_rules(&self) -> Vec<AvoidanceRule>;
    fn pending_reviews(&self) -> Vec<PendingReview>;
    /// `false` if no proposal with that id is awaiting review.
    fn approve(&self, proposal_id: &str) -> bool;
    fn decline(&self, proposal_id: &str, reason: &str) -> bool;
    fn vitals(&self) -> Vitals;
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Everything one pipeline run touches.
pub struct PipelineParts {
    pub planner: Planner,
    pub checker: InvariantChecker,
    pub verifier: Verifier,
    pub integrator: Integrator,
    pub goal_engine: Arc<GoalEngine>,
    pub memory: MemoryConsolidator,
    pub homeostasis: Option<HomeostasisMonitor>,
}

enum ReviewDecision {
    Approve,
    Decline(String),
}

struct Shared {
    cfg: OrchestratorConfig,
    parts: PipelineParts,
    tasks: TaskRegistry,
    proposals: ProposalRegistry,
    reviews: Mutex<HashMap<String, (PendingReview, oneshot::Sender<ReviewDecision>)>>,
}

/// Clone freely; all clones drive the same registries.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Shared>,
}

impl Orchestrator {
    pub fn new(cfg: OrchestratorConfig, parts: PipelineParts) -> Self {
        Self {
            inner: Arc::new(Shared {
                cfg,
                parts,
                tasks: TaskRegistry::new(),
                proposals: ProposalRegistry::new(),
                reviews: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Create a pending task and run its pipeline in the background.
    pub fn implement(&self, request: &str) -> String {
        let start = Instant::now();
        let task_id = self.inner.tasks.create(request);
        tracing::info!(target: "kernel::orchestrator", task_id = %task_id, request, "task created");
        tokio::spawn(supervise(Arc::clone(&self.inner), task_id.clone(), request.to_string(), start));
        task_id
    }

    /// Poll until the task is terminal. `None` if the id is unknown.
    pub async fn wait_terminal(&self, task_id: &str, poll: Duration) -> Option<Task> {
        loop {
            let task = self.inner.tasks.get(task_id)?;
            if task.status.is_terminal() {
                return Some(task);
            }
            tokio::time::sleep(poll).await;
        }
    }

    pub fn review_policy(&self) -> ReviewPolicy {
        self.inner.cfg.review
    }

    // ── persistence ────────────────────────────────────────────────────────

    /// Load proposals and avoidance rules saved by a previous run.
    pub async fn restore_from(&self, store: &Arc<KernelStore>) -> Result<()> {
        let s = Arc::clone(store);
        let (proposals, rules) = tokio::task::spawn_blocking(move || -> Result<_> {
            Ok((s.load_proposals()?, s.load_rules()?))
        })
        .await
        .map_err(|e| KernelError::Aborted(format!("restore task failed: {e}")))??;

        let n = proposals.len();
        for card in proposals {
            self.inner.proposals.record(card);
        }
        self.inner.parts.memory.restore(rules);
        tracing::info!(target: "kernel::store", proposals = n, "state restored");
        Ok(())
    }

    /// Push proposals (upsert) and newly learned rules (append) to the store.
    pub async fn sync_to(&self, store: &Arc<KernelStore>) -> Result<(usize, usize)> {
        let proposals = self.inner.proposals.list();
        let memory = self.inner.parts.memory.clone();
        let s = Arc::clone(store);
        tokio::task::spawn_blocking(move || -> Result<(usize, usize)> {
            let saved = s.save_proposals(&proposals)?;
            let persisted = s.rule_count()?;
            let fresh = memory.rules_from(persisted);
            let appended = s.append_rules(persisted, &fresh)?;
            Ok((saved, appended))
        })
        .await
        .map_err(|e| KernelError::Aborted(format!("sync task failed: {e}")))?
    }

    /// Spawn the periodic sync loop.
    pub fn spawn_persistence(&self, store: Arc<KernelStore>, every: Duration) -> JoinHandle<()> {
        let orc = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                match orc.sync_to(&store).await {
                    Ok((proposals, rules)) => tracing::debug!(
                        target: "kernel::store",
                        proposals,
                        rules,
                        "state synchronized"
                    ),
                    Err(e) => tracing::warn!(target: "kernel::store", error = %e, "sync failed"),
                }
            }
        })
    }

    fn decide(&self, proposal_id: &str, decision: ReviewDecision) -> bool {
        let entry = self
            .inner
            .reviews
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(proposal_id);
        match entry {
            Some((_, tx)) => tx.send(decision).is_ok(),
            None => false,
        }
    }
}

impl TaskClient for Orchestrator {
    fn create_task(&self, request: &str) -> String {
        self.implement(request)
    }

    fn task(&self, id: &str) -> Option<Task> {
        self.inner.tasks.get(id)
    }

    fn proposals(&self) -> Vec<DecisionCard> {
        self.inner.proposals.list()
    }

    fn avoidance_rules(&self) -> Vec<AvoidanceRule> {
        self.inner.parts.memory.rules()
    }

    fn pending_reviews(&self) -> Vec<PendingReview> {
        let mut v: Vec<PendingReview> = self
            .inner
            .reviews
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|(r, _)| r.clone())
            .collect();
        v.sort_by_key(|r| r.queued_at_ms);
        v
    }

    fn approve(&self, proposal_id: &str) -> bool {
        self.decide(proposal_id, ReviewDecision::Approve)
    }

    fn decline(&self, proposal_id: &str, reason: &str) -> bool {
        self.decide(proposal_id, ReviewDecision::Decline(reason.to_string()))
    }

    fn vitals(&self) -> Vitals {
        let t = &self.inner.tasks;
        Vitals {
            axioms: self.inner.parts.goal_engine.snapshot(),
            metabolism: self
                .inner
                .parts
                .homeostasis
                .as_ref()
                .map(|h| h.current())
                .unwrap_or_default(),
            tasks_pending: t.count(TaskStatus::Pending),
            tasks_completed: t.count(TaskStatus::Completed),
            tasks_failed: t.count(TaskStatus::Failed),
            avoidance_rules: self.inner.parts.memory.len(),
        }
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

async fn supervise(shared: Arc<Shared>, task_id: String, request: String, start: Instant) {
    let run = tokio::spawn(Arc::clone(&shared).run_pipeline(task_id.clone(), request, start));
    if let Err(e) = run.await {
        let cause = if e.is_panic() { "run panicked" } else { "run cancelled" };
        shared
            .reviews
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|_, (r, _)| r.task_id != task_id);
        shared.fail(&task_id, None, KernelError::Aborted(cause.to_string()));
        tracing::error!(target: "kernel::orchestrator", task_id = %task_id, cause, "pipeline run aborted");
    }
    if let Some(h) = &shared.parts.homeostasis {
        h.record_latency(start.elapsed());
    }
}

impl Shared {
    async fn bounded<T>(&self, stage: &'static str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        let after = self.cfg.stage_timeout;
        tokio::time::timeout(after, fut)
            .await
            .map_err(|_| KernelError::Timeout { stage, after })?
    }

    async fn run_pipeline(self: Arc<Self>, task_id: String, request: String, start: Instant) {
        let mut card = match self.plan(&request).await {
            Ok(card) => card,
            Err(e) => return self.fail(&task_id, None, e),
        };
        if !self.proposals.insert_new(card.clone()) {
            let fresh = uuid::Uuid::new_v4().to_string();
            tracing::warn!(target: "kernel::orchestrator", reused = %card.id, fresh = %fresh, "generator reused a proposal id");
            card.id = fresh;
            self.proposals.record(card.clone());
        }
        self.tasks.set_proposal(&task_id, &card.id);
        tracing::info!(
            target: "kernel::orchestrator",
            task_id = %task_id,
            proposal_id = %card.id,
            module = %card.target_module,
            rar = card.risk_adjusted_reward,
            "proposal recorded"
        );

        match self.carry(&task_id, &request, &card, start).await {
            Ok(result) => {
                if self.tasks.complete(&task_id, result) {
                    tracing::info!(target: "kernel::orchestrator", task_id = %task_id, proposal_id = %card.id, "task completed");
                }
            }
            Err(e) => self.fail(&task_id, Some(card), e),
        }
    }

    async fn plan(&self, request: &str) -> Result<DecisionCard> {
        let outcome = self.bounded("generation", self.parts.planner.plan(request)).await;
        if let Some(h) = &self.parts.homeostasis {
            h.record_api_cost(self.cfg.generation_cost_usd);
        }
        outcome
    }

    /// Gate → verify → review → merge → reinforce.
    async fn carry(&self, task_id: &str, request: &str, card: &DecisionCard, start: Instant) -> Result<MergeResult> {
        self.parts.checker.gate(card)?;

        let report = self.bounded("verification", self.parts.verifier.verify_card(card)).await?;
        tracing::debug!(target: "kernel::orchestrator", task_id, summary = %report.summary(), "verification passed");

        self.review(task_id, card).await?;

        // The integrator enforces its own deadline so it can undo partial work.
        let result = self
            .parts
            .integrator
            .merge(
                &card.target_file,
                &card.generated_artifact,
                &card.integration_patch,
                request,
                start,
                self.cfg.stage_timeout,
            )
            .await?;
        self.parts.goal_engine.reinforce(&result);
        Ok(result)
    }

    async fn review(&self, task_id: &str, card: &DecisionCard) -> Result<()> {
        if self.cfg.review == ReviewPolicy::AutoMerge {
            return Ok(());
        }
        let (tx, rx) = oneshot::channel();
        let entry = PendingReview {
            proposal_id: card.id.clone(),
            task_id: task_id.to_string(),
            target_module: card.target_module.clone(),
            risk_adjusted_reward: card.risk_adjusted_reward,
            queued_at_ms: now_ms(),
        };
        self.reviews
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(card.id.clone(), (entry, tx));
        tracing::info!(target: "kernel::orchestrator", task_id, proposal_id = %card.id, "awaiting review");

        let decision = tokio::time::timeout(self.cfg.review_timeout, rx).await;
        self.reviews.lock().unwrap_or_else(PoisonError::into_inner).remove(&card.id);
        match decision {
            Ok(Ok(ReviewDecision::Approve)) => {
                tracing::info!(target: "kernel::orchestrator", task_id, proposal_id = %card.id, "review approved");
                Ok(())
            }
            Ok(Ok(ReviewDecision::Decline(reason))) => Err(KernelError::ReviewDeclined { reason }),
            Ok(Err(_)) => Err(KernelError::Aborted("review channel closed".into())),
            Err(_) => Err(KernelError::ReviewExpired),
        }
    }

    /// Queues the card for consolidation before the task turns terminal, so a
    /// caller that observes the failure and then flushes memory sees the rule.
    fn fail(&self, task_id: &str, card: Option<DecisionCard>, e: KernelError) {
        if e.feeds_memory() {
            if let Some(card) = card {
                self.parts.memory.consolidate(vec![card]);
            }
        }
        if self.tasks.fail(task_id, e.to_string()) {
            tracing::warn!(
                target: "kernel::orchestrator",
                task_id,
                kind = e.kind(),
                reason = %e,
                "task failed"
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GoalEngineConfig, MemoryConfig, VerifierConfig};
    use crate::self_modify::merge::{InMemoryArtifactStore, InMemoryEntryPoints};
    use crate::self_modify::planner::{make_card, GenerationRequest, ProposalGenerator, StaticGenerator};
    use crate::self_modify::verify::{AssumePassHarness, ScriptedHarness, TestHarness};
    use async_trait::async_trait;

    struct PanickingGenerator;

    #[async_trait]
    impl ProposalGenerator for PanickingGenerator {
        fn name(&self) -> &str {
            "panicking"
        }

        async fn generate(&self, _request: &GenerationRequest) -> Result<DecisionCard> {
            panic!("generator blew up");
        }
    }

    struct SlowGenerator;

    #[async_trait]
    impl ProposalGenerator for SlowGenerator {
        fn name(&self) -> &str {
            "slow"
        }

        async fn generate(&self, _request: &GenerationRequest) -> Result<DecisionCard> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(make_card("Cache", ""))
        }
    }

    fn build(
        generator: Arc<dyn ProposalGenerator>,
        harness: Box<dyn TestHarness>,
        cfg: OrchestratorConfig,
    ) -> (Orchestrator, MemoryConsolidator) {
        let goal_engine = Arc::new(GoalEngine::new(&GoalEngineConfig::default()));
        let memory = MemoryConsolidator::spawn(&MemoryConfig { dream_delay_ms: 0 });
        let parts = PipelineParts {
            planner: Planner::new(generator, Arc::clone(&goal_engine), memory.clone()),
            checker: InvariantChecker::default(),
            verifier: Verifier::new(&VerifierConfig::default(), harness),
            integrator: Integrator::new(
                Arc::new(InMemoryArtifactStore::new()),
                Arc::new(InMemoryEntryPoints::new()),
            ),
            goal_engine,
            memory: memory.clone(),
            homeostasis: None,
        };
        (Orchestrator::new(cfg, parts), memory)
    }

    fn auto(stage_timeout: Duration) -> OrchestratorConfig {
        OrchestratorConfig {
            review: ReviewPolicy::AutoMerge,
            stage_timeout,
            ..OrchestratorConfig::default()
        }
    }

    async fn settle(orc: &Orchestrator, id: &str) -> Task {
        tokio::time::timeout(Duration::from_secs(5), orc.wait_terminal(id, Duration::from_millis(5)))
            .await
            .expect("task did not settle")
            .expect("task vanished")
    }

    #[test]
    fn test_default_config_requires_review() {
        assert_eq!(OrchestratorConfig::default().review, ReviewPolicy::Required);
    }

    #[tokio::test]
    async fn test_panicking_run_fails_task() {
        let (orc, _) = build(Arc::new(PanickingGenerator), Box::new(AssumePassHarness), auto(Duration::from_secs(5)));
        let id = orc.implement("x");
        let task = settle(&orc, &id).await;
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error.unwrap().starts_with("pipeline aborted"));
    }

    #[tokio::test]
    async fn test_generation_timeout() {
        let (orc, memory) = build(Arc::new(SlowGenerator), Box::new(AssumePassHarness), auto(Duration::from_millis(20)));
        let id = orc.implement("x");
        let task = settle(&orc, &id).await;
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error.unwrap().contains("'generation' timed out"));
        memory.flush().await;
        assert!(memory.is_empty());
    }

    #[tokio::test]
    async fn test_verification_timeout_does_not_feed_memory() {
        let gen = Arc::new(StaticGenerator::new(make_card("Cache", "fn f() {}")));
        let (orc, memory) = build(gen, Box::new(ScriptedHarness::Hang), auto(Duration::from_millis(20)));
        let id = orc.implement("x");
        let task = settle(&orc, &id).await;
        assert!(task.error.unwrap().contains("'verification' timed out"));
        memory.flush().await;
        assert!(memory.is_empty());
        assert_eq!(orc.proposals().len(), 1);
    }

    #[tokio::test]
    async fn test_review_expiry_fails_task() {
        let gen = Arc::new(StaticGenerator::new(make_card("Cache", "fn f() {}")));
        let cfg = OrchestratorConfig {
            review: ReviewPolicy::Required,
            review_timeout: Duration::from_millis(30),
            ..OrchestratorConfig::default()
        };
        let (orc, memory) = build(gen, Box::new(AssumePassHarness), cfg);
        let id = orc.implement("x");
        let task = settle(&orc, &id).await;
        assert_eq!(task.error.as_deref(), Some("review window expired before a decision was made"));
        assert!(orc.pending_reviews().is_empty());
        memory.flush().await;
        assert!(memory.is_empty());
    }

    #[tokio::test]
    async fn test_reused_proposal_id_is_replaced() {
        let mut card = make_card("Cache", "fn f() {}");
        card.id = "fixed".into();
        let (orc, _) = build(Arc::new(StaticGenerator::new(card)), Box::new(AssumePassHarness), auto(Duration::from_secs(5)));
        let a = orc.implement("one");
        settle(&orc, &a).await;
        let b = orc.implement("two");
        settle(&orc, &b).await;
        let ids: Vec<_> = orc.proposals().into_iter().map(|c| c.id).collect();
        assert_eq!(ids.len(), 2);
        assert_eq!(ids[0], "fixed");
        assert_ne!(ids[1], "fixed");
    }

    #[tokio::test]
    async fn test_decide_unknown_proposal_returns_false() {
        let (orc, _) = build(Arc::new(PanickingGenerator), Box::new(AssumePassHarness), OrchestratorConfig::default());
        assert!(!orc.approve("nope"));
        assert!(!orc.decline("nope", "no"));
    }

    #[tokio::test]
    async fn test_vitals_count_tasks() {
        let gen = Arc::new(StaticGenerator::new(make_card("Cache", "fn f() {}")));
        let (orc, _) = build(gen, Box::new(AssumePassHarness), auto(Duration::from_secs(5)));
        let id = orc.implement("x");
        settle(&orc, &id).await;
        let v = orc.vitals();
        assert_eq!(v.tasks_completed, 1);
        assert_eq!(v.tasks_pending, 0);
        assert!(v.axioms.is_bounded());
    }

    #[tokio::test]
    async fn test_unknown_task_wait_returns_none() {
        let (orc, _) = build(Arc::new(PanickingGenerator), Box::new(AssumePassHarness), auto(Duration::from_secs(5)));
        assert!(orc.wait_terminal("missing", Duration::from_millis(1)).await.is_none());
    }
}
