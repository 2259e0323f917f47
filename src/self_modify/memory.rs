//! # Stage: Memory Consolidator
//!
//! ## Responsibility
//! Long-term memory of the change loop. Failed proposals are handed over in
//! batches; after a "dream" delay each batch is folded into one
//! [`AvoidanceRule`] per proposal, keyed to the proposal's target module. The
//! planner forwards the rule set to the generator so future proposals steer
//! away from modules that keep failing.
//!
//! Consolidation runs in a background actor fed through a channel. Callers
//! never wait on it unless they ask to ([`MemoryConsolidator::flush`]).
//!
//! ## Guarantees
//! - Append-only: rules are never removed or rewritten
//! - Atomic batches: a whole batch lands under one write lock, so readers see
//!   the rule set either before or after a batch, never half of it
//! - Ordering: rules appear in the order their cycles complete
//! - Defensive copies: [`MemoryConsolidator::rules`] clones
//!
//! ## NOT Responsible For
//! - Persistence (the orchestrator syncs rules into the store)
//! - Generalizing across failures: one rule per failed proposal

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;

use crate::config::MemoryConfig;
use crate::self_modify::planner::DecisionCard;
use crate::util::now_ms;

// ---------------------------------------------------------------------------
// AvoidanceRule
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvoidanceRule {
    pub target_module: String,
    pub description: String,
    /// Unix millis at which the rule was consolidated.
    pub learned_at_ms: u64,
}

impl AvoidanceRule {
    pub fn for_module(target_module: &str) -> Self {
        Self {
            target_module: target_module.to_string(),
            description: format!(
                "Avoid modifications to {target_module} that resulted in low RAR."
            ),
            learned_at_ms: now_ms(),
        }
    }
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

enum Command {
    Consolidate(Vec<DecisionCard>),
    Flush(oneshot::Sender<()>),
}

type RuleSet = Arc<RwLock<Vec<AvoidanceRule>>>;

fn append_batch(rules: &RuleSet, batch: Vec<DecisionCard>) {
    let learned: Vec<AvoidanceRule> =
        batch.iter().map(|card| AvoidanceRule::for_module(&card.target_module)).collect();
    let total = {
        let mut guard = rules.write().unwrap_or_else(PoisonError::into_inner);
        guard.extend(learned.iter().cloned());
        guard.len()
    };
    for rule in &learned {
        tracing::info!(
            target: "kernel::memory",
            module = %rule.target_module,
            total,
            "avoidance rule consolidated"
        );
    }
}

async fn dream_loop(mut rx: mpsc::UnboundedReceiver<Command>, rules: RuleSet, delay: Duration) {
    let mut cycles: JoinSet<()> = JoinSet::new();
    let mut waiters: Vec<oneshot::Sender<()>> = Vec::new();

    loop {
        tokio::select! {
            cmd = rx.recv() => match cmd {
                Some(Command::Consolidate(batch)) => {
                    let rules = Arc::clone(&rules);
                    cycles.spawn(async move {
                        if !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                        append_batch(&rules, batch);
                    });
                }
                Some(Command::Flush(done)) => {
                    if cycles.is_empty() {
                        let _ = done.send(());
                    } else {
                        waiters.push(done);
                    }
                }
                None => break,
            },
            Some(joined) = cycles.join_next(), if !cycles.is_empty() => {
                if let Err(e) = joined {
                    tracing::error!(target: "kernel::memory", error = %e, "consolidation cycle aborted");
                }
                if cycles.is_empty() {
                    for w in waiters.drain(..) {
                        let _ = w.send(());
                    }
                }
            }
        }
    }

    while cycles.join_next().await.is_some() {}
    for w in waiters {
        let _ = w.send(());
    }
}

// ---------------------------------------------------------------------------
// MemoryConsolidator
// ---------------------------------------------------------------------------

/// Handle to the consolidation actor. Clone freely.
#[derive(Clone)]
pub struct MemoryConsolidator {
    rules: RuleSet,
    tx: mpsc::UnboundedSender<Command>,
}

impl MemoryConsolidator {
    /// Start the actor on the current runtime.
    pub fn spawn(cfg: &MemoryConfig) -> Self {
        let rules: RuleSet = Arc::new(RwLock::new(Vec::new()));
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(dream_loop(rx, Arc::clone(&rules), cfg.dream_delay()));
        Self { rules, tx }
    }

    /// Queue failed proposals for consolidation. Returns immediately.
    pub fn consolidate(&self, failed: Vec<DecisionCard>) {
        if failed.is_empty() {
            return;
        }
        let n = failed.len();
        if self.tx.send(Command::Consolidate(failed)).is_err() {
            tracing::error!(target: "kernel::memory", batch = n, "consolidator stopped; batch dropped");
        } else {
            tracing::debug!(target: "kernel::memory", batch = n, "consolidation cycle queued");
        }
    }

    /// Wait until every cycle queued before this call has landed.
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.tx.send(Command::Flush(done)).is_ok() {
            let _ = wait.await;
        }
    }

    pub fn rules(&self) -> Vec<AvoidanceRule> {
        self.rules.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Rules at index `from` onward, for incremental persistence.
    pub fn rules_from(&self, from: usize) -> Vec<AvoidanceRule> {
        let guard = self.rules.read().unwrap_or_else(PoisonError::into_inner);
        guard.get(from..).map(<[AvoidanceRule]>::to_vec).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.rules.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_avoided(&self, module: &str) -> bool {
        self.rules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|r| r.target_module.eq_ignore_ascii_case(module))
    }

    /// Put previously persisted rules in front of anything learned since startup.
    pub fn restore(&self, persisted: Vec<AvoidanceRule>) {
        let n = persisted.len();
        let mut guard = self.rules.write().unwrap_or_else(PoisonError::into_inner);
        guard.splice(0..0, persisted);
        tracing::info!(target: "kernel::memory", restored = n, total = guard.len(), "avoidance rules restored");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
