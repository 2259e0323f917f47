//! Task and proposal registries.
//!
//! Each registry owns its map behind a `RwLock` and exposes only short,
//! synchronized accessors; nothing holds a guard across an `.await`.
//! A task leaves `pending` exactly once: `complete` and `fail` are no-ops on
//! anything already terminal.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use crate::self_modify::merge::MergeResult;
use crate::self_modify::planner::DecisionCard;
use crate::util::now_ms;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, TaskStatus::Pending)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub request: String,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<MergeResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Card produced for this task, once planning succeeded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proposal_id: Option<String>,
    pub created_at_ms: u64,
}

// ---------------------------------------------------------------------------
// TaskRegistry
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct TaskRegistry {
    tasks: RwLock<HashMap<String, Task>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new pending task and return its id.
    pub fn create(&self, request: &str) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        let task = Task {
            id: id.clone(),
            request: request.to_string(),
            status: TaskStatus::Pending,
            result: None,
            error: None,
            proposal_id: None,
            created_at_ms: now_ms(),
        };
        self.tasks.write().unwrap_or_else(PoisonError::into_inner).insert(id.clone(), task);
        id
    }

    pub fn get(&self, id: &str) -> Option<Task> {
        self.tasks.read().unwrap_or_else(PoisonError::into_inner).get(id).cloned()
    }

    pub fn set_proposal(&self, id: &str, proposal_id: &str) {
        if let Some(t) = self.tasks.write().unwrap_or_else(PoisonError::into_inner).get_mut(id) {
            t.proposal_id = Some(proposal_id.to_string());
        }
    }

    /// `pending → completed`. Returns `false` if the task was unknown or already terminal.
    pub fn complete(&self, id: &str, result: MergeResult) -> bool {
        self.transition(id, |t| {
            t.status = TaskStatus::Completed;
            t.result = Some(result);
        })
    }

    /// `pending → failed`. Returns `false` if the task was unknown or already terminal.
    pub fn fail(&self, id: &str, error: impl Into<String>) -> bool {
        let error = error.into();
        self.transition(id, |t| {
            t.status = TaskStatus::Failed;
            t.error = Some(error);
        })
    }

    fn transition(&self, id: &str, apply: impl FnOnce(&mut Task)) -> bool {
        let mut guard = self.tasks.write().unwrap_or_else(PoisonError::into_inner);
        match guard.get_mut(id) {
            Some(t) if t.status == TaskStatus::Pending => {
                apply(t);
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn count(&self, status: TaskStatus) -> usize {
        self.tasks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|t| t.status == status)
            .count()
    }
}

// ---------------------------------------------------------------------------
// ProposalRegistry
// ---------------------------------------------------------------------------

/// Audit trail of every card the planner produced, in recording order.
#[derive(Default)]
pub struct ProposalRegistry {
    inner: RwLock<ProposalLog>,
}

#[derive(Default)]
struct ProposalLog {
    order: Vec<String>,
    cards: HashMap<String, DecisionCard>,
}

impl ProposalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a card. Re-recording an id replaces the card but keeps its position.
    pub fn record(&self, card: DecisionCard) {
        let mut log = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if !log.cards.contains_key(&card.id) {
            log.order.push(card.id.clone());
        }
        log.cards.insert(card.id.clone(), card);
    }

    /// Record a card only if its id is unused. Returns `false` on collision.
    pub fn insert_new(&self, card: DecisionCard) -> bool {
        let mut log = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if log.cards.contains_key(&card.id) {
            return false;
        }
        log.order.push(card.id.clone());
        log.cards.insert(card.id.clone(), card);
        true
    }

    pub fn get(&self, id: &str) -> Option<DecisionCard> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).cards.get(id).cloned()
    }

    pub fn list(&self) -> Vec<DecisionCard> {
        let log = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        log.order.iter().filter_map(|id| log.cards.get(id).cloned()).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::self_modify::planner::make_card;
    use std::sync::Arc;
    use std::time::Duration;

    fn result() -> MergeResult {
        MergeResult {
            success: true,
            original_request: "r".into(),
            generated_code: "c".into(),
            time_to_implementation: Duration::from_millis(1),
        }
    }

    #[test]
    fn test_new_task_is_pending() {
        let reg = TaskRegistry::new();
        let id = reg.create("add cache");
        let t = reg.get(&id).unwrap();
        assert_eq!(t.status, TaskStatus::Pending);
        assert_eq!(t.request, "add cache");
        assert!(t.result.is_none() && t.error.is_none());
    }

    #[test]
    fn test_single_terminal_transition() {
        let reg = TaskRegistry::new();
        let id = reg.create("x");
        assert!(reg.fail(&id, "boom"));
        assert!(!reg.complete(&id, result()));
        assert!(!reg.fail(&id, "again"));
        let t = reg.get(&id).unwrap();
        assert_eq!(t.status, TaskStatus::Failed);
        assert_eq!(t.error.as_deref(), Some("boom"));
        assert!(t.result.is_none());
    }

    #[test]
    fn test_complete_attaches_result() {
        let reg = TaskRegistry::new();
        let id = reg.create("x");
        assert!(reg.complete(&id, result()));
        assert_eq!(reg.get(&id).unwrap().result, Some(result()));
        assert_eq!(reg.count(TaskStatus::Completed), 1);
    }

    #[test]
    fn test_unknown_task() {
        let reg = TaskRegistry::new();
        assert!(reg.get("nope").is_none());
        assert!(!reg.fail("nope", "x"));
    }

    #[test]
    fn test_concurrent_transitions_only_one_wins() {
        let reg = Arc::new(TaskRegistry::new());
        let id = reg.create("race");
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let reg = Arc::clone(&reg);
                let id = id.clone();
                std::thread::spawn(move || {
                    if i % 2 == 0 { reg.fail(&id, format!("t{i}")) } else { reg.complete(&id, result()) }
                })
            })
            .collect();
        let wins = handles.into_iter().map(|h| h.join().unwrap()).filter(|won| *won).count();
        assert_eq!(wins, 1);
        assert!(reg.get(&id).unwrap().status.is_terminal());
    }

    #[test]
    fn test_task_status_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&TaskStatus::Completed).unwrap(), "\"completed\"");
    }

    #[test]
    fn test_proposals_listed_in_record_order() {
        let reg = ProposalRegistry::new();
        for id in ["p2", "p1", "p3"] {
            let mut c = make_card("M", "");
            c.id = id.into();
            reg.record(c);
        }
        let mut again = make_card("Other", "");
        again.id = "p1".into();
        reg.record(again);
        let ids: Vec<_> = reg.list().into_iter().map(|c| c.id).collect();
        assert_eq!(ids, ["p2", "p1", "p3"]);
        assert_eq!(reg.get("p1").unwrap().target_module, "Other");
    }

    #[test]
    fn test_insert_new_refuses_collision() {
        let reg = ProposalRegistry::new();
        let mut c = make_card("M", "");
        c.id = "p".into();
        assert!(reg.insert_new(c.clone()));
        assert!(!reg.insert_new(c));
        assert_eq!(reg.len(), 1);
    }
}
