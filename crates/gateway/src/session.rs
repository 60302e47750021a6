//! Session state, snapshots and reports.

use budget::BudgetSnapshot;
use gates::GateDecision;
use ledger::Ledger;
use policy::{ActionView, Evaluation, Policy};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use warden_core::{ActionRequest, ActionResult, SessionState, Verdict};

/// One evaluated action within a session. Append-only; `result` is set at
/// most once.
#[derive(Debug, Clone)]
pub struct SessionAction {
    /// Action id (12 characters).
    pub id: String,
    /// Position within the session.
    pub index: u64,
    /// The request as received.
    pub request: ActionRequest,
    /// Current validation verdict (updated by gate resolution and retries).
    pub validation: Evaluation,
    /// Execution result, recorded at most once.
    pub result: Option<ActionResult>,
    /// Evaluation time, epoch milliseconds.
    pub timestamp_ms: u64,
    /// How an attached gate was resolved, if it was.
    pub gate_resolution: Option<GateDecision>,
}

impl SessionAction {
    pub(crate) fn view(&self) -> ActionView {
        let gate = self.validation.gate.as_ref();
        ActionView {
            index: self.index,
            timestamp_ms: self.timestamp_ms,
            gate_condition: gate.and_then(|g| g.condition.clone()),
            gate_approval: gate.map(|g| g.approval),
            gate_resolved: self.gate_resolution == Some(GateDecision::Approved),
        }
    }
}

/// A live session. Exclusively owns its ledger handle and policy.
pub struct Session {
    /// Session id (16 characters).
    pub id: String,
    /// The active policy; mutated only via evolution through the manager.
    pub policy: Policy,
    /// Lifecycle state.
    pub state: SessionState,
    /// Budget counters.
    pub budget: BudgetSnapshot,
    /// Evaluated actions, in order.
    pub actions: Vec<SessionAction>,
    /// Caller-supplied metadata.
    pub metadata: JsonValue,
    /// Creation time, ISO-8601.
    pub created_at: String,
    /// Last mutation time, ISO-8601.
    pub updated_at: String,
    /// Termination time, ISO-8601.
    pub terminated_at: Option<String>,
    /// Why the session ended.
    pub termination_reason: Option<String>,
    pub(crate) ledger: Arc<Ledger>,
}

impl Session {
    pub(crate) fn action_views(&self) -> Vec<ActionView> {
        self.actions.iter().map(SessionAction::view).collect()
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = warden_core::ids::now_iso();
    }

    /// Serializable snapshot of the session.
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id.clone(),
            state: self.state,
            budget: self.budget.clone(),
            actions: self
                .actions
                .iter()
                .map(|a| ActionSnapshot {
                    id: a.id.clone(),
                    index: a.index,
                    tool: a.request.tool.clone(),
                    verdict: a.validation.verdict,
                    reasons: a.validation.reason_strings(),
                    has_result: a.result.is_some(),
                })
                .collect(),
            metadata: self.metadata.clone(),
            created_at: self.created_at.clone(),
            updated_at: self.updated_at.clone(),
            terminated_at: self.terminated_at.clone(),
            termination_reason: self.termination_reason.clone(),
        }
    }

    /// Build the end-of-session report.
    #[must_use]
    pub fn report(&self) -> SessionReport {
        let mut allowed = 0u64;
        let mut denied = 0u64;
        let mut gated = 0u64;
        for action in &self.actions {
            match action.validation.verdict {
                Verdict::Allow => allowed += 1,
                Verdict::Deny => denied += 1,
                Verdict::Gate => gated += 1,
            }
        }
        SessionReport {
            session_id: self.id.clone(),
            state: self.state,
            actions_evaluated: self.budget.actions_evaluated,
            allowed,
            denied,
            gated,
            budget: self.budget.clone(),
            created_at: self.created_at.clone(),
            terminated_at: self.terminated_at.clone(),
            termination_reason: self.termination_reason.clone(),
            ledger_path: self.ledger.path().display().to_string(),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("actions", &self.actions.len())
            .finish_non_exhaustive()
    }
}

/// Serializable per-action summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionSnapshot {
    /// Action id.
    pub id: String,
    /// Position within the session.
    pub index: u64,
    /// Tool name.
    pub tool: String,
    /// Current verdict.
    pub verdict: Verdict,
    /// Rendered denial reasons.
    pub reasons: Vec<String>,
    /// Whether a result was recorded.
    pub has_result: bool,
}

/// Serializable view of a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// Session id.
    pub id: String,
    /// Lifecycle state.
    pub state: SessionState,
    /// Budget counters.
    pub budget: BudgetSnapshot,
    /// Per-action summaries.
    pub actions: Vec<ActionSnapshot>,
    /// Caller-supplied metadata.
    pub metadata: JsonValue,
    /// Creation time.
    pub created_at: String,
    /// Last mutation time.
    pub updated_at: String,
    /// Termination time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terminated_at: Option<String>,
    /// Why the session ended.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub termination_reason: Option<String>,
}

/// End-of-session summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionReport {
    /// Session id.
    pub session_id: String,
    /// Final state.
    pub state: SessionState,
    /// Total evaluations.
    pub actions_evaluated: u64,
    /// Actions whose final verdict was allow.
    pub allowed: u64,
    /// Actions whose final verdict was deny.
    pub denied: u64,
    /// Actions still gated.
    pub gated: u64,
    /// Final budget counters.
    pub budget: BudgetSnapshot,
    /// Creation time.
    pub created_at: String,
    /// Termination time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terminated_at: Option<String>,
    /// Why the session ended.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub termination_reason: Option<String>,
    /// Where the evidence lives.
    pub ledger_path: String,
}
