//! Compensation planning: reverse-order rollback of a session's actions.

use adapters::{AdapterRegistry, ToolContext};
use ledger::{EventType, Ledger};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use tracing::{info, warn};

use crate::session::SessionAction;

/// One step of a compensation plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompensationStep {
    /// Action the step compensates.
    pub action_id: String,
    /// Tool that executed it.
    pub tool: String,
    /// Original input.
    pub input: JsonValue,
    /// Whether the action actually executed successfully.
    pub was_executed: bool,
    /// Whether an adapter is registered to roll it back.
    pub can_rollback: bool,
}

/// A rollback plan in reverse execution order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompensationPlan {
    /// Session the plan belongs to.
    pub session_id: String,
    /// Steps, most recent action first.
    pub steps: Vec<CompensationStep>,
}

/// Outcome of one rollback attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackRecord {
    /// Action id.
    pub action_id: String,
    /// Tool name.
    pub tool: String,
    /// Whether the rollback succeeded.
    pub success: bool,
    /// What happened.
    pub description: String,
    /// Failure detail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Aggregated rollback outcomes. Failures never raise past the planner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompensationReport {
    /// Steps attempted (executed actions only).
    pub attempted: u64,
    /// Successful rollbacks.
    pub succeeded: u64,
    /// Failed rollbacks.
    pub failed: u64,
    /// Per-step outcomes.
    pub records: Vec<RollbackRecord>,
}

/// Build a rollback plan for a session's actions, most recent first.
#[must_use]
pub fn build_compensation_plan(
    session_id: &str,
    actions: &[SessionAction],
    registry: &AdapterRegistry,
) -> CompensationPlan {
    let steps: Vec<CompensationStep> = actions
        .iter()
        .rev()
        .map(|action| CompensationStep {
            action_id: action.id.clone(),
            tool: action.request.tool.clone(),
            input: action.request.input.clone(),
            was_executed: action.result.as_ref().is_some_and(|r| r.success),
            can_rollback: registry.contains(&action.request.tool),
        })
        .collect();
    CompensationPlan {
        session_id: session_id.to_string(),
        steps,
    }
}

/// Execute a plan best-effort: skipped steps were never executed, steps
/// without an adapter record a failure, and individual failures never stop
/// the walk. Every attempt appends an `action:rollback` ledger entry.
pub async fn execute_plan(
    plan: &CompensationPlan,
    registry: &AdapterRegistry,
    ctx: &mut ToolContext,
    ledger: &Ledger,
) -> CompensationReport {
    let mut report = CompensationReport {
        attempted: 0,
        succeeded: 0,
        failed: 0,
        records: Vec::new(),
    };

    for step in &plan.steps {
        if !step.was_executed {
            continue;
        }
        report.attempted += 1;

        let record = match registry.get(&step.tool) {
            Some(adapter) => {
                let outcome = adapter.rollback(&step.input, ctx).await;
                RollbackRecord {
                    action_id: step.action_id.clone(),
                    tool: step.tool.clone(),
                    success: outcome.success,
                    description: outcome.description,
                    error: outcome.error,
                }
            }
            None => RollbackRecord {
                action_id: step.action_id.clone(),
                tool: step.tool.clone(),
                success: false,
                description: format!("rollback {}", step.tool),
                error: Some(format!("no adapter registered for {}", step.tool)),
            },
        };

        if record.success {
            report.succeeded += 1;
            info!(action = %record.action_id, tool = %record.tool, "rollback succeeded");
        } else {
            report.failed += 1;
            warn!(action = %record.action_id, tool = %record.tool, error = ?record.error, "rollback failed");
        }

        if let Err(e) = ledger.append(
            &plan.session_id,
            EventType::ActionRollback,
            json!({
                "actionId": record.action_id,
                "tool": record.tool,
                "success": record.success,
                "description": record.description,
                "error": record.error,
            }),
        ) {
            warn!(error = %e, "failed to record rollback in ledger");
        }

        report.records.push(record);
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use policy::Evaluation;
    use serde_json::json;
    use warden_core::{ActionRequest, ActionResult, Verdict};

    fn action(id: &str, index: u64, tool: &str, executed: bool) -> SessionAction {
        SessionAction {
            id: id.into(),
            index,
            request: ActionRequest::new(tool, json!({"path": format!("/tmp/{id}")})),
            validation: Evaluation {
                verdict: Verdict::Allow,
                tool: tool.into(),
                reasons: Vec::new(),
                gate: None,
            },
            result: executed.then(|| ActionResult::ok(None, Vec::new(), 1)),
            timestamp_ms: index,
            gate_resolution: None,
        }
    }

    #[test]
    fn plan_is_reverse_ordered_and_tagged() {
        let registry = AdapterRegistry::with_builtins();
        let actions = vec![
            action("a1", 0, "file:write", true),
            action("a2", 1, "unknown:tool", true),
            action("a3", 2, "file:write", false),
        ];
        let plan = build_compensation_plan("s", &actions, &registry);
        assert_eq!(
            plan.steps.iter().map(|s| s.action_id.as_str()).collect::<Vec<_>>(),
            vec!["a3", "a2", "a1"]
        );
        assert!(!plan.steps[0].was_executed);
        assert!(plan.steps[1].was_executed);
        assert!(!plan.steps[1].can_rollback);
        assert!(plan.steps[2].can_rollback);
    }

    #[tokio::test]
    async fn execute_skips_unexecuted_and_records_missing_adapters() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::open(dir.path().join("s.jsonl")).unwrap();
        let registry = AdapterRegistry::with_builtins();
        let actions = vec![
            action("a1", 0, "unknown:tool", true),
            action("a2", 1, "file:write", false),
        ];
        let plan = build_compensation_plan("s", &actions, &registry);
        let mut ctx = ToolContext::new();
        let report = execute_plan(&plan, &registry, &mut ctx, &ledger).await;

        assert_eq!(report.attempted, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.succeeded, 0);
        assert!(report.records[0].error.as_ref().unwrap().contains("no adapter"));

        // One attempt, one ledger entry.
        let entries = ledger::read_entries(dir.path().join("s.jsonl")).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].event_type, EventType::ActionRollback);
    }

    #[tokio::test]
    async fn execute_continues_past_failures() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::open(dir.path().join("s.jsonl")).unwrap();
        let registry = AdapterRegistry::with_builtins();

        // Two executed write actions with no stashed rollback data: both
        // fail, both are attempted.
        let actions = vec![
            action("a1", 0, "file:write", true),
            action("a2", 1, "file:write", true),
        ];
        let plan = build_compensation_plan("s", &actions, &registry);
        let mut ctx = ToolContext::new();
        let report = execute_plan(&plan, &registry, &mut ctx, &ledger).await;
        assert_eq!(report.attempted, 2);
        assert_eq!(report.failed, 2);
    }
}
