//! Session-aware evaluation: state, limits, rate limiting, escalations.

use budget::BudgetSnapshot;
use tracing::debug;
use warden_core::{ActionRequest, RiskLevel, SessionState};

use crate::evaluate::{evaluate, Evaluation};
use crate::reason::DenialReason;
use crate::schema::{ApprovalMode, Gate, Policy};

/// Sliding rate-limit window.
const RATE_WINDOW_MS: u64 = 60_000;

/// How close to the action limit a warning is attached.
const ACTION_LIMIT_WARN_MARGIN: u64 = 5;

/// The slice of session history the evaluator needs to see.
#[derive(Debug, Clone)]
pub struct ActionView {
    /// Position of the action within the session.
    pub index: u64,
    /// Evaluation time, epoch milliseconds.
    pub timestamp_ms: u64,
    /// Gate condition attached to the action's verdict, if any.
    pub gate_condition: Option<String>,
    /// Approval mode of the attached gate.
    pub gate_approval: Option<ApprovalMode>,
    /// Whether the attached gate has been resolved (approved).
    pub gate_resolved: bool,
}

/// Read-only view of a session handed to the evaluator.
#[derive(Debug, Clone, Copy)]
pub struct SessionView<'a> {
    /// Session lifecycle state.
    pub state: SessionState,
    /// Budget counters.
    pub budget: &'a BudgetSnapshot,
    /// Prior actions, in order.
    pub actions: &'a [ActionView],
    /// Session rules from the active policy.
    pub rules: Option<&'a crate::schema::SessionRules>,
}

/// Session-aware evaluation output.
#[derive(Debug, Clone)]
pub struct SessionEvaluation {
    /// The verdict with reasons and gate.
    pub evaluation: Evaluation,
    /// Warnings to attach to the eventual result (e.g. nearing limits).
    pub warnings: Vec<String>,
}

/// Evaluate one action with session context.
///
/// Prepends, in order: session-state, action-limit, denial-limit and
/// rate-limit checks, then escalation rules, and finally delegates to the
/// stateless evaluator with the session budget.
#[must_use]
pub fn evaluate_session_action(
    request: &ActionRequest,
    policy: &Policy,
    view: &SessionView<'_>,
    now_ms: u64,
) -> SessionEvaluation {
    let tool = request.tool.as_str();
    let mut warnings = Vec::new();

    if view.state != SessionState::Active {
        return SessionEvaluation {
            evaluation: Evaluation::deny(
                tool,
                vec![DenialReason::SessionState { state: view.state }],
            ),
            warnings,
        };
    }

    if let Some(rules) = view.rules {
        if let Some(max) = rules.max_actions {
            if view.budget.actions_evaluated >= max {
                return SessionEvaluation {
                    evaluation: Evaluation::deny(tool, vec![DenialReason::ActionLimit { max }]),
                    warnings,
                };
            }
            let remaining = max - view.budget.actions_evaluated;
            if remaining <= ACTION_LIMIT_WARN_MARGIN {
                warnings.push(format!(
                    "Approaching session action limit: {} of {max} used",
                    view.budget.actions_evaluated
                ));
            }
        }

        if let Some(max) = rules.max_denials {
            if view.budget.actions_denied >= max {
                return SessionEvaluation {
                    evaluation: Evaluation::deny(tool, vec![DenialReason::DenialLimit { max }]),
                    warnings,
                };
            }
        }

        if let Some(rate) = &rules.rate_limit {
            let window_start = now_ms.saturating_sub(RATE_WINDOW_MS);
            let recent = view
                .actions
                .iter()
                .filter(|a| a.timestamp_ms >= window_start)
                .count() as u64;
            if recent >= rate.max_per_minute {
                return SessionEvaluation {
                    evaluation: Evaluation::deny(
                        tool,
                        vec![DenialReason::RateLimit {
                            max_per_minute: rate.max_per_minute,
                        }],
                    ),
                    warnings,
                };
            }
        }

        if let Some(gate) = escalation_gate(tool, view, now_ms) {
            debug!(tool, condition = ?gate.condition, "escalation gate forced");
            return SessionEvaluation {
                evaluation: Evaluation::gate(tool, gate, Vec::new()),
                warnings,
            };
        }
    }

    SessionEvaluation {
        evaluation: evaluate(request, policy, Some(view.budget), now_ms),
        warnings,
    }
}

/// First escalation rule that fires, as a synthetic human gate.
fn escalation_gate(tool: &str, view: &SessionView<'_>, now_ms: u64) -> Option<Gate> {
    let rules = view.rules?;
    for rule in &rules.escalation {
        if let Some(after) = rule.after_actions {
            if after <= view.budget.actions_evaluated && !checkin_since_index(view, after) {
                return Some(synthetic_gate(tool, format!("after_actions:{after}")));
            }
        }
        if let Some(minutes) = rule.after_minutes {
            let elapsed_min = view.budget.elapsed_ms(now_ms) / 60_000;
            if minutes <= elapsed_min && !minute_checkin(view) {
                return Some(synthetic_gate(tool, format!("after_minutes:{minutes}")));
            }
        }
    }
    None
}

fn synthetic_gate(tool: &str, condition: String) -> Gate {
    Gate {
        action: tool.to_string(),
        approval: ApprovalMode::Human,
        risk_level: Some(RiskLevel::Medium),
        condition: Some(condition),
    }
}

/// A resolved human gate at or past the action-count threshold satisfies
/// `after_actions` escalations.
fn checkin_since_index(view: &SessionView<'_>, threshold: u64) -> bool {
    view.actions.iter().any(|a| {
        a.index >= threshold
            && a.gate_resolved
            && a.gate_approval == Some(ApprovalMode::Human)
    })
}

/// A resolved gate carrying an `after_minutes:` condition satisfies
/// `after_minutes` escalations.
fn minute_checkin(view: &SessionView<'_>) -> bool {
    view.actions.iter().any(|a| {
        a.gate_resolved
            && a.gate_condition
                .as_deref()
                .is_some_and(|c| c.starts_with("after_minutes:"))
    })
}

/// Risk heuristic: explicit gate risk when declared, otherwise a fixed table
/// keyed by tool name.
#[must_use]
pub fn assess_risk_level(tool: &str, policy: &Policy) -> RiskLevel {
    if let Some(gate) = policy.gate_for(tool) {
        if let Some(risk) = gate.risk_level {
            return risk;
        }
    }
    match tool {
        "file:delete" | "command:run" => RiskLevel::High,
        "file:read" | "git:diff" => RiskLevel::Low,
        // file:write, git:apply, http:request and everything unknown.
        _ => RiskLevel::Medium,
    }
}
