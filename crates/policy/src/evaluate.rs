//! Stateless verdict evaluation.

use budget::BudgetSnapshot;
use globset::Glob;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;
use warden_core::{ActionInput, ActionRequest, Verdict};

use crate::reason::{DenialReason, ForbiddenField, ScopeField};
use crate::schema::{Gate, Policy};

/// Outcome of evaluating one action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evaluation {
    /// The verdict.
    pub verdict: Verdict,
    /// Tool the evaluation applies to.
    pub tool: String,
    /// Denial reasons; empty for `allow`. A `gate` verdict produced by an
    /// `outside_scope` condition carries the scope violations for context.
    pub reasons: Vec<DenialReason>,
    /// The matched gate for a `gate` verdict.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gate: Option<Gate>,
}

impl Evaluation {
    fn allow(tool: &str) -> Self {
        Self {
            verdict: Verdict::Allow,
            tool: tool.to_string(),
            reasons: Vec::new(),
            gate: None,
        }
    }

    /// A denial with the given reasons.
    #[must_use]
    pub fn deny(tool: &str, reasons: Vec<DenialReason>) -> Self {
        Self {
            verdict: Verdict::Deny,
            tool: tool.to_string(),
            reasons,
            gate: None,
        }
    }

    /// A gate verdict carrying the matched gate.
    #[must_use]
    pub fn gate(tool: &str, gate: Gate, reasons: Vec<DenialReason>) -> Self {
        Self {
            verdict: Verdict::Gate,
            tool: tool.to_string(),
            reasons,
            gate: Some(gate),
        }
    }

    /// Rendered reason strings, in order.
    #[must_use]
    pub fn reason_strings(&self) -> Vec<String> {
        self.reasons.iter().map(ToString::to_string).collect()
    }
}

fn glob_matches(pattern: &str, value: &str) -> bool {
    Glob::new(pattern).is_ok_and(|g| g.compile_matcher().is_match(value))
}

/// Evaluate one request against a policy.
///
/// The check order is fixed: forbidden patterns, capability lookup, scope
/// checks, budget ceilings (only when `budget` is supplied), then gate
/// matching. The first failing level denies; reasons are complete per level.
#[must_use]
pub fn evaluate(
    request: &ActionRequest,
    policy: &Policy,
    budget: Option<&BudgetSnapshot>,
    now_ms: u64,
) -> Evaluation {
    let tool = request.tool.as_str();
    let input = request.canonical_input();

    // 1. Forbidden patterns beat everything else.
    let forbidden = forbidden_matches(&input, policy);
    if !forbidden.is_empty() {
        debug!(tool, matches = forbidden.len(), "forbidden pattern denial");
        return Evaluation::deny(tool, forbidden);
    }

    // 2. Capability lookup: no entry means implicit deny.
    let Some(capability) = policy.capability_for(tool) else {
        return Evaluation::deny(
            tool,
            vec![DenialReason::NoCapability {
                tool: tool.to_string(),
            }],
        );
    };

    // 3. Scope checks, all applicable lists, reasons collected together.
    let violations = scope_violations(&input, &capability.scope);

    // A scope violation normally denies; a gate declared with the
    // `outside_scope` condition converts it into an approval checkpoint
    // (budget ceilings still apply first).
    let outside_scope_gate = policy
        .gates
        .iter()
        .find(|g| g.action == tool && g.condition.as_deref() == Some("outside_scope"));
    if !violations.is_empty() && outside_scope_gate.is_none() {
        return Evaluation::deny(tool, violations);
    }

    // 4. Budget ceilings, only when a snapshot is supplied.
    if let Some(snapshot) = budget {
        if let Some(breach) = snapshot.breach(&policy.limits, now_ms) {
            return Evaluation::deny(tool, vec![DenialReason::Budget(breach)]);
        }
    }

    if !violations.is_empty() {
        if let Some(gate) = outside_scope_gate {
            return Evaluation::gate(tool, gate.clone(), violations);
        }
    }

    // 5. Gate matching: first unconditional gate for the tool.
    if let Some(gate) = policy
        .gates
        .iter()
        .find(|g| g.action == tool && g.condition.as_deref().map_or(true, str::is_empty))
    {
        return Evaluation::gate(tool, gate.clone(), Vec::new());
    }

    Evaluation::allow(tool)
}

fn forbidden_matches(input: &ActionInput, policy: &Policy) -> Vec<DenialReason> {
    let mut reasons = Vec::new();
    for f in &policy.forbidden {
        if let Some(path) = &input.path {
            if glob_matches(&f.pattern, path) {
                reasons.push(DenialReason::ForbiddenMatch {
                    field: ForbiddenField::Path,
                    value: path.clone(),
                    pattern: f.pattern.clone(),
                });
            }
        }
        if let Some(command) = &input.command {
            if command.contains(f.pattern.as_str()) {
                reasons.push(DenialReason::ForbiddenMatch {
                    field: ForbiddenField::Command,
                    value: command.clone(),
                    pattern: f.pattern.clone(),
                });
            }
        }
        if let Some(url) = &input.url {
            if glob_matches(&f.pattern, url) {
                reasons.push(DenialReason::ForbiddenMatch {
                    field: ForbiddenField::Url,
                    value: url.clone(),
                    pattern: f.pattern.clone(),
                });
            }
        }
    }
    reasons
}

/// Scope violations for `input` against `scope`. Lists are only checked when
/// the corresponding canonical input field is present; the HTTP method check
/// applies whenever a method list is declared, defaulting the method to GET.
pub(crate) fn scope_violations(
    input: &ActionInput,
    scope: &crate::schema::Scope,
) -> Vec<DenialReason> {
    let mut violations = Vec::new();

    if let (Some(patterns), Some(path)) = (scope.paths.as_deref(), input.path.as_deref()) {
        if !patterns.iter().any(|p| glob_matches(p, path)) {
            violations.push(DenialReason::ScopeViolation {
                field: ScopeField::Paths,
                value: path.to_string(),
                allowed: patterns.to_vec(),
            });
        }
    }

    if let Some(binaries) = scope.binaries.as_deref() {
        if let Some(binary) = input.effective_binary() {
            if !binaries.iter().any(|b| b == &binary) {
                violations.push(DenialReason::ScopeViolation {
                    field: ScopeField::Binaries,
                    value: binary,
                    allowed: binaries.to_vec(),
                });
            }
        }
    }

    if let (Some(domains), Some(raw)) = (scope.domains.as_deref(), input.url.as_deref()) {
        match Url::parse(raw) {
            Ok(url) => {
                let host = url.host_str().unwrap_or_default().to_string();
                if !domains.iter().any(|d| d == &host) {
                    violations.push(DenialReason::ScopeViolation {
                        field: ScopeField::Domains,
                        value: host,
                        allowed: domains.to_vec(),
                    });
                }
            }
            Err(_) => violations.push(DenialReason::InvalidUrl {
                value: raw.to_string(),
            }),
        }
    }

    if let Some(methods) = scope.methods.as_deref() {
        let method = input.effective_method();
        if !methods.iter().any(|m| m == &method) {
            violations.push(DenialReason::ScopeViolation {
                field: ScopeField::Methods,
                value: method,
                allowed: methods.to_vec(),
            });
        }
    }

    if let (Some(repos), Some(repo)) = (scope.repos.as_deref(), input.repo.as_deref()) {
        if !repos.iter().any(|p| glob_matches(p, repo)) {
            violations.push(DenialReason::ScopeViolation {
                field: ScopeField::Repos,
                value: repo.to_string(),
                allowed: repos.to_vec(),
            });
        }
    }

    violations
}
