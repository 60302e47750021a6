//! Minimal policy-change inference from denial reasons.

use policy::{DenialReason, Policy, Scope, ScopeField};
use serde::{Deserialize, Serialize};
use url::Url;
use warden_core::{ActionInput, ActionRequest};

/// The concrete edit a suggestion proposes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SuggestionKind {
    /// Add a new capability for a previously unknown tool.
    AddCapability {
        /// Tool to grant.
        tool: String,
        /// Scope inferred from the denied action's input.
        scope: Scope,
    },
    /// Append values to one scope allow-list of an existing capability.
    WidenScope {
        /// Capability tool.
        tool: String,
        /// Allow-list to widen.
        field: ScopeField,
        /// Values to append.
        add: Vec<String>,
    },
    /// Remove a forbidden pattern. This loosens a global deny rule.
    RemoveForbidden {
        /// Pattern to remove.
        pattern: String,
    },
}

/// A minimal, not-yet-applied policy edit inferred from a denial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicySuggestion {
    /// The proposed edit.
    pub kind: SuggestionKind,
}

impl PolicySuggestion {
    /// Whether the suggestion loosens a forbidden pattern rather than
    /// extending a capability.
    #[must_use]
    pub fn loosens_forbidden(&self) -> bool {
        matches!(self.kind, SuggestionKind::RemoveForbidden { .. })
    }

    /// Human-readable description presented with the decision prompt.
    #[must_use]
    pub fn describe(&self) -> String {
        match &self.kind {
            SuggestionKind::AddCapability { tool, scope } => {
                let mut parts = Vec::new();
                if let Some(v) = &scope.paths {
                    parts.push(format!("paths: {}", v.join(", ")));
                }
                if let Some(v) = &scope.binaries {
                    parts.push(format!("binaries: {}", v.join(", ")));
                }
                if let Some(v) = &scope.domains {
                    parts.push(format!("domains: {}", v.join(", ")));
                }
                if let Some(v) = &scope.methods {
                    parts.push(format!("methods: {}", v.join(", ")));
                }
                if let Some(v) = &scope.repos {
                    parts.push(format!("repos: {}", v.join(", ")));
                }
                if parts.is_empty() {
                    format!("Add capability \"{tool}\" with unrestricted scope")
                } else {
                    format!("Add capability \"{tool}\" scoped to {}", parts.join("; "))
                }
            }
            SuggestionKind::WidenScope { tool, field, add } => format!(
                "Widen {field} scope of \"{tool}\" to include {}",
                add.join(", ")
            ),
            SuggestionKind::RemoveForbidden { pattern } => format!(
                "Remove forbidden pattern \"{pattern}\" (loosens a global deny rule)"
            ),
        }
    }
}

/// Infer the minimal policy change that would have allowed a denied action.
///
/// Matches on the first denial reason. Hard limits (budget, rate limit,
/// session state and session counters) and malformed inputs yield `None`.
#[must_use]
pub fn suggest_policy_change(
    action: &ActionRequest,
    reasons: &[DenialReason],
    _policy: &Policy,
) -> Option<PolicySuggestion> {
    let kind = match reasons.first()? {
        DenialReason::NoCapability { tool } => SuggestionKind::AddCapability {
            tool: tool.clone(),
            scope: infer_scope(&action.canonical_input()),
        },
        DenialReason::ScopeViolation { field, value, .. } => SuggestionKind::WidenScope {
            tool: action.tool.clone(),
            field: *field,
            add: vec![value.clone()],
        },
        DenialReason::ForbiddenMatch { pattern, .. } => SuggestionKind::RemoveForbidden {
            pattern: pattern.clone(),
        },
        DenialReason::InvalidUrl { .. }
        | DenialReason::InvalidInput { .. }
        | DenialReason::Budget(_)
        | DenialReason::SessionState { .. }
        | DenialReason::ActionLimit { .. }
        | DenialReason::DenialLimit { .. }
        | DenialReason::RateLimit { .. } => return None,
    };
    Some(PolicySuggestion { kind })
}

/// Infer a capability scope from an action's canonical input.
#[must_use]
pub fn infer_scope(input: &ActionInput) -> Scope {
    let mut scope = Scope::default();
    if let Some(path) = &input.path {
        scope.paths = Some(vec![path.clone()]);
    }
    if let Some(binary) = input.effective_binary() {
        scope.binaries = Some(vec![binary]);
    }
    if let Some(raw) = &input.url {
        if let Ok(url) = Url::parse(raw) {
            if let Some(host) = url.host_str() {
                scope.domains = Some(vec![host.to_string()]);
            }
        }
    }
    if let Some(method) = &input.method {
        scope.methods = Some(vec![method.to_ascii_uppercase()]);
    }
    if let Some(repo) = &input.repo {
        scope.repos = Some(vec![repo.clone()]);
    }
    scope
}
