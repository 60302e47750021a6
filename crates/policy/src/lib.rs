//! Warden governance policy engine.
//!
//! This crate owns the declarative YAML policy schema and the verdict
//! evaluation pipeline used to guard agent tool calls. Evaluation is
//! deterministic and fail-closed: a tool with no capability entry is denied,
//! and the first failing check level produces a `deny` with the complete set
//! of reasons collected on that level.
//!
//! Evaluation order (stateless core):
//! 1. Forbidden patterns (highest priority)
//! 2. Capability lookup (deny when absent)
//! 3. Scope checks (paths / binaries / domains / methods / repos)
//! 4. Budget ceilings (when a budget snapshot is supplied)
//! 5. Gate matching (first gate whose `action` equals the tool)
//!
//! The session-aware wrapper prepends session-state, action/denial-limit,
//! rate-limit and escalation checks.
//!
//! Denial reasons are a tagged enum ([`DenialReason`]); the human-readable
//! strings rendered by its `Display` impl are part of the stable contract
//! with the evolution subsystem and must not drift.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod evaluate;
mod reason;
mod schema;
mod session;

pub use evaluate::{evaluate, Evaluation};
pub use reason::{DenialReason, ForbiddenField, ScopeField};
pub use schema::{
    ApprovalMode, Capability, EscalationRequire, EscalationRule, Evidence, ForbiddenPattern, Gate,
    Policy, PolicyError, RateLimit, Remediation, Scope, SessionRules, ValidationIssue,
};
pub use session::{
    assess_risk_level, evaluate_session_action, ActionView, SessionEvaluation, SessionView,
};
