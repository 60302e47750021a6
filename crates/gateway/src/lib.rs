//! The governance gateway: per-session orchestration of policy evaluation,
//! gate approvals, result recording, denial-driven policy evolution and the
//! evidence ledger.
//!
//! Each session is logically an actor: its state sits behind an async mutex,
//! so evaluation and result recording serialize naturally within a session
//! while sessions run independently of each other. A session exclusively
//! owns its ledger handle and its policy; evolution mutates the policy only
//! through the session manager.

#![deny(unsafe_code)]

mod compensation;
mod hooks;
mod manager;
mod session;

pub use compensation::{
    build_compensation_plan, execute_plan, CompensationPlan, CompensationReport, CompensationStep,
    RollbackRecord,
};
pub use hooks::{DenialHook, EvolutionDenialHook};
pub use manager::{EvaluateResponse, Gateway, GatewayConfig};
pub use session::{Session, SessionAction, SessionReport, SessionSnapshot};

use thiserror::Error;

/// Errors reported to gateway callers.
///
/// Session usage errors (unknown ids, duplicate results, unknown gates) are
/// reported to the caller and never terminate the session; verdict denials
/// are data, not errors.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// No session with the given id.
    #[error("unknown session \"{0}\"")]
    UnknownSession(String),
    /// No action with the given id in the session.
    #[error("unknown action \"{action_id}\" in session \"{session_id}\"")]
    UnknownAction {
        /// Session id.
        session_id: String,
        /// Action id.
        action_id: String,
    },
    /// `record_result` was already called for the action.
    #[error("result already recorded for action \"{0}\"")]
    DuplicateResult(String),
    /// Ledger failure.
    #[error(transparent)]
    Ledger(#[from] ledger::LedgerError),
    /// Gate manager failure.
    #[error(transparent)]
    Gate(#[from] gates::GateError),
}
