//! Denial-driven policy evolution.
//!
//! When a call is denied, this subsystem infers the minimal policy change
//! that would have allowed it, asks for a decision (in-band via the proxy's
//! virtual tool, or out-of-band via a prompt handler with a timeout), and on
//! approval mutates the policy — revalidating it against the schema before
//! it is installed. Hard limits (budget, rate, session state) are never
//! suggestible.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod apply;
mod engine;
mod pending;
mod suggest;

pub use apply::{apply_policy_change, write_policy_to_file};
pub use engine::{EvolutionDecision, EvolutionEngine, EvolutionPrompt, EvolvedPolicy};
pub use pending::{PendingSuggestion, PendingSuggestions};
pub use suggest::{infer_scope, suggest_policy_change, PolicySuggestion, SuggestionKind};

use thiserror::Error;

/// Errors emitted by the evolution subsystem.
#[derive(Debug, Error)]
pub enum EvolutionError {
    /// Applying the suggestion produced a policy that fails validation.
    /// The original policy must be retained.
    #[error("evolved policy failed validation: {0}")]
    InvalidResult(#[source] policy::PolicyError),
    /// Persisting the policy file failed.
    #[error("failed to write policy file: {0}")]
    Io(#[from] std::io::Error),
    /// YAML serialization failed.
    #[error("failed to serialize policy: {0}")]
    Yaml(#[from] serde_yaml::Error),
    /// An approval referenced an unknown suggestion id.
    #[error("unknown suggestion id \"{id}\"")]
    UnknownSuggestion {
        /// The id presented.
        id: String,
    },
}
