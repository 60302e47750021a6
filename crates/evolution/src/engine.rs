//! Out-of-band decision flow: prompt handler racing a timeout.

use async_trait::async_trait;
use policy::{DenialReason, Policy};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use warden_core::ActionRequest;

use crate::apply::{apply_policy_change, write_policy_to_file};
use crate::suggest::{suggest_policy_change, PolicySuggestion};
use crate::EvolutionError;

/// Default time allowed for an out-of-band decision.
pub const DEFAULT_PROMPT_TIMEOUT: Duration = Duration::from_millis(30_000);

/// A decision on a pending suggestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EvolutionDecision {
    /// Mutate the in-memory policy and persist it to disk.
    #[serde(rename = "add-to-policy")]
    AddToPolicy,
    /// Mutate the in-memory policy only.
    #[serde(rename = "allow-once")]
    AllowOnce,
    /// Drop the suggestion; the denial stands.
    #[serde(rename = "deny")]
    Deny,
}

impl std::str::FromStr for EvolutionDecision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "add-to-policy" => Ok(Self::AddToPolicy),
            "allow-once" => Ok(Self::AllowOnce),
            "deny" => Ok(Self::Deny),
            other => Err(format!(
                "invalid decision \"{other}\"; expected add-to-policy, allow-once or deny"
            )),
        }
    }
}

/// Presents a suggestion out-of-band and returns the user's decision, or
/// `None` when nobody answered.
#[async_trait]
pub trait EvolutionPrompt: Send + Sync {
    /// Ask for a decision on a suggestion produced by a denial of `action`.
    async fn decide(
        &self,
        suggestion: &PolicySuggestion,
        action: &ActionRequest,
    ) -> Option<EvolutionDecision>;
}

/// The mutated policy produced by an approved suggestion.
#[derive(Debug, Clone)]
pub struct EvolvedPolicy {
    /// Policy with the suggestion applied (already revalidated).
    pub policy: Policy,
    /// Whether the policy was also written to disk.
    pub persisted: bool,
}

/// Drives the out-of-band evolution flow and applies decisions for both
/// delivery modes.
pub struct EvolutionEngine {
    prompt: Option<Arc<dyn EvolutionPrompt>>,
    timeout: Duration,
    policy_path: Option<PathBuf>,
}

impl EvolutionEngine {
    /// Engine with no prompt handler: suggestions can only be decided
    /// in-band.
    #[must_use]
    pub fn new(policy_path: Option<PathBuf>) -> Self {
        Self {
            prompt: None,
            timeout: DEFAULT_PROMPT_TIMEOUT,
            policy_path,
        }
    }

    /// Attach an out-of-band prompt handler.
    #[must_use]
    pub fn with_prompt(mut self, prompt: Arc<dyn EvolutionPrompt>) -> Self {
        self.prompt = Some(prompt);
        self
    }

    /// Override the decision timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Where approved policies are persisted, if anywhere.
    #[must_use]
    pub fn policy_path(&self) -> Option<&std::path::Path> {
        self.policy_path.as_deref()
    }

    /// Infer a suggestion for a denial, if one exists.
    #[must_use]
    pub fn suggest(
        &self,
        action: &ActionRequest,
        reasons: &[DenialReason],
        policy: &Policy,
    ) -> Option<PolicySuggestion> {
        suggest_policy_change(action, reasons, policy)
    }

    /// Full out-of-band flow: suggest, prompt with timeout, apply.
    ///
    /// Returns `None` when the denial stands: nothing suggestible, no prompt
    /// handler, timeout, handler declined, or the mutated policy failed
    /// validation. Cancellation never mutates policy.
    pub async fn handle_denial(
        &self,
        action: &ActionRequest,
        reasons: &[DenialReason],
        policy: &Policy,
    ) -> Option<EvolvedPolicy> {
        let suggestion = self.suggest(action, reasons, policy)?;
        let prompt = self.prompt.as_ref()?;

        let decision =
            match tokio::time::timeout(self.timeout, prompt.decide(&suggestion, action)).await {
                Ok(Some(decision)) => decision,
                Ok(None) => {
                    info!(tool = %action.tool, "evolution prompt declined");
                    return None;
                }
                Err(_) => {
                    warn!(tool = %action.tool, timeout_ms = self.timeout.as_millis() as u64, "evolution prompt timed out");
                    return None;
                }
            };

        match self.apply_decision(&suggestion, decision, policy) {
            Ok(evolved) => evolved,
            Err(e) => {
                warn!(error = %e, "evolution step aborted");
                None
            }
        }
    }

    /// Apply a decision to a policy. Shared by the in-band (proxy virtual
    /// tool) and out-of-band paths.
    ///
    /// # Errors
    ///
    /// Returns [`EvolutionError::InvalidResult`] when the mutated policy
    /// fails validation (the original policy must be retained), and I/O
    /// errors from persisting.
    pub fn apply_decision(
        &self,
        suggestion: &PolicySuggestion,
        decision: EvolutionDecision,
        policy: &Policy,
    ) -> Result<Option<EvolvedPolicy>, EvolutionError> {
        match decision {
            EvolutionDecision::Deny => Ok(None),
            EvolutionDecision::AllowOnce => {
                let next = apply_policy_change(policy, suggestion)?;
                Ok(Some(EvolvedPolicy {
                    policy: next,
                    persisted: false,
                }))
            }
            EvolutionDecision::AddToPolicy => {
                let next = apply_policy_change(policy, suggestion)?;
                let persisted = if let Some(path) = &self.policy_path {
                    write_policy_to_file(&next, path)?;
                    true
                } else {
                    false
                };
                Ok(Some(EvolvedPolicy {
                    policy: next,
                    persisted,
                }))
            }
        }
    }
}

impl std::fmt::Debug for EvolutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvolutionEngine")
            .field("timeout", &self.timeout)
            .field("policy_path", &self.policy_path)
            .field("has_prompt", &self.prompt.is_some())
            .finish()
    }
}
