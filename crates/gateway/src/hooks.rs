//! Denial hooks: the seam where policy evolution plugs into the session
//! manager.

use async_trait::async_trait;
use evolution::EvolutionEngine;
use policy::{DenialReason, Policy};
use std::sync::Arc;
use warden_core::ActionRequest;

/// Called when an evaluation denies. Returning a policy asks the manager to
/// install it and retry the action once; `None` lets the denial stand.
#[async_trait]
pub trait DenialHook: Send + Sync {
    /// Handle a denial; optionally return an evolved policy to retry with.
    async fn on_denial(
        &self,
        request: &ActionRequest,
        reasons: &[DenialReason],
        policy: &Policy,
    ) -> Option<Policy>;
}

/// Adapts the out-of-band [`EvolutionEngine`] flow to the denial hook seam.
pub struct EvolutionDenialHook {
    engine: Arc<EvolutionEngine>,
}

impl EvolutionDenialHook {
    /// Wrap an engine.
    #[must_use]
    pub fn new(engine: Arc<EvolutionEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl DenialHook for EvolutionDenialHook {
    async fn on_denial(
        &self,
        request: &ActionRequest,
        reasons: &[DenialReason],
        policy: &Policy,
    ) -> Option<Policy> {
        self.engine
            .handle_denial(request, reasons, policy)
            .await
            .map(|evolved| evolved.policy)
    }
}
