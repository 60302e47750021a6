//! Gate manager: holds pending approval requests and resolves them.
//!
//! Gates with `auto` approval resolve immediately. Other approval modes are
//! dispatched to a registered [`GateHandler`] keyed by the mode string
//! (`"human"`, `"webhook"`); with no handler registered the gate stays
//! pending until an external caller invokes [`GateManager::resolve`].

#![deny(unsafe_code)]
#![warn(missing_docs)]

use async_trait::async_trait;
use dashmap::DashMap;
use policy::{ApprovalMode, Gate};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock;
use thiserror::Error;
use tracing::debug;
use warden_core::RiskLevel;

/// Errors emitted by the gate manager.
#[derive(Debug, Error)]
pub enum GateError {
    /// Resolution targeted a `(session, action)` pair with no pending gate.
    #[error("no pending gate for session {session_id} action {action_id}")]
    UnknownGate {
        /// Session id.
        session_id: String,
        /// Action id.
        action_id: String,
    },
}

/// A gate waiting for a decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateRequest {
    /// Owning session.
    pub session_id: String,
    /// Gated action.
    pub action_id: String,
    /// Tool being gated.
    pub tool: String,
    /// The matched (or synthetic) gate.
    pub gate: Gate,
    /// Request time, ISO-8601.
    pub requested_at: String,
}

/// Decision on a gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateDecision {
    /// Let the action proceed.
    Approved,
    /// Block the action.
    Rejected,
}

/// A resolved gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateResponse {
    /// The decision.
    pub decision: GateDecision,
    /// Who decided (handler name, user, webhook id).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub responded_by: Option<String>,
    /// Free-form justification.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Resolution time, ISO-8601.
    pub responded_at: String,
}

impl GateResponse {
    /// Build a response with the current timestamp.
    #[must_use]
    pub fn new(decision: GateDecision, responded_by: Option<String>, reason: Option<String>) -> Self {
        Self {
            decision,
            responded_by,
            reason,
            responded_at: warden_core::ids::now_iso(),
        }
    }
}

/// Outcome of asking for approval.
#[derive(Debug, Clone)]
pub enum GateOutcome {
    /// Approved, immediately or by a handler.
    Approved(GateResponse),
    /// Rejected by a handler.
    Rejected(GateResponse),
    /// No decision yet; the request stays pending.
    Pending,
}

/// Presents an approval request and returns a decision, or `None` to leave
/// the gate pending.
#[async_trait]
pub trait GateHandler: Send + Sync {
    /// Decide on a gate request.
    async fn decide(&self, request: &GateRequest) -> Option<GateResponse>;
}

/// Holds pending and resolved gates keyed by `(session_id, action_id)`.
#[derive(Default)]
pub struct GateManager {
    pending: DashMap<(String, String), GateRequest>,
    resolved: DashMap<(String, String), GateResponse>,
    handlers: RwLock<HashMap<String, Arc<dyn GateHandler>>>,
}

impl GateManager {
    /// Create an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for an approval mode (`"human"`, `"webhook"`).
    pub fn register_handler(&self, mode: impl Into<String>, handler: Arc<dyn GateHandler>) {
        let mut handlers = self
            .handlers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        handlers.insert(mode.into(), handler);
    }

    /// Request approval for a gated action.
    ///
    /// `auto` gates approve immediately. Otherwise the handler registered for
    /// the gate's approval mode is consulted; no handler or no decision
    /// leaves the request pending.
    pub async fn request_approval(
        &self,
        session_id: &str,
        action_id: &str,
        tool: &str,
        gate: Gate,
    ) -> GateOutcome {
        if gate.approval == ApprovalMode::Auto {
            let response = GateResponse::new(GateDecision::Approved, Some("auto".into()), None);
            self.resolved.insert(
                (session_id.to_string(), action_id.to_string()),
                response.clone(),
            );
            return GateOutcome::Approved(response);
        }

        let request = GateRequest {
            session_id: session_id.to_string(),
            action_id: action_id.to_string(),
            tool: tool.to_string(),
            gate: gate.clone(),
            requested_at: warden_core::ids::now_iso(),
        };

        let handler = {
            let handlers = self
                .handlers
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            handlers.get(&gate.approval.to_string()).cloned()
        };

        if let Some(handler) = handler {
            if let Some(response) = handler.decide(&request).await {
                debug!(session = session_id, action = action_id, decision = ?response.decision, "gate decided by handler");
                self.resolved.insert(
                    (session_id.to_string(), action_id.to_string()),
                    response.clone(),
                );
                return match response.decision {
                    GateDecision::Approved => GateOutcome::Approved(response),
                    GateDecision::Rejected => GateOutcome::Rejected(response),
                };
            }
        }

        self.pending
            .insert((session_id.to_string(), action_id.to_string()), request);
        GateOutcome::Pending
    }

    /// Resolve a pending gate from outside (CLI, HTTP, webhook callback).
    ///
    /// # Errors
    ///
    /// Returns [`GateError::UnknownGate`] when nothing is pending for the
    /// pair.
    pub fn resolve(
        &self,
        session_id: &str,
        action_id: &str,
        decision: GateDecision,
        responded_by: Option<String>,
        reason: Option<String>,
    ) -> Result<GateResponse, GateError> {
        let key = (session_id.to_string(), action_id.to_string());
        let Some((_, _request)) = self.pending.remove(&key) else {
            return Err(GateError::UnknownGate {
                session_id: session_id.to_string(),
                action_id: action_id.to_string(),
            });
        };
        let response = GateResponse::new(decision, responded_by, reason);
        self.resolved.insert(key, response.clone());
        Ok(response)
    }

    /// Pending requests for a session.
    #[must_use]
    pub fn pending_for_session(&self, session_id: &str) -> Vec<GateRequest> {
        self.pending
            .iter()
            .filter(|e| e.key().0 == session_id)
            .map(|e| e.value().clone())
            .collect()
    }

    /// Whether any gate is pending for a session.
    #[must_use]
    pub fn has_pending(&self, session_id: &str) -> bool {
        self.pending.iter().any(|e| e.key().0 == session_id)
    }

    /// The resolution recorded for an action, if any.
    #[must_use]
    pub fn resolution(&self, session_id: &str, action_id: &str) -> Option<GateResponse> {
        self.resolved
            .get(&(session_id.to_string(), action_id.to_string()))
            .map(|e| e.value().clone())
    }

    /// Evict all pending and resolved entries for a session.
    pub fn clear_session(&self, session_id: &str) {
        self.pending.retain(|k, _| k.0 != session_id);
        self.resolved.retain(|k, _| k.0 != session_id);
    }
}

impl std::fmt::Debug for GateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GateManager")
            .field("pending", &self.pending.len())
            .field("resolved", &self.resolved.len())
            .finish_non_exhaustive()
    }
}

/// Auto-approves gates whose declared risk is at or below a threshold;
/// riskier gates are left pending.
#[derive(Debug, Clone, Copy)]
pub struct RiskThresholdHandler {
    threshold: RiskLevel,
}

impl RiskThresholdHandler {
    /// Approve gates with `risk_level <= threshold`.
    #[must_use]
    pub fn new(threshold: RiskLevel) -> Self {
        Self { threshold }
    }
}

#[async_trait]
impl GateHandler for RiskThresholdHandler {
    async fn decide(&self, request: &GateRequest) -> Option<GateResponse> {
        let risk = request.gate.risk_level.unwrap_or_default();
        if risk <= self.threshold {
            Some(GateResponse::new(
                GateDecision::Approved,
                Some("risk-threshold".into()),
                Some(format!("risk {risk} <= threshold {}", self.threshold)),
            ))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate(approval: ApprovalMode, risk: Option<RiskLevel>) -> Gate {
        Gate {
            action: "file:delete".into(),
            approval,
            risk_level: risk,
            condition: None,
        }
    }

    #[tokio::test]
    async fn auto_gates_approve_immediately() {
        let manager = GateManager::new();
        let outcome = manager
            .request_approval("s1", "a1", "file:delete", gate(ApprovalMode::Auto, None))
            .await;
        assert!(matches!(outcome, GateOutcome::Approved(_)));
        assert!(!manager.has_pending("s1"));
    }

    #[tokio::test]
    async fn unhandled_human_gate_stays_pending_until_resolved() {
        let manager = GateManager::new();
        let outcome = manager
            .request_approval("s1", "a1", "file:delete", gate(ApprovalMode::Human, None))
            .await;
        assert!(matches!(outcome, GateOutcome::Pending));
        assert_eq!(manager.pending_for_session("s1").len(), 1);

        let response = manager
            .resolve("s1", "a1", GateDecision::Approved, Some("alice".into()), None)
            .unwrap();
        assert_eq!(response.decision, GateDecision::Approved);
        assert!(!manager.has_pending("s1"));
        assert!(manager.resolution("s1", "a1").is_some());
    }

    #[tokio::test]
    async fn resolving_unknown_gate_errors() {
        let manager = GateManager::new();
        assert!(matches!(
            manager.resolve("s1", "zz", GateDecision::Approved, None, None),
            Err(GateError::UnknownGate { .. })
        ));
    }

    #[tokio::test]
    async fn handler_rejection_propagates() {
        struct DenyAll;
        #[async_trait]
        impl GateHandler for DenyAll {
            async fn decide(&self, _request: &GateRequest) -> Option<GateResponse> {
                Some(GateResponse::new(
                    GateDecision::Rejected,
                    Some("deny-all".into()),
                    Some("nope".into()),
                ))
            }
        }

        let manager = GateManager::new();
        manager.register_handler("human", Arc::new(DenyAll));
        let outcome = manager
            .request_approval("s1", "a1", "file:delete", gate(ApprovalMode::Human, None))
            .await;
        assert!(matches!(outcome, GateOutcome::Rejected(_)));
    }

    #[tokio::test]
    async fn risk_threshold_approves_at_or_below() {
        let manager = GateManager::new();
        manager.register_handler("human", Arc::new(RiskThresholdHandler::new(RiskLevel::Medium)));

        let outcome = manager
            .request_approval(
                "s1",
                "a1",
                "file:write",
                gate(ApprovalMode::Human, Some(RiskLevel::Low)),
            )
            .await;
        assert!(matches!(outcome, GateOutcome::Approved(_)));

        let outcome = manager
            .request_approval(
                "s1",
                "a2",
                "file:delete",
                gate(ApprovalMode::Human, Some(RiskLevel::High)),
            )
            .await;
        assert!(matches!(outcome, GateOutcome::Pending));
    }

    #[tokio::test]
    async fn clear_session_evicts_by_prefix() {
        let manager = GateManager::new();
        let _ = manager
            .request_approval("s1", "a1", "t", gate(ApprovalMode::Human, None))
            .await;
        let _ = manager
            .request_approval("s2", "a1", "t", gate(ApprovalMode::Human, None))
            .await;
        manager.clear_session("s1");
        assert!(!manager.has_pending("s1"));
        assert!(manager.has_pending("s2"));
    }
}
