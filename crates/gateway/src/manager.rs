//! The session manager.

use budget::BudgetSnapshot;
use dashmap::DashMap;
use gates::{GateDecision, GateManager, GateOutcome};
use ledger::{EventType, Ledger};
use policy::{
    evaluate_session_action, DenialReason, Gate, Policy, SessionEvaluation, SessionView,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use warden_core::{ActionRequest, ActionResult, SessionState, Verdict};

use crate::hooks::DenialHook;
use crate::session::{Session, SessionAction, SessionReport, SessionSnapshot};
use crate::GatewayError;

/// Gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Directory holding one `<session_id>.jsonl` ledger per session.
    pub ledger_dir: PathBuf,
}

impl GatewayConfig {
    /// Configuration with the given ledger directory.
    #[must_use]
    pub fn new(ledger_dir: impl Into<PathBuf>) -> Self {
        Self {
            ledger_dir: ledger_dir.into(),
        }
    }
}

/// Response to one `evaluate` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluateResponse {
    /// Id allocated for the action.
    pub action_id: String,
    /// The decision.
    pub decision: Verdict,
    /// Structured denial reasons (empty for allow).
    pub reasons: Vec<DenialReason>,
    /// Matched gate for a `gate` decision.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gate: Option<Gate>,
    /// Copy of the session budget after the evaluation.
    pub budget: BudgetSnapshot,
    /// Warnings to surface with the eventual result.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl EvaluateResponse {
    /// Rendered reason strings.
    #[must_use]
    pub fn reason_strings(&self) -> Vec<String> {
        self.reasons.iter().map(ToString::to_string).collect()
    }
}

/// The governance gateway. Owns all sessions in this process.
pub struct Gateway {
    config: GatewayConfig,
    sessions: DashMap<String, Arc<Mutex<Session>>>,
    gates: Arc<GateManager>,
    denial_hook: Option<Arc<dyn DenialHook>>,
}

impl Gateway {
    /// Create a gateway.
    #[must_use]
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            sessions: DashMap::new(),
            gates: Arc::new(GateManager::new()),
            denial_hook: None,
        }
    }

    /// Attach a denial hook (policy evolution).
    #[must_use]
    pub fn with_denial_hook(mut self, hook: Arc<dyn DenialHook>) -> Self {
        self.denial_hook = Some(hook);
        self
    }

    /// The gate manager, for registering handlers and external resolution.
    #[must_use]
    pub fn gates(&self) -> Arc<GateManager> {
        Arc::clone(&self.gates)
    }

    /// Create a session: allocate an id, open its ledger and record
    /// `session:start`. Terminal I/O errors propagate.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Ledger`] when the ledger file cannot be
    /// opened or written.
    pub fn create_session(
        &self,
        policy: Policy,
        metadata: JsonValue,
    ) -> Result<String, GatewayError> {
        let id = warden_core::ids::session_id();
        let ledger = Ledger::open(self.config.ledger_dir.join(format!("{id}.jsonl")))?;
        ledger.append(
            &id,
            EventType::SessionStart,
            json!({
                "policy": {"name": policy.name, "version": policy.version},
                "metadata": metadata.clone(),
            }),
        )?;

        let now_iso = warden_core::ids::now_iso();
        let session = Session {
            id: id.clone(),
            policy,
            state: SessionState::Active,
            budget: BudgetSnapshot::new(warden_core::ids::now_ms()),
            actions: Vec::new(),
            metadata,
            created_at: now_iso.clone(),
            updated_at: now_iso,
            terminated_at: None,
            termination_reason: None,
            ledger: Arc::new(ledger),
        };
        info!(session = %id, "session created");
        self.sessions.insert(id.clone(), Arc::new(Mutex::new(session)));
        Ok(id)
    }

    fn session_arc(&self, session_id: &str) -> Result<Arc<Mutex<Session>>, GatewayError> {
        self.sessions
            .get(session_id)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| GatewayError::UnknownSession(session_id.to_string()))
    }

    /// Evaluate one action for a session.
    ///
    /// # Errors
    ///
    /// Returns usage errors for unknown sessions and ledger errors for
    /// append failures. Denials are data in the response, not errors.
    pub async fn evaluate(
        &self,
        session_id: &str,
        request: ActionRequest,
    ) -> Result<EvaluateResponse, GatewayError> {
        let arc = self.session_arc(session_id)?;
        let mut s = arc.lock().await;
        let now = warden_core::ids::now_ms();

        // A terminated session has a closed ledger; reject without recording.
        if s.state == SessionState::Terminated {
            return Ok(EvaluateResponse {
                action_id: warden_core::ids::action_id(),
                decision: Verdict::Deny,
                reasons: vec![DenialReason::SessionState { state: s.state }],
                gate: None,
                budget: s.budget.clone(),
                warnings: Vec::new(),
            });
        }

        let SessionEvaluation {
            evaluation,
            warnings,
        } = {
            let views = s.action_views();
            let view = SessionView {
                state: s.state,
                budget: &s.budget,
                actions: &views,
                rules: s.policy.session.as_ref(),
            };
            evaluate_session_action(&request, &s.policy, &view, now)
        };

        s.budget.actions_evaluated += 1;
        if evaluation.verdict == Verdict::Deny {
            s.budget.actions_denied += 1;
        }

        let action_id = warden_core::ids::action_id();
        let index = s.actions.len() as u64;

        for warning in &warnings {
            s.ledger.append(
                &s.id,
                EventType::BudgetWarning,
                json!({"actionId": action_id, "warning": warning}),
            )?;
        }
        if evaluation.verdict == Verdict::Deny
            && matches!(evaluation.reasons.first(), Some(DenialReason::Budget(_)))
        {
            s.ledger.append(
                &s.id,
                EventType::BudgetExceeded,
                json!({"actionId": action_id, "reasons": evaluation.reason_strings()}),
            )?;
        }

        s.actions.push(SessionAction {
            id: action_id.clone(),
            index,
            request: request.clone(),
            validation: evaluation.clone(),
            result: None,
            timestamp_ms: now,
            gate_resolution: None,
        });
        self.append_evaluation(&s, &action_id, &evaluation, false)?;
        s.touch();

        let response = match evaluation.verdict {
            Verdict::Allow => self.respond(&s, &action_id, &evaluation, warnings),
            Verdict::Gate => {
                if evaluation
                    .gate
                    .as_ref()
                    .and_then(|g| g.condition.as_deref())
                    .is_some_and(|c| c.starts_with("after_"))
                {
                    s.ledger.append(
                        &s.id,
                        EventType::EscalationTriggered,
                        json!({"actionId": action_id, "condition": evaluation.gate.as_ref().and_then(|g| g.condition.clone())}),
                    )?;
                }
                self.process_gate(&mut s, &action_id, evaluation, warnings).await?
            }
            Verdict::Deny => {
                self.process_denial(&mut s, &action_id, &request, evaluation, warnings)
                    .await?
            }
        };

        // Breaching the denial limit terminates the session after all
        // updates settle.
        if let Some(max) = s.policy.session.as_ref().and_then(|r| r.max_denials) {
            if s.state != SessionState::Terminated && s.budget.actions_denied >= max {
                warn!(session = %s.id, max, "denial limit reached; terminating session");
                let _ = self.terminate_locked(&mut s, Some(format!("Denial limit reached ({max})")))?;
            }
        }

        Ok(response)
    }

    /// Gate flow: pause, request approval, and translate the outcome.
    async fn process_gate(
        &self,
        s: &mut Session,
        action_id: &str,
        evaluation: policy::Evaluation,
        warnings: Vec<String>,
    ) -> Result<EvaluateResponse, GatewayError> {
        let gate = evaluation.gate.clone().unwrap_or_else(|| Gate {
            action: evaluation.tool.clone(),
            approval: policy::ApprovalMode::Human,
            risk_level: None,
            condition: None,
        });

        self.set_state(s, SessionState::Paused, "gate pending")?;
        s.ledger.append(
            &s.id,
            EventType::GateRequested,
            json!({"actionId": action_id, "tool": evaluation.tool, "gate": gate}),
        )?;

        let outcome = self
            .gates
            .request_approval(&s.id, action_id, &evaluation.tool, gate.clone())
            .await;

        match outcome {
            GateOutcome::Approved(response) => {
                self.apply_resolution(s, action_id, GateDecision::Approved, &response)?;
                let evaluation = self.action_eval(s, action_id);
                Ok(self.respond(s, action_id, &evaluation, warnings))
            }
            GateOutcome::Rejected(response) => {
                self.apply_resolution(s, action_id, GateDecision::Rejected, &response)?;
                let evaluation = self.action_eval(s, action_id);
                Ok(self.respond(s, action_id, &evaluation, warnings))
            }
            GateOutcome::Pending => {
                debug!(session = %s.id, action = %action_id, "gate pending");
                let mut response = self.respond(s, action_id, &evaluation, warnings);
                response.gate = Some(gate);
                Ok(response)
            }
        }
    }

    /// Denial flow: give the evolution hook a chance, then retry once.
    async fn process_denial(
        &self,
        s: &mut Session,
        action_id: &str,
        request: &ActionRequest,
        evaluation: policy::Evaluation,
        warnings: Vec<String>,
    ) -> Result<EvaluateResponse, GatewayError> {
        let Some(hook) = self.denial_hook.clone() else {
            return Ok(self.respond(s, action_id, &evaluation, warnings));
        };

        // The deny is provisional while the hook runs: a successful retry
        // does not count as a denial.
        s.budget.actions_denied -= 1;

        let evolved = hook
            .on_denial(request, &evaluation.reasons, &s.policy)
            .await;

        let Some(new_policy) = evolved else {
            s.budget.actions_denied += 1;
            return Ok(self.respond(s, action_id, &evaluation, warnings));
        };

        info!(session = %s.id, tool = %request.tool, "policy evolved after denial; re-evaluating");
        s.policy = new_policy;

        let retry = {
            // Exclude the action being retried from its own history.
            let views: Vec<policy::ActionView> = s
                .actions
                .iter()
                .filter(|a| a.id != action_id)
                .map(crate::session::SessionAction::view)
                .collect();
            let view = SessionView {
                state: s.state,
                budget: &s.budget,
                actions: &views,
                rules: s.policy.session.as_ref(),
            };
            evaluate_session_action(request, &s.policy, &view, warden_core::ids::now_ms())
        };

        if let Some(action) = s.actions.iter_mut().find(|a| a.id == action_id) {
            action.validation = retry.evaluation.clone();
        }
        self.append_evaluation(s, action_id, &retry.evaluation, true)?;

        match retry.evaluation.verdict {
            Verdict::Allow => Ok(self.respond(s, action_id, &retry.evaluation, warnings)),
            Verdict::Gate => self.process_gate(s, action_id, retry.evaluation, warnings).await,
            Verdict::Deny => {
                // Still denied: the deny counts once, and the caller sees the
                // original reasons.
                s.budget.actions_denied += 1;
                Ok(self.respond(s, action_id, &evaluation, warnings))
            }
        }
    }

    /// Record the result of an allowed action. Succeeds at most once per
    /// action.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::UnknownAction`] and
    /// [`GatewayError::DuplicateResult`] as usage errors.
    pub async fn record_result(
        &self,
        session_id: &str,
        action_id: &str,
        result: ActionResult,
    ) -> Result<(), GatewayError> {
        let arc = self.session_arc(session_id)?;
        let mut s = arc.lock().await;

        let Some(action) = s.actions.iter_mut().find(|a| a.id == action_id) else {
            return Err(GatewayError::UnknownAction {
                session_id: session_id.to_string(),
                action_id: action_id.to_string(),
            });
        };
        if action.result.is_some() {
            return Err(GatewayError::DuplicateResult(action_id.to_string()));
        }
        action.result = Some(result.clone());
        s.budget.record_result(&result);

        s.ledger.append(
            &s.id,
            EventType::ActionResult,
            json!({
                "actionId": action_id,
                "success": result.success,
                "durationMs": result.duration_ms,
                "outputBytes": result.output_bytes(),
                "artifacts": result.artifacts.iter().map(|a| json!({"kind": a.kind, "label": a.label})).collect::<Vec<_>>(),
                "error": result.error,
            }),
        )?;
        s.touch();
        Ok(())
    }

    /// Resolve a pending gate from outside the evaluation path.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Gate`] for unknown `(session, action)` pairs.
    pub async fn resolve_gate(
        &self,
        session_id: &str,
        action_id: &str,
        decision: GateDecision,
        responded_by: Option<String>,
        reason: Option<String>,
    ) -> Result<EvaluateResponse, GatewayError> {
        let arc = self.session_arc(session_id)?;
        let mut s = arc.lock().await;

        let response = self
            .gates
            .resolve(session_id, action_id, decision, responded_by, reason)?;
        self.apply_resolution(&mut s, action_id, decision, &response)?;

        if decision == GateDecision::Rejected {
            if let Some(max) = s.policy.session.as_ref().and_then(|r| r.max_denials) {
                if s.budget.actions_denied >= max {
                    let _ = self
                        .terminate_locked(&mut s, Some(format!("Denial limit reached ({max})")))?;
                }
            }
        }

        let evaluation = self.action_eval(&s, action_id);
        Ok(self.respond(&s, action_id, &evaluation, Vec::new()))
    }

    /// Record a gate resolution on the session: flip the action's verdict,
    /// log the event, and resume the session when nothing is pending.
    fn apply_resolution(
        &self,
        s: &mut Session,
        action_id: &str,
        decision: GateDecision,
        response: &gates::GateResponse,
    ) -> Result<(), GatewayError> {
        if let Some(action) = s.actions.iter_mut().find(|a| a.id == action_id) {
            action.gate_resolution = Some(decision);
            action.validation.verdict = match decision {
                GateDecision::Approved => Verdict::Allow,
                GateDecision::Rejected => Verdict::Deny,
            };
        }
        if decision == GateDecision::Rejected {
            s.budget.actions_denied += 1;
        }

        let event = match decision {
            GateDecision::Approved => EventType::GateApproved,
            GateDecision::Rejected => EventType::GateRejected,
        };
        s.ledger.append(
            &s.id,
            event,
            json!({
                "actionId": action_id,
                "respondedBy": response.responded_by,
                "reason": response.reason,
            }),
        )?;

        if s.state == SessionState::Paused && !self.gates.has_pending(&s.id) {
            self.set_state(s, SessionState::Active, "gates resolved")?;
        }
        s.touch();
        Ok(())
    }

    /// Terminate a session, close its ledger and emit the report.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::UnknownSession`] and ledger failures.
    pub async fn terminate(
        &self,
        session_id: &str,
        reason: Option<String>,
    ) -> Result<SessionReport, GatewayError> {
        let arc = self.session_arc(session_id)?;
        let mut s = arc.lock().await;
        self.terminate_locked(&mut s, reason)
    }

    fn terminate_locked(
        &self,
        s: &mut Session,
        reason: Option<String>,
    ) -> Result<SessionReport, GatewayError> {
        if s.state == SessionState::Terminated {
            return Ok(s.report());
        }
        self.gates.clear_session(&s.id);
        s.state = SessionState::Terminated;
        s.terminated_at = Some(warden_core::ids::now_iso());
        s.termination_reason = reason.clone();

        let report = s.report();
        s.ledger.append(
            &s.id,
            EventType::SessionTerminate,
            json!({
                "reason": reason,
                "actionsEvaluated": report.actions_evaluated,
                "allowed": report.allowed,
                "denied": report.denied,
                "gated": report.gated,
            }),
        )?;
        s.ledger.close();
        info!(session = %s.id, reason = ?report.termination_reason, "session terminated");
        s.touch();
        Ok(report)
    }

    /// Snapshot of one session.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::UnknownSession`].
    pub async fn session_snapshot(&self, session_id: &str) -> Result<SessionSnapshot, GatewayError> {
        let arc = self.session_arc(session_id)?;
        let s = arc.lock().await;
        Ok(s.snapshot())
    }

    /// Snapshots of every session in the process.
    pub async fn list_sessions(&self) -> Vec<SessionSnapshot> {
        let mut out = Vec::new();
        let arcs: Vec<Arc<Mutex<Session>>> =
            self.sessions.iter().map(|e| Arc::clone(e.value())).collect();
        for arc in arcs {
            out.push(arc.lock().await.snapshot());
        }
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        out
    }

    /// End-of-session report for a (possibly still active) session.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::UnknownSession`].
    pub async fn report(&self, session_id: &str) -> Result<SessionReport, GatewayError> {
        let arc = self.session_arc(session_id)?;
        let s = arc.lock().await;
        Ok(s.report())
    }

    /// Clone of a session's active policy.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::UnknownSession`].
    pub async fn session_policy(&self, session_id: &str) -> Result<Policy, GatewayError> {
        let arc = self.session_arc(session_id)?;
        let s = arc.lock().await;
        Ok(s.policy.clone())
    }

    /// Install a new policy on a session (in-band evolution path). The
    /// policy must already be validated.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::UnknownSession`].
    pub async fn install_policy(&self, session_id: &str, policy: Policy) -> Result<(), GatewayError> {
        let arc = self.session_arc(session_id)?;
        let mut s = arc.lock().await;
        s.policy = policy;
        s.touch();
        Ok(())
    }

    /// Actions of a session, for compensation planning.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::UnknownSession`].
    pub async fn session_actions(&self, session_id: &str) -> Result<Vec<SessionAction>, GatewayError> {
        let arc = self.session_arc(session_id)?;
        let s = arc.lock().await;
        Ok(s.actions.clone())
    }

    /// Ledger file path for a session.
    #[must_use]
    pub fn ledger_path(&self, session_id: &str) -> PathBuf {
        self.config.ledger_dir.join(format!("{session_id}.jsonl"))
    }

    /// The ledger handle of a session, for compensation execution.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::UnknownSession`].
    pub async fn session_ledger(&self, session_id: &str) -> Result<Arc<Ledger>, GatewayError> {
        let arc = self.session_arc(session_id)?;
        let s = arc.lock().await;
        Ok(Arc::clone(&s.ledger))
    }

    fn set_state(
        &self,
        s: &mut Session,
        state: SessionState,
        why: &str,
    ) -> Result<(), GatewayError> {
        if s.state == state {
            return Ok(());
        }
        let from = s.state;
        s.state = state;
        s.ledger.append(
            &s.id,
            EventType::SessionStateChange,
            json!({"from": from, "to": state, "reason": why}),
        )?;
        Ok(())
    }

    fn action_eval(&self, s: &Session, action_id: &str) -> policy::Evaluation {
        s.actions
            .iter()
            .find(|a| a.id == action_id)
            .map(|a| a.validation.clone())
            .unwrap_or_else(|| policy::Evaluation::deny(action_id, Vec::new()))
    }

    fn append_evaluation(
        &self,
        s: &Session,
        action_id: &str,
        evaluation: &policy::Evaluation,
        retry: bool,
    ) -> Result<(), GatewayError> {
        let mut data = json!({
            "actionId": action_id,
            "tool": evaluation.tool,
            "verdict": evaluation.verdict,
            "reasons": evaluation.reason_strings(),
        });
        if let Some(gate) = &evaluation.gate {
            data["gate"] = json!(gate);
        }
        if retry {
            data["retry"] = json!(true);
        }
        s.ledger.append(&s.id, EventType::ActionEvaluate, data)?;
        Ok(())
    }

    fn respond(
        &self,
        s: &Session,
        action_id: &str,
        evaluation: &policy::Evaluation,
        warnings: Vec<String>,
    ) -> EvaluateResponse {
        EvaluateResponse {
            action_id: action_id.to_string(),
            decision: evaluation.verdict,
            reasons: evaluation.reasons.clone(),
            gate: evaluation.gate.clone(),
            budget: s.budget.clone(),
            warnings,
        }
    }
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("ledger_dir", &self.config.ledger_dir)
            .field("sessions", &self.sessions.len())
            .finish_non_exhaustive()
    }
}
