//! End-to-end session flows through the gateway.

use async_trait::async_trait;
use evolution::{EvolutionDecision, EvolutionEngine, EvolutionPrompt, PolicySuggestion};
use gates::GateDecision;
use gateway::{EvolutionDenialHook, Gateway, GatewayConfig};
use ledger::{verify_integrity, EventType};
use policy::Policy;
use serde_json::json;
use std::sync::Arc;
use warden_core::{ActionRequest, ActionResult, Artifact, ArtifactKind, SessionState, Verdict};

const SCOPED_READS: &str = r#"
name: scoped-reads
capabilities:
  - tool: "file:read"
    scope:
      paths: ["/data/**"]
forbidden:
  - pattern: "**/.env"
"#;

fn gateway(dir: &std::path::Path) -> Gateway {
    Gateway::new(GatewayConfig::new(dir))
}

fn read(path: &str) -> ActionRequest {
    ActionRequest::new("file:read", json!({"path": path}))
}

#[tokio::test]
async fn evaluate_within_scope_allows_and_logs() {
    let dir = tempfile::tempdir().unwrap();
    let gw = gateway(dir.path());
    let session = gw
        .create_session(Policy::from_yaml_str(SCOPED_READS).unwrap(), json!({}))
        .unwrap();

    let response = gw.evaluate(&session, read("/data/in/a.txt")).await.unwrap();
    assert_eq!(response.decision, Verdict::Allow);
    assert!(response.reasons.is_empty());

    let entries = ledger::read_entries(gw.ledger_path(&session)).unwrap();
    assert_eq!(entries[0].event_type, EventType::SessionStart);
    assert_eq!(entries[1].event_type, EventType::ActionEvaluate);
    assert_eq!(entries[1].data["verdict"], "allow");
}

#[tokio::test]
async fn forbidden_beats_capability() {
    let dir = tempfile::tempdir().unwrap();
    let gw = gateway(dir.path());
    let session = gw
        .create_session(Policy::from_yaml_str(SCOPED_READS).unwrap(), json!({}))
        .unwrap();

    let response = gw.evaluate(&session, read("/data/.env")).await.unwrap();
    assert_eq!(response.decision, Verdict::Deny);
    assert!(response.reason_strings()[0]
        .starts_with("Path \"/data/.env\" matches forbidden pattern"));
}

#[tokio::test]
async fn escalation_pauses_session_after_three_reads() {
    let yaml = r#"
name: escalating
capabilities:
  - tool: "file:read"
    scope:
      paths: ["/data/**"]
session:
  escalation:
    - after_actions: 3
      require: human_checkin
"#;
    let dir = tempfile::tempdir().unwrap();
    let gw = gateway(dir.path());
    let session = gw
        .create_session(Policy::from_yaml_str(yaml).unwrap(), json!({}))
        .unwrap();

    for i in 0..3 {
        let response = gw
            .evaluate(&session, read(&format!("/data/{i}.txt")))
            .await
            .unwrap();
        assert_eq!(response.decision, Verdict::Allow, "read {i}");
    }

    let response = gw.evaluate(&session, read("/data/3.txt")).await.unwrap();
    assert_eq!(response.decision, Verdict::Gate);
    let gate = response.gate.as_ref().unwrap();
    assert_eq!(gate.condition.as_deref(), Some("after_actions:3"));

    let snapshot = gw.session_snapshot(&session).await.unwrap();
    assert_eq!(snapshot.state, SessionState::Paused);

    let entries = ledger::read_entries(gw.ledger_path(&session)).unwrap();
    assert!(entries
        .iter()
        .any(|e| e.event_type == EventType::EscalationTriggered));

    // Resolving the check-in resumes the session and satisfies the rule.
    let response = gw
        .resolve_gate(
            &session,
            &response.action_id,
            GateDecision::Approved,
            Some("operator".into()),
            None,
        )
        .await
        .unwrap();
    assert_eq!(response.decision, Verdict::Allow);
    let snapshot = gw.session_snapshot(&session).await.unwrap();
    assert_eq!(snapshot.state, SessionState::Active);

    let response = gw.evaluate(&session, read("/data/4.txt")).await.unwrap();
    assert_eq!(response.decision, Verdict::Allow);
}

#[tokio::test]
async fn rate_limit_denies_the_third_call_in_a_minute() {
    let yaml = r#"
name: limited
capabilities:
  - tool: "file:read"
    scope:
      paths: ["/data/**"]
session:
  rate_limit:
    max_per_minute: 2
"#;
    let dir = tempfile::tempdir().unwrap();
    let gw = gateway(dir.path());
    let session = gw
        .create_session(Policy::from_yaml_str(yaml).unwrap(), json!({}))
        .unwrap();

    for i in 0..2 {
        let response = gw
            .evaluate(&session, read(&format!("/data/{i}.txt")))
            .await
            .unwrap();
        assert_eq!(response.decision, Verdict::Allow);
    }
    let response = gw.evaluate(&session, read("/data/2.txt")).await.unwrap();
    assert_eq!(response.decision, Verdict::Deny);
    assert!(response.reason_strings()[0].starts_with("Rate limit exceeded"));
}

struct AlwaysDecide(EvolutionDecision);

#[async_trait]
impl EvolutionPrompt for AlwaysDecide {
    async fn decide(
        &self,
        _suggestion: &PolicySuggestion,
        _action: &ActionRequest,
    ) -> Option<EvolutionDecision> {
        Some(self.0)
    }
}

#[tokio::test]
async fn evolution_round_trip_allows_after_add_to_policy() {
    let dir = tempfile::tempdir().unwrap();
    let policy_path = dir.path().join("policy.yaml");
    let engine = Arc::new(
        EvolutionEngine::new(Some(policy_path.clone()))
            .with_prompt(Arc::new(AlwaysDecide(EvolutionDecision::AddToPolicy))),
    );
    let gw = Gateway::new(GatewayConfig::new(dir.path().join("ledgers")))
        .with_denial_hook(Arc::new(EvolutionDenialHook::new(engine)));
    let session = gw
        .create_session(Policy::from_yaml_str(SCOPED_READS).unwrap(), json!({}))
        .unwrap();

    let request = ActionRequest::new("file:write", json!({"path": "/data/out/r.txt"}));
    let response = gw.evaluate(&session, request.clone()).await.unwrap();
    // The hook mutated the policy and the retry allowed the action.
    assert_eq!(response.decision, Verdict::Allow);

    // A successful retry does not count as a denial.
    assert_eq!(response.budget.actions_denied, 0);
    assert_eq!(response.budget.actions_evaluated, 1);

    // Subsequent evaluation of the same request allows without the hook.
    let response = gw.evaluate(&session, request).await.unwrap();
    assert_eq!(response.decision, Verdict::Allow);

    // The persisted policy re-parses and contains the new capability.
    let on_disk = Policy::load(&policy_path).unwrap();
    assert!(on_disk.capability_for("file:write").is_some());

    // The ledger carries both the original denial and the retry verdict.
    let entries = ledger::read_entries(gw.ledger_path(&session)).unwrap();
    let evals: Vec<_> = entries
        .iter()
        .filter(|e| e.event_type == EventType::ActionEvaluate)
        .collect();
    assert_eq!(evals.len(), 3);
    assert_eq!(evals[0].data["verdict"], "deny");
    assert_eq!(evals[1].data["retry"], true);
    assert_eq!(evals[1].data["verdict"], "allow");
}

#[tokio::test]
async fn denial_limit_terminates_the_session() {
    let yaml = r#"
name: strict
capabilities:
  - tool: "file:read"
    scope:
      paths: ["/data/**"]
session:
  max_denials: 2
"#;
    let dir = tempfile::tempdir().unwrap();
    let gw = gateway(dir.path());
    let session = gw
        .create_session(Policy::from_yaml_str(yaml).unwrap(), json!({}))
        .unwrap();

    for _ in 0..2 {
        let response = gw.evaluate(&session, read("/etc/passwd")).await.unwrap();
        assert_eq!(response.decision, Verdict::Deny);
    }

    let snapshot = gw.session_snapshot(&session).await.unwrap();
    assert_eq!(snapshot.state, SessionState::Terminated);

    // Terminated sessions reject further evaluation.
    let response = gw.evaluate(&session, read("/data/ok.txt")).await.unwrap();
    assert_eq!(response.decision, Verdict::Deny);
    assert_eq!(
        response.reason_strings()[0],
        "Session is not active (state: terminated)"
    );
}

#[tokio::test]
async fn record_result_updates_budget_and_rejects_duplicates() {
    let dir = tempfile::tempdir().unwrap();
    let gw = gateway(dir.path());
    let session = gw
        .create_session(Policy::from_yaml_str(SCOPED_READS).unwrap(), json!({}))
        .unwrap();

    let response = gw.evaluate(&session, read("/data/a.txt")).await.unwrap();
    let result = ActionResult::ok(
        Some(json!({"content": "hello"})),
        vec![Artifact::new(ArtifactKind::Checksum, "/data/a.txt", json!("sha256:00"))],
        5,
    );
    gw.record_result(&session, &response.action_id, result.clone())
        .await
        .unwrap();

    let snapshot = gw.session_snapshot(&session).await.unwrap();
    assert_eq!(snapshot.budget.files_changed, 1);
    assert!(snapshot.budget.total_output_bytes > 0);

    // Second recording for the same action is a usage error.
    let err = gw
        .record_result(&session, &response.action_id, result)
        .await
        .unwrap_err();
    assert!(matches!(err, gateway::GatewayError::DuplicateResult(_)));

    // Unknown action id is a usage error too.
    let err = gw
        .record_result(&session, "nope", ActionResult::err("x", 1))
        .await
        .unwrap_err();
    assert!(matches!(err, gateway::GatewayError::UnknownAction { .. }));
}

#[tokio::test]
async fn full_session_ledger_verifies_and_counters_match() {
    let dir = tempfile::tempdir().unwrap();
    let gw = gateway(dir.path());
    let session = gw
        .create_session(Policy::from_yaml_str(SCOPED_READS).unwrap(), json!({"source": "test"}))
        .unwrap();

    let mut denied = 0u64;
    for path in ["/data/a", "/etc/passwd", "/data/b", "/data/.env"] {
        let response = gw.evaluate(&session, read(path)).await.unwrap();
        if response.decision == Verdict::Deny {
            denied += 1;
        }
    }

    let snapshot = gw.session_snapshot(&session).await.unwrap();
    assert_eq!(snapshot.budget.actions_evaluated, 4);
    assert_eq!(snapshot.budget.actions_evaluated as usize, snapshot.actions.len());
    assert_eq!(snapshot.budget.actions_denied, denied);
    assert_eq!(denied, 2);

    let report = gw.terminate(&session, Some("done".into())).await.unwrap();
    assert_eq!(report.state, SessionState::Terminated);
    assert_eq!(report.denied, 2);
    assert_eq!(report.allowed, 2);

    let verify = verify_integrity(gw.ledger_path(&session)).unwrap();
    assert!(verify.valid, "{verify:?}");

    let summary = ledger::summarize(gw.ledger_path(&session)).unwrap();
    assert_eq!(summary.by_type.get("action:evaluate"), Some(&4));
    assert_eq!(summary.by_type.get("session:terminate"), Some(&1));
}

#[tokio::test]
async fn human_gate_stays_pending_then_rejection_denies() {
    let yaml = r#"
name: gated-writes
capabilities:
  - tool: "file:write"
    scope:
      paths: ["/data/**"]
gates:
  - action: "file:write"
    approval: human
    risk_level: medium
"#;
    let dir = tempfile::tempdir().unwrap();
    let gw = gateway(dir.path());
    let session = gw
        .create_session(Policy::from_yaml_str(yaml).unwrap(), json!({}))
        .unwrap();

    let request = ActionRequest::new("file:write", json!({"path": "/data/out.txt", "content": "x"}));
    let response = gw.evaluate(&session, request).await.unwrap();
    assert_eq!(response.decision, Verdict::Gate);

    let snapshot = gw.session_snapshot(&session).await.unwrap();
    assert_eq!(snapshot.state, SessionState::Paused);

    let resolved = gw
        .resolve_gate(
            &session,
            &response.action_id,
            GateDecision::Rejected,
            Some("operator".into()),
            Some("not today".into()),
        )
        .await
        .unwrap();
    assert_eq!(resolved.decision, Verdict::Deny);

    let snapshot = gw.session_snapshot(&session).await.unwrap();
    assert_eq!(snapshot.state, SessionState::Active);
    assert_eq!(snapshot.budget.actions_denied, 1);

    let entries = ledger::read_entries(gw.ledger_path(&session)).unwrap();
    assert!(entries.iter().any(|e| e.event_type == EventType::GateRequested));
    assert!(entries.iter().any(|e| e.event_type == EventType::GateRejected));
}
