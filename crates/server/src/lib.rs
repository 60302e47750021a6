//! HTTP REST facade over the governance gateway.
//!
//! Endpoints mirror the gateway surface one-to-one: session creation,
//! evaluation, result recording, gate resolution, termination, reports and
//! ledger inspection. Error responses carry `{"error": "..."}` with 4xx/5xx
//! status codes.

#![deny(unsafe_code)]

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use gates::GateDecision;
use gateway::{Gateway, GatewayError};
use policy::Policy;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;
use warden_core::{ActionRequest, ActionResult};

/// Shared state behind the router.
#[derive(Clone)]
pub struct AppState {
    /// The gateway owning all sessions.
    pub gateway: Arc<Gateway>,
    /// Policy installed on sessions created without an inline policy.
    pub default_policy: Option<Arc<Policy>>,
}

/// API error with an HTTP status.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<GatewayError> for ApiError {
    fn from(e: GatewayError) -> Self {
        let status = match &e {
            GatewayError::UnknownSession(_) | GatewayError::UnknownAction { .. } => {
                StatusCode::NOT_FOUND
            }
            GatewayError::DuplicateResult(_) => StatusCode::CONFLICT,
            GatewayError::Gate(_) => StatusCode::NOT_FOUND,
            GatewayError::Ledger(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: e.to_string(),
        }
    }
}

impl From<ledger::LedgerError> for ApiError {
    fn from(e: ledger::LedgerError) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({"error": self.message}))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Build the router with every endpoint mounted.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/validate", post(validate_policy))
        .route("/sessions", post(create_session).get(list_sessions))
        .route("/sessions/:id", get(get_session))
        .route("/sessions/:id/evaluate", post(evaluate))
        .route("/sessions/:id/record", post(record))
        .route("/sessions/:id/approve", post(approve))
        .route("/sessions/:id/reject", post(reject))
        .route("/sessions/:id/terminate", post(terminate))
        .route("/sessions/:id/report", get(report))
        .route("/sessions/:id/ledger", get(ledger_entries))
        .route("/sessions/:id/ledger/summary", get(ledger_summary))
        .route("/sessions/:id/ledger/verify", get(ledger_verify))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the facade until the process exits.
///
/// # Errors
///
/// Returns bind/serve failures.
pub async fn serve(state: AppState, addr: SocketAddr) -> Result<(), std::io::Error> {
    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "http facade listening");
    axum::serve(listener, router).await
}

async fn health() -> Json<JsonValue> {
    Json(json!({"status": "ok"}))
}

async fn validate_policy(body: String) -> ApiResult<Json<JsonValue>> {
    match Policy::from_yaml_str(&body) {
        Ok(policy) => Ok(Json(json!({"valid": true, "name": policy.name}))),
        Err(policy::PolicyError::Invalid(issues)) => Ok(Json(json!({
            "valid": false,
            "issues": issues.iter().map(|i| json!({"path": i.path, "message": i.message})).collect::<Vec<_>>(),
        }))),
        Err(e) => Err(ApiError::bad_request(e.to_string())),
    }
}

#[derive(Debug, Deserialize)]
struct CreateSessionBody {
    /// Inline policy YAML; the server's default policy when absent.
    #[serde(default)]
    policy: Option<String>,
    #[serde(default)]
    metadata: JsonValue,
}

async fn create_session(
    State(state): State<AppState>,
    Json(body): Json<CreateSessionBody>,
) -> ApiResult<Json<JsonValue>> {
    let policy = match body.policy {
        Some(yaml) => {
            Policy::from_yaml_str(&yaml).map_err(|e| ApiError::bad_request(e.to_string()))?
        }
        None => match &state.default_policy {
            Some(policy) => (**policy).clone(),
            None => {
                return Err(ApiError::bad_request(
                    "no policy in request and no default policy configured",
                ))
            }
        },
    };
    let session_id = state.gateway.create_session(policy, body.metadata)?;
    let snapshot = state.gateway.session_snapshot(&session_id).await?;
    Ok(Json(json!({"session": snapshot})))
}

async fn list_sessions(State(state): State<AppState>) -> Json<JsonValue> {
    Json(json!({"sessions": state.gateway.list_sessions().await}))
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<JsonValue>> {
    Ok(Json(json!({"session": state.gateway.session_snapshot(&id).await?})))
}

#[derive(Debug, Deserialize)]
struct EvaluateBody {
    tool: String,
    #[serde(default)]
    input: JsonValue,
}

async fn evaluate(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<EvaluateBody>,
) -> ApiResult<Json<JsonValue>> {
    let response = state
        .gateway
        .evaluate(&id, ActionRequest::new(body.tool, body.input))
        .await?;
    Ok(Json(json!({
        "actionId": response.action_id,
        "decision": response.decision,
        "reasons": response.reason_strings(),
        "gate": response.gate,
        "budget": response.budget,
        "warnings": response.warnings,
    })))
}

#[derive(Debug, Deserialize)]
struct RecordBody {
    action_id: String,
    result: ActionResult,
}

async fn record(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<RecordBody>,
) -> ApiResult<Json<JsonValue>> {
    state
        .gateway
        .record_result(&id, &body.action_id, body.result)
        .await?;
    Ok(Json(json!({"recorded": true})))
}

#[derive(Debug, Deserialize)]
struct ResolveBody {
    action_id: String,
    #[serde(default)]
    responded_by: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

async fn approve(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ResolveBody>,
) -> ApiResult<Json<JsonValue>> {
    resolve(state, id, body, GateDecision::Approved).await
}

async fn reject(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ResolveBody>,
) -> ApiResult<Json<JsonValue>> {
    resolve(state, id, body, GateDecision::Rejected).await
}

async fn resolve(
    state: AppState,
    id: String,
    body: ResolveBody,
    decision: GateDecision,
) -> ApiResult<Json<JsonValue>> {
    let response = state
        .gateway
        .resolve_gate(&id, &body.action_id, decision, body.responded_by, body.reason)
        .await?;
    Ok(Json(json!({
        "actionId": response.action_id,
        "decision": response.decision,
    })))
}

#[derive(Debug, Deserialize, Default)]
struct TerminateBody {
    #[serde(default)]
    reason: Option<String>,
}

async fn terminate(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<TerminateBody>>,
) -> ApiResult<Json<JsonValue>> {
    let reason = body.and_then(|b| b.0.reason);
    let report = state.gateway.terminate(&id, reason).await?;
    Ok(Json(json!({"report": report})))
}

async fn report(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<JsonValue>> {
    Ok(Json(json!({"report": state.gateway.report(&id).await?})))
}

async fn ledger_entries(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<JsonValue>> {
    // Resolve the session first so unknown ids 404 rather than 500.
    state.gateway.session_snapshot(&id).await?;
    let entries = ledger::read_entries(state.gateway.ledger_path(&id))?;
    Ok(Json(json!({"entries": entries})))
}

async fn ledger_summary(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<JsonValue>> {
    state.gateway.session_snapshot(&id).await?;
    let summary = ledger::summarize(state.gateway.ledger_path(&id))?;
    Ok(Json(json!({"summary": summary})))
}

async fn ledger_verify(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<JsonValue>> {
    state.gateway.session_snapshot(&id).await?;
    let report = ledger::verify_integrity(state.gateway.ledger_path(&id))?;
    Ok(Json(json!({"verify": report})))
}
