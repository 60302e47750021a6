//! The virtual MCP server fronting the gateway.

use evolution::{EvolutionDecision, EvolutionEngine, PendingSuggestions};
use gateway::{Gateway, GatewayConfig};
use policy::Policy;
use rmcp::model::{
    CallToolRequestParams, CallToolResult, Content, ListToolsResult, PaginatedRequestParams,
    RawContent, ServerCapabilities, ServerInfo, Tool,
};
use rmcp::service::{RequestContext, RoleServer};
use rmcp::transport::stdio;
use rmcp::{ErrorData, ServerHandler, ServiceExt};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};
use warden_core::{ActionRequest, ActionResult, Verdict};

use crate::backend::{build_tool_map, Backend, BackendConfig};
use crate::ProxyError;

/// Name of the virtual tool accepting in-band evolution decisions.
pub const POLICY_EVOLUTION_TOOL: &str = "policy_evolution_approve";

/// Proxy configuration file.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProxyConfig {
    /// Policy file guarding every call.
    pub policy: PathBuf,
    /// Ledger directory.
    #[serde(default = "default_ledger_dir")]
    pub ledger_dir: PathBuf,
    /// Enable denial-driven policy evolution.
    #[serde(default)]
    pub evolve: bool,
    /// Auto-approve human gates whose declared risk is at or below this
    /// level; riskier gates stay pending for external resolution.
    #[serde(default)]
    pub auto_approve_below: Option<warden_core::RiskLevel>,
    /// Backend tool servers.
    pub backends: Vec<BackendConfig>,
}

fn default_ledger_dir() -> PathBuf {
    PathBuf::from("./ledgers")
}

impl ProxyConfig {
    /// Load a YAML proxy config.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Io`] / [`ProxyError::Config`].
    pub fn load(path: impl AsRef<std::path::Path>) -> Result<Self, ProxyError> {
        let s = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&s)?)
    }
}

struct ProxyState {
    gateway: Arc<Gateway>,
    session_id: String,
    backends: Vec<Backend>,
    tool_map: HashMap<String, usize>,
    evolution: Option<EvolutionState>,
}

struct EvolutionState {
    engine: Arc<EvolutionEngine>,
    pending: PendingSuggestions,
}

/// The virtual server exposed to the agent.
#[derive(Clone)]
pub struct WardenProxy {
    state: Arc<ProxyState>,
    /// Serializes backend shutdown against in-flight calls.
    shutdown: Arc<Mutex<bool>>,
}

impl WardenProxy {
    /// Connect every backend and bind one gateway session.
    ///
    /// # Errors
    ///
    /// Propagates backend connection and session creation failures.
    pub async fn connect(
        gateway: Arc<Gateway>,
        session_id: String,
        configs: &[BackendConfig],
        evolution: Option<Arc<EvolutionEngine>>,
    ) -> Result<Self, ProxyError> {
        let mut backends = Vec::with_capacity(configs.len());
        for config in configs {
            backends.push(Backend::connect(config).await?);
        }
        let tool_map = build_tool_map(&backends);
        info!(
            backends = backends.len(),
            tools = tool_map.len(),
            session = %session_id,
            "proxy ready"
        );
        Ok(Self {
            state: Arc::new(ProxyState {
                gateway,
                session_id,
                backends,
                tool_map,
                evolution: evolution.map(|engine| EvolutionState {
                    engine,
                    pending: PendingSuggestions::new(),
                }),
            }),
            shutdown: Arc::new(Mutex::new(false)),
        })
    }

    /// Aggregated tool list: every backend tool with a `[backend]`
    /// description prefix, plus the evolution virtual tool when enabled.
    fn aggregated_tools(&self) -> Vec<Tool> {
        let mut tools = Vec::new();
        for (name, &index) in &self.state.tool_map {
            let backend = &self.state.backends[index];
            if let Some(tool) = backend.tools.iter().find(|t| t.name.as_ref() == name.as_str()) {
                let mut tool = tool.clone();
                let description = tool.description.as_deref().unwrap_or_default();
                tool.description =
                    Some(format!("[{}] {description}", backend.name).into());
                tools.push(tool);
            }
        }
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        if self.state.evolution.is_some() {
            if let Some(tool) = evolution_tool() {
                tools.push(tool);
            }
        }
        tools
    }

    async fn handle_call(&self, name: &str, args: JsonValue) -> CallToolResult {
        if name == POLICY_EVOLUTION_TOOL {
            return self.handle_evolution_approve(&args).await;
        }

        let Some(&backend_index) = self.state.tool_map.get(name) else {
            return error_result(format!("Unknown tool \"{name}\""));
        };

        let request = ActionRequest::new(name, args.clone());
        let response = match self
            .state
            .gateway
            .evaluate(&self.state.session_id, request.clone())
            .await
        {
            Ok(r) => r,
            Err(e) => return error_result(format!("Evaluation failed: {e}")),
        };

        match response.decision {
            Verdict::Deny => self.denial_response(&request, &response).await,
            Verdict::Gate => error_result(format!(
                "Action {} is awaiting approval (gate: {})",
                response.action_id,
                response
                    .gate
                    .as_ref()
                    .map(|g| g.approval.to_string())
                    .unwrap_or_default()
            )),
            Verdict::Allow => {
                self.forward(backend_index, name, args, &response.action_id)
                    .await
            }
        }
    }

    /// Call the backend and record the outcome for an allowed action.
    async fn forward(
        &self,
        backend_index: usize,
        name: &str,
        args: JsonValue,
        action_id: &str,
    ) -> CallToolResult {
        let backend = &self.state.backends[backend_index];
        let started = warden_core::ids::now_ms();
        match backend.call_tool(name, args).await {
            Ok(result) => {
                let duration = warden_core::ids::now_ms().saturating_sub(started);
                let success = !result.is_error.unwrap_or(false);
                let text = text_content(&result);
                let recorded = if success {
                    ActionResult::ok(Some(json!(text)), Vec::new(), duration)
                } else {
                    let mut r = ActionResult::err(text.clone(), duration);
                    r.output = Some(json!(text));
                    r
                };
                if let Err(e) = self
                    .state
                    .gateway
                    .record_result(&self.state.session_id, action_id, recorded)
                    .await
                {
                    warn!(action = %action_id, error = %e, "failed to record result");
                }
                result
            }
            Err(message) => {
                let duration = warden_core::ids::now_ms().saturating_sub(started);
                let recorded = ActionResult::err(message.clone(), duration);
                if let Err(e) = self
                    .state
                    .gateway
                    .record_result(&self.state.session_id, action_id, recorded)
                    .await
                {
                    warn!(action = %action_id, error = %e, "failed to record result");
                }
                error_result(format!("Backend call failed: {message}"))
            }
        }
    }

    /// Denial response, with a bound suggestion when evolution is enabled.
    async fn denial_response(
        &self,
        request: &ActionRequest,
        response: &gateway::EvaluateResponse,
    ) -> CallToolResult {
        let reasons = response.reason_strings();
        if let Some(evolution) = &self.state.evolution {
            let policy = match self
                .state
                .gateway
                .session_policy(&self.state.session_id)
                .await
            {
                Ok(p) => p,
                Err(e) => return error_result(format!("Denied: {}; ({e})", reasons.join("; "))),
            };
            if let Some(suggestion) =
                evolution
                    .engine
                    .suggest(request, &response.reasons, &policy)
            {
                let description = suggestion.describe();
                let id = evolution.pending.insert(
                    suggestion,
                    request.clone(),
                    &self.state.session_id,
                );
                let body = json!({
                    "status": "denied",
                    "reasons": reasons,
                    "suggestion": {
                        "id": id,
                        "description": description,
                        "decide_with": POLICY_EVOLUTION_TOOL,
                        "decisions": ["add-to-policy", "allow-once", "deny"],
                    },
                });
                return error_result(body.to_string());
            }
        }
        error_result(format!("Denied by policy: {}", reasons.join("; ")))
    }

    /// In-band decision on a pending suggestion.
    async fn handle_evolution_approve(&self, args: &JsonValue) -> CallToolResult {
        let Some(evolution) = &self.state.evolution else {
            return error_result("Policy evolution is not enabled".to_string());
        };

        let Some(suggestion_id) = args.get("suggestion_id").and_then(JsonValue::as_str) else {
            return error_result("Missing required argument \"suggestion_id\"".to_string());
        };
        let decision = match args
            .get("decision")
            .and_then(JsonValue::as_str)
            .map(str::parse::<EvolutionDecision>)
        {
            Some(Ok(d)) => d,
            Some(Err(e)) => return error_result(e),
            None => return error_result("Missing required argument \"decision\"".to_string()),
        };

        let pending = match evolution.pending.take(suggestion_id) {
            Ok(p) => p,
            Err(e) => return error_result(e.to_string()),
        };

        if decision == EvolutionDecision::Deny {
            return text_result(json!({"status": "denial kept"}).to_string());
        }

        let policy = match self
            .state
            .gateway
            .session_policy(&self.state.session_id)
            .await
        {
            Ok(p) => p,
            Err(e) => return error_result(e.to_string()),
        };

        match evolution
            .engine
            .apply_decision(&pending.suggestion, decision, &policy)
        {
            Ok(Some(evolved)) => {
                if let Err(e) = self
                    .state
                    .gateway
                    .install_policy(&self.state.session_id, evolved.policy)
                    .await
                {
                    return error_result(e.to_string());
                }
                text_result(
                    json!({
                        "status": "applied",
                        "persisted": evolved.persisted,
                        "description": pending.suggestion.describe(),
                    })
                    .to_string(),
                )
            }
            Ok(None) => text_result(json!({"status": "denial kept"}).to_string()),
            Err(e) => error_result(format!("Evolution step failed: {e}")),
        }
    }

    /// Terminate the session and close every backend transport.
    pub async fn shutdown(self) {
        let mut done = self.shutdown.lock().await;
        if *done {
            return;
        }
        *done = true;
        drop(done);

        if let Err(e) = self
            .state
            .gateway
            .terminate(&self.state.session_id, Some("MCP proxy stopped".into()))
            .await
        {
            warn!(error = %e, "session termination failed");
        }
        // Backends close even when termination failed.
        match Arc::try_unwrap(self.state) {
            Ok(state) => {
                for backend in state.backends {
                    backend.shutdown().await;
                }
            }
            Err(_) => warn!("backend transports still referenced; relying on process exit"),
        }
    }
}

impl ServerHandler for WardenProxy {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(
                "Warden governance proxy. Tool calls are evaluated against a policy \
                 before being forwarded; denials may carry a policy suggestion id."
                    .into(),
            ),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }

    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, ErrorData> {
        Ok(ListToolsResult {
            tools: self.aggregated_tools(),
            ..Default::default()
        })
    }

    async fn call_tool(
        &self,
        params: CallToolRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, ErrorData> {
        let args = params
            .arguments
            .map(JsonValue::Object)
            .unwrap_or(JsonValue::Null);
        Ok(self.handle_call(params.name.as_ref(), args).await)
    }
}

/// Build the `policy_evolution_approve` tool definition.
fn evolution_tool() -> Option<Tool> {
    serde_json::from_value(json!({
        "name": POLICY_EVOLUTION_TOOL,
        "description": "Decide on a pending policy suggestion produced by a denial",
        "inputSchema": {
            "type": "object",
            "properties": {
                "suggestion_id": { "type": "string" },
                "decision": { "type": "string", "enum": ["add-to-policy", "allow-once", "deny"] }
            },
            "required": ["suggestion_id", "decision"]
        }
    }))
    .ok()
}

fn text_result(text: String) -> CallToolResult {
    CallToolResult::success(vec![Content::text(text)])
}

fn error_result(text: String) -> CallToolResult {
    CallToolResult::error(vec![Content::text(text)])
}

/// Concatenated text content of a backend response.
fn text_content(result: &CallToolResult) -> String {
    result
        .content
        .iter()
        .filter_map(|c| match &c.raw {
            RawContent::Text(t) => Some(t.text.clone()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Run the proxy on stdio until the client disconnects.
///
/// # Errors
///
/// Propagates config, backend and serve failures.
pub async fn run(config: ProxyConfig) -> Result<(), ProxyError> {
    let policy = Policy::load(&config.policy)?;
    let gateway = Arc::new(Gateway::new(GatewayConfig::new(&config.ledger_dir)));
    let session_id = gateway.create_session(policy, json!({"source": "mcp-proxy"}))?;

    if let Some(threshold) = config.auto_approve_below {
        gateway.gates().register_handler(
            "human",
            Arc::new(gates::RiskThresholdHandler::new(threshold)),
        );
    }

    let evolution = config.evolve.then(|| {
        Arc::new(EvolutionEngine::new(Some(config.policy.clone())))
    });

    let proxy = WardenProxy::connect(gateway, session_id, &config.backends, evolution).await?;

    let service = proxy
        .clone()
        .serve(stdio())
        .await
        .map_err(|e| ProxyError::Serve(e.to_string()))?;
    service
        .waiting()
        .await
        .map_err(|e| ProxyError::Serve(e.to_string()))?;

    proxy.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway::GatewayConfig;

    const POLICY: &str = r#"
name: proxy-test
capabilities:
  - tool: "echo"
"#;

    async fn proxy_without_backends(
        evolve: bool,
    ) -> (WardenProxy, Arc<Gateway>, String, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let gateway = Arc::new(Gateway::new(GatewayConfig::new(dir.path().join("ledgers"))));
        let session_id = gateway
            .create_session(Policy::from_yaml_str(POLICY).unwrap(), json!({"source": "mcp-proxy"}))
            .unwrap();
        let engine = evolve.then(|| Arc::new(EvolutionEngine::new(None)));
        let proxy = WardenProxy::connect(Arc::clone(&gateway), session_id.clone(), &[], engine)
            .await
            .unwrap();
        (proxy, gateway, session_id, dir)
    }

    #[tokio::test]
    async fn unknown_tool_is_an_error_response() {
        let (proxy, _gw, _sid, _dir) = proxy_without_backends(false).await;
        let result = proxy.handle_call("nope", json!({})).await;
        assert_eq!(result.is_error, Some(true));
        assert!(text_content(&result).contains("Unknown tool"));
    }

    #[tokio::test]
    async fn denial_without_evolution_is_plain() {
        let (proxy, _gw, sid, _dir) = proxy_without_backends(false).await;
        // "echo" is capable but has no backend; use an uncapable tool name
        // that maps to no backend either: the map lookup fires first, so
        // exercise the denial through the gateway directly.
        let response = proxy
            .state
            .gateway
            .evaluate(&sid, ActionRequest::new("file:write", json!({"path": "/x"})))
            .await
            .unwrap();
        assert_eq!(response.decision, Verdict::Deny);
        let result = proxy
            .denial_response(
                &ActionRequest::new("file:write", json!({"path": "/x"})),
                &response,
            )
            .await;
        assert_eq!(result.is_error, Some(true));
        assert!(text_content(&result).contains("Denied by policy"));
    }

    #[tokio::test]
    async fn evolution_approve_round_trip() {
        let (proxy, gateway, sid, _dir) = proxy_without_backends(true).await;

        let request = ActionRequest::new("file:write", json!({"path": "/data/out.txt"}));
        let response = gateway.evaluate(&sid, request.clone()).await.unwrap();
        assert_eq!(response.decision, Verdict::Deny);

        // Denial carries a suggestion id.
        let result = proxy.denial_response(&request, &response).await;
        let body: JsonValue = serde_json::from_str(&text_content(&result)).unwrap();
        let suggestion_id = body["suggestion"]["id"].as_str().unwrap().to_string();
        assert_eq!(suggestion_id.len(), 12);

        // allow-once: the session policy is mutated in place.
        let result = proxy
            .handle_evolution_approve(&json!({
                "suggestion_id": suggestion_id,
                "decision": "allow-once"
            }))
            .await;
        assert_ne!(result.is_error, Some(true), "{}", text_content(&result));

        let response = gateway.evaluate(&sid, request).await.unwrap();
        assert_eq!(response.decision, Verdict::Allow);
    }

    #[tokio::test]
    async fn unknown_suggestion_id_errors() {
        let (proxy, _gw, _sid, _dir) = proxy_without_backends(true).await;
        let result = proxy
            .handle_evolution_approve(&json!({
                "suggestion_id": "nosuchsugges",
                "decision": "allow-once"
            }))
            .await;
        assert_eq!(result.is_error, Some(true));
        assert!(text_content(&result).contains("unknown suggestion"));
    }

    #[tokio::test]
    async fn evolution_tool_listed_only_when_enabled() {
        let (proxy, _gw, _sid, _dir) = proxy_without_backends(true).await;
        assert!(proxy
            .aggregated_tools()
            .iter()
            .any(|t| t.name.as_ref() == POLICY_EVOLUTION_TOOL));

        let (proxy, _gw, _sid, _dir) = proxy_without_backends(false).await;
        assert!(proxy.aggregated_tools().is_empty());
    }
}
