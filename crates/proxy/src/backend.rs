//! Backend tool servers: spawn, handshake, call.

use rmcp::model::{CallToolRequestParams, CallToolResult, ClientInfo, Implementation, Tool};
use rmcp::service::{RoleClient, RunningService};
use rmcp::transport::TokioChildProcess;
use rmcp::ServiceExt;
use serde::Deserialize;
use std::borrow::Cow;
use std::collections::HashMap;
use tracing::{info, warn};

use crate::ProxyError;

/// One backend server in the proxy config.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackendConfig {
    /// Display name used for disambiguation.
    pub name: String,
    /// Executable to spawn.
    pub command: String,
    /// Arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment variables.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Minimal client handler for backend connections; the proxy consumes no
/// server-initiated capabilities.
#[derive(Debug, Clone, Default)]
pub struct ProxyClientHandler;

impl rmcp::ClientHandler for ProxyClientHandler {
    fn get_info(&self) -> ClientInfo {
        ClientInfo {
            client_info: Implementation {
                name: "warden-proxy".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                ..Implementation::default()
            },
            ..ClientInfo::default()
        }
    }
}

/// A connected backend.
pub struct Backend {
    /// Backend name.
    pub name: String,
    /// Tools the backend advertised at startup.
    pub tools: Vec<Tool>,
    service: RunningService<RoleClient, ProxyClientHandler>,
}

impl Backend {
    /// Spawn the backend process and complete the MCP handshake.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Backend`] when the process cannot be spawned,
    /// the handshake fails, or tool listing fails.
    pub async fn connect(config: &BackendConfig) -> Result<Self, ProxyError> {
        let mut cmd = tokio::process::Command::new(&config.command);
        cmd.args(&config.args);
        for (key, value) in &config.env {
            cmd.env(key, value);
        }

        let transport = TokioChildProcess::new(cmd).map_err(|e| ProxyError::Backend {
            name: config.name.clone(),
            message: format!("spawn failed: {e}"),
        })?;

        let service = ProxyClientHandler
            .serve(transport)
            .await
            .map_err(|e| ProxyError::Backend {
                name: config.name.clone(),
                message: format!("handshake failed: {e}"),
            })?;

        let tools = service
            .list_all_tools()
            .await
            .map_err(|e| ProxyError::Backend {
                name: config.name.clone(),
                message: format!("tool listing failed: {e}"),
            })?;

        info!(backend = %config.name, tools = tools.len(), "backend connected");
        Ok(Self {
            name: config.name.clone(),
            tools,
            service,
        })
    }

    /// Call one of the backend's tools.
    ///
    /// # Errors
    ///
    /// Returns the rmcp service error as a string.
    pub async fn call_tool(
        &self,
        name: &str,
        args: serde_json::Value,
    ) -> Result<CallToolResult, String> {
        let arguments = match args {
            serde_json::Value::Object(map) => Some(map),
            serde_json::Value::Null => None,
            other => {
                let mut map = serde_json::Map::new();
                map.insert("value".to_string(), other);
                Some(map)
            }
        };
        self.service
            .peer()
            .call_tool(CallToolRequestParams {
                meta: None,
                name: Cow::Owned(name.to_string()),
                arguments,
                task: None,
            })
            .await
            .map_err(|e| e.to_string())
    }

    /// Close the backend transport, best-effort.
    pub async fn shutdown(self) {
        if let Err(e) = self.service.cancel().await {
            warn!(backend = %self.name, error = %e, "backend shutdown failed");
        }
    }
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("name", &self.name)
            .field("tools", &self.tools.len())
            .finish_non_exhaustive()
    }
}

/// Map tool names to backend indices, first-wins on collision.
#[must_use]
pub fn build_tool_map(backends: &[Backend]) -> HashMap<String, usize> {
    let mut map: HashMap<String, usize> = HashMap::new();
    for (index, backend) in backends.iter().enumerate() {
        for tool in &backend.tools {
            let name = tool.name.to_string();
            if let Some(&existing) = map.get(&name) {
                warn!(
                    tool = %name,
                    kept = %backends[existing].name,
                    ignored = %backend.name,
                    "tool name collision; first backend wins"
                );
            } else {
                map.insert(name, index);
            }
        }
    }
    map
}
