//! The uniform adapter contract and registry.

use async_trait::async_trait;
use budget::BudgetSnapshot;
use policy::{DenialReason, Evaluation, Policy};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;
use warden_core::{ActionRequest, ActionResult};

/// Mutable execution context threaded through adapter calls.
///
/// `rollback_data` stashes reversible state keyed by `"<tool>:<args>"`;
/// `budget` accumulates file-change and output-byte usage.
#[derive(Debug, Default)]
pub struct ToolContext {
    /// Budget counters updated by `execute`.
    pub budget: BudgetSnapshot,
    /// Reversible state stashed during `execute`, consumed by `rollback`.
    pub rollback_data: HashMap<String, JsonValue>,
}

impl ToolContext {
    /// A fresh context.
    #[must_use]
    pub fn new() -> Self {
        Self {
            budget: BudgetSnapshot::new(warden_core::ids::now_ms()),
            rollback_data: HashMap::new(),
        }
    }

    /// Stash key for a tool invocation: `"<tool>:<serialized args>"`.
    #[must_use]
    pub fn stash_key(tool: &str, input: &JsonValue) -> String {
        format!("{tool}:{}", serde_json::to_string(input).unwrap_or_default())
    }
}

/// What a dry run would do.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DryRun {
    /// Human description of the effect.
    pub would_do: String,
    /// Estimated number of changed objects.
    pub estimated_changes: u64,
    /// Problems detected without executing (missing inputs, absent files).
    #[serde(default)]
    pub warnings: Vec<String>,
}

/// Outcome of a rollback attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackOutcome {
    /// Whether observable state was restored.
    pub success: bool,
    /// What was (or was not) done.
    pub description: String,
    /// Failure detail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RollbackOutcome {
    /// A successful rollback.
    #[must_use]
    pub fn ok(description: impl Into<String>) -> Self {
        Self {
            success: true,
            description: description.into(),
            error: None,
        }
    }

    /// A failed rollback.
    #[must_use]
    pub fn failed(description: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            description: description.into(),
            error: Some(error.into()),
        }
    }
}

/// Uniform adapter interface.
#[async_trait]
pub trait ToolAdapter: Send + Sync {
    /// Tool name, e.g. `file:write`.
    fn name(&self) -> &'static str;

    /// One-line description.
    fn description(&self) -> &'static str;

    /// JSON schema of the input object.
    fn input_schema(&self) -> JsonValue;

    /// Schema-parse the input, then delegate to the policy evaluator.
    /// Parse failures deny with per-field reasons.
    fn validate(&self, input: &JsonValue, policy: &Policy) -> Evaluation;

    /// Describe the effect without side effects.
    async fn dry_run(&self, input: &JsonValue, ctx: &ToolContext) -> DryRun;

    /// Perform the call, capturing artifacts and stashing reversible state.
    /// Failures are data (`success: false`), not errors.
    async fn execute(&self, input: &JsonValue, ctx: &mut ToolContext) -> ActionResult;

    /// Undo a prior `execute`. Idempotent; absence of stashed data is a
    /// failure with a clear reason.
    async fn rollback(&self, input: &JsonValue, ctx: &mut ToolContext) -> RollbackOutcome;
}

/// Parse a typed input or produce the standard invalid-input denial.
pub(crate) fn parse_input<T: DeserializeOwned>(
    tool: &str,
    input: &JsonValue,
) -> Result<T, Evaluation> {
    serde_json::from_value(input.clone()).map_err(|e| {
        Evaluation::deny(
            tool,
            vec![DenialReason::InvalidInput {
                message: e.to_string(),
            }],
        )
    })
}

/// Standard validate body: parse, then evaluate the raw request.
pub(crate) fn validate_with<T: DeserializeOwned>(
    tool: &str,
    input: &JsonValue,
    policy: &Policy,
) -> Evaluation {
    match parse_input::<T>(tool, input) {
        Ok(_) => policy::evaluate(
            &ActionRequest::new(tool, input.clone()),
            policy,
            None,
            warden_core::ids::now_ms(),
        ),
        Err(denial) => denial,
    }
}

/// Dry-run output for input that failed schema parsing.
pub(crate) fn invalid_dry_run(denial: Evaluation) -> DryRun {
    DryRun {
        would_do: "nothing (invalid input)".into(),
        estimated_changes: 0,
        warnings: denial.reason_strings(),
    }
}

/// Failure result for input that failed schema parsing.
pub(crate) fn invalid_result(denial: &Evaluation, started: u64) -> ActionResult {
    ActionResult::err(
        denial
            .reason_strings()
            .first()
            .cloned()
            .unwrap_or_else(|| "invalid input".into()),
        elapsed(started),
    )
}

pub(crate) fn elapsed(started: u64) -> u64 {
    warden_core::ids::now_ms().saturating_sub(started)
}

/// Registered adapters keyed by tool name.
#[derive(Default, Clone)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn ToolAdapter>>,
}

impl AdapterRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in adapter.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(crate::FileReadAdapter));
        registry.register(Arc::new(crate::FileWriteAdapter));
        registry.register(Arc::new(crate::FileDeleteAdapter));
        registry.register(Arc::new(crate::FileCopyAdapter));
        registry.register(Arc::new(crate::CommandRunAdapter::default()));
        registry.register(Arc::new(crate::HttpRequestAdapter::default()));
        registry.register(Arc::new(crate::GitDiffAdapter));
        registry.register(Arc::new(crate::GitApplyAdapter));
        registry.register(Arc::new(crate::EnvReadAdapter));
        registry.register(Arc::new(crate::DnsLookupAdapter));
        registry
    }

    /// Register an adapter under its own name.
    pub fn register(&mut self, adapter: Arc<dyn ToolAdapter>) {
        self.adapters.insert(adapter.name().to_string(), adapter);
    }

    /// Adapter for a tool, if registered.
    #[must_use]
    pub fn get(&self, tool: &str) -> Option<Arc<dyn ToolAdapter>> {
        self.adapters.get(tool).cloned()
    }

    /// Whether a tool has an adapter.
    #[must_use]
    pub fn contains(&self, tool: &str) -> bool {
        self.adapters.contains_key(tool)
    }

    /// Registered tool names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.adapters.keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("tools", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builtins_cover_the_tool_surface() {
        let registry = AdapterRegistry::with_builtins();
        for tool in [
            "file:read",
            "file:write",
            "file:delete",
            "file:copy",
            "command:run",
            "http:request",
            "git:diff",
            "git:apply",
            "env:read",
            "dns:lookup",
        ] {
            assert!(registry.contains(tool), "missing adapter for {tool}");
        }
    }

    #[test]
    fn stash_key_includes_tool_and_args() {
        let key = ToolContext::stash_key("file:write", &json!({"path": "/a"}));
        assert!(key.starts_with("file:write:"));
        assert!(key.contains("/a"));
    }
}
