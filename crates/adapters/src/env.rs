//! Environment variable adapter (read-only).

use async_trait::async_trait;
use policy::{Evaluation, Policy};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use warden_core::{ActionResult, Artifact, ArtifactKind};

use crate::contract::{
    elapsed, invalid_dry_run, invalid_result, parse_input, validate_with, DryRun, RollbackOutcome,
    ToolAdapter, ToolContext,
};

#[derive(Debug, Deserialize)]
struct EnvInput {
    name: String,
}

/// Read an environment variable from the gateway process.
pub struct EnvReadAdapter;

#[async_trait]
impl ToolAdapter for EnvReadAdapter {
    fn name(&self) -> &'static str {
        "env:read"
    }

    fn description(&self) -> &'static str {
        "Read an environment variable"
    }

    fn input_schema(&self) -> JsonValue {
        json!({
            "type": "object",
            "properties": { "name": { "type": "string" } },
            "required": ["name"]
        })
    }

    fn validate(&self, input: &JsonValue, policy: &Policy) -> Evaluation {
        validate_with::<EnvInput>(self.name(), input, policy)
    }

    async fn dry_run(&self, input: &JsonValue, _ctx: &ToolContext) -> DryRun {
        match parse_input::<EnvInput>(self.name(), input) {
            Ok(args) => DryRun {
                would_do: format!("read ${}", args.name),
                estimated_changes: 0,
                warnings: Vec::new(),
            },
            Err(e) => invalid_dry_run(e),
        }
    }

    async fn execute(&self, input: &JsonValue, ctx: &mut ToolContext) -> ActionResult {
        let started = warden_core::ids::now_ms();
        let args = match parse_input::<EnvInput>(self.name(), input) {
            Ok(a) => a,
            Err(e) => return invalid_result(&e, started),
        };
        let value = std::env::var(&args.name).ok();
        let result = ActionResult::ok(
            Some(json!({"name": args.name, "present": value.is_some(), "value": value})),
            vec![Artifact::new(ArtifactKind::Log, &args.name, json!("env read"))],
            elapsed(started),
        );
        ctx.budget.record_result(&result);
        result
    }

    async fn rollback(&self, _input: &JsonValue, _ctx: &mut ToolContext) -> RollbackOutcome {
        RollbackOutcome::ok("env read has no effects to roll back")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_present_and_absent_variables() {
        std::env::set_var("WARDEN_ENV_TEST", "42");
        let mut ctx = ToolContext::new();
        let result = EnvReadAdapter
            .execute(&json!({"name": "WARDEN_ENV_TEST"}), &mut ctx)
            .await;
        assert!(result.success);
        assert_eq!(result.output.as_ref().unwrap()["value"], "42");

        let result = EnvReadAdapter
            .execute(&json!({"name": "WARDEN_ENV_DEFINITELY_NOT_SET"}), &mut ctx)
            .await;
        assert!(result.success);
        assert_eq!(result.output.as_ref().unwrap()["present"], false);
    }
}
