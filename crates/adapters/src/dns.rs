//! DNS lookup adapter.

use async_trait::async_trait;
use policy::{Evaluation, Policy};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tokio::net::lookup_host;
use warden_core::{ActionRequest, ActionResult, Artifact, ArtifactKind};

use crate::contract::{
    elapsed, invalid_dry_run, invalid_result, parse_input, DryRun, RollbackOutcome, ToolAdapter,
    ToolContext,
};

#[derive(Debug, Deserialize)]
struct DnsInput {
    host: String,
    #[serde(default)]
    port: Option<u16>,
}

/// Resolve a hostname to addresses.
///
/// For scope evaluation the host is presented as a `dns://` URL so the
/// capability's `domains` allow-list applies to lookups too.
pub struct DnsLookupAdapter;

#[async_trait]
impl ToolAdapter for DnsLookupAdapter {
    fn name(&self) -> &'static str {
        "dns:lookup"
    }

    fn description(&self) -> &'static str {
        "Resolve a hostname to IP addresses"
    }

    fn input_schema(&self) -> JsonValue {
        json!({
            "type": "object",
            "properties": {
                "host": { "type": "string" },
                "port": { "type": "integer" }
            },
            "required": ["host"]
        })
    }

    fn validate(&self, input: &JsonValue, policy: &Policy) -> Evaluation {
        let args = match parse_input::<DnsInput>(self.name(), input) {
            Ok(a) => a,
            Err(e) => return e,
        };
        policy::evaluate(
            &ActionRequest::new(self.name(), json!({"url": format!("dns://{}", args.host)})),
            policy,
            None,
            warden_core::ids::now_ms(),
        )
    }

    async fn dry_run(&self, input: &JsonValue, _ctx: &ToolContext) -> DryRun {
        match parse_input::<DnsInput>(self.name(), input) {
            Ok(args) => DryRun {
                would_do: format!("resolve {}", args.host),
                estimated_changes: 0,
                warnings: Vec::new(),
            },
            Err(e) => invalid_dry_run(e),
        }
    }

    async fn execute(&self, input: &JsonValue, ctx: &mut ToolContext) -> ActionResult {
        let started = warden_core::ids::now_ms();
        let args = match parse_input::<DnsInput>(self.name(), input) {
            Ok(a) => a,
            Err(e) => return invalid_result(&e, started),
        };
        let target = format!("{}:{}", args.host, args.port.unwrap_or(443));
        let result = match lookup_host(&target).await {
            Ok(addrs) => {
                let addresses: Vec<String> = addrs.map(|a| a.ip().to_string()).collect();
                ActionResult::ok(
                    Some(json!({"host": args.host, "addresses": addresses})),
                    vec![Artifact::new(ArtifactKind::Log, &args.host, json!("resolved"))],
                    elapsed(started),
                )
            }
            Err(e) => ActionResult::err(format!("lookup {} failed: {e}", args.host), elapsed(started)),
        };
        ctx.budget.record_result(&result);
        result
    }

    async fn rollback(&self, _input: &JsonValue, _ctx: &mut ToolContext) -> RollbackOutcome {
        RollbackOutcome::ok("lookup has no effects to roll back")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_core::Verdict;

    #[test]
    fn domains_scope_applies_to_lookups() {
        let policy = Policy::from_yaml_str(
            r#"
name: dns-test
capabilities:
  - tool: "dns:lookup"
    scope:
      domains: ["example.com"]
"#,
        )
        .unwrap();

        let eval = DnsLookupAdapter.validate(&json!({"host": "example.com"}), &policy);
        assert_eq!(eval.verdict, Verdict::Allow);

        let eval = DnsLookupAdapter.validate(&json!({"host": "evil.dev"}), &policy);
        assert_eq!(eval.verdict, Verdict::Deny);
    }

    #[tokio::test]
    async fn localhost_resolves() {
        let mut ctx = ToolContext::new();
        let result = DnsLookupAdapter
            .execute(&json!({"host": "localhost", "port": 80}), &mut ctx)
            .await;
        assert!(result.success, "{result:?}");
        let addrs = result.output.unwrap()["addresses"].as_array().unwrap().len();
        assert!(addrs >= 1);
    }
}
