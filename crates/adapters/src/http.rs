//! HTTP request adapter.

use async_trait::async_trait;
use policy::{Evaluation, Policy};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;
use warden_core::{ActionResult, Artifact, ArtifactKind};

use crate::contract::{
    elapsed, invalid_dry_run, invalid_result, parse_input, validate_with, DryRun, RollbackOutcome,
    ToolAdapter, ToolContext,
};

const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Cap on captured response body bytes.
const MAX_BODY_BYTES: usize = 256 * 1024;

#[derive(Debug, Deserialize)]
struct HttpInput {
    url: String,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    headers: Option<HashMap<String, String>>,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

/// Issue an HTTP request.
///
/// Requests are not reversible; `rollback` always reports failure.
#[derive(Debug, Default)]
pub struct HttpRequestAdapter {
    client: reqwest::Client,
}

#[async_trait]
impl ToolAdapter for HttpRequestAdapter {
    fn name(&self) -> &'static str {
        "http:request"
    }

    fn description(&self) -> &'static str {
        "Issue an HTTP request and capture the response"
    }

    fn input_schema(&self) -> JsonValue {
        json!({
            "type": "object",
            "properties": {
                "url": { "type": "string" },
                "method": { "type": "string" },
                "headers": { "type": "object" },
                "body": { "type": "string" },
                "timeout_ms": { "type": "integer" }
            },
            "required": ["url"]
        })
    }

    fn validate(&self, input: &JsonValue, policy: &Policy) -> Evaluation {
        validate_with::<HttpInput>(self.name(), input, policy)
    }

    async fn dry_run(&self, input: &JsonValue, _ctx: &ToolContext) -> DryRun {
        match parse_input::<HttpInput>(self.name(), input) {
            Ok(args) => {
                let method = args.method.as_deref().unwrap_or("GET").to_ascii_uppercase();
                let mut warnings = Vec::new();
                if url::Url::parse(&args.url).is_err() {
                    warnings.push(format!("url {} does not parse", args.url));
                }
                DryRun {
                    would_do: format!("{method} {}", args.url),
                    estimated_changes: 0,
                    warnings,
                }
            }
            Err(e) => invalid_dry_run(e),
        }
    }

    async fn execute(&self, input: &JsonValue, ctx: &mut ToolContext) -> ActionResult {
        let started = warden_core::ids::now_ms();
        let args = match parse_input::<HttpInput>(self.name(), input) {
            Ok(a) => a,
            Err(e) => return invalid_result(&e, started),
        };

        let method_str = args.method.as_deref().unwrap_or("GET").to_ascii_uppercase();
        let method = match reqwest::Method::from_bytes(method_str.as_bytes()) {
            Ok(m) => m,
            Err(_) => {
                let result = ActionResult::err(
                    format!("invalid HTTP method \"{method_str}\""),
                    elapsed(started),
                );
                ctx.budget.record_result(&result);
                return result;
            }
        };

        let mut request = self
            .client
            .request(method, &args.url)
            .timeout(Duration::from_millis(args.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS)));
        if let Some(headers) = &args.headers {
            for (name, value) in headers {
                request = request.header(name, value);
            }
        }
        if let Some(body) = &args.body {
            request = request.body(body.clone());
        }

        let result = match request.send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                let body = match response.bytes().await {
                    Ok(bytes) => {
                        let slice = &bytes[..bytes.len().min(MAX_BODY_BYTES)];
                        String::from_utf8_lossy(slice).into_owned()
                    }
                    Err(e) => format!("<body read failed: {e}>"),
                };
                debug!(url = %args.url, status, "http request finished");
                let artifacts = vec![Artifact::new(
                    ArtifactKind::Log,
                    "response",
                    json!({"status": status, "bytes": body.len()}),
                )];
                if (200..400).contains(&status) {
                    ActionResult::ok(
                        Some(json!({"status": status, "body": body})),
                        artifacts,
                        elapsed(started),
                    )
                } else {
                    let mut r = ActionResult::err(
                        format!("HTTP status {status}"),
                        elapsed(started),
                    );
                    r.output = Some(json!({"status": status, "body": body}));
                    r.artifacts = artifacts;
                    r
                }
            }
            Err(e) => ActionResult::err(format!("request failed: {e}"), elapsed(started)),
        };
        ctx.budget.record_result(&result);
        result
    }

    async fn rollback(&self, _input: &JsonValue, _ctx: &mut ToolContext) -> RollbackOutcome {
        RollbackOutcome::failed("rollback http:request", "HTTP requests are not reversible")
    }
}
