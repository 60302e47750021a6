//! Shell command adapter.

use async_trait::async_trait;
use policy::{Evaluation, Policy};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use std::process::Stdio;
use std::time::Duration;
use tracing::{debug, warn};
use warden_core::{ActionResult, Artifact, ArtifactKind};

use crate::contract::{
    elapsed, invalid_dry_run, invalid_result, parse_input, validate_with, DryRun, RollbackOutcome,
    ToolAdapter, ToolContext,
};

/// Default command timeout.
const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Cap on captured output per stream.
const MAX_CAPTURE_BYTES: usize = 64 * 1024;

fn truncate_lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(&bytes[..bytes.len().min(MAX_CAPTURE_BYTES)]).into_owned()
}

#[derive(Debug, Deserialize)]
struct CommandInput {
    command: String,
    #[serde(default)]
    cwd: Option<String>,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

/// Run a shell command, capturing exit code and output streams.
///
/// Commands are not reversible; `rollback` always reports failure.
#[derive(Debug, Default)]
pub struct CommandRunAdapter;

#[async_trait]
impl ToolAdapter for CommandRunAdapter {
    fn name(&self) -> &'static str {
        "command:run"
    }

    fn description(&self) -> &'static str {
        "Run a shell command and capture its output"
    }

    fn input_schema(&self) -> JsonValue {
        json!({
            "type": "object",
            "properties": {
                "command": { "type": "string" },
                "cwd": { "type": "string" },
                "timeout_ms": { "type": "integer" }
            },
            "required": ["command"]
        })
    }

    fn validate(&self, input: &JsonValue, policy: &Policy) -> Evaluation {
        validate_with::<CommandInput>(self.name(), input, policy)
    }

    async fn dry_run(&self, input: &JsonValue, _ctx: &ToolContext) -> DryRun {
        match parse_input::<CommandInput>(self.name(), input) {
            Ok(args) => {
                let mut warnings = Vec::new();
                if args.command.trim().is_empty() {
                    warnings.push("command is empty".into());
                }
                DryRun {
                    would_do: format!(
                        "run `{}`{}",
                        args.command,
                        args.cwd.as_deref().map(|d| format!(" in {d}")).unwrap_or_default()
                    ),
                    estimated_changes: 0,
                    warnings,
                }
            }
            Err(e) => invalid_dry_run(e),
        }
    }

    async fn execute(&self, input: &JsonValue, ctx: &mut ToolContext) -> ActionResult {
        let started = warden_core::ids::now_ms();
        let args = match parse_input::<CommandInput>(self.name(), input) {
            Ok(a) => a,
            Err(e) => return invalid_result(&e, started),
        };

        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c")
            .arg(&args.command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &args.cwd {
            cmd.current_dir(cwd);
        }

        let child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                let result =
                    ActionResult::err(format!("spawn failed: {e}"), elapsed(started));
                ctx.budget.record_result(&result);
                return result;
            }
        };

        let timeout = Duration::from_millis(args.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS));
        // On timeout the in-flight future drops the child; kill_on_drop
        // reaps it.
        let outcome = tokio::time::timeout(timeout, child.wait_with_output()).await;

        let result = match outcome {
            Ok(Ok(output)) => {
                let code = output.status.code().unwrap_or(-1);
                let stdout = truncate_lossy(&output.stdout);
                let stderr = truncate_lossy(&output.stderr);
                let success = output.status.success();
                debug!(command = %args.command, code, "command finished");
                let artifacts = vec![
                    Artifact::new(ArtifactKind::ExitCode, "exit_code", json!(code)),
                    Artifact::new(ArtifactKind::Log, "stdout", json!(stdout)),
                    Artifact::new(ArtifactKind::Log, "stderr", json!(stderr)),
                ];
                if success {
                    ActionResult::ok(
                        Some(json!({"exit_code": code, "stdout": stdout, "stderr": stderr})),
                        artifacts,
                        elapsed(started),
                    )
                } else {
                    let mut r = ActionResult::err(
                        format!("command exited with code {code}"),
                        elapsed(started),
                    );
                    r.output = Some(json!({"exit_code": code, "stdout": stdout, "stderr": stderr}));
                    r.artifacts = artifacts;
                    r
                }
            }
            Ok(Err(e)) => ActionResult::err(format!("wait failed: {e}"), elapsed(started)),
            Err(_) => {
                warn!(command = %args.command, timeout_ms = timeout.as_millis() as u64, "command timed out");
                ActionResult::err(
                    format!("command timed out after {}ms", timeout.as_millis()),
                    elapsed(started),
                )
            }
        };
        ctx.budget.record_result(&result);
        result
    }

    async fn rollback(&self, _input: &JsonValue, _ctx: &mut ToolContext) -> RollbackOutcome {
        RollbackOutcome::failed(
            "rollback command:run",
            "command execution is not reversible",
        )
    }
}
