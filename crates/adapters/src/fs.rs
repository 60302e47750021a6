//! Filesystem adapters: read, write, delete, copy.

use async_trait::async_trait;
use policy::{Evaluation, Policy};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tracing::debug;
use warden_core::{ActionRequest, ActionResult, Artifact, ArtifactKind, Verdict};

use crate::contract::{
    elapsed, invalid_dry_run, invalid_result, parse_input, validate_with, DryRun, RollbackOutcome,
    ToolAdapter, ToolContext,
};
use crate::sha256_hex;

#[derive(Debug, Deserialize)]
struct PathInput {
    path: String,
}

#[derive(Debug, Deserialize)]
struct WriteInput {
    path: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct CopyInput {
    source: String,
    dest: String,
}

/// Marker stashed when the target did not exist before the mutation.
const ABSENT: &str = "__absent__";

/// Read a file.
pub struct FileReadAdapter;

#[async_trait]
impl ToolAdapter for FileReadAdapter {
    fn name(&self) -> &'static str {
        "file:read"
    }

    fn description(&self) -> &'static str {
        "Read a file from the local filesystem"
    }

    fn input_schema(&self) -> JsonValue {
        json!({
            "type": "object",
            "properties": { "path": { "type": "string" } },
            "required": ["path"]
        })
    }

    fn validate(&self, input: &JsonValue, policy: &Policy) -> Evaluation {
        validate_with::<PathInput>(self.name(), input, policy)
    }

    async fn dry_run(&self, input: &JsonValue, _ctx: &ToolContext) -> DryRun {
        match parse_input::<PathInput>(self.name(), input) {
            Ok(args) => {
                let mut warnings = Vec::new();
                if tokio::fs::metadata(&args.path).await.is_err() {
                    warnings.push(format!("file {} does not exist", args.path));
                }
                DryRun {
                    would_do: format!("read {}", args.path),
                    estimated_changes: 0,
                    warnings,
                }
            }
            Err(e) => invalid_dry_run(e),
        }
    }

    async fn execute(&self, input: &JsonValue, ctx: &mut ToolContext) -> ActionResult {
        let started = warden_core::ids::now_ms();
        let args = match parse_input::<PathInput>(self.name(), input) {
            Ok(a) => a,
            Err(e) => return invalid_result(&e, started),
        };
        let result = match tokio::fs::read(&args.path).await {
            Ok(bytes) => {
                let content = String::from_utf8_lossy(&bytes).into_owned();
                ActionResult::ok(
                    Some(json!({"path": args.path, "content": content, "bytes": bytes.len()})),
                    vec![Artifact::new(
                        ArtifactKind::Log,
                        &args.path,
                        json!(sha256_hex(&bytes)),
                    )],
                    elapsed(started),
                )
            }
            Err(e) => ActionResult::err(format!("read {} failed: {e}", args.path), elapsed(started)),
        };
        ctx.budget.record_result(&result);
        result
    }

    async fn rollback(&self, _input: &JsonValue, _ctx: &mut ToolContext) -> RollbackOutcome {
        RollbackOutcome::ok("read has no effects to roll back")
    }
}

/// Write a file, stashing the prior content for rollback.
pub struct FileWriteAdapter;

#[async_trait]
impl ToolAdapter for FileWriteAdapter {
    fn name(&self) -> &'static str {
        "file:write"
    }

    fn description(&self) -> &'static str {
        "Write a file, creating parent directories"
    }

    fn input_schema(&self) -> JsonValue {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string" },
                "content": { "type": "string" }
            },
            "required": ["path", "content"]
        })
    }

    fn validate(&self, input: &JsonValue, policy: &Policy) -> Evaluation {
        validate_with::<WriteInput>(self.name(), input, policy)
    }

    async fn dry_run(&self, input: &JsonValue, _ctx: &ToolContext) -> DryRun {
        match parse_input::<WriteInput>(self.name(), input) {
            Ok(args) => {
                let exists = tokio::fs::metadata(&args.path).await.is_ok();
                DryRun {
                    would_do: format!(
                        "{} {} ({} bytes)",
                        if exists { "overwrite" } else { "create" },
                        args.path,
                        args.content.len()
                    ),
                    estimated_changes: 1,
                    warnings: Vec::new(),
                }
            }
            Err(e) => invalid_dry_run(e),
        }
    }

    async fn execute(&self, input: &JsonValue, ctx: &mut ToolContext) -> ActionResult {
        let started = warden_core::ids::now_ms();
        let args = match parse_input::<WriteInput>(self.name(), input) {
            Ok(a) => a,
            Err(e) => return invalid_result(&e, started),
        };

        let prior = match tokio::fs::read_to_string(&args.path).await {
            Ok(content) => json!(content),
            Err(_) => json!(ABSENT),
        };
        ctx.rollback_data
            .insert(ToolContext::stash_key(self.name(), input), prior);

        if let Some(parent) = std::path::Path::new(&args.path).parent() {
            if !parent.as_os_str().is_empty() {
                if let Err(e) = tokio::fs::create_dir_all(parent).await {
                    let result =
                        ActionResult::err(format!("mkdir for {} failed: {e}", args.path), elapsed(started));
                    ctx.budget.record_result(&result);
                    return result;
                }
            }
        }

        let result = match tokio::fs::write(&args.path, &args.content).await {
            Ok(()) => {
                debug!(path = %args.path, bytes = args.content.len(), "file written");
                ActionResult::ok(
                    Some(json!({"path": args.path, "bytes": args.content.len()})),
                    vec![Artifact::new(
                        ArtifactKind::Checksum,
                        &args.path,
                        json!(sha256_hex(args.content.as_bytes())),
                    )],
                    elapsed(started),
                )
            }
            Err(e) => ActionResult::err(format!("write {} failed: {e}", args.path), elapsed(started)),
        };
        ctx.budget.record_result(&result);
        result
    }

    async fn rollback(&self, input: &JsonValue, ctx: &mut ToolContext) -> RollbackOutcome {
        let Ok(args) = parse_input::<WriteInput>(self.name(), input) else {
            return RollbackOutcome::failed("rollback file:write", "unparseable input");
        };
        let key = ToolContext::stash_key(self.name(), input);
        let Some(prior) = ctx.rollback_data.get(&key).cloned() else {
            return RollbackOutcome::failed(
                format!("restore {}", args.path),
                "no stashed state for this invocation",
            );
        };
        restore_path(&args.path, &prior).await
    }
}

/// Delete a file, stashing its content for rollback.
pub struct FileDeleteAdapter;

#[async_trait]
impl ToolAdapter for FileDeleteAdapter {
    fn name(&self) -> &'static str {
        "file:delete"
    }

    fn description(&self) -> &'static str {
        "Delete a file"
    }

    fn input_schema(&self) -> JsonValue {
        json!({
            "type": "object",
            "properties": { "path": { "type": "string" } },
            "required": ["path"]
        })
    }

    fn validate(&self, input: &JsonValue, policy: &Policy) -> Evaluation {
        validate_with::<PathInput>(self.name(), input, policy)
    }

    async fn dry_run(&self, input: &JsonValue, _ctx: &ToolContext) -> DryRun {
        match parse_input::<PathInput>(self.name(), input) {
            Ok(args) => {
                let exists = tokio::fs::metadata(&args.path).await.is_ok();
                DryRun {
                    would_do: format!("delete {}", args.path),
                    estimated_changes: u64::from(exists),
                    warnings: if exists {
                        Vec::new()
                    } else {
                        vec![format!("file {} does not exist", args.path)]
                    },
                }
            }
            Err(e) => invalid_dry_run(e),
        }
    }

    async fn execute(&self, input: &JsonValue, ctx: &mut ToolContext) -> ActionResult {
        let started = warden_core::ids::now_ms();
        let args = match parse_input::<PathInput>(self.name(), input) {
            Ok(a) => a,
            Err(e) => return invalid_result(&e, started),
        };

        let result = match tokio::fs::read(&args.path).await {
            Ok(bytes) => {
                ctx.rollback_data.insert(
                    ToolContext::stash_key(self.name(), input),
                    json!(String::from_utf8_lossy(&bytes).into_owned()),
                );
                match tokio::fs::remove_file(&args.path).await {
                    Ok(()) => ActionResult::ok(
                        Some(json!({"path": args.path, "deleted": true})),
                        vec![Artifact::new(
                            ArtifactKind::Checksum,
                            &args.path,
                            json!(sha256_hex(&bytes)),
                        )],
                        elapsed(started),
                    ),
                    Err(e) => {
                        ActionResult::err(format!("delete {} failed: {e}", args.path), elapsed(started))
                    }
                }
            }
            Err(e) => ActionResult::err(format!("read {} failed: {e}", args.path), elapsed(started)),
        };
        ctx.budget.record_result(&result);
        result
    }

    async fn rollback(&self, input: &JsonValue, ctx: &mut ToolContext) -> RollbackOutcome {
        let Ok(args) = parse_input::<PathInput>(self.name(), input) else {
            return RollbackOutcome::failed("rollback file:delete", "unparseable input");
        };
        let key = ToolContext::stash_key(self.name(), input);
        let Some(content) = ctx.rollback_data.get(&key).and_then(|v| v.as_str().map(str::to_string))
        else {
            return RollbackOutcome::failed(
                format!("restore {}", args.path),
                "no stashed state for this invocation",
            );
        };
        match tokio::fs::write(&args.path, content).await {
            Ok(()) => RollbackOutcome::ok(format!("restored {}", args.path)),
            Err(e) => RollbackOutcome::failed(format!("restore {}", args.path), e.to_string()),
        }
    }
}

/// Copy a file. Both endpoints are evaluated; the more restrictive verdict
/// wins.
pub struct FileCopyAdapter;

#[async_trait]
impl ToolAdapter for FileCopyAdapter {
    fn name(&self) -> &'static str {
        "file:copy"
    }

    fn description(&self) -> &'static str {
        "Copy a file from source to dest"
    }

    fn input_schema(&self) -> JsonValue {
        json!({
            "type": "object",
            "properties": {
                "source": { "type": "string" },
                "dest": { "type": "string" }
            },
            "required": ["source", "dest"]
        })
    }

    fn validate(&self, input: &JsonValue, policy: &Policy) -> Evaluation {
        let args = match parse_input::<CopyInput>(self.name(), input) {
            Ok(a) => a,
            Err(e) => return e,
        };
        let now = warden_core::ids::now_ms();
        let source_eval = policy::evaluate(
            &ActionRequest::new(self.name(), json!({"path": args.source})),
            policy,
            None,
            now,
        );
        let dest_eval = policy::evaluate(
            &ActionRequest::new(self.name(), json!({"path": args.dest})),
            policy,
            None,
            now,
        );
        more_restrictive(source_eval, dest_eval)
    }

    async fn dry_run(&self, input: &JsonValue, _ctx: &ToolContext) -> DryRun {
        match parse_input::<CopyInput>(self.name(), input) {
            Ok(args) => {
                let mut warnings = Vec::new();
                if tokio::fs::metadata(&args.source).await.is_err() {
                    warnings.push(format!("source {} does not exist", args.source));
                }
                DryRun {
                    would_do: format!("copy {} to {}", args.source, args.dest),
                    estimated_changes: 1,
                    warnings,
                }
            }
            Err(e) => invalid_dry_run(e),
        }
    }

    async fn execute(&self, input: &JsonValue, ctx: &mut ToolContext) -> ActionResult {
        let started = warden_core::ids::now_ms();
        let args = match parse_input::<CopyInput>(self.name(), input) {
            Ok(a) => a,
            Err(e) => return invalid_result(&e, started),
        };

        let prior_dest = match tokio::fs::read_to_string(&args.dest).await {
            Ok(content) => json!(content),
            Err(_) => json!(ABSENT),
        };
        ctx.rollback_data
            .insert(ToolContext::stash_key(self.name(), input), prior_dest);

        let result = match tokio::fs::copy(&args.source, &args.dest).await {
            Ok(bytes) => {
                let content = tokio::fs::read(&args.dest).await.unwrap_or_default();
                ActionResult::ok(
                    Some(json!({"source": args.source, "dest": args.dest, "bytes": bytes})),
                    vec![Artifact::new(
                        ArtifactKind::Checksum,
                        &args.dest,
                        json!(sha256_hex(&content)),
                    )],
                    elapsed(started),
                )
            }
            Err(e) => ActionResult::err(
                format!("copy {} to {} failed: {e}", args.source, args.dest),
                elapsed(started),
            ),
        };
        ctx.budget.record_result(&result);
        result
    }

    async fn rollback(&self, input: &JsonValue, ctx: &mut ToolContext) -> RollbackOutcome {
        let Ok(args) = parse_input::<CopyInput>(self.name(), input) else {
            return RollbackOutcome::failed("rollback file:copy", "unparseable input");
        };
        let key = ToolContext::stash_key(self.name(), input);
        let Some(prior) = ctx.rollback_data.get(&key).cloned() else {
            return RollbackOutcome::failed(
                format!("restore {}", args.dest),
                "no stashed state for this invocation",
            );
        };
        restore_path(&args.dest, &prior).await
    }
}

/// Restore a path to its stashed state: rewrite the prior content, or remove
/// the file when the stash marks it as previously absent.
async fn restore_path(path: &str, prior: &JsonValue) -> RollbackOutcome {
    match prior.as_str() {
        Some(ABSENT) => match tokio::fs::remove_file(path).await {
            Ok(()) => RollbackOutcome::ok(format!("removed {path}")),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                RollbackOutcome::ok(format!("{path} already absent"))
            }
            Err(e) => RollbackOutcome::failed(format!("remove {path}"), e.to_string()),
        },
        Some(content) => match tokio::fs::write(path, content).await {
            Ok(()) => RollbackOutcome::ok(format!("restored {path}")),
            Err(e) => RollbackOutcome::failed(format!("restore {path}"), e.to_string()),
        },
        None => RollbackOutcome::failed(format!("restore {path}"), "malformed stash entry"),
    }
}

fn more_restrictive(a: Evaluation, b: Evaluation) -> Evaluation {
    let rank = |e: &Evaluation| match e.verdict {
        Verdict::Deny => 2,
        Verdict::Gate => 1,
        Verdict::Allow => 0,
    };
    let (mut winner, loser) = if rank(&b) > rank(&a) { (b, a) } else { (a, b) };
    // Keep the loser's reasons too so both endpoints are explained.
    winner.reasons.extend(loser.reasons);
    winner
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_policy() -> Policy {
        Policy::from_yaml_str(
            r#"
name: fs-test
capabilities:
  - tool: "file:read"
    scope:
      paths: ["/**"]
  - tool: "file:write"
    scope:
      paths: ["/**"]
  - tool: "file:delete"
    scope:
      paths: ["/**"]
  - tool: "file:copy"
    scope:
      paths: ["/tmp/**"]
"#,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn write_then_rollback_restores_prior_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, "before").unwrap();
        let input = json!({"path": path.to_string_lossy(), "content": "after"});

        let adapter = FileWriteAdapter;
        let mut ctx = ToolContext::new();
        let result = adapter.execute(&input, &mut ctx).await;
        assert!(result.success);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "after");
        assert_eq!(result.changed_file_artifacts(), 1);
        assert_eq!(ctx.budget.files_changed, 1);

        let rollback = adapter.rollback(&input, &mut ctx).await;
        assert!(rollback.success, "{rollback:?}");
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "before");
    }

    #[tokio::test]
    async fn write_rollback_removes_created_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("new.txt");
        let input = json!({"path": path.to_string_lossy(), "content": "x"});

        let adapter = FileWriteAdapter;
        let mut ctx = ToolContext::new();
        assert!(adapter.execute(&input, &mut ctx).await.success);
        assert!(path.exists());

        let rollback = adapter.rollback(&input, &mut ctx).await;
        assert!(rollback.success);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn delete_then_rollback_restores_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("d.txt");
        std::fs::write(&path, "keep me").unwrap();
        let input = json!({"path": path.to_string_lossy()});

        let adapter = FileDeleteAdapter;
        let mut ctx = ToolContext::new();
        let result = adapter.execute(&input, &mut ctx).await;
        assert!(result.success);
        assert!(!path.exists());

        let rollback = adapter.rollback(&input, &mut ctx).await;
        assert!(rollback.success);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "keep me");
    }

    #[tokio::test]
    async fn rollback_without_stash_fails_clearly() {
        let adapter = FileWriteAdapter;
        let mut ctx = ToolContext::new();
        let outcome = adapter
            .rollback(&json!({"path": "/tmp/x", "content": "y"}), &mut ctx)
            .await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("no stashed state"));
    }

    #[tokio::test]
    async fn copy_validates_both_endpoints() {
        let policy = test_policy();
        let adapter = FileCopyAdapter;

        // Both inside /tmp: allowed.
        let eval = adapter.validate(&json!({"source": "/tmp/a", "dest": "/tmp/b"}), &policy);
        assert_eq!(eval.verdict, Verdict::Allow);

        // Dest outside scope: the restrictive endpoint wins.
        let eval = adapter.validate(&json!({"source": "/tmp/a", "dest": "/etc/b"}), &policy);
        assert_eq!(eval.verdict, Verdict::Deny);
    }

    #[tokio::test]
    async fn invalid_input_denies_with_reason() {
        let policy = test_policy();
        let eval = FileReadAdapter.validate(&json!({"paht": "/x"}), &policy);
        assert_eq!(eval.verdict, Verdict::Deny);
        assert!(eval.reason_strings()[0].starts_with("Invalid input"));
    }

    #[tokio::test]
    async fn dry_run_flags_missing_file() {
        let dry = FileReadAdapter
            .dry_run(&json!({"path": "/definitely/not/here"}), &ToolContext::new())
            .await;
        assert_eq!(dry.estimated_changes, 0);
        assert_eq!(dry.warnings.len(), 1);
    }

    #[tokio::test]
    async fn read_does_not_count_as_file_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("r.txt");
        std::fs::write(&path, "data").unwrap();

        let mut ctx = ToolContext::new();
        let result = FileReadAdapter
            .execute(&json!({"path": path.to_string_lossy()}), &mut ctx)
            .await;
        assert!(result.success);
        assert_eq!(ctx.budget.files_changed, 0);
        assert!(ctx.budget.total_output_bytes > 0);
    }
}
