//! Git adapters: diff (read-only) and apply (reversible via `-R`).

use async_trait::async_trait;
use policy::{Evaluation, Policy};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use warden_core::{ActionResult, Artifact, ArtifactKind};

use crate::contract::{
    elapsed, invalid_dry_run, invalid_result, parse_input, validate_with, DryRun, RollbackOutcome,
    ToolAdapter, ToolContext,
};

#[derive(Debug, Deserialize)]
struct DiffInput {
    #[serde(default)]
    repo_dir: Option<String>,
    #[serde(default)]
    pathspec: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApplyInput {
    patch: String,
    #[serde(default)]
    repo_dir: Option<String>,
}

async fn run_git(
    repo_dir: Option<&str>,
    args: &[&str],
    stdin: Option<&str>,
) -> Result<(i32, String, String), String> {
    let mut cmd = tokio::process::Command::new("git");
    cmd.args(args)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = repo_dir {
        cmd.current_dir(dir);
    }

    let mut child = cmd.spawn().map_err(|e| format!("spawn git: {e}"))?;
    if let (Some(data), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(data.as_bytes())
            .await
            .map_err(|e| format!("write git stdin: {e}"))?;
        drop(pipe);
    }
    let output = child
        .wait_with_output()
        .await
        .map_err(|e| format!("wait git: {e}"))?;
    Ok((
        output.status.code().unwrap_or(-1),
        String::from_utf8_lossy(&output.stdout).into_owned(),
        String::from_utf8_lossy(&output.stderr).into_owned(),
    ))
}

/// Show the working-tree diff of a repository.
pub struct GitDiffAdapter;

#[async_trait]
impl ToolAdapter for GitDiffAdapter {
    fn name(&self) -> &'static str {
        "git:diff"
    }

    fn description(&self) -> &'static str {
        "Show uncommitted changes in a git repository"
    }

    fn input_schema(&self) -> JsonValue {
        json!({
            "type": "object",
            "properties": {
                "repo_dir": { "type": "string" },
                "pathspec": { "type": "string" }
            }
        })
    }

    fn validate(&self, input: &JsonValue, policy: &Policy) -> Evaluation {
        validate_with::<DiffInput>(self.name(), input, policy)
    }

    async fn dry_run(&self, input: &JsonValue, _ctx: &ToolContext) -> DryRun {
        match parse_input::<DiffInput>(self.name(), input) {
            Ok(args) => DryRun {
                would_do: format!(
                    "git diff in {}",
                    args.repo_dir.as_deref().unwrap_or(".")
                ),
                estimated_changes: 0,
                warnings: Vec::new(),
            },
            Err(e) => invalid_dry_run(e),
        }
    }

    async fn execute(&self, input: &JsonValue, ctx: &mut ToolContext) -> ActionResult {
        let started = warden_core::ids::now_ms();
        let args = match parse_input::<DiffInput>(self.name(), input) {
            Ok(a) => a,
            Err(e) => return invalid_result(&e, started),
        };

        let mut git_args = vec!["diff"];
        if let Some(pathspec) = &args.pathspec {
            git_args.push("--");
            git_args.push(pathspec);
        }

        let result = match run_git(args.repo_dir.as_deref(), &git_args, None).await {
            Ok((0, stdout, _)) => ActionResult::ok(
                Some(json!({"diff": stdout})),
                vec![Artifact::new(ArtifactKind::Log, "diff", json!(stdout))],
                elapsed(started),
            ),
            Ok((code, _, stderr)) => {
                ActionResult::err(format!("git diff exited {code}: {stderr}"), elapsed(started))
            }
            Err(e) => ActionResult::err(e, elapsed(started)),
        };
        ctx.budget.record_result(&result);
        result
    }

    async fn rollback(&self, _input: &JsonValue, _ctx: &mut ToolContext) -> RollbackOutcome {
        RollbackOutcome::ok("diff has no effects to roll back")
    }
}

/// Apply a patch to a working tree; rollback re-applies it in reverse.
pub struct GitApplyAdapter;

#[async_trait]
impl ToolAdapter for GitApplyAdapter {
    fn name(&self) -> &'static str {
        "git:apply"
    }

    fn description(&self) -> &'static str {
        "Apply a unified diff to a git working tree"
    }

    fn input_schema(&self) -> JsonValue {
        json!({
            "type": "object",
            "properties": {
                "patch": { "type": "string" },
                "repo_dir": { "type": "string" }
            },
            "required": ["patch"]
        })
    }

    fn validate(&self, input: &JsonValue, policy: &Policy) -> Evaluation {
        validate_with::<ApplyInput>(self.name(), input, policy)
    }

    async fn dry_run(&self, input: &JsonValue, _ctx: &ToolContext) -> DryRun {
        let args = match parse_input::<ApplyInput>(self.name(), input) {
            Ok(a) => a,
            Err(e) => return invalid_dry_run(e),
        };
        // `git apply --check` validates without touching the tree.
        let check = run_git(
            args.repo_dir.as_deref(),
            &["apply", "--check", "-"],
            Some(&args.patch),
        )
        .await;
        let warnings = match check {
            Ok((0, _, _)) => Vec::new(),
            Ok((_, _, stderr)) => vec![format!("patch does not apply: {}", stderr.trim())],
            Err(e) => vec![e],
        };
        DryRun {
            would_do: format!(
                "apply a {}-byte patch in {}",
                args.patch.len(),
                args.repo_dir.as_deref().unwrap_or(".")
            ),
            estimated_changes: 1,
            warnings,
        }
    }

    async fn execute(&self, input: &JsonValue, ctx: &mut ToolContext) -> ActionResult {
        let started = warden_core::ids::now_ms();
        let args = match parse_input::<ApplyInput>(self.name(), input) {
            Ok(a) => a,
            Err(e) => return invalid_result(&e, started),
        };

        let result = match run_git(
            args.repo_dir.as_deref(),
            &["apply", "-"],
            Some(&args.patch),
        )
        .await
        {
            Ok((0, _, _)) => {
                debug!(bytes = args.patch.len(), "patch applied");
                ctx.rollback_data.insert(
                    ToolContext::stash_key(self.name(), input),
                    json!(args.patch),
                );
                ActionResult::ok(
                    Some(json!({"applied": true})),
                    vec![
                        Artifact::new(ArtifactKind::Diff, "patch", json!(args.patch)),
                        Artifact::new(
                            ArtifactKind::Checksum,
                            "patch",
                            json!(crate::sha256_hex(args.patch.as_bytes())),
                        ),
                    ],
                    elapsed(started),
                )
            }
            Ok((code, _, stderr)) => {
                ActionResult::err(format!("git apply exited {code}: {stderr}"), elapsed(started))
            }
            Err(e) => ActionResult::err(e, elapsed(started)),
        };
        ctx.budget.record_result(&result);
        result
    }

    async fn rollback(&self, input: &JsonValue, ctx: &mut ToolContext) -> RollbackOutcome {
        let Ok(args) = parse_input::<ApplyInput>(self.name(), input) else {
            return RollbackOutcome::failed("rollback git:apply", "unparseable input");
        };
        let key = ToolContext::stash_key(self.name(), input);
        let Some(patch) = ctx.rollback_data.get(&key).and_then(|v| v.as_str().map(str::to_string))
        else {
            return RollbackOutcome::failed(
                "reverse-apply patch",
                "no stashed state for this invocation",
            );
        };
        match run_git(args.repo_dir.as_deref(), &["apply", "-R", "-"], Some(&patch)).await {
            Ok((0, _, _)) => RollbackOutcome::ok("patch reverse-applied"),
            Ok((code, _, stderr)) => RollbackOutcome::failed(
                "reverse-apply patch",
                format!("git apply -R exited {code}: {}", stderr.trim()),
            ),
            Err(e) => RollbackOutcome::failed("reverse-apply patch", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn init_repo(dir: &std::path::Path) {
        for args in [
            vec!["init", "-q"],
            vec!["config", "user.email", "t@t.dev"],
            vec!["config", "user.name", "t"],
        ] {
            let (code, _, stderr) = run_git(Some(&dir.to_string_lossy()), &args, None)
                .await
                .unwrap();
            assert_eq!(code, 0, "{stderr}");
        }
    }

    const PATCH: &str = "--- a/f.txt\n+++ b/f.txt\n@@ -1 +1 @@\n-one\n+two\n";

    #[tokio::test]
    async fn apply_then_rollback_restores_the_tree() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path()).await;
        std::fs::write(dir.path().join("f.txt"), "one\n").unwrap();

        let input = json!({"patch": PATCH, "repo_dir": dir.path().to_string_lossy()});
        let adapter = GitApplyAdapter;
        let mut ctx = ToolContext::new();

        let result = adapter.execute(&input, &mut ctx).await;
        assert!(result.success, "{result:?}");
        assert_eq!(
            std::fs::read_to_string(dir.path().join("f.txt")).unwrap(),
            "two\n"
        );
        assert_eq!(result.changed_file_artifacts(), 2);

        let rollback = adapter.rollback(&input, &mut ctx).await;
        assert!(rollback.success, "{rollback:?}");
        assert_eq!(
            std::fs::read_to_string(dir.path().join("f.txt")).unwrap(),
            "one\n"
        );
    }

    #[tokio::test]
    async fn diff_reports_uncommitted_changes() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path()).await;
        std::fs::write(dir.path().join("f.txt"), "one\n").unwrap();
        run_git(Some(&dir.path().to_string_lossy()), &["add", "."], None)
            .await
            .unwrap();
        run_git(
            Some(&dir.path().to_string_lossy()),
            &["commit", "-q", "-m", "init"],
            None,
        )
        .await
        .unwrap();
        std::fs::write(dir.path().join("f.txt"), "changed\n").unwrap();

        let mut ctx = ToolContext::new();
        let result = GitDiffAdapter
            .execute(
                &json!({"repo_dir": dir.path().to_string_lossy()}),
                &mut ctx,
            )
            .await;
        assert!(result.success);
        let diff = result.output.unwrap()["diff"].as_str().unwrap().to_string();
        assert!(diff.contains("changed"));
        // Read-only: no file-change accounting.
        assert_eq!(ctx.budget.files_changed, 0);
    }

    #[tokio::test]
    async fn bad_patch_is_a_failed_result() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path()).await;

        let mut ctx = ToolContext::new();
        let result = GitApplyAdapter
            .execute(
                &json!({"patch": "garbage", "repo_dir": dir.path().to_string_lossy()}),
                &mut ctx,
            )
            .await;
        assert!(!result.success);
    }

    #[tokio::test]
    async fn rollback_without_stash_fails() {
        let mut ctx = ToolContext::new();
        let outcome = GitApplyAdapter
            .rollback(&json!({"patch": PATCH}), &mut ctx)
            .await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("no stashed state"));
    }
}
