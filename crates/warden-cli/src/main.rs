//! Warden CLI: validate policies, serve the HTTP facade, run the MCP proxy,
//! execute a single governed command, and inspect ledgers.

#![deny(unsafe_code)]

use adapters::{AdapterRegistry, ToolContext};
use clap::{Parser, Subcommand};
use gateway::{Gateway, GatewayConfig};
use policy::Policy;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use warden_core::{ActionRequest, Verdict};

#[derive(Parser, Debug)]
#[command(name = "warden", about = "Governance gateway for agent tool calls")]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate a policy file; exit 0 when valid
    Validate {
        /// Policy YAML file
        policy: PathBuf,
    },
    /// Start the HTTP facade
    Serve {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        #[arg(long, default_value_t = 8080)]
        port: u16,
        #[arg(long, default_value = "./ledgers")]
        ledger_dir: PathBuf,
        /// Default policy for sessions created without an inline policy
        #[arg(long)]
        policy: Option<PathBuf>,
    },
    /// Start the MCP proxy
    Proxy {
        /// Proxy config file (policy, backends, evolve)
        config: Option<PathBuf>,
        /// Policy file (when no config file is given)
        #[arg(long)]
        policy: Option<PathBuf>,
        /// Directory searched for `mcp-backends.yaml` in flag mode
        #[arg(long)]
        dir: Option<PathBuf>,
        #[arg(long, default_value = "./ledgers")]
        ledger_dir: PathBuf,
        /// Enable denial-driven policy evolution
        #[arg(long)]
        evolve: bool,
    },
    /// Evaluate and run a single command under a policy
    Exec {
        /// Policy YAML file
        policy: PathBuf,
        #[arg(long, default_value = "./ledgers")]
        ledger_dir: PathBuf,
        /// The command to run (after `--`)
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
    /// Verify a ledger file and print its summary; exit 0 when intact
    Report {
        /// Ledger JSONL file
        ledger_file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    telemetry::init_stderr_logging();
    let cli = Cli::parse();
    let code = match cli.cmd {
        Command::Validate { policy } => cmd_validate(&policy),
        Command::Serve {
            host,
            port,
            ledger_dir,
            policy,
        } => cmd_serve(&host, port, ledger_dir, policy.as_deref()).await?,
        Command::Proxy {
            config,
            policy,
            dir,
            ledger_dir,
            evolve,
        } => cmd_proxy(config, policy, dir, ledger_dir, evolve).await?,
        Command::Exec {
            policy,
            ledger_dir,
            command,
        } => cmd_exec(&policy, ledger_dir, &command).await?,
        Command::Report { ledger_file } => cmd_report(&ledger_file)?,
    };
    std::process::exit(code);
}

fn cmd_validate(path: &std::path::Path) -> i32 {
    match Policy::load(path) {
        Ok(policy) => {
            println!("policy \"{}\" is valid", policy.name);
            0
        }
        Err(policy::PolicyError::Invalid(issues)) => {
            for issue in issues {
                eprintln!("{}: {}", issue.path, issue.message);
            }
            1
        }
        Err(e) => {
            eprintln!("{e}");
            1
        }
    }
}

async fn cmd_serve(
    host: &str,
    port: u16,
    ledger_dir: PathBuf,
    policy: Option<&std::path::Path>,
) -> Result<i32, Box<dyn std::error::Error>> {
    let default_policy = match policy {
        Some(path) => Some(Arc::new(Policy::load(path)?)),
        None => None,
    };
    let state = server::AppState {
        gateway: Arc::new(Gateway::new(GatewayConfig::new(ledger_dir))),
        default_policy,
    };
    let addr = format!("{host}:{port}").parse()?;
    server::serve(state, addr).await?;
    Ok(0)
}

async fn cmd_proxy(
    config: Option<PathBuf>,
    policy: Option<PathBuf>,
    dir: Option<PathBuf>,
    ledger_dir: PathBuf,
    evolve: bool,
) -> Result<i32, Box<dyn std::error::Error>> {
    let config = match (config, policy) {
        (Some(path), _) => proxy::ProxyConfig::load(path)?,
        (None, Some(policy)) => {
            // Flag mode: backends come from `<dir>/mcp-backends.yaml` when
            // present, otherwise the proxy exposes only the virtual tools.
            let backends = dir
                .map(|d| d.join("mcp-backends.yaml"))
                .filter(|p| p.exists())
                .map(|p| -> Result<Vec<proxy::BackendConfig>, Box<dyn std::error::Error>> {
                    Ok(serde_yaml_from_path(&p)?)
                })
                .transpose()?
                .unwrap_or_default();
            proxy::ProxyConfig {
                policy,
                ledger_dir,
                evolve,
                auto_approve_below: None,
                backends,
            }
        }
        (None, None) => {
            eprintln!("proxy requires a config file or --policy");
            return Ok(1);
        }
    };
    proxy::run(config).await?;
    Ok(0)
}

fn serde_yaml_from_path<T: serde::de::DeserializeOwned>(
    path: &std::path::Path,
) -> Result<T, Box<dyn std::error::Error>> {
    let s = std::fs::read_to_string(path)?;
    Ok(serde_yaml::from_str(&s)?)
}

async fn cmd_exec(
    policy_path: &std::path::Path,
    ledger_dir: PathBuf,
    command: &[String],
) -> Result<i32, Box<dyn std::error::Error>> {
    let policy = Policy::load(policy_path)?;
    let gateway = Gateway::new(GatewayConfig::new(ledger_dir));
    let session_id = gateway.create_session(policy, json!({"source": "exec"}))?;

    let command_line = command.join(" ");
    let request = ActionRequest::new("command:run", json!({"command": command_line}));
    let response = gateway.evaluate(&session_id, request.clone()).await?;

    let code = match response.decision {
        Verdict::Deny => {
            for reason in response.reason_strings() {
                eprintln!("denied: {reason}");
            }
            1
        }
        Verdict::Gate => {
            eprintln!("denied: command is gated and no approver is attached");
            1
        }
        Verdict::Allow => {
            let registry = AdapterRegistry::with_builtins();
            let adapter = registry
                .get("command:run")
                .ok_or("command adapter missing")?;
            let mut ctx = ToolContext::new();
            let result = adapter.execute(&request.input, &mut ctx).await;
            let code = result
                .output
                .as_ref()
                .and_then(|o| o.get("exit_code"))
                .and_then(serde_json::Value::as_i64)
                .unwrap_or(if result.success { 0 } else { 1 });
            if let Some(output) = &result.output {
                if let Some(stdout) = output.get("stdout").and_then(serde_json::Value::as_str) {
                    print!("{stdout}");
                }
                if let Some(stderr) = output.get("stderr").and_then(serde_json::Value::as_str) {
                    eprint!("{stderr}");
                }
            }
            gateway
                .record_result(&session_id, &response.action_id, result)
                .await?;
            i32::try_from(code).unwrap_or(1)
        }
    };

    gateway.terminate(&session_id, Some("exec finished".into())).await?;
    Ok(code)
}

fn cmd_report(path: &std::path::Path) -> Result<i32, Box<dyn std::error::Error>> {
    let verify = ledger::verify_integrity(path)?;
    let summary = ledger::summarize(path)?;
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({"verify": verify, "summary": summary}))?
    );
    Ok(i32::from(!verify.valid))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_policy(dir: &std::path::Path, yaml: &str) -> PathBuf {
        let path = dir.join("policy.yaml");
        std::fs::write(&path, yaml).unwrap();
        path
    }

    #[test]
    fn validate_accepts_a_good_policy() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_policy(
            dir.path(),
            "name: ok\ncapabilities:\n  - tool: \"file:read\"\n",
        );
        assert_eq!(cmd_validate(&path), 0);
    }

    #[test]
    fn validate_rejects_a_bad_policy() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_policy(dir.path(), "name: bad\ncapabilities: []\n");
        assert_eq!(cmd_validate(&path), 1);
    }

    #[tokio::test]
    async fn exec_propagates_exit_code_and_denial() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_policy(
            dir.path(),
            r#"
name: exec-test
capabilities:
  - tool: "command:run"
    scope:
      binaries: ["sh", "true", "false"]
"#,
        );

        let code = cmd_exec(&path, dir.path().join("l1"), &["true".to_string()])
            .await
            .unwrap();
        assert_eq!(code, 0);

        let code = cmd_exec(&path, dir.path().join("l2"), &["false".to_string()])
            .await
            .unwrap();
        assert_eq!(code, 1);

        // Binary outside the allow-list: denied before execution.
        let code = cmd_exec(&path, dir.path().join("l3"), &["curl".to_string(), "x".to_string()])
            .await
            .unwrap();
        assert_eq!(code, 1);
    }

    #[tokio::test]
    async fn report_flags_tampering() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_policy(
            dir.path(),
            "name: r\ncapabilities:\n  - tool: \"command:run\"\n",
        );
        let ledger_dir = dir.path().join("ledgers");
        let _ = cmd_exec(&path, ledger_dir.clone(), &["true".to_string()])
            .await
            .unwrap();

        let ledger_file = std::fs::read_dir(&ledger_dir)
            .unwrap()
            .next()
            .unwrap()
            .unwrap()
            .path();
        assert_eq!(cmd_report(&ledger_file).unwrap(), 0);

        let content = std::fs::read_to_string(&ledger_file).unwrap();
        std::fs::write(&ledger_file, content.replace("command:run", "command:RUN")).unwrap();
        assert_eq!(cmd_report(&ledger_file).unwrap(), 1);
    }
}
