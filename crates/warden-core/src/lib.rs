//! Warden core primitives and shared types.

#![deny(unsafe_code)]

/// Version of the warden core library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod ids {
    //! ID utilities: fixed-length random identifiers and timestamps.

    use rand::Rng;
    use std::time::{SystemTime, UNIX_EPOCH};

    const ID_CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

    /// Generate a random lowercase-alphanumeric identifier of `len` characters.
    #[must_use]
    pub fn random_id(len: usize) -> String {
        let mut rng = rand::thread_rng();
        (0..len)
            .map(|_| {
                let idx = rng.gen_range(0..ID_CHARS.len());
                ID_CHARS[idx] as char
            })
            .collect()
    }

    /// Session identifier (16 characters).
    #[must_use]
    pub fn session_id() -> String {
        random_id(16)
    }

    /// Action identifier (12 characters).
    #[must_use]
    pub fn action_id() -> String {
        random_id(12)
    }

    /// Suggestion identifier (12 characters).
    #[must_use]
    pub fn suggestion_id() -> String {
        random_id(12)
    }

    /// Milliseconds since UNIX epoch (for timestamps and elapsed-time math).
    #[must_use]
    pub fn now_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0)
    }

    /// Current UTC time as an ISO-8601 string with millisecond precision.
    #[must_use]
    pub fn now_iso() -> String {
        chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn id_lengths() {
            assert_eq!(session_id().len(), 16);
            assert_eq!(action_id().len(), 12);
            assert_eq!(suggestion_id().len(), 12);
        }

        #[test]
        fn ids_are_lowercase_alphanumeric() {
            let id = random_id(64);
            assert!(id
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        }

        #[test]
        fn iso_timestamp_has_millis() {
            let ts = now_iso();
            // 2026-08-01T12:34:56.789Z
            assert!(ts.ends_with('Z'));
            assert!(ts.contains('.'));
        }
    }
}

pub mod action {
    //! Action request and canonical input types.
    //!
    //! Tool invocations arrive as a tool name plus an untyped JSON argument
    //! bag. [`ActionInput`] is the canonical view the evaluator consumes:
    //! a small struct of optional fields, with [`ActionInput::from_json`]
    //! as the single place that knows the raw key conventions
    //! (`path|file|target`, `command|cmd`, `url|endpoint`, ...).

    use serde::{Deserialize, Serialize};
    use serde_json::Value as JsonValue;

    /// A single tool invocation requested by the agent.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct ActionRequest {
        /// Tool name, e.g. `file:read` or `command:run`.
        pub tool: String,
        /// Raw tool arguments.
        pub input: JsonValue,
    }

    impl ActionRequest {
        /// Construct a request from a tool name and raw arguments.
        pub fn new(tool: impl Into<String>, input: JsonValue) -> Self {
            Self {
                tool: tool.into(),
                input,
            }
        }

        /// Canonical view of the input bag.
        #[must_use]
        pub fn canonical_input(&self) -> ActionInput {
            ActionInput::from_json(&self.input)
        }
    }

    /// Canonical action input consumed by the policy evaluator.
    ///
    /// All fields are optional; absent fields simply make the corresponding
    /// scope checks inapplicable.
    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    pub struct ActionInput {
        /// Filesystem path (`path`, `file` or `target` in the raw bag).
        pub path: Option<String>,
        /// Full command line (`command` or `cmd`).
        pub command: Option<String>,
        /// Explicit binary name (`binary`).
        pub binary: Option<String>,
        /// URL (`url` or `endpoint`).
        pub url: Option<String>,
        /// HTTP method (`method`).
        pub method: Option<String>,
        /// Repository (`repo` or `repository`).
        pub repo: Option<String>,
    }

    impl ActionInput {
        /// Extract canonical fields from a raw JSON argument bag.
        #[must_use]
        pub fn from_json(input: &JsonValue) -> Self {
            let get = |keys: &[&str]| {
                keys.iter()
                    .find_map(|k| input.get(k).and_then(JsonValue::as_str))
                    .map(str::to_string)
            };
            Self {
                path: get(&["path", "file", "target"]),
                command: get(&["command", "cmd"]),
                binary: get(&["binary"]),
                url: get(&["url", "endpoint"]),
                method: get(&["method"]),
                repo: get(&["repo", "repository"]),
            }
        }

        /// The binary a command would execute: the explicit `binary` field or
        /// the first whitespace-separated token of `command`, base-named.
        #[must_use]
        pub fn effective_binary(&self) -> Option<String> {
            let raw = self.binary.as_deref().or(self.command.as_deref())?;
            let first = raw.split_whitespace().next()?;
            let base = first.rsplit('/').next().unwrap_or(first);
            if base.is_empty() {
                None
            } else {
                Some(base.to_string())
            }
        }

        /// The HTTP method, defaulting to `GET`, upper-cased.
        #[must_use]
        pub fn effective_method(&self) -> String {
            self.method
                .as_deref()
                .unwrap_or("GET")
                .to_ascii_uppercase()
        }
    }

}

pub mod verdict {
    //! Evaluation verdicts and risk levels.

    use serde::{Deserialize, Serialize};

    /// Outcome of evaluating one action against a policy.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum Verdict {
        /// Permit the action.
        Allow,
        /// Block the action.
        Deny,
        /// Hold the action for approval.
        Gate,
    }

    impl std::fmt::Display for Verdict {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                Self::Allow => write!(f, "allow"),
                Self::Deny => write!(f, "deny"),
                Self::Gate => write!(f, "gate"),
            }
        }
    }

    /// Risk classification attached to gates and used by auto-approval.
    ///
    /// Ordering is `low < medium < high < critical`.
    #[derive(
        Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default,
    )]
    #[serde(rename_all = "lowercase")]
    pub enum RiskLevel {
        /// Read-only or otherwise benign.
        Low,
        /// Mutating but contained.
        #[default]
        Medium,
        /// Destructive or hard to reverse.
        High,
        /// Irreversible or out-of-band impact.
        Critical,
    }

    impl std::fmt::Display for RiskLevel {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                Self::Low => write!(f, "low"),
                Self::Medium => write!(f, "medium"),
                Self::High => write!(f, "high"),
                Self::Critical => write!(f, "critical"),
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn risk_ordering() {
            assert!(RiskLevel::Low < RiskLevel::Medium);
            assert!(RiskLevel::Medium < RiskLevel::High);
            assert!(RiskLevel::High < RiskLevel::Critical);
        }
    }
}

pub mod result {
    //! Tool execution results and evidence artifacts.

    use serde::{Deserialize, Serialize};
    use serde_json::Value as JsonValue;

    /// Kind of evidence artifact captured by an adapter.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum ArtifactKind {
        /// Content digest of a mutated object.
        Checksum,
        /// Unified diff of a change.
        Diff,
        /// Captured output or trace.
        Log,
        /// Process exit code.
        ExitCode,
    }

    /// A single piece of evidence attached to an execution result.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct Artifact {
        /// Artifact kind.
        pub kind: ArtifactKind,
        /// What the artifact describes (path, stream name, ...).
        pub label: String,
        /// Artifact value (digest string, diff text, code).
        pub value: JsonValue,
    }

    impl Artifact {
        /// Construct an artifact.
        pub fn new(kind: ArtifactKind, label: impl Into<String>, value: JsonValue) -> Self {
            Self {
                kind,
                label: label.into(),
                value,
            }
        }
    }

    /// Result of executing one tool invocation.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct ActionResult {
        /// Whether the invocation succeeded.
        pub success: bool,
        /// Tool output, if any.
        #[serde(skip_serializing_if = "Option::is_none")]
        pub output: Option<JsonValue>,
        /// Evidence artifacts.
        #[serde(default)]
        pub artifacts: Vec<Artifact>,
        /// Wall-clock duration of the invocation.
        pub duration_ms: u64,
        /// Error message on failure.
        #[serde(skip_serializing_if = "Option::is_none")]
        pub error: Option<String>,
    }

    impl ActionResult {
        /// A successful result with output and artifacts.
        #[must_use]
        pub fn ok(output: Option<JsonValue>, artifacts: Vec<Artifact>, duration_ms: u64) -> Self {
            Self {
                success: true,
                output,
                artifacts,
                duration_ms,
                error: None,
            }
        }

        /// A failed result.
        #[must_use]
        pub fn err(error: impl Into<String>, duration_ms: u64) -> Self {
            Self {
                success: false,
                output: None,
                artifacts: Vec::new(),
                duration_ms,
                error: Some(error.into()),
            }
        }

        /// Bytes of serialized output, used for output-budget accounting.
        #[must_use]
        pub fn output_bytes(&self) -> u64 {
            self.output
                .as_ref()
                .and_then(|o| serde_json::to_string(o).ok())
                .map_or(0, |s| s.len() as u64)
        }

        /// Number of `diff`/`checksum` artifacts, used for file-change accounting.
        #[must_use]
        pub fn changed_file_artifacts(&self) -> u64 {
            self.artifacts
                .iter()
                .filter(|a| matches!(a.kind, ArtifactKind::Diff | ArtifactKind::Checksum))
                .count() as u64
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use serde_json::json;

        #[test]
        fn change_accounting_counts_diff_and_checksum() {
            let result = ActionResult::ok(
                Some(json!({"written": true})),
                vec![
                    Artifact::new(ArtifactKind::Checksum, "/data/a", json!("sha256:ab")),
                    Artifact::new(ArtifactKind::Diff, "/data/a", json!("--- a\n+++ b\n")),
                    Artifact::new(ArtifactKind::Log, "stdout", json!("done")),
                ],
                4,
            );
            assert_eq!(result.changed_file_artifacts(), 2);
            assert!(result.output_bytes() > 0);
        }
    }
}

pub mod session {
    //! Session lifecycle state.

    use serde::{Deserialize, Serialize};

    /// Lifecycle state of a session.
    ///
    /// `active → paused` on a pending human/webhook gate, `paused → active`
    /// when all pending gates resolve, any state `→ terminated` on explicit
    /// termination or a denial-limit breach.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum SessionState {
        /// Accepting evaluations.
        Active,
        /// Blocked on one or more pending gates.
        Paused,
        /// Closed; rejects further evaluation.
        Terminated,
    }

    impl std::fmt::Display for SessionState {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                Self::Active => write!(f, "active"),
                Self::Paused => write!(f, "paused"),
                Self::Terminated => write!(f, "terminated"),
            }
        }
    }
}

pub use action::{ActionInput, ActionRequest};
pub use result::{ActionResult, Artifact, ArtifactKind};
pub use session::SessionState;
pub use verdict::{RiskLevel, Verdict};
