//! Policy schema, YAML loading and validation.
//!
//! Mirrors the normative YAML surface: top-level keys `version, name,
//! description, capabilities, limits, gates, evidence, forbidden,
//! remediation, session`. Unknown keys reject. Mutated policies (evolution)
//! must pass the same validator as freshly loaded ones.

use budget::Limits;
use globset::Glob;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use warden_core::RiskLevel;

fn default_version() -> String {
    "1.0".to_string()
}

fn default_format() -> String {
    "jsonl".to_string()
}

/// Errors produced by policy loading and validation.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// Policy file could not be read.
    #[error("failed to read policy file: {0}")]
    Io(#[from] std::io::Error),
    /// Policy file is not well-formed YAML or violates the schema shape.
    #[error("malformed policy YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    /// Policy parsed but failed semantic validation.
    #[error("invalid policy: {}", format_issues(.0))]
    Invalid(Vec<ValidationIssue>),
}

fn format_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(|i| format!("{}: {}", i.path, i.message))
        .collect::<Vec<_>>()
        .join("; ")
}

/// A single validation problem, addressed by a dotted path into the policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationIssue {
    /// Location of the problem, e.g. `capabilities[0].scope.paths[1]`.
    pub path: String,
    /// Human-readable description.
    pub message: String,
}

impl ValidationIssue {
    fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// A declarative governance policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Policy {
    /// Schema version, defaults to `"1.0"`.
    #[serde(default = "default_version")]
    pub version: String,
    /// Policy name.
    pub name: String,
    /// Optional free-form description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Ordered permission grants; a tool with no entry is implicitly denied.
    pub capabilities: Vec<Capability>,
    /// Numeric session ceilings.
    #[serde(default, skip_serializing_if = "limits_is_empty")]
    pub limits: Limits,
    /// Ordered approval checkpoints.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gates: Vec<Gate>,
    /// Evidence requirements propagated to ledger consumers.
    #[serde(default)]
    pub evidence: Evidence,
    /// Global deny patterns, checked before capabilities.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub forbidden: Vec<ForbiddenPattern>,
    /// Remediation rules (consumed by external tooling, carried verbatim).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remediation: Option<Remediation>,
    /// Session-level rules: action/denial limits, rate limit, escalations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionRules>,
}

fn limits_is_empty(l: &Limits) -> bool {
    *l == Limits::default()
}

/// A permission grant: a tool plus its scope allow-lists.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Capability {
    /// Tool name the grant applies to.
    pub tool: String,
    /// Optional allow-lists constraining the grant.
    #[serde(default, skip_serializing_if = "Scope::is_empty")]
    pub scope: Scope,
}

/// Scope allow-lists on a capability. Empty lists are treated as absent.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Scope {
    /// Path globs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paths: Option<Vec<String>>,
    /// Allowed binary base names.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binaries: Option<Vec<String>>,
    /// Allowed URL hostnames.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domains: Option<Vec<String>>,
    /// Allowed HTTP methods (upper-cased on load).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub methods: Option<Vec<String>>,
    /// Repository globs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repos: Option<Vec<String>>,
}

impl Scope {
    /// Whether no allow-list is present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.paths.is_none()
            && self.binaries.is_none()
            && self.domains.is_none()
            && self.methods.is_none()
            && self.repos.is_none()
    }
}

/// How a gate is approved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalMode {
    /// Approved immediately without an external decision.
    Auto,
    /// Requires a human decision.
    Human,
    /// Requires a webhook decision.
    Webhook,
}

impl std::fmt::Display for ApprovalMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Human => write!(f, "human"),
            Self::Webhook => write!(f, "webhook"),
        }
    }
}

/// An approval checkpoint interposed before allowing an action.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Gate {
    /// Tool name the gate applies to.
    pub action: String,
    /// Approval mode.
    pub approval: ApprovalMode,
    /// Risk classification, used by threshold auto-approval.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_level: Option<RiskLevel>,
    /// Firing condition; empty or absent means the gate always fires.
    /// `outside_scope` fires only when the scope checks would have failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

/// A global deny rule checked before capabilities.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ForbiddenPattern {
    /// Glob (paths, URLs) or substring (commands) pattern.
    pub pattern: String,
    /// Optional explanation surfaced with denials.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Declarative evidence requirements.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Evidence {
    /// Artifact kinds the ledger consumers expect.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub require: Vec<String>,
    /// Ledger format; only `jsonl` is supported.
    #[serde(default = "default_format")]
    pub format: String,
}

impl Default for Evidence {
    fn default() -> Self {
        Self {
            require: Vec::new(),
            format: default_format(),
        }
    }
}

/// Remediation configuration carried for external consumers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Remediation {
    /// Remediation rules (opaque to the core).
    #[serde(default)]
    pub rules: Vec<serde_yaml::Value>,
    /// Ordered fallback chain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_chain: Option<Vec<String>>,
}

/// Session-level rules.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SessionRules {
    /// Maximum evaluations per session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_actions: Option<u64>,
    /// Maximum denials before the session is terminated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_denials: Option<u64>,
    /// Sliding-window rate limit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimit>,
    /// Escalation rules forcing human check-ins.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub escalation: Vec<EscalationRule>,
}

/// Sliding-window rate limit over the last 60 seconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RateLimit {
    /// Maximum actions per minute.
    pub max_per_minute: u64,
}

/// Forces a human check-in after a number of actions or minutes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct EscalationRule {
    /// Fire once this many actions have been evaluated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after_actions: Option<u64>,
    /// Fire once this many minutes have elapsed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after_minutes: Option<u64>,
    /// What the escalation requires.
    pub require: EscalationRequire,
}

/// Escalation requirement kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationRequire {
    /// A resolved human gate.
    HumanCheckin,
}

impl Policy {
    /// Parse a policy from YAML, normalize and validate it.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::Yaml`] for malformed YAML or unknown keys, and
    /// [`PolicyError::Invalid`] with per-path issues for semantic problems.
    pub fn from_yaml_str(s: &str) -> Result<Self, PolicyError> {
        let mut policy: Self = serde_yaml::from_str(s)?;
        policy.normalize();
        policy.validate()?;
        Ok(policy)
    }

    /// Load a policy from a YAML file.
    ///
    /// # Errors
    ///
    /// Propagates I/O errors plus everything [`Policy::from_yaml_str`] returns.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, PolicyError> {
        let s = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&s)
    }

    /// Serialize the policy back to YAML.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::Yaml`] if serialization fails.
    pub fn to_yaml_string(&self) -> Result<String, PolicyError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Normalize in place: HTTP methods are upper-cased.
    pub fn normalize(&mut self) {
        for cap in &mut self.capabilities {
            if let Some(methods) = &mut cap.scope.methods {
                for m in methods.iter_mut() {
                    *m = m.to_ascii_uppercase();
                }
            }
        }
    }

    /// Validate semantic invariants.
    ///
    /// Run on every load and re-run after each evolution mutation; a policy
    /// that fails here must never be installed.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::Invalid`] carrying every issue found.
    pub fn validate(&self) -> Result<(), PolicyError> {
        let mut issues = Vec::new();

        if self.name.trim().is_empty() {
            issues.push(ValidationIssue::new("name", "must be non-empty"));
        }
        if self.capabilities.is_empty() {
            issues.push(ValidationIssue::new(
                "capabilities",
                "at least one capability is required",
            ));
        }
        for (i, cap) in self.capabilities.iter().enumerate() {
            if cap.tool.trim().is_empty() {
                issues.push(ValidationIssue::new(
                    format!("capabilities[{i}].tool"),
                    "must be non-empty",
                ));
            }
            check_scope_list(&mut issues, i, "paths", cap.scope.paths.as_deref(), true);
            check_scope_list(&mut issues, i, "binaries", cap.scope.binaries.as_deref(), false);
            check_scope_list(&mut issues, i, "domains", cap.scope.domains.as_deref(), false);
            check_scope_list(&mut issues, i, "methods", cap.scope.methods.as_deref(), false);
            check_scope_list(&mut issues, i, "repos", cap.scope.repos.as_deref(), true);
        }
        for (i, gate) in self.gates.iter().enumerate() {
            if gate.action.trim().is_empty() {
                issues.push(ValidationIssue::new(
                    format!("gates[{i}].action"),
                    "must be non-empty",
                ));
            }
        }
        for (i, f) in self.forbidden.iter().enumerate() {
            if f.pattern.trim().is_empty() {
                issues.push(ValidationIssue::new(
                    format!("forbidden[{i}].pattern"),
                    "must be non-empty",
                ));
            } else if Glob::new(&f.pattern).is_err() {
                issues.push(ValidationIssue::new(
                    format!("forbidden[{i}].pattern"),
                    "is not a valid glob",
                ));
            }
        }
        if self.evidence.format != "jsonl" {
            issues.push(ValidationIssue::new(
                "evidence.format",
                format!("unsupported format \"{}\"; only \"jsonl\"", self.evidence.format),
            ));
        }
        if let Some(cost) = self.limits.max_cost_usd {
            if cost < 0.0 {
                issues.push(ValidationIssue::new("limits.max_cost_usd", "must be non-negative"));
            }
        }
        if let Some(session) = &self.session {
            if let Some(rl) = &session.rate_limit {
                if rl.max_per_minute == 0 {
                    issues.push(ValidationIssue::new(
                        "session.rate_limit.max_per_minute",
                        "must be greater than zero",
                    ));
                }
            }
            for (i, rule) in session.escalation.iter().enumerate() {
                if rule.after_actions.is_none() && rule.after_minutes.is_none() {
                    issues.push(ValidationIssue::new(
                        format!("session.escalation[{i}]"),
                        "requires after_actions or after_minutes",
                    ));
                }
            }
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(PolicyError::Invalid(issues))
        }
    }

    /// First capability granted for `tool`.
    #[must_use]
    pub fn capability_for(&self, tool: &str) -> Option<&Capability> {
        self.capabilities.iter().find(|c| c.tool == tool)
    }

    /// First gate declared for `tool`.
    #[must_use]
    pub fn gate_for(&self, tool: &str) -> Option<&Gate> {
        self.gates.iter().find(|g| g.action == tool)
    }
}

fn check_scope_list(
    issues: &mut Vec<ValidationIssue>,
    cap_index: usize,
    field: &str,
    list: Option<&[String]>,
    glob: bool,
) {
    let Some(list) = list else { return };
    for (i, value) in list.iter().enumerate() {
        let path = format!("capabilities[{cap_index}].scope.{field}[{i}]");
        if value.trim().is_empty() {
            issues.push(ValidationIssue::new(path, "must be a non-empty string"));
        } else if glob && Glob::new(value).is_err() {
            issues.push(ValidationIssue::new(path, "is not a valid glob"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
name: test-policy
capabilities:
  - tool: "file:read"
    scope:
      paths: ["/data/**"]
"#;

    #[test]
    fn minimal_policy_parses_with_default_version() {
        let p = Policy::from_yaml_str(MINIMAL).unwrap();
        assert_eq!(p.version, "1.0");
        assert_eq!(p.capabilities.len(), 1);
        assert_eq!(p.evidence.format, "jsonl");
    }

    #[test]
    fn unknown_top_level_key_rejects() {
        let yaml = format!("{MINIMAL}\nunexpected: true\n");
        assert!(matches!(
            Policy::from_yaml_str(&yaml),
            Err(PolicyError::Yaml(_))
        ));
    }

    #[test]
    fn empty_capabilities_rejects() {
        let yaml = "name: p\ncapabilities: []\n";
        let err = Policy::from_yaml_str(yaml).unwrap_err();
        let PolicyError::Invalid(issues) = err else {
            panic!("expected Invalid, got {err}");
        };
        assert!(issues.iter().any(|i| i.path == "capabilities"));
    }

    #[test]
    fn methods_are_upper_cased_on_load() {
        let yaml = r#"
name: p
capabilities:
  - tool: "http:request"
    scope:
      methods: ["get", "Post"]
"#;
        let p = Policy::from_yaml_str(yaml).unwrap();
        assert_eq!(
            p.capabilities[0].scope.methods.as_deref().unwrap(),
            &["GET".to_string(), "POST".to_string()]
        );
    }

    #[test]
    fn empty_scope_value_reports_path() {
        let yaml = r#"
name: p
capabilities:
  - tool: "file:read"
    scope:
      paths: ["/data/**", ""]
"#;
        let err = Policy::from_yaml_str(yaml).unwrap_err();
        let PolicyError::Invalid(issues) = err else {
            panic!("expected Invalid");
        };
        assert_eq!(issues[0].path, "capabilities[0].scope.paths[1]");
    }

    #[test]
    fn escalation_rule_needs_a_trigger() {
        let yaml = r#"
name: p
capabilities:
  - tool: "file:read"
session:
  escalation:
    - require: human_checkin
"#;
        assert!(Policy::from_yaml_str(yaml).is_err());
    }

    #[test]
    fn yaml_round_trip_preserves_policy() {
        let yaml = r#"
name: round-trip
capabilities:
  - tool: "file:read"
    scope:
      paths: ["/data/**"]
forbidden:
  - pattern: "**/.env"
gates:
  - action: "file:write"
    approval: human
    risk_level: medium
session:
  max_actions: 10
  rate_limit:
    max_per_minute: 5
"#;
        let p = Policy::from_yaml_str(yaml).unwrap();
        let out = p.to_yaml_string().unwrap();
        let p2 = Policy::from_yaml_str(&out).unwrap();
        assert_eq!(p, p2);
    }

    #[test]
    fn remediation_block_is_accepted() {
        let yaml = r#"
name: p
capabilities:
  - tool: "file:read"
remediation:
  rules:
    - match: "timeout"
      action: retry
  fallback_chain: ["retry", "abort"]
"#;
        let p = Policy::from_yaml_str(yaml).unwrap();
        assert!(p.remediation.is_some());
    }
}
