//! Per-session budget counters bounded by policy limits.

#![deny(unsafe_code)]

use serde::{Deserialize, Serialize};
use warden_core::ActionResult;

/// Numeric ceilings a policy may impose on a session.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Limits {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_runtime_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_files_changed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_cost_usd: Option<f64>,
}

/// Monotonic per-session counters.
///
/// `started_at` is the epoch-ms instant the session was created; all other
/// fields only ever increase.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BudgetSnapshot {
    pub started_at: u64,
    pub actions_evaluated: u64,
    pub actions_denied: u64,
    pub files_changed: u64,
    pub total_output_bytes: u64,
    pub retries: u64,
    pub cost_usd: f64,
}

impl BudgetSnapshot {
    /// A fresh budget starting now.
    #[must_use]
    pub fn new(started_at: u64) -> Self {
        Self {
            started_at,
            actions_evaluated: 0,
            actions_denied: 0,
            files_changed: 0,
            total_output_bytes: 0,
            retries: 0,
            cost_usd: 0.0,
        }
    }

    /// Elapsed wall time since session start.
    #[must_use]
    pub fn elapsed_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.started_at)
    }

    /// Fold an execution result into the counters: `diff`/`checksum`
    /// artifacts count as changed files, serialized output as output bytes,
    /// a failed result as one retry consumed.
    pub fn record_result(&mut self, result: &ActionResult) {
        self.files_changed = self
            .files_changed
            .saturating_add(result.changed_file_artifacts());
        self.total_output_bytes = self.total_output_bytes.saturating_add(result.output_bytes());
        if !result.success {
            self.retries = self.retries.saturating_add(1);
        }
    }

    /// Record a cost increment in USD.
    pub fn record_cost(&mut self, usd: f64) {
        if usd > 0.0 {
            self.cost_usd += usd;
        }
    }

    /// First breached limit, if any.
    #[must_use]
    pub fn breach(&self, limits: &Limits, now_ms: u64) -> Option<BudgetBreach> {
        if let Some(max) = limits.max_runtime_ms {
            if self.elapsed_ms(now_ms) > max {
                return Some(BudgetBreach::Runtime {
                    elapsed_ms: self.elapsed_ms(now_ms),
                    max_ms: max,
                });
            }
        }
        if let Some(max) = limits.max_files_changed {
            if self.files_changed >= max {
                return Some(BudgetBreach::FilesChanged {
                    used: self.files_changed,
                    max,
                });
            }
        }
        if let Some(max) = limits.max_output_bytes {
            if self.total_output_bytes >= max {
                return Some(BudgetBreach::OutputBytes {
                    used: self.total_output_bytes,
                    max,
                });
            }
        }
        if let Some(max) = limits.max_retries {
            if self.retries >= max {
                return Some(BudgetBreach::Retries {
                    used: self.retries,
                    max,
                });
            }
        }
        if let Some(max) = limits.max_cost_usd {
            if self.cost_usd >= max {
                return Some(BudgetBreach::Cost {
                    used: self.cost_usd,
                    max,
                });
            }
        }
        None
    }
}

/// A breached budget ceiling. Hard limits are never suggestible by the
/// evolution subsystem; the evaluator wraps these into denial reasons.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "limit", rename_all = "snake_case")]
pub enum BudgetBreach {
    Runtime { elapsed_ms: u64, max_ms: u64 },
    FilesChanged { used: u64, max: u64 },
    OutputBytes { used: u64, max: u64 },
    Retries { used: u64, max: u64 },
    Cost { used: f64, max: f64 },
}

impl std::fmt::Display for BudgetBreach {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Runtime { elapsed_ms, max_ms } => {
                write!(f, "Runtime budget exceeded: {elapsed_ms}ms > {max_ms}ms")
            }
            Self::FilesChanged { used, max } => {
                write!(f, "File change budget exhausted: {used}/{max}")
            }
            Self::OutputBytes { used, max } => {
                write!(f, "Output byte budget exhausted: {used}/{max}")
            }
            Self::Retries { used, max } => write!(f, "Retry budget exhausted: {used}/{max}"),
            Self::Cost { used, max } => {
                write!(f, "Cost budget exhausted: ${used:.4}/${max:.4}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use warden_core::{Artifact, ArtifactKind};

    #[test]
    fn breach_order_prefers_runtime() {
        let limits = Limits {
            max_runtime_ms: Some(10),
            max_files_changed: Some(1),
            ..Limits::default()
        };
        let mut b = BudgetSnapshot::new(0);
        b.files_changed = 5;
        let breach = b.breach(&limits, 100).unwrap();
        assert!(matches!(breach, BudgetBreach::Runtime { .. }));
    }

    #[test]
    fn result_recording_updates_counters() {
        let mut b = BudgetSnapshot::new(0);
        let result = ActionResult::ok(
            Some(json!("hello")),
            vec![Artifact::new(ArtifactKind::Checksum, "/f", json!("sha256:00"))],
            3,
        );
        b.record_result(&result);
        assert_eq!(b.files_changed, 1);
        assert_eq!(b.total_output_bytes, "\"hello\"".len() as u64);
        assert_eq!(b.retries, 0);

        b.record_result(&ActionResult::err("boom", 1));
        assert_eq!(b.retries, 1);
    }

    #[test]
    fn no_limits_means_no_breach() {
        let b = BudgetSnapshot::new(0);
        assert!(b.breach(&Limits::default(), u64::MAX).is_none());
    }

    #[test]
    fn files_changed_breach_at_threshold() {
        let limits = Limits {
            max_files_changed: Some(3),
            ..Limits::default()
        };
        let mut b = BudgetSnapshot::new(0);
        b.files_changed = 3;
        assert!(matches!(
            b.breach(&limits, 0),
            Some(BudgetBreach::FilesChanged { used: 3, max: 3 })
        ));
    }
}
