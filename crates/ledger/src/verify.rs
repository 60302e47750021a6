//! Ledger integrity verification and summaries.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::entry::{LedgerEntry, GENESIS_HASH};
use crate::LedgerError;

/// Result of replaying a ledger file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyReport {
    /// Whether the whole chain verified.
    pub valid: bool,
    /// Number of entries replayed (up to and including the broken one).
    pub entries: u64,
    /// Sequence number of the first broken entry, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broken_at: Option<u64>,
    /// Description of the failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl VerifyReport {
    fn ok(entries: u64) -> Self {
        Self {
            valid: true,
            entries,
            broken_at: None,
            error: None,
        }
    }

    fn broken(entries: u64, seq: u64, error: String) -> Self {
        Self {
            valid: false,
            entries,
            broken_at: Some(seq),
            error: Some(error),
        }
    }
}

/// Replay a ledger file and verify its hash chain.
///
/// Each entry must link to the previous entry's hash (genesis for the first)
/// and its own hash must recompute from the canonical form of what is on
/// disk. An empty or missing-trailing-newline file with zero entries is
/// valid.
///
/// # Errors
///
/// Returns [`LedgerError::Io`] only when the file cannot be read at all;
/// integrity problems are reported as data in the [`VerifyReport`].
pub fn verify_integrity(path: impl AsRef<Path>) -> Result<VerifyReport, LedgerError> {
    let file = File::open(path.as_ref())?;
    let reader = BufReader::new(file);

    let mut prev_hash = GENESIS_HASH.to_string();
    let mut count: u64 = 0;

    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let seq_hint = count + 1;
        let entry: LedgerEntry = match serde_json::from_str(&line) {
            Ok(e) => e,
            Err(e) => {
                return Ok(VerifyReport::broken(
                    seq_hint,
                    seq_hint,
                    format!("Unparseable entry: {e}"),
                ));
            }
        };
        count += 1;

        if entry.seq != count {
            return Ok(VerifyReport::broken(
                count,
                entry.seq,
                format!("Sequence gap: expected {count}, found {}", entry.seq),
            ));
        }
        if entry.prev != prev_hash {
            return Ok(VerifyReport::broken(
                count,
                entry.seq,
                format!(
                    "Chain break: prev {} does not match prior hash {prev_hash}",
                    entry.prev
                ),
            ));
        }
        let expected = entry.expected_hash();
        if entry.hash != expected {
            return Ok(VerifyReport::broken(
                count,
                entry.seq,
                format!("Hash mismatch: stored {} != computed {expected}", entry.hash),
            ));
        }
        prev_hash = entry.hash;
    }

    Ok(VerifyReport::ok(count))
}

/// Aggregate view of a ledger file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerSummary {
    /// Session the file belongs to (from the first entry).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Total entries.
    pub entries: u64,
    /// Entry count per event type.
    pub by_type: BTreeMap<String, u64>,
    /// Timestamp of the first entry.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_ts: Option<String>,
    /// Timestamp of the last entry.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_ts: Option<String>,
}

/// Read every entry of a ledger file, in order.
///
/// # Errors
///
/// Returns [`LedgerError::Io`] for unreadable files and
/// [`LedgerError::Serde`] for unparseable lines.
pub fn read_entries(path: impl AsRef<Path>) -> Result<Vec<LedgerEntry>, LedgerError> {
    let file = File::open(path.as_ref())?;
    let reader = BufReader::new(file);
    let mut out = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        out.push(serde_json::from_str(&line)?);
    }
    Ok(out)
}

/// Summarize a ledger file: counts per event type plus time bounds.
///
/// # Errors
///
/// Propagates [`read_entries`] errors.
pub fn summarize(path: impl AsRef<Path>) -> Result<LedgerSummary, LedgerError> {
    let entries = read_entries(path)?;
    let mut by_type = BTreeMap::new();
    for e in &entries {
        *by_type.entry(e.event_type.as_str().to_string()).or_insert(0) += 1;
    }
    Ok(LedgerSummary {
        session_id: entries.first().map(|e| e.session_id.clone()),
        entries: entries.len() as u64,
        by_type,
        first_ts: entries.first().map(|e| e.ts.clone()),
        last_ts: entries.last().map(|e| e.ts.clone()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::EventType;
    use crate::writer::Ledger;
    use serde_json::json;

    fn sample_ledger(dir: &Path) -> std::path::PathBuf {
        let path = dir.join("s.jsonl");
        let ledger = Ledger::open(&path).unwrap();
        ledger
            .append("s", EventType::SessionStart, json!({"policy": "p"}))
            .unwrap();
        ledger
            .append("s", EventType::ActionEvaluate, json!({"verdict": "allow", "tool": "file:read"}))
            .unwrap();
        ledger
            .append("s", EventType::ActionResult, json!({"success": true}))
            .unwrap();
        ledger
            .append("s", EventType::SessionTerminate, json!({"reason": "done"}))
            .unwrap();
        path
    }

    #[test]
    fn normal_operation_verifies() {
        let dir = tempfile::tempdir().unwrap();
        let path = sample_ledger(dir.path());
        let report = verify_integrity(&path).unwrap();
        assert!(report.valid, "{report:?}");
        assert_eq!(report.entries, 4);
    }

    #[test]
    fn empty_file_is_valid_with_zero_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.jsonl");
        std::fs::write(&path, "").unwrap();
        let report = verify_integrity(&path).unwrap();
        assert!(report.valid);
        assert_eq!(report.entries, 0);
    }

    #[test]
    fn data_tampering_breaks_at_first_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = sample_ledger(dir.path());

        let content = std::fs::read_to_string(&path).unwrap();
        let tampered: Vec<String> = content
            .lines()
            .enumerate()
            .map(|(i, line)| {
                if i == 0 {
                    line.replace("\"policy\":\"p\"", "\"policy\":\"evil\"")
                } else {
                    line.to_string()
                }
            })
            .collect();
        std::fs::write(&path, tampered.join("\n") + "\n").unwrap();

        let report = verify_integrity(&path).unwrap();
        assert!(!report.valid);
        assert_eq!(report.broken_at, Some(1));
        assert!(report.error.unwrap().contains("Hash mismatch"));
    }

    #[test]
    fn chain_break_detected_on_removed_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = sample_ledger(dir.path());

        let content = std::fs::read_to_string(&path).unwrap();
        let kept: Vec<&str> = content.lines().enumerate().filter(|(i, _)| *i != 1).map(|(_, l)| l).collect();
        std::fs::write(&path, kept.join("\n") + "\n").unwrap();

        let report = verify_integrity(&path).unwrap();
        assert!(!report.valid);
        assert_eq!(report.broken_at, Some(3));
    }

    #[test]
    fn summary_counts_by_type() {
        let dir = tempfile::tempdir().unwrap();
        let path = sample_ledger(dir.path());
        let summary = summarize(&path).unwrap();
        assert_eq!(summary.entries, 4);
        assert_eq!(summary.session_id.as_deref(), Some("s"));
        assert_eq!(summary.by_type.get("action:evaluate"), Some(&1));
        assert!(summary.first_ts.is_some());
    }
}
