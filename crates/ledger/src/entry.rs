//! Ledger entry type, event taxonomy and hashing.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};

/// `prev` value of the first entry in every ledger file.
pub const GENESIS_HASH: &str =
    "sha256:0000000000000000000000000000000000000000000000000000000000000000";

/// Closed set of ledger event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    /// Session created.
    #[serde(rename = "session:start")]
    SessionStart,
    /// Session paused or resumed.
    #[serde(rename = "session:state_change")]
    SessionStateChange,
    /// Session terminated.
    #[serde(rename = "session:terminate")]
    SessionTerminate,
    /// Action evaluated.
    #[serde(rename = "action:evaluate")]
    ActionEvaluate,
    /// Action result recorded.
    #[serde(rename = "action:result")]
    ActionResult,
    /// Rollback attempted for an action.
    #[serde(rename = "action:rollback")]
    ActionRollback,
    /// Gate approval requested.
    #[serde(rename = "gate:requested")]
    GateRequested,
    /// Gate approved.
    #[serde(rename = "gate:approved")]
    GateApproved,
    /// Gate rejected.
    #[serde(rename = "gate:rejected")]
    GateRejected,
    /// Budget warning threshold crossed.
    #[serde(rename = "budget:warning")]
    BudgetWarning,
    /// Budget ceiling breached.
    #[serde(rename = "budget:exceeded")]
    BudgetExceeded,
    /// Escalation rule fired.
    #[serde(rename = "escalation:triggered")]
    EscalationTriggered,
}

impl EventType {
    /// Wire name of the event type (as hashed and serialized).
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SessionStart => "session:start",
            Self::SessionStateChange => "session:state_change",
            Self::SessionTerminate => "session:terminate",
            Self::ActionEvaluate => "action:evaluate",
            Self::ActionResult => "action:result",
            Self::ActionRollback => "action:rollback",
            Self::GateRequested => "gate:requested",
            Self::GateApproved => "gate:approved",
            Self::GateRejected => "gate:rejected",
            Self::BudgetWarning => "budget:warning",
            Self::BudgetExceeded => "budget:exceeded",
            Self::EscalationTriggered => "escalation:triggered",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One line of a ledger file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// 1-based sequence number within the file.
    pub seq: u64,
    /// ISO-8601 timestamp with millisecond precision.
    pub ts: String,
    /// `sha256:`-prefixed hash of this entry.
    pub hash: String,
    /// Hash of the previous entry; [`GENESIS_HASH`] for entry 1.
    pub prev: String,
    /// Owning session.
    #[serde(rename = "sessionId")]
    pub session_id: String,
    /// Event type.
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Event payload.
    pub data: JsonValue,
}

impl LedgerEntry {
    /// Recompute this entry's hash from its own fields.
    #[must_use]
    pub fn expected_hash(&self) -> String {
        compute_hash(self.seq, &self.ts, &self.prev, self.event_type, &self.data)
    }
}

/// Deterministic JSON used for hashing: object keys recursively sorted,
/// no insignificant whitespace. Scalars and arrays render as `serde_json`
/// would.
#[must_use]
pub fn canonical_json(value: &JsonValue) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &JsonValue, out: &mut String) {
    match value {
        JsonValue::Object(map) => {
            out.push('{');
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key).unwrap_or_default());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        JsonValue::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&serde_json::to_string(other).unwrap_or_default()),
    }
}

/// Entry hash: `"sha256:" + SHA256(seq "|" ts "|" prev "|" type "|" canonical(data))`.
#[must_use]
pub fn compute_hash(
    seq: u64,
    ts: &str,
    prev: &str,
    event_type: EventType,
    data: &JsonValue,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(seq.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(ts.as_bytes());
    hasher.update(b"|");
    hasher.update(prev.as_bytes());
    hasher.update(b"|");
    hasher.update(event_type.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(canonical_json(data).as_bytes());
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_json_sorts_keys_recursively() {
        let v = json!({"b": 1, "a": {"z": [1, 2], "y": "s"}});
        assert_eq!(canonical_json(&v), r#"{"a":{"y":"s","z":[1,2]},"b":1}"#);
    }

    #[test]
    fn canonical_json_is_stable_across_parses() {
        let v1: JsonValue = serde_json::from_str(r#"{"x":1,"a":{"k":true}}"#).unwrap();
        let v2: JsonValue = serde_json::from_str(&canonical_json(&v1)).unwrap();
        assert_eq!(canonical_json(&v1), canonical_json(&v2));
    }

    #[test]
    fn hash_has_prefix_and_length() {
        let h = compute_hash(1, "2026-01-01T00:00:00.000Z", GENESIS_HASH, EventType::SessionStart, &json!({}));
        assert!(h.starts_with("sha256:"));
        assert_eq!(h.len(), "sha256:".len() + 64);
    }

    #[test]
    fn hash_depends_on_every_component() {
        let data = json!({"k": "v"});
        let base = compute_hash(1, "t", "p", EventType::ActionEvaluate, &data);
        assert_ne!(base, compute_hash(2, "t", "p", EventType::ActionEvaluate, &data));
        assert_ne!(base, compute_hash(1, "u", "p", EventType::ActionEvaluate, &data));
        assert_ne!(base, compute_hash(1, "t", "q", EventType::ActionEvaluate, &data));
        assert_ne!(base, compute_hash(1, "t", "p", EventType::ActionResult, &data));
        assert_ne!(
            base,
            compute_hash(1, "t", "p", EventType::ActionEvaluate, &json!({"k": "w"}))
        );
    }

    #[test]
    fn entry_round_trips_with_wire_names() {
        let entry = LedgerEntry {
            seq: 1,
            ts: "2026-01-01T00:00:00.000Z".into(),
            hash: "sha256:ab".into(),
            prev: GENESIS_HASH.into(),
            session_id: "s".into(),
            event_type: EventType::GateRequested,
            data: json!({}),
        };
        let line = serde_json::to_string(&entry).unwrap();
        assert!(line.contains("\"type\":\"gate:requested\""));
        assert!(line.contains("\"sessionId\":\"s\""));
        let back: LedgerEntry = serde_json::from_str(&line).unwrap();
        assert_eq!(back.event_type, EventType::GateRequested);
    }
}
