//! Hash-chained append-only evidence ledger.
//!
//! One JSONL file per session. Each line is a [`LedgerEntry`] whose `hash`
//! commits to the sequence number, timestamp, previous hash, event type and
//! a canonical serialization of the event data, so any byte-level tampering
//! breaks verification at the first affected entry.
//!
//! Canonical JSON is recursively key-sorted on both append and verify; the
//! same form must be used for the whole lifetime of a ledger file.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod entry;
mod verify;
mod writer;

pub use entry::{canonical_json, compute_hash, EventType, LedgerEntry, GENESIS_HASH};
pub use verify::{read_entries, summarize, verify_integrity, LedgerSummary, VerifyReport};
pub use writer::Ledger;

use thiserror::Error;

/// Errors emitted by the ledger.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Underlying I/O failure.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    /// JSON (de)serialization failure.
    #[error("serialize: {0}")]
    Serde(#[from] serde_json::Error),
    /// An existing ledger file ends in an unparseable line. Appending to it
    /// would silently restart the chain, so opening fails instead.
    #[error("corrupt ledger tail at {path}: {detail}")]
    CorruptTail {
        /// Ledger file path.
        path: String,
        /// What failed to parse.
        detail: String,
    },
    /// The ledger was closed and cannot accept appends.
    #[error("ledger is closed")]
    Closed,
}
