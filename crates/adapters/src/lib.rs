//! Tool adapters behind a uniform contract.
//!
//! Every adapter exposes `validate` (schema-parse the input, then delegate to
//! the policy evaluator), `dry_run` (no side effects), `execute` (capture
//! evidence artifacts, stash reversible state) and `rollback` (idempotent,
//! best-effort). Adapters are the only place that knows raw input shapes;
//! everything above works with canonical fields and verdicts.

#![deny(unsafe_code)]

mod contract;
mod dns;
mod env;
mod fs;
mod git;
mod http;
mod shell;

pub use contract::{AdapterRegistry, DryRun, RollbackOutcome, ToolAdapter, ToolContext};
pub use dns::DnsLookupAdapter;
pub use env::EnvReadAdapter;
pub use fs::{FileCopyAdapter, FileDeleteAdapter, FileReadAdapter, FileWriteAdapter};
pub use git::{GitApplyAdapter, GitDiffAdapter};
pub use http::HttpRequestAdapter;
pub use shell::CommandRunAdapter;

use sha2::{Digest, Sha256};

/// `sha256:`-prefixed hex digest of a byte slice.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(bytes)))
}
