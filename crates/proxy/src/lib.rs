//! MCP proxy: one virtual server multiplexing several backends, with the
//! gateway interposed on every tool call.
//!
//! At startup each backend is spawned as a child process and its tools are
//! discovered; name collisions resolve first-wins (with a warning). One
//! gateway session covers the proxy's lifetime. When policy evolution is
//! enabled, denials return a suggestion id and the extra virtual tool
//! `policy_evolution_approve` accepts the decision in-band.

#![deny(unsafe_code)]

mod backend;
mod server;

pub use backend::{Backend, BackendConfig};
pub use server::{run, ProxyConfig, WardenProxy, POLICY_EVOLUTION_TOOL};

use thiserror::Error;

/// Errors raised while bringing the proxy up or down.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Policy file problems.
    #[error(transparent)]
    Policy(#[from] policy::PolicyError),
    /// Gateway failures (session creation, ledger I/O).
    #[error(transparent)]
    Gateway(#[from] gateway::GatewayError),
    /// Config file could not be read.
    #[error("failed to read proxy config: {0}")]
    Io(#[from] std::io::Error),
    /// Config file is not valid YAML.
    #[error("malformed proxy config: {0}")]
    Config(#[from] serde_yaml::Error),
    /// A backend failed to spawn or complete the MCP handshake.
    #[error("backend \"{name}\" failed: {message}")]
    Backend {
        /// Backend name from the config.
        name: String,
        /// What went wrong.
        message: String,
    },
    /// Serving the stdio transport failed.
    #[error("mcp serve failed: {0}")]
    Serve(String),
}
