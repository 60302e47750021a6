//! Typed denial reasons.
//!
//! Denials are data, not errors. Each reason is a tagged variant; the
//! `Display` impl renders the stable strings consumed by humans and logged
//! to the ledger. The evolution suggester matches on the variants directly,
//! never on the rendered strings.

use budget::BudgetBreach;
use serde::{Deserialize, Serialize};
use warden_core::SessionState;

/// Scope allow-list a violation refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeField {
    /// Path globs.
    Paths,
    /// Binary base names.
    Binaries,
    /// URL hostnames.
    Domains,
    /// HTTP methods.
    Methods,
    /// Repository globs.
    Repos,
}

impl std::fmt::Display for ScopeField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Paths => write!(f, "paths"),
            Self::Binaries => write!(f, "binaries"),
            Self::Domains => write!(f, "domains"),
            Self::Methods => write!(f, "methods"),
            Self::Repos => write!(f, "repos"),
        }
    }
}

/// Which input field matched a forbidden pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForbiddenField {
    /// Path glob match.
    Path,
    /// Command substring match.
    Command,
    /// URL glob match.
    Url,
}

/// Why an action was denied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DenialReason {
    /// No capability grants the tool.
    NoCapability {
        /// The requested tool.
        tool: String,
    },
    /// Input matched a forbidden pattern.
    ForbiddenMatch {
        /// Field the pattern matched against.
        field: ForbiddenField,
        /// Offending input value.
        value: String,
        /// The forbidden pattern.
        pattern: String,
    },
    /// Input fell outside a capability scope allow-list.
    ScopeViolation {
        /// The violated allow-list.
        field: ScopeField,
        /// Offending input value.
        value: String,
        /// The configured allow-list.
        allowed: Vec<String>,
    },
    /// URL could not be parsed for a domain check.
    InvalidUrl {
        /// The unparseable value.
        value: String,
    },
    /// Adapter input failed schema parsing.
    InvalidInput {
        /// Parse failure description.
        message: String,
    },
    /// A budget ceiling was breached.
    Budget(BudgetBreach),
    /// Session is not in the active state.
    SessionState {
        /// Observed state.
        state: SessionState,
    },
    /// Session action limit reached.
    ActionLimit {
        /// Configured maximum.
        max: u64,
    },
    /// Session denial limit reached.
    DenialLimit {
        /// Configured maximum.
        max: u64,
    },
    /// Sliding-window rate limit exceeded.
    RateLimit {
        /// Configured actions per minute.
        max_per_minute: u64,
    },
}

impl DenialReason {
    /// Whether the evolution subsystem may suggest a policy change for this
    /// reason. Hard limits (budget, rate, session state) are never
    /// suggestible.
    #[must_use]
    pub fn suggestible(&self) -> bool {
        matches!(
            self,
            Self::NoCapability { .. } | Self::ForbiddenMatch { .. } | Self::ScopeViolation { .. }
        )
    }
}

impl std::fmt::Display for DenialReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoCapability { tool } => {
                write!(f, "No capability defined for tool \"{tool}\"")
            }
            Self::ForbiddenMatch {
                field,
                value,
                pattern,
            } => {
                let label = match field {
                    ForbiddenField::Path => "Path",
                    ForbiddenField::Command => "Command",
                    ForbiddenField::Url => "URL",
                };
                write!(f, "{label} \"{value}\" matches forbidden pattern \"{pattern}\"")
            }
            Self::ScopeViolation {
                field,
                value,
                allowed,
            } => {
                let joined = allowed.join(", ");
                match field {
                    ScopeField::Paths => {
                        write!(f, "Path \"{value}\" is outside allowed scope: {joined}")
                    }
                    ScopeField::Binaries => {
                        write!(f, "Binary \"{value}\" is not in allowed list: {joined}")
                    }
                    ScopeField::Domains => {
                        write!(f, "Domain \"{value}\" is not in allowed list: {joined}")
                    }
                    ScopeField::Methods => {
                        write!(f, "HTTP method \"{value}\" is not in allowed list: {joined}")
                    }
                    ScopeField::Repos => {
                        write!(f, "Repository \"{value}\" is outside allowed scope: {joined}")
                    }
                }
            }
            Self::InvalidUrl { value } => write!(f, "Invalid URL \"{value}\""),
            Self::InvalidInput { message } => write!(f, "Invalid input: {message}"),
            Self::Budget(breach) => write!(f, "{breach}"),
            Self::SessionState { state } => {
                write!(f, "Session is not active (state: {state})")
            }
            Self::ActionLimit { max } => write!(f, "Session action limit reached ({max})"),
            Self::DenialLimit { max } => write!(f, "Session denial limit reached ({max})"),
            Self::RateLimit { max_per_minute } => {
                write!(f, "Rate limit exceeded: {max_per_minute} actions per minute")
            }
        }
    }
}
