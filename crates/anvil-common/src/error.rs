//! Common error types for Anvil components.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::types::NodeRole;

/// Orchestration stage a failure belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Provision,
    Resolve,
    Probe,
    CoordinatorInit,
    CredentialFetch,
    WorkerJoin,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Provision => "provision",
            Self::Resolve => "resolve",
            Self::Probe => "probe",
            Self::CoordinatorInit => "coordinator_init",
            Self::CredentialFetch => "credential_fetch",
            Self::WorkerJoin => "worker_join",
        };
        f.write_str(name)
    }
}

/// Errors across Anvil components
#[derive(Debug, Error)]
pub enum AnvilError {
    /// Provisioning engine failed; diagnostic is the engine's own output
    #[error("Provisioning failed during `{step}` (status {status:?}): {diagnostic}")]
    Provisioning {
        step: String,
        status: Option<i32>,
        diagnostic: String,
    },

    /// Declared topology references an address the outputs do not carry
    #[error("No address for {role} #{index}: {reason}")]
    NotFound {
        role: NodeRole,
        index: usize,
        reason: String,
    },

    /// Node could not be reached (unreachable, auth rejected, host key mismatch)
    #[error("Connection to {node} failed: {reason}")]
    Connection { node: String, reason: String },

    /// Command was delivered but exited non-zero
    #[error("Command `{label}` on {node} exited with {exit_code}: {stderr}")]
    Command {
        node: String,
        label: String,
        exit_code: i32,
        stderr: String,
    },

    /// Remote wait exceeded its deadline
    #[error("Command `{label}` on {node} timed out after {secs}s")]
    Timeout {
        node: String,
        label: String,
        secs: u64,
    },

    /// Run was interrupted
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Declared topology is invalid
    #[error("Invalid topology: {0}")]
    Topology(String),

    /// Provisioned topology no longer matches the bootstrapped cluster
    #[error("Topology mismatch: {0}")]
    TopologyMismatch(String),

    /// Local I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AnvilError {
    /// Returns true for connection-class failures, the only ones retried in place
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout { .. })
    }

    /// Returns true if simply re-running the bootstrap step is expected to be safe.
    ///
    /// Re-running installer commands against an initialized node is assumed to be
    /// a no-op handled by the installer itself; this is not verified here.
    pub fn is_retryable_by_rerun(&self) -> bool {
        match self {
            Self::Connection { .. }
            | Self::Timeout { .. }
            | Self::Command { .. }
            | Self::Cancelled(_)
            | Self::Io(_) => true,
            Self::Provisioning { .. }
            | Self::NotFound { .. }
            | Self::Config(_)
            | Self::Topology(_)
            | Self::TopologyMismatch(_) => false,
        }
    }

    /// Short category name for logs and reports
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Provisioning { .. } => "provisioning",
            Self::NotFound { .. } => "not_found",
            Self::Connection { .. } => "connection",
            Self::Command { .. } => "command",
            Self::Timeout { .. } => "timeout",
            Self::Cancelled(_) => "cancelled",
            Self::Config(_) => "config",
            Self::Topology(_) => "topology",
            Self::TopologyMismatch(_) => "topology_mismatch",
            Self::Io(_) => "io",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_connection_class_is_retryable() {
        let conn = AnvilError::Connection {
            node: "w1".into(),
            reason: "no route to host".into(),
        };
        let timeout = AnvilError::Timeout {
            node: "w1".into(),
            label: "probe".into(),
            secs: 5,
        };
        let cmd = AnvilError::Command {
            node: "w1".into(),
            label: "worker join".into(),
            exit_code: 1,
            stderr: String::new(),
        };

        assert!(conn.is_retryable());
        assert!(timeout.is_retryable());
        assert!(!cmd.is_retryable());
        assert!(cmd.is_retryable_by_rerun());
        assert!(!AnvilError::Cancelled("ctrl-c".into()).is_retryable());
    }

    #[test]
    fn test_stage_display_matches_serde() {
        let json = serde_json::to_string(&Stage::CredentialFetch).unwrap();
        assert_eq!(json, format!("\"{}\"", Stage::CredentialFetch));
    }
}
