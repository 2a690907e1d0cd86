//! Remote command execution.
//!
//! One command, one session: the executor opens a session per command and
//! releases it on every exit path. Failures are split into connection-class
//! (`Connection`, `Timeout`) and command-class (`Command`) so callers can
//! tell "could not reach node" from "reached node, command failed".

mod retry;
mod ssh;

pub use retry::{RetryPolicy, run_with_retry};
pub use ssh::{SshExecutor, resolve_identity};

use anvil_common::constants::installer;
use anvil_common::{AnvilError, Node, Secret};
use async_trait::async_trait;
use std::fmt;
use std::time::Duration;

/// A shell command for one node
#[derive(Clone)]
pub struct RemoteCommand {
    /// Human-readable name used in logs and errors
    label: String,
    /// Shell script run by the remote login shell
    script: String,
    /// Secret fed to the command's stdin
    stdin: Option<Secret>,
}

impl RemoteCommand {
    pub fn new(label: impl Into<String>, script: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            script: script.into(),
            stdin: None,
        }
    }

    /// Deliver `secret` on stdin instead of the command line
    pub fn with_stdin(mut self, secret: Secret) -> Self {
        self.stdin = Some(secret);
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn script(&self) -> &str {
        &self.script
    }

    pub fn stdin(&self) -> Option<&Secret> {
        self.stdin.as_ref()
    }
}

impl fmt::Debug for RemoteCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteCommand")
            .field("label", &self.label)
            .field("stdin", &self.stdin.is_some())
            .finish()
    }
}

/// Captured result of a successfully delivered command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// Runs one command on one node
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Run `command` on `node`, bounded by `timeout`.
    ///
    /// `Ok` only for exit status 0; non-zero is `AnvilError::Command`.
    async fn run(
        &self,
        node: &Node,
        command: &RemoteCommand,
        timeout: Duration,
    ) -> Result<CommandOutput, AnvilError>;
}

/// Connectivity probe: a no-op command proving the node accepts sessions
pub async fn probe(
    executor: &dyn RemoteExecutor,
    node: &Node,
    timeout: Duration,
    policy: &RetryPolicy,
) -> Result<(), AnvilError> {
    let command = RemoteCommand::new("probe", installer::PROBE);
    run_with_retry(executor, node, &command, timeout, policy).await?;
    tracing::debug!(node = %node.id, "Node reachable");
    Ok(())
}
