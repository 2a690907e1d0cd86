//! Bounded retry for connection-class failures.

use anvil_common::{AnvilError, Node};
use rand::Rng;
use std::time::Duration;

use super::{CommandOutput, RemoteCommand, RemoteExecutor};

/// Exponential backoff with jitter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based): base * 2^(retry-1), capped, plus up to 25% jitter
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(retry.saturating_sub(1)))
            .min(self.max_delay);
        let jitter_ms = (exp.as_millis() as u64) / 4;
        if jitter_ms == 0 {
            return exp;
        }
        exp + Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
    }
}

/// Run a command, retrying only connection-class failures.
///
/// Command failures are returned immediately: re-running an installer on a
/// partially configured node is not known to be safe.
pub async fn run_with_retry(
    executor: &dyn RemoteExecutor,
    node: &Node,
    command: &RemoteCommand,
    timeout: Duration,
    policy: &RetryPolicy,
) -> Result<CommandOutput, AnvilError> {
    let mut attempt = 1;
    loop {
        match executor.run(node, command, timeout).await {
            Ok(output) => return Ok(output),
            Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                let delay = policy.delay_for(attempt);
                tracing::warn!(
                    node = %node.id,
                    command = command.label(),
                    attempt = attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Connection failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
