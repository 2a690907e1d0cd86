//! Cluster bootstrap.
//!
//! Forms the cluster over remote shell commands in a fixed order:
//! probe every node, initialize the coordinator, read its join credential,
//! then join the workers with it.

mod kubeconfig;
mod report;
mod sequencer;

pub use report::{BootstrapReport, Failure, KubeconfigOutcome, NodeOutcome, OutcomeStatus};
pub use sequencer::{BootstrapSequencer, SequencerOptions};

use anvil_common::{Address, JoinCredential, Secret};

use crate::config::ClusterConfig;
use crate::remote::RemoteCommand;

/// Command labels, as they appear in logs and errors
pub mod labels {
    pub const COORDINATOR_INIT: &str = "coordinator init";
    pub const CREDENTIAL_READ: &str = "credential read";
    pub const WORKER_JOIN: &str = "worker join";
    pub const KUBECONFIG_READ: &str = "kubeconfig read";
}

/// Installer invocations for the cluster distribution
#[derive(Debug, Clone)]
pub struct ClusterCommands {
    init: String,
    credential: String,
    join_template: String,
    kubeconfig: String,
    api_port: u16,
}

impl ClusterCommands {
    pub fn from_config(config: &ClusterConfig) -> Self {
        Self {
            init: config.init_command.clone(),
            credential: config.credential_command.clone(),
            join_template: config.join_command.clone(),
            kubeconfig: config.kubeconfig_command.clone(),
            api_port: config.api_port,
        }
    }

    pub fn coordinator_init(&self) -> RemoteCommand {
        RemoteCommand::new(labels::COORDINATOR_INIT, self.init.clone())
    }

    pub fn credential_read(&self) -> RemoteCommand {
        RemoteCommand::new(labels::CREDENTIAL_READ, self.credential.clone())
    }

    /// Join command for a worker; the credential travels on stdin only
    pub fn worker_join(&self, coordinator: &Address, credential: &JoinCredential) -> RemoteCommand {
        let script = self
            .join_template
            .replace("{coordinator_url}", &coordinator.https_url(self.api_port));
        RemoteCommand::new(labels::WORKER_JOIN, script)
            .with_stdin(Secret::new(credential.expose()))
    }

    pub fn kubeconfig_read(&self) -> RemoteCommand {
        RemoteCommand::new(labels::KUBECONFIG_READ, self.kubeconfig.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_command_keeps_token_off_the_command_line() {
        let commands = ClusterCommands::from_config(&ClusterConfig::default());
        let credential = JoinCredential::from_output("K10tok::server:abc").unwrap();
        let join = commands.worker_join(&Address::parse("10.0.0.1").unwrap(), &credential);

        assert!(join.script().contains("K3S_URL='https://10.0.0.1:6443'"));
        assert!(!join.script().contains("K10tok"));
        assert_eq!(join.stdin().unwrap().expose(), "K10tok::server:abc");
        assert!(!format!("{:?}", join).contains("K10tok"));
    }
}
