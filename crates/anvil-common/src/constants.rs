//! Shared constants for Anvil components.

/// Default configuration file path
pub const DEFAULT_CONFIG_PATH: &str = "config/anvil.toml";

/// Default Terraform binary
pub const DEFAULT_TERRAFORM_BIN: &str = "terraform";

/// Default Terraform working directory
pub const DEFAULT_TERRAFORM_DIR: &str = "infra";

/// Terraform variable receiving the node public key
pub const DEFAULT_PUBLIC_KEY_VAR: &str = "public_key";

/// Suffix appended to a node id to derive its output key (`master_public_ip`)
pub const OUTPUT_KEY_SUFFIX: &str = "_public_ip";

/// Default SSH login user on provisioned nodes
pub const DEFAULT_SSH_USER: &str = "ubuntu";

/// Default SSH port
pub const DEFAULT_SSH_PORT: u16 = 22;

/// SSH connect timeout (seconds)
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Connectivity probe timeout (seconds)
pub const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 30;

/// Installer command timeout (seconds, 10 minutes)
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 600;

/// Attempts for connection-class failures (including the first one)
pub const DEFAULT_CONNECT_ATTEMPTS: u32 = 3;

/// Base backoff between connection retries (milliseconds)
pub const DEFAULT_RETRY_BASE_MS: u64 = 2_000;

/// Backoff ceiling (milliseconds)
pub const DEFAULT_RETRY_MAX_MS: u64 = 30_000;

/// Concurrent worker joins
pub const DEFAULT_WORKER_CONCURRENCY: usize = 4;

/// Coordinator API port that workers join on
pub const DEFAULT_API_PORT: u16 = 6443;

/// OpenSSH reserves exit status 255 for its own (transport) errors
pub const SSH_TRANSPORT_EXIT_CODE: i32 = 255;

/// A remote script's own exit 255 is reported as this status instead
pub const SCRIPT_EXIT_255_REMAPPED: i32 = 254;

/// Local directory for run artifacts (materialized key, cluster record)
pub const DEFAULT_STATE_DIR: &str = ".anvil";

/// Cluster record file name inside the state directory
pub const CLUSTER_RECORD_FILE: &str = "cluster.json";

/// Materialized SSH key file name inside the state directory
pub const SSH_KEY_FILE: &str = "id_node";

/// Cluster installer commands (k3s)
pub mod installer {
    /// Coordinator initialization
    pub const COORDINATOR_INIT: &str = "curl -sfL https://get.k3s.io | sh -";

    /// Privileged read of the join token
    pub const CREDENTIAL_READ: &str = "sudo cat /var/lib/rancher/k3s/server/node-token";

    /// Worker join. The token arrives on stdin; `{coordinator_url}` is substituted.
    pub const WORKER_JOIN: &str = "IFS= read -r K3S_TOKEN && export K3S_TOKEN && \
         curl -sfL https://get.k3s.io | K3S_URL='{coordinator_url}' sh -";

    /// Admin kubeconfig on the coordinator
    pub const KUBECONFIG_READ: &str = "sudo cat /etc/rancher/k3s/k3s.yaml";

    /// Server address written into the coordinator's own kubeconfig
    pub const KUBECONFIG_LOOPBACK: &str = "https://127.0.0.1:";

    /// No-op connectivity probe
    pub const PROBE: &str = "true";
}

/// Environment variables carrying secrets
pub mod env {
    pub const AWS_ACCESS_KEY_ID: &str = "AWS_ACCESS_KEY_ID";
    pub const AWS_SECRET_ACCESS_KEY: &str = "AWS_SECRET_ACCESS_KEY";
    pub const AWS_DEFAULT_REGION: &str = "AWS_DEFAULT_REGION";
    pub const SSH_PRIVATE_KEY: &str = "SSH_PRIVATE_KEY";
    pub const SSH_PUBLIC_KEY: &str = "SSH_PUBLIC_KEY";
    pub const TF_API_TOKEN: &str = "TF_API_TOKEN";

    /// Terraform Cloud credential variable understood by the CLI
    pub const TF_CLOUD_TOKEN: &str = "TF_TOKEN_app_terraform_io";
}
