//! Configuration management for Anvil.

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anvil_common::constants::{self, env, installer};
use anvil_common::{AnvilError, NodeRole, NodeSpec, Secret, Topology};

use crate::remote::RetryPolicy;

/// Application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Local directory for run artifacts
    #[serde(default = "default_state_dir")]
    pub state_dir: String,

    /// Provisioning engine configuration
    #[serde(default)]
    pub provisioner: ProvisionerConfig,

    /// Remote transport configuration
    #[serde(default)]
    pub ssh: SshConfig,

    /// Cluster bootstrap configuration
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Declared topology, coordinator plus workers
    #[serde(default = "default_nodes")]
    pub nodes: Vec<NodeSpec>,
}

/// Terraform invocation settings
#[derive(Debug, Clone, Deserialize)]
pub struct ProvisionerConfig {
    /// Terraform binary
    #[serde(default = "default_terraform_bin")]
    pub terraform_bin: String,

    /// Directory holding the infrastructure definition
    #[serde(default = "default_terraform_dir")]
    pub working_dir: String,

    /// Terraform variable that receives the node public key
    #[serde(default = "default_public_key_var")]
    pub public_key_var: String,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            terraform_bin: default_terraform_bin(),
            working_dir: default_terraform_dir(),
            public_key_var: default_public_key_var(),
        }
    }
}

/// Host key verification policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HostKeyPolicy {
    /// Reject unknown or changed host keys
    Strict,
    /// Record unknown keys on first contact, reject changed ones
    AcceptNew,
    /// Accept any host key; ephemeral/test topologies only
    Permissive,
}

impl Default for HostKeyPolicy {
    fn default() -> Self {
        Self::AcceptNew
    }
}

/// SSH transport settings
#[derive(Debug, Clone, Deserialize)]
pub struct SshConfig {
    #[serde(default = "default_ssh_user")]
    pub user: String,

    #[serde(default = "default_ssh_port")]
    pub port: u16,

    /// Private key file; falls back to the SSH_PRIVATE_KEY secret
    #[serde(default)]
    pub private_key_path: Option<String>,

    #[serde(default)]
    pub host_key_policy: HostKeyPolicy,

    /// Known hosts file used with the strict policy
    #[serde(default)]
    pub known_hosts_file: Option<String>,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,

    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    /// Attempts for connection-class failures, including the first
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,

    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,

    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            user: default_ssh_user(),
            port: default_ssh_port(),
            private_key_path: None,
            host_key_policy: HostKeyPolicy::default(),
            known_hosts_file: None,
            connect_timeout_secs: default_connect_timeout(),
            probe_timeout_secs: default_probe_timeout(),
            command_timeout_secs: default_command_timeout(),
            connect_attempts: default_connect_attempts(),
            retry_base_ms: default_retry_base_ms(),
            retry_max_ms: default_retry_max_ms(),
        }
    }
}

impl SshConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.connect_attempts,
            base_delay: Duration::from_millis(self.retry_base_ms),
            max_delay: Duration::from_millis(self.retry_max_ms),
        }
    }
}

/// Cluster installer settings
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    /// Port workers use to reach the coordinator API
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Concurrent worker joins (1 = sequential)
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,

    #[serde(default = "default_init_command")]
    pub init_command: String,

    #[serde(default = "default_credential_command")]
    pub credential_command: String,

    /// Join command; `{coordinator_url}` is substituted, the token arrives on stdin
    #[serde(default = "default_join_command")]
    pub join_command: String,

    #[serde(default = "default_kubeconfig_command")]
    pub kubeconfig_command: String,

    /// Write the cluster kubeconfig here after bootstrap (disabled when unset)
    #[serde(default)]
    pub kubeconfig_path: Option<String>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            api_port: default_api_port(),
            worker_concurrency: default_worker_concurrency(),
            init_command: default_init_command(),
            credential_command: default_credential_command(),
            join_command: default_join_command(),
            kubeconfig_command: default_kubeconfig_command(),
            kubeconfig_path: None,
        }
    }
}

// Default value functions
fn default_state_dir() -> String { constants::DEFAULT_STATE_DIR.to_string() }
fn default_terraform_bin() -> String { constants::DEFAULT_TERRAFORM_BIN.to_string() }
fn default_terraform_dir() -> String { constants::DEFAULT_TERRAFORM_DIR.to_string() }
fn default_public_key_var() -> String { constants::DEFAULT_PUBLIC_KEY_VAR.to_string() }
fn default_ssh_user() -> String { constants::DEFAULT_SSH_USER.to_string() }
fn default_ssh_port() -> u16 { constants::DEFAULT_SSH_PORT }
fn default_connect_timeout() -> u64 { constants::DEFAULT_CONNECT_TIMEOUT_SECS }
fn default_probe_timeout() -> u64 { constants::DEFAULT_PROBE_TIMEOUT_SECS }
fn default_command_timeout() -> u64 { constants::DEFAULT_COMMAND_TIMEOUT_SECS }
fn default_connect_attempts() -> u32 { constants::DEFAULT_CONNECT_ATTEMPTS }
fn default_retry_base_ms() -> u64 { constants::DEFAULT_RETRY_BASE_MS }
fn default_retry_max_ms() -> u64 { constants::DEFAULT_RETRY_MAX_MS }
fn default_api_port() -> u16 { constants::DEFAULT_API_PORT }
fn default_worker_concurrency() -> usize { constants::DEFAULT_WORKER_CONCURRENCY }
fn default_init_command() -> String { installer::COORDINATOR_INIT.to_string() }
fn default_credential_command() -> String { installer::CREDENTIAL_READ.to_string() }
fn default_join_command() -> String { installer::WORKER_JOIN.to_string() }
fn default_kubeconfig_command() -> String { installer::KUBECONFIG_READ.to_string() }

fn default_nodes() -> Vec<NodeSpec> {
    vec![
        NodeSpec::new("master", NodeRole::Coordinator),
        NodeSpec::new("worker1", NodeRole::Worker),
        NodeSpec::new("worker2", NodeRole::Worker),
    ]
}

impl AppConfig {
    /// Load configuration from file and `ANVIL__*` environment, with CLI overrides
    pub fn load(config_path: &str, args: &super::Args) -> Result<Self> {
        let mut builder = config::Config::builder();
        if Path::new(config_path).exists() {
            builder = builder.add_source(config::File::with_name(config_path));
        } else {
            tracing::warn!(path = config_path, "Config file not found, using defaults");
        }

        let settings = builder
            .add_source(config::Environment::with_prefix("ANVIL").separator("__"))
            .build()
            .context("Failed to load config")?;

        let mut config: Self = settings
            .try_deserialize()
            .context("Failed to parse config")?;

        // Apply CLI overrides
        if let Some(ref dir) = args.terraform_dir {
            config.provisioner.working_dir = dir.clone();
        }
        if let Some(ref key) = args.ssh_key {
            config.ssh.private_key_path = Some(key.clone());
        }
        if let Some(concurrency) = args.worker_concurrency {
            config.cluster.worker_concurrency = concurrency;
        }
        if args.insecure_host_keys {
            config.ssh.host_key_policy = HostKeyPolicy::Permissive;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the orchestrator cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.cluster.worker_concurrency == 0 {
            bail!("cluster.worker_concurrency must be at least 1");
        }
        if self.ssh.connect_attempts == 0 {
            bail!("ssh.connect_attempts must be at least 1");
        }
        if self.ssh.probe_timeout_secs == 0 || self.ssh.command_timeout_secs == 0 {
            bail!("ssh timeouts must be non-zero");
        }
        if !self.cluster.join_command.contains("{coordinator_url}") {
            bail!("cluster.join_command must reference {{coordinator_url}}");
        }
        self.topology()?;
        Ok(())
    }

    /// Declared topology
    pub fn topology(&self) -> Result<Topology, AnvilError> {
        Topology::new(self.nodes.clone())
    }

    pub fn state_dir(&self) -> PathBuf {
        PathBuf::from(&self.state_dir)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            provisioner: ProvisionerConfig::default(),
            ssh: SshConfig::default(),
            cluster: ClusterConfig::default(),
            nodes: default_nodes(),
        }
    }
}

/// Secrets supplied by the environment (CI secrets or a local `.env`)
#[derive(Debug, Clone, Default)]
pub struct Secrets {
    pub aws_access_key_id: Option<Secret>,
    pub aws_secret_access_key: Option<Secret>,
    pub aws_region: Option<String>,
    pub ssh_private_key: Option<Secret>,
    pub ssh_public_key: Option<Secret>,
    pub terraform_token: Option<Secret>,
}

impl Secrets {
    /// Read secrets from the process environment
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read secrets through a lookup function; blank values count as absent
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Self {
            aws_access_key_id: get(env::AWS_ACCESS_KEY_ID).map(Secret::new),
            aws_secret_access_key: get(env::AWS_SECRET_ACCESS_KEY).map(Secret::new),
            aws_region: get(env::AWS_DEFAULT_REGION),
            ssh_private_key: get(env::SSH_PRIVATE_KEY).map(Secret::new),
            ssh_public_key: get(env::SSH_PUBLIC_KEY).map(Secret::new),
            terraform_token: get(env::TF_API_TOKEN).map(Secret::new),
        }
    }
}
