//! Core types shared across Anvil components.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::fmt;

use crate::constants::OUTPUT_KEY_SUFFIX;
use crate::error::AnvilError;

/// Role a node plays in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Cluster-formation node every worker joins (control plane)
    Coordinator,
    /// Joins an existing coordinator to add capacity
    Worker,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Coordinator => f.write_str("coordinator"),
            Self::Worker => f.write_str("worker"),
        }
    }
}

/// A node as declared before provisioning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSpec {
    /// Stable node name (e.g. "master", "worker1")
    pub id: String,

    pub role: NodeRole,

    /// Provisioning output carrying this node's address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

impl NodeSpec {
    pub fn new(id: impl Into<String>, role: NodeRole) -> Self {
        Self {
            id: id.into(),
            role,
            output: None,
        }
    }

    pub fn with_output(mut self, key: impl Into<String>) -> Self {
        self.output = Some(key.into());
        self
    }

    /// Output key for this node, `<id>_public_ip` unless set explicitly
    pub fn output_key(&self) -> String {
        self.output
            .clone()
            .unwrap_or_else(|| format!("{}{}", self.id, OUTPUT_KEY_SUFFIX))
    }
}

/// Network endpoint of a provisioned node (IP or hostname, no port)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(String);

impl Address {
    /// Parse an address, rejecting blank values, embedded whitespace and a
    /// leading `-` (it would reach the ssh command line as an option)
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty()
            || trimmed.starts_with('-')
            || trimmed.chars().any(char::is_whitespace)
        {
            return None;
        }
        Some(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Host as it appears in a URL, bracketing IPv6 literals
    pub fn url_host(&self) -> String {
        if self.0.contains(':') && !self.0.starts_with('[') {
            format!("[{}]", self.0)
        } else {
            self.0.clone()
        }
    }

    /// `https://host:port`
    pub fn https_url(&self, port: u16) -> String {
        format!("https://{}:{}", self.url_host(), port)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A node with its address bound after provisioning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub role: NodeRole,
    pub address: Address,
}

/// Declared set of nodes for one run.
///
/// Exactly one coordinator, any number of workers, unique ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    coordinator: NodeSpec,
    workers: Vec<NodeSpec>,
}

impl Topology {
    pub fn new(nodes: Vec<NodeSpec>) -> Result<Self, AnvilError> {
        let mut seen = HashSet::new();
        for node in &nodes {
            if node.id.trim().is_empty() {
                return Err(AnvilError::Topology("node with empty id".into()));
            }
            if !seen.insert(node.id.as_str()) {
                return Err(AnvilError::Topology(format!("duplicate node id `{}`", node.id)));
            }
        }

        let (coordinators, workers): (Vec<_>, Vec<_>) = nodes
            .into_iter()
            .partition(|n| n.role == NodeRole::Coordinator);

        let mut coordinators = coordinators.into_iter();
        let coordinator = match (coordinators.next(), coordinators.next()) {
            (Some(c), None) => c,
            (None, _) => {
                return Err(AnvilError::Topology("no coordinator declared".into()));
            }
            (Some(_), Some(_)) => {
                return Err(AnvilError::Topology("more than one coordinator declared".into()));
            }
        };

        Ok(Self {
            coordinator,
            workers,
        })
    }

    pub fn coordinator(&self) -> &NodeSpec {
        &self.coordinator
    }

    pub fn workers(&self) -> &[NodeSpec] {
        &self.workers
    }

    /// Look up a declared node by role and index (the coordinator only has index 0)
    pub fn get(&self, role: NodeRole, index: usize) -> Option<&NodeSpec> {
        match role {
            NodeRole::Coordinator if index == 0 => Some(&self.coordinator),
            NodeRole::Coordinator => None,
            NodeRole::Worker => self.workers.get(index),
        }
    }

    /// All declared nodes, coordinator first
    pub fn nodes(&self) -> impl Iterator<Item = &NodeSpec> {
        std::iter::once(&self.coordinator).chain(self.workers.iter())
    }

    pub fn len(&self) -> usize {
        1 + self.workers.len()
    }

    /// Always false; a topology has at least its coordinator
    pub fn is_empty(&self) -> bool {
        false
    }
}

/// Topology with every address resolved; built only when all nodes resolve
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundTopology {
    pub coordinator: Node,
    pub workers: Vec<Node>,
}

impl BoundTopology {
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        std::iter::once(&self.coordinator).chain(self.workers.iter())
    }
}

/// Named outputs of one successful provisioning invocation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProvisioningOutput(BTreeMap<String, String>);

impl ProvisioningOutput {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, String)> for ProvisioningOutput {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Externally supplied secret (cloud credential, engine token, key material)
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}

/// Token a worker presents to join the coordinator.
///
/// Held in memory for one run; never persisted, never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct JoinCredential(String);

impl JoinCredential {
    /// Build from raw command output; `None` when the token is blank
    pub fn from_output(raw: &str) -> Option<Self> {
        let token = raw.trim();
        if token.is_empty() {
            None
        } else {
            Some(Self(token.to_string()))
        }
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    /// First 12 hex chars of SHA-256, safe to log
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.0.as_bytes());
        digest.iter().take(6).map(|b| format!("{:02x}", b)).collect()
    }
}

impl fmt::Debug for JoinCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JoinCredential(sha256:{})", self.fingerprint())
    }
}

/// Bootstrap sequencer states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BootstrapState {
    Idle,
    CoordinatorInitializing,
    CoordinatorReady,
    CredentialFetched,
    WorkersInitializing,
    /// Every worker joined
    Complete,
    /// Coordinator healthy, at least one worker failed
    PartiallyComplete,
    /// Coordinator path failed; no worker was joined
    Failed,
}

impl BootstrapState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::PartiallyComplete | Self::Failed)
    }

    /// Legal edges of the sequencer state machine
    pub fn can_advance_to(&self, next: BootstrapState) -> bool {
        use BootstrapState::*;
        match (*self, next) {
            (Idle, CoordinatorInitializing)
            | (CoordinatorInitializing, CoordinatorReady)
            | (CoordinatorReady, CredentialFetched)
            | (CredentialFetched, WorkersInitializing)
            | (WorkersInitializing, Complete)
            | (WorkersInitializing, PartiallyComplete) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl Default for BootstrapState {
    fn default() -> Self {
        Self::Idle
    }
}
