//! Per-node outcome of a bootstrap run.

use anvil_common::{Address, AnvilError, BootstrapState, BoundTopology, Node, NodeRole, Stage};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Result for one node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeStatus {
    /// Not reached yet
    Pending,
    Ok,
    Failed,
    /// Never attempted because the coordinator path failed
    Skipped,
}

/// Why a node failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Failure {
    pub stage: Stage,
    pub kind: String,
    pub message: String,
    /// Re-running the bootstrap step is expected to be safe
    pub retryable_by_rerun: bool,
}

impl Failure {
    pub fn from_error(stage: Stage, error: &AnvilError) -> Self {
        Self {
            stage,
            kind: error.kind().to_string(),
            message: error.to_string(),
            retryable_by_rerun: error.is_retryable_by_rerun(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeOutcome {
    pub node: String,
    pub role: NodeRole,
    pub address: Address,
    pub status: OutcomeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<Failure>,
}

impl NodeOutcome {
    fn pending(node: &Node) -> Self {
        Self {
            node: node.id.clone(),
            role: node.role,
            address: node.address.clone(),
            status: OutcomeStatus::Pending,
            failure: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == OutcomeStatus::Ok
    }

    pub fn is_failed(&self) -> bool {
        self.status == OutcomeStatus::Failed
    }

    pub(crate) fn succeed(&mut self) {
        self.status = OutcomeStatus::Ok;
        self.failure = None;
    }

    pub(crate) fn fail(&mut self, failure: Failure) {
        self.status = OutcomeStatus::Failed;
        self.failure = Some(failure);
    }
}

/// Local kubeconfig export result
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KubeconfigOutcome {
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Aggregate outcome of one bootstrap run
#[derive(Debug, Clone, Serialize)]
pub struct BootstrapReport {
    pub final_state: BootstrapState,
    /// Every state entered, in order, starting at `Idle`
    pub transitions: Vec<BootstrapState>,
    pub coordinator: NodeOutcome,
    pub workers: Vec<NodeOutcome>,
    /// SHA-256 prefix of the join credential used for this run
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential_fingerprint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kubeconfig: Option<KubeconfigOutcome>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl BootstrapReport {
    pub fn new(topology: &BoundTopology) -> Self {
        Self {
            final_state: BootstrapState::Idle,
            transitions: vec![BootstrapState::Idle],
            coordinator: NodeOutcome::pending(&topology.coordinator),
            workers: topology.workers.iter().map(NodeOutcome::pending).collect(),
            credential_fingerprint: None,
            kubeconfig: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Move the state machine forward; illegal edges are a sequencing bug
    pub(crate) fn advance(&mut self, next: BootstrapState) {
        debug_assert!(
            self.final_state.can_advance_to(next),
            "illegal transition {:?} -> {:?}",
            self.final_state,
            next
        );
        tracing::info!(from = ?self.final_state, to = ?next, "Bootstrap state changed");
        self.final_state = next;
        self.transitions.push(next);
    }

    /// Coordinator path failed: mark it, skip every undecided worker, enter `Failed`
    pub(crate) fn abort(&mut self, failure: Failure) {
        self.coordinator.fail(failure);
        for worker in &mut self.workers {
            if worker.status == OutcomeStatus::Pending {
                worker.status = OutcomeStatus::Skipped;
            }
        }
        self.advance(BootstrapState::Failed);
    }

    pub(crate) fn finish(mut self) -> Self {
        self.finished_at = Some(Utc::now());
        self
    }

    /// The state the run failed out of, if it failed
    pub fn failed_from(&self) -> Option<BootstrapState> {
        if self.final_state != BootstrapState::Failed {
            return None;
        }
        self.transitions.iter().rev().nth(1).copied()
    }

    /// All failed nodes, coordinator first
    pub fn failures(&self) -> Vec<&NodeOutcome> {
        std::iter::once(&self.coordinator)
            .chain(self.workers.iter())
            .filter(|n| n.is_failed())
            .collect()
    }

    pub fn is_success(&self) -> bool {
        self.final_state == BootstrapState::Complete
    }

    /// 0 complete, 2 partial membership, 1 failed
    pub fn exit_code(&self) -> u8 {
        match self.final_state {
            BootstrapState::Complete => 0,
            BootstrapState::PartiallyComplete => 2,
            _ => 1,
        }
    }

    /// `{coordinator: ok, w1: ok, w2: failed}`
    pub fn summary(&self) -> String {
        let mut parts = vec![format!("coordinator: {}", status_name(self.coordinator.status))];
        parts.extend(
            self.workers
                .iter()
                .map(|w| format!("{}: {}", w.node, status_name(w.status))),
        );
        format!("{{{}}}", parts.join(", "))
    }

    /// One log line per node
    pub fn log(&self) {
        for outcome in std::iter::once(&self.coordinator).chain(self.workers.iter()) {
            match (&outcome.status, &outcome.failure) {
                (OutcomeStatus::Failed, Some(failure)) => tracing::error!(
                    node = %outcome.node,
                    role = %outcome.role,
                    stage = %failure.stage,
                    kind = %failure.kind,
                    retryable_by_rerun = failure.retryable_by_rerun,
                    "{}",
                    failure.message
                ),
                (status, _) => tracing::info!(
                    node = %outcome.node,
                    role = %outcome.role,
                    status = status_name(*status),
                    "Node outcome"
                ),
            }
        }
        if let Some(ref kubeconfig) = self.kubeconfig {
            match kubeconfig.error {
                Some(ref error) => tracing::warn!(path = %kubeconfig.path, error = %error, "Kubeconfig not written"),
                None => tracing::info!(path = %kubeconfig.path, "Kubeconfig written"),
            }
        }
        tracing::info!(state = ?self.final_state, summary = %self.summary(), "Bootstrap finished");
    }
}

fn status_name(status: OutcomeStatus) -> &'static str {
    match status {
        OutcomeStatus::Pending => "pending",
        OutcomeStatus::Ok => "ok",
        OutcomeStatus::Failed => "failed",
        OutcomeStatus::Skipped => "skipped",
    }
}
