//! Local run state: the record of which coordinator the cluster was formed on.
//!
//! Only addresses and node ids are persisted, never the join credential.

use anvil_common::constants::CLUSTER_RECORD_FILE;
use anvil_common::{Address, AnvilError, BoundTopology};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::bootstrap::BootstrapReport;

/// Cluster record persistence errors
#[derive(Debug, Error)]
pub enum StateError {
    #[error("Failed to read cluster record {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write cluster record {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Corrupt cluster record {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// What the last bootstrap left behind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterRecord {
    pub coordinator_id: String,
    pub coordinator_address: Address,
    /// Workers that joined this coordinator at some point
    pub joined_workers: BTreeSet<String>,
    pub updated_at: DateTime<Utc>,
}

impl ClusterRecord {
    /// Record for a run whose coordinator came up; `None` otherwise
    pub fn from_report(report: &BootstrapReport) -> Option<Self> {
        if !report.coordinator.is_ok() {
            return None;
        }

        Some(Self {
            coordinator_id: report.coordinator.node.clone(),
            coordinator_address: report.coordinator.address.clone(),
            joined_workers: report
                .workers
                .iter()
                .filter(|w| w.is_ok())
                .map(|w| w.node.clone())
                .collect(),
            updated_at: Utc::now(),
        })
    }

    /// Refuse to bootstrap against a replaced coordinator that workers still point at
    pub fn check_compatible(&self, topology: &BoundTopology) -> Result<(), AnvilError> {
        let coordinator = &topology.coordinator;
        let replaced = coordinator.id != self.coordinator_id
            || coordinator.address != self.coordinator_address;

        if replaced && !self.joined_workers.is_empty() {
            return Err(AnvilError::TopologyMismatch(format!(
                "coordinator was {} at {} and workers [{}] joined it, now {} at {}; \
                 re-provision the workers or pass --allow-replace",
                self.coordinator_id,
                self.coordinator_address,
                self.joined_workers.iter().cloned().collect::<Vec<_>>().join(", "),
                coordinator.id,
                coordinator.address,
            )));
        }
        Ok(())
    }

    /// Fold a newer record in, keeping earlier joins for the same coordinator
    pub fn merge(self, previous: Option<&ClusterRecord>) -> Self {
        match previous {
            Some(prev)
                if prev.coordinator_id == self.coordinator_id
                    && prev.coordinator_address == self.coordinator_address =>
            {
                let mut merged = self;
                merged.joined_workers.extend(prev.joined_workers.iter().cloned());
                merged
            }
            _ => self,
        }
    }
}

/// JSON file holding the cluster record
pub struct RecordStore {
    path: PathBuf,
}

impl RecordStore {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            path: state_dir.join(CLUSTER_RECORD_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Option<ClusterRecord>, StateError> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StateError::Read {
                    path: self.path.clone(),
                    source,
                });
            }
        };

        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|source| StateError::Parse {
                path: self.path.clone(),
                source,
            })
    }

    pub fn save(&self, record: &ClusterRecord) -> Result<(), StateError> {
        let write_err = |source| StateError::Write {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(write_err)?;
        }
        let json = serde_json::to_string_pretty(record).map_err(|source| StateError::Parse {
            path: self.path.clone(),
            source,
        })?;
        std::fs::write(&self.path, json).map_err(write_err)?;

        tracing::debug!(path = %self.path.display(), "Cluster record saved");
        Ok(())
    }
}

/// Write a file readable by the owner only
#[cfg(unix)]
pub fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    // Mode only applies on creation
    file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
    file.write_all(contents)
}

/// Write a file readable by the owner only
#[cfg(not(unix))]
pub fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, contents)
}
