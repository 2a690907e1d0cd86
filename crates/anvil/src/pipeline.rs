//! Provision and bootstrap runs, wired from configuration.

use anyhow::{Context, Result};
use anvil_common::{ProvisioningOutput, Stage};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::bootstrap::{BootstrapReport, BootstrapSequencer, ClusterCommands, SequencerOptions};
use crate::config::{AppConfig, Secrets};
use crate::outputs::OutputStore;
use crate::provision::{self, TerraformEngine, parse_outputs};
use crate::remote::{SshExecutor, resolve_identity};
use crate::shutdown::Shutdown;
use crate::state::{ClusterRecord, RecordStore};

/// Bootstrap knobs that only come from the command line
#[derive(Debug, Clone, Default)]
pub struct BootstrapOptions {
    /// Read outputs from a saved `terraform output -json` file instead of the engine
    pub outputs_file: Option<PathBuf>,
    /// Write the JSON report here
    pub report_path: Option<PathBuf>,
    /// Bootstrap even if the coordinator was replaced under joined workers
    pub allow_replace: bool,
}

/// Provision the declared topology and return its outputs
pub async fn run_provision(
    config: &AppConfig,
    secrets: &Secrets,
    outputs_file: Option<&Path>,
) -> Result<ProvisioningOutput> {
    let topology = config.topology()?;
    let engine = TerraformEngine::new(&config.provisioner, secrets);

    let outputs = provision::provision(&engine, &topology)
        .await
        .inspect_err(|e| tracing::error!(stage = %Stage::Provision, error = %e, "Provisioning failed"))?;

    if let Some(path) = outputs_file {
        write_outputs_file(path, &outputs)?;
        tracing::info!(path = %path.display(), "Outputs saved");
    }
    Ok(outputs)
}

/// Outputs for a bootstrap-only run: a saved file, or the engine's current outputs
pub async fn load_outputs(
    config: &AppConfig,
    secrets: &Secrets,
    outputs_file: Option<&Path>,
) -> Result<ProvisioningOutput> {
    match outputs_file {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read outputs file {}", path.display()))?;
            Ok(parse_outputs(&raw)?)
        }
        None => {
            let topology = config.topology()?;
            let engine = TerraformEngine::new(&config.provisioner, secrets);
            Ok(provision::read_outputs(&engine, &topology).await?)
        }
    }
}

/// Bootstrap the cluster on already-provisioned nodes.
///
/// Errors are reserved for problems before any remote command runs; the
/// remote outcome, good or bad, is in the returned report.
pub async fn run_bootstrap(
    config: &AppConfig,
    secrets: &Secrets,
    outputs: ProvisioningOutput,
    shutdown: Shutdown,
    options: &BootstrapOptions,
) -> Result<BootstrapReport> {
    let topology = config.topology()?;
    let bound = OutputStore::new(outputs, &topology)
        .bind()
        .inspect_err(|e| tracing::error!(stage = %Stage::Resolve, error = %e, "Address resolution failed"))?;

    let state_dir = config.state_dir();
    let records = RecordStore::new(&state_dir);
    let previous = records.load()?;
    if let Some(ref record) = previous {
        match record.check_compatible(&bound) {
            Ok(()) => {}
            Err(e) if options.allow_replace => {
                tracing::warn!(error = %e, "Coordinator replaced, continuing as requested");
            }
            Err(e) => return Err(e.into()),
        }
    }

    let identity = resolve_identity(&config.ssh, secrets, &state_dir)?;
    let executor = Arc::new(SshExecutor::new(&config.ssh, identity));
    let sequencer = BootstrapSequencer::new(
        executor,
        ClusterCommands::from_config(&config.cluster),
        sequencer_options(config),
        shutdown,
    );

    let report = sequencer.run(&bound).await;
    report.log();

    if let Some(record) = ClusterRecord::from_report(&report) {
        records.save(&record.merge(previous.as_ref()))?;
    }
    if let Some(ref path) = options.report_path {
        write_report(path, &report)?;
        tracing::info!(path = %path.display(), "Report written");
    }

    Ok(report)
}

fn sequencer_options(config: &AppConfig) -> SequencerOptions {
    SequencerOptions {
        probe_timeout: config.ssh.probe_timeout(),
        command_timeout: config.ssh.command_timeout(),
        retry: config.ssh.retry_policy(),
        worker_concurrency: config.cluster.worker_concurrency,
        kubeconfig_path: config.cluster.kubeconfig_path.as_ref().map(PathBuf::from),
    }
}

/// Save outputs in `terraform output -json` shape so `bootstrap --outputs-file` can read them
fn write_outputs_file(path: &Path, outputs: &ProvisioningOutput) -> Result<()> {
    let json: serde_json::Map<String, serde_json::Value> = outputs
        .iter()
        .map(|(key, value)| (key.to_string(), serde_json::json!({ "value": value })))
        .collect();
    let body = serde_json::to_string_pretty(&json)?;
    std::fs::write(path, body)
        .with_context(|| format!("Failed to write outputs file {}", path.display()))
}

fn write_report(path: &Path, report: &BootstrapReport) -> Result<()> {
    let body = serde_json::to_string_pretty(report)?;
    std::fs::write(path, body).with_context(|| format!("Failed to write report {}", path.display()))
}
