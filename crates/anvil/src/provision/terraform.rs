//! Terraform CLI engine.
//!
//! Each step is one `terraform -chdir=<dir> ...` invocation. Secrets reach the
//! process through its environment only.

use anvil_common::constants::env;
use anvil_common::{AnvilError, ProvisioningOutput, Secret};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::process::Stdio;
use tokio::process::Command;

use super::ProvisioningEngine;
use crate::config::{ProvisionerConfig, Secrets};

/// Terraform invoked as an external process
pub struct TerraformEngine {
    /// Terraform binary
    bin: String,
    /// Directory with the infrastructure definition
    working_dir: String,
    /// Environment passed to every invocation
    env: Vec<(String, Secret)>,
}

/// One entry of `terraform output -json`
#[derive(Debug, Deserialize)]
struct OutputEntry {
    value: serde_json::Value,
    #[serde(default)]
    sensitive: bool,
}

impl TerraformEngine {
    pub fn new(config: &ProvisionerConfig, secrets: &Secrets) -> Self {
        Self {
            bin: config.terraform_bin.clone(),
            working_dir: config.working_dir.clone(),
            env: engine_env(config, secrets),
        }
    }

    async fn run_step(&self, step: &str, args: &[&str]) -> Result<String, AnvilError> {
        tracing::info!(step = step, dir = %self.working_dir, "Running terraform");

        let mut cmd = Command::new(&self.bin);
        cmd.arg(format!("-chdir={}", self.working_dir))
            .args(args)
            .env("TF_IN_AUTOMATION", "1")
            .stdin(Stdio::null())
            .kill_on_drop(true);
        for (key, value) in &self.env {
            cmd.env(key, value.expose());
        }

        let output = cmd.output().await.map_err(|e| AnvilError::Provisioning {
            step: step.to_string(),
            status: None,
            diagnostic: format!("failed to launch `{}`: {}", self.bin, e),
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let diagnostic = if stderr.trim().is_empty() {
                stdout.trim().to_string()
            } else {
                stderr.trim().to_string()
            };
            tracing::error!(step = step, status = ?output.status.code(), "Terraform step failed");
            return Err(AnvilError::Provisioning {
                step: step.to_string(),
                status: output.status.code(),
                diagnostic,
            });
        }

        tracing::debug!(step = step, "Terraform step succeeded");
        Ok(stdout)
    }
}

#[async_trait]
impl ProvisioningEngine for TerraformEngine {
    fn name(&self) -> &str {
        "terraform"
    }

    async fn init(&self) -> Result<(), AnvilError> {
        self.run_step("init", &["init", "-input=false", "-no-color"])
            .await
            .map(|_| ())
    }

    async fn refresh(&self) -> Result<(), AnvilError> {
        self.run_step(
            "refresh",
            &["apply", "-refresh-only", "-auto-approve", "-input=false", "-no-color"],
        )
        .await
        .map(|_| ())
    }

    async fn apply(&self) -> Result<(), AnvilError> {
        self.run_step("apply", &["apply", "-auto-approve", "-input=false", "-no-color"])
            .await
            .map(|_| ())
    }

    async fn outputs(&self) -> Result<ProvisioningOutput, AnvilError> {
        let raw = self.run_step("output", &["output", "-json", "-no-color"]).await?;
        parse_outputs(&raw)
    }
}

/// Parse `terraform output -json`.
///
/// String values are taken as-is; any other value is kept as compact JSON.
pub fn parse_outputs(raw: &str) -> Result<ProvisioningOutput, AnvilError> {
    let entries: BTreeMap<String, OutputEntry> =
        serde_json::from_str(raw).map_err(|e| AnvilError::Provisioning {
            step: "output".to_string(),
            status: None,
            diagnostic: format!("unreadable output JSON: {}", e),
        })?;

    Ok(entries
        .into_iter()
        .map(|(key, entry)| {
            if entry.sensitive {
                tracing::debug!(output = %key, "Read sensitive output");
            }
            let value = match entry.value {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            };
            (key, value)
        })
        .collect())
}

/// Environment for the engine process built from the supplied secrets
fn engine_env(config: &ProvisionerConfig, secrets: &Secrets) -> Vec<(String, Secret)> {
    let mut vars = Vec::new();

    if let Some(ref key) = secrets.aws_access_key_id {
        vars.push((env::AWS_ACCESS_KEY_ID.to_string(), key.clone()));
    }
    if let Some(ref key) = secrets.aws_secret_access_key {
        vars.push((env::AWS_SECRET_ACCESS_KEY.to_string(), key.clone()));
    }
    if let Some(ref region) = secrets.aws_region {
        vars.push((env::AWS_DEFAULT_REGION.to_string(), Secret::new(region.clone())));
    }
    if let Some(ref key) = secrets.ssh_public_key {
        vars.push((format!("TF_VAR_{}", config.public_key_var), key.clone()));
    }
    if let Some(ref token) = secrets.terraform_token {
        vars.push((env::TF_CLOUD_TOKEN.to_string(), token.clone()));
    }

    let names: Vec<&str> = vars.iter().map(|(k, _)| k.as_str()).collect();
    tracing::debug!(vars = ?names, "Terraform environment prepared");
    vars
}
