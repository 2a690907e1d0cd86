//! Provisioning client.
//!
//! Drives an external declarative engine through `init -> refresh -> apply`
//! and reads back its named outputs. The orchestrator never interprets engine
//! failures and never retries them: a half-applied plan is left for the engine's
//! own reconcile step on the next run.

mod terraform;

pub use terraform::{TerraformEngine, parse_outputs};

use anvil_common::{AnvilError, ProvisioningOutput, Topology};
use async_trait::async_trait;

/// Black-box provisioning engine
#[async_trait]
pub trait ProvisioningEngine: Send + Sync {
    /// Engine name for logs
    fn name(&self) -> &str;

    /// Prepare the working directory (providers, backend)
    async fn init(&self) -> Result<(), AnvilError>;

    /// Resynchronize the engine's state with real resources
    async fn refresh(&self) -> Result<(), AnvilError>;

    /// Create or update resources
    async fn apply(&self) -> Result<(), AnvilError>;

    /// Current named outputs
    async fn outputs(&self) -> Result<ProvisioningOutput, AnvilError>;
}

/// Provision the topology: init, refresh, apply, then collect outputs.
pub async fn provision(
    engine: &dyn ProvisioningEngine,
    topology: &Topology,
) -> Result<ProvisioningOutput, AnvilError> {
    tracing::info!(engine = engine.name(), nodes = topology.len(), "Provisioning started");

    engine.init().await?;
    engine.refresh().await?;
    engine.apply().await?;

    let outputs = read_outputs(engine, topology).await?;
    tracing::info!(outputs = outputs.len(), "Provisioning complete");
    Ok(outputs)
}

/// Read outputs of an earlier apply without changing any resource.
pub async fn read_outputs(
    engine: &dyn ProvisioningEngine,
    topology: &Topology,
) -> Result<ProvisioningOutput, AnvilError> {
    let outputs = engine.outputs().await?;
    require_outputs(&outputs, topology)?;
    Ok(outputs)
}

/// Every declared node must have its output key present
fn require_outputs(outputs: &ProvisioningOutput, topology: &Topology) -> Result<(), AnvilError> {
    let missing: Vec<String> = topology
        .nodes()
        .map(|n| n.output_key())
        .filter(|key| !outputs.contains(key))
        .collect();

    if missing.is_empty() {
        return Ok(());
    }

    Err(AnvilError::Provisioning {
        step: "output".to_string(),
        status: None,
        diagnostic: format!("missing required outputs: {}", missing.join(", ")),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use anvil_common::{NodeRole, NodeSpec};
    use std::sync::Mutex;
    use tokio_test::{assert_err, assert_ok};

    struct MockEngine {
        calls: Mutex<Vec<&'static str>>,
        fail_apply: bool,
        outputs: ProvisioningOutput,
    }

    impl MockEngine {
        fn new(outputs: &[(&str, &str)]) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                fail_apply: false,
                outputs: outputs
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            }
        }

        fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ProvisioningEngine for MockEngine {
        fn name(&self) -> &str {
            "mock"
        }

        async fn init(&self) -> Result<(), AnvilError> {
            self.calls.lock().unwrap().push("init");
            Ok(())
        }

        async fn refresh(&self) -> Result<(), AnvilError> {
            self.calls.lock().unwrap().push("refresh");
            Ok(())
        }

        async fn apply(&self) -> Result<(), AnvilError> {
            self.calls.lock().unwrap().push("apply");
            if self.fail_apply {
                return Err(AnvilError::Provisioning {
                    step: "apply".into(),
                    status: Some(1),
                    diagnostic: "Error: creating EC2 Instance: UnauthorizedOperation".into(),
                });
            }
            Ok(())
        }

        async fn outputs(&self) -> Result<ProvisioningOutput, AnvilError> {
            self.calls.lock().unwrap().push("outputs");
            Ok(self.outputs.clone())
        }
    }

    fn topology() -> Topology {
        Topology::new(vec![
            NodeSpec::new("m1", NodeRole::Coordinator),
            NodeSpec::new("w1", NodeRole::Worker),
        ])
        .unwrap()
    }

    #[tokio::test]
    async fn test_refresh_runs_before_apply() {
        let engine = MockEngine::new(&[("m1_public_ip", "10.0.0.1"), ("w1_public_ip", "10.0.0.2")]);
        let outputs = assert_ok!(provision(&engine, &topology()).await);

        assert_eq!(outputs.get("w1_public_ip"), Some("10.0.0.2"));
        assert_eq!(engine.calls(), vec!["init", "refresh", "apply", "outputs"]);
    }

    #[tokio::test]
    async fn test_apply_failure_surfaces_engine_diagnostic() {
        let mut engine = MockEngine::new(&[]);
        engine.fail_apply = true;

        let err = assert_err!(provision(&engine, &topology()).await);
        assert!(err.to_string().contains("UnauthorizedOperation"));
        // Aborted before outputs were read
        assert_eq!(engine.calls(), vec!["init", "refresh", "apply"]);
    }

    #[tokio::test]
    async fn test_missing_output_is_provisioning_error() {
        let engine = MockEngine::new(&[("m1_public_ip", "10.0.0.1")]);

        let err = assert_err!(provision(&engine, &topology()).await);
        match err {
            AnvilError::Provisioning { step, diagnostic, .. } => {
                assert_eq!(step, "output");
                assert!(diagnostic.contains("w1_public_ip"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_read_outputs_does_not_apply() {
        let engine = MockEngine::new(&[("m1_public_ip", "10.0.0.1"), ("w1_public_ip", "10.0.0.2")]);
        assert_ok!(read_outputs(&engine, &topology()).await);
        assert_eq!(engine.calls(), vec!["outputs"]);
    }
}
