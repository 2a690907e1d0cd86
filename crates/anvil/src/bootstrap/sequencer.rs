//! Bootstrap sequencer: the ordered coordinator-then-workers state machine.

use anvil_common::{AnvilError, BootstrapState, BoundTopology, JoinCredential, Node, Stage};
use futures::StreamExt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use super::report::{BootstrapReport, Failure, KubeconfigOutcome};
use super::{ClusterCommands, kubeconfig};
use crate::remote::{self, RemoteExecutor, RetryPolicy, run_with_retry};
use crate::shutdown::Shutdown;

/// Timing and fan-out knobs
#[derive(Debug, Clone)]
pub struct SequencerOptions {
    pub probe_timeout: Duration,
    pub command_timeout: Duration,
    pub retry: RetryPolicy,
    /// Concurrent worker probes and joins (1 = sequential)
    pub worker_concurrency: usize,
    /// Where to write the cluster kubeconfig; skipped when `None`
    pub kubeconfig_path: Option<PathBuf>,
}

/// Drives one bootstrap run per call to [`BootstrapSequencer::run`]
pub struct BootstrapSequencer {
    executor: Arc<dyn RemoteExecutor>,
    commands: ClusterCommands,
    options: SequencerOptions,
    shutdown: Shutdown,
}

impl BootstrapSequencer {
    pub fn new(
        executor: Arc<dyn RemoteExecutor>,
        commands: ClusterCommands,
        options: SequencerOptions,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            executor,
            commands,
            options,
            shutdown,
        }
    }

    /// Run the full sequence against an already-resolved topology.
    ///
    /// Coordinator-path failures end the run in `Failed` without touching any
    /// worker. Worker failures are isolated and aggregated; joined workers are
    /// left in place.
    pub async fn run(&self, topology: &BoundTopology) -> BootstrapReport {
        let mut report = BootstrapReport::new(topology);
        let coordinator = &topology.coordinator;

        tracing::info!(
            coordinator = %coordinator.id,
            workers = topology.workers.len(),
            "Bootstrap started"
        );

        // Idle: make sure every node is reachable before any state is created
        if let Err(e) = self.probe(coordinator).await {
            report.abort(Failure::from_error(Stage::Probe, &e));
            return report.finish();
        }

        let probes: Vec<Result<(), AnvilError>> = futures::stream::iter(&topology.workers)
            .map(|worker| self.probe(worker))
            .buffered(self.options.worker_concurrency.max(1))
            .collect()
            .await;

        let mut reachable = Vec::new();
        for ((index, worker), probe) in topology.workers.iter().enumerate().zip(probes) {
            match probe {
                Ok(()) => reachable.push((index, worker)),
                Err(e) => {
                    tracing::warn!(node = %worker.id, error = %e, "Worker unreachable, will not join");
                    report.workers[index].fail(Failure::from_error(Stage::Probe, &e));
                }
            }
        }

        // Coordinator
        report.advance(BootstrapState::CoordinatorInitializing);
        let init = self.commands.coordinator_init();
        if let Err(e) = self
            .guarded(run_with_retry(
                self.executor.as_ref(),
                coordinator,
                &init,
                self.options.command_timeout,
                &self.options.retry,
            ))
            .await
        {
            report.abort(Failure::from_error(Stage::CoordinatorInit, &e));
            return report.finish();
        }
        report.advance(BootstrapState::CoordinatorReady);

        // Credential, strictly after the coordinator is ready
        let credential = match self.fetch_credential(coordinator).await {
            Ok(credential) => credential,
            Err(failure) => {
                report.abort(failure);
                return report.finish();
            }
        };
        report.credential_fingerprint = Some(credential.fingerprint());
        report.coordinator.succeed();
        report.advance(BootstrapState::CredentialFetched);

        // Workers, strictly after the credential is in hand
        report.advance(BootstrapState::WorkersInitializing);
        let joins: Vec<(usize, Result<(), AnvilError>)> = futures::stream::iter(reachable)
            .map(|(index, worker)| {
                let credential = &credential;
                async move { (index, self.join_worker(coordinator, worker, credential).await) }
            })
            .buffered(self.options.worker_concurrency.max(1))
            .collect()
            .await;

        for (index, result) in joins {
            match result {
                Ok(()) => report.workers[index].succeed(),
                Err(e) => report.workers[index].fail(Failure::from_error(Stage::WorkerJoin, &e)),
            }
        }

        // Interrupted joins: workers that made it stay ok, the run itself failed
        if self.shutdown.is_triggered() {
            tracing::warn!("Bootstrap interrupted during worker joins");
            report.advance(BootstrapState::Failed);
            return report.finish();
        }

        if let Some(ref path) = self.options.kubeconfig_path {
            report.kubeconfig = Some(self.export_kubeconfig(coordinator, path).await);
        }

        let any_failed = report.workers.iter().any(|w| w.is_failed());
        report.advance(if any_failed {
            BootstrapState::PartiallyComplete
        } else {
            BootstrapState::Complete
        });
        report.finish()
    }

    /// Race `fut` against the shutdown signal; dropping `fut` kills its session
    async fn guarded<T>(
        &self,
        fut: impl Future<Output = Result<T, AnvilError>>,
    ) -> Result<T, AnvilError> {
        tokio::select! {
            biased;
            _ = self.shutdown.triggered() => {
                Err(AnvilError::Cancelled("shutdown requested".to_string()))
            }
            result = fut => result,
        }
    }

    async fn probe(&self, node: &Node) -> Result<(), AnvilError> {
        self.guarded(remote::probe(
            self.executor.as_ref(),
            node,
            self.options.probe_timeout,
            &self.options.retry,
        ))
        .await
    }

    async fn fetch_credential(&self, coordinator: &Node) -> Result<JoinCredential, Failure> {
        let read = self.commands.credential_read();
        let output = self
            .guarded(run_with_retry(
                self.executor.as_ref(),
                coordinator,
                &read,
                self.options.command_timeout,
                &self.options.retry,
            ))
            .await
            .map_err(|e| Failure::from_error(Stage::CredentialFetch, &e))?;

        let credential = JoinCredential::from_output(&output.stdout).ok_or_else(|| Failure {
            stage: Stage::CredentialFetch,
            kind: "command".to_string(),
            message: format!("`{}` on {} returned an empty token", read.label(), coordinator.id),
            retryable_by_rerun: true,
        })?;

        tracing::info!(
            node = %coordinator.id,
            credential = %credential.fingerprint(),
            "Join credential fetched"
        );
        Ok(credential)
    }

    async fn join_worker(
        &self,
        coordinator: &Node,
        worker: &Node,
        credential: &JoinCredential,
    ) -> Result<(), AnvilError> {
        let join = self.commands.worker_join(&coordinator.address, credential);
        tracing::info!(node = %worker.id, coordinator = %coordinator.id, "Joining worker");

        let result = self
            .guarded(run_with_retry(
                self.executor.as_ref(),
                worker,
                &join,
                self.options.command_timeout,
                &self.options.retry,
            ))
            .await;

        match result {
            Ok(_) => {
                tracing::info!(node = %worker.id, "Worker joined");
                Ok(())
            }
            Err(e) => {
                tracing::error!(node = %worker.id, error = %e, "Worker join failed");
                Err(e)
            }
        }
    }

    async fn export_kubeconfig(&self, coordinator: &Node, path: &Path) -> KubeconfigOutcome {
        let read = self.commands.kubeconfig_read();
        let result = self
            .guarded(run_with_retry(
                self.executor.as_ref(),
                coordinator,
                &read,
                self.options.command_timeout,
                &self.options.retry,
            ))
            .await;

        let error = match result {
            Ok(output) => {
                let contents = kubeconfig::rewrite_server(&output.stdout, &coordinator.address);
                kubeconfig::write(path, &contents).err().map(|e| e.to_string())
            }
            Err(e) => Some(e.to_string()),
        };

        KubeconfigOutcome {
            path: path.display().to_string(),
            error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::labels;
    use crate::config::ClusterConfig;
    use crate::remote::{CommandOutput, RemoteCommand};
    use anvil_common::{Address, NodeRole};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    struct Call {
        node: String,
        label: String,
        script: String,
        stdin: Option<String>,
    }

    type Responder = Box<dyn Fn(&str, &str) -> Result<CommandOutput, AnvilError> + Send + Sync>;

    /// Records every command; answers through a per-test responder
    struct MockExecutor {
        calls: Mutex<Vec<Call>>,
        respond: Responder,
        /// Per-node delay applied to every command
        delays: HashMap<String, Duration>,
        /// Per-(node, label) delay
        command_delays: HashMap<(String, String), Duration>,
    }

    impl MockExecutor {
        fn new(
            respond: impl Fn(&str, &str) -> Result<CommandOutput, AnvilError> + Send + Sync + 'static,
        ) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                respond: Box::new(respond),
                delays: HashMap::new(),
                command_delays: HashMap::new(),
            }
        }

        /// Healthy cluster handing out `tok-123`
        fn healthy() -> Self {
            Self::new(|_, label| ok(if label == labels::CREDENTIAL_READ { "tok-123\n" } else { "" }))
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn labels_for(&self, label: &str) -> Vec<String> {
            self.calls()
                .into_iter()
                .filter(|c| c.label == label)
                .map(|c| c.node)
                .collect()
        }
    }

    #[async_trait]
    impl RemoteExecutor for MockExecutor {
        async fn run(
            &self,
            node: &Node,
            command: &RemoteCommand,
            _timeout: Duration,
        ) -> Result<CommandOutput, AnvilError> {
            self.calls.lock().unwrap().push(Call {
                node: node.id.clone(),
                label: command.label().to_string(),
                script: command.script().to_string(),
                stdin: command.stdin().map(|s| s.expose().to_string()),
            });
            if let Some(delay) = self.delays.get(&node.id) {
                tokio::time::sleep(*delay).await;
            }
            let key = (node.id.clone(), command.label().to_string());
            if let Some(delay) = self.command_delays.get(&key) {
                tokio::time::sleep(*delay).await;
            }
            (self.respond)(&node.id, command.label())
        }
    }

    fn ok(stdout: &str) -> Result<CommandOutput, AnvilError> {
        Ok(CommandOutput {
            stdout: stdout.to_string(),
            ..Default::default()
        })
    }

    fn exit(node: &str, label: &str, code: i32) -> Result<CommandOutput, AnvilError> {
        Err(AnvilError::Command {
            node: node.to_string(),
            label: label.to_string(),
            exit_code: code,
            stderr: "[ERROR] installation failed".to_string(),
        })
    }

    fn unreachable(node: &str) -> Result<CommandOutput, AnvilError> {
        Err(AnvilError::Connection {
            node: node.to_string(),
            reason: "ssh: connect to host port 22: No route to host".to_string(),
        })
    }

    fn topology() -> BoundTopology {
        let node = |id: &str, role, ip: &str| Node {
            id: id.into(),
            role,
            address: Address::parse(ip).unwrap(),
        };
        BoundTopology {
            coordinator: node("m1", NodeRole::Coordinator, "10.0.0.1"),
            workers: vec![
                node("w1", NodeRole::Worker, "10.0.0.2"),
                node("w2", NodeRole::Worker, "10.0.0.3"),
            ],
        }
    }

    fn options() -> SequencerOptions {
        SequencerOptions {
            probe_timeout: Duration::from_secs(1),
            command_timeout: Duration::from_secs(1),
            retry: RetryPolicy {
                max_attempts: 2,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(1),
            },
            worker_concurrency: 2,
            kubeconfig_path: None,
        }
    }

    fn sequencer(executor: Arc<MockExecutor>) -> BootstrapSequencer {
        BootstrapSequencer::new(
            executor,
            ClusterCommands::from_config(&ClusterConfig::default()),
            options(),
            Shutdown::never(),
        )
    }

    #[tokio::test]
    async fn test_full_run_follows_state_machine() {
        let executor = Arc::new(MockExecutor::healthy());
        let report = sequencer(executor.clone()).run(&topology()).await;

        assert!(report.is_success());
        assert_eq!(report.exit_code(), 0);
        assert_eq!(
            report.transitions,
            vec![
                BootstrapState::Idle,
                BootstrapState::CoordinatorInitializing,
                BootstrapState::CoordinatorReady,
                BootstrapState::CredentialFetched,
                BootstrapState::WorkersInitializing,
                BootstrapState::Complete,
            ]
        );
        assert_eq!(report.summary(), "{coordinator: ok, w1: ok, w2: ok}");
        assert!(report.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_no_worker_join_before_credential_fetch() {
        let executor = Arc::new(MockExecutor::healthy());
        sequencer(executor.clone()).run(&topology()).await;

        let calls = executor.calls();
        let position = |label: &str| calls.iter().position(|c| c.label == label).unwrap();
        let last_probe = calls.iter().rposition(|c| c.label == "probe").unwrap();
        let init = position(labels::COORDINATOR_INIT);
        let fetch = position(labels::CREDENTIAL_READ);
        let first_join = position(labels::WORKER_JOIN);

        assert!(last_probe < init, "every probe precedes stateful commands");
        assert!(init < fetch);
        assert!(fetch < first_join);
        assert_eq!(calls[init].node, "m1");
        assert_eq!(calls[fetch].node, "m1");
    }

    #[tokio::test]
    async fn test_coordinator_init_failure_issues_no_worker_commands() {
        let executor = Arc::new(MockExecutor::new(|node, label| match label {
            labels::COORDINATOR_INIT => exit(node, label, 1),
            _ => ok(""),
        }));
        let report = sequencer(executor.clone()).run(&topology()).await;

        assert_eq!(report.final_state, BootstrapState::Failed);
        assert_eq!(report.failed_from(), Some(BootstrapState::CoordinatorInitializing));
        assert!(executor.labels_for(labels::WORKER_JOIN).is_empty());
        assert!(executor.labels_for(labels::CREDENTIAL_READ).is_empty());
        // Command failures are not retried
        assert_eq!(executor.labels_for(labels::COORDINATOR_INIT), vec!["m1"]);

        let failure = report.coordinator.failure.as_ref().unwrap();
        assert_eq!(failure.stage, Stage::CoordinatorInit);
        assert_eq!(report.summary(), "{coordinator: failed, w1: skipped, w2: skipped}");
        assert_ne!(report.exit_code(), 0);
    }

    #[tokio::test]
    async fn test_single_worker_failure_is_partial_success() {
        let executor = Arc::new(MockExecutor::new(|node, label| match (node, label) {
            (_, labels::CREDENTIAL_READ) => ok("tok-123\n"),
            ("w2", labels::WORKER_JOIN) => exit(node, label, 1),
            _ => ok(""),
        }));
        let report = sequencer(executor.clone()).run(&topology()).await;

        assert_eq!(report.summary(), "{coordinator: ok, w1: ok, w2: failed}");
        assert_eq!(report.final_state, BootstrapState::PartiallyComplete);
        assert_ne!(report.exit_code(), 0);

        let failures = report.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].node, "w2");
        let failure = failures[0].failure.as_ref().unwrap();
        assert_eq!(failure.stage, Stage::WorkerJoin);
        assert!(failure.retryable_by_rerun);

        // Both workers got the coordinator URL and the token, the token only on stdin
        for call in executor.calls().iter().filter(|c| c.label == labels::WORKER_JOIN) {
            assert!(call.script.contains("https://10.0.0.1:6443"));
            assert!(!call.script.contains("tok-123"));
            assert_eq!(call.stdin.as_deref(), Some("tok-123"));
        }
    }

    #[tokio::test]
    async fn test_empty_credential_fails_before_workers() {
        let executor = Arc::new(MockExecutor::new(|_, _| ok("  \n")));
        let report = sequencer(executor.clone()).run(&topology()).await;

        assert_eq!(report.final_state, BootstrapState::Failed);
        assert_eq!(report.failed_from(), Some(BootstrapState::CoordinatorReady));
        assert_eq!(
            report.coordinator.failure.as_ref().unwrap().stage,
            Stage::CredentialFetch
        );
        assert!(report.credential_fingerprint.is_none());
        assert!(executor.labels_for(labels::WORKER_JOIN).is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_coordinator_fails_in_idle() {
        let executor = Arc::new(MockExecutor::new(|node, label| match (node, label) {
            ("m1", "probe") => unreachable(node),
            _ => ok("tok-123"),
        }));
        let report = sequencer(executor.clone()).run(&topology()).await;

        assert_eq!(report.failed_from(), Some(BootstrapState::Idle));
        assert!(executor.labels_for(labels::COORDINATOR_INIT).is_empty());
        // Connection failures were retried up to the policy limit
        assert_eq!(executor.labels_for("probe"), vec!["m1", "m1"]);
    }

    #[tokio::test]
    async fn test_unreachable_worker_is_not_joined() {
        let executor = Arc::new(MockExecutor::new(|node, label| match (node, label) {
            ("w1", "probe") => unreachable(node),
            (_, labels::CREDENTIAL_READ) => ok("tok-123"),
            _ => ok(""),
        }));
        let report = sequencer(executor.clone()).run(&topology()).await;

        assert_eq!(report.final_state, BootstrapState::PartiallyComplete);
        assert_eq!(report.summary(), "{coordinator: ok, w1: failed, w2: ok}");
        assert_eq!(report.workers[0].failure.as_ref().unwrap().stage, Stage::Probe);
        assert_eq!(executor.labels_for(labels::WORKER_JOIN), vec!["w2"]);
    }

    #[tokio::test]
    async fn test_rerun_against_bootstrapped_cluster_is_complete_again() {
        let executor = Arc::new(MockExecutor::healthy());
        let sequencer = sequencer(executor.clone());

        let first = sequencer.run(&topology()).await;
        let second = sequencer.run(&topology()).await;

        assert!(first.is_success());
        assert!(second.is_success());
        assert_eq!(first.credential_fingerprint, second.credential_fingerprint);
        // One credential read per run, nothing more
        assert_eq!(executor.labels_for(labels::CREDENTIAL_READ).len(), 2);
        assert_eq!(executor.labels_for(labels::WORKER_JOIN).len(), 4);
    }

    #[tokio::test]
    async fn test_coordinator_only_topology_completes() {
        let executor = Arc::new(MockExecutor::healthy());
        let mut topology = topology();
        topology.workers.clear();

        let report = sequencer(executor.clone()).run(&topology).await;
        assert!(report.is_success());
        assert_eq!(report.summary(), "{coordinator: ok}");
    }

    #[tokio::test]
    async fn test_worker_results_keep_topology_order() {
        let mut executor = MockExecutor::new(|node, label| match (node, label) {
            (_, labels::CREDENTIAL_READ) => ok("tok-123"),
            ("w1", labels::WORKER_JOIN) => exit(node, label, 2),
            _ => ok(""),
        });
        // w1 finishes last; the report must still list it first
        executor.delays.insert("w1".to_string(), Duration::from_millis(30));
        let report = sequencer(Arc::new(executor)).run(&topology()).await;

        assert_eq!(report.workers[0].node, "w1");
        assert!(report.workers[0].is_failed());
        assert!(report.workers[1].is_ok());
    }

    #[tokio::test]
    async fn test_shutdown_cancels_run() {
        let (tx, shutdown) = Shutdown::channel();
        tx.send(true).unwrap();

        let executor = Arc::new(MockExecutor::healthy());
        let sequencer = BootstrapSequencer::new(
            executor.clone(),
            ClusterCommands::from_config(&ClusterConfig::default()),
            options(),
            shutdown,
        );
        let report = sequencer.run(&topology()).await;

        assert_eq!(report.final_state, BootstrapState::Failed);
        assert_eq!(report.coordinator.failure.as_ref().unwrap().kind, "cancelled");
        assert!(executor.calls().is_empty());
    }

    #[tokio::test]
    async fn test_worker_timeout_leaves_siblings_untouched() {
        let executor = Arc::new(MockExecutor::new(|node, label| match (node, label) {
            (_, labels::CREDENTIAL_READ) => ok("tok-123"),
            ("w1", labels::WORKER_JOIN) => Err(AnvilError::Timeout {
                node: node.to_string(),
                label: label.to_string(),
                secs: 600,
            }),
            _ => ok(""),
        }));
        let report = sequencer(executor.clone()).run(&topology()).await;

        assert_eq!(report.final_state, BootstrapState::PartiallyComplete);
        assert_eq!(report.summary(), "{coordinator: ok, w1: failed, w2: ok}");

        let failure = report.workers[0].failure.as_ref().unwrap();
        assert_eq!(failure.stage, Stage::WorkerJoin);
        assert_eq!(failure.kind, "timeout");
        assert!(report.workers[1].failure.is_none());
        // Timeouts are connection-class: w1 was retried, w2 joined once
        let joins = executor.labels_for(labels::WORKER_JOIN);
        assert_eq!(joins.iter().filter(|n| *n == "w1").count(), 2);
        assert_eq!(joins.iter().filter(|n| *n == "w2").count(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_during_joins_fails_run_and_keeps_joined_workers() {
        let mut executor = MockExecutor::healthy();
        executor
            .command_delays
            .insert(("w2".to_string(), labels::WORKER_JOIN.to_string()), Duration::from_secs(5));
        let executor = Arc::new(executor);

        let (tx, shutdown) = Shutdown::channel();
        let path = std::env::temp_dir()
            .join(format!("anvil-kube-cancel-{}", std::process::id()))
            .join("config");
        let mut opts = options();
        opts.kubeconfig_path = Some(path.clone());
        let sequencer = BootstrapSequencer::new(
            executor.clone(),
            ClusterCommands::from_config(&ClusterConfig::default()),
            opts,
            shutdown,
        );

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let _ = tx.send(true);
        });
        let report = sequencer.run(&topology()).await;

        assert_eq!(report.final_state, BootstrapState::Failed);
        assert_eq!(report.failed_from(), Some(BootstrapState::WorkersInitializing));
        assert_eq!(report.exit_code(), 1);
        assert_eq!(report.summary(), "{coordinator: ok, w1: ok, w2: failed}");
        assert_eq!(report.workers[1].failure.as_ref().unwrap().kind, "cancelled");

        // Nothing runs after the interrupt
        assert!(report.kubeconfig.is_none());
        assert!(executor.labels_for(labels::KUBECONFIG_READ).is_empty());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_kubeconfig_is_exported_with_public_address() {
        let executor = Arc::new(MockExecutor::new(|_, label| match label {
            labels::CREDENTIAL_READ => ok("tok-123"),
            labels::KUBECONFIG_READ => ok("clusters:\n- cluster:\n    server: https://127.0.0.1:6443\n"),
            _ => ok(""),
        }));
        let path = std::env::temp_dir()
            .join(format!("anvil-kube-{}", std::process::id()))
            .join("config");

        let mut opts = options();
        opts.kubeconfig_path = Some(path.clone());
        let sequencer = BootstrapSequencer::new(
            executor,
            ClusterCommands::from_config(&ClusterConfig::default()),
            opts,
            Shutdown::never(),
        );
        let report = sequencer.run(&topology()).await;

        let outcome = report.kubeconfig.as_ref().unwrap();
        assert!(outcome.error.is_none());
        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("server: https://10.0.0.1:6443"));

        std::fs::remove_dir_all(path.parent().unwrap()).unwrap();
    }
}
