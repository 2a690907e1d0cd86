//! # Anvil - Provisioning and Cluster Bootstrap Orchestrator
//!
//! Creates a small fleet of VMs through Terraform, then forms a k3s cluster
//! on them over SSH: coordinator first, workers joined with its token.
//!
//! ## Flow
//! ```text
//! terraform init/refresh/apply → outputs → probe → coordinator init
//!                                                        ↓
//!                               worker joins  ←  join credential
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

mod bootstrap;
mod config;
mod outputs;
mod pipeline;
mod provision;
mod remote;
mod shutdown;
mod state;

use config::{AppConfig, Secrets};
use pipeline::BootstrapOptions;
use shutdown::Shutdown;

/// Anvil - provisioning and cluster bootstrap orchestrator
#[derive(Parser, Debug)]
#[command(name = "anvil")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Configuration file path
    #[arg(short, long, global = true, default_value = anvil_common::constants::DEFAULT_CONFIG_PATH)]
    config: String,

    /// Terraform working directory (overrides config)
    #[arg(long, global = true, env = "ANVIL_TERRAFORM_DIR")]
    terraform_dir: Option<String>,

    /// SSH private key path (overrides config and SSH_PRIVATE_KEY)
    #[arg(long, global = true, env = "ANVIL_SSH_KEY")]
    ssh_key: Option<String>,

    /// Concurrent worker joins (overrides config)
    #[arg(long, global = true)]
    worker_concurrency: Option<usize>,

    /// Skip host key verification
    #[arg(long, global = true, default_value = "false")]
    insecure_host_keys: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info", env = "LOG_LEVEL")]
    log_level: String,

    /// Enable JSON logging output
    #[arg(long, global = true, default_value = "false")]
    json_logs: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create or update the nodes and print their outputs
    Provision {
        /// Save outputs for a later `bootstrap --outputs-file`
        #[arg(long)]
        outputs_file: Option<PathBuf>,
    },

    /// Form the cluster on already-provisioned nodes
    Bootstrap {
        /// Saved `terraform output -json`; defaults to reading the engine's state
        #[arg(long)]
        outputs_file: Option<PathBuf>,

        /// Write the JSON report here
        #[arg(long)]
        report: Option<PathBuf>,

        /// Continue even if the coordinator changed under joined workers
        #[arg(long, default_value = "false")]
        allow_replace: bool,
    },

    /// Provision, then bootstrap
    Up {
        /// Write the JSON report here
        #[arg(long)]
        report: Option<PathBuf>,

        /// Continue even if the coordinator changed under joined workers
        #[arg(long, default_value = "false")]
        allow_replace: bool,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Secrets may come from a local .env
    dotenvy::dotenv().ok();

    // Parse CLI arguments
    let args = Args::parse();

    // Initialize logging
    init_logging(&args.log_level, args.json_logs)?;

    info!("🔨 Starting Anvil v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = AppConfig::load(&args.config, &args)?;
    let secrets = Secrets::from_env();
    info!("📋 Configuration loaded from {}", args.config);

    // Ctrl-C cancels in-flight remote sessions
    let (shutdown_tx, shutdown) = Shutdown::channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("🛑 Shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    let code = match args.command {
        Command::Provision { outputs_file } => {
            let outputs = pipeline::run_provision(&config, &secrets, outputs_file.as_deref()).await?;
            for (key, value) in outputs.iter() {
                println!("{} = {}", key, value);
            }
            0
        }
        Command::Bootstrap {
            outputs_file,
            report,
            allow_replace,
        } => {
            let options = BootstrapOptions {
                outputs_file,
                report_path: report,
                allow_replace,
            };
            let outputs =
                pipeline::load_outputs(&config, &secrets, options.outputs_file.as_deref()).await?;
            let report = pipeline::run_bootstrap(&config, &secrets, outputs, shutdown, &options).await?;
            println!("{}", report.summary());
            report.exit_code()
        }
        Command::Up {
            report,
            allow_replace,
        } => {
            let options = BootstrapOptions {
                outputs_file: None,
                report_path: report,
                allow_replace,
            };
            let outputs = pipeline::run_provision(&config, &secrets, None).await?;
            let report = pipeline::run_bootstrap(&config, &secrets, outputs, shutdown, &options).await?;
            println!("{}", report.summary());
            report.exit_code()
        }
    };

    info!("👋 Anvil finished");
    Ok(ExitCode::from(code))
}

/// Initialize structured logging with tracing
fn init_logging(level: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }

    Ok(())
}
