//! CLI entry point for recstation
//!
//! `run` starts the parent daemon, which spawns the worker as
//! `recstation worker` with the control channel on its stdio.

use clap::{Parser, Subcommand};
use recstation::{init_logging, run_worker, Config, Daemon};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};

/// recstation - PVR recording back end
#[derive(Parser, Debug)]
#[command(name = "recstation")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Run the parent daemon
    Run {
        /// Path to the configuration file (config.toml)
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
    /// Run the worker; started by the daemon, not by hand
    Worker {
        /// Path to the configuration file (config.toml)
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let (config_path, log_file) = match &args.command {
        Cmd::Run { config } => (config, "recstation.log"),
        Cmd::Worker { config } => (config, "recstation-worker.log"),
    };

    let config = match Config::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load {}: {}", config_path.display(), e);
            return ExitCode::FAILURE;
        }
    };

    let _guard = match init_logging(&config.logging, log_file) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let result = match args.command {
        Cmd::Run { config: path } => {
            info!(config = %path.display(), "recstation starting");
            match Daemon::with_config_path(config, path).await {
                Ok(daemon) => {
                    info!(
                        max_encode_jobs = daemon.concurrency_plan.max_encode_jobs,
                        max_streams = daemon.concurrency_plan.max_streams,
                        "daemon initialized"
                    );
                    daemon.run().await
                }
                Err(e) => Err(e),
            }
        }
        Cmd::Worker { .. } => run_worker(config).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "recstation stopped with an error");
            ExitCode::FAILURE
        }
    }
}
