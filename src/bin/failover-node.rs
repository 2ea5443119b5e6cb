// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Standalone node: connects, reconciles, then keeps the master alive until
//! Ctrl-C or until no backend can take the master role.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use failover_store::{EngineConfig, StoreEngine};

#[derive(Parser, Debug)]
#[command(name = "failover-node", version, about = "Failover and replication node")]
struct Args {
    /// Settings file with the `databases` table
    #[arg(long, short, default_value = "config.json")]
    config: PathBuf,

    /// Override the pointer file path from the settings file
    #[arg(long)]
    pointer: Option<PathBuf>,

    /// Verbose logging (ignored when RUST_LOG is set)
    #[arg(long, short)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if args.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = match EngineConfig::load_from(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!(path = %args.config.display(), error = %e, "Failed to load settings");
            return ExitCode::FAILURE;
        }
    };
    if let Some(pointer) = args.pointer {
        config.pointer_path = pointer;
    }

    let engine = Arc::new(StoreEngine::from_config(config));
    match engine.start().await {
        Ok(master) => info!(master = %master, "Node ready"),
        Err(e) => {
            error!(error = %e, "Startup failed");
            return ExitCode::FAILURE;
        }
    }

    let mut monitor = engine.spawn_health_monitor();
    tokio::select! {
        result = &mut monitor => match result {
            Ok(Ok(())) => ExitCode::SUCCESS,
            Ok(Err(e)) => {
                error!(error = %e, "Terminating: no backend can serve");
                ExitCode::FAILURE
            }
            Err(e) => {
                error!(error = %e, "Health monitor task panicked");
                ExitCode::FAILURE
            }
        },
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl-C received");
            engine.shutdown();
            let _ = monitor.await;
            ExitCode::SUCCESS
        }
    }
}
