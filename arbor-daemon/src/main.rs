//! arbord: multi-venue market-data and arbitrage worker.
//!
//! Init order is deliberate: configuration (everything needs it),
//! logging (debugging everything else), then the runtime which owns the
//! catalog connection and component lifecycle. Exits 0 on a clean
//! shutdown, 1 when initialization fails.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

mod config;
mod runtime;
mod state;
mod telemetry;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Debug)]
#[command(name = "arbord", version, about = "arbor market-data and trading worker")]
struct Args {
    /// Path to the configuration file; defaults apply when absent.
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let config = match config::load_config(args.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("failed to load config: {err:#}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(err) = telemetry::init_tracing(&config.log.level, Some(&config.log.dir)) {
        eprintln!("failed to init logging: {err:#}");
        return ExitCode::FAILURE;
    }

    info!("==========================================================");
    info!(version = VERSION, config = ?args.config, "starting arbord");

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(error = %err, "failed to build async runtime");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(runtime::run(config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %format!("{err:#}"), "worker failed");
            ExitCode::FAILURE
        }
    }
}
