//! objsim-worker: reference worker that replays a scripted test suite.
//!
//! Started by the orchestrator for every profiling session; connects back to
//! `--connect`, answers one request and exits with the worker exit code.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::error;

use objsim::types::WorkerExitCode;
use objsim::worker::{serve, ScriptedSuite};

#[derive(Parser, Debug)]
#[command(name = "objsim-worker", version, about = "Scripted objsim worker")]
struct WorkerCli {
    /// Orchestrator control-channel address (host:port)
    #[arg(long)]
    connect: String,

    /// Suite fixture to replay
    #[arg(long, default_value = "objsim-suite.json")]
    suite: PathBuf,

    /// Build directory whose installed classes select suite variants
    #[arg(long)]
    build_dir: Option<PathBuf>,

    #[arg(long, short)]
    verbose: bool,
}

fn run(cli: &WorkerCli) -> Result<WorkerExitCode> {
    let suite = ScriptedSuite::load(&cli.suite, cli.build_dir.as_deref())?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;
    let result = runtime.block_on(serve(&cli.connect, Arc::new(suite)));
    // Timed-out tests may still occupy blocking threads.
    runtime.shutdown_background();
    result
}

fn main() {
    let cli = WorkerCli::parse();
    objsim::logging::init(cli.verbose);
    let code = match run(&cli) {
        Ok(code) => code,
        Err(e) => {
            error!(error = %format!("{:#}", e), "worker failed");
            WorkerExitCode::UNKNOWN_ERROR
        }
    };
    std::process::exit(code.0)
}
