//! objsim: rank candidate patches by object-state similarity
//!
//! ## Example Usage
//!
//! ```bash
//! # Validate the project before a long run
//! objsim check --base-dir ./project
//!
//! # Evaluate every patch in input-file.csv and write ranking.txt
//! objsim run --base-dir ./project --failing-tests failing.txt
//!
//! # Summaries instead of a ranking, comparing all but the outcome slot
//! objsim run --ranking summary --slot-policy skip-outcome-slot-for-failing
//!
//! # Recompute the ranking from an earlier run's raw distances
//! objsim rank --base-dir ./project
//! ```

use clap::{Parser, Subcommand};
use std::process::ExitCode;

mod objsim_cli;

use objsim_cli::{check::CheckCmd, rank::RankCmd, run::RunCmd};

#[derive(Parser)]
#[command(
    name = "objsim",
    author,
    version,
    about = "Patch prioritization by object-state similarity",
    long_about = "Runs the tests covering each candidate patch against the original and the \
                  patched program, compares the object state captured at the patched methods' \
                  exits and ranks the patches."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output as JSON instead of human-readable format
    #[arg(long, global = true)]
    json: bool,

    /// Verbose output (debug logging, worker output)
    #[arg(long, short, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate every patch and rank them
    Run(RunCmd),

    /// Re-rank from the raw distances of an earlier run
    Rank(RankCmd),

    /// Validate configuration, patch records and class files
    Check(CheckCmd),
}

#[tokio::main]
async fn main() -> ExitCode {
    let Cli {
        command,
        json,
        verbose,
    } = Cli::parse();
    objsim::logging::init(verbose);

    let result = match command {
        Commands::Run(cmd) => cmd.execute(json).await,
        Commands::Rank(cmd) => cmd.execute(json).await,
        Commands::Check(cmd) => cmd.execute(json).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {:?}", err);
            if objsim::errors::is_fatal(&err) {
                ExitCode::from(2)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}
