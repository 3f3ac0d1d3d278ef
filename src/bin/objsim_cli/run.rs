use anyhow::{Context, Result};
use clap::Parser;

use objsim::input::read_patch_records;
use objsim::pipeline::{Evaluation, EvaluationOutput};
use objsim::profiler::ProcessProfiler;
use objsim::session::SessionOptions;

use super::{format_distance, print_json, ProjectArgs, SlotPolicyArg};

#[derive(Parser, Debug)]
#[command(about = "Evaluate every patch and rank them")]
pub struct RunCmd {
    #[command(flatten)]
    project: ProjectArgs,

    /// Which exit slots are compared
    #[arg(long, value_enum)]
    slot_policy: Option<SlotPolicyArg>,

    /// Keep gzipped snapshots of both runs per patch
    #[arg(long)]
    persist_snapshots: bool,

    /// Worker executable
    #[arg(long)]
    worker: Option<String>,

    /// Worker arguments ({addr}, {port}, {stage} and {build_dir} are expanded)
    #[arg(long = "worker-arg", allow_hyphen_values = true)]
    worker_args: Vec<String>,

    /// Per-session timeout, in seconds
    #[arg(long)]
    session_timeout_secs: Option<u64>,
}

impl RunCmd {
    pub async fn execute(&self, json_output: bool) -> Result<()> {
        let mut config = self.project.load_config()?;
        if let Some(policy) = self.slot_policy {
            config.slot_policy = policy.into();
        }
        if self.persist_snapshots {
            config.persist_snapshots = true;
        }
        if let Some(worker) = &self.worker {
            config.worker.command = worker.clone();
        }
        if !self.worker_args.is_empty() {
            config.worker.args = self.worker_args.clone();
        }
        if let Some(secs) = self.session_timeout_secs {
            config.session_timeout_secs = secs;
        }
        config.validate().context("invalid configuration")?;

        let input = config.input_csv();
        let records = read_patch_records(&input, &config.base_dir)?;

        let profiler = ProcessProfiler::new(SessionOptions::from_config(&config));
        let evaluation = Evaluation::new(config, profiler);
        let output = evaluation.run(&records).await?;

        if json_output {
            print_json(&serde_json::json!({
                "run_id": output.metadata.run_id,
                "output_dir": evaluation.paths().root(),
                "ranking": output.ranking,
                "summary": output.summary,
                "patches": output.metadata.patches,
            }))
        } else {
            print_report(&output, evaluation.paths().root());
            Ok(())
        }
    }
}

fn print_report(output: &EvaluationOutput, root: &std::path::Path) {
    println!("objsim run {}", output.metadata.run_id);
    println!("  output: {}", root.display());
    println!();

    for info in &output.metadata.patches {
        let status = if info.original.is_ok() && info.patched.is_ok() {
            "OK"
        } else {
            "ABNORMAL"
        };
        println!(
            "[{}] patch {}: {} tests, {} samples ({} inf)",
            status, info.patch_id, info.covering_tests, info.samples, info.infinite_samples
        );
    }

    if let Some(ranking) = &output.ranking {
        println!();
        println!("Ranking:");
        for (pos, id) in ranking.iter().enumerate() {
            println!("  {:>3}. patch {}", pos + 1, id);
        }
    }
    if let Some(summary) = &output.summary {
        println!();
        println!("Summary (min/avg/max):");
        for s in summary {
            println!(
                "  patch {}: passing {}/{}/{} failing {}/{}/{}{}",
                s.patch_id,
                format_distance(s.passing.min),
                format_distance(s.passing.avg),
                format_distance(s.passing.max),
                format_distance(s.failing.min),
                format_distance(s.failing.avg),
                format_distance(s.failing.max),
                s.label
                    .as_deref()
                    .map(|l| format!(" [{}]", l))
                    .unwrap_or_default(),
            );
        }
    }
}
