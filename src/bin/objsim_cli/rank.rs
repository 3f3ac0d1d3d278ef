use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

use objsim::input::read_patch_records;
use objsim::paths::OutputPaths;
use objsim::ranking::{borda_rank, summarize, PatchEvaluation, RankingScheme};
use objsim::report::{read_raw_distances, write_ranking, write_summary};

use super::{format_distance, print_json, ProjectArgs};

/// Recompute the ranking from the distances of a previous run.
#[derive(Parser, Debug)]
#[command(about = "Re-rank patches from the raw distances of an earlier run")]
pub struct RankCmd {
    #[command(flatten)]
    project: ProjectArgs,
}

impl RankCmd {
    pub async fn execute(&self, json_output: bool) -> Result<()> {
        let config = self.project.load_config()?;
        let records = read_patch_records(&config.input_csv(), &config.base_dir)?;
        let paths = OutputPaths::new(config.output_dir());

        let mut evaluations = Vec::with_capacity(records.len());
        for record in records {
            let path = paths.raw_distances(record.id);
            let samples = if path.exists() {
                read_raw_distances(&path)?
            } else {
                warn!(patch_id = record.id, path = %path.display(), "no raw distances");
                Vec::new()
            };
            let covering_tests = if record.covering_tests.is_empty() {
                samples.iter().map(|s| s.test.clone()).collect()
            } else {
                record.covering_tests
            };
            evaluations.push(PatchEvaluation {
                patch_id: record.id,
                suspiciousness: record.suspiciousness,
                label: record.label,
                covering_tests,
                samples,
            });
        }

        match config.ranking {
            RankingScheme::Borda => {
                let ranking = borda_rank(&evaluations);
                write_ranking(&paths.ranking(), &ranking)?;
                info!(path = %paths.ranking().display(), "wrote ranking");
                if json_output {
                    print_json(&serde_json::json!({ "ranking": ranking }))?;
                } else {
                    for id in ranking {
                        println!("{}", id);
                    }
                }
            }
            RankingScheme::Summary => {
                let summary = summarize(&evaluations);
                write_summary(&paths.summary(), &summary)?;
                info!(path = %paths.summary().display(), "wrote summary");
                if json_output {
                    print_json(&serde_json::json!({ "summary": summary }))?;
                } else {
                    for s in summary {
                        println!(
                            "{} {} {}",
                            s.patch_id,
                            format_distance(s.passing.max),
                            format_distance(s.failing.min)
                        );
                    }
                }
            }
        }
        Ok(())
    }
}
