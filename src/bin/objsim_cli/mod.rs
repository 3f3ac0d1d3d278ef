//! CLI subcommand implementations for objsim

pub mod check;
pub mod rank;
pub mod run;

use anyhow::{Context, Result};
use clap::{Args, ValueEnum};
use std::path::PathBuf;
use tracing::debug;

use objsim::config::ObjSimConfig;
use objsim::distance::SlotPolicy;
use objsim::input::read_test_list;
use objsim::ranking::RankingScheme;

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum RankingArg {
    Borda,
    Summary,
}

impl From<RankingArg> for RankingScheme {
    fn from(arg: RankingArg) -> Self {
        match arg {
            RankingArg::Borda => RankingScheme::Borda,
            RankingArg::Summary => RankingScheme::Summary,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum SlotPolicyArg {
    CompareAll,
    SkipOutcomeSlotForFailing,
}

impl From<SlotPolicyArg> for SlotPolicy {
    fn from(arg: SlotPolicyArg) -> Self {
        match arg {
            SlotPolicyArg::CompareAll => SlotPolicy::CompareAll,
            SlotPolicyArg::SkipOutcomeSlotForFailing => SlotPolicy::SkipOutcomeSlotForFailing,
        }
    }
}

/// Options locating the project and overriding its configuration file.
#[derive(Args, Debug, Clone)]
pub struct ProjectArgs {
    /// Project root; relative paths resolve against it
    #[arg(long, default_value = ".")]
    base_dir: PathBuf,

    /// Configuration file (default: $OBJSIM_CONFIG, <base>/objsim.json, ~/.objsim/config.json)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory holding the installed class files
    #[arg(long)]
    build_dir: Option<PathBuf>,

    /// Patch records CSV
    #[arg(long)]
    input: Option<PathBuf>,

    /// Output directory
    #[arg(long)]
    output: Option<PathBuf>,

    /// File listing the originally failing tests (whitespace separated)
    #[arg(long)]
    failing_tests: Option<PathBuf>,

    /// Ranking scheme
    #[arg(long, value_enum)]
    ranking: Option<RankingArg>,
}

impl ProjectArgs {
    /// Resolve the configuration file and apply the flags on top of it.
    pub fn load_config(&self) -> Result<ObjSimConfig> {
        let (mut config, source) = ObjSimConfig::resolve(self.config.as_deref(), &self.base_dir)?;
        match &source {
            Some(path) => debug!(path = %path.display(), "loaded config"),
            None => debug!("no config file, using defaults"),
        }
        if let Some(dir) = &self.build_dir {
            config.build_dir = Some(dir.clone());
        }
        if let Some(input) = &self.input {
            config.input_csv = Some(input.clone());
        }
        if let Some(output) = &self.output {
            config.output_dir = Some(output.clone());
        }
        if let Some(path) = &self.failing_tests {
            config.failing_tests = read_test_list(path)?
                .into_iter()
                .map(|t| t.to_string())
                .collect();
        }
        if let Some(ranking) = self.ranking {
            config.ranking = ranking.into();
        }
        config.validate().context("invalid configuration")?;
        Ok(config)
    }
}

pub fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("serialize output")?
    );
    Ok(())
}

pub fn format_distance(d: f64) -> String {
    if d.is_infinite() {
        "inf".to_string()
    } else {
        format!("{:.3}", d)
    }
}
