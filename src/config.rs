//! Run configuration.
//!
//! Configuration is a JSON file; every field has a default. The file is
//! looked up in this order:
//!
//! 1. explicit path (`--config`)
//! 2. `OBJSIM_CONFIG`
//! 3. `<base_dir>/objsim.json`
//! 4. `$OBJSIM_HOME/config.json` (default `~/.objsim/config.json`)
//!
//! Relative paths inside the configuration resolve against `base_dir`.

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::distance::SlotPolicy;
use crate::paths::objsim_home;
use crate::ranking::RankingScheme;

pub const CONFIG_FILE_NAME: &str = "objsim.json";

/// How to launch a worker process.
///
/// `args` may contain the placeholders `{addr}`, `{port}`, `{stage}` and
/// `{build_dir}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub command: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: Option<PathBuf>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            command: "objsim-worker".to_string(),
            args: vec![
                "--connect".to_string(),
                "{addr}".to_string(),
                "--build-dir".to_string(),
                "{build_dir}".to_string(),
            ],
            env: BTreeMap::new(),
            cwd: None,
        }
    }
}

/// Values substituted into worker arguments.
#[derive(Debug, Clone)]
pub struct WorkerVars<'a> {
    pub addr: &'a str,
    pub port: u16,
    pub stage: &'a str,
    pub build_dir: &'a Path,
}

impl WorkerConfig {
    pub fn expand_args(&self, vars: &WorkerVars<'_>) -> Vec<String> {
        let build_dir = vars.build_dir.display().to_string();
        let port = vars.port.to_string();
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{addr}", vars.addr)
                    .replace("{port}", &port)
                    .replace("{stage}", vars.stage)
                    .replace("{build_dir}", &build_dir)
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjSimConfig {
    /// Project root; relative paths resolve against it.
    pub base_dir: PathBuf,
    /// Installed class files (default `<base>/target/classes`).
    pub build_dir: Option<PathBuf>,
    /// Patch records (default `<base>/input-file.csv`).
    pub input_csv: Option<PathBuf>,
    /// Output directory (default `<base>/objsim-output`).
    pub output_dir: Option<PathBuf>,
    /// Tests known to fail on the original program. When empty, the failing
    /// tests reported by discovery are used.
    pub failing_tests: Vec<String>,
    /// Extra tests to run during discovery.
    pub discovery_tests: Vec<String>,
    /// Glob patterns of application classes to instrument for coverage.
    pub app_class_globs: Vec<String>,
    pub worker: WorkerConfig,
    pub session_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub test_timeout_ms: u64,
    /// Exits kept per test and run; zero keeps all.
    pub snapshot_limit: usize,
    pub ranking: RankingScheme,
    pub slot_policy: SlotPolicy,
    /// Keep gzipped snapshot archives next to the distances.
    pub persist_snapshots: bool,
}

impl Default for ObjSimConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("."),
            build_dir: None,
            input_csv: None,
            output_dir: None,
            failing_tests: Vec::new(),
            discovery_tests: Vec::new(),
            app_class_globs: Vec::new(),
            worker: WorkerConfig::default(),
            session_timeout_secs: 600,
            connect_timeout_secs: 60,
            test_timeout_ms: 60_000,
            snapshot_limit: 5,
            ranking: RankingScheme::default(),
            slot_policy: SlotPolicy::default(),
            persist_snapshots: false,
        }
    }
}

impl ObjSimConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config JSON: {}", path.display()))?;
        Ok(config)
    }

    /// Find and load the configuration. Returns the file used, if any.
    pub fn resolve(explicit: Option<&Path>, base_dir: &Path) -> Result<(Self, Option<PathBuf>)> {
        if let Some(path) = explicit {
            if !path.exists() {
                return Err(anyhow!("Config not found: {}", path.display()));
            }
        }
        let candidate = explicit
            .map(Path::to_path_buf)
            .or_else(|| std::env::var("OBJSIM_CONFIG").ok().map(PathBuf::from))
            .or_else(|| Some(base_dir.join(CONFIG_FILE_NAME)).filter(|p| p.exists()))
            .or_else(|| Some(objsim_home().join("config.json")).filter(|p| p.exists()));

        match candidate {
            Some(path) if path.exists() => {
                let mut config = Self::load(&path)?;
                if config.base_dir.is_relative() {
                    config.base_dir = base_dir.join(&config.base_dir);
                }
                Ok((config, Some(path)))
            }
            _ => Ok((
                Self {
                    base_dir: base_dir.to_path_buf(),
                    ..Self::default()
                },
                None,
            )),
        }
    }

    fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    pub fn build_dir(&self) -> PathBuf {
        match &self.build_dir {
            Some(p) => self.resolve_path(p),
            None => self.base_dir.join("target").join("classes"),
        }
    }

    pub fn input_csv(&self) -> PathBuf {
        match &self.input_csv {
            Some(p) => self.resolve_path(p),
            None => self.base_dir.join("input-file.csv"),
        }
    }

    pub fn output_dir(&self) -> PathBuf {
        match &self.output_dir {
            Some(p) => self.resolve_path(p),
            None => self.base_dir.join("objsim-output"),
        }
    }

    pub fn worker_cwd(&self) -> PathBuf {
        match &self.worker.cwd {
            Some(p) => self.resolve_path(p),
            None => self.base_dir.clone(),
        }
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker.command.trim().is_empty() {
            bail!("worker.command must not be empty");
        }
        if self.session_timeout_secs == 0 {
            bail!("session_timeout_secs must be positive");
        }
        if self.test_timeout_ms == 0 {
            bail!("test_timeout_ms must be positive");
        }
        Ok(())
    }
}
