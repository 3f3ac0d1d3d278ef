//! Filesystem layout of a run.

use anyhow::{anyhow, Result};
use std::path::{Path, PathBuf};

/// Directory holding per-user objsim files (`$OBJSIM_HOME` or `~/.objsim`).
pub fn objsim_home() -> PathBuf {
    std::env::var("OBJSIM_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".objsim")
        })
}

/// Layout of the output directory.
#[derive(Debug, Clone)]
pub struct OutputPaths {
    root: PathBuf,
}

impl OutputPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Persisted index domains shared by the discovery and capture runs.
    pub fn index_dir(&self) -> PathBuf {
        self.root.join("index")
    }

    /// Backups of installed class files while a patch is applied.
    pub fn backup_dir(&self) -> PathBuf {
        self.root.join(".backup")
    }

    pub fn patch_dir(&self, patch_id: u64) -> PathBuf {
        self.root.join(format!("patch-{}", patch_id))
    }

    pub fn raw_distances(&self, patch_id: u64) -> PathBuf {
        self.patch_dir(patch_id).join("raw-dist.csv")
    }

    pub fn snapshot_archive(&self, patch_id: u64, variant: &str) -> PathBuf {
        self.patch_dir(patch_id).join(format!("{}.json.gz", variant))
    }

    pub fn ranking(&self) -> PathBuf {
        self.root.join("ranking.txt")
    }

    pub fn summary(&self) -> PathBuf {
        self.root.join("summary.csv")
    }

    pub fn run_metadata(&self) -> PathBuf {
        self.root.join("run_metadata.json")
    }
}

/// Ensure all parent directories exist for a path.
pub fn ensure_parent_dirs(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| anyhow!("Failed to create directory {}: {}", parent.display(), e))?;
    }
    Ok(())
}

/// Write a file atomically (write to .tmp, then rename).
pub fn atomic_write(path: &Path, contents: &[u8]) -> Result<()> {
    ensure_parent_dirs(path)?;
    let tmp_path = path.with_extension(format!(
        "{}.tmp",
        path.extension().and_then(|s| s.to_str()).unwrap_or("tmp")
    ));
    std::fs::write(&tmp_path, contents)
        .map_err(|e| anyhow!("Failed to write temp file {}: {}", tmp_path.display(), e))?;
    std::fs::rename(&tmp_path, path).map_err(|e| {
        anyhow!(
            "Failed to rename {} to {}: {}",
            tmp_path.display(),
            path.display(),
            e
        )
    })?;
    Ok(())
}

/// Write a pretty-printed JSON file atomically.
pub fn atomic_write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let json =
        serde_json::to_vec_pretty(value).map_err(|e| anyhow!("Failed to serialize JSON: {}", e))?;
    atomic_write(path, &json)
}
