//! Output artifacts of an evaluation run.
//!
//! Layout under the output directory (see [`OutputPaths`](crate::paths::OutputPaths)):
//!
//! ```text
//! patch-<id>/raw-dist.csv        test,was_failing,distance  (inf for +inf)
//! patch-<id>/original.json.gz    optional, one JSON object per test
//! patch-<id>/patched.json.gz
//! ranking.txt                    borda scheme, one patch id per line
//! summary.csv                    summary scheme
//! run_metadata.json
//! ```

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::{Compression, GzBuilder};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use objsim_types::{ExitSnapshot, TestId};

use crate::distance::{DistanceSample, SlotPolicy};
use crate::paths::{atomic_write, atomic_write_json};
use crate::ranking::{PatchSummary, RankingScheme};
use crate::session::SessionOutcome;

const RAW_DISTANCE_HEADER: [&str; 3] = ["test", "was_failing", "distance"];
const SUMMARY_HEADER: [&str; 8] = [
    "patch_id", "pass_min", "pass_avg", "pass_max", "fail_min", "fail_avg", "fail_max", "label",
];

fn format_distance(d: f64) -> String {
    if d.is_infinite() {
        "inf".to_string()
    } else {
        d.to_string()
    }
}

fn parse_distance(raw: &str) -> Result<f64> {
    match raw.trim() {
        "inf" | "+inf" => Ok(f64::INFINITY),
        other => other
            .parse()
            .with_context(|| format!("invalid distance '{}'", other)),
    }
}

pub fn write_raw_distances(path: &Path, samples: &[DistanceSample]) -> Result<()> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(RAW_DISTANCE_HEADER)?;
    for sample in samples {
        writer.write_record([
            sample.test.as_str().to_string(),
            sample.was_failing.to_string(),
            format_distance(sample.distance),
        ])?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|e| anyhow::anyhow!("Failed to flush raw distances: {}", e))?;
    atomic_write(path, &bytes)
}

pub fn read_raw_distances(path: &Path) -> Result<Vec<DistanceSample>> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("Failed to read CSV: {}", path.display()))?;
    let mut samples = Vec::new();
    for (i, rec) in reader.records().enumerate() {
        let record = rec.with_context(|| {
            format!("Failed to read CSV record {} in {}", i + 1, path.display())
        })?;
        let field = |idx: usize| record.get(idx).unwrap_or_default();
        samples.push(DistanceSample {
            test: TestId::parse(field(0))
                .with_context(|| format!("{} record {}", path.display(), i + 1))?,
            was_failing: field(1).trim() == "true",
            distance: parse_distance(field(2))
                .with_context(|| format!("{} record {}", path.display(), i + 1))?,
        });
    }
    Ok(samples)
}

#[derive(Debug, Serialize, Deserialize)]
struct ArchivedTest {
    test: TestId,
    exits: Vec<ExitSnapshot>,
}

/// Gzip-compressed JSON lines, one object per test.
pub fn write_snapshot_archive(
    path: &Path,
    snapshots: &BTreeMap<TestId, Vec<ExitSnapshot>>,
) -> Result<()> {
    let mut out = Vec::new();
    {
        let mut enc = GzBuilder::new().mtime(0).write(&mut out, Compression::default());
        for (test, exits) in snapshots {
            let line = serde_json::to_string(&ArchivedTest {
                test: test.clone(),
                exits: exits.clone(),
            })?;
            enc.write_all(line.as_bytes())?;
            enc.write_all(b"\n")?;
        }
        enc.finish().context("gzip finish failed")?;
    }
    atomic_write(path, &out)
}

pub fn read_snapshot_archive(path: &Path) -> Result<BTreeMap<TestId, Vec<ExitSnapshot>>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let mut snapshots = BTreeMap::new();
    for (i, line) in BufReader::new(GzDecoder::new(file)).lines().enumerate() {
        let line = line.with_context(|| format!("Failed to read {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let archived: ArchivedTest = serde_json::from_str(&line)
            .with_context(|| format!("Invalid JSONL at {} line {}", path.display(), i + 1))?;
        snapshots.insert(archived.test, archived.exits);
    }
    Ok(snapshots)
}

pub fn write_ranking(path: &Path, ranking: &[u64]) -> Result<()> {
    let mut out = String::new();
    for id in ranking {
        out.push_str(&id.to_string());
        out.push('\n');
    }
    atomic_write(path, out.as_bytes())
}

pub fn write_summary(path: &Path, summaries: &[PatchSummary]) -> Result<()> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(SUMMARY_HEADER)?;
    for s in summaries {
        writer.write_record([
            s.patch_id.to_string(),
            format_distance(s.passing.min),
            format_distance(s.passing.avg),
            format_distance(s.passing.max),
            format_distance(s.failing.min),
            format_distance(s.failing.avg),
            format_distance(s.failing.max),
            s.label.clone().unwrap_or_default(),
        ])?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|e| anyhow::anyhow!("Failed to flush summary: {}", e))?;
    atomic_write(path, &bytes)
}

/// Per-patch record in `run_metadata.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchRunInfo {
    pub patch_id: u64,
    pub covering_tests: usize,
    pub samples: usize,
    pub infinite_samples: usize,
    pub original: SessionOutcome,
    pub patched: SessionOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetadata {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub ranking: RankingScheme,
    pub slot_policy: SlotPolicy,
    pub discovery: Option<SessionOutcome>,
    pub failing_tests: Vec<TestId>,
    pub patches: Vec<PatchRunInfo>,
}

impl RunMetadata {
    pub fn new(ranking: RankingScheme, slot_policy: SlotPolicy) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            started_at: Utc::now(),
            finished_at: None,
            ranking,
            slot_policy,
            discovery: None,
            failing_tests: Vec::new(),
            patches: Vec::new(),
        }
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        atomic_write_json(path, self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distance::Aggregate;
    use objsim_types::Snapshot;
    use tempfile::TempDir;

    fn tid(name: &str) -> TestId {
        TestId::parse(name).unwrap()
    }

    #[test]
    fn test_raw_distances_write_inf() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("patch-1/raw-dist.csv");
        let samples = vec![
            DistanceSample {
                test: tid("a.T.one"),
                was_failing: true,
                distance: 1.5,
            },
            DistanceSample {
                test: tid("a.T.two"),
                was_failing: false,
                distance: f64::INFINITY,
            },
        ];
        write_raw_distances(&path, &samples)?;

        let text = std::fs::read_to_string(&path)?;
        assert!(text.starts_with("test,was_failing,distance\n"));
        assert!(text.contains("a.T.two,false,inf"));
        assert_eq!(read_raw_distances(&path)?, samples);
        Ok(())
    }

    #[test]
    fn test_snapshot_archive_is_gzip_json_lines() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("original.json.gz");
        let mut snapshots = BTreeMap::new();
        snapshots.insert(
            tid("a.T.one"),
            vec![ExitSnapshot::new(vec![Snapshot::Int(3), Snapshot::Null])],
        );
        write_snapshot_archive(&path, &snapshots)?;

        let bytes = std::fs::read(&path)?;
        assert_eq!(&bytes[..2], &[0x1f, 0x8b]);
        assert_eq!(read_snapshot_archive(&path)?, snapshots);
        Ok(())
    }

    #[test]
    fn test_summary_and_ranking_files() -> Result<()> {
        let dir = TempDir::new()?;
        write_ranking(&dir.path().join("ranking.txt"), &[3, 1, 2])?;
        assert_eq!(
            std::fs::read_to_string(dir.path().join("ranking.txt"))?,
            "3\n1\n2\n"
        );

        let summary = vec![PatchSummary {
            patch_id: 7,
            passing: Aggregate::default(),
            failing: Aggregate::INFINITE,
            label: Some("correct".into()),
        }];
        write_summary(&dir.path().join("summary.csv"), &summary)?;
        let text = std::fs::read_to_string(dir.path().join("summary.csv"))?;
        assert_eq!(
            text.lines().nth(1),
            Some("7,0,0,0,inf,inf,inf,correct")
        );
        Ok(())
    }
}
