//! The evaluation pipeline.
//!
//! One run: discovery once over every patched method and test, then each
//! patch in input order (the build directory is shared, so never two at a
//! time): capture the original program, install the patch, capture again,
//! restore, and turn the two snapshot sets into distance samples. After the
//! last patch the configured ranking scheme writes its artifact.
//!
//! Abnormal worker sessions are not errors here; whatever they reported is
//! used and the missing rest becomes `+inf`. Errors returned from
//! [`Evaluation::run`] abort the run.

use anyhow::{Context, Result};
use std::collections::BTreeSet;
use tracing::{error, info, warn};

use objsim_types::{CaptureRequest, DiscoveryRequest, TestId};

use crate::config::ObjSimConfig;
use crate::distance::{DistanceEngine, DistanceSample};
use crate::input::{parse_test_names, PatchRecord};
use crate::patcher::PatchTransaction;
use crate::paths::OutputPaths;
use crate::profiler::{DiscoveryResults, Profiler};
use crate::ranking::{borda_rank, summarize, PatchEvaluation, PatchSummary, RankingScheme};
use crate::report::{self, PatchRunInfo, RunMetadata};

/// Session label suffixes, also used as snapshot archive names.
const ORIGINAL: &str = "original";
const PATCHED: &str = "patched";

#[derive(Debug, Clone)]
pub struct EvaluationOutput {
    pub metadata: RunMetadata,
    pub evaluations: Vec<PatchEvaluation>,
    /// Set under the Borda scheme.
    pub ranking: Option<Vec<u64>>,
    /// Set under the summary scheme.
    pub summary: Option<Vec<PatchSummary>>,
}

pub struct Evaluation<P> {
    config: ObjSimConfig,
    profiler: P,
    paths: OutputPaths,
    engine: DistanceEngine,
}

impl<P: Profiler> Evaluation<P> {
    pub fn new(config: ObjSimConfig, profiler: P) -> Self {
        let paths = OutputPaths::new(config.output_dir());
        let engine = DistanceEngine::new(config.slot_policy);
        Self {
            config,
            profiler,
            paths,
            engine,
        }
    }

    pub fn paths(&self) -> &OutputPaths {
        &self.paths
    }

    pub async fn run(&self, records: &[PatchRecord]) -> Result<EvaluationOutput> {
        let mut metadata = RunMetadata::new(self.config.ranking, self.config.slot_policy);
        info!(
            run_id = %metadata.run_id,
            patches = records.len(),
            ranking = ?self.config.ranking,
            slot_policy = ?self.config.slot_policy,
            "starting evaluation"
        );
        if records.is_empty() {
            warn!("no patch records to evaluate");
        }
        std::fs::create_dir_all(self.paths.root()).with_context(|| {
            format!("Failed to create output dir {}", self.paths.root().display())
        })?;

        let discovery = self
            .profiler
            .discover(self.discovery_request(records)?)
            .await
            .context("discovery stage failed")?;
        metadata.discovery = Some(discovery.outcome.clone());

        let failing = self.failing_oracle(&discovery)?;
        metadata.failing_tests = failing.iter().cloned().collect();
        info!(failing = failing.len(), "failing-test oracle ready");

        let mut evaluations = Vec::with_capacity(records.len());
        for record in records {
            let result = self
                .evaluate_patch(record, &discovery, &failing)
                .await
                .with_context(|| format!("patch {}", record.id));
            match result {
                Ok((evaluation, run_info)) => {
                    metadata.patches.push(run_info);
                    evaluations.push(evaluation);
                }
                Err(e) => {
                    error!(patch_id = record.id, error = %format!("{:#}", e), "aborting run");
                    metadata.finish();
                    // The metadata is best effort here; the patch error wins.
                    if let Err(save_err) = metadata.save(&self.paths.run_metadata()) {
                        warn!(error = %save_err, "could not save run metadata");
                    }
                    return Err(e);
                }
            }
        }

        let (ranking, summary) = match self.config.ranking {
            RankingScheme::Borda => {
                let ranking = borda_rank(&evaluations);
                report::write_ranking(&self.paths.ranking(), &ranking)?;
                info!(path = %self.paths.ranking().display(), "wrote ranking");
                (Some(ranking), None)
            }
            RankingScheme::Summary => {
                let summary = summarize(&evaluations);
                report::write_summary(&self.paths.summary(), &summary)?;
                info!(path = %self.paths.summary().display(), "wrote summary");
                (None, Some(summary))
            }
        };

        metadata.finish();
        metadata.save(&self.paths.run_metadata())?;
        Ok(EvaluationOutput {
            metadata,
            evaluations,
            ranking,
            summary,
        })
    }

    /// Discovery runs the union of every record's tests, the configured
    /// discovery tests and the configured failing tests.
    fn discovery_request(&self, records: &[PatchRecord]) -> Result<DiscoveryRequest> {
        let mut tests: BTreeSet<TestId> = parse_test_names(&self.config.discovery_tests)
            .context("invalid discovery_tests")?;
        tests.extend(parse_test_names(&self.config.failing_tests).context("invalid failing_tests")?);
        let mut methods = BTreeSet::new();
        for record in records {
            tests.extend(record.covering_tests.iter().cloned());
            methods.extend(record.patched_methods.iter().cloned());
        }
        Ok(DiscoveryRequest {
            tests: tests.into_iter().collect(),
            patched_methods: methods.into_iter().collect(),
            app_class_globs: self.config.app_class_globs.clone(),
            index_dir: self.paths.index_dir(),
            test_timeout_ms: self.config.test_timeout_ms,
        })
    }

    fn failing_oracle(&self, discovery: &DiscoveryResults) -> Result<BTreeSet<TestId>> {
        if self.config.failing_tests.is_empty() {
            return Ok(discovery.failing_tests.clone());
        }
        parse_test_names(&self.config.failing_tests).context("invalid failing_tests")
    }

    async fn evaluate_patch(
        &self,
        record: &PatchRecord,
        discovery: &DiscoveryResults,
        failing: &BTreeSet<TestId>,
    ) -> Result<(PatchEvaluation, PatchRunInfo)> {
        let targets = discovery.capture_targets(&record.patched_methods)?;
        let covering = if record.covering_tests.is_empty() {
            let indices = targets.iter().map(|t| t.method_index).collect();
            discovery.covering_tests(&indices)
        } else {
            record.covering_tests.clone()
        };
        if covering.is_empty() {
            warn!(patch_id = record.id, "no covering tests");
        }
        info!(
            patch_id = record.id,
            targets = targets.len(),
            tests = covering.len(),
            "evaluating patch"
        );

        let request = CaptureRequest {
            tests: covering.iter().cloned().collect(),
            targets,
            index_dir: self.paths.index_dir(),
            test_timeout_ms: self.config.test_timeout_ms,
            snapshot_limit: self.config.snapshot_limit,
        };

        let original = self
            .profiler
            .capture(&session_label(record.id, ORIGINAL), request.clone())
            .await?;

        let txn = PatchTransaction::apply(
            record.id,
            &self.config.build_dir(),
            &record.class_files,
            &self.paths.backup_dir(),
        )?;
        let patched = self
            .profiler
            .capture(&session_label(record.id, PATCHED), request)
            .await;
        txn.restore()
            .context("build directory could not be restored")?;
        let patched = patched?;

        let samples: Vec<DistanceSample> = covering
            .iter()
            .flat_map(|test| {
                self.engine.sample_distances(
                    test,
                    failing.contains(test),
                    original.snapshots.get(test).map(Vec::as_slice),
                    patched.snapshots.get(test).map(Vec::as_slice),
                )
            })
            .collect();
        let infinite = samples.iter().filter(|s| s.distance.is_infinite()).count();
        if infinite > 0 {
            warn!(patch_id = record.id, infinite, "patch has unpaired snapshots");
        }

        report::write_raw_distances(&self.paths.raw_distances(record.id), &samples)?;
        if self.config.persist_snapshots {
            report::write_snapshot_archive(
                &self.paths.snapshot_archive(record.id, ORIGINAL),
                &original.snapshots,
            )?;
            report::write_snapshot_archive(
                &self.paths.snapshot_archive(record.id, PATCHED),
                &patched.snapshots,
            )?;
        }

        let run_info = PatchRunInfo {
            patch_id: record.id,
            covering_tests: covering.len(),
            samples: samples.len(),
            infinite_samples: infinite,
            original: original.outcome,
            patched: patched.outcome,
        };
        let evaluation = PatchEvaluation {
            patch_id: record.id,
            suspiciousness: record.suspiciousness,
            label: record.label.clone(),
            covering_tests: covering,
            samples,
        };
        Ok((evaluation, run_info))
    }
}

fn session_label(patch_id: u64, variant: &str) -> String {
    format!("patch-{}-{}", patch_id, variant)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class_file::synthesize;
    use crate::errors::is_fatal;
    use crate::index_domain::IndexDomain;
    use crate::profiler::CaptureResults;
    use crate::session::SessionOutcome;
    use async_trait::async_trait;
    use objsim_types::{DomainKind, ExitSnapshot, Snapshot, WorkerExitCode};
    use parking_lot::Mutex;
    use std::collections::BTreeMap;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    const FAILING: &str = "a.FooTest.fails";
    const PASSING: &str = "a.FooTest.passes";

    fn tid(name: &str) -> TestId {
        TestId::parse(name).unwrap()
    }

    fn done() -> SessionOutcome {
        SessionOutcome::Done {
            exit_code: WorkerExitCode::OK,
        }
    }

    fn exits(value: i64) -> Vec<ExitSnapshot> {
        vec![ExitSnapshot::new(vec![Snapshot::Int(value)])]
    }

    /// Replays canned snapshots. The patched capture of a patch returns the
    /// snapshots registered for it; every original capture returns the same.
    #[derive(Default)]
    struct FakeProfiler {
        original: BTreeMap<TestId, Vec<ExitSnapshot>>,
        patched: BTreeMap<u64, BTreeMap<TestId, Vec<ExitSnapshot>>>,
        coverage: BTreeMap<TestId, BTreeSet<u32>>,
        discovered_failing: BTreeSet<TestId>,
        /// Delete the backups while this patch is installed.
        sabotage_backup: Option<(u64, PathBuf)>,
        labels: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Profiler for FakeProfiler {
        async fn discover(&self, _request: DiscoveryRequest) -> Result<DiscoveryResults> {
            Ok(DiscoveryResults {
                outcome: done(),
                methods: IndexDomain::from_names(DomainKind::Methods, ["a.Foo.m()", "a.Foo.n()"]),
                fields: IndexDomain::from_names(DomainKind::Fields, ["a.Foo.count"]),
                coverage: self.coverage.clone(),
                field_accesses: BTreeMap::new(),
                failing_tests: self.discovered_failing.clone(),
            })
        }

        async fn capture(&self, label: &str, _request: CaptureRequest) -> Result<CaptureResults> {
            self.labels.lock().push(label.to_string());
            let patch_id: u64 = label
                .trim_start_matches("patch-")
                .split('-')
                .next()
                .and_then(|id| id.parse().ok())
                .unwrap();
            if label.ends_with(PATCHED) {
                if let Some((id, backup_dir)) = &self.sabotage_backup {
                    if *id == patch_id {
                        std::fs::remove_dir_all(backup_dir)?;
                    }
                }
                return Ok(CaptureResults {
                    outcome: done(),
                    snapshots: self.patched.get(&patch_id).cloned().unwrap_or_default(),
                });
            }
            Ok(CaptureResults {
                outcome: done(),
                snapshots: self.original.clone(),
            })
        }
    }

    struct Project {
        _dir: TempDir,
        root: PathBuf,
        config: ObjSimConfig,
    }

    impl Project {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let root = dir.path().to_path_buf();
            let classes = root.join("classes/a");
            std::fs::create_dir_all(&classes).unwrap();
            std::fs::write(classes.join("Foo.class"), synthesize("a/Foo", "original")).unwrap();
            let config = ObjSimConfig {
                base_dir: root.clone(),
                build_dir: Some(PathBuf::from("classes")),
                output_dir: Some(PathBuf::from("out")),
                failing_tests: vec![FAILING.to_string()],
                ..ObjSimConfig::default()
            };
            Self {
                _dir: dir,
                root,
                config,
            }
        }

        fn patch_file(&self, id: u64) -> PathBuf {
            let path = self.root.join(format!("patches/{}/Foo.class", id));
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, synthesize("a/Foo", &format!("patch {}", id))).unwrap();
            path
        }

        fn record(&self, id: u64, susp: Option<f64>, tests: &[&str]) -> PatchRecord {
            PatchRecord {
                id,
                suspiciousness: susp,
                label: None,
                patched_methods: ["a.Foo.m()".to_string()].into_iter().collect(),
                class_files: vec![self.patch_file(id)],
                covering_tests: tests.iter().map(|t| tid(t)).collect(),
            }
        }

        fn installed(&self) -> Vec<u8> {
            std::fs::read(self.root.join("classes/a/Foo.class")).unwrap()
        }
    }

    fn two_patch_profiler() -> FakeProfiler {
        let mut profiler = FakeProfiler::default();
        profiler.original.insert(tid(FAILING), exits(1));
        profiler.original.insert(tid(PASSING), exits(5));
        let mut p1 = BTreeMap::new();
        p1.insert(tid(FAILING), exits(4));
        p1.insert(tid(PASSING), exits(5));
        let mut p2 = BTreeMap::new();
        p2.insert(tid(FAILING), exits(2));
        p2.insert(tid(PASSING), exits(9));
        profiler.patched.insert(1, p1);
        profiler.patched.insert(2, p2);
        profiler
    }

    #[tokio::test]
    async fn test_borda_run_writes_artifacts() -> Result<()> {
        let project = Project::new();
        let records = vec![
            project.record(1, Some(0.5), &[FAILING, PASSING]),
            project.record(2, Some(0.9), &[FAILING, PASSING]),
        ];
        let evaluation = Evaluation::new(project.config.clone(), two_patch_profiler());
        let output = evaluation.run(&records).await?;

        // Patch 1 moves the failing test further and keeps the passing one.
        assert_eq!(output.ranking, Some(vec![1, 2]));
        let paths = evaluation.paths();
        assert_eq!(std::fs::read_to_string(paths.ranking())?, "1\n2\n");
        let raw = report::read_raw_distances(&paths.raw_distances(1))?;
        assert_eq!(raw.len(), 2);
        assert!(raw.iter().any(|s| s.was_failing && s.distance == 3.0));
        assert!(paths.run_metadata().exists());
        assert!(!paths.snapshot_archive(1, ORIGINAL).exists());

        assert_eq!(project.installed(), synthesize("a/Foo", "original"));
        assert_eq!(output.metadata.patches.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_summary_run_writes_summary_only() -> Result<()> {
        let mut project = Project::new();
        project.config.ranking = RankingScheme::Summary;
        project.config.persist_snapshots = true;
        let records = vec![project.record(1, None, &[FAILING, PASSING])];
        let evaluation = Evaluation::new(project.config.clone(), two_patch_profiler());
        let output = evaluation.run(&records).await?;

        let summary = output.summary.unwrap();
        assert_eq!(summary[0].failing.max, 3.0);
        assert_eq!(summary[0].passing.max, 0.0);
        let paths = evaluation.paths();
        assert!(paths.summary().exists());
        assert!(!paths.ranking().exists());
        assert_eq!(
            report::read_snapshot_archive(&paths.snapshot_archive(1, PATCHED))?[&tid(FAILING)],
            exits(4)
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_patched_snapshots_are_infinite() -> Result<()> {
        let project = Project::new();
        let mut profiler = two_patch_profiler();
        profiler.patched.get_mut(&1).unwrap().remove(&tid(PASSING));
        let records = vec![project.record(1, None, &[FAILING, PASSING])];
        let output = Evaluation::new(project.config.clone(), profiler)
            .run(&records)
            .await?;
        let samples = &output.evaluations[0].samples;
        assert!(samples
            .iter()
            .any(|s| s.test == tid(PASSING) && s.distance.is_infinite()));
        assert_eq!(output.metadata.patches[0].infinite_samples, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_coverage_and_discovered_failures_fill_gaps() -> Result<()> {
        let mut project = Project::new();
        project.config.failing_tests.clear();
        let mut profiler = two_patch_profiler();
        profiler.coverage.insert(tid(FAILING), [0].into_iter().collect());
        profiler.coverage.insert(tid(PASSING), [1].into_iter().collect());
        profiler.discovered_failing.insert(tid(FAILING));
        let records = vec![project.record(1, None, &[])];
        let output = Evaluation::new(project.config.clone(), profiler)
            .run(&records)
            .await?;

        let eval = &output.evaluations[0];
        assert_eq!(
            eval.covering_tests.iter().cloned().collect::<Vec<_>>(),
            vec![tid(FAILING)]
        );
        assert!(eval.samples.iter().all(|s| s.was_failing));
        assert_eq!(output.metadata.failing_tests, vec![tid(FAILING)]);
        Ok(())
    }

    #[tokio::test]
    async fn test_unresolved_patched_method_aborts() -> Result<()> {
        let project = Project::new();
        let mut record = project.record(1, None, &[FAILING]);
        record.patched_methods = ["a.Foo.gone()".to_string()].into_iter().collect();
        let profiler = two_patch_profiler();
        let evaluation = Evaluation::new(project.config.clone(), profiler);
        let err = evaluation.run(&[record]).await.unwrap_err();
        assert!(is_fatal(&err));
        assert!(evaluation.profiler.labels.lock().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_restore_stops_remaining_patches() -> Result<()> {
        let project = Project::new();
        let backup_dir = project.root.join("out/.backup");
        let mut profiler = two_patch_profiler();
        profiler.sabotage_backup = Some((1, backup_dir));
        let records = vec![
            project.record(1, None, &[FAILING]),
            project.record(2, None, &[FAILING]),
        ];
        let evaluation = Evaluation::new(project.config.clone(), profiler);
        let err = evaluation.run(&records).await.unwrap_err();

        assert!(is_fatal(&err));
        assert!(format!("{:#}", err).contains("patch 1"));
        let labels = evaluation.profiler.labels.lock().clone();
        assert_eq!(labels, vec!["patch-1-original", "patch-1-patched"]);
        assert!(!evaluation.paths().ranking().exists());
        Ok(())
    }

    #[test]
    fn test_discovery_request_unions_tests_and_methods() {
        let project = Project::new();
        let mut config = project.config.clone();
        config.discovery_tests = vec!["a.OtherTest.extra".to_string()];
        let evaluation = Evaluation::new(config, FakeProfiler::default());
        let mut second = project.record(2, None, &[PASSING]);
        second.patched_methods.insert("a.Foo.n()".to_string());
        let request = evaluation
            .discovery_request(&[project.record(1, None, &[FAILING]), second])
            .unwrap();
        assert_eq!(request.tests.len(), 3);
        assert_eq!(request.patched_methods, vec!["a.Foo.m()", "a.Foo.n()"]);
        assert_eq!(request.index_dir, Path::new(&project.root).join("out/index"));
    }
}
