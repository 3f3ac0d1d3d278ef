//! The two profiling stages as seen from the orchestrator.
//!
//! [`Profiler`] is the seam between the evaluation pipeline and the worker
//! processes; [`ProcessProfiler`] implements it with one [`ProcessSession`]
//! per stage run.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{info, warn};

use objsim_types::{
    CaptureRequest, CaptureTarget, DiscoveryRequest, DomainKind, ExitSnapshot, TestId,
    WorkerRequest,
};

use crate::errors::ObjSimError;
use crate::index_domain::IndexDomain;
use crate::session::{ProcessSession, SessionOptions, SessionOutcome, SessionResults};

/// What discovery learned about the unpatched program.
#[derive(Debug, Clone)]
pub struct DiscoveryResults {
    pub outcome: SessionOutcome,
    pub methods: IndexDomain,
    pub fields: IndexDomain,
    /// Test -> indices of the methods it covers.
    pub coverage: BTreeMap<TestId, BTreeSet<u32>>,
    /// Patched method index -> fields accessed while it was on the stack.
    pub field_accesses: BTreeMap<u32, BTreeSet<u32>>,
    pub failing_tests: BTreeSet<TestId>,
}

impl DiscoveryResults {
    /// Tests whose coverage includes any of `methods`.
    pub fn covering_tests(&self, methods: &BTreeSet<u32>) -> BTreeSet<TestId> {
        self.coverage
            .iter()
            .filter(|(_, covered)| !covered.is_disjoint(methods))
            .map(|(test, _)| test.clone())
            .collect()
    }

    /// Resolve patched methods into capture targets with their whitelists.
    ///
    /// A patched method missing from the method domain is fatal.
    pub fn capture_targets<'a, I>(&self, patched_methods: I) -> Result<Vec<CaptureTarget>, ObjSimError>
    where
        I: IntoIterator<Item = &'a String>,
    {
        patched_methods
            .into_iter()
            .map(|method| {
                let method_index = self.methods.resolve(method)?;
                let fields = self
                    .field_accesses
                    .get(&method_index)
                    .map(|f| f.iter().copied().collect())
                    .unwrap_or_default();
                Ok(CaptureTarget {
                    method_index,
                    method: method.clone(),
                    fields,
                })
            })
            .collect()
    }
}

/// Snapshots captured in one run of the capture stage.
#[derive(Debug, Clone)]
pub struct CaptureResults {
    pub outcome: SessionOutcome,
    pub snapshots: BTreeMap<TestId, Vec<ExitSnapshot>>,
}

#[async_trait]
pub trait Profiler: Send + Sync {
    async fn discover(&self, request: DiscoveryRequest) -> Result<DiscoveryResults>;

    async fn capture(&self, label: &str, request: CaptureRequest) -> Result<CaptureResults>;
}

/// Runs each stage in a fresh worker process.
#[derive(Debug, Clone)]
pub struct ProcessProfiler {
    options: SessionOptions,
}

impl ProcessProfiler {
    pub fn new(options: SessionOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl Profiler for ProcessProfiler {
    async fn discover(&self, request: DiscoveryRequest) -> Result<DiscoveryResults> {
        let index_dir = request.index_dir.clone();
        std::fs::create_dir_all(&index_dir)
            .with_context(|| format!("Failed to create index dir {}", index_dir.display()))?;
        let (outcome, results) = ProcessSession::run(
            "discovery",
            self.options.clone(),
            &WorkerRequest::Discovery(request),
        )
        .await?;
        discovery_results(outcome, results, &index_dir)
    }

    async fn capture(&self, label: &str, request: CaptureRequest) -> Result<CaptureResults> {
        let (outcome, results) =
            ProcessSession::run(label, self.options.clone(), &WorkerRequest::Capture(request))
                .await?;
        info!(
            session = label,
            tests = results.snapshots.len(),
            ok = outcome.is_ok(),
            "capture finished"
        );
        Ok(CaptureResults {
            outcome,
            snapshots: results.snapshots,
        })
    }
}

/// Assemble discovery results and make the index domains available on disk
/// for the capture runs.
///
/// Name tables received over the channel win; without them the domains the
/// worker saved are reloaded.
pub fn discovery_results(
    outcome: SessionOutcome,
    mut results: SessionResults,
    index_dir: &std::path::Path,
) -> Result<DiscoveryResults> {
    let mut domain = |kind: DomainKind| -> Result<IndexDomain> {
        let domain = match results.name_tables.remove(&kind) {
            Some(names) => IndexDomain::from_names(kind, names),
            None => {
                warn!(domain = kind.file_stem(), "no name table received, reloading saved domain");
                IndexDomain::load_or_new(index_dir, kind)?
            }
        };
        domain.save(index_dir)?;
        Ok(domain)
    };
    let methods = domain(DomainKind::Methods)?;
    let fields = domain(DomainKind::Fields)?;

    if !outcome.is_ok() {
        warn!(outcome = ?outcome, "discovery ended abnormally, using partial results");
    }
    info!(
        methods = methods.len(),
        fields = fields.len(),
        tests = results.coverage.len(),
        failing = results.failing_tests.len(),
        "discovery finished"
    );

    Ok(DiscoveryResults {
        outcome,
        methods,
        fields,
        coverage: results
            .coverage
            .into_iter()
            .map(|(test, methods)| (test, methods.into_iter().collect()))
            .collect(),
        field_accesses: results
            .field_accesses
            .into_iter()
            .map(|(method, fields)| (method, fields.into_iter().collect()))
            .collect(),
        failing_tests: results.failing_tests,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use objsim_types::WorkerExitCode;
    use tempfile::TempDir;

    fn tid(name: &str) -> TestId {
        TestId::parse(name).unwrap()
    }

    fn sample_results() -> SessionResults {
        let mut results = SessionResults::default();
        results.name_tables.insert(
            DomainKind::Methods,
            vec!["a.Foo.m()".into(), "a.Foo.n()".into()],
        );
        results
            .name_tables
            .insert(DomainKind::Fields, vec!["a.Foo.x".into(), "a.Foo.y".into()]);
        results.coverage.insert(tid("a.T.one"), vec![0]);
        results.coverage.insert(tid("a.T.two"), vec![1]);
        results.field_accesses.insert(1, vec![1]);
        results
    }

    #[test]
    fn test_discovery_results_persist_domains() -> Result<()> {
        let dir = TempDir::new()?;
        let discovery = discovery_results(
            SessionOutcome::Done {
                exit_code: WorkerExitCode::OK,
            },
            sample_results(),
            dir.path(),
        )?;
        let reloaded = IndexDomain::load(dir.path(), DomainKind::Methods)?;
        assert_eq!(reloaded.names(), discovery.methods.names());

        let covering = discovery.covering_tests(&[1].into_iter().collect());
        assert_eq!(covering.into_iter().collect::<Vec<_>>(), vec![tid("a.T.two")]);
        Ok(())
    }

    #[test]
    fn test_capture_targets_carry_whitelists() -> Result<()> {
        let dir = TempDir::new()?;
        let discovery = discovery_results(SessionOutcome::TimedOut, sample_results(), dir.path())?;
        let methods = vec!["a.Foo.n()".to_string()];
        let targets = discovery.capture_targets(&methods)?;
        assert_eq!(
            targets,
            vec![CaptureTarget {
                method_index: 1,
                method: "a.Foo.n()".into(),
                fields: vec![1],
            }]
        );
        Ok(())
    }

    #[test]
    fn test_unknown_patched_method_is_fatal() -> Result<()> {
        let dir = TempDir::new()?;
        let discovery = discovery_results(SessionOutcome::TimedOut, sample_results(), dir.path())?;
        let methods = vec!["a.Foo.missing()".to_string()];
        let err = discovery.capture_targets(&methods).unwrap_err();
        assert!(err.is_fatal());
        Ok(())
    }
}
