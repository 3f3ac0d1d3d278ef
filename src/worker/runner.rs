//! Test execution inside the worker.
//!
//! Tests run one at a time. Each test runs as a blocking task and the runner
//! waits for it with a deadline; a test that misses the deadline is abandoned
//! (its thread is left to finish on its own) and the runner moves on.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use objsim_types::{ExitSnapshot, TestId};

use super::context::{Probe, ProfilerContext, TestScope};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestCase {
    pub id: TestId,
}

/// What a framework reports for a test that ran to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestOutcome {
    Passed,
    Failed(String),
}

/// What the runner observed for a test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestResult {
    Passed,
    Failed(String),
    Panicked(String),
    TimedOut,
}

impl TestResult {
    pub fn is_failure(&self) -> bool {
        !matches!(self, TestResult::Passed)
    }
}

/// A test framework the worker can drive.
pub trait TestFramework: Send + Sync + 'static {
    /// Resolve the requested tests. Tests the framework does not know are
    /// left out.
    fn discover(&self, requested: &[TestId]) -> Vec<TestCase>;

    /// Run one test, reporting instrumentation events through `probe`.
    fn execute(&self, case: &TestCase, probe: &Probe) -> TestOutcome;
}

/// Receives test lifecycle notifications.
pub trait ResultCollector {
    fn on_start(&mut self, test: &TestId);
    fn on_skip(&mut self, test: &TestId, reason: &str);
    fn on_end(&mut self, test: &TestId, result: &TestResult);
}

/// Logs lifecycle notifications.
#[derive(Debug, Default)]
pub struct LoggingCollector {
    pub failures: usize,
}

impl ResultCollector for LoggingCollector {
    fn on_start(&mut self, test: &TestId) {
        info!(test = %test, "RUNNING");
    }

    fn on_skip(&mut self, test: &TestId, reason: &str) {
        info!(test = %test, reason, "SKIPPED");
    }

    fn on_end(&mut self, test: &TestId, result: &TestResult) {
        match result {
            TestResult::Passed => debug!(test = %test, "PASSED"),
            TestResult::Failed(msg) => {
                self.failures += 1;
                info!(test = %test, message = %msg, "FAILED");
            }
            TestResult::Panicked(msg) => {
                self.failures += 1;
                warn!(test = %test, message = %msg, "PANICKED");
            }
            TestResult::TimedOut => {
                self.failures += 1;
                warn!(test = %test, "TIMED OUT");
            }
        }
    }
}

/// Result of one test run.
#[derive(Debug)]
pub struct TestRun {
    pub test: TestId,
    pub result: TestResult,
    /// `None` when the test was abandoned.
    pub exits: Option<Vec<ExitSnapshot>>,
}

pub struct TestRunner<F: TestFramework> {
    framework: Arc<F>,
    ctx: Arc<ProfilerContext>,
    timeout: Duration,
}

impl<F: TestFramework> TestRunner<F> {
    pub fn new(framework: Arc<F>, ctx: Arc<ProfilerContext>, timeout: Duration) -> Self {
        Self {
            framework,
            ctx,
            timeout,
        }
    }

    /// Resolve `requested`, notifying `collector` about tests that cannot run.
    pub fn discover(
        &self,
        requested: &[TestId],
        collector: &mut dyn ResultCollector,
    ) -> Vec<TestCase> {
        let cases = self.framework.discover(requested);
        for test in requested {
            if !cases.iter().any(|c| &c.id == test) {
                collector.on_skip(test, "not found");
            }
        }
        cases
    }

    pub async fn run(&self, case: &TestCase, collector: &mut dyn ResultCollector) -> TestRun {
        collector.on_start(&case.id);
        self.ctx.begin_test();
        let scope = Arc::new(TestScope::new(case.id.clone(), self.ctx.snapshot_limit()));
        let probe = Probe::new(self.ctx.clone(), scope.clone());
        let framework = self.framework.clone();
        let task_case = case.clone();
        let task = tokio::task::spawn_blocking(move || framework.execute(&task_case, &probe));

        let result = match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(TestOutcome::Passed)) => TestResult::Passed,
            Ok(Ok(TestOutcome::Failed(msg))) => TestResult::Failed(msg),
            Ok(Err(join_err)) if join_err.is_panic() => {
                TestResult::Panicked(panic_message(join_err.into_panic()))
            }
            Ok(Err(join_err)) => TestResult::Failed(join_err.to_string()),
            Err(_) => TestResult::TimedOut,
        };
        collector.on_end(&case.id, &result);

        let exits = match result {
            TestResult::TimedOut => None,
            _ => Some(scope.take()),
        };
        TestRun {
            test: case.id.clone(),
            result,
            exits,
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}
