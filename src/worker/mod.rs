//! Worker-side runtime.
//!
//! A worker is started by a [`ProcessSession`](crate::session::ProcessSession),
//! connects back to the orchestrator, reads one request and answers it by
//! running tests through a [`TestFramework`]:
//!
//! - **discovery**: run the tests against the unpatched program, save the
//!   index domains, report coverage, field accesses inside the patched
//!   methods, and the failing tests
//! - **capture**: run the tests and report, per test, the exit snapshots of
//!   the target methods, pruned to the whitelisted fields
//!
//! Every reply ends with a `done` message carrying the worker exit code.

pub mod context;
pub mod reporter;
pub mod runner;
pub mod scripted;

pub use context::{Probe, ProfilerContext, Stage, TestScope};
pub use reporter::Reporter;
pub use runner::{
    LoggingCollector, ResultCollector, TestCase, TestFramework, TestOutcome, TestResult,
    TestRunner, TestRun,
};
pub use scripted::ScriptedSuite;

use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{error, info, warn};

use objsim_types::protocol::decode_request;
use objsim_types::{
    CaptureRequest, DiscoveryRequest, DomainKind, FieldWhitelist, WorkerExitCode, WorkerMessage,
    WorkerRequest,
};

use crate::index_domain::IndexDomain;

/// Connect to the orchestrator at `addr` and answer its request.
pub async fn serve<F: TestFramework>(addr: &str, framework: Arc<F>) -> Result<WorkerExitCode> {
    let stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("Failed to connect to orchestrator at {}", addr))?;
    let (read, write) = stream.into_split();
    let mut reader = BufReader::new(read);
    let mut reporter = Reporter::new(write);

    let mut line = String::new();
    let n = reader
        .read_line(&mut line)
        .await
        .context("Failed to read request")?;
    if n == 0 {
        bail!("control channel closed before a request arrived");
    }

    let exit_code = match decode_request(&line) {
        Err(e) => {
            error!(error = %e, "rejecting request");
            WorkerExitCode::BAD_REQUEST
        }
        Ok(request) => {
            info!(stage = request.stage(), "request received");
            let outcome = match &request {
                WorkerRequest::Discovery(req) => run_discovery(req, framework, &mut reporter).await,
                WorkerRequest::Capture(req) => run_capture(req, framework, &mut reporter).await,
            };
            match outcome {
                Ok(()) => WorkerExitCode::OK,
                Err(e) => {
                    error!(stage = request.stage(), error = %format!("{:#}", e), "stage failed");
                    WorkerExitCode::UNKNOWN_ERROR
                }
            }
        }
    };

    reporter
        .send(&WorkerMessage::Done { exit_code })
        .await?;
    info!(messages = reporter.sent(), exit_code = %exit_code, "worker done");
    let _ = reporter.into_inner().shutdown().await;
    Ok(exit_code)
}

async fn run_discovery<F, W>(
    req: &DiscoveryRequest,
    framework: Arc<F>,
    reporter: &mut Reporter<W>,
) -> Result<()>
where
    F: TestFramework,
    W: AsyncWrite + Unpin,
{
    let ctx = Arc::new(ProfilerContext::for_discovery(
        &req.patched_methods,
        req.app_class_globs.clone(),
    ));
    let runner = TestRunner::new(
        framework,
        ctx.clone(),
        Duration::from_millis(req.test_timeout_ms),
    );
    let mut collector = LoggingCollector::default();

    let mut failing = Vec::new();
    for case in runner.discover(&req.tests, &mut collector) {
        let run = runner.run(&case, &mut collector).await;
        if run.result.is_failure() {
            failing.push(run.test);
        }
    }

    let methods = ctx.methods();
    let fields = ctx.fields();
    methods.save(&req.index_dir)?;
    fields.save(&req.index_dir)?;

    reporter
        .send(&WorkerMessage::NameTable {
            domain: DomainKind::Methods,
            names: methods.names().to_vec(),
        })
        .await?;
    reporter
        .send(&WorkerMessage::NameTable {
            domain: DomainKind::Fields,
            names: fields.names().to_vec(),
        })
        .await?;
    reporter
        .send(&WorkerMessage::MethodCoverage {
            coverage: ctx.coverage(),
        })
        .await?;
    reporter
        .send(&WorkerMessage::FieldAccesses {
            accesses: ctx.field_accesses(),
        })
        .await?;
    reporter
        .send(&WorkerMessage::FailingTests { tests: failing })
        .await?;
    Ok(())
}

async fn run_capture<F, W>(
    req: &CaptureRequest,
    framework: Arc<F>,
    reporter: &mut Reporter<W>,
) -> Result<()>
where
    F: TestFramework,
    W: AsyncWrite + Unpin,
{
    let methods = IndexDomain::load(&req.index_dir, DomainKind::Methods)?;
    let fields = IndexDomain::load(&req.index_dir, DomainKind::Fields)?;

    let mut whitelists = HashMap::new();
    for target in &req.targets {
        if methods.get(target.method_index) != Some(target.method.as_str()) {
            warn!(
                index = target.method_index,
                method = %target.method,
                "target index does not match the saved method domain"
            );
        }
        let names = target.fields.iter().filter_map(|f| fields.get(*f));
        whitelists.insert(target.method_index, FieldWhitelist::from_field_names(names));
    }

    let ctx = Arc::new(ProfilerContext::for_capture(
        methods,
        fields,
        whitelists,
        req.snapshot_limit,
    ));
    let runner = TestRunner::new(framework, ctx, Duration::from_millis(req.test_timeout_ms));
    let mut collector = LoggingCollector::default();

    for case in runner.discover(&req.tests, &mut collector) {
        let run = runner.run(&case, &mut collector).await;
        // Abandoned tests report nothing.
        if let Some(exits) = run.exits {
            reporter
                .send(&WorkerMessage::Snapshots {
                    test: run.test,
                    exits,
                })
                .await?;
        }
    }
    Ok(())
}
