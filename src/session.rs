//! Out-of-process worker sessions.
//!
//! A session owns one worker process and the control channel to it:
//!
//! 1. bind a loopback listener on an ephemeral port
//! 2. spawn the worker with the listener address in its arguments
//! 3. accept exactly one connection and send the request once
//! 4. consume tagged replies until `done` or end of stream
//! 5. tear the worker down, killing it if it does not exit on its own
//!
//! Replies are stored as they arrive, so whatever a crashed worker managed to
//! send is still available afterwards.
//!
//! ```text
//! Created --start--> Started --wait_to_die--> Done | Crashed --> Terminated
//! ```

use anyhow::{anyhow, bail, Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use objsim_types::protocol::{decode_message, encode_line};
use objsim_types::{DomainKind, ExitSnapshot, TestId, WorkerExitCode, WorkerMessage, WorkerRequest};

use crate::config::{ObjSimConfig, WorkerConfig, WorkerVars};

/// How long a worker may take to exit after its last message.
const EXIT_GRACE_SECS: u64 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    Started,
    Done,
    Crashed,
    Terminated,
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionOutcome {
    /// The worker sent `done`.
    Done { exit_code: WorkerExitCode },
    /// The stream ended (or never started) without `done`.
    Crashed { reason: String },
    /// The overall session timeout elapsed.
    TimedOut,
    /// The worker sent a line that is not a known message.
    ProtocolViolation { reason: String },
}

impl SessionOutcome {
    /// `done` with an OK exit code.
    pub fn is_ok(&self) -> bool {
        matches!(self, SessionOutcome::Done { exit_code } if exit_code.is_ok())
    }
}

/// Everything received from the worker.
#[derive(Debug, Clone, Default)]
pub struct SessionResults {
    pub snapshots: BTreeMap<TestId, Vec<ExitSnapshot>>,
    pub name_tables: HashMap<DomainKind, Vec<String>>,
    pub field_accesses: BTreeMap<u32, Vec<u32>>,
    pub coverage: BTreeMap<TestId, Vec<u32>>,
    pub failing_tests: BTreeSet<TestId>,
    pub messages: usize,
}

impl SessionResults {
    /// Record a message. Returns the exit code once `done` arrives.
    pub fn apply(&mut self, message: WorkerMessage) -> Option<WorkerExitCode> {
        self.messages += 1;
        match message {
            WorkerMessage::Done { exit_code } => return Some(exit_code),
            WorkerMessage::Snapshots { test, exits } => {
                self.snapshots.entry(test).or_default().extend(exits);
            }
            WorkerMessage::NameTable { domain, names } => {
                self.name_tables.insert(domain, names);
            }
            WorkerMessage::FieldAccesses { accesses } => {
                for (method, fields) in accesses {
                    let entry = self.field_accesses.entry(method).or_default();
                    entry.extend(fields);
                    entry.sort_unstable();
                    entry.dedup();
                }
            }
            WorkerMessage::MethodCoverage { coverage } => {
                for (test, methods) in coverage {
                    let entry = self.coverage.entry(test).or_default();
                    entry.extend(methods);
                    entry.sort_unstable();
                    entry.dedup();
                }
            }
            WorkerMessage::FailingTests { tests } => {
                self.failing_tests.extend(tests);
            }
        }
        None
    }
}

/// Launch parameters shared by every session of a run.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub worker: WorkerConfig,
    pub cwd: PathBuf,
    pub build_dir: PathBuf,
    pub connect_timeout: Duration,
    pub session_timeout: Duration,
}

impl SessionOptions {
    pub fn from_config(config: &ObjSimConfig) -> Self {
        Self {
            worker: config.worker.clone(),
            cwd: config.worker_cwd(),
            build_dir: config.build_dir(),
            connect_timeout: config.connect_timeout(),
            session_timeout: config.session_timeout(),
        }
    }
}

/// Why the listener task stopped.
#[derive(Debug)]
enum ListenerEnd {
    Done(WorkerExitCode),
    Eof,
    NotConnected(String),
    Violation(String),
    Io(String),
}

pub struct ProcessSession {
    label: String,
    options: SessionOptions,
    state: SessionState,
    child: Option<Child>,
    listener: Option<JoinHandle<ListenerEnd>>,
    results: Arc<Mutex<SessionResults>>,
    outcome: Option<SessionOutcome>,
}

impl ProcessSession {
    pub fn new(label: impl Into<String>, options: SessionOptions) -> Self {
        Self {
            label: label.into(),
            options,
            state: SessionState::Created,
            child: None,
            listener: None,
            results: Arc::new(Mutex::new(SessionResults::default())),
            outcome: None,
        }
    }

    /// Start a session, send `request` and wait for it to finish.
    pub async fn run(
        label: impl Into<String>,
        options: SessionOptions,
        request: &WorkerRequest,
    ) -> Result<(SessionOutcome, SessionResults)> {
        let mut session = Self::new(label, options);
        session.start(request).await?;
        let outcome = session.wait_to_die().await?;
        Ok((outcome, session.into_results()))
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn outcome(&self) -> Option<&SessionOutcome> {
        self.outcome.as_ref()
    }

    /// Snapshot of the results received so far.
    pub fn results(&self) -> SessionResults {
        self.results.lock().clone()
    }

    pub fn into_results(self) -> SessionResults {
        std::mem::take(&mut *self.results.lock())
    }

    pub async fn start(&mut self, request: &WorkerRequest) -> Result<()> {
        if self.state != SessionState::Created {
            bail!("session {} already started", self.label);
        }

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .context("Failed to bind control channel")?;
        let addr = listener.local_addr()?;
        let addr_str = addr.to_string();
        let args = self.options.worker.expand_args(&WorkerVars {
            addr: &addr_str,
            port: addr.port(),
            stage: request.stage(),
            build_dir: &self.options.build_dir,
        });

        let mut cmd = Command::new(&self.options.worker.command);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .current_dir(&self.options.cwd)
            .kill_on_drop(true);
        for (key, value) in &self.options.worker.env {
            cmd.env(key, value);
        }
        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn worker {}", self.options.worker.command))?;
        info!(
            session = %self.label,
            stage = request.stage(),
            addr = %addr,
            pid = child.id().unwrap_or_default(),
            "worker started"
        );

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(stdout, self.label.clone(), "stdout"));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(stderr, self.label.clone(), "stderr"));
        }

        let line = encode_line(request).context("Failed to encode worker request")?;
        self.listener = Some(tokio::spawn(listen(
            listener,
            line,
            self.results.clone(),
            self.options.connect_timeout,
        )));
        self.child = Some(child);
        self.state = SessionState::Started;
        Ok(())
    }

    /// Wait for the worker to finish (or time out), then tear it down.
    pub async fn wait_to_die(&mut self) -> Result<SessionOutcome> {
        if self.state != SessionState::Started {
            bail!("session {} is not running", self.label);
        }
        let mut listener = self
            .listener
            .take()
            .ok_or_else(|| anyhow!("session {} has no listener", self.label))?;
        let mut child = self
            .child
            .take()
            .ok_or_else(|| anyhow!("session {} has no worker", self.label))?;

        let ended = tokio::time::timeout(self.options.session_timeout, async {
            tokio::select! {
                end = &mut listener => end,
                status = child.wait() => {
                    // Anything the worker wrote is already buffered in the socket.
                    match tokio::time::timeout(Duration::from_secs(EXIT_GRACE_SECS), &mut listener).await {
                        Ok(end) => end,
                        Err(_) => Ok(ListenerEnd::NotConnected(format!(
                            "worker exited ({}) without connecting",
                            describe_status(&status)
                        ))),
                    }
                }
            }
        })
        .await;
        listener.abort();

        let outcome = match ended {
            Err(_) => SessionOutcome::TimedOut,
            Ok(Err(join_err)) => SessionOutcome::Crashed {
                reason: format!("listener failed: {}", join_err),
            },
            Ok(Ok(ListenerEnd::Done(exit_code))) => SessionOutcome::Done { exit_code },
            Ok(Ok(ListenerEnd::Eof)) => SessionOutcome::Crashed {
                reason: "control channel closed before done".to_string(),
            },
            Ok(Ok(ListenerEnd::NotConnected(reason))) | Ok(Ok(ListenerEnd::Io(reason))) => {
                SessionOutcome::Crashed { reason }
            }
            Ok(Ok(ListenerEnd::Violation(reason))) => SessionOutcome::ProtocolViolation { reason },
        };

        self.state = match outcome {
            SessionOutcome::Done { .. } => SessionState::Done,
            _ => SessionState::Crashed,
        };
        let messages = self.results.lock().messages;
        if outcome.is_ok() {
            info!(session = %self.label, messages, "worker finished");
        } else {
            warn!(session = %self.label, messages, outcome = ?outcome, "worker ended abnormally");
        }

        terminate(&mut child, &self.label, !matches!(outcome, SessionOutcome::Done { .. })).await;
        self.state = SessionState::Terminated;
        self.outcome = Some(outcome.clone());
        Ok(outcome)
    }
}

async fn listen(
    listener: TcpListener,
    request_line: String,
    results: Arc<Mutex<SessionResults>>,
    connect_timeout: Duration,
) -> ListenerEnd {
    let stream = match tokio::time::timeout(connect_timeout, listener.accept()).await {
        Ok(Ok((stream, peer))) => {
            debug!(peer = %peer, "worker connected");
            stream
        }
        Ok(Err(e)) => return ListenerEnd::NotConnected(format!("accept failed: {}", e)),
        Err(_) => {
            return ListenerEnd::NotConnected(format!(
                "worker did not connect within {:?}",
                connect_timeout
            ))
        }
    };
    // Exactly one worker connection per session.
    drop(listener);

    let (read, mut write) = stream.into_split();
    if let Err(e) = write.write_all(request_line.as_bytes()).await {
        return ListenerEnd::Io(format!("failed to send request: {}", e));
    }
    if let Err(e) = write.flush().await {
        return ListenerEnd::Io(format!("failed to send request: {}", e));
    }

    let mut lines = BufReader::new(read).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match decode_message(&line) {
                    Ok(message) => {
                        debug!(tag = message.tag(), "message received");
                        if let Some(code) = results.lock().apply(message) {
                            return ListenerEnd::Done(code);
                        }
                    }
                    Err(e) => return ListenerEnd::Violation(e.to_string()),
                }
            }
            Ok(None) => return ListenerEnd::Eof,
            Err(e) => return ListenerEnd::Io(format!("read failed: {}", e)),
        }
    }
}

async fn terminate(child: &mut Child, label: &str, kill_now: bool) {
    if !kill_now {
        let grace = Duration::from_secs(EXIT_GRACE_SECS);
        if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
            debug!(session = %label, status = %describe_status(&status), "worker exited");
            return;
        }
    }
    if let Err(e) = child.start_kill() {
        debug!(session = %label, error = %e, "kill failed (already exited?)");
    }
    match child.wait().await {
        Ok(status) => debug!(session = %label, status = %status, "worker reaped"),
        Err(e) => warn!(session = %label, error = %e, "failed to reap worker"),
    }
}

fn describe_status(status: &std::io::Result<std::process::ExitStatus>) -> String {
    match status {
        Ok(status) => status.to_string(),
        Err(e) => format!("unknown: {}", e),
    }
}

async fn forward_output<R: AsyncRead + Unpin>(reader: R, label: String, stream: &'static str) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(target: "objsim::worker", session = %label, stream, "{}", line);
    }
}
