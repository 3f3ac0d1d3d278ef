//! Worker control-channel protocol.
//!
//! The orchestrator writes exactly one [`WorkerRequest`] to the worker and
//! then only reads. The worker answers with any number of [`WorkerMessage`]s,
//! each a single JSON object on its own line tagged by `"tag"`, and finishes
//! with [`WorkerMessage::Done`]. A line that does not decode to a known tag
//! is a protocol violation.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use crate::names::TestId;
use crate::snapshot::ExitSnapshot;

/// Worker exit codes carried by [`WorkerMessage::Done`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerExitCode(pub i32);

impl WorkerExitCode {
    pub const OK: Self = Self(0);
    pub const OUT_OF_MEMORY: Self = Self(11);
    pub const UNKNOWN_ERROR: Self = Self(13);
    pub const BAD_REQUEST: Self = Self(15);

    pub fn is_ok(self) -> bool {
        self == Self::OK
    }
}

impl fmt::Display for WorkerExitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match *self {
            Self::OK => "ok",
            Self::OUT_OF_MEMORY => "out-of-memory",
            Self::UNKNOWN_ERROR => "unknown-error",
            Self::BAD_REQUEST => "bad-request",
            _ => "other",
        };
        write!(f, "{} ({})", label, self.0)
    }
}

/// Which index domain a name table describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainKind {
    Methods,
    Fields,
}

impl DomainKind {
    pub fn file_stem(self) -> &'static str {
        match self {
            DomainKind::Methods => "methods",
            DomainKind::Fields => "fields",
        }
    }
}

/// The single request sent to a freshly connected worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum WorkerRequest {
    Discovery(DiscoveryRequest),
    Capture(CaptureRequest),
}

impl WorkerRequest {
    pub fn stage(&self) -> &'static str {
        match self {
            WorkerRequest::Discovery(_) => "discovery",
            WorkerRequest::Capture(_) => "capture",
        }
    }
}

/// Run tests against the unpatched program and report coverage, field
/// accesses inside the patched methods, and failing tests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryRequest {
    pub tests: Vec<TestId>,
    pub patched_methods: Vec<String>,
    #[serde(default)]
    pub app_class_globs: Vec<String>,
    /// Where the worker saves its index domains.
    pub index_dir: PathBuf,
    pub test_timeout_ms: u64,
}

/// Run tests and capture exit snapshots of the target methods.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureRequest {
    pub tests: Vec<TestId>,
    pub targets: Vec<CaptureTarget>,
    /// Where the discovery run saved its index domains.
    pub index_dir: PathBuf,
    pub test_timeout_ms: u64,
    /// Exits kept per test; the most recent ones win. Zero keeps all.
    pub snapshot_limit: usize,
}

/// A method to capture, with the field indices worth keeping in its
/// snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureTarget {
    pub method_index: u32,
    pub method: String,
    pub fields: Vec<u32>,
}

/// Replies from the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tag", rename_all = "snake_case")]
pub enum WorkerMessage {
    Done {
        exit_code: WorkerExitCode,
    },
    Snapshots {
        test: TestId,
        exits: Vec<ExitSnapshot>,
    },
    NameTable {
        domain: DomainKind,
        names: Vec<String>,
    },
    FieldAccesses {
        accesses: BTreeMap<u32, Vec<u32>>,
    },
    MethodCoverage {
        coverage: BTreeMap<TestId, Vec<u32>>,
    },
    FailingTests {
        tests: Vec<TestId>,
    },
}

impl WorkerMessage {
    pub fn tag(&self) -> &'static str {
        match self {
            WorkerMessage::Done { .. } => "done",
            WorkerMessage::Snapshots { .. } => "snapshots",
            WorkerMessage::NameTable { .. } => "name_table",
            WorkerMessage::FieldAccesses { .. } => "field_accesses",
            WorkerMessage::MethodCoverage { .. } => "method_coverage",
            WorkerMessage::FailingTests { .. } => "failing_tests",
        }
    }
}

/// A control-channel line that could not be understood.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolError {
    pub line: String,
    pub reason: String,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut preview: String = self.line.chars().take(120).collect();
        if preview.len() < self.line.len() {
            preview.push_str("...");
        }
        write!(f, "protocol violation: {} (line: {})", self.reason, preview)
    }
}

impl std::error::Error for ProtocolError {}

/// Encode a value as one control-channel line, newline included.
pub fn encode_line<T: Serialize>(value: &T) -> serde_json::Result<String> {
    let mut line = serde_json::to_string(value)?;
    line.push('\n');
    Ok(line)
}

pub fn decode_message(line: &str) -> Result<WorkerMessage, ProtocolError> {
    serde_json::from_str(line.trim_end()).map_err(|e| ProtocolError {
        line: line.trim_end().to_string(),
        reason: e.to_string(),
    })
}

pub fn decode_request(line: &str) -> Result<WorkerRequest, ProtocolError> {
    serde_json::from_str(line.trim_end()).map_err(|e| ProtocolError {
        line: line.trim_end().to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::Snapshot;

    #[test]
    fn test_message_lines_carry_tag() {
        let msg = WorkerMessage::Done {
            exit_code: WorkerExitCode::OK,
        };
        let line = encode_line(&msg).unwrap();
        assert_eq!(line, "{\"tag\":\"done\",\"exit_code\":0}\n");
        assert_eq!(decode_message(&line).unwrap(), msg);
    }

    #[test]
    fn test_unknown_tag_is_protocol_error() {
        let err = decode_message(r#"{"tag":"heartbeat"}"#).unwrap_err();
        assert!(err.reason.contains("heartbeat"), "{}", err.reason);
    }

    #[test]
    fn test_garbage_line_is_protocol_error() {
        assert!(decode_message("not json").is_err());
    }

    #[test]
    fn test_snapshot_message_decodes() {
        let line = r#"{"tag":"snapshots","test":"a.FooTest:test","exits":[{"slots":[{"kind":"int","value":3}]}]}"#;
        match decode_message(line).unwrap() {
            WorkerMessage::Snapshots { test, exits } => {
                assert_eq!(test.as_str(), "a.FooTest.test");
                assert_eq!(exits[0].outcome(), Some(&Snapshot::Int(3)));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_non_finite_snapshot_values_cross_the_channel() {
        let msg = WorkerMessage::Snapshots {
            test: TestId::parse("a.FooTest.test").unwrap(),
            exits: vec![ExitSnapshot::new(vec![
                Snapshot::Float(f64::NAN),
                Snapshot::Float(f64::INFINITY),
                Snapshot::Float(f64::NEG_INFINITY),
            ])],
        };
        let line = encode_line(&msg).unwrap();
        assert!(!line.contains("null"), "{}", line);
        match decode_message(&line).unwrap() {
            WorkerMessage::Snapshots { exits, .. } => {
                let slots = &exits[0].slots;
                assert!(matches!(slots[0], Snapshot::Float(v) if v.is_nan()));
                assert_eq!(slots[1], Snapshot::Float(f64::INFINITY));
                assert_eq!(slots[2], Snapshot::Float(f64::NEG_INFINITY));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_request_is_tagged_by_stage() {
        let req = WorkerRequest::Capture(CaptureRequest {
            tests: vec![TestId::parse("a.FooTest.test").unwrap()],
            targets: vec![CaptureTarget {
                method_index: 3,
                method: "a.Foo.count()".into(),
                fields: vec![7],
            }],
            index_dir: PathBuf::from("/tmp/index"),
            test_timeout_ms: 1000,
            snapshot_limit: 5,
        });
        let line = encode_line(&req).unwrap();
        assert!(line.starts_with("{\"stage\":\"capture\""));
        assert_eq!(decode_request(&line).unwrap(), req);
        assert_eq!(req.stage(), "capture");
    }

    #[test]
    fn test_exit_code_display() {
        assert_eq!(WorkerExitCode::OUT_OF_MEMORY.to_string(), "out-of-memory (11)");
        assert!(!WorkerExitCode(3).is_ok());
    }
}
