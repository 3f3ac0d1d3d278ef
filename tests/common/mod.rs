//! Shared fixtures for integration tests.
//!
//! [`Project`] lays out a throwaway project: an installed `a.Foo` class, two
//! replacement class files, a scripted suite for the real `objsim-worker`
//! binary and an `objsim.json` pointing at it. The suite's patched variants
//! are keyed by the digest of each replacement, so installing a patch changes
//! what the worker reports.
//!
//! Expected distances (the `other` field is pruned: only `count` is accessed
//! inside `inc`):
//!
//! | patch | failing test | passing test |
//! |-------|--------------|--------------|
//! | 1     | 2            | 0            |
//! | 2     | 0            | 2            |

#![allow(dead_code)]

use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use objsim::worker::scripted::file_digest;

pub const FAILING: &str = "a.FooTest.testFails";
pub const PASSING: &str = "a.FooTest.testPasses";
pub const METHOD: &str = "a.Foo.inc()";

pub fn worker_bin() -> &'static str {
    env!("CARGO_BIN_EXE_objsim-worker")
}

/// Minimal class file defining `internal_name`; `marker` makes the bytes
/// of otherwise identical classes differ.
pub fn class_bytes(internal_name: &str, marker: &str) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&0xCAFEBABEu32.to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes());
    out.extend_from_slice(&52u16.to_be_bytes());
    // #1 Utf8 marker, #2 Utf8 name, #3 Class -> #2
    out.extend_from_slice(&4u16.to_be_bytes());
    out.push(1);
    out.extend_from_slice(&(marker.len() as u16).to_be_bytes());
    out.extend_from_slice(marker.as_bytes());
    out.push(1);
    out.extend_from_slice(&(internal_name.len() as u16).to_be_bytes());
    out.extend_from_slice(internal_name.as_bytes());
    out.push(7);
    out.extend_from_slice(&2u16.to_be_bytes());
    out.extend_from_slice(&0x0021u16.to_be_bytes());
    out.extend_from_slice(&3u16.to_be_bytes());
    out
}

fn foo(count: i64, other: i64) -> Value {
    json!({
        "kind": "object",
        "value": {
            "class": "a.Foo",
            "fields": {
                "count": {"kind": "int", "value": count},
                "other": {"kind": "int", "value": other}
            }
        }
    })
}

fn inc_events(ret: i64, other: i64) -> Value {
    json!([
        {"enter": METHOD},
        {"field": "a.Foo.count"},
        {"exit": {"method": METHOD, "slots": [{"kind": "int", "value": ret}, foo(ret, other)]}}
    ])
}

pub struct Project {
    pub dir: TempDir,
}

impl Project {
    pub fn new() -> Self {
        let project = Self {
            dir: TempDir::new().expect("tempdir"),
        };
        project.write("classes/a/Foo.class", &class_bytes("a/Foo", "original"));
        project.write("patches/1/Foo.class", &class_bytes("a/Foo", "patch one"));
        project.write("patches/2/Foo.class", &class_bytes("a/Foo", "patch two"));
        project.write_suite(json!([]));
        project.write_input(&format!(
            "1,0.4,{m},patches/1/Foo.class,{f} {p},correct\n\
             2,0.9,{m},patches/2/Foo.class,{f} {p},wrong\n",
            m = METHOD,
            f = FAILING,
            p = PASSING
        ));
        project.write_config(json!({}));
        project
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn path(&self, rel: &str) -> PathBuf {
        self.root().join(rel)
    }

    pub fn write(&self, rel: &str, bytes: &[u8]) {
        let path = self.path(rel);
        std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        std::fs::write(path, bytes).expect("write");
    }

    pub fn write_input(&self, csv: &str) {
        self.write("input-file.csv", csv.as_bytes());
    }

    /// Suite for the two patches. `extra_tests` are appended verbatim.
    pub fn write_suite(&self, extra_tests: Value) {
        let p1 = file_digest(&self.path("patches/1/Foo.class")).expect("digest");
        let p2 = file_digest(&self.path("patches/2/Foo.class")).expect("digest");
        let mut tests = vec![
            json!({
                "name": FAILING,
                "fails": true,
                "events": inc_events(1, 9),
                "variants": {
                    p1.clone(): {"events": inc_events(2, 7)},
                    p2.clone(): {"fails": true, "events": inc_events(1, 3)}
                }
            }),
            json!({
                "name": PASSING,
                "events": inc_events(5, 9),
                "variants": {
                    p2: {"events": inc_events(6, 9)}
                }
            }),
        ];
        if let Value::Array(extra) = extra_tests {
            tests.extend(extra);
        }
        let suite = json!({"probe_class": "a/Foo.class", "tests": tests});
        self.write(
            "objsim-suite.json",
            serde_json::to_string_pretty(&suite).expect("suite").as_bytes(),
        );
    }

    /// `objsim.json` running the real worker; `overrides` are merged on top.
    pub fn write_config(&self, overrides: Value) {
        let mut config = json!({
            "build_dir": "classes",
            "failing_tests": [FAILING],
            "connect_timeout_secs": 20,
            "session_timeout_secs": 60,
            "test_timeout_ms": 5000,
            "worker": {
                "command": worker_bin(),
                "args": ["--connect", "{addr}", "--build-dir", "{build_dir}", "--suite", "objsim-suite.json"]
            }
        });
        if let (Value::Object(base), Value::Object(extra)) = (&mut config, overrides) {
            for (key, value) in extra {
                base.insert(key, value);
            }
        }
        self.write(
            "objsim.json",
            serde_json::to_string_pretty(&config).expect("config").as_bytes(),
        );
    }

    pub fn installed_class(&self) -> Vec<u8> {
        std::fs::read(self.path("classes/a/Foo.class")).expect("installed class")
    }

    pub fn output(&self, rel: &str) -> PathBuf {
        self.path("objsim-output").join(rel)
    }
}
