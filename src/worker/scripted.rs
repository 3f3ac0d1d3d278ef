//! A [`TestFramework`] that replays scripted tests.
//!
//! A suite file lists tests and, for each, the instrumentation events its
//! execution produces. A test may carry variants keyed by the SHA-256 of an
//! installed class file (`probe_class`, relative to the build directory);
//! the variant matching the currently installed file replaces the default
//! script, which is how a substituted class changes observable behavior.
//!
//! ```json
//! {
//!   "probe_class": "com/example/Foo.class",
//!   "tests": [
//!     {
//!       "name": "com.example.FooTest.testInc",
//!       "fails": true,
//!       "events": [
//!         {"enter": "com.example.Foo.inc()"},
//!         {"field": "com.example.Foo.count"},
//!         {"exit": {"method": "com.example.Foo.inc()", "slots": [{"kind": "int", "value": 1}]}}
//!       ],
//!       "variants": {"<sha256 of patched Foo.class>": {"fails": false, "events": []}}
//!     }
//!   ]
//! }
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use objsim_types::{Snapshot, TestId};

use super::context::Probe;
use super::runner::{TestCase, TestFramework, TestOutcome};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Event {
    Enter(String),
    Exit {
        method: String,
        #[serde(default)]
        slots: Vec<Snapshot>,
    },
    Field(String),
    SleepMs(u64),
    Panic(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Script {
    #[serde(default)]
    pub fails: bool,
    #[serde(default)]
    pub events: Vec<Event>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptedTest {
    pub name: TestId,
    #[serde(flatten)]
    pub script: Script,
    #[serde(default)]
    pub variants: BTreeMap<String, Script>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SuiteFile {
    #[serde(default)]
    pub probe_class: Option<PathBuf>,
    pub tests: Vec<ScriptedTest>,
}

/// Hex SHA-256 of a file's contents.
pub fn file_digest(path: &Path) -> Result<String> {
    let bytes =
        std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

#[derive(Debug, Clone)]
pub struct ScriptedSuite {
    tests: BTreeMap<TestId, Script>,
}

impl ScriptedSuite {
    /// Load a suite, picking each test's variant for the class installed
    /// under `build_dir`.
    pub fn load(path: &Path, build_dir: Option<&Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read suite: {}", path.display()))?;
        let suite: SuiteFile = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse suite JSON: {}", path.display()))?;
        let digest = match (&suite.probe_class, build_dir) {
            (Some(class), Some(dir)) => Some(file_digest(&dir.join(class))?),
            _ => None,
        };
        if let Some(digest) = &digest {
            info!(digest = %digest, "selected suite variant key");
        }
        Ok(Self::from_file(suite, digest.as_deref()))
    }

    pub fn from_file(suite: SuiteFile, digest: Option<&str>) -> Self {
        let tests = suite
            .tests
            .into_iter()
            .map(|mut test| {
                let script = digest
                    .and_then(|d| test.variants.remove(d))
                    .unwrap_or(test.script);
                (test.name, script)
            })
            .collect();
        Self { tests }
    }

    pub fn len(&self) -> usize {
        self.tests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }
}

impl TestFramework for ScriptedSuite {
    fn discover(&self, requested: &[TestId]) -> Vec<TestCase> {
        requested
            .iter()
            .filter(|t| self.tests.contains_key(*t))
            .map(|t| TestCase { id: t.clone() })
            .collect()
    }

    fn execute(&self, case: &TestCase, probe: &Probe) -> TestOutcome {
        let Some(script) = self.tests.get(&case.id) else {
            return TestOutcome::Failed("no such test".to_string());
        };
        for event in &script.events {
            match event {
                Event::Enter(method) => probe.enter(method),
                Event::Exit { method, slots } => probe.exit(method, slots.clone()),
                Event::Field(field) => probe.field(field),
                Event::SleepMs(ms) => std::thread::sleep(Duration::from_millis(*ms)),
                Event::Panic(message) => panic!("{}", message),
            }
        }
        debug!(test = %case.id, events = script.events.len(), "script finished");
        if script.fails {
            TestOutcome::Failed("scripted failure".to_string())
        } else {
            TestOutcome::Passed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index_domain::IndexDomain;
    use crate::worker::context::{ProfilerContext, TestScope};
    use objsim_types::DomainKind;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tempfile::TempDir;

    const SUITE: &str = r#"{
        "probe_class": "com/example/Foo.class",
        "tests": [
            {
                "name": "com.example.FooTest:testInc",
                "fails": true,
                "events": [
                    {"enter": "com.example.Foo.inc()"},
                    {"exit": {"method": "com.example.Foo.inc()", "slots": [{"kind": "int", "value": 1}]}}
                ],
                "variants": {
                    "PATCHED": {
                        "events": [
                            {"enter": "com.example.Foo.inc()"},
                            {"exit": {"method": "com.example.Foo.inc()", "slots": [{"kind": "int", "value": 2}]}}
                        ]
                    }
                }
            },
            {"name": "com.example.FooTest.testOther"}
        ]
    }"#;

    fn run(suite: &ScriptedSuite) -> (TestOutcome, Vec<objsim_types::ExitSnapshot>) {
        let mut methods = IndexDomain::new(DomainKind::Methods);
        let target = methods.get_or_add("com.example.Foo.inc()");
        let mut whitelists = HashMap::new();
        whitelists.insert(target, objsim_types::FieldWhitelist::new());
        let ctx = Arc::new(ProfilerContext::for_capture(
            methods,
            IndexDomain::new(DomainKind::Fields),
            whitelists,
            0,
        ));
        let id = TestId::parse("com.example.FooTest.testInc").unwrap();
        let scope = Arc::new(TestScope::new(id.clone(), 0));
        let outcome = suite.execute(&TestCase { id }, &Probe::new(ctx, scope.clone()));
        (outcome, scope.take())
    }

    #[test]
    fn test_default_script_without_matching_variant() {
        let file: SuiteFile = serde_json::from_str(SUITE).unwrap();
        let suite = ScriptedSuite::from_file(file, Some("unknown"));
        assert_eq!(suite.len(), 2);
        let (outcome, exits) = run(&suite);
        assert!(matches!(outcome, TestOutcome::Failed(_)));
        assert_eq!(exits[0].slots, vec![Snapshot::Int(1)]);
    }

    #[test]
    fn test_variant_replaces_script() {
        let file: SuiteFile = serde_json::from_str(SUITE).unwrap();
        let suite = ScriptedSuite::from_file(file, Some("PATCHED"));
        let (outcome, exits) = run(&suite);
        assert_eq!(outcome, TestOutcome::Passed);
        assert_eq!(exits[0].slots, vec![Snapshot::Int(2)]);
    }

    #[test]
    fn test_load_keys_variants_by_installed_class_digest() -> Result<()> {
        let dir = TempDir::new()?;
        let build = dir.path().join("classes");
        std::fs::create_dir_all(build.join("com/example"))?;
        std::fs::write(build.join("com/example/Foo.class"), b"patched bytes")?;
        let digest = file_digest(&build.join("com/example/Foo.class"))?;

        let suite_path = dir.path().join("suite.json");
        std::fs::write(&suite_path, SUITE.replace("PATCHED", &digest))?;
        let suite = ScriptedSuite::load(&suite_path, Some(&build))?;
        let (outcome, _) = run(&suite);
        assert_eq!(outcome, TestOutcome::Passed);
        Ok(())
    }

    #[test]
    fn test_discover_filters_unknown_tests() {
        let file: SuiteFile = serde_json::from_str(SUITE).unwrap();
        let suite = ScriptedSuite::from_file(file, None);
        let requested = vec![
            TestId::parse("com.example.FooTest.testOther").unwrap(),
            TestId::parse("com.example.FooTest.nope").unwrap(),
        ];
        assert_eq!(suite.discover(&requested).len(), 1);
    }
}
