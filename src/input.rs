//! Patch records and test lists.
//!
//! Patch records come from a headerless CSV file, one patch per row:
//!
//! | Column | Content |
//! |--------|---------|
//! | 0 | patch id (integer) |
//! | 1 | suspiciousness (float, may be empty; non-numeric text is a label) |
//! | 2 | patched methods, whitespace separated |
//! | 3 | replacement class files, whitespace separated |
//! | 4 | covering tests, whitespace separated (may be empty) |
//! | 5 | ground-truth label (optional) |

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::io::Read;
use std::path::{Path, PathBuf};

use objsim_types::TestId;

use crate::errors::ObjSimError;

/// One candidate patch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchRecord {
    pub id: u64,
    pub suspiciousness: Option<f64>,
    pub label: Option<String>,
    pub patched_methods: BTreeSet<String>,
    pub class_files: Vec<PathBuf>,
    /// Empty when coverage should decide.
    pub covering_tests: BTreeSet<TestId>,
}

/// Read patch records from `path`, resolving relative class-file paths
/// against `base_dir`.
pub fn read_patch_records(path: &Path, base_dir: &Path) -> Result<Vec<PatchRecord>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to read patch records: {}", path.display()))?;
    parse_patch_records(file, base_dir)
        .with_context(|| format!("Failed to parse patch records: {}", path.display()))
}

pub fn parse_patch_records<R: Read>(input: R, base_dir: &Path) -> Result<Vec<PatchRecord>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .comment(Some(b'#'))
        .from_reader(input);

    let mut records = Vec::new();
    let mut seen = BTreeSet::new();
    for (i, row) in reader.records().enumerate() {
        let row_no = i + 1;
        let row = row.with_context(|| format!("Failed to read CSV record {}", row_no))?;
        if row.iter().all(str::is_empty) {
            continue;
        }
        let record = parse_row(row_no, &row, base_dir)?;
        if !seen.insert(record.id) {
            return Err(invalid(row_no, format!("duplicate patch id {}", record.id)).into());
        }
        records.push(record);
    }
    Ok(records)
}

fn parse_row(row_no: usize, row: &csv::StringRecord, base_dir: &Path) -> Result<PatchRecord> {
    if row.len() < 4 {
        return Err(invalid(row_no, format!("expected at least 4 columns, got {}", row.len())).into());
    }
    let field = |i: usize| row.get(i).unwrap_or("");

    let id: u64 = field(0)
        .parse()
        .map_err(|_| invalid(row_no, format!("patch id {:?} is not an integer", field(0))))?;

    let (suspiciousness, mut label) = match field(1) {
        "" => (None, None),
        raw => match raw.parse::<f64>() {
            Ok(value) if value.is_finite() => (Some(value), None),
            _ => (None, Some(raw.to_string())),
        },
    };
    if !field(5).is_empty() {
        label = Some(field(5).to_string());
    }

    let patched_methods: BTreeSet<String> =
        field(2).split_whitespace().map(str::to_string).collect();
    if patched_methods.is_empty() {
        return Err(invalid(row_no, format!("patch {} names no patched method", id)).into());
    }

    let class_files: Vec<PathBuf> = field(3)
        .split_whitespace()
        .map(|p| {
            let p = Path::new(p);
            if p.is_absolute() {
                p.to_path_buf()
            } else {
                base_dir.join(p)
            }
        })
        .collect();
    if class_files.is_empty() {
        return Err(invalid(row_no, format!("patch {} names no class file", id)).into());
    }

    let covering_tests = field(4)
        .split_whitespace()
        .map(|t| TestId::parse(t).map_err(|e| invalid(row_no, e.to_string())))
        .collect::<Result<BTreeSet<_>, _>>()?;

    Ok(PatchRecord {
        id,
        suspiciousness,
        label,
        patched_methods,
        class_files,
        covering_tests,
    })
}

fn invalid(row: usize, reason: String) -> ObjSimError {
    ObjSimError::InvalidRecord { row, reason }
}

/// Read a whitespace-separated list of test names.
pub fn read_test_list(path: &Path) -> Result<BTreeSet<TestId>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read test list: {}", path.display()))?;
    parse_test_names(raw.split_whitespace())
        .with_context(|| format!("Failed to parse test list: {}", path.display()))
}

pub fn parse_test_names<I, S>(names: I) -> Result<BTreeSet<TestId>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    names
        .into_iter()
        .map(|name| {
            TestId::parse(name.as_ref())
                .with_context(|| format!("Invalid test name {:?}", name.as_ref()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(csv: &str) -> Result<Vec<PatchRecord>> {
        parse_patch_records(csv.as_bytes(), Path::new("/project"))
    }

    #[test]
    fn test_parses_full_row() -> Result<()> {
        let records = parse(
            "1,0.75,a.Foo.count() a.Foo.reset(),patches/1/Foo.class,a.FooTest:testCount testReset(a.FooTest),correct\n",
        )?;
        assert_eq!(records.len(), 1);
        let r = &records[0];
        assert_eq!(r.id, 1);
        assert_eq!(r.suspiciousness, Some(0.75));
        assert_eq!(r.label.as_deref(), Some("correct"));
        assert_eq!(r.patched_methods.len(), 2);
        assert_eq!(r.class_files, vec![PathBuf::from("/project/patches/1/Foo.class")]);
        let tests: Vec<_> = r.covering_tests.iter().map(TestId::as_str).collect();
        assert_eq!(tests, vec!["a.FooTest.testCount", "a.FooTest.testReset"]);
        Ok(())
    }

    #[test]
    fn test_optional_columns_may_be_missing() -> Result<()> {
        let records = parse("2,,a.Foo.count(),/abs/Foo.class\n3,incorrect,a.Foo.count(),Foo.class,\n")?;
        assert_eq!(records[0].suspiciousness, None);
        assert!(records[0].covering_tests.is_empty());
        assert_eq!(records[0].class_files, vec![PathBuf::from("/abs/Foo.class")]);
        assert_eq!(records[1].label.as_deref(), Some("incorrect"));
        Ok(())
    }

    #[test]
    fn test_empty_method_set_is_rejected() {
        let err = parse("4,0.1,  ,Foo.class,a.FooTest.t\n").unwrap_err();
        let classified = err.downcast_ref::<ObjSimError>();
        assert!(matches!(
            classified,
            Some(ObjSimError::InvalidRecord { row: 1, .. })
        ));
    }

    #[test]
    fn test_duplicate_ids_are_rejected() {
        let err = parse("5,,a.Foo.m(),Foo.class\n5,,a.Foo.m(),Foo.class\n").unwrap_err();
        assert!(err.to_string().contains("duplicate patch id 5"));
    }

    #[test]
    fn test_blank_and_comment_lines_are_skipped() -> Result<()> {
        let records = parse("# id,susp,methods,files,tests\n\n6,,a.Foo.m(),Foo.class\n")?;
        assert_eq!(records.len(), 1);
        Ok(())
    }

    #[test]
    fn test_parse_test_names_normalizes() -> Result<()> {
        let names = parse_test_names(["a.FooTest::t", "t(a.FooTest)", "a.BarTest.u"])?;
        assert_eq!(names.len(), 2);
        Ok(())
    }
}
