//! Test and member names.
//!
//! Test runners, coverage tools and repair tools spell the same test in
//! several ways. [`TestId`] folds all of them into one canonical
//! `package.Class.method` string so that covering-test lists, failing-test
//! oracles and worker reports can be joined on it.
//!
//! | Input form                      | Canonical form      |
//! |---------------------------------|---------------------|
//! | `a.b.FooTest.test`              | `a.b.FooTest.test`  |
//! | `a.b.FooTest:test`              | `a.b.FooTest.test`  |
//! | `a.b.FooTest::test`             | `a.b.FooTest.test`  |
//! | `a.b.FooTest.test(int)`         | `a.b.FooTest.test`  |
//! | `test(a.b.FooTest)`             | `a.b.FooTest.test`  |
//! | `[runner] test(a.b.FooTest)`    | `a.b.FooTest.test`  |
//! | `test[0: x](a.b.FooTest)`       | `a.b.FooTest.test[0: x]` |
//!
//! A bracketed parameter suffix is kept verbatim.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Error produced when a name cannot be normalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NameError {
    Empty,
    Malformed(String),
}

impl fmt::Display for NameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NameError::Empty => write!(f, "empty test name"),
            NameError::Malformed(raw) => write!(f, "malformed test name: {:?}", raw),
        }
    }
}

impl std::error::Error for NameError {}

/// Canonical test identifier (`package.Class.method`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TestId(String);

impl TestId {
    /// Normalize any supported spelling of a test name.
    pub fn parse(raw: &str) -> Result<Self, NameError> {
        let mut name = raw.trim();
        // Extended runner descriptions carry a `[...]` prefix separated by a
        // space. A bare word before the first space is also a prefix, unless
        // it opens a parameter list.
        if let Some(rest) = name.strip_prefix('[') {
            if let Some(close) = rest.find("] ") {
                name = rest[close + 2..].trim();
            }
        } else if let Some(space) = name.find(' ') {
            if !name[..space].contains(['(', '[']) {
                name = name[space + 1..].trim();
            }
        }
        if name.is_empty() {
            return Err(NameError::Empty);
        }

        let (head, inner) = match paren_start(name) {
            Some(open) => (&name[..open], Some(name[open + 1..].trim_end_matches(')'))),
            None => (name, None),
        };
        let (base, params) = head.split_at(head.find('[').unwrap_or(head.len()));
        let base = match inner {
            Some(inner) if is_description_form(base, inner) => format!("{}.{}", inner, base),
            _ => base.to_string(),
        };

        let mut canonical = base.replace(':', ".");
        while canonical.contains("..") {
            canonical = canonical.replace("..", ".");
        }
        let canonical = canonical.trim_matches('.').to_string();

        if canonical.is_empty() {
            return Err(NameError::Malformed(raw.to_string()));
        }
        if !canonical.contains('.') {
            return Err(NameError::Malformed(raw.to_string()));
        }
        Ok(Self(canonical + params))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The class part of the identifier.
    pub fn class_name(&self) -> &str {
        split_member_name(&self.0).map(|(c, _)| c).unwrap_or("")
    }

    /// The method part of the identifier.
    pub fn method_name(&self) -> &str {
        split_member_name(&self.0).map(|(_, m)| m).unwrap_or(&self.0)
    }
}

/// Offset of the `(` opening the argument list, skipping a leading
/// `[...]` parameter group.
fn paren_start(name: &str) -> Option<usize> {
    let from = match (name.find('['), name.find('(')) {
        (Some(bracket), Some(paren)) if bracket < paren => name[bracket..]
            .find(']')
            .map_or(name.len(), |close| bracket + close + 1),
        _ => 0,
    };
    name[from..].find('(').map(|open| from + open)
}

/// `method(pkg.Class)`: the head is a bare method name and the parenthesized
/// part names a class.
fn is_description_form(head: &str, inner: &str) -> bool {
    !head.is_empty()
        && !head.contains('.')
        && !head.contains(':')
        && inner.contains('.')
        && !inner.contains(',')
        && !inner.contains(' ')
}

impl fmt::Display for TestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TestId {
    type Err = NameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for TestId {
    type Error = NameError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<TestId> for String {
    fn from(id: TestId) -> Self {
        id.0
    }
}

/// Split `pkg.Class.member(params)` into `("pkg.Class", "member")`.
///
/// Parameter lists are ignored when locating the separating dot.
pub fn split_member_name(name: &str) -> Option<(&str, &str)> {
    let head = match paren_start(name) {
        Some(open) => &name[..open],
        None => name,
    };
    let dot = head[..head.find('[').unwrap_or(head.len())].rfind('.')?;
    Some((&head[..dot], &head[dot + 1..]))
}
