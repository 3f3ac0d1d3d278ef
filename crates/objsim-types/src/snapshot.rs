//! Captured object state.
//!
//! A [`Snapshot`] is a detached copy of a runtime value taken at a method exit.
//! The orchestrator never looks inside one except through a [`StateDistance`]
//! implementation, so any metric that is total and non-negative can be
//! plugged in. [`StructuralDistance`] is the default.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::names::split_member_name;

/// A detached value captured from the program under test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Snapshot {
    Null,
    Bool(bool),
    Int(i64),
    Float(#[serde(with = "float_repr")] f64),
    Str(String),
    Array(Vec<Snapshot>),
    Object {
        class: String,
        fields: BTreeMap<String, Snapshot>,
    },
    /// An exception that escaped the method.
    Thrown {
        class: String,
        #[serde(default)]
        message: Option<String>,
    },
}

/// JSON has no NaN or infinities, so those travel as strings.
mod float_repr {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_nan() {
            serializer.serialize_str("NaN")
        } else if value.is_infinite() {
            serializer.serialize_str(if *value > 0.0 { "Infinity" } else { "-Infinity" })
        } else {
            serializer.serialize_f64(*value)
        }
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(f64),
        Text(String),
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        match Repr::deserialize(deserializer)? {
            Repr::Number(v) => Ok(v),
            Repr::Text(text) => match text.as_str() {
                "NaN" => Ok(f64::NAN),
                "Infinity" => Ok(f64::INFINITY),
                "-Infinity" => Ok(f64::NEG_INFINITY),
                other => Err(serde::de::Error::custom(format!(
                    "invalid float literal: {other}"
                ))),
            },
        }
    }
}

impl Snapshot {
    /// Drop every field the whitelist excludes, recursively.
    pub fn prune(&mut self, whitelist: &FieldWhitelist) {
        match self {
            Snapshot::Object { class, fields } => {
                fields.retain(|name, _| whitelist.allows(class, name));
                for value in fields.values_mut() {
                    value.prune(whitelist);
                }
            }
            Snapshot::Array(items) => {
                for item in items {
                    item.prune(whitelist);
                }
            }
            _ => {}
        }
    }
}

/// The state observed at one exit of a method.
///
/// `slots[0]` holds the returned value or the thrown exception (`Null` for
/// `void` methods), followed by the receiver when there is one, followed by
/// the declared parameters in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitSnapshot {
    pub slots: Vec<Snapshot>,
}

impl ExitSnapshot {
    pub fn new(slots: Vec<Snapshot>) -> Self {
        Self { slots }
    }

    /// Returned value or thrown exception.
    pub fn outcome(&self) -> Option<&Snapshot> {
        self.slots.first()
    }

    pub fn prune(&mut self, whitelist: &FieldWhitelist) {
        for slot in &mut self.slots {
            slot.prune(whitelist);
        }
    }
}

/// Per-class set of fields worth capturing.
///
/// Classes that never appear in the whitelist keep all of their fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldWhitelist {
    classes: BTreeMap<String, BTreeSet<String>>,
}

impl FieldWhitelist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from fully qualified field names (`pkg.Class.field`).
    pub fn from_field_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut whitelist = Self::new();
        for name in names {
            if let Some((class, field)) = split_member_name(name.as_ref()) {
                whitelist.insert(class, field);
            }
        }
        whitelist
    }

    pub fn insert(&mut self, class: &str, field: &str) {
        self.classes
            .entry(class.to_string())
            .or_default()
            .insert(field.to_string());
    }

    pub fn allows(&self, class: &str, field: &str) -> bool {
        match self.classes.get(class) {
            Some(fields) => fields.contains(field),
            None => true,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

/// A total, non-negative distance between two snapshots.
pub trait StateDistance {
    fn distance(&self, a: &Snapshot, b: &Snapshot) -> f64;
}

/// Default metric: counts structural differences, using numeric difference
/// for numbers and edit distance for strings.
#[derive(Debug, Clone, Copy, Default)]
pub struct StructuralDistance;

impl StateDistance for StructuralDistance {
    fn distance(&self, a: &Snapshot, b: &Snapshot) -> f64 {
        structural(a, b)
    }
}

fn structural(a: &Snapshot, b: &Snapshot) -> f64 {
    use Snapshot::*;
    match (a, b) {
        (Null, Null) => 0.0,
        (Bool(x), Bool(y)) => mismatch(x != y),
        (Int(x), Int(y)) => (*x as f64 - *y as f64).abs(),
        (Float(x), Float(y)) => float_distance(*x, *y),
        (Int(x), Float(y)) | (Float(y), Int(x)) => float_distance(*x as f64, *y),
        (Str(x), Str(y)) => levenshtein(x, y) as f64,
        (Array(xs), Array(ys)) => {
            let common: f64 = xs.iter().zip(ys).map(|(x, y)| structural(x, y)).sum();
            common + xs.len().abs_diff(ys.len()) as f64
        }
        (
            Object {
                class: ca,
                fields: fa,
            },
            Object {
                class: cb,
                fields: fb,
            },
        ) => {
            let mut total = mismatch(ca != cb);
            for (name, va) in fa {
                total += match fb.get(name) {
                    Some(vb) => structural(va, vb),
                    None => 1.0,
                };
            }
            total += fb.keys().filter(|name| !fa.contains_key(*name)).count() as f64;
            total
        }
        (
            Thrown {
                class: ca,
                message: ma,
            },
            Thrown {
                class: cb,
                message: mb,
            },
        ) => mismatch(ca != cb) + mismatch(ma != mb),
        _ => 1.0,
    }
}

fn mismatch(differs: bool) -> f64 {
    if differs {
        1.0
    } else {
        0.0
    }
}

fn float_distance(x: f64, y: f64) -> f64 {
    if x.is_nan() || y.is_nan() {
        return mismatch(x.is_nan() != y.is_nan());
    }
    if x.is_infinite() || y.is_infinite() {
        return mismatch(x != y);
    }
    (x - y).abs()
}

fn levenshtein(a: &str, b: &str) -> usize {
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];
    for (i, ca) in a.chars().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != *cb);
            curr[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}
