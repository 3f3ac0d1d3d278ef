//! Ordering patches by their distance profiles.
//!
//! Two schemes exist and a run uses exactly one:
//!
//! - [`RankingScheme::Borda`] turns the distances of every commonly covered
//!   test into a per-test ranking of the patches and sums the rank scores.
//!   Failing tests reward patches that move far from the original; passing
//!   tests reward patches that stay close. Patches that cannot be scored are
//!   slotted in by suspiciousness.
//! - [`RankingScheme::Summary`] does not order anything. It reports, per
//!   patch, min/avg/max over the passing and over the failing samples next
//!   to the patch's ground-truth label.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use objsim_types::TestId;

use crate::distance::{aggregate, Aggregate, DistanceSample};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RankingScheme {
    #[default]
    Borda,
    Summary,
}

/// Everything the ranking needs to know about one evaluated patch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchEvaluation {
    pub patch_id: u64,
    pub suspiciousness: Option<f64>,
    pub label: Option<String>,
    pub covering_tests: BTreeSet<TestId>,
    pub samples: Vec<DistanceSample>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchSummary {
    pub patch_id: u64,
    pub passing: Aggregate,
    pub failing: Aggregate,
    pub label: Option<String>,
}

/// Per-patch statistics for the summary scheme.
pub fn summarize(evaluations: &[PatchEvaluation]) -> Vec<PatchSummary> {
    evaluations
        .iter()
        .map(|eval| PatchSummary {
            patch_id: eval.patch_id,
            passing: aggregate(
                eval.samples
                    .iter()
                    .filter(|s| !s.was_failing)
                    .map(|s| s.distance),
            ),
            failing: aggregate(
                eval.samples
                    .iter()
                    .filter(|s| s.was_failing)
                    .map(|s| s.distance),
            ),
            label: eval.label.clone(),
        })
        .collect()
}

/// Tests covered by every patch.
pub fn common_tests(evaluations: &[PatchEvaluation]) -> BTreeSet<TestId> {
    let mut iter = evaluations.iter();
    let Some(first) = iter.next() else {
        return BTreeSet::new();
    };
    let mut common = first.covering_tests.clone();
    for eval in iter {
        common.retain(|t| eval.covering_tests.contains(t));
    }
    common
}

/// Borda score of every patch that could be scored.
///
/// For each common test, each patch contributes its smallest distance on
/// that test when the test originally failed and its largest otherwise. A
/// patch with no sample for the test contributes 0. Patches are sorted from
/// least to most plausible and the score grows by one each time the distance
/// changes, so equal distances share a score.
pub fn borda_scores(evaluations: &[PatchEvaluation]) -> BTreeMap<u64, u64> {
    let mut scores = BTreeMap::new();
    for test in common_tests(evaluations) {
        let was_failing = evaluations
            .iter()
            .flat_map(|e| &e.samples)
            .any(|s| s.test == test && s.was_failing);

        let mut column: Vec<(u64, f64)> = Vec::with_capacity(evaluations.len());
        for eval in evaluations {
            let distances: Vec<f64> = eval
                .samples
                .iter()
                .filter(|s| s.test == test)
                .map(|s| s.distance)
                .collect();
            let value = if distances.is_empty() {
                0.0
            } else if was_failing {
                distances.into_iter().fold(f64::INFINITY, f64::min)
            } else {
                distances.into_iter().fold(f64::NEG_INFINITY, f64::max)
            };
            column.push((eval.patch_id, value));
        }

        column.sort_by(|(ida, a), (idb, b)| {
            let by_distance = if was_failing {
                a.total_cmp(b)
            } else {
                b.total_cmp(a)
            };
            by_distance.then(ida.cmp(idb))
        });

        let mut score = 0u64;
        let mut previous: Option<f64> = None;
        for (patch_id, distance) in column {
            if previous != Some(distance) {
                score += 1;
                previous = Some(distance);
            }
            *scores.entry(patch_id).or_insert(0) += score;
        }
    }
    scores
}

/// Final patch order under the Borda scheme.
///
/// Scored patches come in descending score order (ties by id). Unscored
/// patches are ordered by descending suspiciousness (ties by id); those at
/// least as suspicious as the most suspicious scored patch go first, the rest
/// go last.
pub fn borda_rank(evaluations: &[PatchEvaluation]) -> Vec<u64> {
    let scores = borda_scores(evaluations);

    let mut ranked: Vec<(u64, u64)> = scores.iter().map(|(id, s)| (*id, *s)).collect();
    ranked.sort_by(|(ida, sa), (idb, sb)| sb.cmp(sa).then(ida.cmp(idb)));

    let max_ranked_susp = evaluations
        .iter()
        .filter(|e| scores.contains_key(&e.patch_id))
        .map(suspiciousness)
        .fold(f64::NEG_INFINITY, f64::max);

    let mut unranked: Vec<&PatchEvaluation> = evaluations
        .iter()
        .filter(|e| !scores.contains_key(&e.patch_id))
        .collect();
    unranked.sort_by(|a, b| {
        suspiciousness(b)
            .partial_cmp(&suspiciousness(a))
            .unwrap_or(Ordering::Equal)
            .then(a.patch_id.cmp(&b.patch_id))
    });

    let (before, after): (Vec<&PatchEvaluation>, Vec<&PatchEvaluation>) = unranked
        .into_iter()
        .partition(|e| suspiciousness(e) >= max_ranked_susp);

    before
        .iter()
        .map(|e| e.patch_id)
        .chain(ranked.iter().map(|(id, _)| *id))
        .chain(after.iter().map(|e| e.patch_id))
        .collect()
}

fn suspiciousness(eval: &PatchEvaluation) -> f64 {
    eval.suspiciousness.unwrap_or(f64::NEG_INFINITY)
}
