//! Turning two snapshot sequences into distance samples.
//!
//! For one test, the exits observed against the original program are paired
//! with the exits observed against the patched program by position. Each
//! pair yields one sample. A sequence that is missing or has a different
//! length cannot be paired at all and yields a single `+inf` sample, which
//! in turn makes every statistic computed over it `+inf`.

use serde::{Deserialize, Serialize};

use objsim_types::{ExitSnapshot, Snapshot, StateDistance, StructuralDistance, TestId};

/// Which exit slots take part in the comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SlotPolicy {
    /// Compare every slot of every exit.
    #[default]
    CompareAll,
    /// For originally failing tests, ignore slot 0 (the returned value or
    /// thrown exception): a correct patch is expected to change it.
    SkipOutcomeSlotForFailing,
}

impl SlotPolicy {
    fn skips_outcome(self, was_failing: bool) -> bool {
        matches!(self, SlotPolicy::SkipOutcomeSlotForFailing) && was_failing
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistanceSample {
    pub test: TestId,
    pub was_failing: bool,
    pub distance: f64,
}

/// min / avg / max over a pool of samples.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Aggregate {
    pub min: f64,
    pub avg: f64,
    pub max: f64,
}

impl Aggregate {
    pub const INFINITE: Self = Self {
        min: f64::INFINITY,
        avg: f64::INFINITY,
        max: f64::INFINITY,
    };
}

/// Summarize distances. An empty pool is `{0, 0, 0}`; any `+inf` sample
/// makes all three `+inf`.
pub fn aggregate<I>(distances: I) -> Aggregate
where
    I: IntoIterator<Item = f64>,
{
    let mut count = 0usize;
    let mut sum = 0.0;
    let mut min = f64::INFINITY;
    let mut max = 0.0f64;
    for d in distances {
        if d.is_infinite() {
            return Aggregate::INFINITE;
        }
        count += 1;
        sum += d;
        min = min.min(d);
        max = max.max(d);
    }
    if count == 0 {
        return Aggregate::default();
    }
    Aggregate {
        min,
        avg: sum / count as f64,
        max,
    }
}

#[derive(Debug, Clone, Default)]
pub struct DistanceEngine<M = StructuralDistance> {
    metric: M,
    policy: SlotPolicy,
}

impl DistanceEngine<StructuralDistance> {
    pub fn new(policy: SlotPolicy) -> Self {
        Self {
            metric: StructuralDistance,
            policy,
        }
    }
}

impl<M: StateDistance> DistanceEngine<M> {
    pub fn with_metric(metric: M, policy: SlotPolicy) -> Self {
        Self { metric, policy }
    }

    pub fn policy(&self) -> SlotPolicy {
        self.policy
    }

    /// Distance between two snapshots. Equal snapshots are 0 without
    /// consulting the metric.
    pub fn snapshot_distance(&self, a: &Snapshot, b: &Snapshot) -> f64 {
        if a == b {
            return 0.0;
        }
        let d = self.metric.distance(a, b);
        if d.is_nan() {
            f64::INFINITY
        } else {
            d.max(0.0)
        }
    }

    /// Sum of the per-slot distances of two exits.
    pub fn exit_distance(&self, a: &ExitSnapshot, b: &ExitSnapshot, was_failing: bool) -> f64 {
        if a.slots.len() != b.slots.len() {
            return f64::INFINITY;
        }
        let skip = usize::from(self.policy.skips_outcome(was_failing));
        a.slots
            .iter()
            .zip(&b.slots)
            .skip(skip)
            .map(|(x, y)| self.snapshot_distance(x, y))
            .sum()
    }

    /// Samples for one test. `None` means the run produced no result for the
    /// test.
    pub fn sample_distances(
        &self,
        test: &TestId,
        was_failing: bool,
        original: Option<&[ExitSnapshot]>,
        patched: Option<&[ExitSnapshot]>,
    ) -> Vec<DistanceSample> {
        let sample = |distance| DistanceSample {
            test: test.clone(),
            was_failing,
            distance,
        };
        match (original, patched) {
            (Some(orig), Some(patch)) if orig.len() == patch.len() => orig
                .iter()
                .zip(patch)
                .map(|(a, b)| sample(self.exit_distance(a, b, was_failing)))
                .collect(),
            _ => vec![sample(f64::INFINITY)],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn test_id() -> TestId {
        TestId::parse("a.FooTest.t").unwrap()
    }

    fn exit(values: &[i64]) -> ExitSnapshot {
        ExitSnapshot::new(values.iter().map(|v| Snapshot::Int(*v)).collect())
    }

    #[test]
    fn test_aggregate_empty_is_zero() {
        assert_eq!(
            aggregate(Vec::new()),
            Aggregate {
                min: 0.0,
                avg: 0.0,
                max: 0.0
            }
        );
    }

    #[test]
    fn test_aggregate_basic() {
        let agg = aggregate([1.0, 2.0, 6.0]);
        assert_eq!(agg.min, 1.0);
        assert_eq!(agg.avg, 3.0);
        assert_eq!(agg.max, 6.0);
    }

    #[test]
    fn test_aggregate_infinity_escalates() {
        assert_eq!(aggregate([0.0, f64::INFINITY, 2.0]), Aggregate::INFINITE);
    }

    #[test]
    fn test_identical_sequences_give_zero_samples() {
        let engine = DistanceEngine::new(SlotPolicy::CompareAll);
        let seq = vec![exit(&[1, 2]), exit(&[3, 4])];
        let samples = engine.sample_distances(&test_id(), false, Some(&seq[..]), Some(&seq[..]));
        assert_eq!(samples.len(), 2);
        assert!(samples.iter().all(|s| s.distance == 0.0));
        assert_eq!(aggregate(samples.iter().map(|s| s.distance)), Aggregate::default());
    }

    #[test]
    fn test_one_differing_exit() {
        let engine = DistanceEngine::new(SlotPolicy::CompareAll);
        let orig = vec![exit(&[1]), exit(&[3])];
        let patched = vec![exit(&[1]), exit(&[5])];
        let samples = engine.sample_distances(&test_id(), false, Some(&orig[..]), Some(&patched[..]));
        let agg = aggregate(samples.iter().map(|s| s.distance));
        assert_eq!(agg, Aggregate { min: 0.0, avg: 1.0, max: 2.0 });
    }

    #[test]
    fn test_length_mismatch_is_single_infinite_sample() {
        let engine = DistanceEngine::new(SlotPolicy::CompareAll);
        let orig = vec![exit(&[1]), exit(&[2]), exit(&[3])];
        let patched = vec![exit(&[1]), exit(&[2])];
        let samples = engine.sample_distances(&test_id(), true, Some(&orig[..]), Some(&patched[..]));
        assert_eq!(samples.len(), 1);
        assert!(samples[0].distance.is_infinite());
        assert!(samples[0].was_failing);
    }

    #[test]
    fn test_single_equal_exit_gives_zero_pool() {
        let engine = DistanceEngine::new(SlotPolicy::CompareAll);
        let seq = vec![exit(&[4, 7])];
        let samples = engine.sample_distances(&test_id(), false, Some(&seq[..]), Some(&seq[..]));
        assert_eq!(
            aggregate(samples.iter().map(|s| s.distance)),
            Aggregate { min: 0.0, avg: 0.0, max: 0.0 }
        );
    }

    #[test]
    fn test_dropped_exit_makes_whole_pool_infinite() {
        let engine = DistanceEngine::new(SlotPolicy::CompareAll);
        let orig = vec![exit(&[1]), exit(&[1])];
        let patched = vec![exit(&[1])];
        let samples = engine.sample_distances(&test_id(), false, Some(&orig[..]), Some(&patched[..]));
        let mut pool: Vec<f64> = vec![0.0, 3.0];
        pool.extend(samples.iter().map(|s| s.distance));
        assert_eq!(aggregate(pool), Aggregate::INFINITE);
    }

    #[test]
    fn test_missing_side_is_infinite() {
        let engine = DistanceEngine::new(SlotPolicy::CompareAll);
        let seq = vec![exit(&[1])];
        let samples = engine.sample_distances(&test_id(), false, Some(&seq[..]), None);
        assert_eq!(samples.len(), 1);
        assert!(samples[0].distance.is_infinite());
    }

    #[test]
    fn test_both_empty_gives_no_samples() {
        let engine = DistanceEngine::new(SlotPolicy::CompareAll);
        let samples = engine.sample_distances(&test_id(), false, Some(&[][..]), Some(&[][..]));
        assert!(samples.is_empty());
    }

    #[test]
    fn test_skip_outcome_slot_only_for_failing_tests() {
        let engine = DistanceEngine::new(SlotPolicy::SkipOutcomeSlotForFailing);
        let a = exit(&[10, 1]);
        let b = exit(&[20, 1]);
        assert_eq!(engine.exit_distance(&a, &b, true), 0.0);
        assert_eq!(engine.exit_distance(&a, &b, false), 10.0);
    }

    struct CountingMetric<'a>(&'a Cell<usize>);

    impl StateDistance for CountingMetric<'_> {
        fn distance(&self, _a: &Snapshot, _b: &Snapshot) -> f64 {
            self.0.set(self.0.get() + 1);
            1.0
        }
    }

    #[test]
    fn test_equal_snapshots_skip_the_metric() {
        let calls = Cell::new(0);
        let engine = DistanceEngine::with_metric(CountingMetric(&calls), SlotPolicy::CompareAll);
        assert_eq!(engine.snapshot_distance(&Snapshot::Int(1), &Snapshot::Int(1)), 0.0);
        assert_eq!(calls.get(), 0);
        assert_eq!(engine.snapshot_distance(&Snapshot::Int(1), &Snapshot::Int(2)), 1.0);
        assert_eq!(calls.get(), 1);
    }
}
