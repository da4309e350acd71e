//! Streaming latency statistics
//!
//! What this module provides
//! - `Stats`: a numerically stable running mean/variance (Welford) that merges in O(1)
//! - `PowerStats` (in `power`): a log10-bucketed histogram answering percentile queries
//! - `Locked<T>`: per-accumulator exclusive lock with deadlock-free two-operand merges
//!
//! Merge algebra
//! - Merging is associative and commutative up to floating-point rounding, so
//!   summaries accumulated on different processes, in any order, converge to the
//!   same statistic. Everything downstream (the keyed engine, remote windows)
//!   depends on that identity.
//!
//! Wire format
//! - `Stats` serializes as the raw triple `{ n, avg, sq_dist }`; `from_parts` and
//!   `parts` move it in and out losslessly.

pub mod power;

use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use crate::error::{ResiliencyError, Result};

pub use power::PowerStats;

/// Anything that can be accumulated independently and folded together later.
pub trait Accumulator: Default + Clone + Send {
    /// Fold `other` into `self`. Merging an empty accumulator is a no-op.
    fn merge(&mut self, other: &Self);

    /// Number of samples represented.
    fn count(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.count() == 0
    }
}

/// Reject NaN and infinite samples.
pub fn ensure_finite(value: f64) -> Result<()> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(ResiliencyError::invalid_input(format!(
            "finite sample expected, found {value}"
        )))
    }
}

/// Running mean and sum of squared deviations ("M2") for one stream of samples.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Stats {
    n: u64,
    avg: f64,
    sq_dist: f64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an accumulator from a sequence of samples.
    pub fn from_values<I>(values: I) -> Result<Self>
    where
        I: IntoIterator<Item = f64>,
    {
        let mut stats = Self::new();
        for value in values {
            stats.update(value)?;
        }
        Ok(stats)
    }

    /// Import a `(count, mean, sumSqDeviation)` triple.
    pub fn from_parts(n: u64, avg: f64, sq_dist: f64) -> Self {
        if n == 0 {
            return Self::default();
        }
        Self {
            n,
            avg,
            sq_dist: if n <= 1 { 0.0 } else { sq_dist.max(0.0) },
        }
    }

    /// Export the `(count, mean, sumSqDeviation)` triple.
    pub fn parts(&self) -> (u64, f64, f64) {
        (self.n, self.avg, self.sq_dist)
    }

    pub fn n(&self) -> u64 {
        self.n
    }

    pub fn avg(&self) -> f64 {
        self.avg
    }

    pub fn sq_dist(&self) -> f64 {
        self.sq_dist
    }

    /// Add one sample.
    pub fn update(&mut self, value: f64) -> Result<()> {
        ensure_finite(value)?;

        self.n += 1;
        let delta = value - self.avg;
        self.avg += delta / self.n as f64;
        self.sq_dist += delta * (value - self.avg);
        Ok(())
    }

    /// A fresh accumulator equal to `self` merged with `other`.
    pub fn merged(&self, other: &Stats) -> Stats {
        let mut out = *self;
        out.merge(other);
        out
    }

    pub fn variance(&self, sample: bool) -> f64 {
        match (self.n, sample) {
            (0, _) => 0.0,
            (1, true) => 0.0,
            (n, true) => self.sq_dist / (n - 1) as f64,
            (n, false) => self.sq_dist / n as f64,
        }
    }

    pub fn stdev(&self) -> f64 {
        self.variance(false).sqrt()
    }

    /// Downsample the history to `percentage` percent of its weight.
    ///
    /// The mean is preserved; count and M2 shrink together so the variance is
    /// unchanged while newer samples gain relative influence.
    pub fn scale(&mut self, percentage: f64) -> Result<()> {
        if !(0.0..=100.0).contains(&percentage) {
            return Err(ResiliencyError::invalid_input(format!(
                "percentage must be between 0 and 100, found {percentage}"
            )));
        }
        if self.n == 0 {
            return Ok(());
        }

        let n = (self.n as f64 * percentage / 100.0).round() as u64;
        if n == 0 {
            *self = Self::default();
            return Ok(());
        }

        self.sq_dist = if n <= 1 {
            0.0
        } else {
            self.sq_dist * n as f64 / self.n as f64
        };
        self.n = n;
        Ok(())
    }

    /// Compare two accumulators allowing for floating-point drift.
    pub fn approx_eq(&self, other: &Stats, tolerance: f64) -> bool {
        let close = |a: f64, b: f64| (a - b).abs() <= tolerance * a.abs().max(b.abs()).max(1.0);
        self.n == other.n && close(self.avg, other.avg) && close(self.sq_dist, other.sq_dist)
    }
}

impl Accumulator for Stats {
    fn merge(&mut self, other: &Self) {
        if other.n == 0 {
            return;
        }
        if self.n == 0 {
            *self = *other;
            return;
        }

        let n = self.n + other.n;
        let delta = other.avg - self.avg;
        let (n1, n2, nf) = (self.n as f64, other.n as f64, n as f64);
        self.avg += delta * n2 / nf;
        self.sq_dist += other.sq_dist + delta * delta * n1 * n2 / nf;
        self.n = n;
    }

    fn count(&self) -> u64 {
        self.n
    }
}

/// An accumulator behind its own exclusive lock.
#[derive(Debug, Default)]
pub struct Locked<T> {
    inner: Mutex<T>,
}

impl<T: Accumulator> Locked<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    // poisoning ignored: every mutation leaves the accumulator consistent
    fn lock(&self) -> MutexGuard<'_, T> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` with exclusive access to the accumulator.
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut self.lock())
    }

    pub fn snapshot(&self) -> T {
        self.lock().clone()
    }

    /// Swap the accumulator for an empty one, returning the previous contents.
    pub fn take(&self) -> T {
        std::mem::take(&mut *self.lock())
    }

    pub fn replace(&self, value: T) -> T {
        std::mem::replace(&mut *self.lock(), value)
    }

    pub fn merge_value(&self, other: &T) {
        self.lock().merge(other);
    }

    /// Lock `self` and `other` in address order, so two threads pairing the
    /// same accumulators in opposite roles cannot deadlock.
    ///
    /// `other` must not be `self`.
    fn lock_pair<'a>(&'a self, other: &'a Locked<T>) -> (MutexGuard<'a, T>, MutexGuard<'a, T>) {
        if (self as *const Self) < (other as *const Self) {
            let mine = self.lock();
            (mine, other.lock())
        } else {
            let theirs = other.lock();
            (self.lock(), theirs)
        }
    }

    /// Merge another live accumulator into this one.
    pub fn merge_from(&self, other: &Locked<T>) {
        if std::ptr::eq(self, other) {
            let copy = self.snapshot();
            self.merge_value(&copy);
            return;
        }

        let (mut mine, theirs) = self.lock_pair(other);
        mine.merge(&theirs);
    }

    /// Combined contents of both accumulators, read under both locks.
    pub fn merged_with(&self, other: &Locked<T>) -> T {
        if std::ptr::eq(self, other) {
            let mut copy = self.snapshot();
            let again = copy.clone();
            copy.merge(&again);
            return copy;
        }

        let (mine, theirs) = self.lock_pair(other);
        let mut combined = mine.clone();
        combined.merge(&theirs);
        combined
    }

    /// Empty this accumulator into `other` in one step, returning what moved.
    ///
    /// No reader pairing the two through `merged_with` observes the samples
    /// in both places or in neither.
    pub fn drain_into(&self, other: &Locked<T>) -> T {
        if std::ptr::eq(self, other) {
            return self.snapshot();
        }

        let (mut mine, mut theirs) = self.lock_pair(other);
        let moved = std::mem::take(&mut *mine);
        theirs.merge(&moved);
        moved
    }
}

impl Locked<Stats> {
    pub fn update(&self, value: f64) -> Result<()> {
        self.lock().update(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;

    fn stats(values: &[f64]) -> Stats {
        Stats::from_values(values.iter().copied()).unwrap()
    }

    #[test]
    fn welford_matches_textbook_values() {
        let s = stats(&[1.0, 2.0, 3.0, 4.0, 5.0]);
        assert_eq!(s.n(), 5);
        assert!((s.avg() - 3.0).abs() < 1e-12);
        assert!((s.stdev() - 2f64.sqrt()).abs() < 1e-12);
        assert!((s.variance(true) - 2.5).abs() < 1e-12);
    }

    #[test]
    fn merged_parts_equal_sequential() {
        let mut left = stats(&[1.0, 2.0]);
        let right = stats(&[3.0, 4.0, 5.0]);
        left.merge(&right);

        let whole = stats(&[1.0, 2.0, 3.0, 4.0, 5.0]);
        assert_eq!(left.n(), whole.n());
        assert!((left.avg() - whole.avg()).abs() < 1e-9);
        assert!((left.variance(false) - whole.variance(false)).abs() < 1e-9);
    }

    #[test]
    fn merge_with_empty_is_identity() {
        let mut s = stats(&[10.0, 20.0, 30.0]);
        let before = s;
        s.merge(&Stats::new());
        assert_eq!(s, before);

        let mut empty = Stats::new();
        empty.merge(&before);
        assert_eq!(empty, before);
    }

    #[test]
    fn single_sample_has_no_deviation() {
        let s = stats(&[42.0]);
        assert_eq!(s.sq_dist(), 0.0);
        assert_eq!(s.variance(true), 0.0);
        assert_eq!(Stats::new().variance(false), 0.0);
    }

    #[test]
    fn rejects_non_finite_samples() {
        let mut s = Stats::new();
        assert!(matches!(
            s.update(f64::NAN),
            Err(ResiliencyError::InvalidInput { .. })
        ));
        assert!(s.update(f64::INFINITY).is_err());
        assert_eq!(s.n(), 0);
    }

    #[test]
    fn scale_preserves_mean_and_variance() {
        let mut s = stats(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0]);
        let (avg, var) = (s.avg(), s.variance(false));
        s.scale(50.0).unwrap();
        assert_eq!(s.n(), 5);
        assert!((s.avg() - avg).abs() < 1e-12);
        assert!((s.variance(false) - var).abs() < 1e-9);

        s.scale(0.0).unwrap();
        assert!(s.is_empty());
        assert!(s.scale(101.0).is_err());
    }

    #[test]
    fn parts_round_trip_through_json() {
        let s = stats(&[3.0, 7.0, 11.0]);
        let json = serde_json::to_string(&s).unwrap();
        assert!(json.contains("\"sq_dist\""));
        let back: Stats = serde_json::from_str(&json).unwrap();
        assert_eq!(back, s);

        let (n, avg, sq) = s.parts();
        assert_eq!(Stats::from_parts(n, avg, sq), s);
    }

    #[test]
    fn locked_self_merge_doubles_weight() {
        let locked = Locked::new(stats(&[2.0, 4.0]));
        locked.merge_from(&locked);
        let s = locked.snapshot();
        assert_eq!(s.n(), 4);
        assert!((s.avg() - 3.0).abs() < 1e-12);
    }

    #[test]
    fn locked_bidirectional_merges_do_not_deadlock() {
        let a = Arc::new(Locked::new(stats(&[1.0])));
        let b = Arc::new(Locked::new(stats(&[2.0])));

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let (a, b) = (a.clone(), b.clone());
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        if i % 2 == 0 {
                            a.merge_from(&b);
                            a.replace(stats(&[1.0]));
                        } else {
                            b.merge_from(&a);
                            b.replace(stats(&[2.0]));
                        }
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(a.snapshot().n(), 1);
    }

    #[test]
    fn drain_moves_samples_in_one_step() {
        let local = Locked::new(stats(&[1.0, 3.0]));
        let remote = Locked::new(stats(&[5.0]));

        let moved = local.drain_into(&remote);
        assert_eq!(moved.n(), 2);
        assert!(local.snapshot().is_empty());
        assert_eq!(remote.snapshot().n(), 3);
        let combined = local.merged_with(&remote);
        assert_eq!(combined.n(), 3);
        assert!((combined.avg() - 3.0).abs() < 1e-12);
        assert_eq!(remote.merged_with(&remote).n(), 6);
    }

    #[test]
    fn take_leaves_empty_accumulator() {
        let locked = Locked::new(Stats::new());
        locked.update(5.0).unwrap();
        let taken = locked.take();
        assert_eq!(taken.n(), 1);
        assert!(locked.snapshot().is_empty());
    }

    proptest! {
        #[test]
        fn any_split_merges_to_sequential(
            values in proptest::collection::vec(0.0f64..1.0e4, 1..200),
            cut_a in 0usize..200,
            cut_b in 0usize..200,
        ) {
            let len = values.len();
            let (mut x, mut y) = (cut_a.min(len), cut_b.min(len));
            if x > y { std::mem::swap(&mut x, &mut y); }

            let whole = stats(&values);
            let p1 = stats(&values[..x]);
            let p2 = stats(&values[x..y]);
            let p3 = stats(&values[y..]);

            let forward = p1.merged(&p2).merged(&p3);
            let backward = p3.merged(&p1.merged(&p2));
            let shuffled = p2.merged(&p3).merged(&p1);

            prop_assert!(forward.approx_eq(&whole, 1e-7));
            prop_assert!(backward.approx_eq(&whole, 1e-7));
            prop_assert!(shuffled.approx_eq(&whole, 1e-7));
        }

        #[test]
        fn variance_is_ordered_and_non_negative(
            values in proptest::collection::vec(-1.0e3f64..1.0e3, 0..100),
        ) {
            let s = stats(&values);
            prop_assert!(s.variance(false) >= 0.0);
            if s.n() > 1 {
                prop_assert!(s.variance(true) >= s.variance(false));
            }
        }
    }
}
