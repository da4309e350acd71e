//! Log-scale latency histogram.
//!
//! Bucket `i` counts samples in `(10^(i-1), 10^i]`. Percentiles come back as the
//! ceiling of the bucket that contains them, so answers are upper bounds within
//! one order of magnitude, at O(1) cost per update and a handful of buckets of
//! memory per key.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{ResiliencyError, Result};
use crate::stats::Accumulator;

/// Smallest representable sample; anything at or below it lands in bucket 0.
pub const MIN_VALUE: f64 = 1.0;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowerStats {
    n: u64,
    buckets: BTreeMap<i32, u64>,
}

impl PowerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_values<I>(values: I) -> Result<Self>
    where
        I: IntoIterator<Item = f64>,
    {
        let mut stats = Self::new();
        for value in values {
            stats.add(value)?;
        }
        Ok(stats)
    }

    pub fn n(&self) -> u64 {
        self.n
    }

    /// Non-empty buckets as `(index, count)`, lowest index first.
    pub fn buckets(&self) -> impl Iterator<Item = (i32, u64)> + '_ {
        self.buckets.iter().map(|(i, c)| (*i, *c))
    }

    pub fn bucket_for(value: f64) -> i32 {
        value.max(MIN_VALUE).log10().ceil() as i32
    }

    pub fn add(&mut self, value: f64) -> Result<()> {
        if value.is_nan() {
            return Err(ResiliencyError::invalid_input("numeric sample expected, found NaN"));
        }
        if value == f64::INFINITY {
            return Err(ResiliencyError::invalid_input("finite sample expected"));
        }

        *self.buckets.entry(Self::bucket_for(value)).or_insert(0) += 1;
        self.n += 1;
        Ok(())
    }

    /// Upper-bound estimate of the `p`th percentile.
    pub fn percentile(&self, p: f64) -> Result<f64> {
        if !(0.0..=100.0).contains(&p) {
            return Err(ResiliencyError::invalid_input(format!(
                "percentile must be between 0 and 100, found {p}"
            )));
        }
        if self.n == 0 {
            return Ok(0.0);
        }

        let mut threshold = ((100.0 - p) / 100.0 * self.n as f64).floor() as u64;
        let mut lowest = 0;
        for (&index, &count) in self.buckets.iter().rev() {
            if count >= threshold {
                return Ok(10f64.powi(index));
            }
            threshold -= count;
            lowest = index;
        }

        Ok(10f64.powi(lowest))
    }

    pub fn p99(&self) -> Result<f64> {
        self.percentile(99.0)
    }

    /// Keep `percentage` percent of every bucket, rounding each count.
    pub fn scale(&mut self, percentage: f64) -> Result<()> {
        if !(0.0..=100.0).contains(&percentage) {
            return Err(ResiliencyError::invalid_input(format!(
                "percentage must be between 0 and 100, found {percentage}"
            )));
        }

        let factor = percentage / 100.0;
        for count in self.buckets.values_mut() {
            *count = (*count as f64 * factor).round() as u64;
        }
        self.buckets.retain(|_, count| *count > 0);
        self.n = self.buckets.values().sum();
        Ok(())
    }

    pub fn reset(&mut self) {
        self.n = 0;
        self.buckets.clear();
    }
}

impl Accumulator for PowerStats {
    fn merge(&mut self, other: &Self) {
        for (&index, &count) in &other.buckets {
            *self.buckets.entry(index).or_insert(0) += count;
        }
        self.n += other.n;
    }

    fn count(&self) -> u64 {
        self.n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn power(values: &[f64]) -> PowerStats {
        PowerStats::from_values(values.iter().copied()).unwrap()
    }

    #[test]
    fn buckets_by_order_of_magnitude() {
        assert_eq!(PowerStats::bucket_for(1.0), 0);
        assert_eq!(PowerStats::bucket_for(2.0), 1);
        assert_eq!(PowerStats::bucket_for(10.0), 1);
        assert_eq!(PowerStats::bucket_for(10.5), 2);
        assert_eq!(PowerStats::bucket_for(-5.0), 0);
        assert_eq!(PowerStats::bucket_for(0.0), 0);
    }

    #[test]
    fn constant_samples_report_bucket_ceiling() {
        let s = power(&[42.0; 25]);
        assert_eq!(s.percentile(100.0).unwrap(), 100.0);
        assert_eq!(s.p99().unwrap(), 100.0);
        assert_eq!(s.percentile(0.0).unwrap(), 100.0);
    }

    #[test]
    fn tail_percentile_finds_slow_bucket() {
        // 98 fast calls, 2 slow ones
        let mut values = vec![5.0; 98];
        values.extend([5_000.0, 5_000.0]);
        let s = power(&values);
        assert_eq!(s.p99().unwrap(), 10_000.0);
        assert_eq!(s.percentile(50.0).unwrap(), 10.0);
    }

    #[test]
    fn empty_histogram_reports_zero() {
        assert_eq!(PowerStats::new().p99().unwrap(), 0.0);
    }

    #[test]
    fn rejects_bad_inputs() {
        let mut s = PowerStats::new();
        assert!(s.add(f64::NAN).is_err());
        assert!(s.percentile(100.5).is_err());
        assert!(s.percentile(-1.0).is_err());
        assert!(s.scale(200.0).is_err());
    }

    #[test]
    fn merge_sums_buckets() {
        let mut a = power(&[1.0, 50.0]);
        let b = power(&[60.0, 700.0]);
        a.merge(&b);
        assert_eq!(a.n(), 4);
        let buckets: Vec<_> = a.buckets().collect();
        assert_eq!(buckets, vec![(0, 1), (2, 2), (3, 1)]);

        let before = a.clone();
        a.merge(&PowerStats::new());
        assert_eq!(a, before);
    }

    #[test]
    fn scale_ages_out_history() {
        let mut s = power(&[5.0, 5.0, 5.0, 5.0, 500.0]);
        s.scale(50.0).unwrap();
        // 4 -> 2, 1 -> 1 (0.5 rounds away from zero)
        assert_eq!(s.n(), 3);
        s.scale(0.0).unwrap();
        assert_eq!(s.n(), 0);
        assert_eq!(s.buckets().count(), 0);
    }

    #[test]
    fn reset_clears_everything() {
        let mut s = power(&[3.0, 30.0]);
        s.reset();
        assert_eq!(s, PowerStats::new());
    }
}
