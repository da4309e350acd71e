//! Adaptive timeout policy
//!
//! What this module provides
//! - `TimeoutPolicy::decide`: maps (mode, requested max, historical latency) to an
//!   ordered list of per-attempt timeouts, in milliseconds
//! - `LatencyEstimate`: what the policy needs from an accumulator, implemented
//!   by both `Stats` (mean + 3 stdev) and `PowerStats` (bucketed p99)
//! - `order_of_magnitude_ceil` / `power_ceil`: the rounding steps applied to
//!   the p99 estimate so timeouts do not move with every sample
//!
//! Decision table (after rounding and flooring p99)
//! - observe mode, or fewer than `threshold` samples: `[max]`
//! - no max: `[p99, 10 * p99]`
//! - `p99 < max` and `max - p99 >= p99`: `[p99, max - p99]`
//! - `p99 < max` otherwise: `[p99, max]`, the timeout was raised
//! - `p99 >= max`: `[max]`
//!
//! The policy is pure; metrics and unit conversion live with the caller.

use crate::error::{ResiliencyError, Result};
use crate::runtime::{Mode, DEFAULT_TIMEOUT_MIN};
use crate::stats::{PowerStats, Stats};

/// Samples required before historical latency influences timeouts.
pub const DEFAULT_THRESHOLD: u64 = 100;

/// Multiplier applied to the first timeout when the caller gave no max.
const LENIENT_FACTOR: f64 = 10.0;

/// Source of a tail-latency estimate.
pub trait LatencyEstimate {
    fn samples(&self) -> u64;

    /// Estimated 99th percentile, in the unit samples were recorded in.
    fn p99(&self) -> Result<f64>;
}

impl LatencyEstimate for Stats {
    fn samples(&self) -> u64 {
        self.n()
    }

    fn p99(&self) -> Result<f64> {
        Ok(self.avg() + 3.0 * self.stdev())
    }
}

impl LatencyEstimate for PowerStats {
    fn samples(&self) -> u64 {
        self.n()
    }

    fn p99(&self) -> Result<f64> {
        PowerStats::p99(self)
    }
}

/// Smallest power of ten not below `x`. Zero and negatives give 0.
pub fn order_of_magnitude_ceil(x: f64) -> f64 {
    if x <= 0.0 {
        return 0.0;
    }
    10f64.powi(x.log10().ceil() as i32)
}

/// Round up to a multiple of the leading digit's place value: 234 -> 300.
pub fn power_ceil(x: f64) -> f64 {
    if x <= 0.0 {
        return 0.0;
    }

    let mut magnitude = 10f64.powi(x.log10().floor() as i32);
    // log10 can land just below an exact power of ten
    if magnitude * 10.0 <= x {
        magnitude *= 10.0;
    }
    (x / magnitude - 1e-9).ceil() * magnitude
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyOutcome {
    /// Observe mode; the caller's max is untouched
    Observe,
    /// Not enough samples to act on
    InsufficientData,
    /// Two attempts carved out of the caller's budget
    Dynamic,
    /// Budget too thin to split; the second attempt gets the full max
    Raised,
    /// Historical p99 already exceeds the max; single attempt
    TooLow,
    /// No max given; the second attempt is ten times the first
    Missing,
}

impl PolicyOutcome {
    /// Event counter suffix, for outcomes worth reporting.
    pub fn event(&self) -> Option<&'static str> {
        match self {
            PolicyOutcome::Raised => Some("raised"),
            PolicyOutcome::TooLow => Some("too_low"),
            PolicyOutcome::Missing => Some("missing"),
            _ => None,
        }
    }

    /// Whether the policy changed anything relative to the caller's max.
    pub fn is_dynamic(&self) -> bool {
        !matches!(self, PolicyOutcome::Observe | PolicyOutcome::InsufficientData)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    /// Per-attempt timeouts in milliseconds; `None` means unbounded.
    pub timeouts: Vec<Option<f64>>,
    pub outcome: PolicyOutcome,
    /// Rounded and floored p99, when one was computed.
    pub p99: Option<f64>,
}

impl Decision {
    fn passthrough(max: Option<f64>, outcome: PolicyOutcome) -> Self {
        Self {
            timeouts: vec![max],
            outcome,
            p99: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeoutPolicy {
    pub threshold: u64,
    /// Floor for the p99 estimate, in milliseconds.
    pub timeout_min: f64,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            timeout_min: DEFAULT_TIMEOUT_MIN,
        }
    }
}

impl TimeoutPolicy {
    pub fn new(threshold: u64, timeout_min: f64) -> Self {
        Self {
            threshold,
            timeout_min,
        }
    }

    /// Rounded, floored p99 for an estimate with enough samples.
    ///
    /// Below twice the threshold the estimate rounds up to a power of ten;
    /// beyond that, to its leading digit.
    pub fn estimate_p99<E: LatencyEstimate + ?Sized>(&self, stats: &E) -> Result<f64> {
        let raw = stats.p99()?;
        if !raw.is_finite() {
            return Err(ResiliencyError::Policy {
                message: format!("non-finite p99 estimate: {raw}"),
            });
        }

        let rounded = if stats.samples() >= self.threshold.saturating_mul(2) {
            power_ceil(raw)
        } else {
            order_of_magnitude_ceil(raw)
        };
        let p99 = rounded.max(self.timeout_min);
        if p99 <= 0.0 {
            return Err(ResiliencyError::Policy {
                message: format!("non-positive p99 estimate: {p99}"),
            });
        }
        Ok(p99)
    }

    /// Decide per-attempt timeouts.
    ///
    /// `stats` is only evaluated outside observe mode.
    pub fn decide<E, F>(&self, mode: Mode, max: Option<f64>, stats: F) -> Result<Decision>
    where
        E: LatencyEstimate,
        F: FnOnce() -> E,
    {
        if mode == Mode::Observe {
            return Ok(Decision::passthrough(max, PolicyOutcome::Observe));
        }

        if let Some(max) = max {
            if max.is_nan() || max < 0.0 {
                return Err(ResiliencyError::Policy {
                    message: format!("invalid max timeout: {max}"),
                });
            }
        }

        let stats = stats();
        if stats.samples() < self.threshold {
            return Ok(Decision::passthrough(max, PolicyOutcome::InsufficientData));
        }

        let p99 = self.estimate_p99(&stats)?;
        let (timeouts, outcome) = match max {
            None => (
                vec![Some(p99), Some(p99 * LENIENT_FACTOR)],
                PolicyOutcome::Missing,
            ),
            Some(max) if p99 < max => {
                let remaining = max - p99;
                if remaining >= p99 {
                    (vec![Some(p99), Some(remaining)], PolicyOutcome::Dynamic)
                } else {
                    (vec![Some(p99), Some(max)], PolicyOutcome::Raised)
                }
            }
            Some(max) => (vec![Some(max)], PolicyOutcome::TooLow),
        };

        Ok(Decision {
            timeouts,
            outcome,
            p99: Some(p99),
        })
    }
}
