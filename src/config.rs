//! Configuration for network resiliency
//!
//! Defaults, a fluent builder, environment variables and TOML files all produce
//! the same `ResiliencyConfig`, which `NetworkResiliency::builder` consumes.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{ResiliencyError, Result};
use crate::policy::DEFAULT_THRESHOLD;
use crate::remote::RemoteConfig;
use crate::runtime::{Mode, DEFAULT_TIMEOUT_MIN};

/// Destinations matching this are raw IPv4 literals and never recorded.
pub const DEFAULT_IGNORE_DESTINATION: &str = r"\d{1,3}(\.\d{1,3}){3}";

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResiliencyConfig {
    /// Process-wide enablement; unset means enabled
    pub enabled: Option<bool>,

    /// Mode for every action; unset means observe
    pub mode: Option<Mode>,

    /// Floor for computed timeouts, in milliseconds
    pub timeout_min_ms: f64,

    /// Samples required before timeouts adapt
    pub resiliency_threshold: u64,

    /// Pause between background sync cycles
    pub sync_interval: Duration,

    /// Keys synced per cycle
    pub sync_limit: usize,

    /// Metric sampling rates
    pub sample_rates: SampleRates,

    /// Regex of destinations excluded from recording; `None` records everything
    pub ignore_destination: Option<String>,

    /// Limits for an in-process shared store; `None` keeps statistics local
    /// unless a store is supplied to the builder
    pub remote: Option<RemoteConfig>,
}

impl Default for ResiliencyConfig {
    fn default() -> Self {
        Self {
            enabled: None,
            mode: None,
            timeout_min_ms: DEFAULT_TIMEOUT_MIN,
            resiliency_threshold: DEFAULT_THRESHOLD,
            sync_interval: Duration::from_secs(10),
            sync_limit: 100,
            sample_rates: SampleRates::default(),
            ignore_destination: Some(DEFAULT_IGNORE_DESTINATION.to_string()),
            remote: None,
        }
    }
}

impl ResiliencyConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.timeout_min_ms.is_finite() || self.timeout_min_ms <= 0.0 {
            return Err(ResiliencyError::invalid_argument(format!(
                "invalid timeout_min: {}",
                self.timeout_min_ms
            )));
        }
        if self.sync_interval.is_zero() {
            return Err(ResiliencyError::Config(
                "sync_interval must be positive".to_string(),
            ));
        }
        if self.remote.as_ref().is_some_and(|r| r.window_max == 0) {
            return Err(ResiliencyError::Config(
                "remote.window_max must be positive".to_string(),
            ));
        }
        self.sample_rates.validate()
    }
}

/// Sampling rates for emitted metrics
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SampleRates {
    /// Policy events and timeout distributions
    pub timeout: f64,

    /// Per-key statistics snapshots
    pub stats: f64,

    /// Sync cycle metrics
    pub sync: f64,
}

impl Default for SampleRates {
    fn default() -> Self {
        Self {
            timeout: 0.1,
            stats: 0.1,
            sync: 0.1,
        }
    }
}

impl SampleRates {
    fn validate(&self) -> Result<()> {
        for (name, rate) in [
            ("timeout", self.timeout),
            ("stats", self.stats),
            ("sync", self.sync),
        ] {
            if !(0.0..=1.0).contains(&rate) {
                return Err(ResiliencyError::Config(format!(
                    "sample rate {name} must be between 0 and 1, found {rate}"
                )));
            }
        }
        Ok(())
    }
}

/// Configuration builder
pub struct ConfigBuilder {
    config: ResiliencyConfig,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: ResiliencyConfig::default(),
        }
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.config.enabled = Some(enabled);
        self
    }

    pub fn mode(mut self, mode: Mode) -> Self {
        self.config.mode = Some(mode);
        self
    }

    pub fn timeout_min(mut self, millis: f64) -> Self {
        self.config.timeout_min_ms = millis;
        self
    }

    pub fn threshold(mut self, samples: u64) -> Self {
        self.config.resiliency_threshold = samples;
        self
    }

    pub fn sync_interval(mut self, interval: Duration) -> Self {
        self.config.sync_interval = interval;
        self
    }

    pub fn sync_limit(mut self, keys: usize) -> Self {
        self.config.sync_limit = keys;
        self
    }

    pub fn sample_rates(mut self, rates: SampleRates) -> Self {
        self.config.sample_rates = rates;
        self
    }

    /// Record every destination, including IP literals.
    pub fn record_all_destinations(mut self) -> Self {
        self.config.ignore_destination = None;
        self
    }

    pub fn ignore_destination(mut self, pattern: impl Into<String>) -> Self {
        self.config.ignore_destination = Some(pattern.into());
        self
    }

    pub fn remote(mut self, remote: RemoteConfig) -> Self {
        self.config.remote = Some(remote);
        self
    }

    pub fn build(self) -> ResiliencyConfig {
        self.config
    }
}

/// Load configuration from environment variables
///
/// - `NETWORK_RESILIENCY_ENABLED`: `true`/`false`/`1`/`0`
/// - `NETWORK_RESILIENCY_MODE`: `observe` or `resilient`
/// - `NETWORK_RESILIENCY_TIMEOUT_MIN`: milliseconds
/// - `NETWORK_RESILIENCY_SYNC_INTERVAL`: seconds
pub fn from_env() -> Result<ResiliencyConfig> {
    from_lookup(|name| std::env::var(name).ok())
}

/// Like `from_env`, reading variables through `lookup`.
pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<ResiliencyConfig> {
    let mut config = ResiliencyConfig::default();

    if let Some(enabled) = lookup("NETWORK_RESILIENCY_ENABLED") {
        config.enabled = Some(match enabled.to_lowercase().as_str() {
            "true" | "1" => true,
            "false" | "0" => false,
            other => {
                return Err(ResiliencyError::Config(format!(
                    "NETWORK_RESILIENCY_ENABLED: expected a boolean, found {other}"
                )))
            }
        });
    }

    if let Some(mode) = lookup("NETWORK_RESILIENCY_MODE") {
        config.mode = Some(mode.parse()?);
    }

    if let Some(min) = lookup("NETWORK_RESILIENCY_TIMEOUT_MIN") {
        config.timeout_min_ms = min.parse().map_err(|_| {
            ResiliencyError::Config(format!("NETWORK_RESILIENCY_TIMEOUT_MIN: invalid number {min}"))
        })?;
    }

    if let Some(interval) = lookup("NETWORK_RESILIENCY_SYNC_INTERVAL") {
        let secs: f64 = interval.parse().map_err(|_| {
            ResiliencyError::Config(format!(
                "NETWORK_RESILIENCY_SYNC_INTERVAL: invalid number {interval}"
            ))
        })?;
        config.sync_interval = Duration::try_from_secs_f64(secs).map_err(|e| {
            ResiliencyError::Config(format!("NETWORK_RESILIENCY_SYNC_INTERVAL: {e}"))
        })?;
    }

    config.validate()?;
    Ok(config)
}

/// Load configuration from a TOML file
pub fn from_file(path: impl AsRef<Path>) -> Result<ResiliencyConfig> {
    let contents = std::fs::read_to_string(path)?;
    let config: ResiliencyConfig =
        toml::from_str(&contents).map_err(|e| ResiliencyError::Config(e.to_string()))?;
    config.validate()?;
    Ok(config)
}
