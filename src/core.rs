//! Composition root: the entry points protocol adapters call.
//!
//! `NetworkResiliency` wires `RuntimeState`, `StatsEngine`, `TimeoutPolicy`,
//! `Syncer` and a `MetricsSink` together. Every method an adapter calls on the
//! request path (`enabled`, `mode`, `timeouts_for`, `record`) is total: internal
//! faults are reported through `report_error` and degrade to passing the
//! caller's own timeout through, or to skipping the stats update.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use regex::Regex;

use crate::config::ResiliencyConfig;
use crate::engine::StatsEngine;
use crate::error::{ResiliencyError, Result};
use crate::observability::{report_error, sampled, MetricRecord, MetricsSink, NoopSink, Tags};
use crate::policy::{order_of_magnitude_ceil, TimeoutPolicy};
use crate::remote::{MemoryRemoteStore, RemoteStore};
use crate::runtime::{Action, Adapter, Deadline, EnabledSetting, Mode, ModeSetting, RuntimeState, Units};
use crate::stats::Stats;
use crate::syncer::{Syncer, WorkerHandle};

/// Local sample count, as a multiple of the threshold, past which a key's
/// history is halved.
const DECAY_FACTOR: u64 = 5;
const DECAY_PERCENTAGE: f64 = 50.0;

fn millis_to_duration(ms: f64) -> Option<Duration> {
    (ms.is_finite() && ms >= 0.0).then(|| Duration::from_nanos((ms * 1e6).round() as u64))
}

/// One completed network call, as reported by an adapter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Attempt<'a> {
    pub adapter: Adapter,
    pub action: Action,
    pub destination: &'a str,
    /// Wall-clock duration in milliseconds
    pub duration: f64,
    /// Error class name, when the call failed
    pub error: Option<&'a str>,
    /// Timeout the call ran under, in milliseconds
    pub timeout: Option<f64>,
    pub attempts: u32,
}

impl<'a> Attempt<'a> {
    pub fn new(adapter: Adapter, action: Action, destination: &'a str, duration: f64) -> Self {
        Self {
            adapter,
            action,
            destination,
            duration,
            error: None,
            timeout: None,
            attempts: 1,
        }
    }

    pub fn error(mut self, error: &'a str) -> Self {
        self.error = Some(error);
        self
    }

    pub fn timeout(mut self, timeout: f64) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }
}

#[derive(Default)]
pub struct NetworkResiliencyBuilder {
    config: ResiliencyConfig,
    sink: Option<Arc<dyn MetricsSink>>,
    remote: Option<Arc<dyn RemoteStore>>,
}

impl NetworkResiliencyBuilder {
    pub fn config(mut self, config: ResiliencyConfig) -> Self {
        self.config = config;
        self
    }

    pub fn metrics(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Shared store for cross-process statistics. Takes precedence over
    /// `ResiliencyConfig::remote`; with neither, statistics stay local.
    pub fn remote(mut self, remote: Arc<dyn RemoteStore>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn build(self) -> Result<NetworkResiliency> {
        let config = self.config;
        config.validate()?;

        let ignore = config
            .ignore_destination
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|e| ResiliencyError::Config(format!("invalid ignore_destination: {e}")))?;

        let remote = self.remote.or_else(|| {
            config
                .remote
                .clone()
                .map(|limits| Arc::new(MemoryRemoteStore::new(limits)) as Arc<dyn RemoteStore>)
        });

        let sink = self.sink.unwrap_or_else(|| Arc::new(NoopSink));
        let syncer = Syncer::new(config.sync_interval, config.sync_limit, sink.clone())
            .with_sample_rate(config.sample_rates.sync);

        let resiliency = NetworkResiliency {
            runtime: RuntimeState::new(sink.clone()),
            engine: Arc::new(StatsEngine::new()),
            syncer: Arc::new(syncer),
            remote,
            sink,
            ignore,
            closed: Arc::new(AtomicBool::new(false)),
            config,
        };
        resiliency.apply_config()?;
        Ok(resiliency)
    }
}

pub struct NetworkResiliency {
    config: ResiliencyConfig,
    runtime: RuntimeState,
    engine: Arc<StatsEngine>,
    syncer: Arc<Syncer>,
    remote: Option<Arc<dyn RemoteStore>>,
    sink: Arc<dyn MetricsSink>,
    ignore: Option<Regex>,
    closed: Arc<AtomicBool>,
}

impl fmt::Debug for NetworkResiliency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkResiliency")
            .field("config", &self.config)
            .field("runtime", &self.runtime)
            .field("keys", &self.engine.len())
            .field("syncer", &self.syncer)
            .finish()
    }
}

impl NetworkResiliency {
    pub fn builder() -> NetworkResiliencyBuilder {
        NetworkResiliencyBuilder::default()
    }

    /// Standalone instance with the given configuration and no remote store.
    pub fn new(config: ResiliencyConfig) -> Result<Self> {
        Self::builder().config(config).build()
    }

    fn apply_config(&self) -> Result<()> {
        self.runtime.reset();
        if let Some(enabled) = self.config.enabled {
            self.runtime.set_enabled(EnabledSetting::Flag(enabled));
        }
        if let Some(mode) = self.config.mode {
            self.runtime.set_mode(ModeSetting::all(mode));
        }
        self.runtime.set_timeout_min(self.config.timeout_min_ms)
    }

    pub fn config(&self) -> &ResiliencyConfig {
        &self.config
    }

    pub fn runtime(&self) -> &RuntimeState {
        &self.runtime
    }

    pub fn engine(&self) -> &Arc<StatsEngine> {
        &self.engine
    }

    pub fn syncer(&self) -> &Syncer {
        &self.syncer
    }

    /// The shared store syncs run against, if any.
    pub fn remote(&self) -> Option<&Arc<dyn RemoteStore>> {
        self.remote.as_ref()
    }

    pub fn enabled(&self, adapter: Adapter) -> bool {
        self.runtime.enabled(adapter)
    }

    pub fn mode(&self, action: Action) -> Mode {
        self.runtime.mode(action)
    }

    pub fn deadline(&self) -> Option<SystemTime> {
        self.runtime.deadline()
    }

    pub fn set_deadline(&self, deadline: Option<Deadline>) -> Result<()> {
        self.runtime.set_deadline(deadline)
    }

    pub fn key(adapter: Adapter, action: Action, destination: &str) -> String {
        format!("{adapter}:{action}:{destination}")
    }

    /// Current statistics for one destination.
    pub fn stats(&self, adapter: Adapter, action: Action, destination: &str) -> Stats {
        self.engine.get(&Self::key(adapter, action, destination))
    }

    /// Destinations never recorded, raw IP literals by default.
    pub fn ignore_destination(&self, _adapter: Adapter, _action: Action, destination: &str) -> bool {
        self.ignore
            .as_ref()
            .is_some_and(|re| re.is_match(destination))
    }

    fn policy(&self) -> TimeoutPolicy {
        TimeoutPolicy::new(self.config.resiliency_threshold, self.runtime.timeout_min())
    }

    fn warn(&self, method: &'static str, err: &ResiliencyError) {
        report_error(self.sink.as_ref(), method, err.kind(), err);
    }

    fn emit_sampled(&self, rate: f64, record: MetricRecord) {
        if sampled(rate) {
            self.sink.emit(record.with_sample_rate(rate));
        }
    }

    /// Per-attempt timeouts for a call, in `units`.
    ///
    /// `None` entries mean "no timeout". When the policy leaves the call alone
    /// (observe mode, too few samples, or an internal fault) the result is
    /// exactly `[max]`.
    pub fn timeouts_for(
        &self,
        adapter: Adapter,
        action: Action,
        destination: &str,
        max: Option<f64>,
        units: Units,
    ) -> Vec<Option<f64>> {
        match self.try_timeouts_for(adapter, action, destination, max, units) {
            Ok(timeouts) => timeouts,
            Err(e) => {
                self.warn("timeouts_for", &e);
                vec![max]
            }
        }
    }

    fn try_timeouts_for(
        &self,
        adapter: Adapter,
        action: Action,
        destination: &str,
        max: Option<f64>,
        units: Units,
    ) -> Result<Vec<Option<f64>>> {
        let mode = self.mode(action);
        let key = Self::key(adapter, action, destination);
        let decision = self
            .policy()
            .decide(mode, max.map(|m| units.to_millis(m)), || self.engine.get(&key))?;

        if !decision.outcome.is_dynamic() {
            return Ok(vec![max]);
        }

        let rate = self.config.sample_rates.timeout;
        if let Some(event) = decision.outcome.event() {
            self.emit_sampled(
                rate,
                MetricRecord::counter(
                    format!("network_resiliency.timeout.{event}"),
                    vec![
                        ("adapter", adapter.to_string()),
                        ("action", action.to_string()),
                        ("destination", destination.to_string()),
                    ],
                ),
            );
        }
        if let Some(Some(first)) = decision.timeouts.first() {
            self.emit_sampled(
                rate,
                MetricRecord::distribution(
                    format!("network_resiliency.{action}.timeout.dynamic"),
                    *first,
                    vec![
                        ("adapter", adapter.to_string()),
                        ("destination", destination.to_string()),
                    ],
                ),
            );
        }

        Ok(decision
            .timeouts
            .into_iter()
            .map(|t| t.map(|ms| units.from_millis(ms)))
            .collect())
    }

    /// `timeouts_for` over `Duration`s.
    pub fn timeouts_for_duration(
        &self,
        adapter: Adapter,
        action: Action,
        destination: &str,
        max: Option<Duration>,
    ) -> Vec<Option<Duration>> {
        let max_ms = max.map(|d| d.as_secs_f64() * 1_000.0);
        self.timeouts_for(adapter, action, destination, max_ms, Units::Milliseconds)
            .into_iter()
            .map(|t| t.and_then(millis_to_duration))
            .collect()
    }

    /// Record one completed call: telemetry always, statistics on success.
    pub fn record(&self, attempt: &Attempt<'_>) {
        if let Err(e) = self.try_record(attempt) {
            self.warn("record", &e);
        }
    }

    fn try_record(&self, attempt: &Attempt<'_>) -> Result<()> {
        let Attempt {
            adapter,
            action,
            destination,
            duration,
            error,
            timeout,
            attempts,
        } = *attempt;

        if self.ignore_destination(adapter, action, destination) {
            return Ok(());
        }

        let target: Tags = vec![
            ("adapter", adapter.to_string()),
            ("destination", destination.to_string()),
        ];

        let mut tags = target.clone();
        if let Some(error) = error {
            tags.push(("error", error.to_string()));
        }
        tags.push(("mode", self.mode(action).to_string()));
        if attempts > 1 {
            tags.push(("attempts", attempts.to_string()));
        }
        if let Some(exceeded) = self.runtime.deadline_exceeded() {
            tags.push(("deadline_exceeded", exceeded.to_string()));
        }
        self.sink.emit(MetricRecord::distribution(
            format!("network_resiliency.{action}"),
            duration,
            tags,
        ));

        let timeout = timeout.filter(|t| *t > 0.0);
        if let Some(timeout) = timeout {
            self.emit_sampled(
                self.config.sample_rates.timeout,
                MetricRecord::distribution(
                    format!("network_resiliency.{action}.timeout"),
                    timeout,
                    target.clone(),
                ),
            );
        }

        if error.is_some() {
            if let Some(timeout) = timeout.filter(|t| *t > duration) {
                self.sink.emit(MetricRecord::distribution(
                    format!("network_resiliency.{action}.time_saved"),
                    timeout - duration,
                    target,
                ));
            }
            return Ok(());
        }

        let key = Self::key(adapter, action, destination);
        let mut stats = self.engine.add(&key, duration)?;
        if stats.n() > self.config.resiliency_threshold.saturating_mul(DECAY_FACTOR) {
            self.engine.scale(&key, DECAY_PERCENTAGE)?;
            stats.scale(DECAY_PERCENTAGE)?;
        }

        let mut tags = target;
        tags.push(("n", format!("{}", order_of_magnitude_ceil(stats.n() as f64))));
        tags.push(("sync", self.syncer.is_syncing().to_string()));

        self.ensure_syncing();

        let rate = self.config.sample_rates.stats;
        if sampled(rate) {
            for (suffix, value) in [
                ("n", stats.n() as f64),
                ("avg", stats.avg()),
                ("stdev", stats.stdev()),
            ] {
                self.sink.emit(
                    MetricRecord::distribution(
                        format!("network_resiliency.{action}.stats.{suffix}"),
                        value,
                        tags.clone(),
                    )
                    .with_sample_rate(rate),
                );
            }
        }
        Ok(())
    }

    /// Start the sync worker in the background if a remote store is configured
    /// and it is not already running.
    fn ensure_syncing(&self) {
        let Some(remote) = self.remote.clone() else {
            return;
        };
        if self.closed.load(Ordering::SeqCst) || self.syncer.is_syncing() {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let (syncer, engine, closed) = (self.syncer.clone(), self.engine.clone(), self.closed.clone());
        handle.spawn(async move {
            if !closed.load(Ordering::SeqCst) {
                syncer.ensure_running(engine, remote).await;
            }
        });
    }

    /// Start (or restart) the sync worker now. `None` without a remote store.
    pub async fn start_syncing(&self) -> Option<WorkerHandle> {
        let remote = self.remote.clone()?;
        self.closed.store(false, Ordering::SeqCst);
        Some(self.syncer.start(self.engine.clone(), remote).await)
    }

    /// Restore configured defaults, forget all statistics and stop syncing.
    pub async fn reset(&self) {
        if let Err(e) = self.apply_config() {
            self.warn("reset", &e);
        }
        self.engine.reset();
        self.syncer.stop().await;
    }

    /// Stop background work for good; later calls to `record` do not restart it.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.syncer.stop().await;
    }
}
