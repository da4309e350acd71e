//! Observability: metrics and fault reporting
//!
//! What this module provides
//! - `MetricRecord::{Counter, Distribution}` carrying a name, a value and tags
//! - `MetricsSink`: the synchronous hook the hot path emits into
//! - `ServiceSink<C>`: forwards records to a tower `MetricsCollector` service on
//!   the ambient tokio runtime
//! - `MemorySink` for tests and inspection, `NoopSink` when nothing is wired
//! - `report_error`: the single place caught faults are logged and counted
//!
//! Emission never blocks and never fails the caller; a sink that cannot deliver
//! a record drops it.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use rand::Rng;
use tower::{BoxError, Service, ServiceExt};
use tracing::{debug, warn};

pub type Tags = Vec<(&'static str, String)>;

#[derive(Debug, Clone, PartialEq)]
pub enum MetricRecord {
    Counter {
        name: String,
        value: u64,
        tags: Tags,
        sample_rate: f64,
    },
    Distribution {
        name: String,
        value: f64,
        tags: Tags,
        sample_rate: f64,
    },
}

impl MetricRecord {
    pub fn counter(name: impl Into<String>, tags: Tags) -> Self {
        Self::Counter {
            name: name.into(),
            value: 1,
            tags,
            sample_rate: 1.0,
        }
    }

    pub fn distribution(name: impl Into<String>, value: f64, tags: Tags) -> Self {
        Self::Distribution {
            name: name.into(),
            value,
            tags,
            sample_rate: 1.0,
        }
    }

    pub fn with_sample_rate(mut self, rate: f64) -> Self {
        match &mut self {
            Self::Counter { sample_rate, .. } | Self::Distribution { sample_rate, .. } => {
                *sample_rate = rate
            }
        }
        self
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Counter { name, .. } | Self::Distribution { name, .. } => name,
        }
    }

    pub fn tags(&self) -> &Tags {
        match self {
            Self::Counter { tags, .. } | Self::Distribution { tags, .. } => tags,
        }
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags()
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Receiver for metric records emitted on the request path.
pub trait MetricsSink: Send + Sync {
    fn emit(&self, record: MetricRecord);
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl MetricsSink for NoopSink {
    fn emit(&self, _record: MetricRecord) {}
}

/// Keeps every record in memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<MetricRecord>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<MetricRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Records whose name equals `name`.
    pub fn named(&self, name: &str) -> Vec<MetricRecord> {
        self.records()
            .into_iter()
            .filter(|r| r.name() == name)
            .collect()
    }

    pub fn clear(&self) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl MetricsSink for MemorySink {
    fn emit(&self, record: MetricRecord) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
    }
}

pub trait MetricsCollector: Service<MetricRecord, Response = (), Error = BoxError> {}
impl<T> MetricsCollector for T where T: Service<MetricRecord, Response = (), Error = BoxError> {}

/// Adapts a tower `MetricsCollector` into a `MetricsSink`.
///
/// Each record is delivered on a spawned task; outside a tokio runtime records
/// are dropped.
#[derive(Clone)]
pub struct ServiceSink<C> {
    collector: C,
}

impl<C> ServiceSink<C> {
    pub fn new(collector: C) -> Self {
        Self { collector }
    }
}

impl<C> MetricsSink for ServiceSink<C>
where
    C: MetricsCollector + Clone + Send + Sync + 'static,
    C::Future: Send + 'static,
{
    fn emit(&self, record: MetricRecord) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!(metric = record.name(), "no runtime, dropping metric");
            return;
        };

        let mut collector = self.collector.clone();
        handle.spawn(async move {
            let name = record.name().to_string();
            let res = match ServiceExt::ready(&mut collector).await {
                Ok(svc) => svc.call(record).await,
                Err(e) => Err(e),
            };
            if let Err(e) = res {
                debug!(metric = %name, error = %e, "metric delivery failed");
            }
        });
    }
}

/// `true` with probability `rate`.
pub fn sampled(rate: f64) -> bool {
    rate >= 1.0 || (rate > 0.0 && rand::thread_rng().gen::<f64>() < rate)
}

/// Log a caught fault and count it as `network_resiliency.error`.
pub fn report_error(sink: &dyn MetricsSink, method: &'static str, kind: &str, err: &dyn fmt::Display) {
    warn!(method, kind, error = %err, "network resiliency fault");
    sink.emit(MetricRecord::counter(
        "network_resiliency.error",
        vec![("method", method.to_string()), ("type", kind.to_string())],
    ));
}
