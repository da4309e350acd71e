//! # Network Resiliency
//!
//! Adaptive timeouts and retry budgets learned from observed network latency.
//! Every outbound call is timed; per-destination statistics feed a policy that
//! shrinks timeouts for fast, well-behaved destinations and splits the caller's
//! budget into a fast first attempt and a lenient retry, never exceeding the
//! caller's own maximum.
//!
//! ## Core Concepts
//!
//! - **Stats**: streaming mean/variance (and a log-bucket histogram) that merge in O(1)
//! - **StatsEngine**: per-destination local and remote statistics, synced in the
//!   background to a shared `RemoteStore` by the `Syncer`
//! - **TimeoutPolicy**: turns statistics into per-attempt timeouts
//! - **RuntimeState**: enablement, observe/resilient modes and call-scoped overrides
//! - **Layers**: `AdaptiveTimeoutLayer` decorates any Tower client service;
//!   `DeadlineLayer` scopes inbound requests
//!
//! ## Getting Started
//!
//! ```rust,no_run
//! use network_resiliency::{
//!     Action, Adapter, AdaptiveTimeoutLayer, ConfigBuilder, Mode, NetworkResiliency,
//! };
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tower::{service_fn, BoxError, Layer, Service, ServiceExt};
//!
//! # async fn example() -> Result<(), BoxError> {
//! let resiliency = Arc::new(NetworkResiliency::new(
//!     ConfigBuilder::new().mode(Mode::Resilient).build(),
//! )?);
//!
//! let client = service_fn(|host: String| async move { Ok::<_, BoxError>(host.len()) });
//! let mut client = AdaptiveTimeoutLayer::new(resiliency, Adapter::Http, Action::Request)
//!     .max(Duration::from_secs(2))
//!     .layer(client);
//!
//! let len = client.ready().await?.call("example.com".to_string()).await?;
//! println!("{len}");
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod observability;
pub mod policy;
pub mod remote;
pub mod resilience;
pub mod runtime;
pub mod stats;
pub mod syncer;

// Composition root
mod core;

pub use self::core::{Attempt, NetworkResiliency, NetworkResiliencyBuilder};

// Public re-exports for convenience
pub use config::{ConfigBuilder, ResiliencyConfig, SampleRates};
pub use engine::StatsEngine;
pub use error::{ResiliencyError, Result};
pub use observability::{MemorySink, MetricRecord, MetricsSink, NoopSink, ServiceSink};
pub use policy::{Decision, PolicyOutcome, TimeoutPolicy};
pub use remote::{MemoryRemoteStore, RemoteConfig, RemoteStore};
pub use resilience::{
    AdaptiveTimeout, AdaptiveTimeoutLayer, AttemptTimeout, DeadlineLayer, DeadlineScope,
    Destination, RequestTimeout,
};
pub use runtime::{
    Action, Adapter, Deadline, EnabledSetting, Mode, ModeSetting, RuntimeState, Units,
};
pub use stats::{Accumulator, PowerStats, Stats};
pub use syncer::{Syncer, WorkerHandle};

// Re-export Tower traits that users need
pub use tower::{Layer, Service, ServiceExt};
