//! Resilience layers: adaptive timeouts with retry, inbound deadlines
//!
//! What this module provides
//! - `AdaptiveTimeoutLayer` / `AdaptiveTimeout<S>`: decorates any client service
//!   with the per-attempt timeouts `NetworkResiliency::timeouts_for` hands out
//! - `DeadlineLayer` / `DeadlineScope<S>`: runs each inbound request in a fresh
//!   call scope carrying the deadline the caller propagated
//! - `Destination`, `RequestTimeout`: what a request must expose to be decorated
//!
//! Implementation strategy
//! - One attempt per timeout entry, each under `tokio::time::timeout`. Only a
//!   timed-out attempt is retried; any other error, or running out of entries,
//!   ends the call.
//! - Each call is recorded once, after its last attempt, with the total elapsed
//!   time, the timeout of the last attempt and the number of attempts.
//! - A disabled adapter bypasses the policy and recording entirely and runs a
//!   single attempt bounded only by the configured max.
//!
//! Composition
//! - `ServiceBuilder::new().layer(AdaptiveTimeoutLayer::new(resiliency, Adapter::Http, Action::Request).max(dur)).service(client)`
//!
//! Testing strategy
//! - Fake services that stall or fail in a scripted pattern, with paused tokio
//!   time, asserting attempt counts and the recorded metrics

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::{timeout, Instant};
use tower::{BoxError, Layer, Service, ServiceExt};

use crate::core::{Attempt, NetworkResiliency};
use crate::runtime::{Action, Adapter, Deadline};

/// Header carrying the caller's remaining budget, in seconds.
pub const REQUEST_TIMEOUT_HEADER: &str = "X-Request-Timeout";

/// Error returned when an attempt exceeds its timeout.
#[derive(Debug, Clone, Copy, Error)]
#[error("timeout after {0:?}")]
pub struct AttemptTimeout(pub Duration);

/// Identifies where a request is going, e.g. a host name.
pub trait Destination {
    fn destination(&self) -> String;
}

impl Destination for String {
    fn destination(&self) -> String {
        self.clone()
    }
}

impl Destination for &str {
    fn destination(&self) -> String {
        (*self).to_string()
    }
}

/// Inbound requests that may carry a propagated timeout.
pub trait RequestTimeout {
    fn request_timeout(&self) -> Option<Duration>;
}

/// Parse an `X-Request-Timeout` value (seconds, fractional allowed).
pub fn parse_request_timeout(value: &str) -> Option<Duration> {
    let secs: f64 = value.trim().parse().ok()?;
    if secs <= 0.0 {
        return None;
    }
    Duration::try_from_secs_f64(secs).ok()
}

// ===== Adaptive timeout =====

#[derive(Clone)]
pub struct AdaptiveTimeoutLayer {
    resiliency: Arc<NetworkResiliency>,
    adapter: Adapter,
    action: Action,
    max: Option<Duration>,
}

impl AdaptiveTimeoutLayer {
    pub fn new(resiliency: Arc<NetworkResiliency>, adapter: Adapter, action: Action) -> Self {
        Self {
            resiliency,
            adapter,
            action,
            max: None,
        }
    }

    /// The caller's own timeout; no attempt ever exceeds it.
    pub fn max(mut self, max: Duration) -> Self {
        self.max = Some(max);
        self
    }
}

pub struct AdaptiveTimeout<S> {
    inner: Arc<Mutex<S>>,
    resiliency: Arc<NetworkResiliency>,
    adapter: Adapter,
    action: Action,
    max: Option<Duration>,
}

impl<S> Clone for AdaptiveTimeout<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            resiliency: self.resiliency.clone(),
            adapter: self.adapter,
            action: self.action,
            max: self.max,
        }
    }
}

impl<S> Layer<S> for AdaptiveTimeoutLayer {
    type Service = AdaptiveTimeout<S>;
    fn layer(&self, inner: S) -> Self::Service {
        AdaptiveTimeout {
            inner: Arc::new(Mutex::new(inner)),
            resiliency: self.resiliency.clone(),
            adapter: self.adapter,
            action: self.action,
            max: self.max,
        }
    }
}

async fn run_attempt<S, Req>(
    inner: &Mutex<S>,
    req: Req,
    limit: Option<Duration>,
) -> Result<S::Response, BoxError>
where
    S: Service<Req, Error = BoxError>,
{
    let fut = {
        let mut guard = inner.lock().await;
        ServiceExt::ready(&mut *guard).await?.call(req)
    };

    match limit {
        None => fut.await,
        Some(limit) => match timeout(limit, fut).await {
            Ok(r) => r,
            Err(_) => Err(AttemptTimeout(limit).into()),
        },
    }
}

fn timed_out(err: &BoxError) -> bool {
    err.is::<AttemptTimeout>()
}

impl<S, Req> Service<Req> for AdaptiveTimeout<S>
where
    Req: Destination + Clone + Send + 'static,
    S: Service<Req, Error = BoxError> + Send + 'static,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
{
    type Response = S::Response;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let inner = self.inner.clone();
        let resiliency = self.resiliency.clone();
        let (adapter, action, max) = (self.adapter, self.action, self.max);

        Box::pin(async move {
            if !resiliency.enabled(adapter) {
                return run_attempt(&inner, req, max).await;
            }

            let destination = req.destination();
            let timeouts = resiliency.timeouts_for_duration(adapter, action, &destination, max);

            let started = Instant::now();
            let mut attempts = 0;
            let (result, limit) = loop {
                let limit = timeouts.get(attempts).copied().flatten();
                attempts += 1;

                let result = run_attempt(&inner, req.clone(), limit).await;
                let retry = matches!(&result, Err(e) if timed_out(e)) && attempts < timeouts.len();
                if !retry {
                    break (result, limit);
                }
            };

            let elapsed = started.elapsed().as_secs_f64() * 1_000.0;
            let mut attempt = Attempt::new(adapter, action, &destination, elapsed)
                .attempts(u32::try_from(attempts).unwrap_or(u32::MAX));
            if let Err(e) = &result {
                attempt = attempt.error(if timed_out(e) { "timeout" } else { "error" });
            }
            if let Some(limit) = limit {
                attempt = attempt.timeout(limit.as_secs_f64() * 1_000.0);
            }
            resiliency.record(&attempt);

            result
        })
    }
}

// ===== Inbound deadline =====

#[derive(Clone)]
pub struct DeadlineLayer {
    resiliency: Arc<NetworkResiliency>,
}

impl DeadlineLayer {
    pub fn new(resiliency: Arc<NetworkResiliency>) -> Self {
        Self { resiliency }
    }
}

#[derive(Clone)]
pub struct DeadlineScope<S> {
    inner: S,
    resiliency: Arc<NetworkResiliency>,
}

impl<S> Layer<S> for DeadlineLayer {
    type Service = DeadlineScope<S>;
    fn layer(&self, inner: S) -> Self::Service {
        DeadlineScope {
            inner,
            resiliency: self.resiliency.clone(),
        }
    }
}

impl<S, Req> Service<Req> for DeadlineScope<S>
where
    Req: RequestTimeout,
    S: Service<Req, Error = BoxError> + Send + 'static,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
{
    type Response = S::Response;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        // resolved once so the synchronous call and its future share one expiry
        let deadline = req
            .request_timeout()
            .and_then(|timeout| Deadline::In(timeout).resolve())
            .map(Deadline::At);
        let runtime = self.resiliency.runtime();
        let fut = runtime.enter_with_deadline(deadline, || self.inner.call(req));
        let resiliency = self.resiliency.clone();
        Box::pin(async move {
            resiliency
                .runtime()
                .scope_with_deadline(deadline, fut)
                .await
        })
    }
}
