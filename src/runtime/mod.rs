//! Runtime state: enablement, modes, minimum timeout, call scopes
//!
//! What this module provides
//! - Identifiers: `Adapter`, `Action`, `Mode`, `Units`, all parseable from strings
//! - `RuntimeState`: process-wide defaults (`EnabledSetting`, `ModeSetting`,
//!   minimum timeout) plus call-scoped overrides (enabled, mode, deadline)
//!
//! Call scopes
//! - Overrides live in a tokio task-local `CallScope`. Sync helpers
//!   (`enable`, `disable`, `observe`, `with_deadline`) cover a closure; async
//!   helpers (`enable_async`, ..., `scope`) cover a future. The previous scope is
//!   restored on every exit path, panics included.
//! - Scopes do not follow `tokio::spawn`; a spawned task starts unscoped.
//!
//! Predicates
//! - A predicate default is evaluated inside a guard scope (`disable` for
//!   enablement, `observe` for modes), so instrumented calls made by the
//!   predicate itself see the safe default instead of re-entering it.
//! - A predicate that panics or errors is reported and treated as disabled /
//!   observe.

use std::cell::Cell;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tower::BoxError;

use crate::error::{ResiliencyError, Result};
use crate::observability::{report_error, MetricsSink, NoopSink};

/// Default floor for computed timeouts, in milliseconds.
pub const DEFAULT_TIMEOUT_MIN: f64 = 10.0;

macro_rules! named_enum {
    ($(#[$meta:meta])* $name:ident, $what:literal { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "lowercase")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ResiliencyError;

            fn from_str(s: &str) -> Result<Self> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(ResiliencyError::invalid_argument(format!(
                        concat!("invalid ", $what, ": {}"),
                        other
                    ))),
                }
            }
        }
    };
}

named_enum!(
    /// Instrumented client family.
    Adapter, "adapter" {
        Http => "http",
        Redis => "redis",
        Mysql => "mysql",
        Postgres => "postgres",
        Middleware => "middleware",
    }
);

named_enum!(
    /// Phase of a network call being timed.
    Action, "action" {
        Connect => "connect",
        Request => "request",
    }
);

named_enum!(
    /// `Observe` only measures; `Resilient` also shortens timeouts and retries.
    Mode, "mode" {
        Observe => "observe",
        Resilient => "resilient",
    }
);

/// Units for timeout values crossing the public API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Units {
    #[default]
    Milliseconds,
    Seconds,
}

impl FromStr for Units {
    type Err = ResiliencyError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "" | "ms" | "milliseconds" => Ok(Units::Milliseconds),
            "s" | "seconds" => Ok(Units::Seconds),
            other => Err(ResiliencyError::invalid_argument(format!(
                "invalid units: {other}"
            ))),
        }
    }
}

impl Units {
    pub fn to_millis(self, value: f64) -> f64 {
        match self {
            Units::Milliseconds => value,
            Units::Seconds => value * 1_000.0,
        }
    }

    pub fn from_millis(self, value: f64) -> f64 {
        match self {
            Units::Milliseconds => value,
            Units::Seconds => value / 1_000.0,
        }
    }
}

pub type EnabledFn = Arc<dyn Fn(Adapter) -> bool + Send + Sync>;
pub type ModeFn = Arc<dyn Fn(Action) -> std::result::Result<Mode, BoxError> + Send + Sync>;

/// Process-wide enablement.
#[derive(Clone)]
pub enum EnabledSetting {
    Flag(bool),
    Predicate(EnabledFn),
}

impl EnabledSetting {
    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(Adapter) -> bool + Send + Sync + 'static,
    {
        Self::Predicate(Arc::new(f))
    }
}

impl fmt::Debug for EnabledSetting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Flag(b) => f.debug_tuple("Flag").field(b).finish(),
            Self::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

/// Process-wide mode, per action or computed.
#[derive(Clone)]
pub enum ModeSetting {
    PerAction(HashMap<Action, Mode>),
    Predicate(ModeFn),
}

impl ModeSetting {
    /// The same mode for every action.
    pub fn all(mode: Mode) -> Self {
        Self::PerAction(Action::ALL.iter().map(|a| (*a, mode)).collect())
    }

    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(Action) -> std::result::Result<Mode, BoxError> + Send + Sync + 'static,
    {
        Self::Predicate(Arc::new(f))
    }

    /// Parse `(action, mode)` string pairs. Unknown names fail.
    pub fn from_pairs<'a, I>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let map = pairs
            .into_iter()
            .map(|(action, mode)| Ok((action.parse::<Action>()?, mode.parse::<Mode>()?)))
            .collect::<Result<HashMap<_, _>>>()?;
        Ok(Self::PerAction(map))
    }
}

impl fmt::Debug for ModeSetting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PerAction(map) => f.debug_tuple("PerAction").field(map).finish(),
            Self::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

/// A deadline given relative to now or as an absolute time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deadline {
    In(Duration),
    At(SystemTime),
}

impl Deadline {
    /// Absolute expiry. A relative deadline too far out to represent resolves
    /// to `None`, i.e. no deadline.
    pub fn resolve(self) -> Option<SystemTime> {
        match self {
            Deadline::In(d) => SystemTime::now().checked_add(d),
            Deadline::At(t) => Some(t),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct CallScope {
    enabled: Option<bool>,
    mode: Option<Mode>,
    deadline: Option<SystemTime>,
}

tokio::task_local! {
    static CALL_SCOPE: Cell<CallScope>;
}

fn current_scope() -> CallScope {
    CALL_SCOPE.try_with(Cell::get).unwrap_or_default()
}

fn derived(f: impl FnOnce(&mut CallScope)) -> Cell<CallScope> {
    let mut scope = current_scope();
    f(&mut scope);
    Cell::new(scope)
}

fn fresh_scope(deadline: Option<Deadline>) -> Cell<CallScope> {
    Cell::new(CallScope {
        deadline: deadline.and_then(Deadline::resolve),
        ..CallScope::default()
    })
}

pub struct RuntimeState {
    enabled: RwLock<Option<EnabledSetting>>,
    mode: RwLock<Option<ModeSetting>>,
    timeout_min: RwLock<f64>,
    sink: Arc<dyn MetricsSink>,
}

impl Default for RuntimeState {
    fn default() -> Self {
        Self::new(Arc::new(NoopSink))
    }
}

impl fmt::Debug for RuntimeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeState")
            .field("enabled", &*self.enabled.read().unwrap_or_else(PoisonError::into_inner))
            .field("mode", &*self.mode.read().unwrap_or_else(PoisonError::into_inner))
            .field("timeout_min", &self.timeout_min())
            .finish()
    }
}

impl RuntimeState {
    /// Fresh state reporting predicate faults to `sink`.
    pub fn new(sink: Arc<dyn MetricsSink>) -> Self {
        Self {
            enabled: RwLock::new(None),
            mode: RwLock::new(None),
            timeout_min: RwLock::new(DEFAULT_TIMEOUT_MIN),
            sink,
        }
    }

    pub fn set_enabled(&self, setting: EnabledSetting) {
        *self.enabled.write().unwrap_or_else(PoisonError::into_inner) = Some(setting);
    }

    pub fn set_mode(&self, setting: ModeSetting) {
        *self.mode.write().unwrap_or_else(PoisonError::into_inner) = Some(setting);
    }

    pub fn set_timeout_min(&self, millis: f64) -> Result<()> {
        if !millis.is_finite() || millis <= 0.0 {
            return Err(ResiliencyError::invalid_argument(format!(
                "invalid timeout_min: {millis}"
            )));
        }
        *self.timeout_min.write().unwrap_or_else(PoisonError::into_inner) = millis;
        Ok(())
    }

    /// Minimum timeout in milliseconds.
    pub fn timeout_min(&self) -> f64 {
        *self.timeout_min.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Restore defaults: enabled, observe everywhere, default floor.
    pub fn reset(&self) {
        *self.enabled.write().unwrap_or_else(PoisonError::into_inner) = None;
        *self.mode.write().unwrap_or_else(PoisonError::into_inner) = None;
        *self.timeout_min.write().unwrap_or_else(PoisonError::into_inner) = DEFAULT_TIMEOUT_MIN;
    }

    pub fn enabled(&self, adapter: Adapter) -> bool {
        if let Some(enabled) = current_scope().enabled {
            return enabled;
        }

        let setting = self
            .enabled
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        match setting {
            None => true,
            Some(EnabledSetting::Flag(flag)) => flag,
            Some(EnabledSetting::Predicate(f)) => {
                match catch_unwind(AssertUnwindSafe(|| self.disable(|| f(adapter)))) {
                    Ok(enabled) => enabled,
                    Err(_) => {
                        report_error(self.sink.as_ref(), "enabled", "Panic", &"enabled predicate panicked");
                        false
                    }
                }
            }
        }
    }

    pub fn mode(&self, action: Action) -> Mode {
        if let Some(mode) = current_scope().mode {
            return mode;
        }

        let setting = self
            .mode
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        match setting {
            None => Mode::Observe,
            Some(ModeSetting::PerAction(map)) => map.get(&action).copied().unwrap_or(Mode::Observe),
            Some(ModeSetting::Predicate(f)) => {
                match catch_unwind(AssertUnwindSafe(|| self.observe(|| f(action)))) {
                    Ok(Ok(mode)) => mode,
                    Ok(Err(e)) => {
                        report_error(self.sink.as_ref(), "mode", "Predicate", &e);
                        Mode::Observe
                    }
                    Err(_) => {
                        report_error(self.sink.as_ref(), "mode", "Panic", &"mode predicate panicked");
                        Mode::Observe
                    }
                }
            }
        }
    }

    /// Run `f` with enablement forced on.
    pub fn enable<R>(&self, f: impl FnOnce() -> R) -> R {
        CALL_SCOPE.sync_scope(derived(|s| s.enabled = Some(true)), f)
    }

    /// Run `f` with enablement forced off.
    pub fn disable<R>(&self, f: impl FnOnce() -> R) -> R {
        CALL_SCOPE.sync_scope(derived(|s| s.enabled = Some(false)), f)
    }

    /// Run `f` in observe mode.
    pub fn observe<R>(&self, f: impl FnOnce() -> R) -> R {
        CALL_SCOPE.sync_scope(derived(|s| s.mode = Some(Mode::Observe)), f)
    }

    pub fn enable_async<F: Future>(&self, fut: F) -> impl Future<Output = F::Output> {
        CALL_SCOPE.scope(derived(|s| s.enabled = Some(true)), fut)
    }

    pub fn disable_async<F: Future>(&self, fut: F) -> impl Future<Output = F::Output> {
        CALL_SCOPE.scope(derived(|s| s.enabled = Some(false)), fut)
    }

    pub fn observe_async<F: Future>(&self, fut: F) -> impl Future<Output = F::Output> {
        CALL_SCOPE.scope(derived(|s| s.mode = Some(Mode::Observe)), fut)
    }

    /// Run `fut` in a fresh call scope, e.g. for the lifetime of one inbound request.
    pub fn scope<F: Future>(&self, fut: F) -> impl Future<Output = F::Output> {
        CALL_SCOPE.scope(Cell::new(CallScope::default()), fut)
    }

    /// `scope`, starting with `deadline` already set.
    pub fn scope_with_deadline<F: Future>(
        &self,
        deadline: Option<Deadline>,
        fut: F,
    ) -> impl Future<Output = F::Output> {
        CALL_SCOPE.scope(fresh_scope(deadline), fut)
    }

    /// Synchronous counterpart of `scope_with_deadline`, covering `f` only.
    pub fn enter_with_deadline<R>(&self, deadline: Option<Deadline>, f: impl FnOnce() -> R) -> R {
        CALL_SCOPE.sync_scope(fresh_scope(deadline), f)
    }

    /// Run `f` with a deadline set for its duration.
    pub fn with_deadline<R>(&self, deadline: Deadline, f: impl FnOnce() -> R) -> R {
        let at = deadline.resolve();
        CALL_SCOPE.sync_scope(derived(|s| s.deadline = at), f)
    }

    pub fn deadline(&self) -> Option<SystemTime> {
        current_scope().deadline
    }

    /// Set or clear the deadline of the current call scope.
    pub fn set_deadline(&self, deadline: Option<Deadline>) -> Result<()> {
        let at = deadline.and_then(Deadline::resolve);
        CALL_SCOPE
            .try_with(|cell| {
                let mut scope = cell.get();
                scope.deadline = at;
                cell.set(scope);
            })
            .map_err(|_| ResiliencyError::invalid_argument("deadline requires an active call scope"))
    }

    /// Whether the current deadline has passed; `None` without a deadline.
    pub fn deadline_exceeded(&self) -> Option<bool> {
        self.deadline().map(|d| SystemTime::now() >= d)
    }
}
