//! Remote (shared) statistics store
//!
//! What this module provides
//! - `RemoteStore`: the single "merge-and-fetch" operation every shared backend
//!   implements, atomic per key with respect to concurrent callers
//! - `MemoryRemoteStore`: an in-process backend implementing the windowed
//!   protocol; also the reference for what a server-side script must do
//!
//! Protocol, per key
//! 1. Read the window of recently merged summaries
//! 2. Append the incoming summary (empty summaries only fetch) and trim the
//!    window to `window_max`, dropping the oldest first
//! 3. If a cached aggregate is still fresh and covers at least
//!    `cache_min_samples`, return it
//! 4. Otherwise fold the whole window with the `Stats` merge algebra, cache the
//!    result for `cache_ttl` when it is large enough, and return it
//!
//! A stale cache only delays visibility of the newest summaries; it never
//! corrupts the aggregate.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};

use crate::error::{ResiliencyError, Result};
use crate::stats::{Accumulator, Stats};

/// Limits for the windowed merge protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Maximum number of summaries kept per key
    pub window_max: usize,

    /// Minimum sample count before an aggregate is cached
    pub cache_min_samples: u64,

    /// How long a cached aggregate stays valid
    pub cache_ttl: Duration,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            window_max: 100,
            cache_min_samples: 1_000,
            cache_ttl: Duration::from_secs(5),
        }
    }
}

/// A shared store that merges local summaries into a global view.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Append `summary` to `key`'s window and return the merged aggregate.
    async fn merge_and_fetch(&self, key: &str, summary: Stats) -> Result<Stats>;

    /// Batch form of `merge_and_fetch`. Fails if any key fails.
    async fn merge_and_fetch_all(
        &self,
        batch: HashMap<String, Stats>,
    ) -> Result<HashMap<String, Stats>> {
        let calls = batch.into_iter().map(|(key, summary)| async move {
            let merged = self.merge_and_fetch(&key, summary).await?;
            Ok::<_, ResiliencyError>((key, merged))
        });
        Ok(try_join_all(calls).await?.into_iter().collect())
    }
}

#[derive(Debug, Default)]
struct Window {
    summaries: VecDeque<Stats>,
    cache: Option<(Stats, Instant)>,
}

impl Window {
    fn aggregate(&self) -> Stats {
        self.summaries.iter().fold(Stats::new(), |acc, s| acc.merged(s))
    }
}

/// In-process `RemoteStore`; a single mutex makes every merge atomic.
#[derive(Debug, Default)]
pub struct MemoryRemoteStore {
    config: RemoteConfig,
    windows: Mutex<HashMap<String, Window>>,
}

impl MemoryRemoteStore {
    pub fn new(config: RemoteConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Number of summaries currently held for `key`.
    pub fn window_len(&self, key: &str) -> usize {
        self.windows
            .lock()
            .map(|w| w.get(key).map_or(0, |w| w.summaries.len()))
            .unwrap_or(0)
    }

    fn merge(&self, key: &str, summary: Stats) -> Result<Stats> {
        let mut windows = self
            .windows
            .lock()
            .map_err(|_| ResiliencyError::Backend("remote store lock poisoned".to_string()))?;
        let window = windows.entry(key.to_string()).or_default();

        if !summary.is_empty() {
            window.summaries.push_back(summary);
            while window.summaries.len() > self.config.window_max {
                window.summaries.pop_front();
            }
        }

        let now = Instant::now();
        if let Some((cached, expires)) = window.cache {
            if now < expires && cached.n() >= self.config.cache_min_samples {
                return Ok(cached);
            }
        }

        let aggregate = window.aggregate();
        window.cache = if aggregate.n() >= self.config.cache_min_samples {
            Some((aggregate, now + self.config.cache_ttl))
        } else {
            None
        };
        Ok(aggregate)
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn merge_and_fetch(&self, key: &str, summary: Stats) -> Result<Stats> {
        self.merge(key, summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(values: &[f64]) -> Stats {
        Stats::from_values(values.iter().copied()).unwrap()
    }

    #[tokio::test]
    async fn merges_summaries_from_many_writers() {
        let store = MemoryRemoteStore::new(RemoteConfig {
            window_max: 10,
            ..RemoteConfig::default()
        });

        store.merge_and_fetch("k", stats(&[1.0, 2.0])).await.unwrap();
        let merged = store.merge_and_fetch("k", stats(&[3.0, 4.0, 5.0])).await.unwrap();
        assert!(merged.approx_eq(&stats(&[1.0, 2.0, 3.0, 4.0, 5.0]), 1e-12));
    }

    #[tokio::test]
    async fn empty_summary_only_fetches() {
        let store = MemoryRemoteStore::new(RemoteConfig::default());
        store.merge_and_fetch("k", stats(&[7.0])).await.unwrap();
        let fetched = store.merge_and_fetch("k", Stats::new()).await.unwrap();
        assert_eq!(fetched.n(), 1);
        assert_eq!(store.window_len("k"), 1);
    }

    #[tokio::test]
    async fn window_drops_oldest_summaries() {
        let store = MemoryRemoteStore::new(RemoteConfig {
            window_max: 2,
            ..RemoteConfig::default()
        });

        store.merge_and_fetch("k", stats(&[100.0])).await.unwrap();
        store.merge_and_fetch("k", stats(&[1.0])).await.unwrap();
        let merged = store.merge_and_fetch("k", stats(&[3.0])).await.unwrap();

        assert_eq!(store.window_len("k"), 2);
        assert!(merged.approx_eq(&stats(&[1.0, 3.0]), 1e-12));
    }

    #[tokio::test]
    async fn large_aggregates_are_cached_until_expiry() {
        let store = MemoryRemoteStore::new(RemoteConfig {
            window_max: 10,
            cache_min_samples: 3,
            cache_ttl: Duration::from_secs(60),
        });

        let first = store.merge_and_fetch("k", stats(&[1.0, 1.0, 1.0])).await.unwrap();
        assert_eq!(first.n(), 3);

        // cached aggregate is served; the new summary is still retained
        let second = store.merge_and_fetch("k", stats(&[9.0])).await.unwrap();
        assert_eq!(second, first);
        assert_eq!(store.window_len("k"), 2);
    }

    #[tokio::test]
    async fn small_aggregates_are_recomputed() {
        let store = MemoryRemoteStore::new(RemoteConfig {
            window_max: 10,
            cache_min_samples: 100,
            cache_ttl: Duration::from_secs(60),
        });

        store.merge_and_fetch("k", stats(&[1.0])).await.unwrap();
        let second = store.merge_and_fetch("k", stats(&[9.0])).await.unwrap();
        assert_eq!(second.n(), 2);
    }

    #[tokio::test]
    async fn batch_merge_returns_every_key() {
        let store = MemoryRemoteStore::new(RemoteConfig::default());
        let batch = HashMap::from([
            ("a".to_string(), stats(&[1.0])),
            ("b".to_string(), stats(&[2.0, 4.0])),
        ]);

        let merged = store.merge_and_fetch_all(batch).await.unwrap();
        assert_eq!(merged.len(), 2);
        assert_eq!(merged["b"].n(), 2);
    }
}
