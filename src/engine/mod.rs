//! Keyed statistics store
//!
//! What this module provides
//! - `StatsEngine`: per-key pairs of accumulators `(local, remote)`; `local` holds
//!   samples seen by this process since the last sync, `remote` is the last known
//!   globally merged picture
//! - The selection and rotation steps of the sync protocol, plus `sync` which
//!   drives one full cycle against a `RemoteStore`
//!
//! Locking
//! - One store-wide mutex guards the key map and the rotation step; it is never
//!   held across I/O
//! - Each accumulator carries its own lock, so readers of different keys do not
//!   serialize on the map lock beyond the lookup

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::error::Result;
use crate::remote::RemoteStore;
use crate::stats::{ensure_finite, Accumulator, Locked, Stats};

#[derive(Debug, Default)]
struct Entry {
    local: Locked<Stats>,
    remote: Locked<Stats>,
}

#[derive(Debug, Default)]
pub struct StatsEngine {
    entries: Mutex<HashMap<String, Arc<Entry>>>,
}

impl StatsEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Arc<Entry>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn entry(&self, key: &str) -> Option<Arc<Entry>> {
        self.entries().get(key).cloned()
    }

    /// Record a sample for `key`, returning a snapshot of the local accumulator.
    pub fn add(&self, key: &str, value: f64) -> Result<Stats> {
        ensure_finite(value)?;
        let entry = self
            .entries()
            .entry(key.to_string())
            .or_default()
            .clone();

        entry.local.with(|local: &mut Stats| -> Result<Stats> {
            local.update(value)?;
            Ok(*local)
        })
    }

    /// Local activity layered over the last synced global state.
    pub fn get(&self, key: &str) -> Stats {
        match self.entry(key) {
            Some(entry) => entry.local.merged_with(&entry.remote),
            None => Stats::new(),
        }
    }

    /// Downsample a key's local history. Unknown keys are ignored.
    pub fn scale(&self, key: &str, percentage: f64) -> Result<()> {
        match self.entry(key) {
            Some(entry) => entry.local.with(|local| local.scale(percentage)),
            None => Ok(()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    pub fn reset(&self) {
        self.entries().clear();
    }

    /// Keys most in need of a sync, heaviest local traffic first.
    ///
    /// Keys with nothing new are only considered while they have never received
    /// a remote view, and then with zero weight.
    pub fn sync_candidates(&self, limit: usize) -> Vec<String> {
        let entries = self.entries();
        let mut weighted: Vec<(u64, &String)> = entries
            .iter()
            .filter_map(|(key, entry)| {
                let local = entry.local.with(|s| s.n());
                if local == 0 && !entry.remote.with(|s| s.is_empty()) {
                    None
                } else {
                    Some((local, key))
                }
            })
            .collect();

        weighted.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(b.1)));
        weighted
            .into_iter()
            .take(limit)
            .map(|(_, key)| key.clone())
            .collect()
    }

    /// Rotate the local accumulators of `keys` for handoff to the remote store.
    ///
    /// Each local accumulator is folded into its remote view (assuming the sync
    /// will succeed) and replaced with an empty one; the pre-reset contents are
    /// returned. Samples arriving during the round trip land in the fresh bucket.
    pub fn begin_sync(&self, keys: &[String]) -> HashMap<String, Stats> {
        let entries = self.entries();
        keys.iter()
            .filter_map(|key| {
                let entry = entries.get(key)?;
                Some((key.clone(), entry.local.drain_into(&entry.remote)))
            })
            .collect()
    }

    /// Install the authoritative post-merge state returned by the remote store.
    pub fn complete_sync(&self, results: HashMap<String, Stats>) {
        let entries = self.entries();
        for (key, stats) in results {
            if let Some(entry) = entries.get(&key) {
                entry.remote.replace(stats);
            }
        }
    }

    /// One full sync cycle for up to `limit` keys. Returns the keys synced.
    pub async fn sync(&self, remote: &dyn RemoteStore, limit: usize) -> Result<Vec<String>> {
        let keys = self.sync_candidates(limit);
        if keys.is_empty() {
            return Ok(keys);
        }

        let handoff = self.begin_sync(&keys);
        let merged = remote.merge_and_fetch_all(handoff).await?;
        let synced: Vec<String> = merged.keys().cloned().collect();
        self.complete_sync(merged);

        debug!(keys = synced.len(), "synced stats");
        Ok(synced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{MemoryRemoteStore, RemoteConfig};
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    fn stats(values: &[f64]) -> Stats {
        Stats::from_values(values.iter().copied()).unwrap()
    }

    #[test]
    fn get_unknown_key_is_empty() {
        let engine = StatsEngine::new();
        assert!(engine.get("nope").is_empty());
    }

    #[test]
    fn add_accumulates_locally() {
        let engine = StatsEngine::new();
        engine.add("foo", 1.0).unwrap();
        let local = engine.add("foo", 3.0).unwrap();
        assert_eq!(local.n(), 2);
        assert!(engine.get("foo").approx_eq(&stats(&[1.0, 3.0]), 1e-12));
    }

    #[test]
    fn add_rejects_non_finite() {
        let engine = StatsEngine::new();
        assert!(engine.add("foo", f64::NAN).is_err());
        assert!(engine.add("bar", f64::INFINITY).is_err());
        assert!(engine.get("foo").is_empty());
        // rejected samples leave no key behind
        assert!(engine.is_empty());
        assert!(engine.sync_candidates(10).is_empty());
    }

    #[test]
    fn readers_never_see_rotating_samples_twice() {
        let engine = Arc::new(StatsEngine::new());
        let started = Arc::new(AtomicU64::new(0));
        let finished = Arc::new(AtomicU64::new(0));
        let stop = Arc::new(AtomicBool::new(false));

        let writer = {
            let (engine, started, finished, stop) =
                (engine.clone(), started.clone(), finished.clone(), stop.clone());
            std::thread::spawn(move || {
                let keys = ["foo".to_string()];
                while !stop.load(Ordering::SeqCst) {
                    started.fetch_add(1, Ordering::SeqCst);
                    engine.add("foo", 1.0).unwrap();
                    finished.fetch_add(1, Ordering::SeqCst);
                    engine.begin_sync(&keys);
                }
            })
        };

        for _ in 0..20_000 {
            let low = finished.load(Ordering::SeqCst);
            let seen = engine.get("foo").n();
            let high = started.load(Ordering::SeqCst);
            assert!(low <= seen && seen <= high, "{low} <= {seen} <= {high}");
        }
        stop.store(true, Ordering::SeqCst);
        writer.join().unwrap();
    }

    #[test]
    fn begin_sync_rotates_local_into_remote_view() {
        let engine = StatsEngine::new();
        engine.add("foo", 1.0).unwrap();
        engine.add("foo", 2.0).unwrap();

        let handoff = engine.begin_sync(&["foo".to_string(), "missing".to_string()]);
        assert_eq!(handoff.len(), 1);
        assert_eq!(handoff["foo"].n(), 2);

        // nothing lost from the reader's perspective
        assert_eq!(engine.get("foo").n(), 2);

        engine.add("foo", 3.0).unwrap();
        assert!(engine.get("foo").approx_eq(&stats(&[1.0, 2.0, 3.0]), 1e-12));
    }

    #[test]
    fn complete_sync_replaces_remote_view() {
        let engine = StatsEngine::new();
        engine.add("foo", 1.0).unwrap();
        engine.begin_sync(&["foo".to_string()]);

        let global = stats(&[1.0, 10.0, 20.0]);
        engine.complete_sync(HashMap::from([("foo".to_string(), global)]));
        assert_eq!(engine.get("foo"), global);
    }

    #[test]
    fn sync_candidates_prioritize_busiest_keys() {
        let engine = StatsEngine::new();
        for (key, n) in [("a", 1), ("b", 5), ("c", 3), ("d", 4)] {
            for _ in 0..n {
                engine.add(key, 10.0).unwrap();
            }
        }

        assert_eq!(engine.sync_candidates(2), vec!["b", "d"]);
        assert_eq!(engine.sync_candidates(10).len(), 4);
    }

    #[test]
    fn sync_candidates_skip_quiet_synced_keys() {
        let engine = StatsEngine::new();
        engine.add("synced", 1.0).unwrap();
        engine.add("busy", 1.0).unwrap();
        engine.begin_sync(&["synced".to_string(), "busy".to_string()]);
        engine.add("busy", 2.0).unwrap();

        assert_eq!(engine.sync_candidates(10), vec!["busy"]);
    }

    #[test]
    fn scale_only_touches_local() {
        let engine = StatsEngine::new();
        for v in [1.0, 2.0, 3.0, 4.0] {
            engine.add("foo", v).unwrap();
        }
        engine.scale("foo", 50.0).unwrap();
        assert_eq!(engine.get("foo").n(), 2);
        engine.scale("unknown", 50.0).unwrap();
    }

    #[test]
    fn reset_clears_all_keys() {
        let engine = StatsEngine::new();
        engine.add("foo", 1.0).unwrap();
        engine.reset();
        assert!(engine.is_empty());
        assert_eq!(engine.get("foo").n(), 0);
    }

    #[tokio::test]
    async fn sync_combines_local_and_remote() {
        let remote = MemoryRemoteStore::new(RemoteConfig::default());
        let engine = StatsEngine::new();

        engine.add("foo", 1.0).unwrap();
        let synced = engine.sync(&remote, 10).await.unwrap();
        assert_eq!(synced, vec!["foo"]);

        engine.add("foo", 3.0).unwrap();
        assert!(engine.get("foo").approx_eq(&stats(&[1.0, 3.0]), 1e-12));
    }

    #[tokio::test]
    async fn sync_picks_up_state_after_reset() {
        let remote = MemoryRemoteStore::new(RemoteConfig::default());
        let engine = StatsEngine::new();
        engine.add("foo", 1.0).unwrap();
        engine.sync(&remote, 10).await.unwrap();
        engine.reset();

        engine.add("foo", 1.0).unwrap();
        assert_eq!(engine.get("foo").n(), 1);

        engine.sync(&remote, 10).await.unwrap();
        assert_eq!(engine.get("foo").n(), 2);
    }
}
