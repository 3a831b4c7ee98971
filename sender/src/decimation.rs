//! Arrival-driven decimation for the report family.
//!
//! Each key accumulates the steps of the samples it suppressed. Once the accumulated time
//! reaches the reporting period a sample is forwarded and only the overflow is carried
//! into the next window, which keeps the long-run cadence at one sample per period even
//! when the step does not divide the period.
//!
//! State is split over lock-striped shards. The check-and-update for a key happens under
//! its shard lock, so concurrent samples of the same key can neither both forward nor
//! both suppress a window.

use fnv::FnvHasher;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::hash::Hasher;

const SHARDS: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DecimationState {
    /// Seconds accumulated since the last forwarded sample
    pub elapsed: i64,
    /// Timestamp of the last sample seen for the key
    pub last_timestamp: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    Forward,
    Suppress,
}

#[derive(Debug)]
pub struct DecimationCache {
    shards: Vec<Mutex<HashMap<String, DecimationState>>>,
}

impl DecimationCache {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    fn shard(&self, key: &str) -> &Mutex<HashMap<String, DecimationState>> {
        let mut hasher = FnvHasher::default();
        hasher.write(key.as_bytes());
        &self.shards[(hasher.finish() % SHARDS as u64) as usize]
    }

    /// Decides whether a sample with the given `step` and `timestamp` is forwarded
    /// to a sink that expects one sample per `period` seconds. A non-positive step
    /// cannot be decimated and is forwarded without touching the key's state.
    pub fn admit(&self, key: &str, step: i64, timestamp: i64, period: i64) -> Decision {
        if step <= 0 || step >= period {
            return Decision::Forward;
        }

        let mut shard = self.shard(key).lock();
        match shard.entry(key.to_string()) {
            Entry::Vacant(entry) => {
                entry.insert(DecimationState {
                    elapsed: 0,
                    last_timestamp: timestamp,
                });
                Decision::Forward
            }
            Entry::Occupied(mut entry) => {
                let state = entry.get_mut();
                state.last_timestamp = timestamp;
                if state.elapsed + step < period {
                    state.elapsed += step;
                    Decision::Suppress
                } else {
                    state.elapsed = state.elapsed + step - period;
                    Decision::Forward
                }
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<DecimationState> {
        self.shard(key).lock().get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes keys whose last sample is older than `ttl_secs` relative to `now`.
    /// Returns the number of removed keys.
    pub fn evict_idle(&self, now: i64, ttl_secs: i64) -> usize {
        let cutoff = now - ttl_secs;
        let mut removed = 0;
        for shard in &self.shards {
            let mut shard = shard.lock();
            let before = shard.len();
            shard.retain(|_, state| state.last_timestamp >= cutoff);
            removed += before - shard.len();
        }
        removed
    }
}

impl Default for DecimationCache {
    fn default() -> Self {
        Self::new()
    }
}
