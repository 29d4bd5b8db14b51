//! Pending-call cache
//!
//! Maps a request identity to the record created at Begin until End takes it.
//! Every entry lives for a fixed TTL measured from its most recent store; a
//! Begin that never sees an End is evicted lazily on access or by the
//! background sweeper.
//!
//! The map is split into shards, each behind its own lock. Every operation
//! touches exactly one shard and never awaits while holding it, so a take is
//! atomic per key: two racing takes cannot both observe the same record.

use depcorr_core::metrics::{incr, SharedMetrics};
use depcorr_core::{CallRecord, RequestKey};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

const SHARD_COUNT: usize = 16;

/// A pending call as stored in the cache
#[derive(Debug, Clone)]
pub struct Pending {
    pub record: CallRecord,

    /// Completion belongs to caller code; the engine never emits or removes it
    pub externally_owned: bool,
}

/// Outcome of [`CorrelationCache::take_unless_owned`]
#[derive(Debug)]
pub enum Take {
    /// The record was removed and now belongs to the caller
    Taken(CallRecord),

    /// An externally owned record is present and was left in place
    Owned,

    /// Nothing pending under this key
    Missing,
}

#[derive(Debug)]
struct Entry {
    pending: Pending,
    inserted_at: Instant,
}

type Shard = Mutex<HashMap<RequestKey, Entry>>;

/// Thread-safe map of request identity to pending call
pub struct CorrelationCache {
    shards: Box<[Shard]>,
    ttl: Duration,
    metrics: SharedMetrics,
}

impl CorrelationCache {
    pub fn new(ttl: Duration, metrics: SharedMetrics) -> Self {
        let shards = (0..SHARD_COUNT)
            .map(|_| Mutex::new(HashMap::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            shards,
            ttl,
            metrics,
        }
    }

    /// Entry lifetime
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn shard(&self, key: RequestKey) -> &Shard {
        &self.shards[(key.as_u64() % SHARD_COUNT as u64) as usize]
    }

    fn is_expired(&self, entry: &Entry, now: Instant) -> bool {
        now.duration_since(entry.inserted_at) >= self.ttl
    }

    /// Remove `key` if its entry has outlived the TTL
    ///
    /// Returns `true` if an entry was evicted.
    fn evict_if_expired(&self, map: &mut HashMap<RequestKey, Entry>, key: RequestKey) -> bool {
        let expired = map
            .get(&key)
            .is_some_and(|entry| self.is_expired(entry, Instant::now()));
        if expired {
            map.remove(&key);
            incr(&self.metrics.calls.expired);
            debug!("Evicted expired pending call {}", key);
        }
        expired
    }

    /// Insert or overwrite the pending call for `key`, resetting its expiry
    pub fn store(&self, key: RequestKey, record: CallRecord, externally_owned: bool) {
        let entry = Entry {
            pending: Pending {
                record,
                externally_owned,
            },
            inserted_at: Instant::now(),
        };
        self.shard(key).lock().insert(key, entry);
    }

    /// Store an engine-owned record unless an externally owned one holds `key`
    ///
    /// Returns `false`, leaving the cache untouched, when ownership refused the
    /// store. An expired owned entry no longer blocks.
    pub fn store_unless_owned(&self, key: RequestKey, record: CallRecord) -> bool {
        let mut map = self.shard(key).lock();
        self.evict_if_expired(&mut map, key);
        if map.get(&key).is_some_and(|entry| entry.pending.externally_owned) {
            return false;
        }
        map.insert(
            key,
            Entry {
                pending: Pending {
                    record,
                    externally_owned: false,
                },
                inserted_at: Instant::now(),
            },
        );
        true
    }

    /// Non-destructive read; does not extend the entry's lifetime
    pub fn get(&self, key: RequestKey) -> Option<Pending> {
        let mut map = self.shard(key).lock();
        if self.evict_if_expired(&mut map, key) {
            return None;
        }
        map.get(&key).map(|entry| entry.pending.clone())
    }

    /// Atomically read and delete
    pub fn take_and_remove(&self, key: RequestKey) -> Option<Pending> {
        let mut map = self.shard(key).lock();
        if self.evict_if_expired(&mut map, key) {
            return None;
        }
        map.remove(&key).map(|entry| entry.pending)
    }

    /// Atomically take a record the engine is allowed to complete
    ///
    /// Externally owned entries stay in the cache untouched.
    pub fn take_unless_owned(&self, key: RequestKey) -> Take {
        let mut map = self.shard(key).lock();
        if self.evict_if_expired(&mut map, key) {
            return Take::Missing;
        }
        match map.get(&key) {
            None => Take::Missing,
            Some(entry) if entry.pending.externally_owned => Take::Owned,
            Some(_) => match map.remove(&key) {
                Some(entry) => Take::Taken(entry.pending.record),
                None => Take::Missing,
            },
        }
    }

    /// Atomically take an externally owned record; engine-owned entries stay
    pub fn take_owned(&self, key: RequestKey) -> Option<CallRecord> {
        let mut map = self.shard(key).lock();
        if self.evict_if_expired(&mut map, key) {
            return None;
        }
        if !map.get(&key)?.pending.externally_owned {
            return None;
        }
        map.remove(&key).map(|entry| entry.pending.record)
    }

    /// Drop the entry for `key`, if any
    pub fn remove(&self, key: RequestKey) -> bool {
        self.shard(key).lock().remove(&key).is_some()
    }

    /// Number of stored entries, including expired ones not yet swept
    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|shard| shard.lock().is_empty())
    }

    /// Evict every expired entry; returns how many were removed
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut evicted = 0;
        for shard in self.shards.iter() {
            let mut map = shard.lock();
            let before = map.len();
            map.retain(|_, entry| !self.is_expired(entry, now));
            evicted += before - map.len();
        }

        if evicted > 0 {
            self.metrics
                .calls
                .expired
                .fetch_add(evicted as u64, std::sync::atomic::Ordering::Relaxed);
            debug!("Swept {} expired pending calls", evicted);
        }
        evicted
    }

    /// Start the periodic sweep; stops when `shutdown` fires
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            info!(
                "Starting pending-call sweeper with {}ms interval",
                interval.as_millis()
            );

            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        cache.sweep();
                    }
                    _ = shutdown.recv() => {
                        info!("Pending-call sweeper shutting down");
                        break;
                    }
                }
            }
        })
    }
}
