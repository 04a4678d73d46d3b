//! In-process cache backend.
//!
//! Not shared between processes; used when no Redis URL is configured and in tests.
//! Expired entries are dropped when read and swept every [`SWEEP_EVERY`] writes.

use std::{
    collections::VecDeque,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;

use super::{CacheResult, CacheStore};

const SWEEP_EVERY: u64 = 1024;

#[derive(Debug)]
enum Value {
    List(VecDeque<String>),
    Flag,
}

#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at: Instant,
}

impl Entry {
    fn is_live(&self) -> bool {
        self.expires_at > Instant::now()
    }
}

#[derive(Debug)]
struct Counter {
    value: u64,
    expires_at: Instant,
}

impl Counter {
    fn is_live(&self) -> bool {
        self.expires_at > Instant::now()
    }
}

/// Lock order is `entries` before `generations`; a guard on `entries` may be
/// held while touching `generations`, never the other way round.
#[derive(Debug, Default)]
pub struct InMemoryCacheStore {
    entries: DashMap<String, Entry>,
    generations: DashMap<String, Counter>,
    writes: AtomicU64,
}

impl InMemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn live_list(&self, key: &str) -> Option<Vec<String>> {
        self.evict_expired(key);
        let entry = self.entries.get(key)?;
        match &entry.value {
            Value::List(items) => Some(items.iter().cloned().collect()),
            Value::Flag => None,
        }
    }

    fn live_counter(&self, key: &str) -> u64 {
        self.generations
            .get(key)
            .filter(|counter| counter.is_live())
            .map(|counter| counter.value)
            .unwrap_or(0)
    }

    fn evict_expired(&self, key: &str) {
        self.entries.remove_if(key, |_, entry| !entry.is_live());
    }

    /// Counts a write and, every `SWEEP_EVERY` writes, drops all expired
    /// entries. Must be called without holding an entry guard.
    fn record_write(&self) {
        if self.writes.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == SWEEP_EVERY - 1 {
            let before = self.entries.len() + self.generations.len();
            self.entries.retain(|_, entry| entry.is_live());
            self.generations.retain(|_, counter| counter.is_live());
            let after = self.entries.len() + self.generations.len();
            tracing::debug!(removed = before.saturating_sub(after), "swept expired cache entries");
        }
    }
}

#[async_trait]
impl CacheStore for InMemoryCacheStore {
    async fn append(&self, key: &str, value: String, cap: usize, ttl: Duration) -> CacheResult<()> {
        self.record_write();
        // The entry guard holds the shard lock for push, trim and expiry together.
        let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::List(VecDeque::new()),
            expires_at: Instant::now() + ttl,
        });

        if !entry.is_live() || !matches!(entry.value, Value::List(_)) {
            entry.value = Value::List(VecDeque::new());
        }

        if let Value::List(items) = &mut entry.value {
            items.push_back(value);
            while items.len() > cap {
                items.pop_front();
            }
        }
        entry.expires_at = Instant::now() + ttl;
        Ok(())
    }

    async fn read_list(&self, key: &str, max: usize) -> CacheResult<Vec<String>> {
        let items = self.live_list(key).unwrap_or_default();
        let start = items.len().saturating_sub(max);
        Ok(items[start..].to_vec())
    }

    async fn generation(&self, key: &str) -> CacheResult<u64> {
        Ok(self.live_counter(key))
    }

    async fn populate_if_absent(
        &self,
        key: &str,
        values: Vec<String>,
        ttl: Duration,
        generation_key: &str,
        generation: u64,
    ) -> CacheResult<bool> {
        if values.is_empty() {
            return Ok(false);
        }
        self.record_write();

        // The list guard is held across the counter check, and `invalidate`
        // bumps the counter under the same guard.
        let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::List(VecDeque::new()),
            expires_at: Instant::now(),
        });

        let occupied = entry.is_live()
            && match &entry.value {
                Value::List(items) => !items.is_empty(),
                Value::Flag => true,
            };
        if occupied || self.live_counter(generation_key) != generation {
            return Ok(false);
        }

        entry.value = Value::List(values.into_iter().collect());
        entry.expires_at = Instant::now() + ttl;
        Ok(true)
    }

    async fn invalidate(&self, key: &str, generation_key: &str, ttl: Duration) -> CacheResult<()> {
        self.record_write();

        let mut list = self.entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::List(VecDeque::new()),
            expires_at: Instant::now(),
        });

        let mut counter = self
            .generations
            .entry(generation_key.to_string())
            .or_insert_with(|| Counter {
                value: 0,
                expires_at: Instant::now(),
            });
        counter.value = if counter.is_live() { counter.value + 1 } else { 1 };
        counter.expires_at = Instant::now() + ttl;
        drop(counter);

        // Leave an already expired, empty placeholder; reads treat it as absent.
        list.value = Value::List(VecDeque::new());
        list.expires_at = Instant::now();
        drop(list);

        self.evict_expired(key);
        Ok(())
    }

    async fn set_flag(&self, key: &str, ttl: Duration) -> CacheResult<()> {
        self.record_write();
        self.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Flag,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn has_flag(&self, key: &str) -> CacheResult<bool> {
        self.evict_expired(key);
        Ok(self
            .entries
            .get(key)
            .map(|entry| matches!(entry.value, Value::Flag))
            .unwrap_or(false))
    }

    fn provider_name(&self) -> &'static str {
        "memory"
    }
}
