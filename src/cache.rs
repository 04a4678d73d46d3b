//! Recent-message cache and presence flags.
//!
//! The cache is a view over the message store: entries may be stale, partial or
//! missing at any time, and a cache backend outage degrades every caller to the
//! store instead of failing the request.

pub mod memory;
pub mod redis;

use std::{future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::models::messages::Message;

/// Number of messages kept per chat.
pub const RECENT_CAPACITY: usize = 50;

/// Idle lifetime of a chat's recent-message list.
pub const RECENT_TTL: Duration = Duration::from_secs(60 * 60 * 24);

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache connection error: {0}")]
    Connection(String),

    #[error("Cache serialization error: {0}")]
    Serialization(String),

    #[error("Cache operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Cache backend error: {0}")]
    Backend(String),
}

pub type CacheResult<T> = Result<T, CacheError>;

/// Key-value backend holding capped lists and expiring flags.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Pushes `value` to the tail of the list, trims it to the newest `cap`
    /// entries and resets its expiry, as one atomic step.
    async fn append(&self, key: &str, value: String, cap: usize, ttl: Duration) -> CacheResult<()>;

    /// Newest `max` entries of the list, oldest first.
    async fn read_list(&self, key: &str, max: usize) -> CacheResult<Vec<String>>;

    /// Invalidation counter under `key`. An absent counter reads as 0.
    async fn generation(&self, key: &str) -> CacheResult<u64>;

    /// Writes `values` as a new list only when nothing is stored under `key`
    /// and the counter under `generation_key` still equals `generation`.
    async fn populate_if_absent(
        &self,
        key: &str,
        values: Vec<String>,
        ttl: Duration,
        generation_key: &str,
        generation: u64,
    ) -> CacheResult<bool>;

    /// Bumps the counter under `generation_key` (expiring after `ttl`) and
    /// deletes `key`.
    async fn invalidate(&self, key: &str, generation_key: &str, ttl: Duration) -> CacheResult<()>;

    async fn set_flag(&self, key: &str, ttl: Duration) -> CacheResult<()>;

    async fn has_flag(&self, key: &str) -> CacheResult<bool>;

    fn provider_name(&self) -> &'static str;
}

async fn bounded<T, F>(timeout: Duration, fut: F) -> CacheResult<T>
where
    F: Future<Output = CacheResult<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(CacheError::Timeout(timeout)),
    }
}

/// Bounded per-chat list of the most recent messages.
#[derive(Clone)]
pub struct RecentMessageCache {
    store: Arc<dyn CacheStore>,
    timeout: Duration,
}

impl RecentMessageCache {
    pub fn new(store: Arc<dyn CacheStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    pub fn key(chat_id: Uuid) -> String {
        format!("chat:{}:messages:last{}", chat_id, RECENT_CAPACITY)
    }

    pub fn generation_key(chat_id: Uuid) -> String {
        format!("chat:{}:messages:gen", chat_id)
    }

    pub async fn append(&self, chat_id: Uuid, message: &Message) {
        let value = match serde_json::to_string(message) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(%chat_id, message_id = %message.id, error = %e, "failed to encode message for cache");
                return;
            }
        };

        let key = Self::key(chat_id);
        let result = bounded(
            self.timeout,
            self.store.append(&key, value, RECENT_CAPACITY, RECENT_TTL),
        )
        .await;

        if let Err(e) = result {
            tracing::warn!(%chat_id, message_id = %message.id, error = %e, "cache append failed");
        }
    }

    /// Cached messages ordered by id, oldest first. Any backend failure reads as empty.
    pub async fn read_recent(&self, chat_id: Uuid) -> Vec<Message> {
        let key = Self::key(chat_id);
        let raw = match bounded(self.timeout, self.store.read_list(&key, RECENT_CAPACITY)).await {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(%chat_id, error = %e, "cache read failed, falling back to store");
                return Vec::new();
            }
        };

        let mut messages = Vec::with_capacity(raw.len());
        for entry in raw {
            match serde_json::from_str::<Message>(&entry) {
                Ok(message) => messages.push(message),
                Err(e) => {
                    // A hole in the list would make the store backfill skip messages.
                    tracing::warn!(%chat_id, error = %e, "undecodable cache entry, dropping list");
                    self.invalidate(chat_id).await;
                    return Vec::new();
                }
            }
        }

        // Appends from concurrent senders may land out of id order, and a
        // warm-up racing a send can store the same message twice.
        messages.sort_by(|a, b| a.id.cmp(&b.id));
        messages.dedup_by(|a, b| a.id == b.id);
        messages
    }

    /// Drops the list and moves the chat to a new generation, so a warm-up
    /// holding an older generation can no longer write.
    pub async fn invalidate(&self, chat_id: Uuid) {
        let key = Self::key(chat_id);
        let generation_key = Self::generation_key(chat_id);
        if let Err(e) = bounded(
            self.timeout,
            self.store.invalidate(&key, &generation_key, RECENT_TTL),
        )
        .await
        {
            tracing::warn!(%chat_id, error = %e, "cache invalidation failed");
        }
    }

    /// Generation to hand to [`warm`](Self::warm). Must be read before the
    /// store query whose result will be warmed. `None` when the backend is
    /// unreachable, in which case no warm-up should be attempted.
    pub async fn generation(&self, chat_id: Uuid) -> Option<u64> {
        let generation_key = Self::generation_key(chat_id);
        match bounded(self.timeout, self.store.generation(&generation_key)).await {
            Ok(generation) => Some(generation),
            Err(e) => {
                tracing::warn!(%chat_id, error = %e, "cache generation read failed, skipping warm-up");
                None
            }
        }
    }

    /// Seeds an absent list with a window read from the store. Never
    /// overwrites a list that a concurrent send has already started, and
    /// writes nothing once the chat was invalidated after `generation` was read.
    pub async fn warm(&self, chat_id: Uuid, generation: u64, messages: &[Message]) {
        if messages.is_empty() {
            return;
        }

        let start = messages.len().saturating_sub(RECENT_CAPACITY);
        let mut values = Vec::with_capacity(messages.len() - start);
        for message in &messages[start..] {
            match serde_json::to_string(message) {
                Ok(value) => values.push(value),
                Err(e) => {
                    tracing::warn!(%chat_id, error = %e, "failed to encode message for cache warm-up");
                    return;
                }
            }
        }

        let key = Self::key(chat_id);
        let generation_key = Self::generation_key(chat_id);
        match bounded(
            self.timeout,
            self.store
                .populate_if_absent(&key, values, RECENT_TTL, &generation_key, generation),
        )
        .await
        {
            Ok(true) => tracing::debug!(%chat_id, generation, "recent-message cache warmed"),
            Ok(false) => tracing::debug!(%chat_id, generation, "cache warm-up skipped"),
            Err(e) => tracing::warn!(%chat_id, error = %e, "cache warm-up failed"),
        }
    }
}

/// Short-lived online markers, refreshed by client pings.
#[derive(Clone)]
pub struct Presence {
    store: Arc<dyn CacheStore>,
    ttl: Duration,
    timeout: Duration,
}

impl Presence {
    pub fn new(store: Arc<dyn CacheStore>, ttl: Duration, timeout: Duration) -> Self {
        Self {
            store,
            ttl,
            timeout,
        }
    }

    pub fn key(user_id: Uuid) -> String {
        format!("user:{}:online", user_id)
    }

    pub async fn mark_online(&self, user_id: Uuid) {
        let key = Self::key(user_id);
        if let Err(e) = bounded(self.timeout, self.store.set_flag(&key, self.ttl)).await {
            tracing::warn!(%user_id, error = %e, "failed to record presence");
        }
    }

    pub async fn is_online(&self, user_id: Uuid) -> bool {
        let key = Self::key(user_id);
        bounded(self.timeout, self.store.has_flag(&key))
            .await
            .unwrap_or(false)
    }
}
