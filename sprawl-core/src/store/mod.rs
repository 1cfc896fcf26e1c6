//! Key/value storage used for parking `Waiting` work items and for the robots cache.

mod disk;

pub use disk::{DiskStore, StoreRoot};

use std::{fmt, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Serialize, de::DeserializeOwned};

use crate::{clock::SharedClock, error::Result};

/// Minimal byte-oriented store contract. Adapters for external caches implement this.
#[async_trait]
pub trait KeyValueStore: Send + Sync + fmt::Debug {
    async fn put(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Returns whether a live entry was removed.
    async fn remove(&self, key: &str) -> Result<bool>;
}

pub async fn put_json<T>(
    store: &dyn KeyValueStore,
    key: &str,
    value: &T,
    ttl: Option<Duration>,
) -> Result<()>
where
    T: Serialize + ?Sized,
{
    let bytes = serde_json::to_vec(value)?;
    store.put(key, bytes, ttl).await
}

pub async fn get_json<T>(store: &dyn KeyValueStore, key: &str) -> Result<Option<T>>
where
    T: DeserializeOwned,
{
    match store.get(key).await? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

pub(crate) fn expiry_from(now: DateTime<Utc>, ttl: Option<Duration>) -> Option<DateTime<Utc>> {
    ttl.and_then(|ttl| chrono::Duration::from_std(ttl).ok())
        .map(|ttl| now + ttl)
}

#[derive(Clone, Debug)]
struct MemoryEntry {
    bytes: Vec<u8>,
    expires_at: Option<DateTime<Utc>>,
}

/// Process-local store. Expiry is evaluated lazily against the injected clock.
pub struct MemoryStore {
    clock: SharedClock,
    entries: DashMap<String, MemoryEntry>,
}

impl fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStore")
            .field("clock", &self.clock)
            .field("entries", &self.entries.len())
            .finish()
    }
}

impl MemoryStore {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            entries: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn put(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        let expires_at = expiry_from(self.clock.now(), ttl);
        self.entries.insert(
            key.to_owned(),
            MemoryEntry {
                bytes: value,
                expires_at,
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let now = self.clock.now();
        // Drop expired entries atomically so a concurrent put is never removed by mistake.
        self.entries
            .remove_if(key, |_, entry| entry.expires_at.is_some_and(|at| at <= now));
        Ok(self.entries.get(key).map(|entry| entry.bytes.clone()))
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        let now = self.clock.now();
        Ok(self
            .entries
            .remove(key)
            .is_some_and(|(_, entry)| entry.expires_at.is_none_or(|at| at > now)))
    }
}
