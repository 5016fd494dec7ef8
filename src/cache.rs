//! Read-through metadata cache.
//!
//! Hot records (buckets, objects) are kept as serialized JSON in a
//! concurrent map.  [`MetaCache::get`] returns the cached record when
//! present and otherwise runs the caller's fetch; the fetched record is
//! cached only when the caller passes `will_need`, so one-shot reads
//! (listings, existence probes) do not churn the working set.
//!
//! Absent records are never cached: a `None` from the fetch always
//! reaches the backend again on the next call.

use std::future::Future;

use dashmap::DashMap;
use metrics::counter;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::metrics::{META_CACHE_HITS_TOTAL, META_CACHE_MISSES_TOTAL};

/// Which record family a cache entry belongs to.  Part of the entry key,
/// so bucket and object entries can share one map without colliding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheTable {
    Bucket,
    Object,
}

impl CacheTable {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheTable::Bucket => "bucket",
            CacheTable::Object => "object",
        }
    }
}

/// Errors surfaced by cache reads.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The backend fetch failed; the cache state is unchanged.
    #[error("metadata fetch failed: {0}")]
    Fetch(#[source] anyhow::Error),
    /// A cached entry no longer decodes as the requested type.
    #[error("decoding cached {table} record {key}: {source}")]
    Decode {
        table: &'static str,
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Concurrent read-through cache over serialized metadata records.
pub struct MetaCache {
    entries: DashMap<(CacheTable, String), Vec<u8>>,
    capacity: usize,
}

impl MetaCache {
    /// Create a cache holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        MetaCache {
            entries: DashMap::new(),
            capacity,
        }
    }

    /// Look up `key` in `table`, falling back to `fetch` on a miss.
    ///
    /// `Ok(None)` means the record does not exist; that outcome is
    /// returned to the caller but never cached.
    pub async fn get<T, F, Fut>(
        &self,
        table: CacheTable,
        key: &str,
        fetch: F,
        will_need: bool,
    ) -> Result<Option<T>, CacheError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<Option<T>>>,
    {
        let entry_key = (table, key.to_string());
        if let Some(raw) = self.entries.get(&entry_key) {
            counter!(META_CACHE_HITS_TOTAL, "table" => table.as_str()).increment(1);
            let decoded = serde_json::from_slice(&raw).map_err(|source| CacheError::Decode {
                table: table.as_str(),
                key: key.to_string(),
                source,
            })?;
            return Ok(Some(decoded));
        }

        counter!(META_CACHE_MISSES_TOTAL, "table" => table.as_str()).increment(1);
        tracing::debug!(table = table.as_str(), key, "metadata cache miss");

        let Some(value) = fetch().await.map_err(CacheError::Fetch)? else {
            return Ok(None);
        };
        if will_need {
            self.store(entry_key, &value);
        }
        Ok(Some(value))
    }

    /// Drop one entry, if cached.  Mutation paths call this so later
    /// reads observe the committed record.
    pub fn remove(&self, table: CacheTable, key: &str) {
        self.entries.remove(&(table, key.to_string()));
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn store<T: Serialize>(&self, entry_key: (CacheTable, String), value: &T) {
        let Ok(raw) = serde_json::to_vec(value) else {
            return;
        };
        if self.entries.len() >= self.capacity && !self.entries.contains_key(&entry_key) {
            // Evict an arbitrary entry to stay at capacity.
            let victim = self.entries.iter().next().map(|e| e.key().clone());
            if let Some(victim) = victim {
                self.entries.remove(&victim);
            }
        }
        self.entries.insert(entry_key, raw);
    }
}

// ── Tests ───────────────────────────────────────────────────────────
