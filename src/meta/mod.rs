//! Metadata engine.
//!
//! [`Meta`] composes a [`MetaClient`] backend with the read-through
//! [`MetaCache`] and implements the object, version, and multipart
//! lifecycles: versioning-aware writes, transactional usage accounting,
//! and garbage-collection handoff.  The object lifecycle lives in
//! [`object`], the multipart lifecycle in [`multipart`].

pub mod multipart;
pub mod object;

use std::sync::Arc;

use crate::cache::{CacheError, MetaCache};
use crate::client::{self, MetaClient};
use crate::config::Config;
use crate::errors::MetaError;

/// The metadata engine.
pub struct Meta {
    pub(crate) client: Arc<dyn MetaClient>,
    pub(crate) cache: MetaCache,
}

impl Meta {
    /// Build an engine over an existing client.
    pub fn new(client: Arc<dyn MetaClient>, cache_capacity: usize) -> Self {
        Meta {
            client,
            cache: MetaCache::new(cache_capacity),
        }
    }

    /// Build the engine from configuration: backend selection plus
    /// cache sizing.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let client = client::from_config(&config.meta)?;
        Ok(Meta::new(client, config.cache.max_entries))
    }

    /// The underlying metadata client, for callers that need operations
    /// outside the cached lifecycle (QoS bootstrap, GC scans).
    pub fn client(&self) -> &Arc<dyn MetaClient> {
        &self.client
    }
}

/// Cache key of an object record.  The empty version addresses the
/// null/latest slot, so unversioned and versioned lookups share one
/// keyspace.
fn object_cache_key(bucket: &str, key: &str, version: &str) -> String {
    format!("{bucket}:{key}:{version}")
}

/// Map cache failures to engine errors: fetch failures are backend
/// trouble, decode failures mean the stored entry no longer matches the
/// entity schema.
fn cache_err(err: CacheError) -> MetaError {
    match err {
        CacheError::Fetch(source) => MetaError::Backend(source),
        decode @ CacheError::Decode { .. } => MetaError::InternalError {
            message: decode.to_string(),
        },
    }
}
