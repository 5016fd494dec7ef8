//! MoorStore metadata core — consistency and accounting engine for an
//! S3-compatible object storage gateway.
//!
//! This crate provides the pieces a gateway front-end composes: a
//! transactional metadata client over pluggable backends, a
//! read-through record cache, per-tenant QoS admission and throttling,
//! the object and multipart lifecycle engine, and a blob store
//! adapter for the data path.

pub mod cache;
pub mod client;
pub mod config;
pub mod errors;
pub mod meta;
pub mod metrics;
pub mod qos;
pub mod storage;
pub mod types;

pub use cache::{CacheError, CacheTable, MetaCache};
pub use client::{MemoryClient, MetaClient, SqliteClient, Transaction, TxOp};
pub use config::Config;
pub use errors::MetaError;
pub use meta::Meta;
pub use qos::{MemoryRateStore, QosMeta, RateCounterStore, ThrottleReader};
pub use storage::{BlobReader, BlobStore, MemoryBlobStore};
