//! In-memory blob store.
//!
//! Blobs live in a `tokio::sync::RwLock<HashMap<...>>` keyed by
//! `pool/id`.  Every write records a SHA-256 digest of the payload and
//! every read re-checks it before handing out a window, so corrupted
//! bytes surface as an error rather than as a silently wrong stream.

use std::collections::HashMap;
use std::future::Future;
use std::io::Cursor;
use std::pin::Pin;

use anyhow::bail;
use bytes::Bytes;
use sha2::{Digest, Sha256};

use super::{BlobReader, BlobStore};

struct Blob {
    data: Bytes,
    content_hash: String,
}

/// Blob store backed by process memory.
///
/// Intended for tests and ephemeral deployments; contents vanish on
/// restart.  `append` is not supported here because stored payloads are
/// immutable `Bytes`.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: tokio::sync::RwLock<HashMap<String, Blob>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn blob_key(pool: &str, id: &str) -> String {
    format!("{pool}/{id}")
}

fn new_blob_id() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}

fn compute_content_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

impl BlobStore for MemoryBlobStore {
    fn put(
        &self,
        pool: &str,
        data: Bytes,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<(String, u64)>> + Send + '_>> {
        let pool = pool.to_string();
        Box::pin(async move {
            let id = new_blob_id();
            let bytes_written = data.len() as u64;
            let blob = Blob {
                content_hash: compute_content_hash(&data),
                data,
            };
            let mut blobs = self.blobs.write().await;
            blobs.insert(blob_key(&pool, &id), blob);
            Ok((id, bytes_written))
        })
    }

    fn get_reader(
        &self,
        pool: &str,
        id: &str,
        offset: u64,
        length: u64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<BlobReader>> + Send + '_>> {
        let key = blob_key(pool, id);
        Box::pin(async move {
            let blobs = self.blobs.read().await;
            let Some(blob) = blobs.get(&key) else {
                bail!("Blob not found at {key}");
            };
            if compute_content_hash(&blob.data) != blob.content_hash {
                bail!("Blob at {key} failed its integrity check");
            }
            let total = blob.data.len() as u64;
            if offset > total {
                bail!("Read window starts past the end of blob {key} ({offset} > {total})");
            }
            let end = if length == 0 {
                total
            } else {
                total.min(offset.saturating_add(length))
            };
            let window = blob.data.slice(offset as usize..end as usize);
            Ok(Box::pin(Cursor::new(window)) as BlobReader)
        })
    }

    fn remove(
        &self,
        pool: &str,
        id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let key = blob_key(pool, id);
        Box::pin(async move {
            let mut blobs = self.blobs.write().await;
            blobs.remove(&key);
            Ok(())
        })
    }

    fn append(
        &self,
        pool: &str,
        id: &str,
        _chunk: Bytes,
        _offset: u64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<u64>> + Send + '_>> {
        let key = blob_key(pool, id);
        Box::pin(async move { bail!("Append is not supported by the in-memory blob store ({key})") })
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    async fn read_all(reader: &mut BlobReader) -> Vec<u8> {
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn test_put_then_read_round_trip() {
        let store = MemoryBlobStore::new();
        let (id, written) = store.put("pool0", Bytes::from_static(b"hello blob")).await.unwrap();
        assert_eq!(written, 10);

        let mut reader = store.get_reader("pool0", &id, 0, 0).await.unwrap();
        assert_eq!(read_all(&mut reader).await, b"hello blob");
    }

    #[tokio::test]
    async fn test_ids_are_unique_per_put() {
        let store = MemoryBlobStore::new();
        let (first, _) = store.put("pool0", Bytes::from_static(b"same")).await.unwrap();
        let (second, _) = store.put("pool0", Bytes::from_static(b"same")).await.unwrap();
        assert_ne!(first, second);

        let mut reader = store.get_reader("pool0", &second, 0, 0).await.unwrap();
        assert_eq!(read_all(&mut reader).await, b"same");
    }

    #[tokio::test]
    async fn test_read_window_with_offset_and_length() {
        let store = MemoryBlobStore::new();
        let (id, _) = store.put("pool0", Bytes::from_static(b"0123456789")).await.unwrap();

        let mut reader = store.get_reader("pool0", &id, 2, 3).await.unwrap();
        assert_eq!(read_all(&mut reader).await, b"234");
    }

    #[tokio::test]
    async fn test_zero_length_reads_to_end() {
        let store = MemoryBlobStore::new();
        let (id, _) = store.put("pool0", Bytes::from_static(b"0123456789")).await.unwrap();

        let mut reader = store.get_reader("pool0", &id, 4, 0).await.unwrap();
        assert_eq!(read_all(&mut reader).await, b"456789");
    }

    #[tokio::test]
    async fn test_window_clamped_at_end() {
        let store = MemoryBlobStore::new();
        let (id, _) = store.put("pool0", Bytes::from_static(b"0123456789")).await.unwrap();

        let mut reader = store.get_reader("pool0", &id, 6, 100).await.unwrap();
        assert_eq!(read_all(&mut reader).await, b"6789");
    }

    #[tokio::test]
    async fn test_offset_past_end_errors() {
        let store = MemoryBlobStore::new();
        let (id, _) = store.put("pool0", Bytes::from_static(b"0123456789")).await.unwrap();

        let err = store.get_reader("pool0", &id, 11, 0).await.err().unwrap();
        assert!(err.to_string().contains("past the end"));
    }

    #[tokio::test]
    async fn test_missing_blob_errors() {
        let store = MemoryBlobStore::new();
        let err = store.get_reader("pool0", "no-such-id", 0, 0).await.err().unwrap();
        assert!(err.to_string().contains("Blob not found"));
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let store = MemoryBlobStore::new();
        let (id, _) = store.put("pool0", Bytes::from_static(b"bye")).await.unwrap();

        store.remove("pool0", &id).await.unwrap();
        store.remove("pool0", &id).await.unwrap();
        assert!(store.get_reader("pool0", &id, 0, 0).await.is_err());
    }

    #[tokio::test]
    async fn test_pools_are_isolated() {
        let store = MemoryBlobStore::new();
        let (id, _) = store.put("pool-a", Bytes::from_static(b"data")).await.unwrap();

        assert!(store.get_reader("pool-b", &id, 0, 0).await.is_err());
        let mut reader = store.get_reader("pool-a", &id, 0, 0).await.unwrap();
        assert_eq!(read_all(&mut reader).await, b"data");
    }

    #[tokio::test]
    async fn test_append_is_rejected() {
        let store = MemoryBlobStore::new();
        let (id, _) = store.put("pool0", Bytes::from_static(b"base")).await.unwrap();

        let err = store
            .append("pool0", &id, Bytes::from_static(b"more"), 4)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not supported"));
    }
}
