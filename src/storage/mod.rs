//! Blob store capability.
//!
//! The metadata engine never touches object bytes itself; the
//! surrounding code moves them through [`BlobStore`].  The trait works
//! in terms of opaque blob ids and byte streams so callers do not need
//! to know the underlying medium.  An in-memory implementation ships
//! for tests and ephemeral deployments.

pub mod memory;

use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use tokio::io::AsyncRead;

pub use memory::MemoryBlobStore;

/// Boxed byte stream handed out by [`BlobStore::get_reader`].
pub type BlobReader = Pin<Box<dyn AsyncRead + Send + Unpin>>;

/// Async blob storage contract.
pub trait BlobStore: Send + Sync + 'static {
    /// Store `data` in `pool` under a fresh blob id, returning the id
    /// and the number of bytes written.
    fn put(
        &self,
        pool: &str,
        data: Bytes,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<(String, u64)>> + Send + '_>>;

    /// Open a reader over `[offset, offset + length)` of a stored
    /// blob.  `length == 0` reads to the end; a window reaching past
    /// the end is clamped.
    fn get_reader(
        &self,
        pool: &str,
        id: &str,
        offset: u64,
        length: u64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<BlobReader>> + Send + '_>>;

    /// Delete a stored blob.  Removing an absent blob is not an error,
    /// so the garbage-collection sweeper can retry freely.
    fn remove(
        &self,
        pool: &str,
        id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// Extend a stored blob with `chunk` at `offset`, returning the
    /// blob's new size.
    fn append(
        &self,
        pool: &str,
        id: &str,
        chunk: Bytes,
        offset: u64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<u64>> + Send + '_>>;
}
