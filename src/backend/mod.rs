//! Object backend adapters: durable block storage behind the cache.
//!
//! Submodules:
//! - `memory`: in-memory backend for tests and local development
//! - `localfs`: one file per block under a local directory
//! - `s3`: S3-compatible backend via aws-sdk-s3
//!
//! The backend is only touched on cache miss, flush and eviction; the cache
//! addresses it with `(location, block_index)` pairs where `location` is the
//! descriptor's backend location handle.

pub mod localfs;
pub mod memory;
pub mod s3;

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;

pub use localfs::LocalFsBackend;
pub use memory::MemBackend;
pub use s3::S3Backend;

#[async_trait]
pub trait ObjectBackend: Send + Sync + 'static {
    /// Fetch one block. `Ok(None)` means the block has no remote copy yet
    /// (unsealed object, or a hole); callers materialize it as zeroes.
    /// A short block (the object's tail) is returned as-is.
    async fn fetch_block(
        &self,
        location: &str,
        block_index: u64,
        block_size: u32,
    ) -> Result<Option<Bytes>>;

    /// Write blocks in the given (ascending-index) order.
    ///
    /// Returns the number of acknowledged blocks. A return value smaller than
    /// `blocks.len()` is a partial failure: the acknowledged prefix is
    /// durable and a retry only needs to resume from the first
    /// unacknowledged block. An `Err` means nothing further was acknowledged.
    async fn write_blocks(&self, location: &str, blocks: &[(u64, Bytes)]) -> Result<usize>;

    /// Drop all blocks with `index >= from_index` (truncate support).
    async fn remove_blocks_from(&self, location: &str, from_index: u64) -> Result<()>;

    /// Drop every block of the object.
    async fn delete_object(&self, location: &str) -> Result<()>;
}
