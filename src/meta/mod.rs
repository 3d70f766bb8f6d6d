//! Metadata service client: object descriptors and namespace operations.
//!
//! The metadata service is an external collaborator; this module defines the
//! contract the core consumes plus an in-memory implementation used by tests
//! and single-process deployments.

pub mod memory;
pub mod name;

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;

pub use memory::InMemoryMetaClient;

/// Stable object identity assigned by the metadata service. Survives renames.
pub type ObjectId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SealState {
    Open,
    Sealed,
}

/// Authoritative object state as tracked by the metadata service.
///
/// `generation` is a monotonically increasing version; it advances when the
/// object is sealed. Cached blocks are stamped with the generation they were
/// fetched under and become stale when the descriptor's generation moves on.
#[derive(Debug, Clone)]
pub struct ObjectDescriptor {
    pub id: ObjectId,
    pub bucket: String,
    pub key: String,
    pub size: u64,
    pub seal_state: SealState,
    pub generation: u64,
    pub metadata: Option<Bytes>,
    /// Backend location handle. Derived from `id`, not from the key, so that
    /// renames do not move stored blocks.
    pub location: String,
}

impl ObjectDescriptor {
    pub fn identifier(&self) -> String {
        format!("{}/{}", self.bucket, self.key)
    }

    pub fn is_sealed(&self) -> bool {
        self.seal_state == SealState::Sealed
    }
}

/// Listing/status entry exposed to applications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectStatus {
    pub bucket: String,
    pub key: String,
    pub size: u64,
    pub sealed: bool,
}

/// Contract consumed by the session and file-handle layers.
///
/// Errors follow the shared taxonomy: `NotFound` for unresolved bucket/key,
/// `AlreadyExists` on create collisions, `Conflict` when a seal races a
/// delete/rename, `AlreadySealed` for mutation of sealed descriptors.
#[async_trait]
pub trait MetadataClient: Send + Sync + 'static {
    async fn create_bucket(&self, bucket: &str) -> Result<()>;
    async fn lookup_bucket(&self, bucket: &str) -> Result<()>;

    async fn resolve(&self, bucket: &str, key: &str) -> Result<ObjectDescriptor>;
    async fn create_descriptor(&self, bucket: &str, key: &str) -> Result<ObjectDescriptor>;

    /// Re-fetch the descriptor for generation/seal-state checks.
    async fn refresh(&self, id: ObjectId) -> Result<ObjectDescriptor>;

    /// Record the current size high-water mark of a still-open object.
    async fn commit_size(&self, id: ObjectId, size: u64) -> Result<()>;

    /// Record metadata bytes. Only valid while the object is open.
    /// `None` clears the metadata (absent, as opposed to zero-length).
    async fn set_metadata(&self, id: ObjectId, metadata: Option<Bytes>) -> Result<()>;

    /// Atomically transition the object to sealed, recording its final size
    /// and metadata. Returns the sealed descriptor with advanced generation.
    async fn commit_seal(
        &self,
        id: ObjectId,
        size: u64,
        metadata: Option<Bytes>,
    ) -> Result<ObjectDescriptor>;

    async fn delete(&self, bucket: &str, key: &str) -> Result<ObjectDescriptor>;
    async fn delete_prefix(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectDescriptor>>;
    async fn rename(&self, bucket: &str, src_key: &str, dst_key: &str) -> Result<()>;

    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectStatus>>;
    async fn status(&self, bucket: &str, key: &str) -> Result<ObjectStatus>;
}
