//! Session: process-wide entry point owning the block cache, the metadata
//! client connection and the registry of open file handles.

use crate::backend::{LocalFsBackend, MemBackend, ObjectBackend};
use crate::cache::BlockCache;
use crate::error::Result;
use crate::file::FileHandle;
use crate::layout::{BlockLayout, DEFAULT_BLOCK_SIZE};
use crate::meta::{name, InMemoryMetaClient, MetadataClient, ObjectStatus};
use log::{debug, info};
use std::path::Path;
use std::sync::{Arc, Mutex, Weak};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub block_size: u32,
    pub cache_capacity_blocks: usize,
    /// Blocks fetched ahead of a sequential reader; 0 disables readahead.
    pub readahead_blocks: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            cache_capacity_blocks: 64,
            readahead_blocks: 4,
        }
    }
}

pub struct Session<B: ObjectBackend, M: MetadataClient> {
    cache: BlockCache<B>,
    meta: Arc<M>,
    backend: Arc<B>,
    readahead_blocks: u32,
    handles: Mutex<Vec<Weak<FileHandle<B, M>>>>,
}

impl<B: ObjectBackend, M: MetadataClient> Session<B, M> {
    pub fn new(config: SessionConfig, backend: B, meta: M) -> Self {
        Self::with_shared(config, Arc::new(backend), Arc::new(meta))
    }

    /// Build a session over shared collaborators. Lets several sessions (or
    /// processes in tests) target the same backend and metadata service.
    pub fn with_shared(config: SessionConfig, backend: Arc<B>, meta: Arc<M>) -> Self {
        let layout = BlockLayout::new(config.block_size);
        let cache = BlockCache::new(layout, config.cache_capacity_blocks, Arc::clone(&backend));
        Self {
            cache,
            meta,
            backend,
            readahead_blocks: config.readahead_blocks,
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn cache(&self) -> &BlockCache<B> {
        &self.cache
    }

    pub async fn create_bucket(&self, bucket: &str) -> Result<()> {
        name::validate_bucket_name(bucket)?;
        self.meta.create_bucket(bucket).await
    }

    /// Create a new object and return a writable handle to it. Fails with
    /// `AlreadyExists` if the key is taken.
    pub async fn create(&self, bucket: &str, key: &str) -> Result<Arc<FileHandle<B, M>>> {
        name::validate(bucket, key)?;
        let desc = self.meta.create_descriptor(bucket, key).await?;
        debug!("created {}", desc.identifier());
        Ok(self.register(FileHandle::new(
            self.cache.clone(),
            Arc::clone(&self.meta),
            desc,
            true,
            self.readahead_blocks,
        )))
    }

    /// Open an existing object read-only. Fails with `NotFound`.
    pub async fn open(&self, bucket: &str, key: &str) -> Result<Arc<FileHandle<B, M>>> {
        name::validate(bucket, key)?;
        let desc = self.meta.resolve(bucket, key).await?;
        Ok(self.register(FileHandle::new(
            self.cache.clone(),
            Arc::clone(&self.meta),
            desc,
            false,
            self.readahead_blocks,
        )))
    }

    pub async fn status(&self, bucket: &str, key: &str) -> Result<ObjectStatus> {
        self.meta.status(bucket, key).await
    }

    pub async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectStatus>> {
        self.meta.list(bucket, prefix).await
    }

    /// Delete the object and drop its cached and remote blocks.
    pub async fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        let desc = self.meta.delete(bucket, key).await?;
        self.cache.remove_object(desc.id);
        self.backend.delete_object(&desc.location).await?;
        Ok(())
    }

    pub async fn delete_prefix(&self, bucket: &str, prefix: &str) -> Result<()> {
        let deleted = self.meta.delete_prefix(bucket, prefix).await?;
        for desc in deleted {
            self.cache.remove_object(desc.id);
            self.backend.delete_object(&desc.location).await?;
        }
        Ok(())
    }

    /// Rename within a bucket. Block storage is addressed by the stable
    /// object id, so no data moves.
    pub async fn rename(&self, bucket: &str, src_key: &str, dst_key: &str) -> Result<()> {
        name::validate(bucket, dst_key)?;
        self.meta.rename(bucket, src_key, dst_key).await
    }

    /// Copy an object by streaming its content block-wise into a fresh
    /// object, carrying metadata over and sealing the copy.
    pub async fn copy(&self, bucket: &str, src_key: &str, dst_key: &str) -> Result<()> {
        let src = self.open(bucket, src_key).await?;
        let result = self.copy_into(&src, bucket, dst_key).await;
        src.close().await;
        result
    }

    /// Flush and close every handle still registered, best-effort.
    pub async fn shutdown(&self) {
        let handles: Vec<Arc<FileHandle<B, M>>> = {
            let mut registry = self.handles.lock().unwrap();
            let alive = registry.drain(..).filter_map(|w| w.upgrade()).collect();
            alive
        };
        info!("session shutdown: closing {} open handles", handles.len());
        futures::future::join_all(
            handles
                .iter()
                .filter(|h| !h.is_closed())
                .map(|h| h.close()),
        )
        .await;
    }

    fn register(&self, handle: FileHandle<B, M>) -> Arc<FileHandle<B, M>> {
        let handle = Arc::new(handle);
        let mut registry = self.handles.lock().unwrap();
        registry.retain(|w| w.strong_count() > 0);
        registry.push(Arc::downgrade(&handle));
        handle
    }

    async fn copy_into(
        &self,
        src: &Arc<FileHandle<B, M>>,
        bucket: &str,
        dst_key: &str,
    ) -> Result<()> {
        let dst = self.create(bucket, dst_key).await?;
        let step = self.cache.layout().block_size as usize;
        let result = async {
            let size = src.size();
            let mut position = 0u64;
            while position < size {
                let chunk = src.read(position, step).await?;
                if chunk.is_empty() {
                    break;
                }
                dst.write(position, &chunk).await?;
                position += chunk.len() as u64;
            }
            dst.set_metadata(src.metadata(), true).await
        }
        .await;
        dst.close().await;
        result
    }
}

pub type MemSession = Session<MemBackend, InMemoryMetaClient>;

impl MemSession {
    /// Fully in-memory session for tests and experiments.
    pub fn new_in_memory(config: SessionConfig) -> Self {
        Session::new(config, MemBackend::new(), InMemoryMetaClient::new())
    }
}

pub type LocalSession = Session<LocalFsBackend, InMemoryMetaClient>;

impl LocalSession {
    /// Local-directory backend with in-memory metadata.
    pub fn new_local<P: AsRef<Path>>(root: P, config: SessionConfig) -> Self {
        Session::new(config, LocalFsBackend::new(root), InMemoryMetaClient::new())
    }
}
