//! File handles: position-addressed read/write over the shared block cache,
//! with the open → sealed lifecycle.
//!
//! A handle is writable only if it created the object and the object has not
//! been sealed. Multi-block writes are split per block; each block update is
//! atomic (old or new content, never a byte-level interleave), but a
//! concurrent reader may observe a partially applied multi-block write. That
//! per-block boundary is deliberate and covered by tests.

use crate::backend::ObjectBackend;
use crate::cache::BlockCache;
use crate::error::{Result, StoreError};
use crate::layout::split_range_into_blocks;
use crate::meta::{MetadataClient, ObjectDescriptor};
use bytes::{Bytes, BytesMut};
use log::{debug, warn};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

pub struct FileHandle<B: ObjectBackend, M: MetadataClient> {
    cache: BlockCache<B>,
    meta: Arc<M>,
    state: Mutex<ObjectDescriptor>,
    writable: bool,
    closed: AtomicBool,
    readahead_blocks: u32,
    /// End position of the previous read, for sequential-access detection.
    last_read_end: AtomicU64,
    /// Serializes the local size update with its metadata commit so commits
    /// land in update order; otherwise a racing smaller write could land its
    /// commit last and regress the committed size.
    size_commit: tokio::sync::Mutex<()>,
}

impl<B: ObjectBackend, M: MetadataClient> std::fmt::Debug for FileHandle<B, M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileHandle").finish_non_exhaustive()
    }
}

impl<B: ObjectBackend, M: MetadataClient> FileHandle<B, M> {
    pub(crate) fn new(
        cache: BlockCache<B>,
        meta: Arc<M>,
        desc: ObjectDescriptor,
        writable: bool,
        readahead_blocks: u32,
    ) -> Self {
        debug!(
            "opened handle {} (writable: {writable}, sealed: {})",
            desc.identifier(),
            desc.is_sealed()
        );
        Self {
            cache,
            meta,
            state: Mutex::new(desc),
            writable,
            closed: AtomicBool::new(false),
            readahead_blocks,
            last_read_end: AtomicU64::new(0),
            size_commit: tokio::sync::Mutex::new(()),
        }
    }

    pub fn bucket(&self) -> String {
        self.state.lock().unwrap().bucket.clone()
    }

    pub fn key(&self) -> String {
        self.state.lock().unwrap().key.clone()
    }

    pub fn identifier(&self) -> String {
        self.state.lock().unwrap().identifier()
    }

    /// High-water mark of writes while open; fixed once sealed.
    pub fn size(&self) -> u64 {
        self.state.lock().unwrap().size
    }

    pub fn is_writable(&self) -> bool {
        self.writable && !self.state.lock().unwrap().is_sealed()
    }

    pub fn is_sealed(&self) -> bool {
        self.state.lock().unwrap().is_sealed()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Readable regardless of seal state. `None` means absent (distinct from
    /// zero-length metadata).
    pub fn metadata(&self) -> Option<Bytes> {
        self.state.lock().unwrap().metadata.clone()
    }

    fn snapshot(&self) -> ObjectDescriptor {
        self.state.lock().unwrap().clone()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(StoreError::ClosedHandle)
        } else {
            Ok(())
        }
    }

    fn ensure_writable(&self) -> Result<()> {
        if !self.writable {
            return Err(StoreError::NotWritable);
        }
        if self.state.lock().unwrap().is_sealed() {
            return Err(StoreError::AlreadySealed);
        }
        Ok(())
    }

    /// Read up to `length` bytes at `position`. Returns fewer bytes than
    /// requested when the range extends past end of object; never fails for
    /// reads past the end.
    pub async fn read(&self, position: u64, length: usize) -> Result<Bytes> {
        self.ensure_open()?;
        let desc = self.refresh_if_stale().await;

        if length == 0 || position >= desc.size {
            return Ok(Bytes::new());
        }
        let actual = (desc.size - position).min(length as u64) as usize;
        let layout = self.cache.layout();
        let spans = split_range_into_blocks(layout, position, actual);

        let mut out = BytesMut::with_capacity(actual);
        for span in &spans {
            let guard = self
                .cache
                .get(desc.id, span.block_index, &desc.location, desc.generation)
                .await?;
            out.extend_from_slice(&guard.read_range(span.offset_in_block as usize, span.len));
        }

        let end = position + actual as u64;
        let sequential = self.last_read_end.swap(end, Ordering::SeqCst) == position;
        if sequential && self.readahead_blocks > 0 {
            let next = spans.last().unwrap().block_index + 1;
            self.cache.prefetch(
                desc.id,
                &desc.location,
                desc.generation,
                next,
                self.readahead_blocks,
                layout.block_count(desc.size),
            );
        }
        Ok(out.freeze())
    }

    /// Write `data` at `position`, extending the object as needed. Sparse
    /// gaps read back as zeroes.
    pub async fn write(&self, position: u64, data: &[u8]) -> Result<usize> {
        self.ensure_open()?;
        self.ensure_writable()?;
        if data.is_empty() {
            return Ok(0);
        }
        let desc = self.snapshot();
        let spans = split_range_into_blocks(self.cache.layout(), position, data.len());
        let mut cursor = 0usize;
        for span in spans {
            let guard = self
                .cache
                .get(desc.id, span.block_index, &desc.location, desc.generation)
                .await?;
            guard.write_range(span.offset_in_block as usize, &data[cursor..cursor + span.len]);
            cursor += span.len;
        }

        let end = position + data.len() as u64;
        let _ordered = self.size_commit.lock().await;
        let new_size = {
            let mut state = self.state.lock().unwrap();
            if end > state.size {
                state.size = end;
            }
            state.size
        };
        self.meta.commit_size(desc.id, new_size).await?;
        Ok(data.len())
    }

    /// Shrink or grow the object. Shrinking drops cached and remote blocks
    /// beyond the target, zeroes the tail of the boundary block and flushes
    /// the new tail state; growing is a logical zero-fill.
    pub async fn truncate(&self, target: u64) -> Result<()> {
        self.ensure_open()?;
        self.ensure_writable()?;
        let _ordered = self.size_commit.lock().await;
        let desc = self.snapshot();

        if target < desc.size {
            let layout = self.cache.layout();
            let boundary = layout.block_index_of(target);
            let offset = layout.offset_in_block(target);
            let drop_from = if offset == 0 { boundary } else { boundary + 1 };

            self.cache.drop_blocks_from(desc.id, drop_from);
            self.cache
                .backend()
                .remove_blocks_from(&desc.location, drop_from)
                .await?;
            if offset != 0 {
                // Zero the truncated tail so a later size extension reads
                // zeroes instead of the old content.
                let guard = self
                    .cache
                    .get(desc.id, boundary, &desc.location, desc.generation)
                    .await?;
                guard.zero_from(offset as usize);
            }
            self.state.lock().unwrap().size = target;
            self.meta.commit_size(desc.id, target).await?;
            self.cache.flush_object(desc.id).await?;
        } else if target > desc.size {
            self.state.lock().unwrap().size = target;
            self.meta.commit_size(desc.id, target).await?;
        }
        Ok(())
    }

    /// Record metadata bytes; only valid while the object is open. With
    /// `seal_on_set` the metadata is recorded and the object sealed in a
    /// single metadata round trip.
    pub async fn set_metadata(&self, metadata: Option<Bytes>, seal_on_set: bool) -> Result<()> {
        self.ensure_open()?;
        let desc = self.snapshot();
        if desc.is_sealed() {
            return Err(StoreError::AlreadySealed);
        }
        if seal_on_set {
            if !self.writable {
                return Err(StoreError::NotWritable);
            }
            return self.seal_inner(metadata).await;
        }
        self.meta.set_metadata(desc.id, metadata.clone()).await?;
        self.state.lock().unwrap().metadata = metadata;
        Ok(())
    }

    /// Flush all dirty blocks then atomically mark the object sealed. After
    /// sealing, reads are served from cache indefinitely; no handle can
    /// mutate the object again.
    pub async fn seal(&self) -> Result<()> {
        self.ensure_open()?;
        let desc = self.snapshot();
        if desc.is_sealed() {
            return Err(StoreError::AlreadySealed);
        }
        if !self.writable {
            return Err(StoreError::NotWritable);
        }
        let metadata = desc.metadata.clone();
        self.seal_inner(metadata).await
    }

    /// Flush this object's dirty blocks without sealing.
    pub async fn flush(&self) -> Result<()> {
        self.ensure_open()?;
        let desc = self.snapshot();
        self.cache.flush_object(desc.id).await
    }

    /// Idempotent. Dirty state of a writable handle is flushed best-effort;
    /// cached content stays resident for other handles and future opens.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let desc = self.snapshot();
        if self.writable && !desc.is_sealed() {
            if let Err(e) = self.cache.flush_object(desc.id).await {
                warn!("flush on close of {} failed: {e}", desc.identifier());
            }
        }
        debug!("closed handle {}", desc.identifier());
    }

    async fn seal_inner(&self, metadata: Option<Bytes>) -> Result<()> {
        let desc = self.snapshot();
        self.cache.flush_object(desc.id).await?;
        let size = self.state.lock().unwrap().size;
        let sealed = self.meta.commit_seal(desc.id, size, metadata).await?;
        // The flush made the remote copy identical to the cached blocks, so
        // they remain valid under the advanced generation.
        self.cache.restamp_object(desc.id, sealed.generation);
        *self.state.lock().unwrap() = sealed;
        Ok(())
    }

    /// For read-only handles of a still-open object: pick up size changes
    /// and observe a seal performed by the writer, invalidating cache
    /// entries fetched under an older generation.
    async fn refresh_if_stale(&self) -> ObjectDescriptor {
        let desc = self.snapshot();
        if self.writable || desc.is_sealed() {
            return desc;
        }
        match self.meta.refresh(desc.id).await {
            Ok(fresh) => {
                if fresh.is_sealed() && fresh.generation != desc.generation {
                    self.cache.invalidate_stale(desc.id, fresh.generation);
                }
                *self.state.lock().unwrap() = fresh.clone();
                fresh
            }
            Err(e) => {
                // Deleted or unreachable; serve the last known state.
                debug!("descriptor refresh for {} failed: {e}", desc.identifier());
                desc
            }
        }
    }
}

impl<B: ObjectBackend, M: MetadataClient> Drop for FileHandle<B, M> {
    fn drop(&mut self) {
        if !self.is_closed() {
            debug!(
                "handle {} dropped without close",
                self.state.lock().unwrap().identifier()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemBackend;
    use crate::layout::BlockLayout;
    use crate::meta::InMemoryMetaClient;

    const BS: u32 = 16;

    async fn writable_handle(
        key: &str,
    ) -> FileHandle<MemBackend, InMemoryMetaClient> {
        let meta = Arc::new(InMemoryMetaClient::new());
        meta.create_bucket("data").await.unwrap();
        let desc = meta.create_descriptor("data", key).await.unwrap();
        let cache = BlockCache::new(BlockLayout::new(BS), 64, Arc::new(MemBackend::new()));
        FileHandle::new(cache, meta, desc, true, 2)
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn test_round_trip_across_blocks() {
        let handle = writable_handle("rt").await;
        let data = pattern(BS as usize * 3 + 5);
        handle.write(7, &data).await.unwrap();
        assert_eq!(handle.size(), 7 + data.len() as u64);

        let out = handle.read(7, data.len()).await.unwrap();
        assert_eq!(out.as_ref(), &data[..]);
    }

    #[tokio::test]
    async fn test_sparse_write_zero_fills_gap() {
        let handle = writable_handle("sparse").await;
        handle.write(100, b"tail").await.unwrap();
        assert_eq!(handle.size(), 104);

        let gap = handle.read(0, 100).await.unwrap();
        assert_eq!(gap.len(), 100);
        assert!(gap.iter().all(|&b| b == 0));
        assert_eq!(handle.read(100, 4).await.unwrap().as_ref(), b"tail");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writes_keep_committed_size_monotonic() {
        let meta = Arc::new(InMemoryMetaClient::new());
        meta.create_bucket("data").await.unwrap();
        let desc = meta.create_descriptor("data", "sizes").await.unwrap();
        let id = desc.id;
        let cache = BlockCache::new(BlockLayout::new(BS), 64, Arc::new(MemBackend::new()));
        let handle = Arc::new(FileHandle::new(cache, Arc::clone(&meta), desc, true, 0));

        let mut tasks = Vec::new();
        for len in [300usize, 40, 220, 90, 160, 10, 280, 70] {
            let handle = Arc::clone(&handle);
            tasks.push(tokio::spawn(async move {
                handle.write(0, &vec![7u8; len]).await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        // However the commits interleave, the committed size never regresses
        // below the largest completed write.
        assert_eq!(handle.size(), 300);
        assert_eq!(meta.refresh(id).await.unwrap().size, 300);
    }

    #[tokio::test]
    async fn test_read_past_end_is_short_not_error() {
        let handle = writable_handle("short").await;
        handle.write(0, &[1u8; 10]).await.unwrap();
        assert_eq!(handle.read(4, 100).await.unwrap().len(), 6);
        assert!(handle.read(10, 5).await.unwrap().is_empty());
        assert!(handle.read(9999, 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_truncate_shrink_and_regrow_reads_zeroes() {
        let handle = writable_handle("trunc").await;
        let data = pattern(1000);
        handle.write(0, &data).await.unwrap();

        handle.truncate(10).await.unwrap();
        assert_eq!(handle.size(), 10);
        assert_eq!(handle.read(0, 10).await.unwrap().as_ref(), &data[..10]);
        assert!(handle.read(10, 990).await.unwrap().is_empty());

        // The truncated region must read back as zeroes once size regrows.
        handle.write(500, b"x").await.unwrap();
        let gap = handle.read(10, 490).await.unwrap();
        assert!(gap.iter().all(|&b| b == 0));
        assert_eq!(handle.read(0, 10).await.unwrap().as_ref(), &data[..10]);
    }

    #[tokio::test]
    async fn test_truncate_grow_zero_fills() {
        let handle = writable_handle("grow").await;
        handle.write(0, &[3u8; 8]).await.unwrap();
        handle.truncate(40).await.unwrap();
        assert_eq!(handle.size(), 40);
        let out = handle.read(8, 32).await.unwrap();
        assert_eq!(out.len(), 32);
        assert!(out.iter().all(|&b| b == 0));
    }

    #[tokio::test]
    async fn test_seal_makes_object_immutable() {
        let handle = writable_handle("sealme").await;
        handle.write(0, b"payload").await.unwrap();
        handle.seal().await.unwrap();
        assert!(handle.is_sealed());

        assert!(matches!(
            handle.write(0, b"no").await.unwrap_err(),
            StoreError::AlreadySealed
        ));
        assert!(matches!(
            handle.truncate(1).await.unwrap_err(),
            StoreError::AlreadySealed
        ));
        assert!(matches!(
            handle.set_metadata(None, false).await.unwrap_err(),
            StoreError::AlreadySealed
        ));
        assert!(matches!(
            handle.seal().await.unwrap_err(),
            StoreError::AlreadySealed
        ));
        assert_eq!(handle.read(0, 7).await.unwrap().as_ref(), b"payload");
    }

    #[tokio::test]
    async fn test_read_only_handle_cannot_mutate() {
        let meta = Arc::new(InMemoryMetaClient::new());
        meta.create_bucket("data").await.unwrap();
        let desc = meta.create_descriptor("data", "ro").await.unwrap();
        let cache = BlockCache::new(BlockLayout::new(BS), 64, Arc::new(MemBackend::new()));
        let handle = FileHandle::new(cache, meta, desc, false, 0);

        assert!(matches!(
            handle.write(0, b"no").await.unwrap_err(),
            StoreError::NotWritable
        ));
        assert!(matches!(
            handle.truncate(0).await.unwrap_err(),
            StoreError::NotWritable
        ));
        assert!(matches!(
            handle.seal().await.unwrap_err(),
            StoreError::NotWritable
        ));
    }

    #[tokio::test]
    async fn test_metadata_absent_vs_empty() {
        let handle = writable_handle("meta").await;
        assert_eq!(handle.metadata(), None);

        handle
            .set_metadata(Some(Bytes::new()), false)
            .await
            .unwrap();
        assert_eq!(handle.metadata(), Some(Bytes::new()));

        handle.set_metadata(None, false).await.unwrap();
        assert_eq!(handle.metadata(), None);
    }

    #[tokio::test]
    async fn test_set_metadata_seal_on_set() {
        let handle = writable_handle("sealset").await;
        handle.write(0, b"abc").await.unwrap();
        handle
            .set_metadata(Some(Bytes::from_static(b"tag")), true)
            .await
            .unwrap();
        assert!(handle.is_sealed());
        assert_eq!(handle.metadata(), Some(Bytes::from_static(b"tag")));
        assert_eq!(handle.read(0, 3).await.unwrap().as_ref(), b"abc");
    }

    #[tokio::test]
    async fn test_double_close_and_closed_errors() {
        let handle = writable_handle("close").await;
        handle.write(0, b"z").await.unwrap();
        handle.close().await;
        handle.close().await;
        assert!(handle.is_closed());

        assert!(matches!(
            handle.read(0, 1).await.unwrap_err(),
            StoreError::ClosedHandle
        ));
        assert!(matches!(
            handle.write(0, b"a").await.unwrap_err(),
            StoreError::ClosedHandle
        ));
        assert!(matches!(
            handle.seal().await.unwrap_err(),
            StoreError::ClosedHandle
        ));
    }
}
