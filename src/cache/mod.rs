//! Process-wide block cache: read-through, write-back, prefetch.
//!
//! Blocks are keyed by `(object id, block index)` and sized by the shared
//! [`BlockLayout`]. Every access pins the block for the duration of the call;
//! eviction selects least-recently-used unpinned blocks and flushes dirty
//! victims before removal. Concurrent misses on the same block are coalesced
//! into a single backend fetch that runs in its own task, so a caller
//! abandoning its await does not abort the fetch for the others.

use crate::backend::ObjectBackend;
use crate::error::{Result, StoreError};
use crate::layout::BlockLayout;
use crate::meta::ObjectId;
use bytes::Bytes;
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::watch;

pub type BlockKey = (ObjectId, u64);

/// Fetch completion signal shared by coalesced waiters. `None` while the
/// fetch is in flight; the error is carried as a string so every waiter can
/// observe it.
type FetchState = Option<std::result::Result<(), String>>;

struct Block {
    location: String,
    /// Exactly `block_size` bytes. The lock makes writes block-atomic: a
    /// concurrent reader sees either the old or the new block content.
    data: RwLock<Vec<u8>>,
    dirty: AtomicBool,
    pins: AtomicUsize,
    tick: AtomicU64,
    /// Descriptor generation the block was fetched under.
    generation: AtomicU64,
    /// Bumped on every write; lets a flush detect writes that raced it so it
    /// never clears the dirty flag over unflushed data.
    write_seq: AtomicU64,
}

enum Slot {
    Ready(Arc<Block>),
    Pending(watch::Receiver<FetchState>),
}

struct Shared<B: ObjectBackend> {
    layout: BlockLayout,
    capacity: usize,
    backend: Arc<B>,
    slots: Mutex<HashMap<BlockKey, Slot>>,
    tick: AtomicU64,
}

/// A pinned reference to a resident block. The pin is released on drop;
/// callers must not hold guards across unrelated await points longer than
/// the read/write they serve.
pub struct BlockGuard {
    block: Arc<Block>,
}

impl BlockGuard {
    pub fn read_range(&self, offset: usize, len: usize) -> Bytes {
        let data = self.block.data.read().unwrap();
        Bytes::copy_from_slice(&data[offset..offset + len])
    }

    pub fn write_range(&self, offset: usize, bytes: &[u8]) {
        let mut data = self.block.data.write().unwrap();
        data[offset..offset + bytes.len()].copy_from_slice(bytes);
        self.block.write_seq.fetch_add(1, Ordering::SeqCst);
        self.block.dirty.store(true, Ordering::SeqCst);
    }

    /// Zero the block from `offset` to its end (truncate tail handling).
    pub fn zero_from(&self, offset: usize) {
        let mut data = self.block.data.write().unwrap();
        data[offset..].fill(0);
        self.block.write_seq.fetch_add(1, Ordering::SeqCst);
        self.block.dirty.store(true, Ordering::SeqCst);
    }

    /// Idempotent.
    pub fn mark_dirty(&self) {
        self.block.dirty.store(true, Ordering::SeqCst);
    }

    pub fn is_dirty(&self) -> bool {
        self.block.dirty.load(Ordering::SeqCst)
    }
}

impl Drop for BlockGuard {
    fn drop(&mut self) {
        self.block.pins.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct BlockCache<B: ObjectBackend> {
    shared: Arc<Shared<B>>,
}

impl<B: ObjectBackend> Clone for BlockCache<B> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

enum Lookup {
    Hit(BlockGuard),
    Wait(watch::Receiver<FetchState>),
    Retry,
}

impl<B: ObjectBackend> BlockCache<B> {
    pub fn new(layout: BlockLayout, capacity_blocks: usize, backend: Arc<B>) -> Self {
        assert!(capacity_blocks > 0, "cache capacity must be non-zero");
        Self {
            shared: Arc::new(Shared {
                layout,
                capacity: capacity_blocks,
                backend,
                slots: Mutex::new(HashMap::new()),
                tick: AtomicU64::new(0),
            }),
        }
    }

    pub fn layout(&self) -> BlockLayout {
        self.shared.layout
    }

    pub fn capacity_blocks(&self) -> usize {
        self.shared.capacity
    }

    pub fn resident_blocks(&self) -> usize {
        let slots = self.shared.slots.lock().unwrap();
        slots
            .values()
            .filter(|s| matches!(s, Slot::Ready(_)))
            .count()
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.shared.backend
    }

    /// Pin the block, fetching it from the backend on miss. Blocks with no
    /// remote copy materialize zero-filled. A resident clean block stamped
    /// with a different generation is refetched.
    pub async fn get(
        &self,
        id: ObjectId,
        block_index: u64,
        location: &str,
        generation: u64,
    ) -> Result<BlockGuard> {
        let key = (id, block_index);
        loop {
            let mut start: Option<watch::Sender<FetchState>> = None;
            let lookup = {
                let mut slots = self.shared.slots.lock().unwrap();
                match slots.get(&key) {
                    Some(Slot::Ready(block)) => {
                        let stale = !block.dirty.load(Ordering::SeqCst)
                            && block.generation.load(Ordering::SeqCst) != generation;
                        if stale && block.pins.load(Ordering::SeqCst) == 0 {
                            slots.remove(&key);
                            Lookup::Retry
                        } else {
                            block.pins.fetch_add(1, Ordering::SeqCst);
                            block
                                .tick
                                .store(self.shared.next_tick(), Ordering::SeqCst);
                            Lookup::Hit(BlockGuard {
                                block: Arc::clone(block),
                            })
                        }
                    }
                    Some(Slot::Pending(rx)) => Lookup::Wait(rx.clone()),
                    None => {
                        let (tx, rx) = watch::channel(None);
                        slots.insert(key, Slot::Pending(rx.clone()));
                        start = Some(tx);
                        Lookup::Wait(rx)
                    }
                }
            };
            if let Some(tx) = start {
                self.spawn_fetch(key, location.to_string(), generation, tx);
            }
            match lookup {
                Lookup::Hit(guard) => return Ok(guard),
                Lookup::Retry => continue,
                Lookup::Wait(mut rx) => loop {
                    let state = rx.borrow_and_update().clone();
                    match state {
                        Some(Ok(())) => break,
                        Some(Err(msg)) => return Err(StoreError::BackendUnavailable(msg)),
                        None => {
                            if rx.changed().await.is_err() {
                                // Fetch task died without reporting; retry.
                                break;
                            }
                        }
                    }
                },
            }
        }
    }

    /// Flush all dirty blocks of an object in ascending block-index order.
    ///
    /// The acknowledged prefix is marked clean even on partial failure, so a
    /// retry resumes from the first unacknowledged block.
    pub async fn flush_object(&self, id: ObjectId) -> Result<()> {
        let mut dirty: Vec<(BlockKey, Arc<Block>)> = {
            let slots = self.shared.slots.lock().unwrap();
            slots
                .iter()
                .filter_map(|(key, slot)| match slot {
                    Slot::Ready(block)
                        if key.0 == id && block.dirty.load(Ordering::SeqCst) =>
                    {
                        Some((*key, Arc::clone(block)))
                    }
                    _ => None,
                })
                .collect()
        };
        if dirty.is_empty() {
            return Ok(());
        }
        dirty.sort_by_key(|(key, _)| key.1);

        let location = dirty[0].1.location.clone();
        let mut batch = Vec::with_capacity(dirty.len());
        let mut seqs = Vec::with_capacity(dirty.len());
        for (key, block) in &dirty {
            let data = block.data.read().unwrap();
            batch.push((key.1, Bytes::copy_from_slice(&data)));
            seqs.push(block.write_seq.load(Ordering::SeqCst));
        }

        let acked = self.shared.backend.write_blocks(&location, &batch).await?;
        for (i, (_, block)) in dirty.iter().enumerate().take(acked) {
            // The data write lock excludes racing writers while we compare
            // the write sequence against our snapshot.
            let _guard = block.data.write().unwrap();
            if block.write_seq.load(Ordering::SeqCst) == seqs[i] {
                block.dirty.store(false, Ordering::SeqCst);
            }
        }
        if acked < batch.len() {
            return Err(StoreError::BackendUnavailable(format!(
                "flush of {location} stalled after {acked} of {} blocks",
                batch.len()
            )));
        }
        Ok(())
    }

    /// Evict up to `count` least-recently-used unpinned blocks, flushing
    /// dirty victims first.
    pub async fn evict(&self, count: usize) {
        for _ in 0..count {
            if !self.evict_one().await {
                break;
            }
        }
    }

    /// Best-effort asynchronous readahead; all failures are discarded.
    /// `block_limit` is one past the last valid block of the object.
    pub fn prefetch(
        &self,
        id: ObjectId,
        location: &str,
        generation: u64,
        from_block: u64,
        count: u32,
        block_limit: u64,
    ) {
        let end = (from_block + count as u64).min(block_limit);
        for block_index in from_block..end {
            if self.is_resident((id, block_index)) {
                continue;
            }
            let cache = self.clone();
            let location = location.to_string();
            tokio::spawn(async move {
                if let Err(e) = cache.get(id, block_index, &location, generation).await {
                    debug!("prefetch of block {block_index} for object {id} dropped: {e}");
                }
            });
        }
    }

    /// Drop resident clean blocks whose generation stamp no longer matches
    /// the descriptor (seal observed by a reader).
    pub fn invalidate_stale(&self, id: ObjectId, generation: u64) {
        let mut slots = self.shared.slots.lock().unwrap();
        slots.retain(|key, slot| match slot {
            Slot::Ready(block) if key.0 == id => {
                block.dirty.load(Ordering::SeqCst)
                    || block.pins.load(Ordering::SeqCst) > 0
                    || block.generation.load(Ordering::SeqCst) == generation
            }
            _ => true,
        });
    }

    /// Restamp an object's resident blocks with a new generation. Used after
    /// a seal: the flush already made the remote copy identical, so the
    /// resident blocks stay valid under the advanced generation.
    pub fn restamp_object(&self, id: ObjectId, generation: u64) {
        let slots = self.shared.slots.lock().unwrap();
        for (key, slot) in slots.iter() {
            if key.0 == id {
                if let Slot::Ready(block) = slot {
                    block.generation.store(generation, Ordering::SeqCst);
                }
            }
        }
    }

    /// Drop every resident block of an object (delete path). In-flight
    /// readers keep their pinned references; the data is simply no longer
    /// reachable from the cache.
    pub fn remove_object(&self, id: ObjectId) {
        let mut slots = self.shared.slots.lock().unwrap();
        slots.retain(|key, _| key.0 != id);
    }

    /// Drop resident blocks at or beyond `from_index` (truncate shrink).
    /// Dirty content beyond the new size is logically gone, so dirtiness
    /// does not protect these blocks.
    pub fn drop_blocks_from(&self, id: ObjectId, from_index: u64) {
        let mut slots = self.shared.slots.lock().unwrap();
        slots.retain(|key, _| key.0 != id || key.1 < from_index);
    }

    fn is_resident(&self, key: BlockKey) -> bool {
        let slots = self.shared.slots.lock().unwrap();
        matches!(slots.get(&key), Some(Slot::Ready(_)))
    }

    fn spawn_fetch(
        &self,
        key: BlockKey,
        location: String,
        generation: u64,
        tx: watch::Sender<FetchState>,
    ) {
        let shared = Arc::clone(&self.shared);
        let cache = self.clone();
        tokio::spawn(async move {
            let result = cache.fetch_into_slot(key, &location, generation).await;
            if result.is_err() {
                let mut slots = shared.slots.lock().unwrap();
                if matches!(slots.get(&key), Some(Slot::Pending(_))) {
                    slots.remove(&key);
                }
            }
            let _ = tx.send(Some(result.map_err(|e| e.to_string())));
        });
    }

    async fn fetch_into_slot(
        &self,
        key: BlockKey,
        location: &str,
        generation: u64,
    ) -> Result<()> {
        let block_size = self.shared.layout.block_size as usize;
        let fetched = self
            .shared
            .backend
            .fetch_block(location, key.1, self.shared.layout.block_size)
            .await?;

        let mut data = vec![0u8; block_size];
        if let Some(bytes) = fetched {
            let n = bytes.len().min(block_size);
            data[..n].copy_from_slice(&bytes[..n]);
        }

        self.ensure_capacity().await;

        let block = Arc::new(Block {
            location: location.to_string(),
            data: RwLock::new(data),
            dirty: AtomicBool::new(false),
            pins: AtomicUsize::new(0),
            tick: AtomicU64::new(self.shared.next_tick()),
            generation: AtomicU64::new(generation),
            write_seq: AtomicU64::new(0),
        });
        let mut slots = self.shared.slots.lock().unwrap();
        slots.insert(key, Slot::Ready(block));
        Ok(())
    }

    async fn ensure_capacity(&self) {
        while self.resident_blocks() >= self.shared.capacity {
            if !self.evict_one().await {
                warn!("cache at capacity with no evictable block; admitting over capacity");
                return;
            }
        }
    }

    /// Evict one LRU unpinned block. Dirty victims are flushed first; a
    /// victim that gets pinned or re-dirtied while we flush is skipped.
    async fn evict_one(&self) -> bool {
        for _ in 0..8 {
            let victim = {
                let slots = self.shared.slots.lock().unwrap();
                slots
                    .iter()
                    .filter_map(|(key, slot)| match slot {
                        Slot::Ready(block) if block.pins.load(Ordering::SeqCst) == 0 => {
                            Some((*key, Arc::clone(block)))
                        }
                        _ => None,
                    })
                    .min_by_key(|(_, block)| block.tick.load(Ordering::SeqCst))
            };
            let Some((key, block)) = victim else {
                return false;
            };

            if block.dirty.load(Ordering::SeqCst) {
                if let Err(e) = self.flush_block(&key, &block).await {
                    warn!(
                        "flush before eviction failed for block {}/{}: {e}",
                        key.0, key.1
                    );
                    return false;
                }
            }

            let mut slots = self.shared.slots.lock().unwrap();
            if let Some(Slot::Ready(current)) = slots.get(&key) {
                if Arc::ptr_eq(current, &block)
                    && block.pins.load(Ordering::SeqCst) == 0
                    && !block.dirty.load(Ordering::SeqCst)
                {
                    slots.remove(&key);
                    debug!("evicted block {}/{}", key.0, key.1);
                    return true;
                }
            }
            // Victim changed under us; pick again.
        }
        false
    }

    async fn flush_block(&self, key: &BlockKey, block: &Arc<Block>) -> Result<()> {
        let (snapshot, seq) = {
            let data = block.data.read().unwrap();
            (
                Bytes::copy_from_slice(&data),
                block.write_seq.load(Ordering::SeqCst),
            )
        };
        let acked = self
            .shared
            .backend
            .write_blocks(&block.location, &[(key.1, snapshot)])
            .await?;
        if acked < 1 {
            return Err(StoreError::BackendUnavailable(
                "flush was not acknowledged".into(),
            ));
        }
        let _guard = block.data.write().unwrap();
        if block.write_seq.load(Ordering::SeqCst) == seq {
            block.dirty.store(false, Ordering::SeqCst);
        }
        Ok(())
    }
}

impl<B: ObjectBackend> Shared<B> {
    fn next_tick(&self) -> u64 {
        self.tick.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemBackend;
    use tokio::time::Duration;

    fn small_cache(capacity: usize) -> (BlockCache<MemBackend>, Arc<MemBackend>) {
        let backend = Arc::new(MemBackend::new());
        let cache = BlockCache::new(BlockLayout::new(16), capacity, Arc::clone(&backend));
        (cache, backend)
    }

    #[tokio::test]
    async fn test_miss_materializes_zero_block() {
        let (cache, backend) = small_cache(4);
        let guard = cache.get(1, 0, "obj-1", 1).await.unwrap();
        assert_eq!(guard.read_range(0, 16), Bytes::from(vec![0u8; 16]));
        assert!(!guard.is_dirty());
        assert_eq!(backend.fetch_calls(), 1);
    }

    #[tokio::test]
    async fn test_coalesced_fetch_single_backend_call() {
        let (cache, backend) = small_cache(4);
        backend
            .write_blocks("obj-1", &[(0, Bytes::from(vec![7u8; 16]))])
            .await
            .unwrap();
        backend.set_fetch_delay(Duration::from_millis(30));
        let before = backend.fetch_calls();

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            tasks.push(tokio::spawn(async move {
                let guard = cache.get(1, 0, "obj-1", 1).await.unwrap();
                guard.read_range(0, 16)
            }));
        }
        for task in tasks {
            assert_eq!(task.await.unwrap(), Bytes::from(vec![7u8; 16]));
        }
        assert_eq!(backend.fetch_calls() - before, 1);
    }

    #[tokio::test]
    async fn test_flush_resumes_after_partial_failure() {
        let (cache, backend) = small_cache(8);
        for index in 0..3u64 {
            let guard = cache.get(1, index, "obj-1", 1).await.unwrap();
            guard.write_range(0, &[index as u8 + 1; 16]);
        }

        backend.set_write_quota(Some(1));
        let err = cache.flush_object(1).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(backend.block("obj-1", 0).is_some());
        assert!(backend.block("obj-1", 1).is_none());

        backend.set_write_quota(None);
        let puts_before = backend.put_calls();
        cache.flush_object(1).await.unwrap();
        // Only the two unacknowledged blocks went out the second time.
        assert_eq!(backend.put_calls() - puts_before, 2);
        for index in 0..3u64 {
            assert_eq!(
                backend.block("obj-1", index).unwrap(),
                Bytes::from(vec![index as u8 + 1; 16])
            );
        }
    }

    #[tokio::test]
    async fn test_eviction_flushes_dirty_victims() {
        let (cache, _backend) = small_cache(2);
        for index in 0..4u64 {
            let guard = cache.get(1, index, "obj-1", 1).await.unwrap();
            guard.write_range(0, &[index as u8 + 1; 16]);
        }
        assert!(cache.resident_blocks() <= 2);

        // Every write survives: either still resident or flushed on eviction.
        for index in 0..4u64 {
            let guard = cache.get(1, index, "obj-1", 1).await.unwrap();
            assert_eq!(guard.read_range(0, 16), Bytes::from(vec![index as u8 + 1; 16]));
        }
    }

    #[tokio::test]
    async fn test_pinned_blocks_are_not_evicted() {
        let (cache, _backend) = small_cache(1);
        let pinned = cache.get(1, 0, "obj-1", 1).await.unwrap();
        pinned.write_range(0, &[9u8; 16]);

        // Admission over capacity rather than touching the pinned block.
        let other = cache.get(1, 1, "obj-1", 1).await.unwrap();
        drop(other);
        assert_eq!(pinned.read_range(0, 16), Bytes::from(vec![9u8; 16]));
    }

    #[tokio::test]
    async fn test_stale_clean_block_is_refetched() {
        let (cache, backend) = small_cache(4);
        backend
            .write_blocks("obj-1", &[(0, Bytes::from(vec![1u8; 16]))])
            .await
            .unwrap();
        {
            let guard = cache.get(1, 0, "obj-1", 1).await.unwrap();
            assert_eq!(guard.read_range(0, 16), Bytes::from(vec![1u8; 16]));
        }

        backend
            .write_blocks("obj-1", &[(0, Bytes::from(vec![2u8; 16]))])
            .await
            .unwrap();
        // Same generation: still served from cache.
        {
            let guard = cache.get(1, 0, "obj-1", 1).await.unwrap();
            assert_eq!(guard.read_range(0, 16), Bytes::from(vec![1u8; 16]));
        }
        // Advanced generation: the clean resident block is stale.
        let guard = cache.get(1, 0, "obj-1", 2).await.unwrap();
        assert_eq!(guard.read_range(0, 16), Bytes::from(vec![2u8; 16]));
    }

    #[tokio::test]
    async fn test_mark_dirty_idempotent() {
        let (cache, _backend) = small_cache(4);
        let guard = cache.get(1, 0, "obj-1", 1).await.unwrap();
        guard.mark_dirty();
        guard.mark_dirty();
        assert!(guard.is_dirty());
        drop(guard);
        cache.flush_object(1).await.unwrap();
        let guard = cache.get(1, 0, "obj-1", 1).await.unwrap();
        assert!(!guard.is_dirty());
    }
}
