//! In-memory backend for tests and local development.

use crate::backend::ObjectBackend;
use crate::error::{Result, StoreError};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::time::Duration;

/// HashMap-backed block storage with fault-injection knobs used by the
/// cache and session tests: a configurable fetch delay (to widen coalescing
/// windows) and a write quota (to provoke partial flush failures).
#[derive(Default)]
pub struct MemBackend {
    blocks: Mutex<HashMap<(String, u64), Bytes>>,
    fetch_calls: AtomicUsize,
    put_calls: AtomicUsize,
    fetch_delay_ms: AtomicUsize,
    /// Remaining block writes accepted before failing; usize::MAX = unlimited.
    write_quota: AtomicUsize,
}

impl MemBackend {
    pub fn new() -> Self {
        Self {
            write_quota: AtomicUsize::new(usize::MAX),
            ..Self::default()
        }
    }

    /// Number of `fetch_block` calls that reached the backend.
    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    /// Number of individual block writes that reached the backend.
    pub fn put_calls(&self) -> usize {
        self.put_calls.load(Ordering::SeqCst)
    }

    pub fn set_fetch_delay(&self, delay: Duration) {
        self.fetch_delay_ms
            .store(delay.as_millis() as usize, Ordering::SeqCst);
    }

    /// Accept `quota` further block writes, then fail. `None` lifts the limit.
    pub fn set_write_quota(&self, quota: Option<usize>) {
        self.write_quota
            .store(quota.unwrap_or(usize::MAX), Ordering::SeqCst);
    }

    fn try_consume_write(&self) -> bool {
        self.write_quota
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |q| {
                if q == usize::MAX {
                    Some(q)
                } else {
                    q.checked_sub(1)
                }
            })
            .is_ok()
    }

    pub fn block(&self, location: &str, block_index: u64) -> Option<Bytes> {
        self.blocks
            .lock()
            .unwrap()
            .get(&(location.to_string(), block_index))
            .cloned()
    }
}

#[async_trait]
impl ObjectBackend for MemBackend {
    async fn fetch_block(
        &self,
        location: &str,
        block_index: u64,
        _block_size: u32,
    ) -> Result<Option<Bytes>> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.fetch_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay as u64)).await;
        }
        Ok(self.block(location, block_index))
    }

    async fn write_blocks(&self, location: &str, blocks: &[(u64, Bytes)]) -> Result<usize> {
        let mut acked = 0;
        for (index, data) in blocks {
            if !self.try_consume_write() {
                if acked == 0 {
                    return Err(StoreError::BackendUnavailable(
                        "write quota exhausted".into(),
                    ));
                }
                return Ok(acked);
            }
            self.put_calls.fetch_add(1, Ordering::SeqCst);
            self.blocks
                .lock()
                .unwrap()
                .insert((location.to_string(), *index), data.clone());
            acked += 1;
        }
        Ok(acked)
    }

    async fn remove_blocks_from(&self, location: &str, from_index: u64) -> Result<()> {
        self.blocks
            .lock()
            .unwrap()
            .retain(|(loc, index), _| loc != location || *index < from_index);
        Ok(())
    }

    async fn delete_object(&self, location: &str) -> Result<()> {
        self.blocks
            .lock()
            .unwrap()
            .retain(|(loc, _), _| loc != location);
        Ok(())
    }
}
