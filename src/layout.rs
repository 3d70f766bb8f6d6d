//! Block layout: split position-addressed file ranges into cache blocks.

/// Default cache block size (32 MiB, matching common object-store readers).
pub const DEFAULT_BLOCK_SIZE: u32 = 32 * 1024 * 1024;

/// Fixed block geometry shared by the cache and all file handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLayout {
    pub block_size: u32,
}

impl Default for BlockLayout {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

impl BlockLayout {
    pub fn new(block_size: u32) -> Self {
        assert!(block_size > 0, "block size must be non-zero");
        Self { block_size }
    }

    pub fn block_index_of(&self, position: u64) -> u64 {
        position / self.block_size as u64
    }

    pub fn offset_in_block(&self, position: u64) -> u32 {
        (position % self.block_size as u64) as u32
    }

    /// Number of blocks needed to hold `size` bytes.
    pub fn block_count(&self, size: u64) -> u64 {
        size.div_ceil(self.block_size as u64)
    }
}

/// A file range projected onto a single block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSpan {
    pub block_index: u64,
    pub offset_in_block: u32,
    pub len: usize,
}

/// Split the file range `[position, position + len)` into per-block spans.
pub fn split_range_into_blocks(layout: BlockLayout, mut position: u64, len: usize) -> Vec<BlockSpan> {
    let mut remaining = len as u64;
    let mut out = Vec::new();
    if remaining == 0 {
        return out;
    }

    while remaining > 0 {
        let block_index = layout.block_index_of(position);
        let offset_in_block = layout.offset_in_block(position);
        let cap = layout.block_size as u64 - offset_in_block as u64;
        let take = cap.min(remaining);
        out.push(BlockSpan {
            block_index,
            offset_in_block,
            len: take as usize,
        });
        position += take;
        remaining -= take;
    }
    out
}
