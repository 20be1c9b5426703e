//! Blocks, pools and size classes

use std::collections::HashSet;

use serde::Serialize;

use crate::allocator::config::{
    LARGE_BUFFER, MIN_BLOCK_SIZE, MIN_LARGE_ALLOC, ROUND_LARGE, SMALL_BUFFER, SMALL_SIZE,
};
use crate::stream::{NpuStream, StreamId};

pub(crate) type BlockId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockPool {
    Small,
    Large,
}

impl BlockPool {
    pub fn for_size(size: usize) -> Self {
        if size <= SMALL_SIZE {
            BlockPool::Small
        } else {
            BlockPool::Large
        }
    }
}

/// Round a request up to the block granularity.
///
/// `None` if the rounded size does not fit in `usize`.
pub fn round_size(size: usize) -> Option<usize> {
    if size < MIN_BLOCK_SIZE {
        Some(MIN_BLOCK_SIZE)
    } else {
        size.div_ceil(MIN_BLOCK_SIZE).checked_mul(MIN_BLOCK_SIZE)
    }
}

/// Size of the segment to request from the device for a rounded request.
pub fn allocation_size(size: usize) -> Option<usize> {
    if size <= SMALL_SIZE {
        Some(SMALL_BUFFER)
    } else if size < MIN_LARGE_ALLOC {
        Some(LARGE_BUFFER)
    } else {
        size.div_ceil(ROUND_LARGE).checked_mul(ROUND_LARGE)
    }
}

/// Free-set ordering: stream first, then size, then address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct FreeKey {
    pub stream: StreamId,
    pub size: usize,
    pub addr: usize,
}

#[derive(Debug)]
pub(crate) struct Block {
    pub addr: usize,
    pub size: usize,
    pub requested_size: usize,
    pub pool: BlockPool,
    pub stream: StreamId,
    pub allocated: bool,
    pub prev: Option<BlockId>,
    pub next: Option<BlockId>,
    /// Outstanding events recorded at free time.
    pub event_count: usize,
    /// Streams other than `stream` that used this block.
    pub stream_uses: HashSet<NpuStream>,
    pub context: Option<String>,
}

impl Block {
    pub fn new(addr: usize, size: usize, pool: BlockPool, stream: StreamId) -> Self {
        Block {
            addr,
            size,
            requested_size: 0,
            pool,
            stream,
            allocated: false,
            prev: None,
            next: None,
            event_count: 0,
            stream_uses: HashSet::new(),
            context: None,
        }
    }

    pub fn is_split(&self) -> bool {
        self.prev.is_some() || self.next.is_some()
    }

    pub fn free_key(&self) -> FreeKey {
        FreeKey {
            stream: self.stream,
            size: self.size,
            addr: self.addr,
        }
    }
}
