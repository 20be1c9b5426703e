//! Caching allocator for a single device
//!
//! Device memory is requested from the runtime in segments and carved into
//! blocks. Freed blocks go back into a free set ordered by
//! `(stream, size, address)` and are reused by later requests on the same
//! stream; neighbouring free blocks are merged so a segment can return to a
//! single block.
//!
//! A block used by streams other than the one it was allocated on is not
//! reusable as soon as it is freed: an event is recorded on each of those
//! streams and the block stays "pending free" until all of them complete.
//!
//! All bookkeeping sits behind one mutex per device. The mutex is released
//! while waiting on events during the out-of-memory retry, so frees from
//! other threads are not blocked behind device synchronization.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::allocator::block::{allocation_size, round_size, Block, BlockId, BlockPool, FreeKey};
use crate::allocator::config::{AllocatorConfig, ReleasePolicy, LARGE_BUFFER, MIN_BLOCK_SIZE, SMALL_SIZE};
use crate::allocator::snapshot::{BlockInfo, BlockState, SegmentInfo};
use crate::allocator::stats::DeviceStats;
use crate::allocator::trace::{AllocationHistory, ContextRecorder, RecordContext, TraceAction, TraceEntry};
use crate::backend::acl_backend::{check_warn, DeviceIndex, DevicePtr, NativeEvent, EVENT_FLAG_SYNC};
use crate::device::{DeviceGuard, DeviceRegistry};
use crate::error::{ForgeResult, NpuForgeError, OomReport};
use crate::internal_error;
use crate::stream::{NpuStream, StreamId};

/// Pending-free queues are keyed by the stream the event was recorded on.
type StreamKey = (DeviceIndex, StreamId);

#[derive(Debug)]
struct PendingEvent {
    stream: StreamKey,
    event: NativeEvent,
    block: BlockId,
}

#[derive(Debug)]
struct AllocatorState {
    blocks: HashMap<BlockId, Block>,
    next_block_id: BlockId,
    small_blocks: BTreeMap<FreeKey, BlockId>,
    large_blocks: BTreeMap<FreeKey, BlockId>,
    /// Allocated blocks by address.
    active_blocks: HashMap<usize, BlockId>,
    pending_events: BTreeMap<StreamKey, VecDeque<PendingEvent>>,
    /// Completed events kept for reuse.
    free_events: Vec<NativeEvent>,
    stats: DeviceStats,
    total_allocated_memory: usize,
    allowed_memory_maximum: Option<usize>,
    history: AllocationHistory,
}

impl AllocatorState {
    fn free_set(&mut self, pool: BlockPool) -> &mut BTreeMap<FreeKey, BlockId> {
        match pool {
            BlockPool::Small => &mut self.small_blocks,
            BlockPool::Large => &mut self.large_blocks,
        }
    }

    fn insert_block(&mut self, block: Block) -> BlockId {
        let id = self.next_block_id;
        self.next_block_id += 1;
        self.blocks.insert(id, block);
        id
    }

    fn block(&self, id: BlockId) -> ForgeResult<&Block> {
        self.blocks
            .get(&id)
            .ok_or_else(|| internal_error!("block {} missing from allocator state", id))
    }

    fn block_mut(&mut self, id: BlockId) -> ForgeResult<&mut Block> {
        self.blocks
            .get_mut(&id)
            .ok_or_else(|| internal_error!("block {} missing from allocator state", id))
    }

    fn insert_free(&mut self, id: BlockId) -> ForgeResult<()> {
        let block = self.block(id)?;
        let (pool, key) = (block.pool, block.free_key());
        self.free_set(pool).insert(key, id);
        Ok(())
    }

    fn remove_free(&mut self, id: BlockId) -> ForgeResult<()> {
        let block = self.block(id)?;
        let (pool, key) = (block.pool, block.free_key());
        self.free_set(pool).remove(&key);
        Ok(())
    }

    fn trace(&mut self, device: DeviceIndex, action: TraceAction, addr: usize, size: usize, stream: StreamId, context: Option<String>) {
        self.history.record(TraceEntry {
            action,
            device,
            addr,
            size,
            stream,
            context,
        });
    }
}

pub(crate) struct DeviceCachingAllocator {
    device: DeviceIndex,
    registry: Arc<DeviceRegistry>,
    config: AllocatorConfig,
    state: Mutex<AllocatorState>,
}

impl std::fmt::Debug for DeviceCachingAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceCachingAllocator")
            .field("device", &self.device)
            .field("config", &self.config)
            .finish()
    }
}

impl DeviceCachingAllocator {
    pub fn new(device: DeviceIndex, registry: Arc<DeviceRegistry>, config: AllocatorConfig) -> Self {
        let stats = DeviceStats {
            max_split_size: config.max_split_size,
            ..DeviceStats::default()
        };
        let history = AllocationHistory::new(config.trace_max_entries);
        DeviceCachingAllocator {
            device,
            registry,
            config,
            state: Mutex::new(AllocatorState {
                blocks: HashMap::new(),
                next_block_id: 0,
                small_blocks: BTreeMap::new(),
                large_blocks: BTreeMap::new(),
                active_blocks: HashMap::new(),
                pending_events: BTreeMap::new(),
                free_events: Vec::new(),
                stats,
                total_allocated_memory: 0,
                allowed_memory_maximum: None,
                history,
            }),
        }
    }

    fn lock(&self) -> ForgeResult<MutexGuard<'_, AllocatorState>> {
        Ok(self.state.lock()?)
    }

    fn max_split_size(&self) -> usize {
        self.config.max_split_size
    }

    /// Allocate at least `orig_size` bytes for use on `stream`.
    pub fn malloc(&self, orig_size: usize, stream: &NpuStream) -> ForgeResult<DevicePtr> {
        let sizes = round_size(orig_size).and_then(|size| Some((size, allocation_size(size)?)));
        let Some((size, alloc_size)) = sizes else {
            // No segment of that size can exist.
            return Err(self.out_of_memory(self.lock()?, orig_size, stream.id()));
        };
        let pool = BlockPool::for_size(size);

        let mut state = self.lock()?;
        let context = state.history.capture(RecordContext::State);
        self.process_events(&mut state)?;

        let mut found = self.get_free_block(&mut state, size, pool, stream.id());
        if found.is_none() {
            found = self.alloc_block(&mut state, alloc_size, pool, stream.id(), context.clone())?;
        }

        let block = match found {
            Some(id) => id,
            None => {
                // Out of memory: wait for pending frees, drop every fully
                // free cached segment and try once more.
                state.stats.num_alloc_retries += 1;
                drop(state);
                self.synchronize_and_free_events()?;
                state = self.lock()?;
                self.release_cached_blocks(&mut state)?;

                let mut retry = self.get_free_block(&mut state, size, pool, stream.id());
                if retry.is_none() {
                    retry = self.alloc_block(&mut state, alloc_size, pool, stream.id(), context.clone())?;
                }
                match retry {
                    Some(id) => id,
                    None => return Err(self.out_of_memory(state, alloc_size, stream.id())),
                }
            }
        };

        self.alloc_found_block(&mut state, block, orig_size, size, context)
    }

    fn out_of_memory(&self, mut state: MutexGuard<'_, AllocatorState>, alloc_size: usize, stream: StreamId) -> NpuForgeError {
        state.stats.num_ooms += 1;
        let free = self
            .registry
            .mem_get_info(self.device)
            .map(|info| info.free)
            .unwrap_or(0);
        state.trace(self.device, TraceAction::Oom, free, alloc_size, stream, None);
        let report = OomReport {
            device: self.device,
            requested: alloc_size,
            allocated: state.stats.allocated_bytes.all.current.max(0) as usize,
            reserved: state.stats.reserved_bytes.all.current.max(0) as usize,
            free,
            allowed: state.allowed_memory_maximum,
        };
        drop(state);
        tracing::warn!("{}", report);
        NpuForgeError::OutOfMemory(Box::new(report))
    }

    /// Smallest cached block on `stream` that fits `size`, removed from its free set.
    fn get_free_block(&self, state: &mut AllocatorState, size: usize, pool: BlockPool, stream: StreamId) -> Option<BlockId> {
        let lower = FreeKey {
            stream,
            size,
            addr: 0,
        };
        let (key, id) = state
            .free_set(pool)
            .range(lower..)
            .next()
            .filter(|(key, _)| key.stream == stream)
            .map(|(key, id)| (*key, *id))?;

        let max_split = self.max_split_size();
        // Oversize blocks are reserved for oversize requests...
        if size < max_split && key.size >= max_split {
            return None;
        }
        // ...and are not handed to requests much smaller than themselves.
        if size >= max_split && key.size - size >= LARGE_BUFFER {
            return None;
        }
        state.free_set(pool).remove(&key);
        Some(id)
    }

    /// Request a new segment from the device.
    ///
    /// `Ok(None)` means the device (or the memory fraction budget) is out of
    /// memory.
    fn alloc_block(
        &self,
        state: &mut AllocatorState,
        alloc_size: usize,
        pool: BlockPool,
        stream: StreamId,
        context: Option<String>,
    ) -> ForgeResult<Option<BlockId>> {
        if let Some(allowed) = state.allowed_memory_maximum {
            if alloc_size > allowed.saturating_sub(state.total_allocated_memory) {
                tracing::debug!(
                    "Segment of {} bytes on device {} would exceed the budget of {} bytes",
                    alloc_size,
                    self.device,
                    allowed
                );
                return Ok(None);
            }
        }

        let ptr = {
            let _guard = DeviceGuard::new(&self.registry, self.device)?;
            match self.registry.driver().malloc(alloc_size) {
                Ok(ptr) => ptr,
                Err(err) if err.is_out_of_memory() => {
                    tracing::debug!("Device {} out of memory: {}", self.device, err);
                    return Ok(None);
                }
                Err(err) => return Err(err.into()),
            }
        };

        state.total_allocated_memory += alloc_size;
        let id = state.insert_block(Block::new(ptr.0, alloc_size, pool, stream));
        state.stats.segment.update(pool, 1);
        state.stats.reserved_bytes.update(pool, alloc_size as i64);
        if alloc_size >= self.max_split_size() {
            state.stats.oversize_segments.increase(1);
        }
        let trace_context = if state.history.when() >= RecordContext::Alloc {
            context
        } else {
            None
        };
        state.trace(self.device, TraceAction::SegmentAlloc, ptr.0, alloc_size, stream, trace_context);
        tracing::debug!(
            "Allocated segment {} of {} bytes on device {} ({:?} pool)",
            ptr,
            alloc_size,
            self.device,
            pool
        );
        Ok(Some(id))
    }

    fn should_split(&self, pool: BlockPool, block_size: usize, size: usize) -> bool {
        let remaining = block_size - size;
        match pool {
            BlockPool::Small => remaining >= MIN_BLOCK_SIZE,
            BlockPool::Large => size < self.max_split_size() && remaining > SMALL_SIZE,
        }
    }

    fn alloc_found_block(
        &self,
        state: &mut AllocatorState,
        id: BlockId,
        orig_size: usize,
        size: usize,
        context: Option<String>,
    ) -> ForgeResult<DevicePtr> {
        let (addr, block_size, pool, stream, already_split, next) = {
            let block = state.block(id)?;
            (block.addr, block.size, block.pool, block.stream, block.is_split(), block.next)
        };

        if self.should_split(pool, block_size, size) {
            let remaining = block_size - size;
            let mut tail = Block::new(addr + size, remaining, pool, stream);
            tail.prev = Some(id);
            tail.next = next;
            let tail_id = state.insert_block(tail);
            if let Some(next) = next {
                state.block_mut(next)?.prev = Some(tail_id);
            }
            {
                let block = state.block_mut(id)?;
                block.next = Some(tail_id);
                block.size = size;
            }
            state.insert_free(tail_id)?;

            if already_split {
                // An inactive split block shrinks by `size`.
                state.stats.inactive_split_bytes.update(pool, -(size as i64));
            } else {
                // A previously whole segment now has an inactive split remainder.
                state.stats.inactive_split_bytes.update(pool, remaining as i64);
                state.stats.inactive_split.update(pool, 1);
            }
        } else if already_split {
            state.stats.inactive_split_bytes.update(pool, -(block_size as i64));
            state.stats.inactive_split.update(pool, -1);
        }

        let final_size = {
            let block = state.block_mut(id)?;
            block.allocated = true;
            block.requested_size = orig_size;
            block.context = context.clone();
            block.size
        };
        state.active_blocks.insert(addr, id);

        state.stats.allocation.update(pool, 1);
        state.stats.allocated_bytes.update(pool, final_size as i64);
        state.stats.active.update(pool, 1);
        state.stats.active_bytes.update(pool, final_size as i64);
        state.stats.requested_bytes.update(pool, orig_size as i64);
        if final_size >= self.max_split_size() {
            state.stats.oversize_allocations.increase(1);
        }

        let trace_context = if state.history.when() >= RecordContext::Alloc {
            context
        } else {
            None
        };
        state.trace(self.device, TraceAction::Alloc, addr, orig_size, stream, trace_context);
        tracing::trace!(
            "Allocated block {:#x} ({} bytes, requested {}) on device {}",
            addr,
            final_size,
            orig_size,
            self.device
        );
        Ok(DevicePtr(addr))
    }

    /// Return an allocation to the cache.
    ///
    /// If an event cannot be recorded on one of the streams that used the
    /// block, the allocation stays live and the error is returned.
    pub fn free(&self, ptr: DevicePtr) -> ForgeResult<()> {
        let mut state = self.lock()?;
        let context = state.history.capture(RecordContext::All);
        let id = self.active_block(&state, ptr)?;
        let uses: Vec<NpuStream> = state.block(id)?.stream_uses.iter().cloned().collect();
        let events = self.record_free_events(&mut state, &uses)?;

        state.active_blocks.remove(&ptr.0);
        let (pool, size, requested, stream) = {
            let block = state.block_mut(id)?;
            block.allocated = false;
            block.stream_uses.clear();
            block.event_count = events.len();
            (block.pool, block.size, block.requested_size, block.stream)
        };

        state.stats.allocation.update(pool, -1);
        state.stats.allocated_bytes.update(pool, -(size as i64));
        state.stats.requested_bytes.update(pool, -(requested as i64));
        if size >= self.max_split_size() {
            state.stats.oversize_allocations.decrease(1);
        }
        state.trace(self.device, TraceAction::FreeRequested, ptr.0, requested, stream, context.clone());

        if events.is_empty() {
            return self.free_block(&mut state, id, context);
        }
        for (user, event) in events {
            let key = (user.device_index(), user.id());
            state.pending_events.entry(key).or_default().push_back(PendingEvent {
                stream: key,
                event,
                block: id,
            });
            tracing::trace!("Deferred free of block {} until {} drains", id, user);
        }
        Ok(())
    }

    /// Record an event on each of `streams`.
    ///
    /// On failure the events already recorded go back to the reuse list.
    fn record_free_events(
        &self,
        state: &mut AllocatorState,
        streams: &[NpuStream],
    ) -> ForgeResult<Vec<(NpuStream, NativeEvent)>> {
        let mut recorded = Vec::with_capacity(streams.len());
        for stream in streams {
            match self.record_event_on(state, stream) {
                Ok(event) => recorded.push((stream.clone(), event)),
                Err(err) => {
                    state.free_events.extend(recorded.into_iter().map(|(_, event)| event));
                    return Err(err);
                }
            }
        }
        Ok(recorded)
    }

    fn record_event_on(&self, state: &mut AllocatorState, stream: &NpuStream) -> ForgeResult<NativeEvent> {
        let driver = self.registry.driver();
        let _guard = DeviceGuard::new(&self.registry, stream.device_index())?;
        let event = match state.free_events.pop() {
            Some(event) => event,
            None => driver.create_event(EVENT_FLAG_SYNC)?,
        };
        if let Err(err) = driver.record_event(event, stream.native()) {
            state.free_events.push(event);
            return Err(err.into());
        }
        Ok(event)
    }

    /// Poll pending-free events without blocking.
    fn process_events(&self, state: &mut AllocatorState) -> ForgeResult<()> {
        let driver = self.registry.driver();
        let mut completed = Vec::new();
        for queue in state.pending_events.values_mut() {
            while let Some(front) = queue.front() {
                if !driver.query_event(front.event)?.is_complete() {
                    break;
                }
                if let Some(done) = queue.pop_front() {
                    completed.push(done);
                }
            }
        }
        state.pending_events.retain(|_, queue| !queue.is_empty());
        for pending in completed {
            self.complete_pending(state, pending)?;
        }
        Ok(())
    }

    fn complete_pending(&self, state: &mut AllocatorState, pending: PendingEvent) -> ForgeResult<()> {
        state.free_events.push(pending.event);
        let remaining = {
            let block = state.block_mut(pending.block)?;
            block.event_count -= 1;
            block.event_count
        };
        if remaining == 0 {
            self.free_block(state, pending.block, None)?;
        }
        Ok(())
    }

    /// Wait for every pending-free event, then reclaim the blocks.
    ///
    /// The lock is not held while waiting.
    fn synchronize_and_free_events(&self) -> ForgeResult<()> {
        let pending: Vec<PendingEvent> = {
            let mut state = self.lock()?;
            std::mem::take(&mut state.pending_events)
                .into_values()
                .flatten()
                .collect()
        };
        if pending.is_empty() {
            return Ok(());
        }

        let driver = self.registry.driver();
        let mut failure = None;
        let mut done = Vec::with_capacity(pending.len());
        let mut unfinished = Vec::new();
        for entry in pending {
            match driver.synchronize_event(entry.event) {
                Ok(()) => done.push(entry),
                Err(err) => {
                    failure.get_or_insert(err);
                    unfinished.push(entry);
                }
            }
        }

        let mut state = self.lock()?;
        for entry in done {
            self.complete_pending(&mut state, entry)?;
        }
        for entry in unfinished {
            state
                .pending_events
                .entry(entry.stream)
                .or_default()
                .push_back(entry);
        }
        match failure {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }

    /// Merge `src` into `dst` if it is free. Returns the bytes absorbed.
    fn try_merge_blocks(&self, state: &mut AllocatorState, dst: BlockId, src: Option<BlockId>) -> ForgeResult<usize> {
        let Some(src) = src else {
            return Ok(0);
        };
        {
            let candidate = state.block(src)?;
            if candidate.allocated || candidate.event_count > 0 {
                return Ok(0);
            }
        }
        state.remove_free(src)?;
        let src_block = state
            .blocks
            .remove(&src)
            .ok_or_else(|| internal_error!("block {} vanished during merge", src))?;

        let dst_is_right = state.block(dst)?.prev == Some(src);
        if dst_is_right {
            let block = state.block_mut(dst)?;
            block.addr = src_block.addr;
            block.prev = src_block.prev;
            if let Some(prev) = src_block.prev {
                state.block_mut(prev)?.next = Some(dst);
            }
        } else {
            let block = state.block_mut(dst)?;
            block.next = src_block.next;
            if let Some(next) = src_block.next {
                state.block_mut(next)?.prev = Some(dst);
            }
        }
        state.block_mut(dst)?.size += src_block.size;
        Ok(src_block.size)
    }

    /// Move a block whose free has completed back into its free set.
    fn free_block(&self, state: &mut AllocatorState, id: BlockId, context: Option<String>) -> ForgeResult<()> {
        let (addr, original_size, requested, pool, stream, prev, next) = {
            let block = state.block(id)?;
            (block.addr, block.size, block.requested_size, block.pool, block.stream, block.prev, block.next)
        };

        let mut net_inactive_blocks: i64 = 0;
        let mut net_inactive_bytes: i64 = 0;
        for candidate in [prev, next] {
            let subsumed = self.try_merge_blocks(state, id, candidate)?;
            if subsumed > 0 {
                net_inactive_blocks -= 1;
                net_inactive_bytes -= subsumed as i64;
            }
        }

        let (is_split, merged_size) = {
            let block = state.block_mut(id)?;
            block.context = None;
            (block.is_split(), block.size)
        };
        state.insert_free(id)?;

        if is_split {
            net_inactive_blocks += 1;
            net_inactive_bytes += merged_size as i64;
        }
        state.stats.inactive_split.update(pool, net_inactive_blocks);
        state.stats.inactive_split_bytes.update(pool, net_inactive_bytes);
        state.stats.active.update(pool, -1);
        state.stats.active_bytes.update(pool, -(original_size as i64));
        state.trace(self.device, TraceAction::FreeCompleted, addr, requested, stream, context);

        if self.config.release_policy == ReleasePolicy::Eager && !is_split {
            self.release_block(state, id)?;
        }
        Ok(())
    }

    /// Give a fully free segment back to the device.
    fn release_block(&self, state: &mut AllocatorState, id: BlockId) -> ForgeResult<()> {
        let (addr, size, pool, stream) = {
            let block = state.block(id)?;
            (block.addr, block.size, block.pool, block.stream)
        };
        {
            let _guard = DeviceGuard::new(&self.registry, self.device)?;
            self.registry.driver().free(DevicePtr(addr))?;
        }
        state.remove_free(id)?;
        state.blocks.remove(&id);
        state.total_allocated_memory -= size;
        state.stats.segment.update(pool, -1);
        state.stats.reserved_bytes.update(pool, -(size as i64));
        if size >= self.max_split_size() {
            state.stats.oversize_segments.decrease(1);
        }
        state.trace(self.device, TraceAction::SegmentFree, addr, size, stream, None);
        tracing::debug!("Released segment {:#x} ({} bytes) on device {}", addr, size, self.device);
        Ok(())
    }

    fn release_cached_blocks(&self, state: &mut AllocatorState) -> ForgeResult<()> {
        let whole: Vec<BlockId> = state
            .small_blocks
            .values()
            .chain(state.large_blocks.values())
            .copied()
            .filter(|id| state.blocks.get(id).map(|b| !b.is_split()).unwrap_or(false))
            .collect();
        for id in whole {
            self.release_block(state, id)?;
        }
        Ok(())
    }

    /// Release every cached segment that has no live blocks.
    pub fn empty_cache(&self) -> ForgeResult<()> {
        self.synchronize_and_free_events()?;
        let mut state = self.lock()?;
        self.release_cached_blocks(&mut state)
    }

    pub fn record_stream(&self, ptr: DevicePtr, stream: &NpuStream) -> ForgeResult<()> {
        let mut state = self.lock()?;
        let id = self.active_block(&state, ptr)?;
        let block = state.block_mut(id)?;
        if stream.id() == block.stream && stream.device_index() == self.device {
            return Ok(());
        }
        block.stream_uses.insert(stream.clone());
        Ok(())
    }

    pub fn erase_stream(&self, ptr: DevicePtr, stream: &NpuStream) -> ForgeResult<()> {
        let mut state = self.lock()?;
        let id = self.active_block(&state, ptr)?;
        state.block_mut(id)?.stream_uses.remove(stream);
        Ok(())
    }

    fn active_block(&self, state: &AllocatorState, ptr: DevicePtr) -> ForgeResult<BlockId> {
        state.active_blocks.get(&ptr.0).copied().ok_or_else(|| {
            NpuForgeError::InvalidArgument(format!(
                "{} is not a live allocation of device {}",
                ptr, self.device
            ))
        })
    }

    /// Cap reserved memory at `fraction` of the device's total memory.
    pub fn set_memory_fraction(&self, fraction: f64) -> ForgeResult<()> {
        let total = self.registry.mem_get_info(self.device)?.total;
        let allowed = (fraction * total as f64) as usize;
        self.lock()?.allowed_memory_maximum = Some(allowed);
        tracing::debug!(
            "Device {} memory budget set to {} of {} bytes",
            self.device,
            allowed,
            total
        );
        Ok(())
    }

    pub fn stats(&self) -> ForgeResult<DeviceStats> {
        Ok(self.lock()?.stats.clone())
    }

    pub fn reset_accumulated_stats(&self) -> ForgeResult<()> {
        self.lock()?.stats.reset_accumulated();
        Ok(())
    }

    pub fn reset_peak_stats(&self) -> ForgeResult<()> {
        self.lock()?.stats.reset_peak();
        Ok(())
    }

    /// Total bytes of cached free blocks and the largest one.
    ///
    /// With nothing cached, the largest block is the device's free memory.
    pub fn cache_info(&self) -> ForgeResult<(usize, usize)> {
        let (total, largest) = {
            let state = self.lock()?;
            state
                .small_blocks
                .keys()
                .chain(state.large_blocks.keys())
                .fold((0usize, 0usize), |(total, largest), key| {
                    (total + key.size, largest.max(key.size))
                })
        };
        if largest == 0 {
            let free = self.registry.mem_get_info(self.device)?.free;
            return Ok((total, free));
        }
        Ok((total, largest))
    }

    /// Base address and size of the segment containing the allocation at `ptr`.
    pub fn get_base_allocation(&self, ptr: DevicePtr) -> ForgeResult<(DevicePtr, usize)> {
        let state = self.lock()?;
        let mut id = self.active_block(&state, ptr)?;
        while let Some(prev) = state.block(id)?.prev {
            id = prev;
        }
        let base = state.block(id)?.addr;
        let mut size = 0;
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            let block = state.block(current)?;
            size += block.size;
            cursor = block.next;
        }
        Ok((DevicePtr(base), size))
    }

    pub fn contains(&self, ptr: DevicePtr) -> ForgeResult<bool> {
        Ok(self.lock()?.active_blocks.contains_key(&ptr.0))
    }

    /// Describe every segment.
    ///
    /// The lock is taken once to list segment heads and then once per
    /// segment, so a snapshot never stalls allocation for long.
    pub fn snapshot(&self) -> ForgeResult<Vec<SegmentInfo>> {
        let mut heads: Vec<usize> = {
            let state = self.lock()?;
            state
                .blocks
                .values()
                .filter(|b| b.prev.is_none())
                .map(|b| b.addr)
                .collect()
        };
        heads.sort_unstable();

        let mut segments = Vec::with_capacity(heads.len());
        for head_addr in heads {
            let state = self.lock()?;
            let head = state
                .blocks
                .iter()
                .find(|(_, b)| b.prev.is_none() && b.addr == head_addr)
                .map(|(id, _)| *id);
            let Some(head) = head else {
                continue;
            };
            segments.push(self.describe_segment(&state, head)?);
        }
        Ok(segments)
    }

    fn describe_segment(&self, state: &AllocatorState, head: BlockId) -> ForgeResult<SegmentInfo> {
        let first = state.block(head)?;
        let mut segment = SegmentInfo {
            device: self.device,
            address: first.addr,
            total_size: 0,
            allocated_size: 0,
            active_size: 0,
            requested_size: 0,
            stream: first.stream,
            segment_type: first.pool,
            is_expandable: false,
            blocks: Vec::new(),
        };
        let mut cursor = Some(head);
        while let Some(id) = cursor {
            let block = state.block(id)?;
            let block_state = if block.allocated {
                BlockState::ActiveAllocated
            } else if block.event_count > 0 {
                BlockState::ActivePendingFree
            } else {
                BlockState::Inactive
            };
            segment.total_size += block.size;
            if block.allocated {
                segment.allocated_size += block.size;
                segment.requested_size += block.requested_size;
            }
            if block_state != BlockState::Inactive {
                segment.active_size += block.size;
            }
            segment.blocks.push(BlockInfo {
                address: block.addr,
                size: block.size,
                requested_size: block.requested_size,
                state: block_state,
                context: block.context.clone(),
            });
            cursor = block.next;
        }
        Ok(segment)
    }

    pub fn record_history(
        &self,
        enabled: bool,
        recorder: Option<ContextRecorder>,
        max_entries: usize,
        when: RecordContext,
    ) -> ForgeResult<()> {
        self.lock()?.history.configure(enabled, recorder, max_entries, when);
        Ok(())
    }

    pub fn history(&self) -> ForgeResult<Vec<TraceEntry>> {
        Ok(self.lock()?.history.entries())
    }
}

impl Drop for DeviceCachingAllocator {
    fn drop(&mut self) {
        let Ok(state) = self.state.get_mut() else {
            return;
        };
        let driver = self.registry.driver();
        for event in state.free_events.drain(..) {
            check_warn(driver.destroy_event(event), "destroying cached allocator event");
        }
    }
}
