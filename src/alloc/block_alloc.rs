//! The block and superblock allocator: power-of-two-bucketed free lists of
//! block runs, all lock-free. List links are threaded through the block
//! metadata arena and manipulated by index, so list bookkeeping needs no
//! allocation; the list heads pack `(top index, modification count)` into
//! one 64-bit atomic to defeat ABA on concurrent push/pop.

use crate::metadata::block::{BlockMetaTable, NO_BLOCK};
use crate::metadata::BlockFlag;
use crossbeam::utils::Backoff;
use spin::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Enough buckets for 2^27 blocks (4 TiB of heap).
pub const SUPERBLOCK_BUCKETS: usize = 28;

/// The reserve superblock is replenished to this many blocks after each
/// sweep; it guarantees single-block forward progress under adversarial
/// fragmentation.
pub const RESERVE_BLOCKS: usize = 16;

fn pack(top: u32, aba: u32) -> u64 {
    ((top as u64) << 32) | aba as u64
}

fn unpack(head: u64) -> (u32, u32) {
    ((head >> 32) as u32, head as u32)
}

/// A lock-free stack of blocks, linked through `BlockMeta::next`.
pub struct BlockStack {
    head: AtomicU64,
}

impl BlockStack {
    pub fn new() -> Self {
        Self {
            head: AtomicU64::new(pack(NO_BLOCK, 0)),
        }
    }

    pub fn push(&self, meta: &BlockMetaTable, index: u32) {
        debug_assert_ne!(index, NO_BLOCK);
        let backoff = Backoff::new();
        loop {
            let head = self.head.load(Ordering::Acquire);
            let (top, aba) = unpack(head);
            meta.meta(index).set_next(top);
            if self
                .head
                .compare_exchange_weak(
                    head,
                    pack(index, aba.wrapping_add(1)),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return;
            }
            backoff.spin();
        }
    }

    pub fn pop(&self, meta: &BlockMetaTable) -> Option<u32> {
        let backoff = Backoff::new();
        loop {
            let head = self.head.load(Ordering::Acquire);
            let (top, aba) = unpack(head);
            if top == NO_BLOCK {
                return None;
            }
            // The modification count in `head` makes this CAS fail if the
            // stack changed since the load, so a stale `next` is never
            // installed.
            let next = meta.meta(top).next();
            if self
                .head
                .compare_exchange_weak(
                    head,
                    pack(next, aba.wrapping_add(1)),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return Some(top);
            }
            backoff.spin();
        }
    }

    pub fn is_empty(&self) -> bool {
        let (top, _) = unpack(self.head.load(Ordering::Acquire));
        top == NO_BLOCK
    }
}

impl Default for BlockStack {
    fn default() -> Self {
        Self::new()
    }
}

/// A contiguous run carved one block at a time, used as the reserve.
struct BlockRange {
    cursor: u32,
    limit: u32,
}

impl BlockRange {
    const EMPTY: BlockRange = BlockRange {
        cursor: 0,
        limit: 0,
    };

    fn remaining(&self) -> usize {
        (self.limit - self.cursor) as usize
    }
}

pub struct BlockAllocator {
    /// `buckets[i]` holds runs of exactly `2^i` blocks, identified by their
    /// first block's index.
    buckets: [BlockStack; SUPERBLOCK_BUCKETS],
    /// Partially free simple blocks produced by the sweeper, preferred by
    /// the bump allocator to keep allocation density high.
    recycled: BlockStack,
    reserve: Mutex<BlockRange>,
    /// One in-flight free run the coalescer may keep extending with
    /// adjacent frees before it is split into buckets.
    coalescing: Mutex<BlockRange>,
    free_blocks: AtomicUsize,
    recycled_blocks: AtomicUsize,
}

impl BlockAllocator {
    pub fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| BlockStack::new()),
            recycled: BlockStack::new(),
            reserve: Mutex::new(BlockRange::EMPTY),
            coalescing: Mutex::new(BlockRange::EMPTY),
            free_blocks: AtomicUsize::new(0),
            recycled_blocks: AtomicUsize::new(0),
        }
    }

    /// Free blocks currently held, including the reserve.
    pub fn free_block_count(&self) -> usize {
        self.free_blocks.load(Ordering::Relaxed)
    }

    pub fn recycled_block_count(&self) -> usize {
        self.recycled_blocks.load(Ordering::Relaxed)
    }

    fn bucket_for_exact(run: usize) -> usize {
        debug_assert!(run.is_power_of_two());
        run.trailing_zeros() as usize
    }

    fn smallest_bucket_fitting(run: usize) -> usize {
        debug_assert!(run > 0);
        run.next_power_of_two().trailing_zeros() as usize
    }

    /// Return one free block, preferring the smallest available run and
    /// falling back to the reserve.
    pub fn get_free_block(&self, meta: &BlockMetaTable) -> Option<u32> {
        for bucket in 0..SUPERBLOCK_BUCKETS {
            if let Some(index) = self.buckets[bucket].pop(meta) {
                let run = 1usize << bucket;
                if run > 1 {
                    self.split_and_add(meta, index + 1, run - 1);
                }
                self.free_blocks.fetch_sub(1, Ordering::Relaxed);
                return Some(index);
            }
        }
        let mut reserve = self.reserve.lock();
        if reserve.remaining() > 0 {
            let index = reserve.cursor;
            reserve.cursor += 1;
            self.free_blocks.fetch_sub(1, Ordering::Relaxed);
            trace!("block {} carved from reserve", index);
            return Some(index);
        }
        None
    }

    /// Return a run of at least `blocks` contiguous blocks. An exact-size
    /// run is preferred; a larger one is split and the remainder requeued.
    pub fn get_free_superblock(&self, meta: &BlockMetaTable, blocks: usize) -> Option<u32> {
        debug_assert!(blocks > 0);
        let first = Self::smallest_bucket_fitting(blocks);
        for bucket in first..SUPERBLOCK_BUCKETS {
            if let Some(index) = self.buckets[bucket].pop(meta) {
                let run = 1usize << bucket;
                if run > blocks {
                    self.split_and_add(meta, index + blocks as u32, run - blocks);
                }
                self.free_blocks.fetch_sub(blocks, Ordering::Relaxed);
                return Some(index);
            }
        }
        let mut reserve = self.reserve.lock();
        if reserve.remaining() >= blocks {
            let index = reserve.cursor;
            reserve.cursor += blocks as u32;
            self.free_blocks.fetch_sub(blocks, Ordering::Relaxed);
            trace!("superblock of {} carved from reserve", blocks);
            return Some(index);
        }
        None
    }

    /// Register `count` newly free blocks starting at `start`. Clears their
    /// metadata; the caller must already have cleared the bytemap range.
    pub fn add_free_blocks(&self, meta: &BlockMetaTable, start: u32, count: usize) {
        debug_assert!(count > 0);
        for i in 0..count {
            meta.meta(start + i as u32).clear();
        }
        self.split_and_add(meta, start, count);
        self.free_blocks.fetch_add(count, Ordering::Relaxed);
    }

    /// Split an arbitrary-size run into power-of-two pieces and push each
    /// into its bucket. Does not touch the free-block count.
    fn split_and_add(&self, meta: &BlockMetaTable, mut start: u32, mut count: usize) {
        while count > 0 {
            let piece = prev_power_of_two(count);
            meta.meta(start).set_data(piece as u32);
            self.buckets[Self::bucket_for_exact(piece)].push(meta, start);
            start += piece as u32;
            count -= piece;
        }
    }

    /// Forget every held block. Called when a sweep starts: the sweeper
    /// rediscovers all free memory from block flags, including blocks that
    /// were free before the collection, so handing out stale list entries
    /// during the sweep would double-allocate.
    pub fn clear_for_sweep(&self) {
        for bucket in &self.buckets {
            bucket.head.store(pack(NO_BLOCK, 0), Ordering::Release);
        }
        self.recycled.head.store(pack(NO_BLOCK, 0), Ordering::Release);
        *self.reserve.lock() = BlockRange::EMPTY;
        *self.coalescing.lock() = BlockRange::EMPTY;
        self.free_blocks.store(0, Ordering::Release);
        self.recycled_blocks.store(0, Ordering::Release);
    }

    /// Add a free run that may be extended by the run immediately after it.
    /// The coalescer feeds runs here in address order; a run adjacent to
    /// the held one merges with it, anything else flushes it to the
    /// buckets first.
    pub fn extend_coalescing(&self, meta: &BlockMetaTable, start: u32, count: usize) {
        debug_assert!(count > 0);
        let mut pending = self.coalescing.lock();
        if pending.remaining() > 0 && pending.limit == start {
            pending.limit += count as u32;
        } else {
            if pending.remaining() > 0 {
                let (old_start, old_count) = (pending.cursor, pending.remaining());
                self.split_and_add(meta, old_start, old_count);
            }
            *pending = BlockRange {
                cursor: start,
                limit: start + count as u32,
            };
        }
        for i in 0..count {
            meta.meta(start + i as u32).clear();
        }
        self.free_blocks.fetch_add(count, Ordering::Relaxed);
    }

    /// Push the held coalescing run, if any, into the buckets.
    pub fn flush_coalescing(&self, meta: &BlockMetaTable) {
        let mut pending = self.coalescing.lock();
        if pending.remaining() > 0 {
            self.split_and_add(meta, pending.cursor, pending.remaining());
            *pending = BlockRange::EMPTY;
        }
    }

    /// Refill the reserve from the buckets, once per sweep.
    pub fn replenish_reserve(&self, meta: &BlockMetaTable) {
        let mut reserve = self.reserve.lock();
        if reserve.remaining() >= RESERVE_BLOCKS {
            return;
        }
        // Return what is left of the old reserve before installing a new one.
        if reserve.remaining() > 0 {
            self.split_and_add(meta, reserve.cursor, reserve.remaining());
        }
        *reserve = BlockRange::EMPTY;
        let first = Self::smallest_bucket_fitting(RESERVE_BLOCKS);
        for bucket in first..SUPERBLOCK_BUCKETS {
            if let Some(index) = self.buckets[bucket].pop(meta) {
                let run = 1usize << bucket;
                if run > RESERVE_BLOCKS {
                    self.split_and_add(meta, index + RESERVE_BLOCKS as u32, run - RESERVE_BLOCKS);
                }
                *reserve = BlockRange {
                    cursor: index,
                    limit: index + RESERVE_BLOCKS as u32,
                };
                return;
            }
        }
        debug!("no superblock available to replenish the reserve");
    }

    /// Queue a partially free simple block for reuse by bump allocators.
    pub fn push_recycled(&self, meta: &BlockMetaTable, index: u32) {
        debug_assert_eq!(meta.meta(index).flag(), BlockFlag::Simple);
        self.recycled.push(meta, index);
        self.recycled_blocks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn pop_recycled(&self, meta: &BlockMetaTable) -> Option<u32> {
        let index = self.recycled.pop(meta)?;
        self.recycled_blocks.fetch_sub(1, Ordering::Relaxed);
        Some(index)
    }
}

fn prev_power_of_two(n: usize) -> usize {
    debug_assert!(n > 0);
    1 << (usize::BITS - 1 - n.leading_zeros())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::block::BlockMetaTable;
    use crate::util::constants::BYTES_IN_BLOCK;
    use crate::util::Address;
    use std::sync::Arc;

    fn table(max_blocks: usize) -> (Vec<u8>, BlockMetaTable) {
        let mut buffer = vec![0u8; BlockMetaTable::table_size(max_blocks)];
        let heap_start = unsafe { Address::from_usize(BYTES_IN_BLOCK) };
        let base = Address::from_mut_ptr(buffer.as_mut_ptr());
        (buffer, BlockMetaTable::new(heap_start, base, max_blocks))
    }

    #[test]
    fn prev_power_of_two_values() {
        assert_eq!(prev_power_of_two(1), 1);
        assert_eq!(prev_power_of_two(2), 2);
        assert_eq!(prev_power_of_two(3), 2);
        assert_eq!(prev_power_of_two(12), 8);
        assert_eq!(prev_power_of_two(16), 16);
    }

    #[test]
    fn stack_push_pop() {
        let (_buffer, meta) = table(8);
        let stack = BlockStack::new();
        assert!(stack.is_empty());
        stack.push(&meta, 3);
        stack.push(&meta, 5);
        assert_eq!(stack.pop(&meta), Some(5));
        assert_eq!(stack.pop(&meta), Some(3));
        assert_eq!(stack.pop(&meta), None);
    }

    #[test]
    fn stack_conservation_under_contention() {
        const BLOCKS: usize = 256;
        let (buffer, meta) = table(BLOCKS);
        let meta = Arc::new(meta);
        let stack = Arc::new(BlockStack::new());
        for index in 0..BLOCKS as u32 {
            stack.push(&meta, index);
        }

        let mut handles = Vec::new();
        for _ in 0..4 {
            let stack = stack.clone();
            let meta = meta.clone();
            handles.push(std::thread::spawn(move || {
                let mut held = Vec::new();
                for _ in 0..1000 {
                    if let Some(index) = stack.pop(&meta) {
                        held.push(index);
                    }
                    if held.len() > 8 {
                        for index in held.drain(..) {
                            stack.push(&meta, index);
                        }
                    }
                }
                held
            }));
        }
        let mut recovered: Vec<u32> = Vec::new();
        for handle in handles {
            recovered.extend(handle.join().unwrap());
        }
        while let Some(index) = stack.pop(&meta) {
            recovered.push(index);
        }
        recovered.sort_unstable();
        recovered.dedup();
        // Every block is still in exactly one place.
        assert_eq!(recovered.len(), BLOCKS);
        drop(buffer);
    }

    #[test]
    fn superblock_split_and_requeue() {
        let (_buffer, meta) = table(64);
        let alloc = BlockAllocator::new();
        alloc.add_free_blocks(&meta, 0, 32);
        assert_eq!(alloc.free_block_count(), 32);

        // A 5-block request is served from the 8-run bucket; the remainder
        // is requeued and still allocatable.
        let sb = alloc.get_free_superblock(&meta, 5).unwrap();
        assert_eq!(alloc.free_block_count(), 27);
        let rest = alloc.get_free_superblock(&meta, 3).unwrap();
        assert_ne!(sb, rest);
        assert_eq!(alloc.free_block_count(), 24);
    }

    #[test]
    fn single_blocks_until_exhaustion() {
        let (_buffer, meta) = table(16);
        let alloc = BlockAllocator::new();
        alloc.add_free_blocks(&meta, 4, 4);

        let mut got = Vec::new();
        while let Some(index) = alloc.get_free_block(&meta) {
            got.push(index);
        }
        got.sort_unstable();
        assert_eq!(got, vec![4, 5, 6, 7]);
        assert_eq!(alloc.free_block_count(), 0);
    }

    #[test]
    fn reserve_guarantees_progress() {
        let (_buffer, meta) = table(64);
        let alloc = BlockAllocator::new();
        alloc.add_free_blocks(&meta, 0, RESERVE_BLOCKS);
        alloc.replenish_reserve(&meta);

        // The buckets are drained into the reserve, but single-block
        // allocation still succeeds.
        let mut served = 0;
        while alloc.get_free_block(&meta).is_some() {
            served += 1;
        }
        assert_eq!(served, RESERVE_BLOCKS);
    }

    #[test]
    fn coalescing_anchor_merges_adjacent_runs() {
        let (_buffer, meta) = table(64);
        let alloc = BlockAllocator::new();
        alloc.extend_coalescing(&meta, 8, 3);
        alloc.extend_coalescing(&meta, 11, 5);
        alloc.flush_coalescing(&meta);
        assert_eq!(alloc.free_block_count(), 8);
        // The merged run can serve a superblock of its full size.
        let sb = alloc.get_free_superblock(&meta, 8).unwrap();
        assert_eq!(sb, 8);
    }

    #[test]
    fn coalescing_anchor_flushes_on_gap() {
        let (_buffer, meta) = table(64);
        let alloc = BlockAllocator::new();
        alloc.extend_coalescing(&meta, 0, 2);
        alloc.extend_coalescing(&meta, 10, 2);
        alloc.flush_coalescing(&meta);
        assert_eq!(alloc.free_block_count(), 4);
        assert!(alloc.get_free_superblock(&meta, 4).is_none());
        assert!(alloc.get_free_superblock(&meta, 2).is_some());
        assert!(alloc.get_free_superblock(&meta, 2).is_some());
    }

    #[test]
    fn clear_for_sweep_forgets_everything() {
        let (_buffer, meta) = table(32);
        let alloc = BlockAllocator::new();
        alloc.add_free_blocks(&meta, 0, 8);
        meta.meta(20).set_flag(BlockFlag::Simple);
        alloc.push_recycled(&meta, 20);
        alloc.replenish_reserve(&meta);
        alloc.clear_for_sweep();
        assert_eq!(alloc.free_block_count(), 0);
        assert_eq!(alloc.recycled_block_count(), 0);
        assert!(alloc.get_free_block(&meta).is_none());
        assert!(alloc.pop_recycled(&meta).is_none());
    }

    #[test]
    fn recycled_blocks_round_trip() {
        let (_buffer, meta) = table(8);
        let alloc = BlockAllocator::new();
        meta.meta(2).set_flag(BlockFlag::Simple);
        alloc.push_recycled(&meta, 2);
        assert_eq!(alloc.recycled_block_count(), 1);
        assert_eq!(alloc.pop_recycled(&meta), Some(2));
        assert_eq!(alloc.recycled_block_count(), 0);
        assert_eq!(alloc.pop_recycled(&meta), None);
    }
}
