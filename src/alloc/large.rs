//! The large object allocator. Objects at or above [`LARGE_OBJECT_THRESHOLD`]
//! bypass bump allocation and are placed in superblocks (contiguous block
//! runs) obtained from the block allocator, or carved out of free chunks
//! left inside live superblocks by previous collections.
//!
//! Free chunks are tracked in power-of-two-bucketed lock-free stacks. A
//! chunk is identified by its granule index in the heap; the link to the
//! next chunk and the chunk's size live in the free memory itself, with a
//! `Placeholder` bytemap entry at the chunk start so the sweeper can skip
//! the chunk's extent in one step. The chunk lists are cleared at sweep
//! start and rebuilt from scratch as the sweeper scans live superblocks.

use crate::metadata::block::BlockMetaTable;
use crate::metadata::{BlockFlag, Bytemap, ObjectState};
use crate::util::constants::*;
use crate::util::region::Region;
use crate::util::conversions;
use crate::util::{memory, Address};
use crossbeam::utils::Backoff;
use std::sync::atomic::{AtomicU64, Ordering};

/// Buckets for chunk sizes from 8 KiB up; the last bucket is open-ended.
pub const LARGE_BUCKETS: usize = 20;

const NO_CHUNK: u32 = u32::MAX;

/// The free-chunk header, written at the first granule of every listed
/// chunk. `next` and `size` are in granules.
#[repr(C)]
#[derive(Copy, Clone)]
struct FreeChunkMeta {
    next: u32,
    size: u32,
}

const_assert!(std::mem::size_of::<FreeChunkMeta>() <= MIN_OBJECT_SIZE);

const fn pack(top: u32, aba: u32) -> u64 {
    ((top as u64) << 32) | aba as u64
}

fn unpack(head: u64) -> (u32, u32) {
    ((head >> 32) as u32, head as u32)
}

/// A lock-free stack of free chunks, linked through the chunk headers.
struct ChunkStack {
    head: AtomicU64,
}

impl ChunkStack {
    const fn new() -> Self {
        Self {
            head: AtomicU64::new(pack(NO_CHUNK, 0)),
        }
    }

    fn push(&self, heap_start: Address, granule: u32) {
        let backoff = Backoff::new();
        loop {
            let head = self.head.load(Ordering::Acquire);
            let (top, aba) = unpack(head);
            let chunk = chunk_address(heap_start, granule);
            let mut meta = unsafe { chunk.load::<FreeChunkMeta>() };
            meta.next = top;
            unsafe { chunk.store(meta) };
            if self
                .head
                .compare_exchange_weak(
                    head,
                    pack(granule, aba.wrapping_add(1)),
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

    fn pop(&self, heap_start: Address) -> Option<u32> {
        let backoff = Backoff::new();
        loop {
            let head = self.head.load(Ordering::Acquire);
            let (top, aba) = unpack(head);
            if top == NO_CHUNK {
                return None;
            }
            let next = unsafe { chunk_address(heap_start, top).load::<FreeChunkMeta>() }.next;
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

    fn clear(&self) {
        self.head.store(pack(NO_CHUNK, 0), Ordering::Release);
    }
}

fn chunk_address(heap_start: Address, granule: u32) -> Address {
    heap_start + ((granule as usize) << LOG_ALLOCATION_ALIGNMENT)
}

fn granule_of(heap_start: Address, addr: Address) -> u32 {
    debug_assert!(addr.is_aligned_to(ALLOCATION_ALIGNMENT));
    ((addr - heap_start) >> LOG_ALLOCATION_ALIGNMENT) as u32
}

fn bucket_of(bytes: usize) -> usize {
    debug_assert!(bytes >= LARGE_OBJECT_THRESHOLD);
    let log = usize::BITS as usize - 1 - bytes.leading_zeros() as usize;
    let threshold_log = LARGE_OBJECT_THRESHOLD.trailing_zeros() as usize;
    (log - threshold_log).min(LARGE_BUCKETS - 1)
}

pub struct LargeAllocator {
    heap_start: Address,
    buckets: [ChunkStack; LARGE_BUCKETS],
}

impl LargeAllocator {
    pub fn new(heap_start: Address) -> Self {
        Self {
            heap_start,
            buckets: std::array::from_fn(|_| ChunkStack::new()),
        }
    }

    /// Allocate `size` zeroed bytes, from a free chunk if one fits and from
    /// a fresh superblock otherwise. Returns None when the block allocator
    /// is out of blocks; the caller falls through to the collection path.
    pub fn alloc(
        &self,
        size: usize,
        bytemap: &Bytemap,
        blocks: &BlockMetaTable,
        block_alloc: &crate::alloc::BlockAllocator,
    ) -> Option<Address> {
        debug_assert!(size >= LARGE_OBJECT_THRESHOLD);
        let size = conversions::raw_align_up(size, ALLOCATION_ALIGNMENT);

        if let Some(start) = self.alloc_from_chunk(size, bytemap) {
            memory::zero(start, size);
            bytemap.set(start, ObjectState::Allocated);
            return Some(start);
        }

        let run = conversions::bytes_to_blocks_up(size);
        let index = block_alloc.get_free_superblock(blocks, run)?;
        let meta = blocks.meta(index);
        meta.set_flag(BlockFlag::SuperblockStart);
        meta.set_data(run as u32);
        for tail in 1..run {
            let tail_meta = blocks.meta(index + tail as u32);
            tail_meta.set_flag(BlockFlag::SuperblockTail);
            // Tail blocks point back at their start block.
            tail_meta.set_data(index);
        }

        let start = blocks.block_at(index).start();
        let leftover = run * BYTES_IN_BLOCK - size;
        if leftover >= LARGE_OBJECT_THRESHOLD {
            self.push_chunk(bytemap, start + size, leftover);
        }
        memory::zero(start, size);
        bytemap.set(start, ObjectState::Allocated);
        trace!("large object of {} bytes in superblock {}", size, index);
        Some(start)
    }

    /// Carve `size` bytes out of a listed chunk. The sub-threshold tail of
    /// a split is left unlisted; the next sweep folds it back into its
    /// neighborhood.
    fn alloc_from_chunk(&self, size: usize, bytemap: &Bytemap) -> Option<Address> {
        let first = bucket_of(size.next_power_of_two());
        for bucket in first..LARGE_BUCKETS {
            while let Some(granule) = self.buckets[bucket].pop(self.heap_start) {
                let start = chunk_address(self.heap_start, granule);
                debug_assert_eq!(bytemap.get(start), ObjectState::Placeholder);
                let meta = unsafe { start.load::<FreeChunkMeta>() };
                let chunk_bytes = (meta.size as usize) << LOG_ALLOCATION_ALIGNMENT;
                if chunk_bytes < size {
                    // Only the open-ended last bucket can hold undersized
                    // chunks for this request. Requeue and give up on it.
                    self.buckets[bucket].push(self.heap_start, granule);
                    break;
                }
                let leftover = chunk_bytes - size;
                if leftover >= LARGE_OBJECT_THRESHOLD {
                    self.push_chunk(bytemap, start + size, leftover);
                } else if leftover > 0 {
                    bytemap.clear_range(start + size, leftover);
                }
                return Some(start);
            }
        }
        None
    }

    /// Register a free chunk: write its header, tag its start granule as a
    /// placeholder and push it into the bucket for its size.
    pub fn push_chunk(&self, bytemap: &Bytemap, start: Address, bytes: usize) {
        debug_assert!(bytes >= LARGE_OBJECT_THRESHOLD);
        debug_assert!(start.is_aligned_to(ALLOCATION_ALIGNMENT));
        let granules = (bytes >> LOG_ALLOCATION_ALIGNMENT) as u32;
        unsafe {
            start.store(FreeChunkMeta {
                next: NO_CHUNK,
                size: granules,
            })
        };
        bytemap.set(start, ObjectState::Placeholder);
        let granule = granule_of(self.heap_start, start);
        self.buckets[bucket_of(bytes)].push(self.heap_start, granule);
    }

    /// Read the extent of a listed chunk from its header. The start granule
    /// must be a placeholder.
    pub fn chunk_size(&self, start: Address) -> usize {
        let meta = unsafe { start.load::<FreeChunkMeta>() };
        (meta.size as usize) << LOG_ALLOCATION_ALIGNMENT
    }

    /// Drop all listed chunks. Called at sweep start; the sweeper re-lists
    /// every free chunk it finds, so nothing is lost.
    pub fn clear(&self) {
        for bucket in &self.buckets {
            bucket.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::BlockAllocator;
    use crate::util::memory::Mapping;

    struct TestHeap {
        _mapping: Mapping,
        _tables: Vec<u8>,
        start: Address,
        bytemap: Bytemap,
        blocks: BlockMetaTable,
        block_alloc: BlockAllocator,
    }

    fn heap(block_count: usize) -> TestHeap {
        let heap_bytes = block_count * BYTES_IN_BLOCK;
        let mapping = Mapping::reserve(heap_bytes + BYTES_IN_BLOCK).unwrap();
        let start = mapping.start().align_up(BYTES_IN_BLOCK);
        let bytemap_bytes = Bytemap::table_size(heap_bytes);
        let meta_bytes = BlockMetaTable::table_size(block_count);
        let mut tables = vec![0u8; bytemap_bytes + meta_bytes];
        let base = Address::from_mut_ptr(tables.as_mut_ptr());
        let bytemap = Bytemap::new(start, base, heap_bytes >> LOG_ALLOCATION_ALIGNMENT);
        let blocks = BlockMetaTable::new(start, base + bytemap_bytes, block_count);
        let block_alloc = BlockAllocator::new();
        block_alloc.add_free_blocks(&blocks, 0, block_count);
        TestHeap {
            _mapping: mapping,
            _tables: tables,
            start,
            bytemap,
            blocks,
            block_alloc,
        }
    }

    #[test]
    fn bucket_mapping() {
        assert_eq!(bucket_of(LARGE_OBJECT_THRESHOLD), 0);
        assert_eq!(bucket_of(2 * LARGE_OBJECT_THRESHOLD - 16), 0);
        assert_eq!(bucket_of(2 * LARGE_OBJECT_THRESHOLD), 1);
        assert_eq!(bucket_of(usize::MAX >> 1), LARGE_BUCKETS - 1);
    }

    #[test]
    fn superblock_allocation_sets_flags() {
        let h = heap(8);
        let large = LargeAllocator::new(h.start);
        let size = 3 * BYTES_IN_BLOCK;
        let obj = large
            .alloc(size, &h.bytemap, &h.blocks, &h.block_alloc)
            .unwrap();
        assert_eq!(h.bytemap.get(obj), ObjectState::Allocated);

        let index = h.blocks.index_of(h.blocks.block_containing(obj));
        assert_eq!(h.blocks.meta(index).flag(), BlockFlag::SuperblockStart);
        assert_eq!(h.blocks.meta(index).data(), 3);
        for tail in 1..3 {
            assert_eq!(h.blocks.meta(index + tail).flag(), BlockFlag::SuperblockTail);
            assert_eq!(h.blocks.meta(index + tail).data(), index);
        }
    }

    #[test]
    fn superblock_tail_becomes_chunk() {
        let h = heap(4);
        let large = LargeAllocator::new(h.start);
        // One block plus one threshold-sized tail: takes a 2-block
        // superblock and lists the remainder as a chunk.
        let size = BYTES_IN_BLOCK + LARGE_OBJECT_THRESHOLD;
        let obj = large
            .alloc(size, &h.bytemap, &h.blocks, &h.block_alloc)
            .unwrap();
        let chunk = obj + size;
        assert_eq!(h.bytemap.get(chunk), ObjectState::Placeholder);
        assert_eq!(large.chunk_size(chunk), BYTES_IN_BLOCK - LARGE_OBJECT_THRESHOLD);

        // The next threshold-sized allocation reuses the chunk instead of
        // taking new blocks.
        let before = h.block_alloc.free_block_count();
        let second = large
            .alloc(LARGE_OBJECT_THRESHOLD, &h.bytemap, &h.blocks, &h.block_alloc)
            .unwrap();
        assert_eq!(second, chunk);
        assert_eq!(h.block_alloc.free_block_count(), before);
    }

    #[test]
    fn chunk_split_requeues_remainder() {
        let h = heap(4);
        let large = LargeAllocator::new(h.start);
        let base = h.blocks.block_at(0).start();
        h.blocks.meta(0).set_flag(BlockFlag::SuperblockStart);
        h.blocks.meta(0).set_data(1);
        large.push_chunk(&h.bytemap, base, 4 * LARGE_OBJECT_THRESHOLD);

        let first = large
            .alloc(LARGE_OBJECT_THRESHOLD, &h.bytemap, &h.blocks, &h.block_alloc)
            .unwrap();
        assert_eq!(first, base);
        assert_eq!(
            h.bytemap.get(base + LARGE_OBJECT_THRESHOLD),
            ObjectState::Placeholder
        );
        let second = large
            .alloc(2 * LARGE_OBJECT_THRESHOLD, &h.bytemap, &h.blocks, &h.block_alloc)
            .unwrap();
        assert_eq!(second, base + LARGE_OBJECT_THRESHOLD);
    }

    #[test]
    fn clear_forgets_chunks() {
        let h = heap(4);
        let large = LargeAllocator::new(h.start);
        let base = h.blocks.block_at(0).start();
        h.blocks.meta(0).set_flag(BlockFlag::SuperblockStart);
        h.blocks.meta(0).set_data(1);
        large.push_chunk(&h.bytemap, base, BYTES_IN_BLOCK);
        large.clear();
        assert!(large.alloc_from_chunk(LARGE_OBJECT_THRESHOLD, &h.bytemap).is_none());
    }

    #[test]
    fn allocation_is_zeroed() {
        let h = heap(4);
        let large = LargeAllocator::new(h.start);
        let obj = large
            .alloc(LARGE_OBJECT_THRESHOLD, &h.bytemap, &h.blocks, &h.block_alloc)
            .unwrap();
        unsafe {
            obj.store(0xdeadbeefu64);
        }
        h.bytemap.set(obj, ObjectState::Free);
        large.clear();
        large.push_chunk(&h.bytemap, obj, LARGE_OBJECT_THRESHOLD);
        let again = large
            .alloc(LARGE_OBJECT_THRESHOLD, &h.bytemap, &h.blocks, &h.block_alloc)
            .unwrap();
        assert_eq!(again, obj);
        assert_eq!(unsafe { again.load::<u64>() }, 0);
    }
}
