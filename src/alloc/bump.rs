//! The thread-local bump allocator, the mutator fast path. Small objects
//! bump `cursor` through the holes of the current block, jumping between
//! holes via the free-line list the sweeper threaded through the block's
//! unused memory. Objects wider than a line bump a separate overflow
//! cursor backed by a wholly free block, so a single medium object never
//! strands the tail of a small hole.
//!
//! All fields are single-threaded; one instance per mutator thread. The
//! only shared state touched on the fast path is the object bytemap entry
//! of the new object.

use crate::alloc::BlockAllocator;
use crate::metadata::block::{BlockMetaTable, NO_BLOCK, NO_FREE_LINE};
use crate::metadata::{BlockFlag, Bytemap, FreeLineMeta, ObjectState};
use crate::util::constants::*;
use crate::util::region::Region;
use crate::util::{memory, Address};

pub struct BumpAllocator {
    cursor: Address,
    limit: Address,
    large_cursor: Address,
    large_limit: Address,
    block: u32,
    large_block: u32,
}

impl BumpAllocator {
    pub fn new() -> Self {
        Self {
            cursor: Address::ZERO,
            limit: Address::ZERO,
            large_cursor: Address::ZERO,
            large_limit: Address::ZERO,
            block: NO_BLOCK,
            large_block: NO_BLOCK,
        }
    }

    /// Drop all cursors. Called when a collection starts: the sweeper will
    /// rebuild the holes this allocator was bumping through, so continuing
    /// to use them would double-allocate.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Allocate `size` zeroed bytes, or None when no block can be obtained
    /// without collecting. `size` must be granule-aligned and below the
    /// large object threshold.
    pub fn try_alloc(
        &mut self,
        size: usize,
        bytemap: &Bytemap,
        blocks: &BlockMetaTable,
        block_alloc: &BlockAllocator,
    ) -> Option<Address> {
        debug_assert!(size >= MIN_OBJECT_SIZE && size < LARGE_OBJECT_THRESHOLD);
        debug_assert!(size % ALLOCATION_ALIGNMENT == 0);
        if size > BYTES_IN_LINE {
            self.overflow_alloc(size, bytemap, blocks, block_alloc)
        } else {
            self.line_alloc(size, bytemap, blocks, block_alloc)
        }
    }

    fn line_alloc(
        &mut self,
        size: usize,
        bytemap: &Bytemap,
        blocks: &BlockMetaTable,
        block_alloc: &BlockAllocator,
    ) -> Option<Address> {
        if self.cursor + size <= self.limit {
            return Some(self.commit(size, bytemap));
        }
        // A hole is at least one line, so one advance always fits a
        // line-or-smaller object.
        if self.next_hole(blocks) {
            return Some(self.commit(size, bytemap));
        }
        if self.acquire_block(blocks, block_alloc) {
            return Some(self.commit(size, bytemap));
        }
        None
    }

    fn overflow_alloc(
        &mut self,
        size: usize,
        bytemap: &Bytemap,
        blocks: &BlockMetaTable,
        block_alloc: &BlockAllocator,
    ) -> Option<Address> {
        if self.large_cursor + size <= self.large_limit {
            return Some(self.commit_large(size, bytemap));
        }
        let index = block_alloc.get_free_block(blocks)?;
        let meta = blocks.meta(index);
        meta.set_flag(BlockFlag::Simple);
        meta.set_data(NO_FREE_LINE);
        let block = blocks.block_at(index);
        self.large_cursor = block.start();
        self.large_limit = block.end();
        self.large_block = index;
        Some(self.commit_large(size, bytemap))
    }

    fn commit(&mut self, size: usize, bytemap: &Bytemap) -> Address {
        let start = self.cursor;
        self.cursor = start + size;
        memory::zero(start, size);
        bytemap.set(start, ObjectState::Allocated);
        start
    }

    fn commit_large(&mut self, size: usize, bytemap: &Bytemap) -> Address {
        let start = self.large_cursor;
        self.large_cursor = start + size;
        memory::zero(start, size);
        bytemap.set(start, ObjectState::Allocated);
        start
    }

    /// Move the cursor to the current block's next hole, consuming one
    /// entry of the free-line list.
    fn next_hole(&mut self, blocks: &BlockMetaTable) -> bool {
        if self.block == NO_BLOCK {
            return false;
        }
        let meta = blocks.meta(self.block);
        let first = meta.data();
        if first == NO_FREE_LINE {
            return false;
        }
        let line = blocks.block_at(self.block).line(first as usize);
        let hole = unsafe { FreeLineMeta::read(line) };
        debug_assert!(hole.size > 0);
        self.cursor = line;
        self.limit = line + (hole.size as usize) * BYTES_IN_LINE;
        meta.set_data(hole.next);
        true
    }

    /// Install a new current block, preferring a partially free recycled
    /// block over a wholly free one.
    fn acquire_block(&mut self, blocks: &BlockMetaTable, block_alloc: &BlockAllocator) -> bool {
        if let Some(index) = block_alloc.pop_recycled(blocks) {
            self.block = index;
            let advanced = self.next_hole(blocks);
            debug_assert!(advanced, "recycled block {} had no free line", index);
            return advanced;
        }
        if let Some(index) = block_alloc.get_free_block(blocks) {
            let meta = blocks.meta(index);
            meta.set_flag(BlockFlag::Simple);
            meta.set_data(NO_FREE_LINE);
            let block = blocks.block_at(index);
            self.cursor = block.start();
            self.limit = block.end();
            self.block = index;
            return true;
        }
        false
    }
}

impl Default for BumpAllocator {
    fn default() -> Self {
        Self::new()
    }
}
