//! Per-block metadata. Each 32 KiB block has one `BlockMeta` record in a
//! flat arena, holding its state, a data word (first free line for simple
//! blocks, run length for superblock starts), and the intrusive link used
//! by the lock-free free lists.

use crate::util::constants::*;
use crate::util::region::Region;
use crate::util::Address;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};

/// The block allocation state.
///
/// `CoalesceMe` and `SuperblockStartMe` are transitional tags that exist
/// only while a sweep is in progress: the sweeper applies them to blocks
/// whose final shape depends on a neighboring, possibly unswept batch, and
/// the coalescer resolves them before the sweep completes.
#[derive(Debug, PartialEq, Eq, Clone, Copy, enum_map::Enum)]
#[repr(u8)]
pub enum BlockFlag {
    /// Not allocated; owned by the block allocator's free lists.
    Free = 0,
    /// Holds bump-allocated objects; not marked in the current cycle.
    Simple = 1,
    /// A simple block holding at least one object traced this cycle.
    Marked = 2,
    /// First block of a multi-block superblock; run length in `data`.
    SuperblockStart = 3,
    /// Non-first block of a superblock.
    SuperblockTail = 4,
    /// Freed by a sweep batch at a batch edge; awaiting the coalescer.
    CoalesceMe = 5,
    /// New first block of a superblock whose leading blocks were freed;
    /// the coalescer retags it `SuperblockStart`.
    SuperblockStartMe = 6,
}

impl From<u8> for BlockFlag {
    fn from(byte: u8) -> Self {
        match byte {
            0 => BlockFlag::Free,
            1 => BlockFlag::Simple,
            2 => BlockFlag::Marked,
            3 => BlockFlag::SuperblockStart,
            4 => BlockFlag::SuperblockTail,
            5 => BlockFlag::CoalesceMe,
            6 => BlockFlag::SuperblockStartMe,
            _ => unreachable!("invalid block flag byte: {}", byte),
        }
    }
}

/// Sentinel for "no block" in intrusive free-list links.
pub const NO_BLOCK: u32 = u32::MAX;
/// Sentinel for "no free line" in a simple block's data word.
pub const NO_FREE_LINE: u32 = u32::MAX;

/// One block's metadata record.
#[repr(C)]
pub struct BlockMeta {
    flag: AtomicU8,
    /// First free line index for simple blocks; run length for superblock
    /// starts and retag targets.
    data: AtomicU32,
    /// Free-list link: the index of the next block in the owning list.
    next: AtomicU32,
}

impl BlockMeta {
    pub fn flag(&self) -> BlockFlag {
        self.flag.load(Ordering::Acquire).into()
    }

    pub fn set_flag(&self, flag: BlockFlag) {
        self.flag.store(flag as u8, Ordering::Release);
    }

    pub fn data(&self) -> u32 {
        self.data.load(Ordering::Acquire)
    }

    pub fn set_data(&self, data: u32) {
        self.data.store(data, Ordering::Release);
    }

    pub fn next(&self) -> u32 {
        self.next.load(Ordering::Acquire)
    }

    pub fn set_next(&self, next: u32) {
        self.next.store(next, Ordering::Release);
    }

    /// Reset to a clean free block.
    pub fn clear(&self) {
        self.data.store(0, Ordering::Relaxed);
        self.next.store(NO_BLOCK, Ordering::Relaxed);
        self.set_flag(BlockFlag::Free);
    }
}

/// Data structure to reference one heap block by its start address.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialOrd, PartialEq)]
pub struct Block(Address);

impl Region for Block {
    const LOG_BYTES: usize = LOG_BYTES_IN_BLOCK;

    fn from_aligned_address(address: Address) -> Self {
        debug_assert!(address.is_aligned_to(Self::BYTES));
        Self(address)
    }

    fn start(&self) -> Address {
        self.0
    }
}

impl Block {
    /// Lines in block
    pub const LINES: usize = LINES_IN_BLOCK;

    pub fn line(&self, index: usize) -> Address {
        debug_assert!(index < Self::LINES);
        self.0 + (index << LOG_BYTES_IN_LINE)
    }
}

/// The flat arena of `BlockMeta` records, indexed by block position in the
/// heap range. Sized for the maximum heap at init; records past the current
/// block count are untouched until the heap grows over them.
pub struct BlockMetaTable {
    heap_start: Address,
    base: Address,
    max_blocks: usize,
}

impl BlockMetaTable {
    pub fn new(heap_start: Address, base: Address, max_blocks: usize) -> Self {
        debug_assert!(heap_start.is_aligned_to(BYTES_IN_BLOCK));
        Self {
            heap_start,
            base,
            max_blocks,
        }
    }

    /// The number of arena bytes needed for `max_blocks` records.
    pub const fn table_size(max_blocks: usize) -> usize {
        max_blocks * std::mem::size_of::<BlockMeta>()
    }

    pub fn meta(&self, index: u32) -> &BlockMeta {
        debug_assert!((index as usize) < self.max_blocks);
        // The arena is mapped for the whole maximum heap range at init.
        unsafe {
            &*(self.base + (index as usize) * std::mem::size_of::<BlockMeta>())
                .to_ptr::<BlockMeta>()
        }
    }

    pub fn index_of(&self, block: Block) -> u32 {
        debug_assert!(block.start() >= self.heap_start);
        let index = (block.start() - self.heap_start) >> LOG_BYTES_IN_BLOCK;
        debug_assert!(index < self.max_blocks);
        index as u32
    }

    pub fn block_at(&self, index: u32) -> Block {
        debug_assert!((index as usize) < self.max_blocks);
        Block::from_aligned_address(self.heap_start + ((index as usize) << LOG_BYTES_IN_BLOCK))
    }

    pub fn block_containing(&self, addr: Address) -> Block {
        Block::from_unaligned_address(addr)
    }
}
