//! Per-line metadata and the free-line lists. Lines are the granularity of
//! partial-block reuse: the sweeper turns a simple block's dead lines into
//! holes, and the bump allocator jumps between holes via `FreeLineMeta`
//! records threaded through the free memory itself.

use crate::util::constants::*;
use crate::util::region::Region;
use crate::util::Address;
use std::sync::atomic::{AtomicU8, Ordering};

use super::block::Block;

#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialOrd, PartialEq, Eq)]
pub struct Line(Address);

impl Region for Line {
    const LOG_BYTES: usize = LOG_BYTES_IN_LINE;

    fn from_aligned_address(address: Address) -> Self {
        debug_assert!(address.is_aligned_to(Self::BYTES));
        Self(address)
    }

    fn start(&self) -> Address {
        self.0
    }
}

impl Line {
    /// The index of this line within its block.
    pub fn index_in_block(&self, block: Block) -> usize {
        debug_assert!(block.includes_address(self.0));
        (self.0 - block.start()) >> LOG_BYTES_IN_LINE
    }

    pub fn block(&self) -> Block {
        Block::from_unaligned_address(self.0)
    }
}

/// The per-line mark table: one byte per line, zero for empty.
pub struct LineMetaTable {
    heap_start: Address,
    base: Address,
    max_lines: usize,
}

const LINE_EMPTY: u8 = 0;
const LINE_MARKED: u8 = 1;

impl LineMetaTable {
    pub fn new(heap_start: Address, base: Address, max_lines: usize) -> Self {
        Self {
            heap_start,
            base,
            max_lines,
        }
    }

    /// The number of table bytes needed to cover `heap_bytes` of heap.
    pub const fn table_size(heap_bytes: usize) -> usize {
        heap_bytes >> LOG_BYTES_IN_LINE
    }

    fn entry(&self, line: Line) -> &AtomicU8 {
        debug_assert!(line.start() >= self.heap_start);
        let index = (line.start() - self.heap_start) >> LOG_BYTES_IN_LINE;
        debug_assert!(index < self.max_lines);
        unsafe { &*(self.base + index).to_ptr::<AtomicU8>() }
    }

    pub fn is_marked(&self, line: Line) -> bool {
        self.entry(line).load(Ordering::Acquire) == LINE_MARKED
    }

    /// Idempotent; racing markers may mark the same line concurrently.
    pub fn mark(&self, line: Line) {
        self.entry(line).store(LINE_MARKED, Ordering::Release);
    }

    pub fn clear(&self, line: Line) {
        self.entry(line).store(LINE_EMPTY, Ordering::Relaxed);
    }

    /// Mark every line spanned by the object at `[start, start + size)`.
    pub fn mark_lines_for_object(&self, start: Address, size: usize) {
        let mut line = Line::from_unaligned_address(start);
        let end = start + size;
        while line.start() < end {
            self.mark(line);
            line = line.next();
        }
    }
}

/// A free-line list node, written into the first word of each hole. `next`
/// is the in-block line index of the next hole (or `LAST_HOLE`), `size` the
/// number of consecutive free lines in this hole.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeLineMeta {
    pub next: u32,
    pub size: u32,
}

impl FreeLineMeta {
    pub const LAST_HOLE: u32 = u32::MAX;

    /// Read the hole header at `hole_start`.
    ///
    /// # Safety
    /// `hole_start` must be the start of a hole previously written by
    /// `write`, in memory owned by the caller's block.
    pub unsafe fn read(hole_start: Address) -> FreeLineMeta {
        hole_start.load::<FreeLineMeta>()
    }

    /// Write a hole header at `hole_start`.
    ///
    /// # Safety
    /// The line at `hole_start` must be free and owned by the caller.
    pub unsafe fn write(hole_start: Address, meta: FreeLineMeta) {
        debug_assert!(meta.size > 0);
        hole_start.store(meta);
    }
}

const_assert!(std::mem::size_of::<FreeLineMeta>() <= MIN_OBJECT_SIZE);
