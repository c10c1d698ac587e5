//! The object bytemap: one metadata byte per 16-byte allocation granule,
//! recording the liveness state of the object (if any) starting at that
//! granule. Liveness is never stored in object headers; the bytemap is the
//! single source of truth for the marker and the sweeper.

use crate::util::constants::*;
use crate::util::Address;
use std::sync::atomic::{AtomicU8, Ordering};

/// The liveness state of one allocation granule.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[repr(u8)]
pub enum ObjectState {
    /// No object starts here.
    Free = 0,
    /// Interior of a free chunk or superblock; skipped by the sweeper and
    /// never a valid mark target.
    Placeholder = 1,
    /// An object starts here and survived the last sweep (or was allocated
    /// since).
    Allocated = 2,
    /// An object starts here and has been traced in the current mark phase.
    Marked = 3,
}

impl From<u8> for ObjectState {
    fn from(byte: u8) -> Self {
        match byte {
            0 => ObjectState::Free,
            1 => ObjectState::Placeholder,
            2 => ObjectState::Allocated,
            3 => ObjectState::Marked,
            _ => unreachable!("invalid object state byte: {}", byte),
        }
    }
}

/// The bytemap table. `table` points at one byte per granule of the maximum
/// heap range starting at `heap_start`.
pub struct Bytemap {
    heap_start: Address,
    table: Address,
    granules: usize,
}

impl Bytemap {
    pub fn new(heap_start: Address, table: Address, granules: usize) -> Self {
        debug_assert!(heap_start.is_aligned_to(ALLOCATION_ALIGNMENT));
        Self {
            heap_start,
            table,
            granules,
        }
    }

    /// The number of table bytes needed to cover `heap_bytes` of heap.
    pub const fn table_size(heap_bytes: usize) -> usize {
        heap_bytes >> LOG_ALLOCATION_ALIGNMENT
    }

    pub fn index_of(&self, addr: Address) -> usize {
        debug_assert!(addr >= self.heap_start);
        debug_assert!(addr.is_aligned_to(ALLOCATION_ALIGNMENT));
        let index = (addr - self.heap_start) >> LOG_ALLOCATION_ALIGNMENT;
        debug_assert!(index < self.granules);
        index
    }

    fn entry(&self, index: usize) -> &AtomicU8 {
        debug_assert!(index < self.granules);
        // The table is mapped for the whole maximum heap range at init.
        unsafe { &*(self.table + index).to_ptr::<AtomicU8>() }
    }

    /// A view of the table entries for `granules` granules starting at the
    /// granule containing `start`.
    pub fn entries(&self, start: Address, granules: usize) -> &[AtomicU8] {
        let index = self.index_of(start);
        debug_assert!(index + granules <= self.granules);
        unsafe { std::slice::from_raw_parts((self.table + index).to_ptr::<AtomicU8>(), granules) }
    }

    pub fn get(&self, addr: Address) -> ObjectState {
        self.entry(self.index_of(addr))
            .load(Ordering::Acquire)
            .into()
    }

    pub fn set(&self, addr: Address, state: ObjectState) {
        self.entry(self.index_of(addr))
            .store(state as u8, Ordering::Release);
    }

    /// Flip an allocated object to marked. Returns true exactly once per
    /// object per mark phase: losing the race (or the object already being
    /// marked, free, or a placeholder) returns false.
    pub fn try_mark(&self, addr: Address) -> bool {
        self.entry(self.index_of(addr))
            .compare_exchange(
                ObjectState::Allocated as u8,
                ObjectState::Marked as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Reset every granule in `[start, start + bytes)` to free.
    pub fn clear_range(&self, start: Address, bytes: usize) {
        debug_assert!(bytes % ALLOCATION_ALIGNMENT == 0);
        for entry in self.entries(start, bytes >> LOG_ALLOCATION_ALIGNMENT) {
            entry.store(ObjectState::Free as u8, Ordering::Relaxed);
        }
    }
}
