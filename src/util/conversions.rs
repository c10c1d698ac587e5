use crate::util::constants::*;
use crate::util::Address;

/* Alignment */

pub fn block_align_down(address: Address) -> Address {
    address.align_down(BYTES_IN_BLOCK)
}

pub fn is_block_aligned(address: Address) -> bool {
    address.is_aligned_to(BYTES_IN_BLOCK)
}

pub const fn raw_align_up(val: usize, align: usize) -> usize {
    // See https://github.com/rust-lang/rust/blob/e620d0f337d0643c757bab791fc7d88d63217704/src/libcore/alloc.rs#L192
    val.wrapping_add(align).wrapping_sub(1) & !align.wrapping_sub(1)
}

pub const fn raw_align_down(val: usize, align: usize) -> usize {
    val & !align.wrapping_sub(1)
}

pub const fn raw_is_aligned(val: usize, align: usize) -> bool {
    val & align.wrapping_sub(1) == 0
}

/* Conversion */

pub const fn blocks_to_bytes(blocks: usize) -> usize {
    blocks << LOG_BYTES_IN_BLOCK
}

pub const fn bytes_to_blocks_up(bytes: usize) -> usize {
    (bytes + BYTES_IN_BLOCK - 1) >> LOG_BYTES_IN_BLOCK
}

pub const fn bytes_to_blocks_down(bytes: usize) -> usize {
    bytes >> LOG_BYTES_IN_BLOCK
}

pub const fn bytes_to_granules_up(bytes: usize) -> usize {
    (bytes + ALLOCATION_ALIGNMENT - 1) >> LOG_ALLOCATION_ALIGNMENT
}
