//! Heap geometry constants. The heap is carved into fixed-size blocks,
//! blocks into lines, and liveness is tracked per 16-byte granule.

/// log2 of the number of bits in a byte
pub const LOG_BITS_IN_BYTE: u8 = 3;
/// The number of bits in a byte
pub const BITS_IN_BYTE: usize = 1 << LOG_BITS_IN_BYTE;

/// log2 of the number of bytes in a kilobyte
pub const LOG_BYTES_IN_KBYTE: u8 = 10;
/// The number of bytes in a kilobyte
pub const BYTES_IN_KBYTE: usize = 1 << LOG_BYTES_IN_KBYTE;

/// log2 of the number of bytes in a megabyte
pub const LOG_BYTES_IN_MBYTE: u8 = 20;
/// The number of bytes in a megabyte
pub const BYTES_IN_MBYTE: usize = 1 << LOG_BYTES_IN_MBYTE;

/// log2 of the number of bytes in an address
#[cfg(target_pointer_width = "64")]
pub const LOG_BYTES_IN_ADDRESS: usize = 3;
/// The number of bytes in an address
pub const BYTES_IN_ADDRESS: usize = 1 << LOG_BYTES_IN_ADDRESS;

/// log2 of the number of bytes in a word
pub const LOG_BYTES_IN_WORD: usize = LOG_BYTES_IN_ADDRESS;
/// The number of bytes in a word
pub const BYTES_IN_WORD: usize = 1 << LOG_BYTES_IN_WORD;

/// log2 of the number of bytes in a page
pub const LOG_BYTES_IN_PAGE: usize = 12;
/// The number of bytes in a page
pub const BYTES_IN_PAGE: usize = 1 << LOG_BYTES_IN_PAGE;

/// log2 of the number of bytes in a block, the unit of allocation bookkeeping.
pub const LOG_BYTES_IN_BLOCK: usize = 15;
/// The number of bytes in a block (32 KiB).
pub const BYTES_IN_BLOCK: usize = 1 << LOG_BYTES_IN_BLOCK;

/// log2 of the number of bytes in a line, the unit of partial-block reuse.
pub const LOG_BYTES_IN_LINE: usize = 8;
/// The number of bytes in a line (256 B).
pub const BYTES_IN_LINE: usize = 1 << LOG_BYTES_IN_LINE;

/// log2 of the number of lines in a block
pub const LOG_LINES_IN_BLOCK: usize = LOG_BYTES_IN_BLOCK - LOG_BYTES_IN_LINE;
/// The number of lines in a block
pub const LINES_IN_BLOCK: usize = 1 << LOG_LINES_IN_BLOCK;

/// log2 of the allocation alignment. Every object start is aligned to this,
/// and the object bytemap holds one byte per granule of this size.
pub const LOG_ALLOCATION_ALIGNMENT: usize = 4;
/// The allocation alignment (16 B).
pub const ALLOCATION_ALIGNMENT: usize = 1 << LOG_ALLOCATION_ALIGNMENT;

/// The number of bytemap granules in a line
pub const GRANULES_IN_LINE: usize = BYTES_IN_LINE / ALLOCATION_ALIGNMENT;
/// The number of bytemap granules in a block
pub const GRANULES_IN_BLOCK: usize = BYTES_IN_BLOCK / ALLOCATION_ALIGNMENT;

/// Objects of this size or larger bypass block bump allocation and go to the
/// large object allocator, which places them in multi-block superblocks.
pub const LARGE_OBJECT_THRESHOLD: usize = 8 * BYTES_IN_KBYTE;

/// The minimal object size in bytes. One granule.
pub const MIN_OBJECT_SIZE: usize = ALLOCATION_ALIGNMENT;

/// The hard floor for the configured minimum heap size.
pub const MIN_HEAP_SIZE: usize = BYTES_IN_MBYTE;

const_assert!(BYTES_IN_LINE % ALLOCATION_ALIGNMENT == 0);
const_assert!(BYTES_IN_BLOCK % BYTES_IN_LINE == 0);
const_assert!(LARGE_OBJECT_THRESHOLD > BYTES_IN_LINE);
const_assert!(LARGE_OBJECT_THRESHOLD <= BYTES_IN_BLOCK);
const_assert!(MIN_HEAP_SIZE >= BYTES_IN_BLOCK);
