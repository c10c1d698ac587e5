//! Allocation: the thread-local bump fast path, the shared block and
//! superblock free lists behind it, and the large object path.

pub mod block_alloc;
pub mod bump;
pub mod large;

pub use self::block_alloc::BlockAllocator;
pub use self::bump::BumpAllocator;
pub use self::large::LargeAllocator;
