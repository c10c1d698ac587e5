//! The memory-mapping substrate. The collector reserves large virtual
//! address ranges up front without committing physical memory; pages are
//! committed lazily by the OS on first touch. Nothing here is unmapped
//! until the owning mapping is dropped.

use crate::util::Address;
use std::io::Result;

/// An anonymous virtual memory reservation. Unmapped on drop.
pub struct Mapping {
    start: Address,
    size: usize,
}

impl Mapping {
    /// Reserve `size` bytes of zeroed anonymous memory without committing
    /// physical pages (`MAP_NORESERVE`). The returned range is readable and
    /// writable; the OS commits pages on first touch.
    pub fn reserve(size: usize) -> Result<Mapping> {
        let prot = libc::PROT_READ | libc::PROT_WRITE;
        let flags = libc::MAP_ANON | libc::MAP_PRIVATE | libc::MAP_NORESERVE;
        let ptr = unsafe { libc::mmap(std::ptr::null_mut(), size, prot, flags, -1, 0) };
        if ptr == libc::MAP_FAILED {
            return Err(std::io::Error::last_os_error());
        }
        Ok(Mapping {
            start: Address::from_mut_ptr(ptr),
            size,
        })
    }

    pub fn start(&self) -> Address {
        self.start
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        let result = unsafe { libc::munmap(self.start.to_mut_ptr(), self.size) };
        debug_assert_eq!(result, 0, "munmap failed: {}", self.start);
    }
}

// The mapping hands out raw addresses; all access synchronization happens
// at the metadata level above this substrate.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

/// Zero a memory region.
pub fn zero(start: Address, len: usize) {
    unsafe {
        std::ptr::write_bytes::<u8>(start.to_mut_ptr(), 0, len);
    }
}
