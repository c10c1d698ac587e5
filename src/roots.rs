//! Root enumeration. The mechanism that discovers roots (conservative
//! stack/register capture, a precise shadow stack, a global table) lives in
//! the embedding runtime; the collector only consumes a sequence of raw
//! candidate pointers. Candidates are filtered against heap bounds and the
//! object bytemap before they are traced, so a provider may over-approximate.

use crate::util::Address;
use spin::RwLock;

/// A source of raw candidate root pointers.
pub trait RootProvider: Send + Sync {
    /// Report every candidate pointer to `report`. Called with all mutator
    /// threads other than the collecting one suspended.
    fn scan(&self, report: &mut dyn FnMut(Address));
}

/// Suspends the other mutator threads around the root scan. The collector
/// calls `suspend_all` before enumerating roots and `resume_all` once the
/// mark phase has finished.
pub trait ThreadSuspender: Send + Sync {
    fn suspend_all(&self);
    fn resume_all(&self);
}

/// The default suspender for embeddings with a single mutator thread.
pub struct NoSuspend;

impl ThreadSuspender for NoSuspend {
    fn suspend_all(&self) {}
    fn resume_all(&self) {}
}

/// The registered root providers plus explicitly pinned address ranges
/// (e.g. FFI-pinned regions), which are scanned word by word.
pub struct RootRegistry {
    providers: RwLock<Vec<std::sync::Arc<dyn RootProvider>>>,
    ranges: RwLock<Vec<(Address, Address)>>,
}

impl RootRegistry {
    pub fn new() -> Self {
        Self {
            providers: RwLock::new(Vec::new()),
            ranges: RwLock::new(Vec::new()),
        }
    }

    pub fn add_provider(&self, provider: std::sync::Arc<dyn RootProvider>) {
        self.providers.write().push(provider);
    }

    /// Pin `[start, end)` as a root range. Every word in the range is
    /// treated as a candidate pointer until the range is removed.
    pub fn add_range(&self, start: Address, end: Address) {
        debug_assert!(start <= end);
        self.ranges.write().push((start, end));
    }

    /// Remove a previously pinned range. Removal must match an `add_range`
    /// call exactly.
    pub fn remove_range(&self, start: Address) -> bool {
        let mut ranges = self.ranges.write();
        if let Some(pos) = ranges.iter().position(|(s, _)| *s == start) {
            ranges.swap_remove(pos);
            true
        } else {
            false
        }
    }

    /// Report every candidate root pointer from all providers and ranges.
    pub fn scan_all(&self, report: &mut dyn FnMut(Address)) {
        for provider in self.providers.read().iter() {
            provider.scan(report);
        }
        for (start, end) in self.ranges.read().iter() {
            let mut cursor = *start;
            while cursor < *end {
                let candidate: Address = unsafe { cursor.load() };
                report(candidate);
                cursor += crate::util::constants::BYTES_IN_WORD;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::Mutex;

    struct VecRoots(Mutex<Vec<Address>>);

    impl RootProvider for VecRoots {
        fn scan(&self, report: &mut dyn FnMut(Address)) {
            for root in self.0.lock().unwrap().iter() {
                report(*root);
            }
        }
    }

    #[test]
    fn scan_providers_and_ranges() {
        let registry = RootRegistry::new();
        let a = unsafe { Address::from_usize(0x1000) };
        let b = unsafe { Address::from_usize(0x2000) };
        registry.add_provider(Arc::new(VecRoots(Mutex::new(vec![a, b]))));

        let pinned: [usize; 2] = [0x3000, 0x4000];
        let start = Address::from_ref(&pinned[0]);
        registry.add_range(start, start + std::mem::size_of_val(&pinned));

        let mut seen = Vec::new();
        registry.scan_all(&mut |addr| seen.push(addr.as_usize()));
        assert_eq!(seen, vec![0x1000, 0x2000, 0x3000, 0x4000]);

        assert!(registry.remove_range(start));
        assert!(!registry.remove_range(start));

        let mut seen = Vec::new();
        registry.scan_all(&mut |addr| seen.push(addr.as_usize()));
        assert_eq!(seen, vec![0x1000, 0x2000]);
    }
}
