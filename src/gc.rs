//! The public collector handle and the per-thread mutator interface.

use crate::alloc::BumpAllocator;
use crate::heap::worker::WorkerPool;
use crate::heap::Heap;
use crate::object_model::ObjectModel;
use crate::roots::{NoSuspend, RootRegistry, ThreadSuspender};
use crate::util::constants::*;
use crate::util::conversions;
use crate::util::options::Options;
use crate::util::{logger, Address};
use std::sync::Arc;

/// One garbage-collected heap plus its worker pool. Create exactly one
/// per process; hand each allocating thread a [`Mutator`].
pub struct Gc {
    heap: Arc<Heap>,
    workers: Option<WorkerPool>,
}

impl Gc {
    /// Initialize the heap for a single-mutator embedding (no thread
    /// suspension needed before root scans).
    pub fn new(model: Arc<dyn ObjectModel>, options: Options) -> Gc {
        Self::with_suspender(model, Arc::new(NoSuspend), options)
    }

    /// Initialize the heap with a runtime-provided suspension service for
    /// multithreaded embeddings.
    pub fn with_suspender(
        model: Arc<dyn ObjectModel>,
        suspender: Arc<dyn ThreadSuspender>,
        options: Options,
    ) -> Gc {
        let _ = logger::try_init();
        let heap = Arc::new(Heap::new(options, model, suspender));
        let workers = WorkerPool::spawn(&heap);
        Gc {
            heap,
            workers: Some(workers),
        }
    }

    pub fn mutator(&self) -> Mutator {
        Mutator {
            heap: Arc::clone(&self.heap),
            bump: BumpAllocator::new(),
            collections_seen: self.heap.collections(),
        }
    }

    /// Force a full collection cycle from this thread.
    pub fn collect(&self) {
        self.heap.collect();
    }

    pub fn roots(&self) -> &RootRegistry {
        self.heap.roots()
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }
}

impl Drop for Gc {
    fn drop(&mut self) {
        if let Some(workers) = self.workers.take() {
            workers.shutdown(&self.heap);
        }
    }
}

/// A thread's allocation interface. Not shareable: the bump state is
/// deliberately unsynchronized.
pub struct Mutator {
    heap: Arc<Heap>,
    bump: BumpAllocator,
    /// Collection count this mutator's cursors are valid for.
    collections_seen: usize,
}

impl Mutator {
    /// Allocate `size` zeroed bytes. Never returns null: the slow path
    /// sweeps, collects and grows as needed, and an unsatisfiable request
    /// terminates the process.
    pub fn alloc(&mut self, size: usize) -> Address {
        let size = conversions::raw_align_up(size.max(MIN_OBJECT_SIZE), ALLOCATION_ALIGNMENT);
        if size >= LARGE_OBJECT_THRESHOLD {
            self.alloc_large(size)
        } else {
            self.alloc_small(size)
        }
    }

    fn alloc_small(&mut self, size: usize) -> Address {
        let mut attempt = 0;
        loop {
            self.sync_cursors();
            if let Some(object) = self.bump.try_alloc(
                size,
                &self.heap.bytemap,
                &self.heap.blocks,
                &self.heap.block_alloc,
            ) {
                return object;
            }
            self.recover(1, &mut attempt);
        }
    }

    fn alloc_large(&mut self, size: usize) -> Address {
        let blocks_needed = conversions::bytes_to_blocks_up(size);
        let mut attempt = 0;
        loop {
            self.sync_cursors();
            if let Some(object) = self.heap.large.alloc(
                size,
                &self.heap.bytemap,
                &self.heap.blocks,
                &self.heap.block_alloc,
            ) {
                return object;
            }
            self.recover(blocks_needed, &mut attempt);
        }
    }

    /// Escalating allocation recovery: help an in-progress sweep, then run
    /// a full collection, then grow until the request fits or the heap
    /// hits its maximum.
    fn recover(&mut self, blocks_needed: usize, attempt: &mut usize) {
        match *attempt {
            0 => self.heap.help_sweep(),
            1 => {
                self.heap.collect();
                self.heap.help_sweep();
            }
            _ => self.heap.grow_or_die(blocks_needed),
        }
        *attempt += 1;
    }

    /// Drop bump cursors that predate the latest collection; the sweeper
    /// has rebuilt the holes they pointed into.
    fn sync_cursors(&mut self) {
        let collections = self.heap.collections();
        if collections != self.collections_seen {
            self.bump.reset();
            self.collections_seen = collections;
        }
    }
}
