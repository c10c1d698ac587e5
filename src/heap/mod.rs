//! The heap: one per process. Owns the reserved object range, the
//! parallel metadata arenas, the allocators, the marker and sweeper state
//! and the phase machinery. The full address range for the maximum heap
//! size is reserved at init (without physical commit), so growth is just
//! an atomic bump of the committed-block count plus registering the new
//! blocks as free; nothing ever moves and no table is ever reallocated.

pub mod phase;
pub mod worker;

use crate::alloc::{BlockAllocator, LargeAllocator};
use crate::marker::packet::PacketArena;
use crate::marker::{desired_workers, Marker};
use crate::metadata::{BlockFlag, BlockMetaTable, Bytemap, LineMetaTable, ObjectState};
use crate::object_model::ObjectModel;
use crate::roots::{RootRegistry, ThreadSuspender};
use crate::stats::{self, Stats};
use crate::sweeper::{Sweeper, SWEEP_BATCH_SIZE};
use crate::util::constants::*;
use crate::util::conversions;
use crate::util::memory::Mapping;
use crate::util::options::Options;
use crate::util::Address;
use enum_map::EnumMap;
use phase::{Phase, PhaseControl};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Grow by 2x below this committed size, by 1.3x above it.
const EARLY_GROWTH_LIMIT: usize = 512 * BYTES_IN_MBYTE;
const EARLY_GROWTH_FACTOR: f64 = 2.0;
const LATE_GROWTH_FACTOR: f64 = 1.3;
/// Cap on the fraction of committed blocks that are neither free nor
/// recyclable before the heap grows anyway.
const MAX_UNAVAILABLE_RATIO: f64 = 0.9;

/// One grey packet per this many blocks, plus a fixed floor for roots.
const BLOCKS_PER_PACKET: usize = 8;
const MIN_PACKETS: usize = 64;

pub struct Heap {
    pub(crate) options: Options,
    _heap_mapping: Mapping,
    _meta_mapping: Mapping,
    start: Address,
    max_blocks: usize,
    committed: AtomicUsize,

    pub(crate) blocks: BlockMetaTable,
    pub(crate) lines: LineMetaTable,
    pub(crate) bytemap: Bytemap,
    pub(crate) block_alloc: BlockAllocator,
    pub(crate) large: LargeAllocator,
    pub(crate) marker: Marker,
    pub(crate) sweeper: Sweeper,
    pub(crate) phase: PhaseControl,
    pub(crate) roots: RootRegistry,
    pub(crate) model: Arc<dyn ObjectModel>,
    pub(crate) suspender: Arc<dyn ThreadSuspender>,
    pub(crate) stats: Option<Stats>,

    /// Serializes collection cycles.
    collect_lock: Mutex<()>,
    /// Serializes growth; collection may run concurrently with growth.
    growth_lock: Mutex<()>,
    /// Arbitrates the mutator-side sweep participant slot.
    lazy_slot: spin::Mutex<()>,
    /// Completed collection count; mutators compare it to drop stale bump
    /// cursors after a cycle rebuilt their holes.
    collections: AtomicUsize,
    last_mark_nanos: AtomicU64,
    last_cycle_end_nanos: AtomicU64,
}

impl Heap {
    /// Map the heap and all metadata and seed the free lists with the
    /// initial heap size. Fatal configuration errors never return.
    pub fn new(options: Options, model: Arc<dyn ObjectModel>, suspender: Arc<dyn ThreadSuspender>) -> Heap {
        if let Err(message) = options.validate() {
            error!("invalid configuration: {}", message);
            std::process::exit(1);
        }

        let max_bytes = conversions::raw_align_up(options.max_heap_size.0, BYTES_IN_BLOCK);
        let max_blocks = conversions::bytes_to_blocks_up(max_bytes);
        let initial_blocks =
            conversions::bytes_to_blocks_up(options.min_heap_size.0).min(max_blocks);

        let heap_mapping = match Mapping::reserve(max_bytes + BYTES_IN_BLOCK) {
            Ok(mapping) => mapping,
            Err(e) => {
                error!("cannot reserve {} heap bytes: {}", max_bytes, e);
                std::process::exit(1);
            }
        };
        let start = heap_mapping.start().align_up(BYTES_IN_BLOCK);

        let bytemap_bytes = Bytemap::table_size(max_bytes);
        let block_meta_bytes = BlockMetaTable::table_size(max_blocks);
        let line_meta_bytes = LineMetaTable::table_size(max_bytes);
        let packet_count = (max_blocks / BLOCKS_PER_PACKET + MIN_PACKETS) as u32;
        let packet_bytes = PacketArena::bytes_for(packet_count as usize);
        let meta_bytes = bytemap_bytes + block_meta_bytes + line_meta_bytes + packet_bytes;
        let meta_mapping = match Mapping::reserve(meta_bytes) {
            Ok(mapping) => mapping,
            Err(e) => {
                error!("cannot reserve {} metadata bytes: {}", meta_bytes, e);
                std::process::exit(1);
            }
        };
        let meta_base = meta_mapping.start();
        let bytemap = Bytemap::new(start, meta_base, max_bytes >> LOG_ALLOCATION_ALIGNMENT);
        let blocks = BlockMetaTable::new(start, meta_base + bytemap_bytes, max_blocks);
        let lines = LineMetaTable::new(
            start,
            meta_base + bytemap_bytes + block_meta_bytes,
            max_bytes >> LOG_BYTES_IN_LINE,
        );
        let arena = PacketArena::new(
            meta_base + bytemap_bytes + block_meta_bytes + line_meta_bytes,
            packet_count,
        );

        let block_alloc = BlockAllocator::new();
        block_alloc.add_free_blocks(&blocks, 0, initial_blocks);

        info!(
            "heap init: {} blocks committed of {} reserved, {} grey packets, {} worker threads",
            initial_blocks, max_blocks, packet_count, options.threads
        );

        let stats = if options.stats_file.is_empty() {
            None
        } else {
            match Stats::open(&options.stats_file) {
                Ok(stats) => Some(stats),
                Err(e) => {
                    warn!("cannot open stats file {}: {}", options.stats_file, e);
                    None
                }
            }
        };

        let sweeper = Sweeper::new(options.threads + 1);
        Heap {
            large: LargeAllocator::new(start),
            marker: Marker::new(arena),
            sweeper,
            phase: PhaseControl::new(),
            roots: RootRegistry::new(),
            model,
            suspender,
            stats,
            collect_lock: Mutex::new(()),
            growth_lock: Mutex::new(()),
            lazy_slot: spin::Mutex::new(()),
            collections: AtomicUsize::new(0),
            last_mark_nanos: AtomicU64::new(0),
            last_cycle_end_nanos: AtomicU64::new(0),
            start,
            max_blocks,
            committed: AtomicUsize::new(initial_blocks),
            blocks,
            lines,
            bytemap,
            block_alloc,
            _heap_mapping: heap_mapping,
            _meta_mapping: meta_mapping,
            options,
        }
    }

    pub fn heap_start(&self) -> Address {
        self.start
    }

    pub fn committed_blocks(&self) -> usize {
        self.committed.load(Ordering::Acquire)
    }

    pub fn committed_bytes(&self) -> usize {
        conversions::blocks_to_bytes(self.committed_blocks())
    }

    pub fn collections(&self) -> usize {
        self.collections.load(Ordering::Acquire)
    }

    pub fn roots(&self) -> &RootRegistry {
        &self.roots
    }

    pub fn current_phase(&self) -> Phase {
        self.phase.current()
    }

    pub fn free_blocks(&self) -> usize {
        self.block_alloc.free_block_count()
    }

    /// The bytemap state of the granule at `addr`. Only meaningful for
    /// addresses the embedding obtained from the allocator.
    pub fn object_state(&self, addr: Address) -> ObjectState {
        debug_assert!(self.contains(addr));
        self.bytemap.get(addr)
    }

    /// Whether `addr` lies within the committed heap range.
    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.start && addr < self.start + self.committed_bytes()
    }

    /// Run one full collection cycle: finish any unfinished sweep, mark
    /// with the calling thread as master, then arm the sweep and hand it
    /// to the worker pool. Returns once sweeping is underway; allocation
    /// proceeds concurrently with it.
    pub fn collect(&self) {
        let _guard = self.collect_lock.lock().unwrap();
        self.finish_sweep();

        self.collections.fetch_add(1, Ordering::SeqCst);
        self.suspender.suspend_all();
        self.phase.request(Phase::Mark, 1);

        let (_, mark_start, mark_nanos) = stats::timed(|| {
            self.marker.mark_roots(self);
            // Markers are the calling thread (master, id 0) plus eligible
            // pool workers (ids 1..=threads).
            self.phase.set_worker_target(desired_workers(
                self.marker.full_backlog(),
                self.options.threads + 1,
            ));
            self.marker.mark_loop(self, 0);
        });
        debug_assert!(self.marker.is_done());
        self.last_mark_nanos.store(mark_nanos, Ordering::SeqCst);
        if let Some(stats) = &self.stats {
            stats.record("mark", 0, mark_start, mark_nanos);
        }

        self.block_alloc.clear_for_sweep();
        self.large.clear();
        self.sweeper.start(self.committed_blocks());
        self.phase.request(Phase::Sweep, self.options.threads);
        self.suspender.resume_all();
        debug!("collection {}: marked in {} ns", self.collections(), mark_nanos);
    }

    /// Drive an in-progress sweep to completion from the calling thread,
    /// using the mutator participant slot.
    fn finish_sweep(&self) {
        let _slot = self.lazy_slot.lock();
        while !self.sweeper.is_done() {
            if self.sweeper.sweep_batch(self, 0, SWEEP_BATCH_SIZE) {
                self.sweeper.lazy_coalesce(self);
            } else {
                // Another participant owns the last batches.
                self.sweeper.lazy_coalesce(self);
                std::thread::yield_now();
            }
        }
    }

    /// Bounded mutator-side sweeping: claim small batches until the block
    /// allocator has something to hand out or the sweep runs dry. The
    /// mutator participant slot is shared; a loser just yields and retries
    /// its allocation.
    pub(crate) fn help_sweep(&self) {
        use crate::sweeper::LAZY_SWEEP_BATCH_SIZE;
        if self.phase.current() != Phase::Sweep {
            return;
        }
        let Some(_slot) = self.lazy_slot.try_lock() else {
            std::thread::yield_now();
            return;
        };
        while !self.sweeper.is_done() {
            let swept = self.sweeper.sweep_batch(self, 0, LAZY_SWEEP_BATCH_SIZE);
            self.sweeper.lazy_coalesce(self);
            if !swept {
                return;
            }
            if self.block_alloc.free_block_count() > 0
                || self.block_alloc.recycled_block_count() > 0
            {
                return;
            }
        }
    }

    /// One-time post-sweep actions, run by whichever thread completed the
    /// coalesce. The reserve has already been replenished by the caller.
    pub(crate) fn sweep_finished(&self) {
        let now = stats::now_nanos();
        if self.should_grow() {
            let committed = self.committed_blocks();
            let target = self.growth_target(committed);
            if target > committed {
                self.grow(target - committed);
            }
        }
        self.last_cycle_end_nanos.store(now, Ordering::SeqCst);
        #[cfg(feature = "extreme_assertions")]
        self.verify_block_states();
        self.phase.request(Phase::Idle, 0);
        if let Some(stats) = &self.stats {
            stats.flush();
        }
        info!(
            "sweep finished: {} free / {} recycled / {} committed blocks",
            self.block_alloc.free_block_count(),
            self.block_alloc.recycled_block_count(),
            self.committed_blocks()
        );
    }

    /// The growth heuristic, evaluated once per cycle after sweeping.
    fn should_grow(&self) -> bool {
        let committed = self.committed_blocks();
        if committed >= self.max_blocks {
            return false;
        }
        let free = self.block_alloc.free_block_count();
        let recycled = self.block_alloc.recycled_block_count();
        let free_ratio = free as f64 / committed as f64;
        if free_ratio < self.options.min_free_ratio as f64 {
            return true;
        }
        let unavailable_ratio = (committed - free - recycled) as f64 / committed as f64;
        if unavailable_ratio > MAX_UNAVAILABLE_RATIO {
            return true;
        }
        let cycle_start = self.last_cycle_end_nanos.load(Ordering::SeqCst);
        let elapsed = stats::now_nanos().saturating_sub(cycle_start);
        let mark = self.last_mark_nanos.load(Ordering::SeqCst);
        elapsed > 0 && (mark as f64 / elapsed as f64) > self.options.mark_time_ratio as f64
    }

    fn growth_target(&self, committed: usize) -> usize {
        let factor = if conversions::blocks_to_bytes(committed) < EARLY_GROWTH_LIMIT {
            EARLY_GROWTH_FACTOR
        } else {
            LATE_GROWTH_FACTOR
        };
        (((committed as f64) * factor) as usize).min(self.max_blocks)
    }

    /// Commit `blocks` more blocks if headroom allows. Returns the number
    /// actually added.
    pub(crate) fn grow(&self, blocks: usize) -> usize {
        let _guard = self.growth_lock.lock().unwrap();
        let committed = self.committed_blocks();
        let added = blocks.min(self.max_blocks - committed);
        if added == 0 {
            return 0;
        }
        // New blocks become visible to `contains` only after their
        // metadata is clear and they are in the free lists.
        self.block_alloc
            .add_free_blocks(&self.blocks, committed as u32, added);
        self.committed.store(committed + added, Ordering::SeqCst);
        info!("heap grown by {} blocks to {}", added, committed + added);
        added
    }

    /// Grow by at least `blocks` or terminate: allocation has already
    /// failed after a full collection, so running out of headroom here is
    /// an out-of-memory condition.
    pub(crate) fn grow_or_die(&self, blocks: usize) {
        let committed = self.committed_blocks();
        let target = self.growth_target(committed).max(committed + blocks);
        if self.grow(target - committed) < blocks {
            self.out_of_memory(conversions::blocks_to_bytes(blocks));
        }
    }

    pub(crate) fn out_of_memory(&self, needed: usize) -> ! {
        error!(
            "out of memory: need {} more bytes, heap at {} of {} max bytes",
            needed,
            self.committed_bytes(),
            conversions::blocks_to_bytes(self.max_blocks)
        );
        error!("{}", std::backtrace::Backtrace::force_capture());
        std::process::exit(1);
    }

    /// After a sweep no transitional tag may survive and every committed
    /// block must carry exactly one flag.
    #[cfg(feature = "extreme_assertions")]
    fn verify_block_states(&self) {
        let census = self.block_census();
        assert_eq!(census.values().sum::<usize>(), self.committed_blocks());
        assert_eq!(census[BlockFlag::CoalesceMe], 0);
        assert_eq!(census[BlockFlag::SuperblockStartMe], 0);
        assert_eq!(census[BlockFlag::Marked], 0);
    }

    /// Count committed blocks by state. Superblock interiors count as
    /// tails. Meaningful at quiescent points only.
    pub fn block_census(&self) -> EnumMap<BlockFlag, usize> {
        let mut census = EnumMap::default();
        for index in 0..self.committed_blocks() {
            census[self.blocks.meta(index as u32).flag()] += 1;
        }
        census
    }
}
