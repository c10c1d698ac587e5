//! The concurrent sweeper. Worker threads (and, when allocation fails
//! mid-sweep, the mutator) claim disjoint batches of consecutive blocks
//! off an atomic cursor and reclaim them: unmarked simple blocks become
//! free, marked ones get their free-line lists rebuilt, and superblocks
//! are swept at bytemap granularity with fully dead leading and trailing
//! blocks released.
//!
//! Free runs found strictly inside one batch have their full extent known
//! and go straight to the block allocator. A run touching a batch edge
//! may continue in a neighboring batch, so its blocks are only tagged
//! `CoalesceMe`; a single designated thread (whoever wins the try-lock)
//! later walks the swept prefix in address order, merges adjacent tagged
//! runs and registers the result. Sweep is over when the coalescer's
//! cursor reaches the sweep limit; the thread that gets it there runs the
//! post-sweep actions exactly once.

use crate::heap::Heap;
use crate::metadata::block::NO_FREE_LINE;
use crate::metadata::{BlockFlag, FreeLineMeta, ObjectState};
use crate::util::constants::*;
use crate::util::conversions;
use crate::util::region::Region;
use crate::util::Address;
use spin::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Blocks per worker sweep batch.
pub const SWEEP_BATCH_SIZE: usize = 32;
/// Blocks per mutator lazy-sweep batch; small, to bound the allocation
/// stall.
pub const LAZY_SWEEP_BATCH_SIZE: usize = 8;

/// Published sweep progress of a participant that is not mid-batch.
const IDLE: usize = usize::MAX;

pub struct Sweeper {
    /// Next unclaimed block index. May overshoot `limit` once per
    /// late-arriving participant.
    cursor: AtomicUsize,
    /// Block count at sweep start. Blocks grown mid-sweep lie beyond it
    /// and are not touched this cycle.
    limit: AtomicUsize,
    /// Everything below this index has been coalesced.
    coalesce_done: AtomicUsize,
    coalesce_lock: Mutex<()>,
    done: AtomicBool,
    /// Per-participant progress floor: a pre-claim cursor snapshot while
    /// a batch is in flight, `IDLE` otherwise. Slot `threads` belongs to
    /// the lazily sweeping mutator.
    participants: Vec<AtomicUsize>,
}

impl Sweeper {
    pub fn new(participant_count: usize) -> Self {
        Self {
            cursor: AtomicUsize::new(0),
            limit: AtomicUsize::new(0),
            coalesce_done: AtomicUsize::new(0),
            coalesce_lock: Mutex::new(()),
            done: AtomicBool::new(true),
            participants: (0..participant_count).map(|_| AtomicUsize::new(IDLE)).collect(),
        }
    }

    /// Arm a new sweep over `total_blocks`. Runs single-threaded, between
    /// the mark phase and the release of the sweepers.
    pub fn start(&self, total_blocks: usize) {
        debug_assert!(self.is_done(), "collection overlapped an unfinished sweep");
        for slot in &self.participants {
            debug_assert_eq!(slot.load(Ordering::SeqCst), IDLE);
        }
        self.limit.store(total_blocks, Ordering::SeqCst);
        self.cursor.store(0, Ordering::SeqCst);
        self.coalesce_done.store(0, Ordering::SeqCst);
        self.done.store(false, Ordering::SeqCst);
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    /// Claim and sweep one batch. Returns false when no blocks are left
    /// to claim.
    pub fn sweep_batch(&self, heap: &Heap, participant: usize, batch_size: usize) -> bool {
        // Publish a progress floor before claiming so the coalescer can
        // never pass a batch that is still being swept.
        let snapshot = self.cursor.load(Ordering::SeqCst);
        self.participants[participant].store(snapshot, Ordering::SeqCst);
        let from = self.cursor.fetch_add(batch_size, Ordering::SeqCst);
        let limit = self.limit.load(Ordering::SeqCst);
        if from >= limit {
            self.participants[participant].store(IDLE, Ordering::SeqCst);
            return false;
        }
        let to = (from + batch_size).min(limit);
        self.sweep_range(heap, from, to);
        self.participants[participant].store(IDLE, Ordering::SeqCst);
        true
    }

    /// Sweep `[from, to)`. The owner of a superblock starting inside the
    /// range sweeps it to its end even past `to`, but blocks at or beyond
    /// `to` are never registered directly, only tagged for the coalescer.
    fn sweep_range(&self, heap: &Heap, from: usize, to: usize) {
        let mut i = from;
        // Blocks at the batch head owned by the previous batch's
        // superblock sweep, or already tagged for coalescing, are not
        // ours.
        while i < to && skip_at_batch_head(heap.blocks.meta(i as u32).flag()) {
            i += 1;
        }
        let scan_start = i;
        let mut run_start: Option<usize> = None;
        while i < to {
            let meta = heap.blocks.meta(i as u32);
            match meta.flag() {
                // Free before this collection; rediscovered and
                // re-registered like any other free block.
                BlockFlag::Free => {
                    run_start.get_or_insert(i);
                    i += 1;
                }
                // Unmarked: everything in it is dead.
                BlockFlag::Simple => {
                    run_start.get_or_insert(i);
                    i += 1;
                }
                BlockFlag::Marked => {
                    self.close_run(heap, &mut run_start, i, scan_start, to);
                    self.sweep_marked_block(heap, i as u32);
                    i += 1;
                }
                BlockFlag::SuperblockStart => {
                    let run = meta.data() as usize;
                    debug_assert!(run > 0);
                    let outcome = self.sweep_superblock(heap, i as u32, run);
                    match outcome {
                        SuperblockSweep::Dead => {
                            run_start.get_or_insert(i);
                            i += run;
                        }
                        SuperblockSweep::Live { lead, trail } => {
                            if lead > 0 {
                                run_start.get_or_insert(i);
                            }
                            // The live middle bounds whatever run was open.
                            self.close_run(heap, &mut run_start, i + lead, scan_start, to);
                            if trail > 0 {
                                run_start = Some(i + run - trail);
                            }
                            i += run;
                        }
                    }
                }
                flag @ (BlockFlag::SuperblockTail
                | BlockFlag::CoalesceMe
                | BlockFlag::SuperblockStartMe) => {
                    debug_assert!(false, "unowned {:?} block {} mid-batch", flag, i);
                    self.close_run(heap, &mut run_start, i, scan_start, to);
                    i += 1;
                }
            }
        }
        self.close_run(heap, &mut run_start, i, scan_start, to);
    }

    /// Finish the open free run ending (exclusively) at `end`. Interior
    /// runs are registered directly; runs touching the scanned range's
    /// head or tail are tagged for the coalescer.
    fn close_run(
        &self,
        heap: &Heap,
        run_start: &mut Option<usize>,
        end: usize,
        scan_start: usize,
        batch_end: usize,
    ) {
        let Some(start) = run_start.take() else { return };
        debug_assert!(end > start);
        for index in start..end {
            let block = heap.blocks.block_at(index as u32);
            heap.bytemap.clear_range(block.start(), BYTES_IN_BLOCK);
        }
        let touches_edge = start == scan_start || end >= batch_end;
        if touches_edge {
            for index in start..end {
                heap.blocks.meta(index as u32).set_flag(BlockFlag::CoalesceMe);
            }
        } else {
            heap.block_alloc
                .add_free_blocks(&heap.blocks, start as u32, end - start);
        }
    }

    /// Flip-mark one marked simple block and rebuild its free-line list.
    fn sweep_marked_block(&self, heap: &Heap, index: u32) {
        let block = heap.blocks.block_at(index);
        let entries = heap.bytemap.entries(block.start(), GRANULES_IN_BLOCK);
        for entry in entries {
            match ObjectState::from(entry.load(Ordering::Relaxed)) {
                ObjectState::Marked => {
                    entry.store(ObjectState::Allocated as u8, Ordering::Relaxed)
                }
                ObjectState::Allocated => entry.store(ObjectState::Free as u8, Ordering::Relaxed),
                ObjectState::Placeholder => {
                    entry.store(ObjectState::Free as u8, Ordering::Relaxed)
                }
                ObjectState::Free => {}
            }
        }

        // Walk the lines backwards so each hole can point at the next one
        // as it is written. Line marks are consumed here; the next mark
        // phase starts from a clean slate.
        let mut first_free: u32 = NO_FREE_LINE;
        let mut hole_size: u32 = 0;
        for line_index in (0..LINES_IN_BLOCK).rev() {
            let line = crate::metadata::Line::from_aligned_address(block.line(line_index));
            if heap.lines.is_marked(line) {
                heap.lines.clear(line);
                if hole_size > 0 {
                    let hole_start = block.line(line_index + 1);
                    unsafe {
                        FreeLineMeta::write(
                            hole_start,
                            FreeLineMeta {
                                next: first_free,
                                size: hole_size,
                            },
                        )
                    };
                    first_free = line_index as u32 + 1;
                    hole_size = 0;
                }
            } else {
                hole_size += 1;
            }
        }
        if hole_size > 0 {
            unsafe {
                FreeLineMeta::write(
                    block.line(0),
                    FreeLineMeta {
                        next: first_free,
                        size: hole_size,
                    },
                )
            };
            first_free = 0;
        }

        let meta = heap.blocks.meta(index);
        meta.set_data(first_free);
        meta.set_flag(BlockFlag::Simple);
        if first_free != NO_FREE_LINE {
            heap.block_alloc.push_recycled(&heap.blocks, index);
        }
    }

    /// Sweep one superblock at bytemap granularity. Interior free gaps of
    /// chunk size or more are re-listed with the large allocator; fully
    /// dead leading and trailing blocks are reported back for release.
    fn sweep_superblock(&self, heap: &Heap, index: u32, run: usize) -> SuperblockSweep {
        let start = heap.blocks.block_at(index).start();
        let end = start + run * BYTES_IN_BLOCK;

        // Flip pass: demote marked objects, drop dead ones and forget old
        // chunk headers.
        let mut cursor = start;
        let mut first_live: Option<Address> = None;
        let mut last_live_end = start;
        while cursor < end {
            match heap.bytemap.get(cursor) {
                ObjectState::Marked => {
                    heap.bytemap.set(cursor, ObjectState::Allocated);
                    let size =
                        conversions::raw_align_up(heap.model.size(cursor), ALLOCATION_ALIGNMENT);
                    first_live.get_or_insert(cursor);
                    last_live_end = cursor + size;
                    cursor = last_live_end;
                }
                ObjectState::Allocated => {
                    let size =
                        conversions::raw_align_up(heap.model.size(cursor), ALLOCATION_ALIGNMENT);
                    heap.bytemap.set(cursor, ObjectState::Free);
                    cursor += size;
                }
                ObjectState::Placeholder => {
                    let size = heap.large.chunk_size(cursor);
                    heap.bytemap.set(cursor, ObjectState::Free);
                    cursor += size;
                }
                ObjectState::Free => cursor += ALLOCATION_ALIGNMENT,
            }
        }

        let Some(first_live) = first_live else {
            return SuperblockSweep::Dead;
        };

        let middle_start = conversions::block_align_down(first_live);
        let middle_end = last_live_end.align_up(BYTES_IN_BLOCK);
        let lead = (middle_start - start) >> LOG_BYTES_IN_BLOCK;
        let trail = (end - middle_end) >> LOG_BYTES_IN_BLOCK;
        let middle_run = run - lead - trail;

        // Chunk pass over the retained middle.
        let mut cursor = middle_start;
        let mut gap_start = middle_start;
        while cursor < middle_end {
            match heap.bytemap.get(cursor) {
                ObjectState::Allocated => {
                    self.list_gap(heap, gap_start, cursor);
                    let size =
                        conversions::raw_align_up(heap.model.size(cursor), ALLOCATION_ALIGNMENT);
                    cursor += size;
                    gap_start = cursor;
                }
                ObjectState::Free => cursor += ALLOCATION_ALIGNMENT,
                state => {
                    debug_assert!(false, "{:?} granule after flip pass", state);
                    cursor += ALLOCATION_ALIGNMENT;
                }
            }
        }
        self.list_gap(heap, gap_start, middle_end);

        // Retag the retained middle. A shrunken superblock whose start
        // moved gets the transitional tag; the coalescer promotes it once
        // the blocks before it are settled.
        let new_start = index + lead as u32;
        let start_meta = heap.blocks.meta(new_start);
        if lead == 0 {
            start_meta.set_data(middle_run as u32);
        } else {
            start_meta.set_data(middle_run as u32);
            start_meta.set_flag(BlockFlag::SuperblockStartMe);
        }
        for tail in 1..middle_run {
            heap.blocks.meta(new_start + tail as u32).set_data(new_start);
        }

        SuperblockSweep::Live { lead, trail }
    }

    fn list_gap(&self, heap: &Heap, gap_start: Address, gap_end: Address) {
        if gap_end > gap_start && gap_end - gap_start >= LARGE_OBJECT_THRESHOLD {
            heap.large
                .push_chunk(&heap.bytemap, gap_start, gap_end - gap_start);
        }
    }

    /// Merge and register `CoalesceMe` runs in the fully swept prefix.
    /// Only one thread coalesces at a time; everyone else returns
    /// immediately. The thread that advances the coalescing cursor to the
    /// sweep limit also runs the one-time sweep-done actions.
    pub fn lazy_coalesce(&self, heap: &Heap) {
        let Some(_guard) = self.coalesce_lock.try_lock() else {
            return;
        };
        if self.is_done() {
            return;
        }
        let sweep_limit = self.limit.load(Ordering::SeqCst);
        // The cursor must be read before the participant slots: a batch
        // claimed after this read starts at or beyond it.
        let mut scan_limit = self.cursor.load(Ordering::SeqCst).min(sweep_limit);
        for slot in &self.participants {
            scan_limit = scan_limit.min(slot.load(Ordering::SeqCst));
        }

        let mut i = self.coalesce_done.load(Ordering::SeqCst);
        let mut run_start: Option<usize> = None;
        while i < scan_limit {
            let meta = heap.blocks.meta(i as u32);
            match meta.flag() {
                BlockFlag::CoalesceMe => {
                    run_start.get_or_insert(i);
                }
                flag => {
                    if let Some(start) = run_start.take() {
                        heap.block_alloc
                            .extend_coalescing(&heap.blocks, start as u32, i - start);
                    }
                    if flag == BlockFlag::SuperblockStartMe {
                        meta.set_flag(BlockFlag::SuperblockStart);
                    }
                }
            }
            i += 1;
        }
        if let Some(start) = run_start.take() {
            // The run may continue into the unswept region; the anchor
            // keeps it extendable until something non-adjacent arrives.
            heap.block_alloc
                .extend_coalescing(&heap.blocks, start as u32, scan_limit - start);
        }
        self.coalesce_done.store(scan_limit, Ordering::SeqCst);

        if scan_limit >= sweep_limit && !self.done.swap(true, Ordering::SeqCst) {
            heap.block_alloc.flush_coalescing(&heap.blocks);
            heap.block_alloc.replenish_reserve(&heap.blocks);
            heap.sweep_finished();
        }
    }
}

enum SuperblockSweep {
    /// No live object: the whole run is free.
    Dead,
    /// Live middle retained; `lead` and `trail` whole blocks released.
    Live { lead: usize, trail: usize },
}

fn skip_at_batch_head(flag: BlockFlag) -> bool {
    matches!(
        flag,
        BlockFlag::SuperblockTail | BlockFlag::CoalesceMe | BlockFlag::SuperblockStartMe
    )
}

const_assert!(SWEEP_BATCH_SIZE > LAZY_SWEEP_BATCH_SIZE);
