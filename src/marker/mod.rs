//! The parallel marker. Roots seed grey packets; marker threads pop full
//! packets, trace every object in them, and push newly greyed objects into
//! an "out" packet that joins the full list when it fills. The phase is
//! over when every packet has drained back into the empty list.
//!
//! Two mechanisms bound tail latency: large arrays are split into range
//! packets so no single packet carries more than a bounded slice of
//! elements, and a marker that has already traced a lot of work out of one
//! packet gives half of the packet's remaining items away.

pub mod packet;

use crate::heap::Heap;
use crate::metadata::BlockFlag;
use crate::object_model::ObjectLayout;
use crate::util::constants::*;
use crate::util::Address;
use crossbeam::utils::Backoff;
use packet::{GreyList, PacketArena, PacketKind, PACKET_CAPACITY};

/// Arrays longer than this are not traced inline but cut into range
/// packets.
pub const ARRAY_SPLIT_THRESHOLD: usize = 2048;
/// Elements per range packet slice.
pub const RANGE_BATCH: usize = 1024;
/// Fields traced out of one packet before half of its remaining items are
/// given away.
const WORK_SPLIT_THRESHOLD: usize = 4 * PACKET_CAPACITY;

/// How many marker threads a backlog of full packets deserves.
pub fn desired_workers(backlog: usize, max_workers: usize) -> usize {
    backlog.clamp(1, max_workers)
}

/// Per-thread marking state. The overflow vector is an emergency buffer
/// used only when every packet in the arena is full or in flight.
struct MarkContext {
    out: Option<u32>,
    overflow: Vec<Address>,
    work: usize,
}

pub struct Marker {
    arena: PacketArena,
    empty: GreyList,
    full: GreyList,
}

impl Marker {
    pub fn new(arena: PacketArena) -> Self {
        let empty = GreyList::new();
        for index in 0..arena.count() {
            empty.push(&arena, index);
        }
        Self {
            arena,
            empty,
            full: GreyList::new(),
        }
    }

    /// All packets are back in the empty list: nothing is grey.
    pub fn is_done(&self) -> bool {
        self.empty.size() == self.arena.count()
    }

    pub fn full_backlog(&self) -> usize {
        self.full.size() as usize
    }

    /// Seed the trace from the registered root providers. Candidates must
    /// be granule-aligned addresses of object starts; anything else is
    /// skipped.
    pub fn mark_roots(&self, heap: &Heap) {
        let mut ctx = MarkContext {
            out: None,
            overflow: Vec::new(),
            work: 0,
        };
        heap.roots.scan_all(&mut |candidate| {
            self.mark_candidate(heap, &mut ctx, candidate);
        });
        self.drain_overflow(heap, &mut ctx);
        self.park_out(&mut ctx);
        debug!("root scan produced {} full packets", self.full.size());
    }

    /// The marker thread main loop. Returns when the whole trace is done.
    /// `worker_id` 0 is the master and adjusts the worker target as the
    /// backlog changes.
    pub fn mark_loop(&self, heap: &Heap, worker_id: usize) {
        let mut ctx = MarkContext {
            out: None,
            overflow: Vec::new(),
            work: 0,
        };
        let backoff = Backoff::new();
        loop {
            if let Some(index) = self.full.pop(&self.arena) {
                backoff.reset();
                self.process_packet(heap, &mut ctx, index);
                self.drain_overflow(heap, &mut ctx);
                if worker_id == 0 {
                    let target = desired_workers(self.full_backlog(), heap.options.threads + 1);
                    heap.phase.set_worker_target(target);
                }
                continue;
            }
            if !ctx.overflow.is_empty() {
                self.drain_overflow(heap, &mut ctx);
                continue;
            }
            // No full packet: hand back the out packet so termination can
            // be observed, then either finish or wait for more work.
            if let Some(out) = ctx.out.take() {
                if self.arena.packet(out).is_empty() {
                    self.empty.push(&self.arena, out);
                } else {
                    self.full.push(&self.arena, out);
                    continue;
                }
            }
            if self.is_done() {
                break;
            }
            backoff.snooze();
        }
    }

    fn process_packet(&self, heap: &Heap, ctx: &mut MarkContext, index: u32) {
        let packet = self.arena.packet(index);
        match packet.kind() {
            PacketKind::Objects => {
                ctx.work = 0;
                while let Some(object) = packet.pop() {
                    self.trace_object(heap, ctx, object);
                    if ctx.work > WORK_SPLIT_THRESHOLD && packet.len() > 1 {
                        self.give_work_away(packet);
                        ctx.work = 0;
                    }
                }
                self.retire_packet(ctx, index);
            }
            PacketKind::Range => {
                let (object, from, to) = packet.take_range();
                let batch_end = if (to - from) as usize > RANGE_BATCH {
                    // Keep the tail in this packet and requeue it before
                    // tracing, so other markers can pick it up.
                    let split = from + RANGE_BATCH as u32;
                    packet.set_range(object, split, to);
                    self.full.push(&self.arena, index);
                    split
                } else {
                    self.retire_packet(ctx, index);
                    to
                };
                self.trace_array_slice(heap, ctx, object, from, batch_end);
            }
        }
    }

    /// A drained packet becomes the marker's out packet, or goes back to
    /// the empty list if one is already held.
    fn retire_packet(&self, ctx: &mut MarkContext, index: u32) {
        debug_assert!(self.arena.packet(index).is_empty());
        if ctx.out.is_none() {
            self.arena.packet(index).reset();
            ctx.out = Some(index);
        } else {
            self.empty.push(&self.arena, index);
        }
    }

    /// Move half of a packet's remaining items into a fresh full packet.
    fn give_work_away(&self, packet: &packet::GreyPacket) {
        if let Some(spare) = self.empty.pop(&self.arena) {
            let target = self.arena.packet(spare);
            target.reset();
            packet.move_items_to(target, packet.len() / 2);
            self.full.push(&self.arena, spare);
        }
    }

    fn trace_object(&self, heap: &Heap, ctx: &mut MarkContext, object: Address) {
        match heap.model.layout(object) {
            ObjectLayout::Fields(offsets) => {
                for &offset in offsets {
                    let candidate = unsafe { (object + offset).load::<Address>() };
                    self.mark_candidate(heap, ctx, candidate);
                }
                ctx.work += offsets.len();
            }
            ObjectLayout::Array { length, .. } => {
                if length > ARRAY_SPLIT_THRESHOLD {
                    self.split_array(heap, ctx, object, length);
                } else {
                    self.trace_array_slice(heap, ctx, object, 0, length as u32);
                }
            }
        }
    }

    /// Cut a large array into range packets. Slices that cannot get a
    /// packet (arena exhausted) are traced inline instead.
    fn split_array(&self, heap: &Heap, ctx: &mut MarkContext, object: Address, length: usize) {
        let mut from = 0u32;
        while (from as usize) < length {
            let to = (from as usize + RANGE_BATCH).min(length) as u32;
            if let Some(index) = self.empty.pop(&self.arena) {
                let packet = self.arena.packet(index);
                packet.reset();
                packet.set_range(object, from, to);
                self.full.push(&self.arena, index);
            } else {
                self.trace_array_slice(heap, ctx, object, from, to);
            }
            from = to;
        }
    }

    fn trace_array_slice(
        &self,
        heap: &Heap,
        ctx: &mut MarkContext,
        object: Address,
        from: u32,
        to: u32,
    ) {
        let layout = heap.model.layout(object);
        let ObjectLayout::Array {
            offset,
            stride,
            length,
        } = layout
        else {
            debug_assert!(false, "range packet over a non-array object");
            return;
        };
        debug_assert!(to as usize <= length);
        for element in from..to {
            let slot = object + offset + element as usize * stride;
            let candidate = unsafe { slot.load::<Address>() };
            self.mark_candidate(heap, ctx, candidate);
        }
        ctx.work += (to - from) as usize;
    }

    /// Grey one candidate pointer if it is a live-object start that has
    /// not been marked yet this cycle.
    fn mark_candidate(&self, heap: &Heap, ctx: &mut MarkContext, candidate: Address) {
        if !candidate.is_aligned_to(ALLOCATION_ALIGNMENT) || !heap.contains(candidate) {
            return;
        }
        if !heap.bytemap.try_mark(candidate) {
            return;
        }
        let index = heap.blocks.index_of(heap.blocks.block_containing(candidate));
        let meta = heap.blocks.meta(index);
        match meta.flag() {
            BlockFlag::Simple => {
                meta.set_flag(BlockFlag::Marked);
                heap.lines
                    .mark_lines_for_object(candidate, heap.model.size(candidate));
            }
            BlockFlag::Marked => {
                heap.lines
                    .mark_lines_for_object(candidate, heap.model.size(candidate));
            }
            // Large objects are tracked by the bytemap alone.
            BlockFlag::SuperblockStart | BlockFlag::SuperblockTail => {}
            flag => debug_assert!(false, "marked an object in a {:?} block", flag),
        }
        self.push_grey(ctx, candidate);
    }

    fn push_grey(&self, ctx: &mut MarkContext, object: Address) {
        if ctx.out.is_none() {
            ctx.out = match self.empty.pop(&self.arena) {
                Some(index) => {
                    self.arena.packet(index).reset();
                    Some(index)
                }
                None => {
                    ctx.overflow.push(object);
                    return;
                }
            };
        }
        let out = ctx.out.unwrap();
        let packet = self.arena.packet(out);
        if packet.try_push(object) {
            if packet.is_full() {
                self.full.push(&self.arena, out);
                ctx.out = None;
            }
            return;
        }
        ctx.overflow.push(object);
    }

    fn drain_overflow(&self, heap: &Heap, ctx: &mut MarkContext) {
        while let Some(object) = ctx.overflow.pop() {
            self.trace_object(heap, ctx, object);
        }
    }

    fn park_out(&self, ctx: &mut MarkContext) {
        if let Some(out) = ctx.out.take() {
            if self.arena.packet(out).is_empty() {
                self.empty.push(&self.arena, out);
            } else {
                self.full.push(&self.arena, out);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_scaling_tracks_backlog() {
        assert_eq!(desired_workers(0, 8), 1);
        assert_eq!(desired_workers(3, 8), 3);
        assert_eq!(desired_workers(100, 8), 8);
        assert_eq!(desired_workers(100, 1), 1);
    }
}
