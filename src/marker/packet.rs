//! Grey packets, the unit of mark-phase load balancing. Packets live in a
//! fixed arena sized at heap init and are referenced by index. The arena
//! participates in two lock-free lists, "empty" and "full"; a packet held
//! by neither list is owned exclusively by exactly one marker thread. A
//! list reference packs `(packet index, times popped)` into one 64-bit
//! word, so a packet that was popped, refilled and re-pushed while a slow
//! CAS raced never matches a stale reference.

use crate::util::Address;
use crossbeam::utils::Backoff;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Items per packet; the whole packet is just under 2 KiB.
pub const PACKET_CAPACITY: usize = 248;

const NO_PACKET: u32 = u32::MAX;

const fn pack(index: u32, times_popped: u32) -> u64 {
    ((index as u64) << 32) | times_popped as u64
}

const fn unpack(reference: u64) -> (u32, u32) {
    ((reference >> 32) as u32, reference as u32)
}

const NONE_REF: u64 = pack(NO_PACKET, 0);

/// What a packet currently carries.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    /// A batch of object addresses pending trace.
    Objects = 0,
    /// A slice of one large array's elements: `[from, to)` indices into
    /// the array at `object`.
    Range = 1,
}

#[repr(C)]
struct PacketBody {
    kind: PacketKind,
    len: u32,
    object: Address,
    from: u32,
    to: u32,
    items: [Address; PACKET_CAPACITY],
}

/// One grey packet. The header atomics are shared; the body is owned by
/// whichever thread holds the packet outside the lists.
#[repr(C)]
pub struct GreyPacket {
    next: AtomicU64,
    times_popped: AtomicU32,
    body: UnsafeCell<PacketBody>,
}

// Body access follows the list-ownership discipline: a packet is written
// only while held by exactly one thread, and list push/pop provide the
// release/acquire edges that publish the body.
unsafe impl Sync for GreyPacket {}

impl GreyPacket {
    fn body(&self) -> &mut PacketBody {
        unsafe { &mut *self.body.get() }
    }

    pub fn kind(&self) -> PacketKind {
        self.body().kind
    }

    pub fn len(&self) -> usize {
        self.body().len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() == PACKET_CAPACITY
    }

    /// Append one object address. Fails when the packet is full or carries
    /// a range.
    pub fn try_push(&self, address: Address) -> bool {
        let body = self.body();
        if body.kind != PacketKind::Objects || body.len as usize == PACKET_CAPACITY {
            return false;
        }
        body.items[body.len as usize] = address;
        body.len += 1;
        true
    }

    pub fn pop(&self) -> Option<Address> {
        let body = self.body();
        debug_assert_eq!(body.kind, PacketKind::Objects);
        if body.len == 0 {
            return None;
        }
        body.len -= 1;
        Some(body.items[body.len as usize])
    }

    /// Move the last `count` items into `target`, which must have room.
    pub fn move_items_to(&self, target: &GreyPacket, count: usize) {
        let body = self.body();
        debug_assert_eq!(body.kind, PacketKind::Objects);
        debug_assert!(count <= body.len as usize);
        for _ in 0..count {
            body.len -= 1;
            let pushed = target.try_push(body.items[body.len as usize]);
            debug_assert!(pushed);
        }
    }

    /// Turn the packet into a range slice over `object`'s elements.
    pub fn set_range(&self, object: Address, from: u32, to: u32) {
        debug_assert!(from < to);
        let body = self.body();
        body.kind = PacketKind::Range;
        body.object = object;
        body.from = from;
        body.to = to;
        body.len = 0;
    }

    /// Consume the range and reset the packet to an empty object packet.
    pub fn take_range(&self) -> (Address, u32, u32) {
        let body = self.body();
        debug_assert_eq!(body.kind, PacketKind::Range);
        let range = (body.object, body.from, body.to);
        body.kind = PacketKind::Objects;
        body.object = Address::ZERO;
        body.from = 0;
        body.to = 0;
        range
    }

    pub fn reset(&self) {
        let body = self.body();
        body.kind = PacketKind::Objects;
        body.len = 0;
    }
}

/// The fixed packet arena, carved out of the metadata mapping.
pub struct PacketArena {
    base: Address,
    count: u32,
}

impl PacketArena {
    pub const fn bytes_for(count: usize) -> usize {
        count * std::mem::size_of::<GreyPacket>()
    }

    /// Adopt `count` packets of zeroed memory at `base`. Zeroed memory is
    /// a valid empty packet except for the `next` reference, which is
    /// initialized here.
    pub fn new(base: Address, count: u32) -> Self {
        let arena = Self { base, count };
        for index in 0..count {
            arena.packet(index).next.store(NONE_REF, Ordering::Relaxed);
        }
        arena
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn packet(&self, index: u32) -> &GreyPacket {
        debug_assert!(index < self.count);
        unsafe {
            (self.base + index as usize * std::mem::size_of::<GreyPacket>()).as_ref::<GreyPacket>()
        }
    }
}

// Same story as GreyPacket: the arena is a region of shared memory whose
// mutation is serialized by list ownership.
unsafe impl Send for PacketArena {}
unsafe impl Sync for PacketArena {}

/// A lock-free list of packets with a running size counter. Mark-phase
/// termination is detected by comparing the empty list's size with the
/// arena's packet count.
pub struct GreyList {
    head: AtomicU64,
    size: AtomicU32,
}

impl GreyList {
    pub fn new() -> Self {
        Self {
            head: AtomicU64::new(NONE_REF),
            size: AtomicU32::new(0),
        }
    }

    pub fn size(&self) -> u32 {
        self.size.load(Ordering::SeqCst)
    }

    pub fn push(&self, arena: &PacketArena, index: u32) {
        let packet = arena.packet(index);
        let reference = pack(index, packet.times_popped.load(Ordering::Relaxed));
        let backoff = Backoff::new();
        loop {
            let head = self.head.load(Ordering::Acquire);
            packet.next.store(head, Ordering::Relaxed);
            if self
                .head
                .compare_exchange_weak(head, reference, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.size.fetch_add(1, Ordering::SeqCst);
                return;
            }
            backoff.spin();
        }
    }

    pub fn pop(&self, arena: &PacketArena) -> Option<u32> {
        let backoff = Backoff::new();
        loop {
            let head = self.head.load(Ordering::Acquire);
            let (index, _) = unpack(head);
            if index == NO_PACKET {
                return None;
            }
            let packet = arena.packet(index);
            let next = packet.next.load(Ordering::Relaxed);
            if self
                .head
                .compare_exchange_weak(head, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                // Bump the pop count so a reference to this packet taken
                // before the pop can never win a CAS after it is reused.
                packet.times_popped.fetch_add(1, Ordering::Relaxed);
                self.size.fetch_sub(1, Ordering::SeqCst);
                return Some(index);
            }
            backoff.spin();
        }
    }
}

impl Default for GreyList {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::memory::Mapping;
    use std::sync::Arc;

    fn arena(count: u32) -> (Mapping, PacketArena) {
        let mapping = Mapping::reserve(PacketArena::bytes_for(count as usize)).unwrap();
        let arena = PacketArena::new(mapping.start(), count);
        (mapping, arena)
    }

    #[test]
    fn packet_push_pop() {
        let (_m, arena) = arena(1);
        let packet = arena.packet(0);
        assert!(packet.is_empty());
        let a = unsafe { Address::from_usize(0x10) };
        let b = unsafe { Address::from_usize(0x20) };
        assert!(packet.try_push(a));
        assert!(packet.try_push(b));
        assert_eq!(packet.len(), 2);
        assert_eq!(packet.pop(), Some(b));
        assert_eq!(packet.pop(), Some(a));
        assert_eq!(packet.pop(), None);
    }

    #[test]
    fn packet_fills_to_capacity() {
        let (_m, arena) = arena(1);
        let packet = arena.packet(0);
        for i in 0..PACKET_CAPACITY {
            assert!(packet.try_push(unsafe { Address::from_usize(0x1000 + i * 16) }));
        }
        assert!(packet.is_full());
        assert!(!packet.try_push(unsafe { Address::from_usize(0x10) }));
    }

    #[test]
    fn range_round_trip() {
        let (_m, arena) = arena(1);
        let packet = arena.packet(0);
        let object = unsafe { Address::from_usize(0x4000) };
        packet.set_range(object, 100, 500);
        assert_eq!(packet.kind(), PacketKind::Range);
        assert_eq!(packet.take_range(), (object, 100, 500));
        assert_eq!(packet.kind(), PacketKind::Objects);
        assert!(packet.try_push(object));
    }

    #[test]
    fn move_items_splits_a_packet() {
        let (_m, arena) = arena(2);
        let source = arena.packet(0);
        let target = arena.packet(1);
        for i in 0..10 {
            source.try_push(unsafe { Address::from_usize(0x1000 + i * 16) });
        }
        source.move_items_to(target, 4);
        assert_eq!(source.len(), 6);
        assert_eq!(target.len(), 4);
    }

    #[test]
    fn list_push_pop_and_size() {
        let (_m, arena) = arena(4);
        let list = GreyList::new();
        for index in 0..4 {
            list.push(&arena, index);
        }
        assert_eq!(list.size(), 4);
        let mut seen = Vec::new();
        while let Some(index) = list.pop(&arena) {
            seen.push(index);
        }
        assert_eq!(list.size(), 0);
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3]);
    }

    #[test]
    fn packet_conservation_under_contention() {
        const PACKETS: u32 = 64;
        let (mapping, arena) = arena(PACKETS);
        let arena = Arc::new(arena);
        let empty = Arc::new(GreyList::new());
        let full = Arc::new(GreyList::new());
        for index in 0..PACKETS {
            empty.push(&arena, index);
        }

        let mut handles = Vec::new();
        for _ in 0..4 {
            let arena = arena.clone();
            let empty = empty.clone();
            let full = full.clone();
            handles.push(std::thread::spawn(move || {
                for round in 0..2000 {
                    if let Some(index) = empty.pop(&arena) {
                        let packet = arena.packet(index);
                        packet.try_push(unsafe { Address::from_usize(0x1000 + round * 16) });
                        full.push(&arena, index);
                    }
                    if let Some(index) = full.pop(&arena) {
                        let packet = arena.packet(index);
                        while packet.pop().is_some() {}
                        empty.push(&arena, index);
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        // Nothing in flight: the two lists account for every packet.
        assert_eq!(empty.size() + full.size(), PACKETS);
        drop(mapping);
    }
}
