// Not every test binary uses every helper.
#![allow(dead_code)]

//! Shared fixtures: a tiny tagged-header object model and a table-backed
//! root provider, enough runtime to exercise the collector end to end.
//!
//! Every test object starts with one 64-bit header word: the low 32 bits
//! hold the object size in bytes, the high 32 bits a layout tag. `Node`
//! objects carry two pointer fields right after the header; `ArrayOf`
//! objects carry a contiguous run of pointer elements.

use regiongc::object_model::{ObjectLayout, ObjectModel};
use regiongc::util::options::HeapSize;
use regiongc::{Address, Gc, Heap, Mutator, Options, Phase};
use std::sync::{Arc, Mutex};

pub const TAG_LEAF: u64 = 0;
pub const TAG_NODE: u64 = 1;
pub const TAG_ARRAY: u64 = 2;

pub const NODE_SIZE: usize = 32;
pub const NODE_FIELD_OFFSET: usize = 8;
pub const NODE_STAMP_OFFSET: usize = 24;
pub const ARRAY_HEADER: usize = 16;
pub const ELEMENT_SIZE: usize = 8;

pub struct TaggedModel;

impl ObjectModel for TaggedModel {
    fn size(&self, object: Address) -> usize {
        let header: u64 = unsafe { object.load() };
        (header & 0xffff_ffff) as usize
    }

    fn layout(&self, object: Address) -> ObjectLayout<'_> {
        let header: u64 = unsafe { object.load() };
        match header >> 32 {
            TAG_NODE => ObjectLayout::Fields(&[NODE_FIELD_OFFSET, NODE_FIELD_OFFSET + 8]),
            TAG_ARRAY => ObjectLayout::Array {
                offset: ARRAY_HEADER,
                stride: ELEMENT_SIZE,
                length: ((header & 0xffff_ffff) as usize - ARRAY_HEADER) / ELEMENT_SIZE,
            },
            _ => ObjectLayout::Fields(&[]),
        }
    }
}

fn write_header(object: Address, tag: u64, size: usize) {
    unsafe { object.store((tag << 32) | size as u64) };
}

/// Allocate a pointer-free object of `size` bytes.
pub fn alloc_leaf(mutator: &mut Mutator, size: usize) -> Address {
    let object = mutator.alloc(size);
    write_header(object, TAG_LEAF, size);
    object
}

/// Allocate a two-field node. Fields start out null.
pub fn alloc_node(mutator: &mut Mutator) -> Address {
    let object = mutator.alloc(NODE_SIZE);
    write_header(object, TAG_NODE, NODE_SIZE);
    object
}

pub fn set_field(node: Address, index: usize, target: Address) {
    unsafe { (node + NODE_FIELD_OFFSET + index * 8).store(target) };
}

pub fn get_field(node: Address, index: usize) -> Address {
    unsafe { (node + NODE_FIELD_OFFSET + index * 8).load() }
}

pub fn set_stamp(node: Address, stamp: u64) {
    unsafe { (node + NODE_STAMP_OFFSET).store(stamp) };
}

pub fn get_stamp(node: Address) -> u64 {
    unsafe { (node + NODE_STAMP_OFFSET).load() }
}

/// Allocate a pointer array of `length` elements, all null.
pub fn alloc_array(mutator: &mut Mutator, length: usize) -> Address {
    let size = ARRAY_HEADER + length * ELEMENT_SIZE;
    let object = mutator.alloc(size);
    write_header(object, TAG_ARRAY, size);
    object
}

pub fn array_set(array: Address, index: usize, target: Address) {
    unsafe { (array + ARRAY_HEADER + index * ELEMENT_SIZE).store(target) };
}

/// A root provider backed by a plain table of object pointers.
pub struct TableRoots {
    table: Mutex<Vec<Address>>,
}

impl TableRoots {
    pub fn new() -> Arc<TableRoots> {
        Arc::new(TableRoots {
            table: Mutex::new(Vec::new()),
        })
    }

    pub fn push(&self, object: Address) {
        self.table.lock().unwrap().push(object);
    }

    pub fn clear(&self) {
        self.table.lock().unwrap().clear();
    }

    pub fn retain(&self, keep: impl FnMut(&Address) -> bool) {
        self.table.lock().unwrap().retain(keep);
    }

    pub fn snapshot(&self) -> Vec<Address> {
        self.table.lock().unwrap().clone()
    }
}

impl regiongc::roots::RootProvider for TableRoots {
    fn scan(&self, report: &mut dyn FnMut(Address)) {
        for root in self.table.lock().unwrap().iter() {
            report(*root);
        }
    }
}

/// A collector over a small fixed-range heap with a registered root table.
pub fn small_gc(min_mb: usize, max_mb: usize) -> (Gc, Arc<TableRoots>) {
    let mut options = Options::default();
    options.min_heap_size = HeapSize(min_mb << 20);
    options.max_heap_size = HeapSize(max_mb << 20);
    options.threads = 2;
    options.stats_file = String::new();
    let gc = Gc::new(Arc::new(TaggedModel), options);
    let roots = TableRoots::new();
    gc.roots().add_provider(roots.clone());
    (gc, roots)
}

/// Collections hand the sweep to the worker pool before returning; wait
/// for the cycle to fully quiesce so block states are stable.
pub fn wait_for_idle(heap: &Heap) {
    while heap.current_phase() != Phase::Idle {
        std::thread::yield_now();
    }
}

pub fn collect_and_settle(gc: &Gc) {
    gc.collect();
    wait_for_idle(gc.heap());
}
