mod common;

use common::*;
use regiongc::util::constants::*;
use regiongc::ObjectState;

#[test]
fn retained_data_forces_growth() {
    let (gc, roots) = small_gc(1, 8);
    let mut mutator = gc.mutator();
    let initial_blocks = gc.heap().committed_blocks();

    // Retain three times the initial heap size; satisfying this without
    // reclaiming anything requires growing the committed range.
    let mut retained = Vec::new();
    for i in 0..1536u64 {
        let leaf = alloc_leaf(&mut mutator, 2048);
        unsafe { (leaf + 8usize).store(i) };
        roots.push(leaf);
        retained.push(leaf);
    }

    assert!(gc.heap().committed_blocks() > initial_blocks);
    assert!(gc.heap().committed_bytes() <= 8 * BYTES_IN_MBYTE);
    assert!(gc.heap().collections() >= 1);

    for (i, leaf) in retained.iter().enumerate() {
        assert!(gc.heap().contains(*leaf));
        assert_eq!(gc.heap().object_state(*leaf), ObjectState::Allocated);
        let stamp: u64 = unsafe { (*leaf + 8usize).load() };
        assert_eq!(stamp, i as u64, "payload damaged in leaf {}", i);
    }
}

#[test]
fn growth_is_monotonic_and_capped() {
    let (gc, roots) = small_gc(1, 4);
    let mut mutator = gc.mutator();
    let max_blocks = (4 * BYTES_IN_MBYTE) >> LOG_BYTES_IN_BLOCK;

    let mut last = gc.heap().committed_blocks();
    for _ in 0..768u64 {
        let leaf = alloc_leaf(&mut mutator, 2048);
        roots.push(leaf);
        let committed = gc.heap().committed_blocks();
        assert!(committed >= last, "committed block count shrank");
        assert!(committed <= max_blocks);
        last = committed;
    }
}

#[test]
fn freed_space_is_reused_before_growing() {
    let (gc, _roots) = small_gc(1, 2);
    let mut mutator = gc.mutator();

    // Churn through many times the maximum heap size in garbage; with
    // nothing retained the heap must absorb it within its 2 MiB cap.
    for _ in 0..8192u64 {
        alloc_leaf(&mut mutator, 2048);
    }
    assert!(gc.heap().committed_bytes() <= 2 * BYTES_IN_MBYTE);
    assert!(gc.heap().collections() >= 1);
}
