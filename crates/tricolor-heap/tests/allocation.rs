//! Allocation limits, heap growth and out-of-memory handling.

use std::sync::Arc;

use sys_alloc::BlockManager;
use tricolor_heap::{HeapConfig, HeapError, HeapManager, TypeDef, HEADER_SIZE, WORD};

const REGION_SIZE: usize = 64 * 1024;

fn config() -> HeapConfig {
    HeapConfig {
        region_size: REGION_SIZE,
        gc_trigger_ratio: None,
        ..HeapConfig::default()
    }
}

fn heap_with_budget(regions: usize) -> Arc<HeapManager> {
    HeapManager::builder(config())
        .block_source(BlockManager::new(regions * REGION_SIZE))
        .build()
        .unwrap()
}

#[test]
fn test_object_too_large_is_rejected_without_damage() {
    let heap = HeapManager::builder(config()).build().unwrap();
    let node = heap
        .register_type(TypeDef::instance("Node", 2 * WORD).with_references([0]))
        .unwrap();
    let limit = heap.config().max_object_size();
    let huge = heap
        .register_type(TypeDef::instance("Huge", limit + WORD))
        .unwrap();

    let existing: Vec<_> = (0..16).map(|_| heap.new_object(node).unwrap()).collect();
    for obj in &existing {
        heap.alloc_static(Some(*obj));
    }
    let free = heap.free_memory();

    for _ in 0..3 {
        let err = heap.new_object(huge).unwrap_err();
        assert!(err.is_out_of_memory());
        assert!(
            matches!(err, HeapError::ObjectTooLarge { size, limit: l } if size == limit + WORD && l == limit),
            "unexpected error: {err}"
        );
    }

    assert_eq!(heap.free_memory(), free, "a rejected request must not allocate");
    assert_eq!(heap.statistics().total_collections, 0);
    for obj in &existing {
        assert!(heap.is_object(obj.addr()));
    }
    let after = heap.new_object(node).unwrap();
    assert!(heap.is_object(after.addr()));
}

#[test]
fn test_largest_object_fills_a_fresh_region() {
    let heap = heap_with_budget(2);
    let limit = heap.config().max_object_size();
    let largest = heap.register_type(TypeDef::instance("Largest", limit)).unwrap();
    let small = heap.register_type(TypeDef::instance("Small", WORD)).unwrap();

    let first = heap.new_object(small).unwrap();
    heap.alloc_static(Some(first));
    let big = heap.new_object(largest).unwrap();
    heap.alloc_static(Some(big));

    assert_eq!(heap.region_count(), 2);
    assert!(heap.object_size(big).unwrap() >= limit);
    assert!(heap.is_object(first.addr()));
}

#[test]
fn test_out_of_memory_after_collection() {
    let heap = heap_with_budget(1);
    let chunk = heap
        .register_type(TypeDef::instance("Chunk", 4 * 1024))
        .unwrap();

    let mut slots = Vec::new();
    let err = loop {
        match heap.new_object(chunk) {
            Ok(obj) => slots.push(heap.alloc_static(Some(obj))),
            Err(err) => break err,
        }
        assert!(slots.len() < 64, "a single region cannot hold this many chunks");
    };
    assert!(matches!(err, HeapError::OutOfMemory { size: 4096 }));
    assert!(heap.is_low_on_memory());
    assert_eq!(heap.region_count(), 1);
    assert!(
        heap.statistics().total_collections >= 1,
        "the allocator collects before giving up"
    );

    for slot in &slots {
        heap.write_static(*slot, None).unwrap();
    }
    let obj = heap.new_object(chunk).unwrap();
    assert!(heap.is_object(obj.addr()));
    assert!(!heap.is_low_on_memory(), "a successful allocation clears the flag");
}

#[test]
fn test_garbage_is_reclaimed_instead_of_growing() {
    let heap = heap_with_budget(1);
    let chunk = heap
        .register_type(TypeDef::instance("Chunk", 4 * 1024))
        .unwrap();

    // Ten regions' worth of short-lived objects through a one-region budget.
    for _ in 0..(10 * REGION_SIZE / (4 * 1024 + HEADER_SIZE)) {
        heap.new_object(chunk).unwrap();
    }
    assert_eq!(heap.region_count(), 1);
    assert!(heap.statistics().total_collections >= 9);
    assert!(heap.statistics().total_freed_bytes > 0);
}

#[test]
fn test_growth_is_bounded_by_block_budget() {
    let heap = heap_with_budget(3);
    let chunk = heap
        .register_type(TypeDef::instance("Chunk", 16 * 1024))
        .unwrap();
    let total = heap.total_memory();

    let mut live = 0;
    while let Ok(obj) = heap.new_object(chunk) {
        heap.alloc_static(Some(obj));
        live += 1;
    }
    assert_eq!(heap.region_count(), 3);
    assert!(live >= 9);
    assert_eq!(heap.total_memory(), total);
    // Each region keeps a tail too short for another chunk.
    assert!(heap.free_memory() < heap.region_count() * 16 * 1024);
}

#[test]
fn test_free_memory_tracks_allocation_and_collection() {
    let heap = HeapManager::builder(config()).build().unwrap();
    let node = heap.register_type(TypeDef::instance("Node", 8 * WORD)).unwrap();
    let before = heap.free_memory();

    let objects: Vec<_> = (0..32).map(|_| heap.new_object(node).unwrap()).collect();
    let used = before - heap.free_memory();
    assert_eq!(used, 32 * (8 * WORD + HEADER_SIZE));

    heap.gc();
    for obj in &objects {
        assert!(!heap.is_object(obj.addr()));
    }
    assert_eq!(heap.free_memory(), before);
}

#[test]
fn test_arrays_are_zeroed_and_sized() {
    let heap = HeapManager::builder(config()).build().unwrap();
    let words = heap
        .register_type(TypeDef::primitive_array("usize[]", WORD))
        .unwrap();
    let refs = heap.register_type(TypeDef::reference_array("Object[]")).unwrap();

    let raw = heap.new_array(words, 8).unwrap();
    heap.write_word(raw, tricolor_heap::ARRAY_DATA_OFFSET + 7 * WORD, 99)
        .unwrap();
    assert_eq!(
        heap.read_word(raw, tricolor_heap::ARRAY_DATA_OFFSET + 7 * WORD)
            .unwrap(),
        99
    );
    assert!(matches!(
        heap.write_word(raw, tricolor_heap::ARRAY_LENGTH_OFFSET, 1),
        Err(HeapError::SlotKind { .. })
    ));

    let array = heap.new_array(refs, 0).unwrap();
    assert_eq!(heap.array_length(array).unwrap(), 0);
    assert!(matches!(
        heap.read_array_element(array, 0),
        Err(HeapError::IndexOutOfBounds { index: 0, length: 0 })
    ));
    assert!(matches!(
        heap.new_array(refs, usize::MAX),
        Err(HeapError::ObjectTooLarge { .. })
    ));
}
