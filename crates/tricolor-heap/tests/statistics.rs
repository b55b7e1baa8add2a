//! Collection statistics and per-type heap occupancy.

use std::sync::Arc;

use tricolor_heap::{HeapConfig, HeapManager, TypeDef, WORD};

fn heap() -> Arc<HeapManager> {
    HeapManager::builder(HeapConfig {
        region_size: 64 * 1024,
        gc_trigger_ratio: None,
        verify: true,
        ..HeapConfig::default()
    })
    .build()
    .unwrap()
}

#[test]
fn test_statistics_before_any_collection() {
    let heap = heap();
    let stats = heap.statistics();
    assert_eq!(stats.total_collections, 0);
    assert!(stats.start_time.is_none());
    assert_eq!(stats.freed_bytes, 0);
}

#[test]
fn test_cycle_statistics() {
    let heap = heap();
    let node = heap
        .register_type(TypeDef::instance("Node", 4 * WORD).with_references([0]))
        .unwrap();
    let root = heap.new_object(node).unwrap();
    heap.alloc_static(Some(root));
    let child = heap.new_object(node).unwrap();
    heap.write_field(root, 0, Some(child)).unwrap();
    for _ in 0..10 {
        heap.new_object(node).unwrap();
    }

    heap.gc();
    let first = heap.statistics();
    assert_eq!(first.total_collections, 1);
    assert!(first.start_time.is_some());
    assert_eq!(first.marked_objects, 2);
    assert_eq!(first.freed_objects, 10);
    assert_eq!(first.freed_bytes, 10 * 4 * WORD);
    assert_eq!(first.total_freed_bytes, first.freed_bytes);
    assert_eq!(first.mark_iterations, 1);
    assert_eq!(first.yellowed_objects, 0);
    assert_eq!(first.barrier_shades, 0);
    assert!(first.duration >= first.mark_duration);
    assert!(first.duration >= first.sweep_duration);

    heap.gc();
    let second = heap.statistics();
    assert_eq!(second.total_collections, 2);
    assert_eq!(second.freed_objects, 0);
    assert_eq!(second.total_freed_bytes, first.freed_bytes);

    let report = second.to_string();
    assert!(report.contains("collections:      2"), "{report}");
}

#[test]
fn test_heap_statistics_by_type() {
    let heap = heap();
    let small = heap.register_type(TypeDef::instance("Small", WORD)).unwrap();
    let large = heap.register_type(TypeDef::instance("Large", 32 * WORD)).unwrap();
    let bytes = heap.register_type(TypeDef::primitive_array("u8[]", 1)).unwrap();
    let unused = heap.register_type(TypeDef::instance("Unused", WORD)).unwrap();

    for _ in 0..5 {
        let obj = heap.new_object(small).unwrap();
        heap.alloc_static(Some(obj));
    }
    for _ in 0..2 {
        heap.new_object(large).unwrap();
    }
    let array = heap.new_array(bytes, 3).unwrap();
    heap.alloc_static(Some(array));

    let stats = heap.heap_statistics();
    let usage = stats.get(small).unwrap();
    assert_eq!(usage.name, "Small");
    assert_eq!(usage.objects, 5);
    assert_eq!(usage.bytes, 5 * WORD);
    assert_eq!(stats.get(large).unwrap().objects, 2);
    assert_eq!(stats.get(bytes).unwrap().bytes, 2 * WORD);
    assert!(stats.get(unused).is_none());
    assert_eq!(stats.total_objects(), 8);
    assert_eq!(stats.iter().count(), 3);

    heap.gc();
    let stats = heap.heap_statistics();
    assert!(stats.get(large).is_none());
    assert_eq!(stats.total_objects(), 6);
    assert_eq!(stats.total_bytes(), 5 * WORD + 2 * WORD);
    let report = stats.to_string();
    assert!(
        report.ends_with(&format!("total: 6 objects, {} bytes", 7 * WORD)),
        "{report}"
    );

    // Instance counters count allocations, not survivors.
    assert_eq!(heap.type_info(large).unwrap().instance_count(), 2);
}
