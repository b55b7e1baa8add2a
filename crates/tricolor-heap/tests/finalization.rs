//! Finalizers run exactly once, and finalized objects are freed by the
//! following collection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use tricolor_heap::{Color, HeapConfig, HeapManager, TypeDef, WORD};

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

fn counting_type(heap: &HeapManager, runs: &Arc<AtomicUsize>) -> tricolor_heap::TypeId {
    let runs = Arc::clone(runs);
    heap.register_type(
        TypeDef::instance("Resource", 2 * WORD)
            .with_references([0])
            .with_finalizer(move |_, _| {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
    )
    .unwrap()
}

#[test]
fn test_finalize_then_free_over_two_cycles() {
    let heap = heap();
    let runs = Arc::new(AtomicUsize::new(0));
    let resource = counting_type(&heap, &runs);
    let obj = heap.new_object(resource).unwrap();
    assert!(!heap.is_finalized(obj).unwrap());

    heap.gc();
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert!(heap.is_object(obj.addr()), "finalized objects wait for the next cycle");
    assert!(heap.is_finalized(obj).unwrap());
    assert_eq!(heap.color(obj).unwrap(), Color::White);
    assert_eq!(heap.statistics().yellowed_objects, 1);
    assert_eq!(heap.statistics().freed_objects, 0);

    heap.gc();
    assert!(!heap.is_object(obj.addr()));
    assert_eq!(heap.statistics().freed_objects, 1);
    assert_eq!(heap.statistics().yellowed_objects, 0);

    heap.gc();
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[test]
fn test_reachable_objects_are_not_finalized() {
    let heap = heap();
    let runs = Arc::new(AtomicUsize::new(0));
    let resource = counting_type(&heap, &runs);
    let obj = heap.new_object(resource).unwrap();
    let slot = heap.alloc_static(Some(obj));

    heap.gc();
    heap.run_finalization();
    assert_eq!(runs.load(Ordering::SeqCst), 0);

    heap.write_static(slot, None).unwrap();
    heap.gc();
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[test]
fn test_finalizer_sees_its_referents() {
    let heap = heap();
    let node = heap.register_type(TypeDef::instance("Node", 2 * WORD)).unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&seen);
    let holder = heap
        .register_type(
            TypeDef::instance("Holder", WORD)
                .with_references([0])
                .with_finalizer(move |heap, obj| {
                    let child = heap.read_field(obj, 0)?.ok_or("child missing")?;
                    log.lock().push(heap.read_word(child, WORD)?);
                    Ok(())
                }),
        )
        .unwrap();

    let obj = heap.new_object(holder).unwrap();
    let child = heap.new_object(node).unwrap();
    heap.write_word(child, WORD, 7).unwrap();
    heap.write_field(obj, 0, Some(child)).unwrap();

    heap.gc();
    assert_eq!(*seen.lock(), vec![7]);
    assert!(heap.is_object(child.addr()));

    heap.gc();
    assert!(!heap.is_object(obj.addr()));
    assert!(!heap.is_object(child.addr()));
}

#[test]
fn test_finalizable_cycle_is_finalized_and_freed() {
    let heap = heap();
    let runs = Arc::new(AtomicUsize::new(0));
    let resource = counting_type(&heap, &runs);
    let a = heap.new_object(resource).unwrap();
    let b = heap.new_object(resource).unwrap();
    heap.write_field(a, 0, Some(b)).unwrap();
    heap.write_field(b, 0, Some(a)).unwrap();

    heap.gc();
    assert_eq!(runs.load(Ordering::SeqCst), 2);

    heap.gc();
    assert!(!heap.is_object(a.addr()));
    assert!(!heap.is_object(b.addr()));
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

#[test]
fn test_resurrected_object_is_not_finalized_again() {
    let heap = heap();
    let runs = Arc::new(AtomicUsize::new(0));
    let slot = heap.alloc_static(None);
    let counter = Arc::clone(&runs);
    let phoenix = heap
        .register_type(TypeDef::instance("Phoenix", WORD).with_finalizer(move |heap, obj| {
            counter.fetch_add(1, Ordering::SeqCst);
            heap.write_static(slot, Some(obj))?;
            Ok(())
        }))
        .unwrap();
    let obj = heap.new_object(phoenix).unwrap();

    heap.gc();
    heap.gc();
    assert!(heap.is_object(obj.addr()), "the finalizer stored it in a static");
    assert_eq!(heap.read_static(slot).unwrap(), Some(obj));

    heap.write_static(slot, None).unwrap();
    heap.gc();
    assert!(!heap.is_object(obj.addr()));
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[test]
fn test_failing_finalizers_are_swallowed() {
    let heap = heap();
    let failing = heap
        .register_type(
            TypeDef::instance("Failing", WORD).with_finalizer(|_, _| Err("close failed".into())),
        )
        .unwrap();
    let panicking = heap
        .register_type(
            TypeDef::instance("Panicking", WORD).with_finalizer(|_, _| panic!("finalizer bug")),
        )
        .unwrap();
    let a = heap.new_object(failing).unwrap();
    let b = heap.new_object(panicking).unwrap();

    heap.gc();
    assert!(heap.is_finalized(a).unwrap());
    assert!(heap.is_finalized(b).unwrap());
    assert_eq!(heap.color(b).unwrap(), Color::White);

    heap.gc();
    assert!(!heap.is_object(a.addr()));
    assert!(!heap.is_object(b.addr()));
}

#[test]
fn test_finalizer_may_allocate() {
    let heap = heap();
    let node = heap.register_type(TypeDef::instance("Node", WORD)).unwrap();
    let slot = heap.alloc_static(None);
    let allocating = heap
        .register_type(TypeDef::instance("Allocating", WORD).with_finalizer(move |heap, _| {
            let replacement = heap.new_object(node)?;
            heap.write_static(slot, Some(replacement))?;
            Ok(())
        }))
        .unwrap();
    heap.new_object(allocating).unwrap();

    heap.gc();
    let replacement = heap.read_static(slot).unwrap().unwrap();
    heap.gc();
    assert!(heap.is_object(replacement.addr()));
}

#[test]
fn test_concurrent_triggers_finalize_each_object_once() {
    let heap = heap();
    let counts = Arc::new(Mutex::new(HashMap::new()));
    let log = Arc::clone(&counts);
    let resource = heap
        .register_type(TypeDef::instance("Resource", WORD).with_finalizer(move |_, obj| {
            *log.lock().entry(obj.addr()).or_insert(0_usize) += 1;
            Ok(())
        }))
        .unwrap();
    heap.start().unwrap();

    let objects: Vec<_> = (0..100).map(|_| heap.new_object(resource).unwrap()).collect();
    heap.gc();

    let triggers: Vec<_> = (0..8)
        .map(|_| {
            let heap = Arc::clone(&heap);
            thread::spawn(move || {
                for _ in 0..10 {
                    assert!(heap.trigger_finalization(true));
                }
            })
        })
        .collect();
    for handle in triggers {
        handle.join().unwrap();
    }

    let counts = counts.lock();
    assert_eq!(counts.len(), objects.len());
    assert!(counts.values().all(|&runs| runs == 1), "{counts:?}");
    drop(counts);
    for obj in &objects {
        assert!(heap.is_finalized(*obj).unwrap());
    }
    heap.shutdown();
}

#[test]
fn test_inline_passes_from_many_threads_finalize_once() {
    let heap = heap();
    let counts = Arc::new(Mutex::new(HashMap::new()));
    let log = Arc::clone(&counts);
    let resource = heap
        .register_type(TypeDef::instance("Resource", WORD).with_finalizer(move |_, obj| {
            *log.lock().entry(obj.addr()).or_insert(0_usize) += 1;
            Ok(())
        }))
        .unwrap();
    for _ in 0..200 {
        heap.new_object(resource).unwrap();
    }

    let workers: Vec<_> = (0..4)
        .map(|i| {
            let heap = Arc::clone(&heap);
            thread::spawn(move || {
                let _mutator = heap.attach_mutator();
                if i % 2 == 0 {
                    heap.gc();
                }
                heap.run_finalization();
            })
        })
        .collect();
    for handle in workers {
        handle.join().unwrap();
    }

    let counts = counts.lock();
    assert_eq!(counts.len(), 200);
    assert!(counts.values().all(|&runs| runs == 1));
}

#[test]
fn test_finalizer_thread_serves_requests() {
    let heap = heap();
    let runs = Arc::new(AtomicUsize::new(0));
    let resource = counting_type(&heap, &runs);
    heap.start().unwrap();
    heap.start().unwrap();

    let obj = heap.new_object(resource).unwrap();
    heap.gc();
    heap.run_finalization();
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    heap.request_gc(true);
    assert!(!heap.is_object(obj.addr()));

    heap.shutdown();
    assert!(
        heap.trigger_finalization(true),
        "after shutdown passes run on the caller"
    );
}

#[test]
fn test_collection_from_finalizer_keeps_pending_referents() {
    let heap = HeapManager::builder(HeapConfig {
        region_size: 64 * 1024,
        mark_stack_capacity: 1,
        gc_trigger_ratio: None,
        verify: true,
        ..HeapConfig::default()
    })
    .build()
    .unwrap();
    let leaf = heap.register_type(TypeDef::instance("Leaf", WORD)).unwrap();

    let runs = Arc::new(AtomicUsize::new(0));
    let live = Arc::new(AtomicUsize::new(0));
    let dead = Arc::new(AtomicUsize::new(0));
    let owner = {
        let (runs, live, dead) = (Arc::clone(&runs), Arc::clone(&live), Arc::clone(&dead));
        heap.register_type(
            TypeDef::instance("Owner", 3 * WORD)
                .with_references([0, WORD, 2 * WORD])
                .with_finalizer(move |heap, obj| {
                    for offset in [0, WORD, 2 * WORD] {
                        match heap.read_field(obj, offset)? {
                            Some(child) if heap.is_object(child.addr()) => {
                                live.fetch_add(1, Ordering::SeqCst)
                            }
                            _ => dead.fetch_add(1, Ordering::SeqCst),
                        };
                    }
                    // The other owners are still yellow and unfinalized.
                    if runs.fetch_add(1, Ordering::SeqCst) == 0 {
                        heap.gc();
                    }
                    Ok(())
                }),
        )
        .unwrap()
    };

    let mut all = Vec::new();
    for _ in 0..6 {
        let obj = heap.new_object(owner).unwrap();
        all.push(obj);
        for offset in [0, WORD, 2 * WORD] {
            let child = heap.new_object(leaf).unwrap();
            heap.write_field(obj, offset, Some(child)).unwrap();
            all.push(child);
        }
    }

    heap.gc();

    assert_eq!(runs.load(Ordering::SeqCst), 6);
    assert_eq!(dead.load(Ordering::SeqCst), 0, "a pending referent was freed");
    assert_eq!(live.load(Ordering::SeqCst), 18);
    let stats = heap.statistics();
    assert_eq!(stats.total_collections, 2);
    assert!(stats.mark_iterations > 1, "three children cannot fit a stack of 1");
    assert_eq!(stats.freed_objects, 0);
    assert!(all.iter().all(|obj| heap.is_object(obj.addr())));

    heap.gc();
    assert!(all.iter().all(|obj| !heap.is_object(obj.addr())));
    assert_eq!(runs.load(Ordering::SeqCst), 6);
}
