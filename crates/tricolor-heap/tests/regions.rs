//! First-fit allocation, constant-time free and defragmentation of a single
//! growable region.

use sys_alloc::{page_size, BlockManager};
use tricolor_heap::{
    GrowableRegion, ObjectRef, Region, TypeDef, TypeId, TypeRegistry, HEADER_SIZE, WORD,
};

fn region() -> (GrowableRegion, TypeId) {
    let types = TypeRegistry::new();
    let ty = types.register(TypeDef::instance("Unit", WORD)).unwrap();
    let blocks = BlockManager::new(page_size());
    let region = GrowableRegion::initialize(blocks.allocate_block(page_size()).unwrap()).unwrap();
    (region, ty)
}

fn live_objects(region: &GrowableRegion) -> Vec<ObjectRef> {
    let mut found = Vec::new();
    region.walk(
        &mut |obj| {
            found.push(obj);
            true
        },
        true,
        0,
        0,
    );
    found
}

#[test]
fn test_freed_hole_needs_a_free_neighbour_to_grow() {
    let (region, ty) = region();
    let unit = 10 * WORD;
    let a = region.allocate(ty, unit).unwrap();
    let b = region.allocate(ty, unit).unwrap();
    let c = region.allocate(ty, unit).unwrap();
    let tail = region.free_size();
    let filler = region.allocate(ty, tail).unwrap();
    assert_eq!(region.free_size(), 0);

    // One hole of ten units cannot hold fifteen, merged or not.
    assert!(region.free(b));
    assert!(region.allocate(ty, 15 * WORD).is_none());
    region.defragment();
    assert!(region.allocate(ty, 15 * WORD).is_none());

    // With its neighbour freed too, the request fits only after merging.
    assert!(region.free(c));
    assert!(region.allocate(ty, 15 * WORD).is_none());
    region.defragment();
    let merged = region.allocate(ty, 15 * WORD).unwrap();
    assert_eq!(merged, b);

    assert_eq!(live_objects(&region), vec![a, merged, filler]);
    for obj in [a, merged, filler] {
        assert!(region.is_object(obj.addr()));
    }
    assert!(!region.is_object(c.addr()));
}

#[test]
fn test_split_merge_round_trip() {
    let (region, ty) = region();
    // Header plus body divides the page, so the objects fill it exactly.
    let size = HEADER_SIZE;
    let count = page_size() / (size + HEADER_SIZE);
    let all: Vec<_> = (0..count)
        .map(|_| region.allocate(ty, size).unwrap())
        .collect();
    assert_eq!(region.free_size(), 0);
    assert!(region.is_full());
    assert!(region.allocate(ty, WORD).is_none());

    let mut freed = 0;
    for obj in all.iter().step_by(2) {
        freed += region.object_size(*obj).unwrap();
        assert!(region.free(*obj));
    }
    region.defragment();
    // No two freed blocks touch, so nothing merged.
    assert_eq!(region.free_size(), freed);

    let refilled: Vec<_> = (0..count.div_ceil(2))
        .map(|_| region.allocate(ty, size).unwrap())
        .collect();
    assert_eq!(region.free_size(), 0);
    for (obj, again) in all.iter().step_by(2).zip(&refilled) {
        assert_eq!(obj, again, "first fit reuses holes in address order");
    }

    for obj in live_objects(&region) {
        assert!(region.free(obj));
    }
    region.defragment();
    assert!(!region.is_dirty());
    assert_eq!(region.free_size(), page_size() - HEADER_SIZE);
    let whole = region.allocate(ty, page_size() - HEADER_SIZE).unwrap();
    assert_eq!(whole, all[0]);
}

#[test]
fn test_free_rejects_foreign_addresses() {
    let (region, ty) = region();
    let obj = region.allocate(ty, 2 * WORD).unwrap();
    let interior = ObjectRef::from_addr(obj.addr() + WORD).unwrap();
    assert!(!region.free(interior));
    assert!(region.is_object(obj.addr()));
    assert!(!region.in_heap(region.space().end()));
    assert!(region.in_heap(obj.addr()));
}
