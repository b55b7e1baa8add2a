//! Per-type heap occupancy.

use std::collections::BTreeMap;
use std::fmt;

use crate::layout::ObjectRef;
use crate::manager::HeapManager;
use crate::region::Region;
use crate::types::TypeId;

/// Instances and bytes of one type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeUsage {
    /// Type name.
    pub name: String,
    /// Objects of this type currently in the heap.
    pub objects: usize,
    /// Body bytes they occupy.
    pub bytes: usize,
}

/// A snapshot of what the heap holds, by type.
///
/// Objects awaiting finalization or collection are counted too: the walk
/// sees every allocated block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeapStatistics {
    by_type: BTreeMap<TypeId, TypeUsage>,
}

impl HeapStatistics {
    pub(crate) fn gather(heap: &HeapManager) -> Self {
        let _cycle = heap.collector().lock_cycle(heap);
        let mut stats = Self::default();
        let mut count = |obj: ObjectRef| {
            if let Some(header) = heap.header(obj) {
                if let Some(info) = heap.types().get_by_word(header.type_word()) {
                    let usage = stats.by_type.entry(info.id()).or_insert_with(|| TypeUsage {
                        name: info.name().to_owned(),
                        objects: 0,
                        bytes: 0,
                    });
                    usage.objects += 1;
                    usage.bytes += header.size();
                }
            }
            true
        };
        heap.boot_region().walk(&mut count, false, 0, 0);
        for region in heap.regions() {
            region.walk(&mut count, true, 0, 0);
        }
        stats
    }

    /// Usage of one type, if any instance is in the heap.
    #[must_use]
    pub fn get(&self, ty: TypeId) -> Option<&TypeUsage> {
        self.by_type.get(&ty)
    }

    /// Usage of every type present, in type id order.
    pub fn iter(&self) -> impl Iterator<Item = (TypeId, &TypeUsage)> {
        self.by_type.iter().map(|(id, usage)| (*id, usage))
    }

    /// Objects in the heap.
    #[must_use]
    pub fn total_objects(&self) -> usize {
        self.by_type.values().map(|usage| usage.objects).sum()
    }

    /// Body bytes in the heap.
    #[must_use]
    pub fn total_bytes(&self) -> usize {
        self.by_type.values().map(|usage| usage.bytes).sum()
    }
}

impl fmt::Display for HeapStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (id, usage) in &self.by_type {
            writeln!(
                f,
                "{id} {}: {} objects, {} bytes",
                usage.name, usage.objects, usage.bytes
            )?;
        }
        write!(
            f,
            "total: {} objects, {} bytes",
            self.total_objects(),
            self.total_bytes()
        )
    }
}
