//! C2: the resource-algebra trait family spec.md §4.2 asks for, plus the
//! three concrete algebras named in §3 (`Int`, `AllocRange`, `VMAccelDesc`).
//!
//! This replaces the original's per-type template instantiation
//! (`VMAccelAllocator<T, C>`) with a single trait the generic
//! [`crate::alloc::Allocator`] is parameterized over (spec.md §9, "Template
//! instantiation to trait parameterization").

use vmt::{AllocRange, Int, VMAccelDesc};

/// Bundles the comparison, arithmetic, and reservation behavior
/// [`crate::alloc::Allocator`] needs over a resource value `T`
/// (spec.md §4.2).
pub trait ResourceAlgebra: Clone + std::fmt::Debug {
    /// Total order key used for best-fit lookup in the free-set.
    type Key: Ord + Copy;

    fn best_fit_key(&self) -> Self::Key;

    /// Carve `request` out of `self` (the "whole"). Returns `(taken,
    /// remainder)` or `None` if `request` does not fit (spec.md §4.2).
    fn reserve(&self, request: &Self) -> Option<(Self, Self)>;

    fn add(&self, other: &Self) -> Self;

    fn subtract(&self, other: &Self) -> Self;

    fn is_empty(&self) -> bool;

    /// Insert `value` into a parent's free list, applying this algebra's
    /// coalescing rule. Ranges merge with an adjacent neighbor; scalars and
    /// descriptors keep exactly one entry per parent, summing into it
    /// (spec.md §4.2, `FreeObj`).
    fn free_insert(free_list: &mut Vec<Self>, value: Self);
}

impl ResourceAlgebra for Int {
    type Key = u64;

    fn best_fit_key(&self) -> Self::Key {
        *self
    }

    fn reserve(&self, request: &Self) -> Option<(Self, Self)> {
        if request > self {
            return None;
        }
        Some((*request, self - request))
    }

    fn add(&self, other: &Self) -> Self {
        self + other
    }

    fn subtract(&self, other: &Self) -> Self {
        self.saturating_sub(*other)
    }

    fn is_empty(&self) -> bool {
        *self == 0
    }

    fn free_insert(free_list: &mut Vec<Self>, value: Self) {
        if value.is_empty() {
            return;
        }
        match free_list.first_mut() {
            Some(existing) => *existing += value,
            None => free_list.push(value),
        }
    }
}

impl ResourceAlgebra for AllocRange {
    type Key = u64;

    fn best_fit_key(&self) -> Self::Key {
        self.size
    }

    fn reserve(&self, request: &Self) -> Option<(Self, Self)> {
        if request.size > self.size {
            return None;
        }
        let taken = AllocRange {
            size: request.size,
            begin: self.begin,
            end: self.begin + request.size - 1,
        };
        let remainder = AllocRange {
            size: self.size - request.size,
            begin: taken.end + 1,
            end: self.end,
        };
        Some((taken, remainder))
    }

    fn add(&self, other: &Self) -> Self {
        AllocRange {
            size: self.size + other.size,
            begin: self.begin.min(other.begin),
            end: self.end.max(other.end),
        }
    }

    fn subtract(&self, other: &Self) -> Self {
        AllocRange {
            size: self.size.saturating_sub(other.size),
            begin: self.begin,
            end: self.end,
        }
    }

    fn is_empty(&self) -> bool {
        AllocRange::is_empty(self)
    }

    /// Merge-if-adjacent, per spec.md §9's explicit redesign intent:
    /// "merge if strictly adjacent in either direction, prefer the
    /// lower-neighbor merge when both are candidates" (resolving the
    /// original's asymmetric `cmpRange` flag).
    fn free_insert(free_list: &mut Vec<Self>, value: Self) {
        if value.is_empty() {
            return;
        }

        // Prefer merging with the neighbor that precedes `value` (the
        // "lower-neighbor merge" spec.md §9 asks to prefer when both a
        // lower and upper neighbor could apply).
        if let Some(pos) = free_list.iter().position(|r| r.abuts_before(&value)) {
            let merged = free_list.remove(pos).merge(&value);
            return Self::free_insert(free_list, merged);
        }
        if let Some(pos) = free_list.iter().position(|r| value.abuts_before(r)) {
            let merged = value.merge(&free_list.remove(pos));
            return Self::free_insert(free_list, merged);
        }

        let idx = free_list.partition_point(|r| r.best_fit_key() < value.best_fit_key());
        free_list.insert(idx, value);
    }
}

impl ResourceAlgebra for VMAccelDesc {
    /// Lexicographic ordering over all nine capacity dimensions. The
    /// original's `operator<` for `VMAccelWorkloadDesc` only compares three
    /// of the nine fields with OR logic, which is not a valid strict weak
    /// ordering; DESIGN.md records using a total lexicographic key here as
    /// a deliberate correction rather than a faithful port.
    type Key = (u32, u32, u32, u32, u32, u32, u32, u32, u32);

    fn best_fit_key(&self) -> Self::Key {
        let c = &self.capacity;
        (
            c.mega_flops,
            c.mega_ops,
            c.llc_size_kb,
            c.llc_bandwidth_mb_sec,
            c.local_mem_size_kb,
            c.local_mem_bandwidth_mb_sec,
            c.non_local_mem_size_kb,
            c.non_local_mem_bandwidth_mb_sec,
            c.interconnect_bandwidth_mb_sec,
        )
    }

    fn reserve(&self, request: &Self) -> Option<(Self, Self)> {
        if !request.fits_within(self) {
            return None;
        }
        let taken = VMAccelDesc {
            capacity: request.capacity,
            ..self.clone()
        };
        let remainder = self.saturating_sub(&taken);
        Some((taken, remainder))
    }

    fn add(&self, other: &Self) -> Self {
        self.saturating_add(other)
    }

    fn subtract(&self, other: &Self) -> Self {
        self.saturating_sub(other)
    }

    fn is_empty(&self) -> bool {
        VMAccelDesc::is_empty(self)
    }

    fn free_insert(free_list: &mut Vec<Self>, value: Self) {
        if value.is_empty() {
            return;
        }
        match free_list.first_mut() {
            Some(existing) => *existing = existing.add(&value),
            None => free_list.push(value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmt::AcceleratorType;

    #[test]
    fn int_reserve_splits_whole() {
        let whole: Int = 65535;
        let (taken, remainder) = whole.reserve(&32768).unwrap();
        assert_eq!(taken, 32768);
        assert_eq!(remainder, 32767);
    }

    #[test]
    fn int_reserve_fails_when_too_large() {
        let whole: Int = 100;
        assert!(whole.reserve(&200).is_none());
    }

    #[test]
    fn alloc_range_reserve_carves_from_low_end() {
        let whole = AllocRange::whole(65535);
        let (taken, remainder) = whole.reserve(&AllocRange { size: 32768, begin: 0, end: 0 }).unwrap();
        assert_eq!(taken, AllocRange { size: 32768, begin: 0, end: 32767 });
        assert_eq!(remainder, AllocRange { size: 32767, begin: 32768, end: 65534 });
    }

    #[test]
    fn alloc_range_free_insert_coalesces_adjacent() {
        let mut free = vec![AllocRange { size: 10, begin: 0, end: 9 }];
        AllocRange::free_insert(&mut free, AllocRange { size: 10, begin: 10, end: 19 });
        assert_eq!(free, vec![AllocRange { size: 20, begin: 0, end: 19 }]);
    }

    #[test]
    fn alloc_range_free_insert_keeps_non_adjacent_separate() {
        let mut free = vec![AllocRange { size: 10, begin: 0, end: 9 }];
        AllocRange::free_insert(&mut free, AllocRange { size: 10, begin: 20, end: 29 });
        assert_eq!(free.len(), 2);
    }

    fn desc(mega_flops: u32) -> VMAccelDesc {
        VMAccelDesc {
            parent_id: 0,
            accel_type: AcceleratorType::Gpu,
            capacity: vmt::WorkloadCapacity {
                mega_flops,
                ..Default::default()
            },
            address: Vec::new(),
            type_mask: 0,
            format_caps: Vec::new(),
        }
    }

    #[test]
    fn desc_reserve_is_pointwise() {
        let whole = desc(100);
        let (taken, remainder) = whole.reserve(&desc(40)).unwrap();
        assert_eq!(taken.capacity.mega_flops, 40);
        assert_eq!(remainder.capacity.mega_flops, 60);
    }
}
