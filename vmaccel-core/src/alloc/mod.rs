//! C3: the generic two-level extent allocator (spec.md §2, §4.2).
//!
//! Registers whole-device capacities, best-fit sub-allocates external
//! reservations, and defers reclamation until the owning fence retires.
//! Parameterized over [`ResourceAlgebra`] so one implementation serves all
//! three resource shapes in §3.

mod object;

pub use object::ResourceObject;

use std::collections::VecDeque;

use rustc_hash::FxHashMap;
use vmt::{FenceId, Identifier};

use crate::algebra::ResourceAlgebra;
use crate::error::{CoreError, CoreResult};
use crate::identifier_db::IdentifierDB;

/// Sentinel fence value for allocator entries that have not yet been handed
/// a real fence (currently-allocated objects; free-set entries don't carry
/// one at all). Distinguished from `vmt::FENCE_ALREADY_RETIRED` (0), which
/// means "this fence is known retired", not "no fence assigned".
pub const FENCE_NONE: FenceId = u64::MAX;

/// Non-blocking fence retirement oracle the allocator polls. Real callers
/// implement this over a `hal::Backend`; tests implement it directly.
///
/// Deliberately non-blocking (spec.md §9: "the source's infinite retry on
/// fence-wait is a known deficiency"): when the deferred-free queue's front
/// entry has not retired, [`Allocator::alloc`] stops draining and surfaces
/// `ResourceUnavailable` immediately rather than looping internally. The
/// cooperative backoff-and-retry loop spec.md §5 describes lives at the
/// call site (the dispatch/RPC retry layer), not inside this generic
/// container.
pub trait FenceSource {
    fn has_retired(&self, fence: FenceId) -> bool;
}

/// A [`FenceSource`] that reports every fence as already retired, for
/// callers that don't defer frees at all.
pub struct AlwaysRetired;

impl FenceSource for AlwaysRetired {
    fn has_retired(&self, _fence: FenceId) -> bool {
        true
    }
}

/// Generic two-level allocator over resource value `T` (spec.md §4.2).
pub struct Allocator<T: ResourceAlgebra> {
    registered: FxHashMap<Identifier, T>,
    capacity: FxHashMap<Identifier, T>,
    load: FxHashMap<Identifier, T>,
    refcount: FxHashMap<Identifier, u32>,
    /// Best-fit ordered free-set, one list per registered parent, each kept
    /// sorted ascending by `T::best_fit_key`.
    free: FxHashMap<Identifier, Vec<T>>,
    /// FIFO deferred-free queue shared across all parents (spec.md §4.2).
    freed: VecDeque<ResourceObject<T>>,
    allocated: FxHashMap<Identifier, ResourceObject<T>>,
    registered_ids: IdentifierDB,
    external_ids: IdentifierDB,
    /// Build-time `DEFER_FREE` policy (spec.md §6), made a runtime field so
    /// it is independently testable.
    defer_free: bool,
}

impl<T: ResourceAlgebra> Allocator<T> {
    pub fn new(registered_capacity: u32, external_capacity: u32) -> Self {
        Self {
            registered: FxHashMap::default(),
            capacity: FxHashMap::default(),
            load: FxHashMap::default(),
            refcount: FxHashMap::default(),
            free: FxHashMap::default(),
            freed: VecDeque::new(),
            allocated: FxHashMap::default(),
            registered_ids: IdentifierDB::new(registered_capacity),
            external_ids: IdentifierDB::new(external_capacity),
            defer_free: cfg!(feature = "defer-free"),
        }
    }

    pub fn with_defer_free(mut self, defer_free: bool) -> Self {
        self.defer_free = defer_free;
        self
    }

    /// Install a whole device capacity, allocating a fresh parent id
    /// (spec.md §4.2, `Register`).
    pub fn register(&mut self, value: T) -> CoreResult<Identifier> {
        let parent_id = self
            .registered_ids
            .alloc()
            .ok_or(CoreError::Exhausted("registered id space exhausted"))?;
        self.registered.insert(parent_id, value.clone());
        self.capacity.insert(parent_id, value.clone());
        self.load.insert(parent_id, value.subtract(&value));
        self.refcount.insert(parent_id, 0);
        let list = self.free.entry(parent_id).or_default();
        T::free_insert(list, value);
        log::debug!("allocator: registered parent {parent_id}");
        Ok(parent_id)
    }

    /// Tear down a registered parent. Fails with `Fail` if anything still
    /// references it (spec.md §4.2, `Unregister`).
    pub fn unregister<F: FenceSource>(&mut self, parent_id: Identifier, fences: &F) -> CoreResult<()> {
        let refcount = *self
            .refcount
            .get(&parent_id)
            .ok_or(CoreError::InvalidId("unregister: unknown parent"))?;
        if refcount != 0 {
            return Err(CoreError::Fail("unregister: refcount is non-zero"));
        }

        self.coalesce_freed(fences);
        if self.freed.iter().any(|o| o.parent_id == parent_id) {
            return Err(CoreError::ResourceUnavailable(
                "unregister: deferred frees for this parent have not retired",
            ));
        }

        self.free.remove(&parent_id);
        self.capacity.remove(&parent_id);
        self.load.remove(&parent_id);
        self.refcount.remove(&parent_id);
        self.registered.remove(&parent_id);
        self.registered_ids.release(parent_id);
        log::debug!("allocator: unregistered parent {parent_id}");
        Ok(())
    }

    /// Best-fit sub-allocate `request` from `parent_id`'s capacity
    /// (spec.md §4.2, `Alloc`).
    pub fn alloc<F: FenceSource>(
        &mut self,
        parent_id: Identifier,
        request: T,
        fences: &F,
    ) -> CoreResult<(Identifier, T)> {
        if !self.registered.contains_key(&parent_id) {
            return Err(CoreError::InvalidId("alloc: unknown parent"));
        }

        let external_id = self
            .external_ids
            .alloc()
            .ok_or(CoreError::Exhausted("external id space exhausted"))?;

        if let Some(taken) = Self::try_reserve_from_free(&mut self.free, parent_id, &request) {
            self.commit_alloc(external_id, parent_id, taken.clone());
            return Ok((external_id, taken));
        }

        loop {
            let Some(front) = self.freed.front() else {
                break;
            };
            if !fences.has_retired(front.fence_id) {
                // The queue is FIFO; a stuck front blocks everything behind
                // it, same as the original. Surface unavailable rather than
                // spin -- the retry lives at the call site (spec.md §5).
                break;
            }
            let popped = self.freed.pop_front().expect("front just checked");

            if popped.parent_id == parent_id {
                if let Some((taken, remainder)) = popped.value.reserve(&request) {
                    if !remainder.is_empty() {
                        T::free_insert(self.free.entry(parent_id).or_default(), remainder);
                    }
                    self.commit_alloc(external_id, parent_id, taken.clone());
                    return Ok((external_id, taken));
                }
            }

            T::free_insert(self.free.entry(popped.parent_id).or_default(), popped.value);

            if let Some(taken) = Self::try_reserve_from_free(&mut self.free, parent_id, &request) {
                self.commit_alloc(external_id, parent_id, taken.clone());
                return Ok((external_id, taken));
            }
        }

        self.external_ids.release(external_id);
        Err(CoreError::ResourceUnavailable(
            "alloc: no extent satisfies the request",
        ))
    }

    /// Release a sub-reservation, tagging it with the fence that must
    /// retire before it can be reused (spec.md §4.2, `Free`).
    pub fn free<F: FenceSource>(
        &mut self,
        external_id: Identifier,
        fence_id: FenceId,
        fences: &F,
    ) -> CoreResult<()> {
        let obj = self
            .allocated
            .remove(&external_id)
            .ok_or(CoreError::InvalidId("free: unknown external id"))?;

        *self.capacity.get_mut(&obj.parent_id).expect("parent capacity") =
            self.capacity[&obj.parent_id].add(&obj.value);
        *self.load.get_mut(&obj.parent_id).expect("parent load") =
            self.load[&obj.parent_id].subtract(&obj.value);
        *self.refcount.get_mut(&obj.parent_id).expect("parent refcount") -= 1;

        self.freed.push_back(ResourceObject {
            parent_id: obj.parent_id,
            fence_id,
            value: obj.value,
        });

        if !self.defer_free {
            self.coalesce_freed(fences);
        }

        Ok(())
    }

    /// Drain the front of the deferred-free queue while its fences have
    /// retired, folding each into its parent's free-set (spec.md §4.2,
    /// `CoalesceFreed`). Returns the number of entries drained.
    pub fn coalesce_freed<F: FenceSource>(&mut self, fences: &F) -> usize {
        let mut drained = 0;
        while let Some(front) = self.freed.front() {
            if !fences.has_retired(front.fence_id) {
                break;
            }
            let obj = self.freed.pop_front().expect("front just checked");
            T::free_insert(self.free.entry(obj.parent_id).or_default(), obj.value);
            drained += 1;
        }
        drained
    }

    pub fn registered_value(&self, parent_id: Identifier) -> Option<&T> {
        self.registered.get(&parent_id)
    }

    pub fn capacity_of(&self, parent_id: Identifier) -> Option<&T> {
        self.capacity.get(&parent_id)
    }

    pub fn load_of(&self, parent_id: Identifier) -> Option<&T> {
        self.load.get(&parent_id)
    }

    pub fn refcount_of(&self, parent_id: Identifier) -> Option<u32> {
        self.refcount.get(&parent_id).copied()
    }

    pub fn allocated_value(&self, external_id: Identifier) -> Option<&T> {
        self.allocated.get(&external_id).map(|o| &o.value)
    }

    pub fn deferred_len(&self) -> usize {
        self.freed.len()
    }

    fn commit_alloc(&mut self, external_id: Identifier, parent_id: Identifier, taken: T) {
        *self.capacity.get_mut(&parent_id).expect("parent capacity") =
            self.capacity[&parent_id].subtract(&taken);
        *self.load.get_mut(&parent_id).expect("parent load") =
            self.load[&parent_id].add(&taken);
        *self.refcount.get_mut(&parent_id).expect("parent refcount") += 1;
        self.allocated.insert(
            external_id,
            ResourceObject {
                parent_id,
                fence_id: FENCE_NONE,
                value: taken,
            },
        );
    }

    /// Lowest free entry for `parent_id` that `request` fits into, erased
    /// from the free-set and reserved (spec.md §4.2 step 2). A linear scan
    /// rather than a single `lower_bound` hit: `best_fit_key` orders the
    /// list, but for `VMAccelDesc` a higher key does not imply pointwise
    /// fit, so the scan continues past a same-or-higher-keyed candidate
    /// that fails the pointwise check. For `Int`/`AllocRange` the ordering
    /// guarantees the first candidate at or above the key always fits, so
    /// this degrades to the single-hit lookup spec.md describes.
    fn try_reserve_from_free(
        free: &mut FxHashMap<Identifier, Vec<T>>,
        parent_id: Identifier,
        request: &T,
    ) -> Option<T> {
        let list = free.get_mut(&parent_id)?;
        let start = list.partition_point(|e| e.best_fit_key() < request.best_fit_key());
        for idx in start..list.len() {
            if let Some((taken, remainder)) = list[idx].reserve(request) {
                list.remove(idx);
                if !remainder.is_empty() {
                    T::free_insert(list, remainder);
                }
                return Some(taken);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmt::AllocRange;

    #[test]
    fn scalar_scenario_from_spec_section_8() {
        let mut alloc = Allocator::<u64>::new(4, 4);
        let parent = alloc.register(65535).unwrap();

        let (id0, taken) = alloc.alloc(parent, 32768, &AlwaysRetired).unwrap();
        assert_eq!(id0, 0);
        assert_eq!(taken, 32768);

        assert!(matches!(
            alloc.alloc(parent, 32768, &AlwaysRetired),
            Err(CoreError::ResourceUnavailable(_))
        ));

        let (id1, _) = alloc.alloc(parent, 16384, &AlwaysRetired).unwrap();

        alloc.free(id0, vmt::FENCE_ALREADY_RETIRED, &AlwaysRetired).unwrap();
        let (id2, taken2) = alloc.alloc(parent, 32767, &AlwaysRetired).unwrap();
        assert_eq!(taken2, 32767);

        alloc.free(id1, vmt::FENCE_ALREADY_RETIRED, &AlwaysRetired).unwrap();
        alloc.free(id2, vmt::FENCE_ALREADY_RETIRED, &AlwaysRetired).unwrap();
        assert_eq!(alloc.refcount_of(parent), Some(0));
        alloc.unregister(parent, &AlwaysRetired).unwrap();
    }

    #[test]
    fn byte_range_scenario_from_spec_section_8() {
        let mut alloc = Allocator::<AllocRange>::new(4, 4);
        let parent = alloc.register(AllocRange::whole(65535)).unwrap();

        let (first, taken1) = alloc
            .alloc(
                parent,
                AllocRange {
                    size: 32768,
                    begin: 0,
                    end: 0,
                },
                &AlwaysRetired,
            )
            .unwrap();
        assert_eq!(taken1, AllocRange { size: 32768, begin: 0, end: 32767 });

        let (_second, taken2) = alloc
            .alloc(
                parent,
                AllocRange {
                    size: 16384,
                    begin: 0,
                    end: 0,
                },
                &AlwaysRetired,
            )
            .unwrap();
        assert_eq!(
            taken2,
            AllocRange { size: 16384, begin: 32768, end: 49151 }
        );

        alloc.free(first, vmt::FENCE_ALREADY_RETIRED, &AlwaysRetired).unwrap();
        alloc.coalesce_freed(&AlwaysRetired);

        let (_, taken3) = alloc
            .alloc(
                parent,
                AllocRange {
                    size: 16384,
                    begin: 0,
                    end: 0,
                },
                &AlwaysRetired,
            )
            .unwrap();
        assert_eq!(taken3, AllocRange { size: 16384, begin: 0, end: 16383 });
    }

    #[test]
    fn exhausting_external_ids_does_not_leak_refcount() {
        let mut alloc = Allocator::<u64>::new(4, 1);
        let parent = alloc.register(2048).unwrap();
        alloc.alloc(parent, 1, &AlwaysRetired).unwrap();
        assert!(matches!(
            alloc.alloc(parent, 1, &AlwaysRetired),
            Err(CoreError::Exhausted(_))
        ));
        assert_eq!(alloc.refcount_of(parent), Some(1));
    }

    #[test]
    fn unregister_with_nonzero_refcount_fails_and_preserves_state() {
        let mut alloc = Allocator::<u64>::new(4, 4);
        let parent = alloc.register(100).unwrap();
        alloc.alloc(parent, 10, &AlwaysRetired).unwrap();
        assert!(matches!(
            alloc.unregister(parent, &AlwaysRetired),
            Err(CoreError::Fail(_))
        ));
        assert_eq!(alloc.refcount_of(parent), Some(1));
    }

    #[test]
    fn many_single_unit_parents_then_exhaustion() {
        // Ground truth: examples/original_source/tests/vmaccel_allocator_int_test.cpp
        // constructs `VMAccelAllocator<Int, IntCmp>(2048)` over the external
        // id space, with the parent registered at a capacity (65535) that
        // never runs out -- the 2049th `Alloc` exhausts ids, not capacity.
        let mut alloc = Allocator::<u64>::new(4, 2048);
        let parent = alloc.register(65535).unwrap();
        for _ in 0..2048 {
            alloc.alloc(parent, 1, &AlwaysRetired).unwrap();
        }
        assert!(matches!(
            alloc.alloc(parent, 1, &AlwaysRetired),
            Err(CoreError::Exhausted(_))
        ));
    }
}
