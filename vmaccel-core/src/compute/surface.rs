use rustc_hash::FxHashMap;
use vmt::{Identifier, SurfaceDesc};

use crate::identifier_db::IdentifierDB;

/// Per-(surface, device-instance) state (spec.md §3, `Surface.per_instance`).
#[derive(Debug, Clone, Default)]
pub struct PerInstanceState {
    pub device_handle: u64,
    pub device_generation: u32,
    pub mapping_refcount: u32,
}

/// A named memory region allocatable on an accelerator, plus the
/// generation/consistency bookkeeping that keeps per-context device copies
/// honest relative to `backing` (spec.md §3, §4.3).
#[derive(Debug)]
pub struct Surface {
    pub id: Identifier,
    pub parent_accel_id: Identifier,
    pub desc: SurfaceDesc,
    /// Monotonically increases on every `upload` (spec.md §4.3). Never on
    /// `download`, `fill`, or `copy`.
    pub generation: u32,
    pub backing: Vec<u8>,
    /// Bit `ctx_id` sit iff the server-side copy bound to that context is
    /// believed current relative to `backing` (spec.md §3, invariant (b)).
    /// Reuses `IdentifierDB` per spec.md §2's "C1 reused as per-context
    /// bitset" rather than a second bespoke bitset type.
    consistency: IdentifierDB,
    instances: FxHashMap<u32, PerInstanceState>,
}

impl Surface {
    pub fn new(id: Identifier, parent_accel_id: Identifier, desc: SurfaceDesc, max_contexts: u32) -> Self {
        let backing = vec![0u8; desc.backing_len()];
        Self {
            id,
            parent_accel_id,
            desc,
            generation: 0,
            backing,
            consistency: IdentifierDB::new(max_contexts),
            instances: FxHashMap::default(),
        }
    }

    pub fn instance(&self, instance: u32) -> Option<&PerInstanceState> {
        self.instances.get(&instance)
    }

    pub fn instance_mut(&mut self, instance: u32) -> &mut PerInstanceState {
        self.instances.entry(instance).or_default()
    }

    pub fn is_consistent(&self, ctx_id: Identifier) -> bool {
        self.consistency.active(ctx_id)
    }

    /// Idempotent set: already-consistent is not an error (spec.md §4.1,
    /// `acquire` is "idempotent failure").
    pub fn mark_consistent(&mut self, ctx_id: Identifier) {
        self.consistency.acquire(ctx_id);
    }

    /// Idempotent clear: clearing an already-inconsistent context is a no-op,
    /// unlike `IdentifierDB::release`'s hard precondition, because "mutation
    /// clears the bit" (spec.md §3 invariant (b)) is not itself an
    /// ID-lifecycle event.
    pub fn clear_consistent(&mut self, ctx_id: Identifier) {
        if self.consistency.active(ctx_id) {
            self.consistency.release(ctx_id);
        }
    }

    /// Clear every context's consistency bit except `ctx_id` (spec.md §4.3:
    /// uploading from one context leaves every other context's device-side
    /// copy stale relative to the new `backing`).
    pub fn clear_consistent_except(&mut self, ctx_id: Identifier) {
        for other in 0..self.consistency.size() {
            if other != ctx_id {
                self.clear_consistent(other);
            }
        }
    }
}
