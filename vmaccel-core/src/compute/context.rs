use rustc_hash::FxHashMap;
use vmt::Identifier;

use crate::error::{CoreError, CoreResult};
use crate::identifier_db::IdentifierDB;

/// A cached, lazily-built kernel variant (spec.md §3, "Kernel variant").
#[derive(Debug, Clone)]
pub struct KernelVariant {
    pub kernel_id: Identifier,
    pub language: String,
    pub entry_point: String,
}

/// A sampler's filter/address mode, deep-copied and carrying no ordering
/// semantics of its own (spec.md §6 lists `sampler_alloc`/`sampler_destroy`
/// in the wire procedure set without further elaboration in §4; modeled
/// here the same way the kernel-variant cache is: a per-context table keyed
/// by a freshly issued id).
#[derive(Debug, Clone, Copy)]
pub struct SamplerState {
    pub filter_mode: u32,
    pub address_mode: u32,
}

/// Per-client persistent state on a chosen accelerator (spec.md §3,
/// "ComputeContext"). Owns the surface-residency bitset and the
/// `(language, entry-point) -> kernel` cache; queue/device handles and the
/// backend client connection live one level up in [`super::ComputeEngine`],
/// which is what actually owns a `dyn Backend`.
#[derive(Debug)]
pub struct ComputeContext {
    pub id: Identifier,
    pub accelerator_mask: u32,
    /// Bit `surface_id` set iff this context has the surface resident on the
    /// backend (spec.md §4.3, `alloc_surface`/`destroy_surface`).
    residency: IdentifierDB,
    kernel_cache: FxHashMap<(String, String), KernelVariant>,
    kernel_ids: IdentifierDB,
    /// Queue identifiers handed out by `queue_alloc` (spec.md §6). This
    /// engine models one backend queue per context (see
    /// `ComputeEngine::dispatch`'s doc comment), so these ids are pure
    /// bookkeeping: `queue_flush`/`queue_destroy` accept any id this table
    /// issued and always act on the context's single underlying queue.
    queue_ids: IdentifierDB,
    sampler_ids: IdentifierDB,
    samplers: FxHashMap<Identifier, SamplerState>,
}

impl ComputeContext {
    pub fn new(id: Identifier, accelerator_mask: u32, max_surfaces: u32, max_kernels: u32) -> Self {
        Self {
            id,
            accelerator_mask,
            residency: IdentifierDB::new(max_surfaces),
            kernel_cache: FxHashMap::default(),
            kernel_ids: IdentifierDB::new(max_kernels),
            queue_ids: IdentifierDB::new(max_kernels),
            sampler_ids: IdentifierDB::new(max_kernels),
            samplers: FxHashMap::default(),
        }
    }

    pub fn is_resident(&self, surface_id: Identifier) -> bool {
        self.residency.active(surface_id)
    }

    /// Mark `surface_id` resident. Idempotent: calling this twice for the
    /// same surface is equivalent to calling it once (spec.md §8, round-trip
    /// law "`alloc_surface(ctx, s); alloc_surface(ctx, s)` is equivalent to
    /// one call").
    pub fn mark_resident(&mut self, surface_id: Identifier) {
        self.residency.acquire(surface_id);
    }

    pub fn clear_resident(&mut self, surface_id: Identifier) {
        if self.residency.active(surface_id) {
            self.residency.release(surface_id);
        }
    }

    /// Every surface id currently resident on this context, for
    /// context-destruction teardown (spec.md §3, "Context" lifecycle).
    pub fn resident_surfaces(&self) -> Vec<Identifier> {
        (0..self.residency.size())
            .filter(|&id| self.residency.active(id))
            .collect()
    }

    /// Look up or lazily build the `(language, entry_point)` kernel variant
    /// (spec.md §3: "lazily built on first dispatch").
    pub fn kernel_variant(&mut self, language: &str, entry_point: &str) -> CoreResult<&KernelVariant> {
        let key = (language.to_owned(), entry_point.to_owned());
        if !self.kernel_cache.contains_key(&key) {
            let kernel_id = self
                .kernel_ids
                .alloc()
                .ok_or(CoreError::Exhausted("kernel id space exhausted"))?;
            self.kernel_cache.insert(
                key.clone(),
                KernelVariant {
                    kernel_id,
                    language: language.to_owned(),
                    entry_point: entry_point.to_owned(),
                },
            );
        }
        Ok(self.kernel_cache.get(&key).expect("just inserted"))
    }

    /// Explicitly warm a kernel variant, for the standalone `kernel_alloc`
    /// wire procedure (spec.md §6) -- identical to what `dispatch` does on a
    /// cache miss, exposed so a client can pre-build ahead of time.
    pub fn kernel_alloc(&mut self, language: &str, entry_point: &str) -> CoreResult<Identifier> {
        Ok(self.kernel_variant(language, entry_point)?.kernel_id)
    }

    /// Evict a cached kernel variant by id and release its slot in the
    /// per-context kernel id space (spec.md §6, `kernel_destroy`).
    pub fn kernel_destroy(&mut self, kernel_id: Identifier) -> CoreResult<()> {
        let key = self
            .kernel_cache
            .iter()
            .find(|(_, v)| v.kernel_id == kernel_id)
            .map(|(k, _)| k.clone())
            .ok_or(CoreError::InvalidId("kernel_destroy: unknown kernel id"))?;
        self.kernel_cache.remove(&key);
        self.kernel_ids.release(kernel_id);
        Ok(())
    }

    /// Issue a bookkeeping queue id (spec.md §6, `queue_alloc`).
    pub fn queue_alloc(&mut self) -> CoreResult<Identifier> {
        self.queue_ids
            .alloc()
            .ok_or(CoreError::Exhausted("queue id space exhausted"))
    }

    pub fn queue_destroy(&mut self, queue_id: Identifier) -> CoreResult<()> {
        if !self.queue_ids.active(queue_id) {
            return Err(CoreError::InvalidId("queue_destroy: unknown queue id"));
        }
        self.queue_ids.release(queue_id);
        Ok(())
    }

    pub fn has_queue(&self, queue_id: Identifier) -> bool {
        self.queue_ids.active(queue_id)
    }

    pub fn sampler_alloc(&mut self, filter_mode: u32, address_mode: u32) -> CoreResult<Identifier> {
        let id = self
            .sampler_ids
            .alloc()
            .ok_or(CoreError::Exhausted("sampler id space exhausted"))?;
        self.samplers.insert(id, SamplerState { filter_mode, address_mode });
        Ok(id)
    }

    pub fn sampler_destroy(&mut self, sampler_id: Identifier) -> CoreResult<()> {
        if self.samplers.remove(&sampler_id).is_none() {
            return Err(CoreError::InvalidId("sampler_destroy: unknown sampler id"));
        }
        self.sampler_ids.release(sampler_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_variant_is_cached_and_destroyable() {
        let mut ctx = ComputeContext::new(0, 0xFFFF_FFFF, 8, 8);
        let id_a = ctx.kernel_alloc("opencl-c", "double").unwrap();
        let id_b = ctx.kernel_alloc("opencl-c", "double").unwrap();
        assert_eq!(id_a, id_b);
        ctx.kernel_destroy(id_a).unwrap();
        assert!(matches!(ctx.kernel_destroy(id_a), Err(CoreError::InvalidId(_))));
        let id_c = ctx.kernel_alloc("opencl-c", "double").unwrap();
        assert_eq!(id_c, id_a, "released kernel id is reused");
    }

    #[test]
    fn queue_and_sampler_ids_round_trip() {
        let mut ctx = ComputeContext::new(0, 0xFFFF_FFFF, 8, 8);
        let queue = ctx.queue_alloc().unwrap();
        assert!(ctx.has_queue(queue));
        ctx.queue_destroy(queue).unwrap();
        assert!(!ctx.has_queue(queue));
        assert!(matches!(ctx.queue_destroy(queue), Err(CoreError::InvalidId(_))));

        let sampler = ctx.sampler_alloc(1, 2).unwrap();
        ctx.sampler_destroy(sampler).unwrap();
        assert!(matches!(ctx.sampler_destroy(sampler), Err(CoreError::InvalidId(_))));
    }
}
