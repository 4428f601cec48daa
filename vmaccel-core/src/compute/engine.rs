use std::sync::Arc;

use rustc_hash::FxHashMap;
use vmt::{BindFlags, Identifier, SurfaceDesc, SurfaceUsage, WorkTopology};

use hal::{Backend, DispatchBinding, MapFlags, Region, UnmapFlags};

use crate::error::{CoreError, CoreResult};
use crate::identifier_db::IdentifierDB;

use super::context::ComputeContext;
use super::surface::Surface;

/// Which of §4.3's two upload/download transfer shapes a surface uses,
/// selected by `desc.pool` and backend capability. Both still move bytes
/// through the same `Backend::image_upload`/`image_download` calls in this
/// implementation (see [`ComputeEngine::upload`]): the source's raw
/// `memcpy`-through-a-mapped-pointer has no safe equivalent across a trait
/// object boundary, so the map-based mode is represented as "obtain
/// authorization via `map`/`unmap`, transfer via the byte-oriented call"
/// rather than an actual pointer write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadMode {
    MapBased,
    DirectImage,
}

fn upload_mode(pool: vmt::SurfacePool) -> UploadMode {
    match pool {
        vmt::SurfacePool::System => UploadMode::MapBased,
        vmt::SurfacePool::Accelerator | vmt::SurfacePool::Auto => UploadMode::DirectImage,
    }
}

/// Owns the surface and context tables and the single backend connection a
/// compute server binds to (spec.md §3 "ComputeContext", §4.3). This is the
/// orchestration layer `vmaccel-core::manager::Manager` wires up per
/// accelerator; it never itself crosses the network -- that's `vmaccel-rpc`.
pub struct ComputeEngine {
    backend: Arc<dyn Backend>,
    surfaces: FxHashMap<Identifier, Surface>,
    surface_ids: IdentifierDB,
    contexts: FxHashMap<Identifier, ComputeContext>,
    context_ids: IdentifierDB,
    max_contexts: u32,
    max_kernels: u32,
}

impl ComputeEngine {
    pub fn new(backend: Arc<dyn Backend>, max_surfaces: u32, max_contexts: u32, max_kernels: u32) -> Self {
        Self {
            backend,
            surfaces: FxHashMap::default(),
            surface_ids: IdentifierDB::new(max_surfaces),
            contexts: FxHashMap::default(),
            context_ids: IdentifierDB::new(max_contexts),
            max_contexts,
            max_kernels,
        }
    }

    pub fn context_alloc(&mut self, accelerator_mask: u32) -> CoreResult<Identifier> {
        let id = self
            .context_ids
            .alloc()
            .ok_or(CoreError::Exhausted("context id space exhausted"))?;
        let max_surfaces = self.surface_ids.size();
        self.contexts.insert(
            id,
            ComputeContext::new(id, accelerator_mask, max_surfaces, self.max_kernels),
        );
        Ok(id)
    }

    /// Tear down a context, destroying every surface still resident on it
    /// (spec.md §3, "Context" lifecycle).
    pub fn context_destroy(&mut self, ctx_id: Identifier) -> CoreResult<()> {
        let ctx = self
            .contexts
            .get(&ctx_id)
            .ok_or(CoreError::InvalidId("context_destroy: unknown context"))?;
        let resident = ctx.resident_surfaces();
        for surface_id in resident {
            // Instance index is assumed equal to ctx id for the single
            // queue-per-context shape this engine models (see
            // `ComputeEngine::dispatch`'s doc comment for the same
            // simplification).
            let _ = self.destroy_surface(ctx_id, surface_id, ctx_id);
        }
        self.contexts.remove(&ctx_id);
        self.context_ids.release(ctx_id);
        Ok(())
    }

    pub fn surface_create(&mut self, parent_accel_id: Identifier, desc: SurfaceDesc) -> CoreResult<Identifier> {
        let id = self
            .surface_ids
            .alloc()
            .ok_or(CoreError::Exhausted("surface id space exhausted"))?;
        self.surfaces
            .insert(id, Surface::new(id, parent_accel_id, desc, self.max_contexts));
        Ok(id)
    }

    /// Idempotent: a surface already resident on `ctx_id` is a no-op success
    /// (spec.md §4.3, "Residency").
    pub fn alloc_surface(&mut self, ctx_id: Identifier, surface_id: Identifier, instance: u32) -> CoreResult<()> {
        let ctx = self
            .contexts
            .get_mut(&ctx_id)
            .ok_or(CoreError::InvalidId("alloc_surface: unknown context"))?;
        if ctx.is_resident(surface_id) {
            return Ok(());
        }
        let surface = self
            .surfaces
            .get_mut(&surface_id)
            .ok_or(CoreError::InvalidId("alloc_surface: unknown surface"))?;
        let handle = self
            .backend
            .surface_alloc(surface_id, instance, &surface.desc)
            .map_err(CoreError::Backend)?;
        surface.instance_mut(instance).device_handle = handle;
        ctx.mark_resident(surface_id);
        Ok(())
    }

    /// Idempotent: destroying a non-resident surface on this context is a
    /// no-op success.
    ///
    /// Destroying a surface with an open mapping is a precondition
    /// violation (spec.md §7); since this is reachable from untrusted RPC
    /// input rather than only internal callers, it is surfaced as a typed
    /// `Fail` rather than a panic that would take the whole server down.
    pub fn destroy_surface(&mut self, ctx_id: Identifier, surface_id: Identifier, instance: u32) -> CoreResult<()> {
        let ctx = self
            .contexts
            .get_mut(&ctx_id)
            .ok_or(CoreError::InvalidId("destroy_surface: unknown context"))?;
        if !ctx.is_resident(surface_id) {
            return Ok(());
        }
        if let Some(surface) = self.surfaces.get(&surface_id) {
            if let Some(inst) = surface.instance(instance) {
                if inst.mapping_refcount > 0 {
                    return Err(CoreError::Fail(
                        "destroy_surface: surface instance has an open mapping",
                    ));
                }
                self.backend
                    .surface_destroy(surface_id, instance, inst.device_handle)
                    .map_err(CoreError::Backend)?;
            }
        }
        ctx.clear_resident(surface_id);
        Ok(())
    }

    /// Explicit map for direct host access, independent of `upload`/
    /// `download` (spec.md §6, `surface_map`). Nested maps from the same
    /// context are permitted; `mapping_refcount` tracks how many are
    /// outstanding (spec.md §5, "Per-surface locking": "Mapping ref-count
    /// permits nested `map` calls").
    pub fn surface_map(
        &mut self,
        surface_id: Identifier,
        instance: u32,
        region: Region,
        flags: MapFlags,
    ) -> CoreResult<hal::MappedRegion> {
        let surface = self
            .surfaces
            .get_mut(&surface_id)
            .ok_or(CoreError::InvalidId("surface_map: unknown surface"))?;
        let handle = surface.instance(instance).map(|i| i.device_handle).unwrap_or(0);
        let mapped = self
            .backend
            .map(surface_id, instance, handle, region, flags)
            .map_err(CoreError::Backend)?;
        surface.instance_mut(instance).mapping_refcount += 1;
        Ok(mapped)
    }

    /// Symmetric unmap; decrements the same ref-count `surface_map`
    /// incremented. Unmapping a surface instance with no outstanding maps
    /// is a precondition violation the caller should not be able to reach
    /// through normal use, so it is rejected rather than silently
    /// underflowing the count.
    pub fn surface_unmap(
        &mut self,
        mapped: hal::MappedRegion,
        flags: UnmapFlags,
    ) -> CoreResult<()> {
        let surface = self
            .surfaces
            .get_mut(&mapped.surface)
            .ok_or(CoreError::InvalidId("surface_unmap: unknown surface"))?;
        let inst = surface.instance_mut(mapped.instance);
        if inst.mapping_refcount == 0 {
            return Err(CoreError::Fail("surface_unmap: no outstanding mapping"));
        }
        self.backend.unmap(mapped, flags).map_err(CoreError::Backend)?;
        surface.instance_mut(mapped.instance).mapping_refcount -= 1;
        Ok(())
    }

    pub fn queue_alloc(&mut self, ctx_id: Identifier) -> CoreResult<Identifier> {
        self.contexts
            .get_mut(&ctx_id)
            .ok_or(CoreError::InvalidId("queue_alloc: unknown context"))?
            .queue_alloc()
    }

    pub fn queue_destroy(&mut self, ctx_id: Identifier, queue_id: Identifier) -> CoreResult<()> {
        self.contexts
            .get_mut(&ctx_id)
            .ok_or(CoreError::InvalidId("queue_destroy: unknown context"))?
            .queue_destroy(queue_id)
    }

    /// Barrier on `queue_id`'s queue (spec.md §6, `queue_flush`). Rejects an
    /// id `queue_alloc` never issued for this context rather than silently
    /// flushing the wrong thing.
    pub fn queue_flush(&mut self, ctx_id: Identifier, queue_id: Identifier) -> CoreResult<()> {
        let ctx = self
            .contexts
            .get(&ctx_id)
            .ok_or(CoreError::InvalidId("queue_flush: unknown context"))?;
        if !ctx.has_queue(queue_id) {
            return Err(CoreError::InvalidId("queue_flush: unknown queue id"));
        }
        self.flush(ctx_id)
    }

    pub fn sampler_alloc(&mut self, ctx_id: Identifier, filter_mode: u32, address_mode: u32) -> CoreResult<Identifier> {
        self.contexts
            .get_mut(&ctx_id)
            .ok_or(CoreError::InvalidId("sampler_alloc: unknown context"))?
            .sampler_alloc(filter_mode, address_mode)
    }

    pub fn sampler_destroy(&mut self, ctx_id: Identifier, sampler_id: Identifier) -> CoreResult<()> {
        self.contexts
            .get_mut(&ctx_id)
            .ok_or(CoreError::InvalidId("sampler_destroy: unknown context"))?
            .sampler_destroy(sampler_id)
    }

    pub fn kernel_destroy(&mut self, ctx_id: Identifier, kernel_id: Identifier) -> CoreResult<()> {
        self.contexts
            .get_mut(&ctx_id)
            .ok_or(CoreError::InvalidId("kernel_destroy: unknown context"))?
            .kernel_destroy(kernel_id)
    }

    /// Write `data` into `surface_id`'s backing store and transfer it to
    /// `instance`'s device memory, then advance the generation protocol
    /// (spec.md §4.3, "Upload path" + "Generation protocol").
    pub fn upload(
        &mut self,
        ctx_id: Identifier,
        surface_id: Identifier,
        instance: u32,
        region: Region,
        data: &[u8],
    ) -> CoreResult<()> {
        let surface = self
            .surfaces
            .get_mut(&surface_id)
            .ok_or(CoreError::InvalidId("upload: unknown surface"))?;
        if region.len != data.len() || region.offset + region.len > surface.backing.len() {
            return Err(CoreError::SemanticError("upload: region does not match payload"));
        }
        surface.backing[region.offset..region.offset + region.len].copy_from_slice(data);
        surface.generation = surface.generation.wrapping_add(1);

        let handle = surface.instance(instance).map(|i| i.device_handle).unwrap_or(0);
        match upload_mode(surface.desc.pool) {
            UploadMode::MapBased => {
                let mapped = self
                    .backend
                    .map(surface_id, instance, handle, region, MapFlags::READ | MapFlags::WRITE | MapFlags::ASYNC)
                    .map_err(CoreError::Backend)?;
                self.backend
                    .image_upload(surface_id, instance, handle, region, data)
                    .map_err(CoreError::Backend)?;
                self.backend
                    .unmap(mapped, UnmapFlags::NO_FREE_PTR)
                    .map_err(CoreError::Backend)?;
            }
            UploadMode::DirectImage => {
                self.backend
                    .image_upload(surface_id, instance, handle, region, data)
                    .map_err(CoreError::Backend)?;
            }
        }

        surface.instance_mut(instance).device_generation = surface.generation;
        surface.mark_consistent(ctx_id);
        surface.clear_consistent_except(ctx_id);
        Ok(())
    }

    /// Read back `region` from `instance`'s device memory into `out`,
    /// skipping the transfer entirely for a read-only surface whose client
    /// copy cannot have diverged (spec.md §4.3, "Download path").
    pub fn download(
        &mut self,
        surface_id: Identifier,
        instance: u32,
        region: Region,
        out: &mut [u8],
        force: bool,
    ) -> CoreResult<()> {
        let surface = self
            .surfaces
            .get_mut(&surface_id)
            .ok_or(CoreError::InvalidId("download: unknown surface"))?;
        if region.len != out.len() || region.offset + region.len > surface.backing.len() {
            return Err(CoreError::SemanticError("download: region does not match output"));
        }
        if surface.desc.usage == SurfaceUsage::ReadOnly && !force {
            out.copy_from_slice(&surface.backing[region.offset..region.offset + region.len]);
            return Ok(());
        }
        let handle = surface.instance(instance).map(|i| i.device_handle).unwrap_or(0);
        self.backend
            .image_download(surface_id, instance, handle, region, out)
            .map_err(CoreError::Backend)?;
        self.backend.flush_queue(instance).map_err(CoreError::Backend)?;
        surface.backing[region.offset..region.offset + region.len].copy_from_slice(out);
        Ok(())
    }

    pub fn fill(&mut self, ctx_id: Identifier, surface_id: Identifier, instance: u32, region: Region, pattern: [u32; 4]) -> CoreResult<()> {
        let surface = self
            .surfaces
            .get_mut(&surface_id)
            .ok_or(CoreError::InvalidId("fill: unknown surface"))?;
        let handle = surface.instance(instance).map(|i| i.device_handle).unwrap_or(0);
        self.backend
            .fill(surface_id, instance, handle, region, pattern)
            .map_err(CoreError::Backend)?;
        surface.clear_consistent(ctx_id);
        Ok(())
    }

    /// Both surfaces must belong to the same context (spec.md §5,
    /// "Ordering guarantees": "Surface copies require both surfaces on the
    /// same context").
    #[allow(clippy::too_many_arguments)]
    pub fn copy(
        &mut self,
        ctx_id: Identifier,
        src_surface: Identifier,
        src_instance: u32,
        src_region: Region,
        dst_surface: Identifier,
        dst_instance: u32,
        dst_region: Region,
    ) -> CoreResult<()> {
        let ctx = self
            .contexts
            .get(&ctx_id)
            .ok_or(CoreError::InvalidId("copy: unknown context"))?;
        if !ctx.is_resident(src_surface) || !ctx.is_resident(dst_surface) {
            return Err(CoreError::SemanticError("copy: both surfaces must be resident on the same context"));
        }
        let src_handle = self
            .surfaces
            .get(&src_surface)
            .and_then(|s| s.instance(src_instance))
            .map(|i| i.device_handle)
            .unwrap_or(0);
        let dst_handle = self
            .surfaces
            .get(&dst_surface)
            .and_then(|s| s.instance(dst_instance))
            .map(|i| i.device_handle)
            .unwrap_or(0);
        self.backend
            .copy(src_surface, src_instance, src_handle, src_region, dst_surface, dst_instance, dst_handle, dst_region)
            .map_err(CoreError::Backend)?;
        if let Some(dst) = self.surfaces.get_mut(&dst_surface) {
            dst.clear_consistent(ctx_id);
        }
        Ok(())
    }

    /// Compare the bound surfaces' device generation against the surface's
    /// client generation before delegating to the backend (spec.md §4.3,
    /// "Dispatch reads the server generation...").
    ///
    /// Instance index is assumed equal to `ctx_id` throughout this engine: a
    /// `ComputeContext` here owns exactly one sub-device queue, so "per
    /// sub-device instance" and "per context" coincide. A multi-queue
    /// context would need a real instance parameter threaded through
    /// residency and dispatch bindings instead of this identification.
    pub fn dispatch(
        &mut self,
        ctx_id: Identifier,
        language: &str,
        entry_point: &str,
        source: &[u8],
        args: &[DispatchBinding],
        topology: &WorkTopology,
    ) -> CoreResult<()> {
        for binding in args {
            let surface = self
                .surfaces
                .get(&binding.surface)
                .ok_or(CoreError::InvalidId("dispatch: unknown bound surface"))?;
            let server_gen = surface.instance(binding.instance).map(|i| i.device_generation).unwrap_or(0);
            if server_gen < surface.generation {
                return Err(CoreError::ResourceUnavailable(
                    "dispatch: bound surface's device copy is behind the client generation",
                ));
            }
            if server_gen > surface.generation {
                return Err(CoreError::SemanticError(
                    "dispatch: bound surface's device generation is ahead of the client's",
                ));
            }
        }

        {
            let ctx = self
                .contexts
                .get_mut(&ctx_id)
                .ok_or(CoreError::InvalidId("dispatch: unknown context"))?;
            ctx.kernel_variant(language, entry_point)?;
        }

        self.backend
            .dispatch(ctx_id, language, entry_point, source, args, topology)
            .map_err(CoreError::Backend)?;

        for binding in args {
            if let Some(surface) = self.surfaces.get_mut(&binding.surface) {
                if surface.desc.usage != SurfaceUsage::ReadOnly
                    && surface.desc.bind_flags.contains(BindFlags::KERNEL_ARG)
                {
                    surface.clear_consistent(ctx_id);
                }
            }
        }
        Ok(())
    }

    pub fn surface(&self, surface_id: Identifier) -> Option<&Surface> {
        self.surfaces.get(&surface_id)
    }

    pub fn context(&self, ctx_id: Identifier) -> Option<&ComputeContext> {
        self.contexts.get(&ctx_id)
    }

    /// Barrier on a context's queue (spec.md §6, `queue_flush`). Instance is
    /// `ctx_id` under this engine's one-queue-per-context simplification.
    pub fn flush(&self, ctx_id: Identifier) -> CoreResult<()> {
        self.backend.flush_queue(ctx_id).map_err(CoreError::Backend)
    }

    /// Look up or lazily build a kernel variant directly, for the wire
    /// `kernel_alloc` procedure (spec.md §6) -- `dispatch` does this
    /// implicitly on every call; this exposes the same cache as a
    /// standalone operation so a client can warm it ahead of time.
    pub fn kernel_alloc(&mut self, ctx_id: Identifier, language: &str, entry_point: &str) -> CoreResult<Identifier> {
        let ctx = self
            .contexts
            .get_mut(&ctx_id)
            .ok_or(CoreError::InvalidId("kernel_alloc: unknown context"))?;
        Ok(ctx.kernel_variant(language, entry_point)?.kernel_id)
    }
}
